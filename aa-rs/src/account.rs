use crate::entrypoint::EntryPointDef;
use crate::error::{AaError, Result};
use crate::signer::{wrap_erc6492, SigningScheme, SmartAccountSigner, TypedDataEnvelope};
use crate::types::{Call, FactoryCall, UserOperationCallData};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ethers::abi::{Abi, AbiParser, Token};
use ethers::prelude::Contract;
use ethers::providers::Middleware;
use ethers::types::{Address, Bytes, H256, U256};
use std::sync::Arc;

/// Placeholder signature of the right shape for gas estimation.
pub const SIMPLE_ACCOUNT_DUMMY_SIGNATURE: &str = "0xfffffffffffffffffffffffffffffff0000000000000000000000000000000007aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa1c";

const SIMPLE_ACCOUNT_ABI: &[&str] = &[
    "function execute(address dest, uint256 value, bytes func)",
    "function executeBatch(address[] dest, bytes[] func)",
];

const SIMPLE_ACCOUNT_FACTORY_ABI: &[&str] = &[
    "function createAccount(address owner, uint256 salt) returns (address)",
    "function getAddress(address owner, uint256 salt) view returns (address)",
];

/// A smart contract account the pipeline can build, sign and submit for.
#[async_trait]
pub trait SmartAccount: Send + Sync {
    fn address(&self) -> Address;

    fn entry_point(&self) -> &EntryPointDef;

    /// Signature of the right length and shape for simulation.
    fn dummy_signature(&self) -> Bytes;

    /// Current EntryPoint nonce for `key`.
    async fn nonce(&self, key: U256) -> Result<U256>;

    async fn is_deployed(&self) -> Result<bool>;

    /// Factory call that deploys this account.
    fn factory_call(&self) -> Result<FactoryCall>;

    fn encode_calls(&self, calls: &UserOperationCallData) -> Result<Bytes>;

    async fn sign_user_operation_hash(&self, hash: H256) -> Result<Bytes>;

    async fn sign_message(&self, message: &[u8]) -> Result<Bytes>;

    /// Deployment data for a user operation, `None` once the account exists.
    async fn init_factory(&self) -> Result<Option<FactoryCall>> {
        if self.is_deployed().await? {
            return Ok(None);
        }
        Ok(Some(self.factory_call()?))
    }

    /// Like [`SmartAccount::sign_message`], wrapped with ERC-6492 while the account is counterfactual.
    async fn sign_message_with_6492(&self, message: &[u8]) -> Result<Bytes> {
        let signature = self.sign_message(message).await?;
        match self.init_factory().await? {
            None => Ok(signature),
            Some(factory) => Ok(wrap_erc6492(factory.factory, &factory.data, &signature)),
        }
    }
}

/// eth-infinitism `SimpleAccount` deployed by `SimpleAccountFactory.createAccount(owner, salt)`.
pub struct SimpleAccount<M> {
    client: Arc<M>,
    owner: Arc<dyn SmartAccountSigner>,
    entry_point: EntryPointDef,
    factory: Address,
    salt: U256,
    address: Address,
    scheme: SigningScheme,
}

impl<M: Middleware + 'static> SimpleAccount<M> {
    /// Resolves the counterfactual address through `factory.getAddress(owner, salt)`.
    pub async fn connect(
        client: Arc<M>,
        owner: Arc<dyn SmartAccountSigner>,
        entry_point: EntryPointDef,
        factory: Address,
        salt: U256,
    ) -> Result<Self> {
        let abi = factory_abi()?;
        let factory_c = Contract::new(factory, abi, client.clone());
        let address: Address = factory_c
            .method("getAddress", (owner.address(), salt))
            .context("failed to encode getAddress")?
            .call()
            .await
            .context("factory.getAddress failed")?;

        Ok(Self::at_address(
            client,
            owner,
            entry_point,
            factory,
            salt,
            address,
        ))
    }

    /// For an account whose address is already known.
    pub fn at_address(
        client: Arc<M>,
        owner: Arc<dyn SmartAccountSigner>,
        entry_point: EntryPointDef,
        factory: Address,
        salt: U256,
        address: Address,
    ) -> Self {
        Self {
            client,
            owner,
            entry_point,
            factory,
            salt,
            address,
            scheme: SigningScheme::RawMessage,
        }
    }

    pub fn with_signing_scheme(mut self, scheme: SigningScheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Signs under the EIP-712 domain the deployed account reports.
    pub async fn with_account_typed_data(self, primary_type: &str) -> Result<Self> {
        let envelope =
            TypedDataEnvelope::for_account(self.client.clone(), self.address, primary_type).await?;
        Ok(self.with_signing_scheme(SigningScheme::TypedData(envelope)))
    }

    pub fn owner(&self) -> Address {
        self.owner.address()
    }
}

#[async_trait]
impl<M: Middleware + 'static> SmartAccount for SimpleAccount<M> {
    fn address(&self) -> Address {
        self.address
    }

    fn entry_point(&self) -> &EntryPointDef {
        &self.entry_point
    }

    fn dummy_signature(&self) -> Bytes {
        simple_account_dummy_signature()
    }

    async fn nonce(&self, key: U256) -> Result<U256> {
        self.entry_point
            .get_nonce(self.client.clone(), self.address, key)
            .await
    }

    async fn is_deployed(&self) -> Result<bool> {
        let code = self
            .client
            .get_code(self.address, None)
            .await
            .context("eth_getCode failed")?;
        Ok(!code.as_ref().is_empty())
    }

    fn factory_call(&self) -> Result<FactoryCall> {
        simple_account_factory_call(self.factory, self.owner.address(), self.salt)
    }

    fn encode_calls(&self, calls: &UserOperationCallData) -> Result<Bytes> {
        encode_simple_account_calls(calls)
    }

    async fn sign_user_operation_hash(&self, hash: H256) -> Result<Bytes> {
        self.scheme
            .sign_user_operation_hash(self.owner.as_ref(), hash)
            .await
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Bytes> {
        self.owner.sign_message(message).await
    }
}

fn account_abi() -> Result<Abi> {
    Ok(AbiParser::default()
        .parse(SIMPLE_ACCOUNT_ABI)
        .context("failed to parse SimpleAccount ABI")?)
}

fn factory_abi() -> Result<Abi> {
    Ok(AbiParser::default()
        .parse(SIMPLE_ACCOUNT_FACTORY_ABI)
        .context("failed to parse SimpleAccountFactory ABI")?)
}

pub fn simple_account_dummy_signature() -> Bytes {
    // constant is valid hex
    SIMPLE_ACCOUNT_DUMMY_SIGNATURE.parse().unwrap_or_default()
}

pub fn simple_account_factory_call(factory: Address, owner: Address, salt: U256) -> Result<FactoryCall> {
    let abi = factory_abi()?;
    let data = abi
        .function("createAccount")
        .context("createAccount missing from factory ABI")?
        .encode_input(&[Token::Address(owner), Token::Uint(salt)])
        .context("failed to build createAccount calldata")?;
    Ok(FactoryCall {
        factory,
        data: Bytes::from(data),
    })
}

/// `execute(dest, value, func)` for a single call, `executeBatch(dest[], func[])` for several.
pub fn encode_simple_account_calls(calls: &UserOperationCallData) -> Result<Bytes> {
    let abi = account_abi()?;
    let encoded = match calls {
        UserOperationCallData::Raw(data) => return Ok(data.clone()),
        UserOperationCallData::Single(call) => abi
            .function("execute")
            .context("execute missing from account ABI")?
            .encode_input(&execute_tokens(call))
            .context("failed to build execute calldata")?,
        UserOperationCallData::Batch(batch) => {
            // SimpleAccount v0.6 executeBatch carries no per-call value.
            if let Some(call) = batch.iter().find(|c| !c.value.is_zero()) {
                return Err(AaError::Transport(anyhow!(
                    "executeBatch cannot forward value ({} to {:?})",
                    call.value,
                    call.target
                )));
            }
            let dests = batch.iter().map(|c| Token::Address(c.target)).collect();
            let funcs = batch.iter().map(|c| Token::Bytes(c.data.to_vec())).collect();
            abi.function("executeBatch")
                .context("executeBatch missing from account ABI")?
                .encode_input(&[Token::Array(dests), Token::Array(funcs)])
                .context("failed to build executeBatch calldata")?
        }
    };
    Ok(Bytes::from(encoded))
}

fn execute_tokens(call: &Call) -> [Token; 3] {
    [
        Token::Address(call.target),
        Token::Uint(call.value),
        Token::Bytes(call.data.to_vec()),
    ]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entrypoint::EntryPointVersion;
    use crate::signer::tests::test_wallet;
    use crate::signer::is_erc6492;
    use ethers::abi::decode;
    use ethers::abi::ParamType;
    use ethers::signers::LocalWallet;

    /// In-memory account used by pipeline tests.
    pub(crate) struct StaticAccount {
        pub owner: LocalWallet,
        pub entry_point: EntryPointDef,
        pub address: Address,
        pub nonce: U256,
        pub deployed: bool,
        pub factory: Address,
    }

    impl StaticAccount {
        pub(crate) fn new(version: EntryPointVersion) -> Self {
            Self {
                owner: test_wallet(),
                entry_point: EntryPointDef::custom(
                    1337,
                    version,
                    "0x66a15edcc3b50a663e72f1457ffd49b9ae284ddc".parse().unwrap(),
                ),
                address: Address::repeat_byte(0x5a),
                nonce: U256::from(3),
                deployed: true,
                factory: Address::repeat_byte(0xfa),
            }
        }
    }

    #[async_trait]
    impl SmartAccount for StaticAccount {
        fn address(&self) -> Address {
            self.address
        }

        fn entry_point(&self) -> &EntryPointDef {
            &self.entry_point
        }

        fn dummy_signature(&self) -> Bytes {
            simple_account_dummy_signature()
        }

        async fn nonce(&self, _key: U256) -> Result<U256> {
            Ok(self.nonce)
        }

        async fn is_deployed(&self) -> Result<bool> {
            Ok(self.deployed)
        }

        fn factory_call(&self) -> Result<FactoryCall> {
            simple_account_factory_call(self.factory, SmartAccountSigner::address(&self.owner), U256::zero())
        }

        fn encode_calls(&self, calls: &UserOperationCallData) -> Result<Bytes> {
            encode_simple_account_calls(calls)
        }

        async fn sign_user_operation_hash(&self, hash: H256) -> Result<Bytes> {
            SigningScheme::RawMessage
                .sign_user_operation_hash(&self.owner, hash)
                .await
        }

        async fn sign_message(&self, message: &[u8]) -> Result<Bytes> {
            SmartAccountSigner::sign_message(&self.owner, message).await
        }
    }

    #[test]
    fn dummy_signature_is_65_bytes() {
        assert_eq!(simple_account_dummy_signature().len(), 65);
    }

    #[test]
    fn single_call_encodes_execute() {
        let call = Call {
            target: Address::repeat_byte(0x01),
            value: U256::from(7),
            data: Bytes::from(vec![0xde, 0xad]),
        };
        let data = encode_simple_account_calls(&UserOperationCallData::Single(call)).unwrap();
        // execute(address,uint256,bytes)
        assert_eq!(&data[..4], &[0xb6, 0x1d, 0x27, 0xf6]);
        let tokens = decode(
            &[ParamType::Address, ParamType::Uint(256), ParamType::Bytes],
            &data[4..],
        )
        .unwrap();
        assert_eq!(tokens[0], Token::Address(Address::repeat_byte(0x01)));
        assert_eq!(tokens[1], Token::Uint(U256::from(7)));
        assert_eq!(tokens[2], Token::Bytes(vec![0xde, 0xad]));
    }

    #[test]
    fn batch_encodes_execute_batch_and_rejects_value() {
        let calls = vec![
            Call {
                target: Address::repeat_byte(0x01),
                value: U256::zero(),
                data: Bytes::from(vec![0x01]),
            },
            Call {
                target: Address::repeat_byte(0x02),
                value: U256::zero(),
                data: Bytes::from(vec![0x02]),
            },
        ];
        let data = encode_simple_account_calls(&UserOperationCallData::Batch(calls.clone())).unwrap();
        // executeBatch(address[],bytes[])
        assert_eq!(&data[..4], &[0x18, 0xdf, 0xb3, 0xc7]);

        let mut with_value = calls;
        with_value[1].value = U256::one();
        assert!(encode_simple_account_calls(&UserOperationCallData::Batch(with_value)).is_err());
    }

    #[test]
    fn raw_calldata_passes_through() {
        let raw = Bytes::from(vec![1, 2, 3]);
        assert_eq!(
            encode_simple_account_calls(&UserOperationCallData::Raw(raw.clone())).unwrap(),
            raw
        );
    }

    #[test]
    fn factory_call_encodes_create_account() {
        let owner = Address::repeat_byte(0x0a);
        let call = simple_account_factory_call(Address::repeat_byte(0xfa), owner, U256::from(5)).unwrap();
        // createAccount(address,uint256)
        assert_eq!(&call.data[..4], &[0x5f, 0xbf, 0xb9, 0xcf]);
        assert_eq!(call.data.len(), 4 + 64);
        assert_eq!(&call.init_code()[..20], Address::repeat_byte(0xfa).as_bytes());
    }

    #[tokio::test]
    async fn sign_message_with_6492_wraps_only_when_counterfactual() {
        let mut account = StaticAccount::new(EntryPointVersion::V06);
        let deployed_sig = account.sign_message_with_6492(b"hello").await.unwrap();
        assert_eq!(deployed_sig.len(), 65);

        account.deployed = false;
        let wrapped = account.sign_message_with_6492(b"hello").await.unwrap();
        assert!(is_erc6492(&wrapped));
        assert!(wrapped.len() > 65 + 32);
    }
}
