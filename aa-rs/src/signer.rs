use crate::error::{AaError, Result};
use anyhow::Context;
use async_trait::async_trait;
use ethers::abi::{encode, AbiParser, Token};
use ethers::prelude::Contract;
use ethers::providers::Middleware;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip712::EIP712Domain;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use std::sync::Arc;

/// ERC-6492 magic suffix (`0x6492` repeated to 32 bytes).
pub const ERC6492_MAGIC: [u8; 32] = [
    0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92,
    0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92,
];

/// Owner key of a smart account.
#[async_trait]
pub trait SmartAccountSigner: Send + Sync {
    fn address(&self) -> Address;

    /// EIP-191 `personal_sign` over raw bytes.
    async fn sign_message(&self, message: &[u8]) -> Result<Bytes>;

    /// Signs a 32-byte digest as is (no prefix).
    async fn sign_hash(&self, hash: H256) -> Result<Bytes>;
}

#[async_trait]
impl SmartAccountSigner for LocalWallet {
    fn address(&self) -> Address {
        Signer::address(self)
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Bytes> {
        let sig = Signer::sign_message(self, message)
            .await
            .map_err(|e| AaError::Signing(e.to_string()))?;
        Ok(Bytes::from(sig.to_vec()))
    }

    async fn sign_hash(&self, hash: H256) -> Result<Bytes> {
        let sig = LocalWallet::sign_hash(self, hash).map_err(|e| AaError::Signing(e.to_string()))?;
        Ok(Bytes::from(sig.to_vec()))
    }
}

/// How an account turns a user operation hash into the signature its validation expects.
#[derive(Clone, Debug, PartialEq)]
pub enum SigningScheme {
    /// `personal_sign` over the 32-byte hash.
    RawMessage,
    /// Hash wrapped as `PrimaryType(bytes message)` under the account's own EIP-712 domain.
    TypedData(TypedDataEnvelope),
}

/// EIP-712 envelope scoped to one account, so a signature cannot be replayed on another.
#[derive(Clone, Debug, PartialEq)]
pub struct TypedDataEnvelope {
    pub domain: EIP712Domain,
    pub primary_type: String,
}

impl TypedDataEnvelope {
    pub fn new(domain: EIP712Domain, primary_type: impl Into<String>) -> Self {
        Self {
            domain,
            primary_type: primary_type.into(),
        }
    }

    /// Envelope under the domain the account itself reports through `eip712Domain()`.
    pub async fn for_account<M: Middleware + 'static>(
        client: Arc<M>,
        account: Address,
        primary_type: impl Into<String>,
    ) -> Result<Self> {
        let domain = read_eip712_domain(client, account).await?;
        Ok(Self::new(domain, primary_type))
    }

    /// `keccak256(0x1901 ++ domainSeparator ++ keccak256(typeHash ++ keccak256(message)))`
    pub fn digest(&self, message: &[u8]) -> H256 {
        let type_hash = keccak256(format!("{}(bytes message)", self.primary_type));
        let struct_hash = keccak256(encode(&[
            Token::FixedBytes(type_hash.to_vec()),
            Token::FixedBytes(keccak256(message).to_vec()),
        ]));

        let mut buf = Vec::with_capacity(66);
        buf.extend_from_slice(&[0x19, 0x01]);
        buf.extend_from_slice(&self.domain.separator());
        buf.extend_from_slice(&struct_hash);
        keccak256(buf).into()
    }
}

impl SigningScheme {
    pub async fn sign_user_operation_hash(
        &self,
        signer: &dyn SmartAccountSigner,
        hash: H256,
    ) -> Result<Bytes> {
        match self {
            SigningScheme::RawMessage => signer.sign_message(hash.as_bytes()).await,
            SigningScheme::TypedData(envelope) => {
                signer.sign_hash(envelope.digest(hash.as_bytes())).await
            }
        }
    }
}

/// Reads an account's EIP-5267 `eip712Domain()`.
pub async fn read_eip712_domain<M: Middleware + 'static>(
    client: Arc<M>,
    account: Address,
) -> Result<EIP712Domain> {
    let abi = AbiParser::default()
        .parse(&[
            "function eip712Domain() view returns (bytes1 fields, string name, string version, uint256 chainId, address verifyingContract, bytes32 salt, uint256[] extensions)",
        ])
        .context("failed to parse eip712Domain ABI")?;
    let contract = Contract::new(account, abi, client);

    let (fields, name, version, chain_id, verifying_contract, salt, _extensions): (
        [u8; 1],
        String,
        String,
        U256,
        Address,
        [u8; 32],
        Vec<U256>,
    ) = contract
        .method("eip712Domain", ())
        .context("failed to encode eip712Domain")?
        .call()
        .await
        .context("account.eip712Domain failed")?;

    Ok(domain_from_fields(
        fields[0],
        name,
        version,
        chain_id,
        verifying_contract,
        salt,
    ))
}

/// Keeps only the domain members flagged in the EIP-5267 `fields` bitmap.
pub fn domain_from_fields(
    fields: u8,
    name: String,
    version: String,
    chain_id: U256,
    verifying_contract: Address,
    salt: [u8; 32],
) -> EIP712Domain {
    // Bit i marks which of the five domain fields are in use.
    let used = |bit: u8| fields & (1 << bit) != 0;
    EIP712Domain {
        name: used(0).then_some(name),
        version: used(1).then_some(version),
        chain_id: used(2).then_some(chain_id),
        verifying_contract: used(3).then_some(verifying_contract),
        salt: used(4).then_some(salt),
    }
}

/// Wraps a signature for a not-yet-deployed account:
/// `abi.encode(factory, factoryCalldata, signature) ++ magic`.
pub fn wrap_erc6492(factory: Address, factory_calldata: &Bytes, signature: &Bytes) -> Bytes {
    let mut out = encode(&[
        Token::Address(factory),
        Token::Bytes(factory_calldata.to_vec()),
        Token::Bytes(signature.to_vec()),
    ]);
    out.extend_from_slice(&ERC6492_MAGIC);
    Bytes::from(out)
}

pub fn is_erc6492(signature: &[u8]) -> bool {
    signature.len() >= 32 && signature[signature.len() - 32..] == ERC6492_MAGIC
}
