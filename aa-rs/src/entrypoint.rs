use crate::error::{AaError, Result};
use crate::types::{UserOperationRequest, UserOperationRequestV06, UserOperationRequestV07};
use anyhow::Context;
use ethers::abi::{encode, AbiParser, Token};
use ethers::prelude::Contract;
use ethers::providers::Middleware;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub const ENTRY_POINT_V06_ADDRESS: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";
pub const ENTRY_POINT_V07_ADDRESS: &str = "0x0000000071727De22E5E9d8BAf0edAc6f37da032";

/// Chains where both EntryPoints are deployed at their canonical addresses.
const SUPPORTED_CHAINS: &[u64] = &[
    1,        // mainnet
    11155111, // sepolia
    5,        // goerli
    137,      // polygon
    80001,    // mumbai
    80002,    // amoy
    10,       // optimism
    420,      // optimism goerli
    11155420, // optimism sepolia
    42161,    // arbitrum
    421613,   // arbitrum goerli
    421614,   // arbitrum sepolia
    8453,     // base
    84531,    // base goerli
    84532,    // base sepolia
];

/// Read-only EntryPoint functions, human-readable ABI.
pub const ENTRY_POINT_ABI: &[&str] = &[
    "function getNonce(address sender, uint192 key) view returns (uint256)",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryPointVersion {
    V06,
    V07,
}

impl EntryPointVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryPointVersion::V06 => "0.6.0",
            EntryPointVersion::V07 => "0.7.0",
        }
    }
}

impl fmt::Display for EntryPointVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryPointVersion {
    type Err = AaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "0.6.0" | "0.6" | "v0.6" => Ok(EntryPointVersion::V06),
            "0.7.0" | "0.7" | "v0.7" => Ok(EntryPointVersion::V07),
            other => Err(AaError::UnsupportedEntryPoint {
                version: other.to_string(),
                chain_id: 0,
            }),
        }
    }
}

/// An EntryPoint deployment: version plus address on one chain.
///
/// Selected once per pipeline; every version-dependent encoding goes through here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryPointDef {
    pub version: EntryPointVersion,
    pub address: Address,
    pub chain_id: u64,
}

impl EntryPointDef {
    /// Looks up the canonical EntryPoint for `chain_id`.
    pub fn for_chain(chain_id: u64, version: EntryPointVersion) -> Result<Self> {
        let address = default_address(chain_id, version).ok_or(AaError::UnsupportedEntryPoint {
            version: version.to_string(),
            chain_id,
        })?;
        Ok(Self {
            version,
            address,
            chain_id,
        })
    }

    /// For chains without a registry entry (devnets, custom deployments).
    pub fn custom(chain_id: u64, version: EntryPointVersion, address: Address) -> Self {
        Self {
            version,
            address,
            chain_id,
        }
    }

    /// ABI-encoded packed form the EntryPoint hashes on-chain.
    pub fn pack(&self, request: &UserOperationRequest) -> Result<Bytes> {
        match (self.version, request) {
            (EntryPointVersion::V06, UserOperationRequest::V06(op)) => Ok(pack_v06(op)),
            (EntryPointVersion::V07, UserOperationRequest::V07(op)) => Ok(pack_v07(op)),
            _ => Err(AaError::EntryPointMismatch {
                address: self.address,
                version: request.version().to_string(),
            }),
        }
    }

    /// The user operation hash: the exact message the account owner signs.
    pub fn hash(&self, request: &UserOperationRequest) -> Result<H256> {
        let packed = self.pack(request)?;
        Ok(hash_packed(&packed, self.address, self.chain_id))
    }

    pub async fn get_nonce<M: Middleware + 'static>(
        &self,
        client: Arc<M>,
        sender: Address,
        key: U256,
    ) -> Result<U256> {
        let abi = AbiParser::default()
            .parse(ENTRY_POINT_ABI)
            .context("failed to parse EntryPoint ABI")?;
        let entrypoint = Contract::new(self.address, abi, client);
        let nonce: U256 = entrypoint
            .method("getNonce", (sender, key))
            .context("failed to encode getNonce")?
            .call()
            .await
            .context("entryPoint.getNonce failed")?;
        Ok(nonce)
    }
}

pub fn default_address(chain_id: u64, version: EntryPointVersion) -> Option<Address> {
    if !SUPPORTED_CHAINS.contains(&chain_id) {
        return None;
    }
    let addr = match version {
        EntryPointVersion::V06 => ENTRY_POINT_V06_ADDRESS,
        EntryPointVersion::V07 => ENTRY_POINT_V07_ADDRESS,
    };
    addr.parse().ok()
}

/// `keccak256(abi.encode(keccak256(packed), entryPoint, chainId))`
pub fn hash_packed(packed: &[u8], entry_point: Address, chain_id: u64) -> H256 {
    keccak256(encode(&[
        Token::FixedBytes(keccak256(packed).to_vec()),
        Token::Address(entry_point),
        Token::Uint(chain_id.into()),
    ]))
    .into()
}

/// v0.6 layout: 10 static words, variable-length fields hashed.
pub fn pack_v06(op: &UserOperationRequestV06) -> Bytes {
    encode(&[
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::FixedBytes(keccak256(&op.init_code).to_vec()),
        Token::FixedBytes(keccak256(&op.call_data).to_vec()),
        Token::Uint(op.call_gas_limit),
        Token::Uint(op.verification_gas_limit),
        Token::Uint(op.pre_verification_gas),
        Token::Uint(op.max_fee_per_gas),
        Token::Uint(op.max_priority_fee_per_gas),
        Token::FixedBytes(keccak256(&op.paymaster_and_data).to_vec()),
    ])
    .into()
}

/// v0.7 layout: gas pairs are packed into two 128-bit halves of one word,
/// and `initCode` / `paymasterAndData` are rebuilt from their split fields.
pub fn pack_v07(op: &UserOperationRequestV07) -> Bytes {
    let init_code = match (op.factory, &op.factory_data) {
        (Some(factory), data) => {
            let mut v = factory.as_bytes().to_vec();
            if let Some(data) = data {
                v.extend_from_slice(data);
            }
            v
        }
        (None, _) => Vec::new(),
    };

    let account_gas_limits = concat_128(op.verification_gas_limit, op.call_gas_limit);
    let gas_fees = concat_128(op.max_priority_fee_per_gas, op.max_fee_per_gas);
    let paymaster_and_data = pack_paymaster_and_data_v07(op);

    encode(&[
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::FixedBytes(keccak256(&init_code).to_vec()),
        Token::FixedBytes(keccak256(&op.call_data).to_vec()),
        Token::FixedBytes(account_gas_limits.to_vec()),
        Token::Uint(op.pre_verification_gas),
        Token::FixedBytes(gas_fees.to_vec()),
        Token::FixedBytes(keccak256(&paymaster_and_data).to_vec()),
    ])
    .into()
}

/// `paymaster ++ uint128(verificationGas) ++ uint128(postOpGas) ++ paymasterData`, or empty.
pub fn pack_paymaster_and_data_v07(op: &UserOperationRequestV07) -> Vec<u8> {
    let Some(paymaster) = op.paymaster else {
        return Vec::new();
    };
    let mut v = paymaster.as_bytes().to_vec();
    v.extend_from_slice(&low_128(
        op.paymaster_verification_gas_limit.unwrap_or_default(),
    ));
    v.extend_from_slice(&low_128(op.paymaster_post_op_gas_limit.unwrap_or_default()));
    if let Some(data) = &op.paymaster_data {
        v.extend_from_slice(data);
    }
    v
}

/// Big-endian low 16 bytes of a word (the on-chain `uint128`).
fn low_128(v: U256) -> [u8; 16] {
    let mut word = [0u8; 32];
    v.to_big_endian(&mut word);
    let mut out = [0u8; 16];
    out.copy_from_slice(&word[16..]);
    out
}

fn concat_128(high: U256, low: U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&low_128(high));
    out[16..].copy_from_slice(&low_128(low));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::{sample_v06, sample_v07};

    fn test_entry_point(version: EntryPointVersion) -> EntryPointDef {
        EntryPointDef::custom(
            1337,
            version,
            "0x66a15edcc3b50a663e72f1457ffd49b9ae284ddc".parse().unwrap(),
        )
    }

    #[test]
    fn v06_hash_zeroed_matches_entry_point() {
        // Produced by EntryPoint.getUserOpHash on chain 1337.
        let op = UserOperationRequestV06 {
            sender: Address::zero(),
            nonce: U256::zero(),
            init_code: Bytes::default(),
            call_data: Bytes::default(),
            call_gas_limit: U256::zero(),
            verification_gas_limit: U256::zero(),
            pre_verification_gas: U256::zero(),
            max_fee_per_gas: U256::zero(),
            max_priority_fee_per_gas: U256::zero(),
            paymaster_and_data: Bytes::default(),
            signature: Bytes::default(),
        };
        let hash = test_entry_point(EntryPointVersion::V06)
            .hash(&UserOperationRequest::V06(op))
            .unwrap();
        assert_eq!(
            hash,
            "0xdca97c3b49558ab360659f6ead939773be8bf26631e61bb17045bb70dc983b2d"
                .parse()
                .unwrap()
        );
    }

    #[test]
    fn v06_hash_matches_entry_point() {
        let hash = test_entry_point(EntryPointVersion::V06)
            .hash(&UserOperationRequest::V06(sample_v06()))
            .unwrap();
        assert_eq!(
            hash,
            "0x484add9e4d8c3172d11b5feb6a3cc712280e176d278027cfa02ee396eb28afa1"
                .parse()
                .unwrap()
        );
    }

    #[test]
    fn signature_is_not_part_of_the_hash() {
        let ep = test_entry_point(EntryPointVersion::V07);
        let a = UserOperationRequest::V07(sample_v07());
        let mut b = a.clone();
        b.set_signature(Bytes::from(vec![1, 2, 3]));
        assert_eq!(ep.hash(&a).unwrap(), ep.hash(&b).unwrap());
    }

    #[test]
    fn hash_is_deterministic_and_chain_scoped() {
        let ep = test_entry_point(EntryPointVersion::V07);
        let req = UserOperationRequest::V07(sample_v07());
        assert_eq!(ep.hash(&req).unwrap(), ep.hash(&req).unwrap());

        let other_chain = EntryPointDef {
            chain_id: 1,
            ..ep.clone()
        };
        assert_ne!(ep.hash(&req).unwrap(), other_chain.hash(&req).unwrap());
    }

    #[test]
    fn v07_layout_packs_gas_pairs() {
        let op = sample_v07();
        let packed = pack_v07(&op);
        assert_eq!(packed.len(), 8 * 32);

        // word 4: verificationGasLimit (high) | callGasLimit (low)
        let word = &packed[4 * 32..5 * 32];
        assert_eq!(U256::from_big_endian(&word[..16]), op.verification_gas_limit);
        assert_eq!(U256::from_big_endian(&word[16..]), op.call_gas_limit);

        // word 6: maxPriorityFeePerGas (high) | maxFeePerGas (low)
        let word = &packed[6 * 32..7 * 32];
        assert_eq!(U256::from_big_endian(&word[..16]), op.max_priority_fee_per_gas);
        assert_eq!(U256::from_big_endian(&word[16..]), op.max_fee_per_gas);

        // no paymaster: hash of empty bytes
        assert_eq!(&packed[7 * 32..], &keccak256(Vec::<u8>::new())[..]);
    }

    #[test]
    fn entry_point_abi_covers_get_nonce() {
        let abi = AbiParser::default().parse(ENTRY_POINT_ABI).unwrap();
        let names: Vec<_> = abi.functions().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["getNonce"]);
        assert_eq!(abi.function("getNonce").unwrap().inputs.len(), 2);
    }

    /// ERC-7579 `execute` calldata of a v0.7 operation accepted on Sepolia.
    const SEPOLIA_V07_CALL_DATA: &[&str] = &[
    "e9ae5c530000000000000000000000000000000000000000000000000000000000000000000000000000000000000000",
    "000000000000000000000000000000000000004000000000000000000000000000000000000000000000000000000000",
    "000001d8b292cf4a8e1ff21ac27c4f94071cd02c022c414b000000000000000000000000000000000000000000000000",
    "00000000000000009517e29f000000000000000000000000000000000000000000000000000000000000000200000000",
    "0000000000000000ad6330089d9a1fe89f4020292e1afe9969a5a2fc0000000000000000000000000000000000000000",
    "000000000000000000000060000000000000000000000000000000000000000000000000000000000000012000000000",
    "000000000000000000000000000000000000000000000000000151800000000000000000000000000000000000000000",
    "0000000000000000000000000000000000000000000000000000000000000000000000000000018e2fbe898000000000",
    "000000000000000000000000000000000000000000000000000000800000000000000000000000000000000000000000",
    "0000000000000000000000800000000000000000000000002372912728f93ab3daaaebea4f87e6e28476d98700000000",
    "0000000000000000000000000000000000000000002386f26fc100000000000000000000000000000000000000000000",
    "000000000000000000000060000000000000000000000000000000000000000000000000000000000000000000000000",
    "00000000",
    ];

    fn v07_op(
        sender: &str,
        nonce: U256,
        call_data: Bytes,
        gas: [u64; 5],
    ) -> UserOperationRequestV07 {
        let [call_gas_limit, verification_gas_limit, pre_verification_gas, max_fee_per_gas, max_priority_fee_per_gas] =
            gas;
        UserOperationRequestV07 {
            sender: sender.parse().unwrap(),
            nonce,
            factory: None,
            factory_data: None,
            call_data,
            call_gas_limit: U256::from(call_gas_limit),
            verification_gas_limit: U256::from(verification_gas_limit),
            pre_verification_gas: U256::from(pre_verification_gas),
            max_fee_per_gas: U256::from(max_fee_per_gas),
            max_priority_fee_per_gas: U256::from(max_priority_fee_per_gas),
            paymaster: None,
            paymaster_data: None,
            paymaster_verification_gas_limit: None,
            paymaster_post_op_gas_limit: None,
            signature: Bytes::default(),
        }
    }

    #[test]
    fn v07_hash_matches_entry_point() {
        // EntryPoint.getUserOpHash on Sepolia for an operation without factory or paymaster.
        let call_data: Bytes = format!("0x{}", SEPOLIA_V07_CALL_DATA.concat()).parse().unwrap();
        let op = v07_op(
            "0xb292Cf4a8E1fF21Ac27C4f94071Cd02C022C414b",
            U256::from_str_radix(
                "F83D07238A7C8814A48535035602123AD6DBFA63000000000000000000000001",
                16,
            )
            .unwrap(),
            call_data,
            [0x12c9b5, 0x114fc, 48916, 0x109a4a441a, 0x52412100],
        );
        let ep = EntryPointDef::for_chain(11155111, EntryPointVersion::V07).unwrap();
        assert_eq!(
            ep.hash(&UserOperationRequest::V07(op)).unwrap(),
            "0xe486401370d145766c3cf7ba089553214a1230d38662ae532c9b62eb6dadcf7e"
                .parse()
                .unwrap()
        );
    }

    #[test]
    fn v07_hash_with_factory_and_paymaster() {
        let mut op = v07_op(
            "0x5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a",
            U256::from(7),
            Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6]),
            [0x7530, 0x186a0, 0xc350, 0x77359400, 0x3b9aca00],
        );
        // createAccount(0xf39f..2266, 0)
        op.factory = Some("0x9406Cc6185a346906296840746125a0E44976454".parse().unwrap());
        op.factory_data = Some(
            "0x5fbfb9cf000000000000000000000000f39fd6e51aad88f6f4ce6ab8827279cfffb922660000000000000000000000000000000000000000000000000000000000000000"
                .parse()
                .unwrap(),
        );
        op.paymaster = Some(Address::repeat_byte(0xcc));
        op.paymaster_verification_gas_limit = Some(U256::from(0x30000));
        op.paymaster_post_op_gas_limit = Some(U256::from(0x1d4c0));
        op.paymaster_data = Some(Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]));

        let ep = EntryPointDef::for_chain(84532, EntryPointVersion::V07).unwrap();
        let request = UserOperationRequest::V07(op.clone());
        assert_eq!(
            ep.hash(&request).unwrap(),
            "0x424050b5948dd1157ba744ef0288b3d6411d19daa334d33dbc6fd8e5078807aa"
                .parse()
                .unwrap()
        );

        // the initCode word covers factory ++ factoryData
        let mut init_code = op.factory.unwrap().as_bytes().to_vec();
        init_code.extend_from_slice(op.factory_data.as_ref().unwrap());
        assert_eq!(&pack_v07(&op)[2 * 32..3 * 32], &keccak256(init_code)[..]);
    }

    #[test]
    fn v07_paymaster_and_data_layout() {
        let mut op = sample_v07();
        op.paymaster = Some(Address::repeat_byte(0xaa));
        op.paymaster_verification_gas_limit = Some(U256::from(0x10));
        op.paymaster_post_op_gas_limit = Some(U256::from(0x20));
        op.paymaster_data = Some(Bytes::from(vec![0xbe, 0xef]));

        let pmd = pack_paymaster_and_data_v07(&op);
        assert_eq!(pmd.len(), 20 + 16 + 16 + 2);
        assert_eq!(&pmd[..20], Address::repeat_byte(0xaa).as_bytes());
        assert_eq!(pmd[35], 0x10);
        assert_eq!(pmd[51], 0x20);
        assert_eq!(&pmd[52..], &[0xbe, 0xef]);
    }

    #[test]
    fn versions_are_not_cross_compatible() {
        let v06 = sample_v06();
        let v07 = UserOperationRequestV07 {
            sender: v06.sender,
            nonce: v06.nonce,
            factory: None,
            factory_data: None,
            call_data: v06.call_data.clone(),
            call_gas_limit: v06.call_gas_limit,
            verification_gas_limit: v06.verification_gas_limit,
            pre_verification_gas: v06.pre_verification_gas,
            max_fee_per_gas: v06.max_fee_per_gas,
            max_priority_fee_per_gas: v06.max_priority_fee_per_gas,
            paymaster: None,
            paymaster_data: None,
            paymaster_verification_gas_limit: None,
            paymaster_post_op_gas_limit: None,
            signature: v06.signature.clone(),
        };
        assert_ne!(pack_v06(&v06), pack_v07(&v07));

        let ep06 = test_entry_point(EntryPointVersion::V06);
        assert!(matches!(
            ep06.hash(&UserOperationRequest::V07(v07)),
            Err(AaError::EntryPointMismatch { .. })
        ));
    }

    #[test]
    fn registry_lookup() {
        let ep = EntryPointDef::for_chain(8453, EntryPointVersion::V07).unwrap();
        assert_eq!(ep.address, ENTRY_POINT_V07_ADDRESS.parse().unwrap());
        assert!(matches!(
            EntryPointDef::for_chain(999_999, EntryPointVersion::V06),
            Err(AaError::UnsupportedEntryPoint { chain_id: 999_999, .. })
        ));
        assert_eq!(
            "0.7.0".parse::<EntryPointVersion>().unwrap(),
            EntryPointVersion::V07
        );
        assert!("0.8.0".parse::<EntryPointVersion>().is_err());
    }
}
