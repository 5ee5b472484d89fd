use crate::encoding::{self, bigint_json};
use crate::entrypoint::EntryPointVersion;
use crate::error::{AaError, Result};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// ERC-4337 UserOperation as sent to an EntryPoint v0.6 bundler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserOperationRequestV06 {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

/// ERC-4337 UserOperation as sent to an EntryPoint v0.7 bundler.
///
/// Factory and paymaster groups are omitted from the JSON entirely when unset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserOperationRequestV07 {
    pub sender: Address,
    pub nonce: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_data: Option<Bytes>,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_data: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_post_op_gas_limit: Option<U256>,
    pub signature: Bytes,
}

/// Wire form of a user operation. Exactly one version's field set, never a mix.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserOperationRequest {
    V06(UserOperationRequestV06),
    V07(UserOperationRequestV07),
}

/// The three gas values a multisig upper-limit signature commits to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GasValues {
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl UserOperationRequest {
    pub fn version(&self) -> EntryPointVersion {
        match self {
            UserOperationRequest::V06(_) => EntryPointVersion::V06,
            UserOperationRequest::V07(_) => EntryPointVersion::V07,
        }
    }

    pub fn sender(&self) -> Address {
        match self {
            UserOperationRequest::V06(op) => op.sender,
            UserOperationRequest::V07(op) => op.sender,
        }
    }

    pub fn nonce(&self) -> U256 {
        match self {
            UserOperationRequest::V06(op) => op.nonce,
            UserOperationRequest::V07(op) => op.nonce,
        }
    }

    pub fn call_data(&self) -> &Bytes {
        match self {
            UserOperationRequest::V06(op) => &op.call_data,
            UserOperationRequest::V07(op) => &op.call_data,
        }
    }

    pub fn signature(&self) -> &Bytes {
        match self {
            UserOperationRequest::V06(op) => &op.signature,
            UserOperationRequest::V07(op) => &op.signature,
        }
    }

    pub fn set_signature(&mut self, signature: Bytes) {
        match self {
            UserOperationRequest::V06(op) => op.signature = signature,
            UserOperationRequest::V07(op) => op.signature = signature,
        }
    }

    pub fn gas_values(&self) -> GasValues {
        match self {
            UserOperationRequest::V06(op) => GasValues {
                pre_verification_gas: op.pre_verification_gas,
                max_fee_per_gas: op.max_fee_per_gas,
                max_priority_fee_per_gas: op.max_priority_fee_per_gas,
            },
            UserOperationRequest::V07(op) => GasValues {
                pre_verification_gas: op.pre_verification_gas,
                max_fee_per_gas: op.max_fee_per_gas,
                max_priority_fee_per_gas: op.max_priority_fee_per_gas,
            },
        }
    }

    /// Copy of the request with the three gas values replaced.
    pub fn with_gas_values(&self, gas: GasValues) -> Self {
        let mut out = self.clone();
        match &mut out {
            UserOperationRequest::V06(op) => {
                op.pre_verification_gas = gas.pre_verification_gas;
                op.max_fee_per_gas = gas.max_fee_per_gas;
                op.max_priority_fee_per_gas = gas.max_priority_fee_per_gas;
            }
            UserOperationRequest::V07(op) => {
                op.pre_verification_gas = gas.pre_verification_gas;
                op.max_fee_per_gas = gas.max_fee_per_gas;
                op.max_priority_fee_per_gas = gas.max_priority_fee_per_gas;
            }
        }
        out
    }

    /// Hexlified JSON body for JSON-RPC.
    pub fn to_json(&self) -> Value {
        // Serialization of these plain structs cannot fail.
        encoding::deep_hexlify(serde_json::to_value(self).unwrap_or(Value::Null))
    }

    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| AaError::Transport(anyhow::anyhow!("invalid user operation json: {e}")))
    }
}

/// Version-specific half of the builder struct.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionFields {
    V06 {
        init_code: Option<Bytes>,
        paymaster_and_data: Option<Bytes>,
    },
    V07 {
        factory: Option<Address>,
        factory_data: Option<Bytes>,
        paymaster: Option<Address>,
        paymaster_data: Option<Bytes>,
        paymaster_verification_gas_limit: Option<U256>,
        paymaster_post_op_gas_limit: Option<U256>,
    },
}

/// Builder form of a user operation: gas, fee and paymaster fields stay
/// `None` until the middleware chain fills them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserOperationStruct {
    pub sender: Address,
    pub nonce: U256,
    pub call_data: Bytes,
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub signature: Bytes,
    pub version_fields: VersionFields,
}

/// Deployment data for a counterfactual account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FactoryCall {
    pub factory: Address,
    pub data: Bytes,
}

impl FactoryCall {
    /// v0.6 `initCode`: factory address followed by its calldata.
    pub fn init_code(&self) -> Bytes {
        let mut v = Vec::with_capacity(20 + self.data.len());
        v.extend_from_slice(self.factory.as_bytes());
        v.extend_from_slice(self.data.as_ref());
        Bytes::from(v)
    }
}

impl UserOperationStruct {
    pub fn new(
        version: EntryPointVersion,
        sender: Address,
        nonce: U256,
        call_data: Bytes,
        factory: Option<FactoryCall>,
        dummy_signature: Bytes,
    ) -> Self {
        let version_fields = match version {
            EntryPointVersion::V06 => VersionFields::V06 {
                init_code: Some(factory.map(|f| f.init_code()).unwrap_or_default()),
                paymaster_and_data: None,
            },
            EntryPointVersion::V07 => VersionFields::V07 {
                factory: factory.as_ref().map(|f| f.factory),
                factory_data: factory.map(|f| f.data),
                paymaster: None,
                paymaster_data: None,
                paymaster_verification_gas_limit: None,
                paymaster_post_op_gas_limit: None,
            },
        };
        Self {
            sender,
            nonce,
            call_data,
            call_gas_limit: None,
            verification_gas_limit: None,
            pre_verification_gas: None,
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            signature: dummy_signature,
            version_fields,
        }
    }

    /// Rebuilds a struct from a submitted request, keeping only the intent
    /// (sender, nonce, calldata, deployment data).
    pub fn from_request_intent(request: &UserOperationRequest, dummy_signature: Bytes) -> Self {
        match request {
            UserOperationRequest::V06(op) => {
                let mut uo = Self::new(
                    EntryPointVersion::V06,
                    op.sender,
                    op.nonce,
                    op.call_data.clone(),
                    None,
                    dummy_signature,
                );
                uo.version_fields = VersionFields::V06 {
                    init_code: Some(op.init_code.clone()),
                    paymaster_and_data: None,
                };
                uo
            }
            UserOperationRequest::V07(op) => {
                let factory = match (op.factory, op.factory_data.clone()) {
                    (Some(factory), Some(data)) => Some(FactoryCall { factory, data }),
                    _ => None,
                };
                Self::new(
                    EntryPointVersion::V07,
                    op.sender,
                    op.nonce,
                    op.call_data.clone(),
                    factory,
                    dummy_signature,
                )
            }
        }
    }

    pub fn version(&self) -> EntryPointVersion {
        match self.version_fields {
            VersionFields::V06 { .. } => EntryPointVersion::V06,
            VersionFields::V07 { .. } => EntryPointVersion::V07,
        }
    }

    /// Names of the fields that keep this struct from being a valid request.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.call_gas_limit.is_none() {
            missing.push("callGasLimit");
        }
        if self.verification_gas_limit.is_none() {
            missing.push("verificationGasLimit");
        }
        if self.pre_verification_gas.is_none() {
            missing.push("preVerificationGas");
        }
        if self.max_fee_per_gas.is_none() {
            missing.push("maxFeePerGas");
        }
        if self.max_priority_fee_per_gas.is_none() {
            missing.push("maxPriorityFeePerGas");
        }
        match &self.version_fields {
            VersionFields::V06 {
                init_code,
                paymaster_and_data,
            } => {
                if init_code.is_none() {
                    missing.push("initCode");
                }
                if paymaster_and_data.is_none() {
                    missing.push("paymasterAndData");
                }
            }
            VersionFields::V07 {
                factory,
                factory_data,
                paymaster,
                paymaster_data,
                paymaster_verification_gas_limit,
                paymaster_post_op_gas_limit,
            } => {
                // Either the whole group is present or none of it.
                if factory.is_some() != factory_data.is_some() {
                    missing.push(if factory.is_none() {
                        "factory"
                    } else {
                        "factoryData"
                    });
                }
                let group = [
                    ("paymaster", paymaster.is_some()),
                    ("paymasterData", paymaster_data.is_some()),
                    (
                        "paymasterVerificationGasLimit",
                        paymaster_verification_gas_limit.is_some(),
                    ),
                    (
                        "paymasterPostOpGasLimit",
                        paymaster_post_op_gas_limit.is_some(),
                    ),
                ];
                if group.iter().any(|(_, set)| *set) {
                    missing.extend(group.iter().filter(|(_, set)| !set).map(|(n, _)| *n));
                }
            }
        }
        missing
    }

    pub fn is_valid_request(&self) -> bool {
        self.missing_fields().is_empty()
    }

    /// Converts a fully resolved struct into its wire form.
    pub fn into_request(self) -> Result<UserOperationRequest> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            return Err(AaError::InvalidUserOperation {
                missing,
                partial: self.to_debug_json(),
            });
        }
        Ok(self.to_request_filled())
    }

    /// Wire form with unresolved gas fields zeroed, used for estimation and
    /// paymaster stub requests.
    pub fn to_estimation_request(&self) -> UserOperationRequest {
        self.to_request_filled()
    }

    fn to_request_filled(&self) -> UserOperationRequest {
        let z = |v: Option<U256>| v.unwrap_or_default();
        match &self.version_fields {
            VersionFields::V06 {
                init_code,
                paymaster_and_data,
            } => UserOperationRequest::V06(UserOperationRequestV06 {
                sender: self.sender,
                nonce: self.nonce,
                init_code: init_code.clone().unwrap_or_default(),
                call_data: self.call_data.clone(),
                call_gas_limit: z(self.call_gas_limit),
                verification_gas_limit: z(self.verification_gas_limit),
                pre_verification_gas: z(self.pre_verification_gas),
                max_fee_per_gas: z(self.max_fee_per_gas),
                max_priority_fee_per_gas: z(self.max_priority_fee_per_gas),
                paymaster_and_data: paymaster_and_data.clone().unwrap_or_default(),
                signature: self.signature.clone(),
            }),
            VersionFields::V07 {
                factory,
                factory_data,
                paymaster,
                paymaster_data,
                paymaster_verification_gas_limit,
                paymaster_post_op_gas_limit,
            } => {
                let has_paymaster = paymaster.is_some();
                UserOperationRequest::V07(UserOperationRequestV07 {
                    sender: self.sender,
                    nonce: self.nonce,
                    factory: *factory,
                    factory_data: factory_data.clone(),
                    call_data: self.call_data.clone(),
                    call_gas_limit: z(self.call_gas_limit),
                    verification_gas_limit: z(self.verification_gas_limit),
                    pre_verification_gas: z(self.pre_verification_gas),
                    max_fee_per_gas: z(self.max_fee_per_gas),
                    max_priority_fee_per_gas: z(self.max_priority_fee_per_gas),
                    paymaster: *paymaster,
                    paymaster_data: paymaster_data.clone(),
                    paymaster_verification_gas_limit: has_paymaster
                        .then(|| z(*paymaster_verification_gas_limit)),
                    paymaster_post_op_gas_limit: has_paymaster
                        .then(|| z(*paymaster_post_op_gas_limit)),
                    signature: self.signature.clone(),
                })
            }
        }
    }

    /// JSON-safe snapshot for error reporting.
    pub fn to_debug_json(&self) -> Value {
        fn big(v: Option<U256>) -> Value {
            v.map(bigint_json).unwrap_or(Value::Null)
        }
        fn bytes(v: Option<&Bytes>) -> Value {
            v.map(|b| Value::String(encoding::fmt_bytes(b)))
                .unwrap_or(Value::Null)
        }
        fn addr(v: Option<Address>) -> Value {
            v.map(|a| Value::String(encoding::fmt_address(a)))
                .unwrap_or(Value::Null)
        }

        let mut m = Map::new();
        m.insert("sender".into(), addr(Some(self.sender)));
        m.insert("nonce".into(), bigint_json(self.nonce));
        m.insert("callData".into(), bytes(Some(&self.call_data)));
        m.insert("callGasLimit".into(), big(self.call_gas_limit));
        m.insert(
            "verificationGasLimit".into(),
            big(self.verification_gas_limit),
        );
        m.insert("preVerificationGas".into(), big(self.pre_verification_gas));
        m.insert("maxFeePerGas".into(), big(self.max_fee_per_gas));
        m.insert(
            "maxPriorityFeePerGas".into(),
            big(self.max_priority_fee_per_gas),
        );
        m.insert("signature".into(), bytes(Some(&self.signature)));
        match &self.version_fields {
            VersionFields::V06 {
                init_code,
                paymaster_and_data,
            } => {
                m.insert("initCode".into(), bytes(init_code.as_ref()));
                m.insert(
                    "paymasterAndData".into(),
                    bytes(paymaster_and_data.as_ref()),
                );
            }
            VersionFields::V07 {
                factory,
                factory_data,
                paymaster,
                paymaster_data,
                paymaster_verification_gas_limit,
                paymaster_post_op_gas_limit,
            } => {
                m.insert("factory".into(), addr(*factory));
                m.insert("factoryData".into(), bytes(factory_data.as_ref()));
                m.insert("paymaster".into(), addr(*paymaster));
                m.insert("paymasterData".into(), bytes(paymaster_data.as_ref()));
                m.insert(
                    "paymasterVerificationGasLimit".into(),
                    big(*paymaster_verification_gas_limit),
                );
                m.insert(
                    "paymasterPostOpGasLimit".into(),
                    big(*paymaster_post_op_gas_limit),
                );
            }
        }
        Value::Object(m)
    }
}

/// Caller-supplied exact values. These win over any fee option or estimate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationOverrides {
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub paymaster_verification_gas_limit: Option<U256>,
    pub paymaster_post_op_gas_limit: Option<U256>,
    /// v0.6 only. `0x` means the account pays for its own gas.
    pub paymaster_and_data: Option<Bytes>,
    /// v0.7 only.
    pub paymaster: Option<Address>,
    /// v0.7 only. `0x` means the account pays for its own gas.
    pub paymaster_data: Option<Bytes>,
    /// 192-bit nonce key for the EntryPoint's 2D nonce.
    pub nonce_key: Option<U256>,
}

impl UserOperationOverrides {
    /// Paymaster middleware is skipped when the caller supplies a paymaster or its data.
    pub fn bypass_paymaster(&self) -> bool {
        self.paymaster_and_data.is_some() || self.paymaster.is_some() || self.paymaster_data.is_some()
    }
}

/// A single call made by the smart account.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Call {
    pub target: Address,
    pub value: U256,
    pub data: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserOperationCallData {
    /// Already-encoded account calldata.
    Raw(Bytes),
    Single(Call),
    Batch(Vec<Call>),
}

/// Result of a submission. The signed request is kept so it can be dropped and replaced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendResult {
    pub hash: H256,
    pub request: UserOperationRequest,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionReceiptRef {
    pub transaction_hash: H256,
    pub block_hash: Option<H256>,
    pub block_number: Option<U256>,
}

/// `eth_getUserOperationReceipt` result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserOperationReceipt {
    pub user_op_hash: H256,
    pub entry_point: Option<Address>,
    pub sender: Address,
    pub nonce: U256,
    pub paymaster: Option<Address>,
    pub actual_gas_cost: U256,
    pub actual_gas_used: U256,
    pub success: bool,
    pub reason: Option<String>,
    pub receipt: TransactionReceiptRef,
}

/// `eth_getUserOperationByHash` result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationByHash {
    pub user_operation: UserOperationRequest,
    pub entry_point: Address,
    #[serde(default)]
    pub block_number: Option<U256>,
    #[serde(default)]
    pub block_hash: Option<H256>,
    #[serde(default)]
    pub transaction_hash: Option<H256>,
}
