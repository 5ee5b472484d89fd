use crate::encoding::{self, parse_address, parse_bytes, parse_u256_quantity};
use crate::entrypoint::{EntryPointDef, EntryPointVersion};
use crate::error::Result;
use crate::rpc::{JsonRpcTransport, RequestContext};
use crate::types::UserOperationRequest;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
#[cfg(test)]
use mockall::automock;
use serde_json::Value;

/// Paymaster fields returned by a paymaster service, per EntryPoint version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PaymasterFields {
    /// v0.6
    pub paymaster_and_data: Option<Bytes>,
    /// v0.7
    pub paymaster: Option<Address>,
    pub paymaster_data: Option<Bytes>,
    pub paymaster_verification_gas_limit: Option<U256>,
    pub paymaster_post_op_gas_limit: Option<U256>,
}

/// A source of paymaster data (sponsorship, ERC-20 gas, ...).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PaymasterProvider: Send + Sync {
    /// Placeholder data good enough for gas estimation.
    async fn stub_data(
        &self,
        request: &UserOperationRequest,
        entry_point: &EntryPointDef,
    ) -> Result<PaymasterFields>;

    /// Final, signed paymaster data for the estimated operation.
    async fn paymaster_data(
        &self,
        request: &UserOperationRequest,
        entry_point: &EntryPointDef,
    ) -> Result<PaymasterFields>;
}

/// ERC-7677 `context` argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymasterContext {
    /// Gas sponsored under a policy.
    Sponsor {
        policy_id: String,
        webhook_data: Option<String>,
    },
    /// Gas paid in an ERC-20 token.
    Erc20 {
        policy_id: String,
        token: Address,
        max_token_amount: Option<U256>,
    },
}

impl PaymasterContext {
    pub fn to_json(&self) -> Value {
        match self {
            PaymasterContext::Sponsor {
                policy_id,
                webhook_data,
            } => {
                let mut ctx = serde_json::json!({ "policyId": policy_id });
                if let (Some(wd), Some(obj)) = (webhook_data, ctx.as_object_mut()) {
                    obj.insert("webhookData".to_string(), Value::String(wd.clone()));
                }
                ctx
            }
            PaymasterContext::Erc20 {
                policy_id,
                token,
                max_token_amount,
            } => {
                let mut erc20 = serde_json::json!({
                    "tokenAddress": encoding::fmt_address(*token),
                });
                if let (Some(max), Some(obj)) = (max_token_amount, erc20.as_object_mut()) {
                    obj.insert(
                        "maxTokenAmount".to_string(),
                        Value::String(encoding::fmt_u256(*max)),
                    );
                }
                serde_json::json!({ "policyId": policy_id, "erc20": erc20 })
            }
        }
    }
}

/// ERC-7677 paymaster web service client (`pm_getPaymasterStubData` / `pm_getPaymasterData`).
#[derive(Debug, Clone)]
pub struct PaymasterClient {
    transport: JsonRpcTransport,
    context: PaymasterContext,
}

impl PaymasterClient {
    pub fn new(url: String, context: PaymasterContext) -> Self {
        Self {
            transport: JsonRpcTransport::new(url),
            context,
        }
    }

    async fn call(
        &self,
        method: &str,
        request: &UserOperationRequest,
        entry_point: &EntryPointDef,
    ) -> Result<PaymasterFields> {
        let params = serde_json::json!([
            request.to_json(),
            encoding::fmt_address(entry_point.address),
            encoding::fmt_u256(U256::from(entry_point.chain_id)),
            self.context.to_json(),
        ]);
        let res = self
            .transport
            .request(method, params, &RequestContext::default())
            .await?;
        Ok(parse_paymaster_response(&res, entry_point.version)
            .with_context(|| format!("invalid {method} response"))?)
    }
}

#[async_trait]
impl PaymasterProvider for PaymasterClient {
    async fn stub_data(
        &self,
        request: &UserOperationRequest,
        entry_point: &EntryPointDef,
    ) -> Result<PaymasterFields> {
        self.call("pm_getPaymasterStubData", request, entry_point)
            .await
    }

    async fn paymaster_data(
        &self,
        request: &UserOperationRequest,
        entry_point: &EntryPointDef,
    ) -> Result<PaymasterFields> {
        self.call("pm_getPaymasterData", request, entry_point).await
    }
}

fn parse_paymaster_response(
    result: &Value,
    version: EntryPointVersion,
) -> anyhow::Result<PaymasterFields> {
    // ERC-7677 returns fields at the top level. Some vendors wrap them per
    // version: { "entrypointV06Response": {...}, "entrypointV07Response": {...} }.
    let (marker, nested) = match version {
        EntryPointVersion::V06 => (
            "paymasterAndData",
            ["entrypointV06Response", "entryPointV06Response"],
        ),
        EntryPointVersion::V07 => (
            "paymaster",
            ["entrypointV07Response", "entryPointV07Response"],
        ),
    };

    let body = if result.get(marker).is_some() {
        result
    } else {
        nested
            .iter()
            .find_map(|k| result.get(*k))
            .ok_or_else(|| anyhow!("missing {marker} (expected top-level or {})", nested[0]))?
    };

    let str_field = |key: &str| body.get(key).and_then(Value::as_str);

    match version {
        EntryPointVersion::V06 => {
            let pmd = str_field("paymasterAndData")
                .ok_or_else(|| anyhow!("missing paymasterAndData field"))?;
            Ok(PaymasterFields {
                paymaster_and_data: Some(parse_bytes(pmd).context("invalid hex in paymasterAndData")?),
                ..Default::default()
            })
        }
        EntryPointVersion::V07 => {
            let paymaster = str_field("paymaster")
                .ok_or_else(|| anyhow!("missing paymaster field"))?;
            let data = str_field("paymasterData").unwrap_or("0x");
            Ok(PaymasterFields {
                paymaster_and_data: None,
                paymaster: Some(parse_address(paymaster)?),
                paymaster_data: Some(parse_bytes(data).context("invalid hex in paymasterData")?),
                paymaster_verification_gas_limit: str_field("paymasterVerificationGasLimit")
                    .map(parse_u256_quantity)
                    .transpose()?,
                paymaster_post_op_gas_limit: str_field("paymasterPostOpGasLimit")
                    .map(parse_u256_quantity)
                    .transpose()?,
            })
        }
    }
}
