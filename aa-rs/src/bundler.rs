use crate::encoding::{fmt_address, fmt_h256, parse_h256, parse_u256_quantity};
use crate::error::Result;
use crate::rpc::{rpc_error, JsonRpcTransport, RequestContext};
use crate::types::{UserOperationByHash, UserOperationReceipt, UserOperationRequest};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
#[cfg(test)]
use mockall::automock;
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GasEstimates {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    /// Only returned for v0.7 operations that carry a paymaster.
    pub paymaster_verification_gas_limit: Option<U256>,
    pub paymaster_post_op_gas_limit: Option<U256>,
}

/// The bundler (and node) JSON-RPC surface the pipeline depends on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundlerRpc: Send + Sync {
    async fn estimate_user_operation_gas(
        &self,
        request: &UserOperationRequest,
        entry_point: Address,
    ) -> Result<GasEstimates>;

    async fn send_user_operation(
        &self,
        request: &UserOperationRequest,
        entry_point: Address,
    ) -> Result<H256>;

    /// `Ok(None)` while the operation has not been included.
    async fn get_user_operation_receipt(&self, hash: H256) -> Result<Option<UserOperationReceipt>>;

    async fn get_user_operation_by_hash(&self, hash: H256) -> Result<Option<UserOperationByHash>>;

    async fn supported_entry_points(&self) -> Result<Vec<Address>>;

    /// `rundler_maxPriorityFeePerGas`
    async fn max_priority_fee_per_gas(&self) -> Result<U256>;

    /// `baseFeePerGas` of the latest block.
    async fn latest_base_fee(&self) -> Result<U256>;

    /// `alchemy_simulateUserOperationAssetChanges`
    async fn simulate_user_operation(
        &self,
        request: &UserOperationRequest,
        entry_point: Address,
    ) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct BundlerClient {
    transport: JsonRpcTransport,
    ctx: RequestContext,
}

impl BundlerClient {
    pub fn new(url: String) -> Self {
        Self {
            transport: JsonRpcTransport::new(url),
            ctx: RequestContext::default(),
        }
    }

    /// Copy of this client whose requests carry `crumb` in the breadcrumb header.
    pub fn with_breadcrumb(&self, crumb: &str) -> Self {
        Self {
            transport: self.transport.clone(),
            ctx: self.ctx.with_breadcrumb(crumb),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        self.transport.request(method, params, &self.ctx).await
    }
}

#[async_trait]
impl BundlerRpc for BundlerClient {
    async fn estimate_user_operation_gas(
        &self,
        request: &UserOperationRequest,
        entry_point: Address,
    ) -> Result<GasEstimates> {
        let params = serde_json::json!([request.to_json(), fmt_address(entry_point)]);
        let res = self.rpc("eth_estimateUserOperationGas", params).await?;
        Ok(parse_gas_estimates(&res)?)
    }

    async fn send_user_operation(
        &self,
        request: &UserOperationRequest,
        entry_point: Address,
    ) -> Result<H256> {
        let params = serde_json::json!([request.to_json(), fmt_address(entry_point)]);
        let res = self.rpc("eth_sendUserOperation", params).await?;
        Ok(parse_userop_hash(&res)?)
    }

    async fn get_user_operation_receipt(&self, hash: H256) -> Result<Option<UserOperationReceipt>> {
        let res = self
            .rpc("eth_getUserOperationReceipt", serde_json::json!([fmt_h256(hash)]))
            .await?;
        if res.is_null() {
            return Ok(None);
        }
        let receipt = serde_json::from_value(res).context("invalid user operation receipt")?;
        Ok(Some(receipt))
    }

    async fn get_user_operation_by_hash(&self, hash: H256) -> Result<Option<UserOperationByHash>> {
        let res = self
            .rpc("eth_getUserOperationByHash", serde_json::json!([fmt_h256(hash)]))
            .await?;
        if res.is_null() {
            return Ok(None);
        }
        let found = serde_json::from_value(res).context("invalid user operation lookup result")?;
        Ok(Some(found))
    }

    async fn supported_entry_points(&self) -> Result<Vec<Address>> {
        let res = self
            .rpc("eth_supportedEntryPoints", serde_json::json!([]))
            .await?;
        let addrs = serde_json::from_value(res).context("invalid eth_supportedEntryPoints result")?;
        Ok(addrs)
    }

    async fn max_priority_fee_per_gas(&self) -> Result<U256> {
        let res = self
            .rpc("rundler_maxPriorityFeePerGas", serde_json::json!([]))
            .await?;
        let s = res
            .as_str()
            .ok_or_else(|| anyhow!("rundler_maxPriorityFeePerGas returned {res}"))?;
        Ok(parse_u256_quantity(s)?)
    }

    async fn latest_base_fee(&self) -> Result<U256> {
        let block = self
            .rpc("eth_getBlockByNumber", serde_json::json!(["latest", false]))
            .await?;
        Ok(parse_u256_field(&block, "baseFeePerGas")
            .context("latest block has no baseFeePerGas")?)
    }

    async fn simulate_user_operation(
        &self,
        request: &UserOperationRequest,
        entry_point: Address,
    ) -> Result<Value> {
        let method = "alchemy_simulateUserOperationAssetChanges";
        let params = serde_json::json!([request.to_json(), fmt_address(entry_point)]);
        let res = self.rpc(method, params).await?;
        if let Some(err) = res.get("error").filter(|e| !e.is_null()) {
            return Err(rpc_error(method, err));
        }
        Ok(res)
    }
}

fn parse_u256_field(v: &Value, key: &str) -> anyhow::Result<U256> {
    let s = v
        .get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow!("missing or invalid field {key}"))?;
    parse_u256_quantity(s)
}

fn parse_gas_estimates(res: &Value) -> anyhow::Result<GasEstimates> {
    let optional = |key: &str| {
        res.get(key)
            .filter(|v| !v.is_null())
            .map(|v| {
                v.as_str()
                    .ok_or_else(|| anyhow!("invalid field {key}: {v}"))
                    .and_then(parse_u256_quantity)
            })
            .transpose()
    };
    Ok(GasEstimates {
        call_gas_limit: parse_u256_field(res, "callGasLimit")?,
        verification_gas_limit: parse_u256_field(res, "verificationGasLimit")?,
        pre_verification_gas: parse_u256_field(res, "preVerificationGas")?,
        paymaster_verification_gas_limit: optional("paymasterVerificationGasLimit")?,
        paymaster_post_op_gas_limit: optional("paymasterPostOpGasLimit")?,
    })
}

fn parse_userop_hash(res: &Value) -> anyhow::Result<H256> {
    // Most bundlers return the userOpHash directly as a JSON string; some wrap it.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOperationHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(anyhow!(
            "unexpected eth_sendUserOperation result shape (expected string or {{result: ...}}): {}",
            res
        ));
    };

    parse_h256(hash_str)
}

#[cfg(test)]
mod tests {
    use super::{parse_gas_estimates, parse_u256_field, parse_userop_hash};
    use crate::encoding::parse_h256;
    use crate::types::UserOperationReceipt;
    use ethers::types::U256;
    use serde_json::json;

    const HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    #[test]
    fn parse_userop_hash_from_string() {
        let res = json!(HASH);
        let hash = parse_userop_hash(&res).unwrap();
        assert_eq!(hash, parse_h256(HASH).unwrap());
    }

    #[test]
    fn parse_userop_hash_from_wrapped_objects() {
        for key in ["result", "userOpHash", "userOperationHash"] {
            let mut res = json!({});
            res[key] = json!(HASH);
            let hash = parse_userop_hash(&res).unwrap();
            assert_eq!(hash, parse_h256(HASH).unwrap());
        }
    }

    #[test]
    fn parse_userop_hash_rejects_unknown_shape() {
        let res = json!({ "foo": "bar" });
        assert!(parse_userop_hash(&res).is_err());
    }

    #[test]
    fn parse_gas_fields_as_quantities() {
        let res = json!({ "callGasLimit": "0x5208", "preVerificationGas": 21000 });
        assert_eq!(
            parse_u256_field(&res, "callGasLimit").unwrap(),
            U256::from(21_000u64)
        );
        // numeric JSON is not a valid quantity
        assert!(parse_u256_field(&res, "preVerificationGas").is_err());
    }

    #[test]
    fn gas_estimates_keep_paymaster_limits_when_present() {
        let res = json!({
            "callGasLimit": "0x7530",
            "verificationGasLimit": "0x186a0",
            "preVerificationGas": "0xc350",
            "paymasterVerificationGasLimit": "0x30000",
            "paymasterPostOpGasLimit": "0x1d4c0"
        });
        let est = parse_gas_estimates(&res).unwrap();
        assert_eq!(est.call_gas_limit, U256::from(30_000u64));
        assert_eq!(est.paymaster_verification_gas_limit, Some(U256::from(0x30000u64)));
        assert_eq!(est.paymaster_post_op_gas_limit, Some(U256::from(120_000u64)));

        let res = json!({
            "callGasLimit": "0x7530",
            "verificationGasLimit": "0x186a0",
            "preVerificationGas": "0xc350",
            "paymasterPostOpGasLimit": null
        });
        let est = parse_gas_estimates(&res).unwrap();
        assert_eq!(est.paymaster_verification_gas_limit, None);
        assert_eq!(est.paymaster_post_op_gas_limit, None);

        let res = json!({
            "callGasLimit": "0x7530",
            "verificationGasLimit": "0x186a0",
            "preVerificationGas": "0xc350",
            "paymasterPostOpGasLimit": 5
        });
        assert!(parse_gas_estimates(&res).is_err());
    }

    #[test]
    fn receipt_parses_with_nested_transaction_hash() {
        let receipt: UserOperationReceipt = serde_json::from_value(json!({
            "userOpHash": HASH,
            "sender": "0x1306b01bc3e4ad202612d3843387e94737673f53",
            "nonce": "0x1",
            "actualGasCost": "0x10",
            "actualGasUsed": "0x20",
            "success": true,
            "logs": [],
            "receipt": { "transactionHash": HASH, "blockNumber": "0x10" }
        }))
        .unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.receipt.transaction_hash, parse_h256(HASH).unwrap());
        assert_eq!(receipt.receipt.block_number, Some(U256::from(16)));
    }
}
