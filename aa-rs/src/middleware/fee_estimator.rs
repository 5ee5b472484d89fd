use super::{MiddlewareContext, UserOperationMiddleware};
use crate::bundler::BundlerRpc;
use crate::error::Result;
use crate::fees::resolve_field;
use crate::types::UserOperationStruct;
use async_trait::async_trait;
use std::sync::Arc;

/// `maxPriorityFeePerGas` from the bundler's estimate, `maxFeePerGas` from
/// the latest base fee plus that priority fee.
pub struct FeeEstimatorMiddleware {
    bundler: Arc<dyn BundlerRpc>,
}

impl FeeEstimatorMiddleware {
    pub fn new(bundler: Arc<dyn BundlerRpc>) -> Self {
        Self { bundler }
    }
}

#[async_trait]
impl UserOperationMiddleware for FeeEstimatorMiddleware {
    fn name(&self) -> &'static str {
        "feeEstimator"
    }

    async fn process(
        &self,
        mut uo: UserOperationStruct,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<UserOperationStruct> {
        let (base_fee, priority_fee) = tokio::try_join!(
            self.bundler.latest_base_fee(),
            self.bundler.max_priority_fee_per_gas()
        )?;

        let max_priority_fee_per_gas = resolve_field(
            priority_fee,
            ctx.overrides.max_priority_fee_per_gas,
            ctx.fee_options.max_priority_fee_per_gas.as_ref(),
        );
        let max_fee_per_gas = resolve_field(
            base_fee.saturating_add(max_priority_fee_per_gas),
            ctx.overrides.max_fee_per_gas,
            ctx.fee_options.max_fee_per_gas.as_ref(),
        );
        tracing::debug!(%base_fee, %priority_fee, %max_fee_per_gas, %max_priority_fee_per_gas, "fees resolved");

        uo.max_fee_per_gas = Some(max_fee_per_gas);
        uo.max_priority_fee_per_gas = Some(max_priority_fee_per_gas);
        Ok(uo)
    }
}
