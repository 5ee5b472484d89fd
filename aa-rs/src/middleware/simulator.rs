use super::{MiddlewareContext, UserOperationMiddleware};
use crate::bundler::BundlerRpc;
use crate::error::Result;
use crate::types::UserOperationStruct;
use async_trait::async_trait;
use std::sync::Arc;

/// Simulates the estimated operation and fails the pipeline if the simulation reports an error.
pub struct UserOperationSimulatorMiddleware {
    bundler: Arc<dyn BundlerRpc>,
}

impl UserOperationSimulatorMiddleware {
    pub fn new(bundler: Arc<dyn BundlerRpc>) -> Self {
        Self { bundler }
    }
}

#[async_trait]
impl UserOperationMiddleware for UserOperationSimulatorMiddleware {
    fn name(&self) -> &'static str {
        "userOperationSimulator"
    }

    async fn process(
        &self,
        uo: UserOperationStruct,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<UserOperationStruct> {
        let changes = self
            .bundler
            .simulate_user_operation(&uo.to_estimation_request(), ctx.entry_point().address)
            .await?;
        tracing::debug!(sender = ?uo.sender, %changes, "simulated user operation");
        Ok(uo)
    }
}
