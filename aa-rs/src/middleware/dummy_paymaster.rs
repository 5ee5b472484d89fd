use super::{apply_paymaster_fields, paymaster_override_fields, MiddlewareContext, UserOperationMiddleware};
use crate::error::Result;
use crate::paymaster::{PaymasterFields, PaymasterProvider};
use crate::types::UserOperationStruct;
use async_trait::async_trait;
use std::sync::Arc;

/// Puts placeholder paymaster data on the operation so gas estimation simulates the paid path.
pub struct DummyPaymasterDataMiddleware {
    paymaster: Option<Arc<dyn PaymasterProvider>>,
}

impl DummyPaymasterDataMiddleware {
    pub fn new(paymaster: Option<Arc<dyn PaymasterProvider>>) -> Self {
        Self { paymaster }
    }
}

#[async_trait]
impl UserOperationMiddleware for DummyPaymasterDataMiddleware {
    fn name(&self) -> &'static str {
        "dummyPaymasterData"
    }

    async fn process(
        &self,
        mut uo: UserOperationStruct,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<UserOperationStruct> {
        let fields = match &self.paymaster {
            _ if ctx.overrides.bypass_paymaster() => paymaster_override_fields(ctx.overrides),
            Some(paymaster) => {
                paymaster
                    .stub_data(&uo.to_estimation_request(), ctx.entry_point())
                    .await?
            }
            None => PaymasterFields::default(),
        };
        apply_paymaster_fields(&mut uo, fields);
        Ok(uo)
    }
}
