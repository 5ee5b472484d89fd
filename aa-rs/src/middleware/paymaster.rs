use super::{apply_paymaster_fields, MiddlewareContext, UserOperationMiddleware};
use crate::error::Result;
use crate::paymaster::PaymasterProvider;
use crate::types::UserOperationStruct;
use async_trait::async_trait;
use std::sync::Arc;

/// Replaces the stub with final paymaster data once gas is known.
pub struct PaymasterAndDataMiddleware {
    paymaster: Option<Arc<dyn PaymasterProvider>>,
}

impl PaymasterAndDataMiddleware {
    pub fn new(paymaster: Option<Arc<dyn PaymasterProvider>>) -> Self {
        Self { paymaster }
    }
}

#[async_trait]
impl UserOperationMiddleware for PaymasterAndDataMiddleware {
    fn name(&self) -> &'static str {
        "paymasterAndData"
    }

    async fn process(
        &self,
        mut uo: UserOperationStruct,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<UserOperationStruct> {
        let Some(paymaster) = &self.paymaster else {
            return Ok(uo);
        };
        if ctx.overrides.bypass_paymaster() {
            return Ok(uo);
        }

        let fields = paymaster
            .paymaster_data(&uo.to_estimation_request(), ctx.entry_point())
            .await?;
        apply_paymaster_fields(&mut uo, fields);
        Ok(uo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::tests::StaticAccount;
    use crate::entrypoint::EntryPointVersion;
    use crate::fees::FeeOptions;
    use crate::middleware::tests::fresh_struct;
    use crate::paymaster::{MockPaymasterProvider, PaymasterFields};
    use crate::types::{UserOperationOverrides, VersionFields};
    use ethers::types::{Bytes, U256};

    #[tokio::test]
    async fn final_data_is_requested_with_estimated_gas() {
        let mut paymaster = MockPaymasterProvider::new();
        paymaster
            .expect_paymaster_data()
            .times(1)
            .returning(|req, _| {
                assert_eq!(req.gas_values().max_fee_per_gas, U256::from(42));
                Ok(PaymasterFields {
                    paymaster_and_data: Some(Bytes::from(vec![0xde, 0xad])),
                    ..Default::default()
                })
            });
        let account = StaticAccount::new(EntryPointVersion::V06);
        let ctx = MiddlewareContext {
            account: &account,
            overrides: &UserOperationOverrides::default(),
            fee_options: &FeeOptions::default(),
        };
        let mut uo = fresh_struct(&account);
        uo.max_fee_per_gas = Some(U256::from(42));

        let uo = PaymasterAndDataMiddleware::new(Some(Arc::new(paymaster)))
            .process(uo, &ctx)
            .await
            .unwrap();
        assert_eq!(
            uo.version_fields,
            VersionFields::V06 {
                init_code: Some(Bytes::new()),
                paymaster_and_data: Some(Bytes::from(vec![0xde, 0xad])),
            }
        );
    }

    #[tokio::test]
    async fn no_provider_is_a_no_op() {
        let account = StaticAccount::new(EntryPointVersion::V07);
        let ctx = MiddlewareContext {
            account: &account,
            overrides: &UserOperationOverrides::default(),
            fee_options: &FeeOptions::default(),
        };
        let uo = fresh_struct(&account);
        let out = PaymasterAndDataMiddleware::new(None)
            .process(uo.clone(), &ctx)
            .await
            .unwrap();
        assert_eq!(out, uo);
    }
}
