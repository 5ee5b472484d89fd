use super::{MiddlewareContext, UserOperationMiddleware};
use crate::bundler::BundlerRpc;
use crate::error::Result;
use crate::fees::resolve_field;
use crate::types::{UserOperationStruct, VersionFields};
use async_trait::async_trait;
use std::sync::Arc;

/// Fills the three gas limits (plus the v0.7 paymaster limits) from `eth_estimateUserOperationGas`.
pub struct GasEstimatorMiddleware {
    bundler: Arc<dyn BundlerRpc>,
}

impl GasEstimatorMiddleware {
    pub fn new(bundler: Arc<dyn BundlerRpc>) -> Self {
        Self { bundler }
    }
}

#[async_trait]
impl UserOperationMiddleware for GasEstimatorMiddleware {
    fn name(&self) -> &'static str {
        "gasEstimator"
    }

    async fn process(
        &self,
        mut uo: UserOperationStruct,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<UserOperationStruct> {
        let request = uo.to_estimation_request();
        let estimates = self
            .bundler
            .estimate_user_operation_gas(&request, ctx.entry_point().address)
            .await?;

        let (overrides, fee_options) = (ctx.overrides, ctx.fee_options);
        uo.call_gas_limit = Some(resolve_field(
            estimates.call_gas_limit,
            overrides.call_gas_limit,
            fee_options.call_gas_limit.as_ref(),
        ));
        uo.verification_gas_limit = Some(resolve_field(
            estimates.verification_gas_limit,
            overrides.verification_gas_limit,
            fee_options.verification_gas_limit.as_ref(),
        ));
        uo.pre_verification_gas = Some(resolve_field(
            estimates.pre_verification_gas,
            overrides.pre_verification_gas,
            fee_options.pre_verification_gas.as_ref(),
        ));

        if let VersionFields::V07 {
            paymaster: Some(_),
            paymaster_verification_gas_limit,
            paymaster_post_op_gas_limit,
            ..
        } = &mut uo.version_fields
        {
            let pvgl = estimates
                .paymaster_verification_gas_limit
                .or(*paymaster_verification_gas_limit)
                .unwrap_or_default();
            *paymaster_verification_gas_limit = Some(resolve_field(
                pvgl,
                overrides.paymaster_verification_gas_limit,
                fee_options.paymaster_verification_gas_limit.as_ref(),
            ));
            let ppogl = estimates
                .paymaster_post_op_gas_limit
                .or(*paymaster_post_op_gas_limit)
                .unwrap_or_default();
            *paymaster_post_op_gas_limit = Some(resolve_field(
                ppogl,
                overrides.paymaster_post_op_gas_limit,
                fee_options.paymaster_post_op_gas_limit.as_ref(),
            ));
        }

        tracing::debug!(
            call_gas_limit = ?uo.call_gas_limit,
            verification_gas_limit = ?uo.verification_gas_limit,
            pre_verification_gas = ?uo.pre_verification_gas,
            "gas resolved"
        );
        Ok(uo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::tests::StaticAccount;
    use crate::account::SmartAccount;
    use crate::bundler::{GasEstimates, MockBundlerRpc};
    use crate::entrypoint::EntryPointVersion;
    use crate::fees::{FeeOptionField, FeeOptions};
    use crate::middleware::tests::fresh_struct;
    use crate::types::UserOperationOverrides;
    use ethers::types::{Address, Bytes, U256};

    #[tokio::test]
    async fn estimates_with_dummy_signature_and_applies_precedence() {
        let account = StaticAccount::new(EntryPointVersion::V06);
        let dummy = account.dummy_signature();
        let mut bundler = MockBundlerRpc::new();
        bundler
            .expect_estimate_user_operation_gas()
            .times(1)
            .returning(move |req, _| {
                assert_eq!(req.signature(), &dummy);
                Ok(GasEstimates {
                    call_gas_limit: U256::from(100),
                    verification_gas_limit: U256::from(200),
                    pre_verification_gas: U256::from(300),
                    paymaster_verification_gas_limit: None,
                    paymaster_post_op_gas_limit: None,
                })
            });

        let overrides = UserOperationOverrides {
            verification_gas_limit: Some(U256::from(999)),
            ..Default::default()
        };
        let fee_options = FeeOptions {
            call_gas_limit: Some(FeeOptionField::multiplier(1.5).unwrap()),
            verification_gas_limit: Some(FeeOptionField::multiplier(3.0).unwrap()),
            ..Default::default()
        };
        let ctx = MiddlewareContext {
            account: &account,
            overrides: &overrides,
            fee_options: &fee_options,
        };
        let uo = GasEstimatorMiddleware::new(Arc::new(bundler))
            .process(fresh_struct(&account), &ctx)
            .await
            .unwrap();
        assert_eq!(uo.call_gas_limit, Some(U256::from(150)));
        assert_eq!(uo.verification_gas_limit, Some(U256::from(999)));
        assert_eq!(uo.pre_verification_gas, Some(U256::from(300)));
    }

    #[tokio::test]
    async fn v07_paymaster_limits_are_resolved() {
        let account = StaticAccount::new(EntryPointVersion::V07);
        let mut bundler = MockBundlerRpc::new();
        bundler.expect_estimate_user_operation_gas().returning(|_, _| {
            Ok(GasEstimates {
                call_gas_limit: U256::from(1),
                verification_gas_limit: U256::from(2),
                pre_verification_gas: U256::from(3),
                paymaster_verification_gas_limit: Some(U256::from(0x4000)),
                paymaster_post_op_gas_limit: None,
            })
        });

        let mut uo = fresh_struct(&account);
        if let VersionFields::V07 {
            paymaster,
            paymaster_data,
            paymaster_verification_gas_limit,
            paymaster_post_op_gas_limit,
            ..
        } = &mut uo.version_fields
        {
            *paymaster = Some(Address::repeat_byte(0xaa));
            *paymaster_data = Some(Bytes::new());
            *paymaster_verification_gas_limit = Some(U256::from(1));
            *paymaster_post_op_gas_limit = Some(U256::from(0x200));
        }

        let fee_options = FeeOptions {
            paymaster_post_op_gas_limit: Some(FeeOptionField::multiplier(2.0).unwrap()),
            ..Default::default()
        };
        let ctx = MiddlewareContext {
            account: &account,
            overrides: &UserOperationOverrides::default(),
            fee_options: &fee_options,
        };
        let uo = GasEstimatorMiddleware::new(Arc::new(bundler))
            .process(uo, &ctx)
            .await
            .unwrap();
        match uo.version_fields {
            VersionFields::V07 {
                paymaster_verification_gas_limit,
                paymaster_post_op_gas_limit,
                ..
            } => {
                assert_eq!(paymaster_verification_gas_limit, Some(U256::from(0x4000)));
                assert_eq!(paymaster_post_op_gas_limit, Some(U256::from(0x400)));
            }
            _ => panic!("expected v0.7 fields"),
        }
    }

    #[tokio::test]
    async fn v07_post_op_limit_prefers_bundler_estimate() {
        let account = StaticAccount::new(EntryPointVersion::V07);
        let mut bundler = MockBundlerRpc::new();
        bundler.expect_estimate_user_operation_gas().returning(|_, _| {
            Ok(GasEstimates {
                call_gas_limit: U256::from(1),
                verification_gas_limit: U256::from(2),
                pre_verification_gas: U256::from(3),
                paymaster_verification_gas_limit: Some(U256::from(0x4000)),
                paymaster_post_op_gas_limit: Some(U256::from(0x1d4c0)),
            })
        });

        let mut uo = fresh_struct(&account);
        if let VersionFields::V07 {
            paymaster,
            paymaster_data,
            paymaster_post_op_gas_limit,
            ..
        } = &mut uo.version_fields
        {
            *paymaster = Some(Address::repeat_byte(0xaa));
            *paymaster_data = Some(Bytes::new());
            // stub value from the dummy paymaster stage
            *paymaster_post_op_gas_limit = Some(U256::from(0x200));
        }

        let ctx = MiddlewareContext {
            account: &account,
            overrides: &UserOperationOverrides::default(),
            fee_options: &FeeOptions::default(),
        };
        let uo = GasEstimatorMiddleware::new(Arc::new(bundler))
            .process(uo, &ctx)
            .await
            .unwrap();
        match uo.version_fields {
            VersionFields::V07 {
                paymaster_post_op_gas_limit,
                ..
            } => assert_eq!(paymaster_post_op_gas_limit, Some(U256::from(0x1d4c0))),
            _ => panic!("expected v0.7 fields"),
        }
    }
}
