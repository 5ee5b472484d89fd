mod dummy_paymaster;
mod fee_estimator;
mod gas_estimator;
mod paymaster;
mod simulator;

pub use dummy_paymaster::DummyPaymasterDataMiddleware;
pub use fee_estimator::FeeEstimatorMiddleware;
pub use gas_estimator::GasEstimatorMiddleware;
pub use paymaster::PaymasterAndDataMiddleware;
pub use simulator::UserOperationSimulatorMiddleware;

use crate::account::SmartAccount;
use crate::bundler::BundlerRpc;
use crate::entrypoint::EntryPointDef;
use crate::error::Result;
use crate::fees::FeeOptions;
use crate::paymaster::{PaymasterFields, PaymasterProvider};
use crate::types::{UserOperationOverrides, UserOperationStruct, VersionFields};
use async_trait::async_trait;
use ethers::types::Bytes;
use std::sync::Arc;

/// Inputs every stage sees for one pipeline run.
pub struct MiddlewareContext<'a> {
    pub account: &'a dyn SmartAccount,
    pub overrides: &'a UserOperationOverrides,
    pub fee_options: &'a FeeOptions,
}

impl MiddlewareContext<'_> {
    pub fn entry_point(&self) -> &EntryPointDef {
        self.account.entry_point()
    }
}

/// One step of the pipeline: takes the partially built operation and returns it with more fields filled.
#[async_trait]
pub trait UserOperationMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(
        &self,
        uo: UserOperationStruct,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<UserOperationStruct>;
}

/// Ordered stages: dummy paymaster data, fees, gas, paymaster data, simulation, custom.
///
/// Overrides are applied once more after the last stage so an exact caller value always survives.
pub struct MiddlewareChain {
    pub dummy_paymaster: Arc<dyn UserOperationMiddleware>,
    pub fee_estimator: Arc<dyn UserOperationMiddleware>,
    pub gas_estimator: Arc<dyn UserOperationMiddleware>,
    pub paymaster: Arc<dyn UserOperationMiddleware>,
    pub simulator: Option<Arc<dyn UserOperationMiddleware>>,
    pub custom: Vec<Arc<dyn UserOperationMiddleware>>,
}

impl MiddlewareChain {
    pub fn new(
        bundler: Arc<dyn BundlerRpc>,
        paymaster: Option<Arc<dyn PaymasterProvider>>,
    ) -> Self {
        Self {
            dummy_paymaster: Arc::new(DummyPaymasterDataMiddleware::new(paymaster.clone())),
            fee_estimator: Arc::new(FeeEstimatorMiddleware::new(bundler.clone())),
            gas_estimator: Arc::new(GasEstimatorMiddleware::new(bundler)),
            paymaster: Arc::new(PaymasterAndDataMiddleware::new(paymaster)),
            simulator: None,
            custom: Vec::new(),
        }
    }

    pub fn with_simulator(mut self, bundler: Arc<dyn BundlerRpc>) -> Self {
        self.simulator = Some(Arc::new(UserOperationSimulatorMiddleware::new(bundler)));
        self
    }

    pub fn with_custom(mut self, middleware: Arc<dyn UserOperationMiddleware>) -> Self {
        self.custom.push(middleware);
        self
    }

    fn stages(&self) -> impl Iterator<Item = &Arc<dyn UserOperationMiddleware>> {
        [
            &self.dummy_paymaster,
            &self.fee_estimator,
            &self.gas_estimator,
            &self.paymaster,
        ]
        .into_iter()
        .chain(self.simulator.iter())
        .chain(self.custom.iter())
    }

    pub async fn run(
        &self,
        mut uo: UserOperationStruct,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<UserOperationStruct> {
        for stage in self.stages() {
            tracing::debug!(stage = stage.name(), sender = ?uo.sender, "running middleware");
            uo = stage.process(uo, ctx).await?;
        }
        Ok(apply_overrides(uo, ctx.overrides))
    }

    /// Runs only the fee stage, for repricing an already-submitted operation.
    pub async fn estimate_fees(
        &self,
        uo: UserOperationStruct,
        ctx: &MiddlewareContext<'_>,
    ) -> Result<UserOperationStruct> {
        self.fee_estimator.process(uo, ctx).await
    }
}

/// Writes every field the caller pinned, verbatim.
pub fn apply_overrides(
    mut uo: UserOperationStruct,
    overrides: &UserOperationOverrides,
) -> UserOperationStruct {
    let pin = |slot: &mut Option<_>, v: &Option<_>| {
        if v.is_some() {
            *slot = *v;
        }
    };
    pin(&mut uo.call_gas_limit, &overrides.call_gas_limit);
    pin(&mut uo.verification_gas_limit, &overrides.verification_gas_limit);
    pin(&mut uo.pre_verification_gas, &overrides.pre_verification_gas);
    pin(&mut uo.max_fee_per_gas, &overrides.max_fee_per_gas);
    pin(
        &mut uo.max_priority_fee_per_gas,
        &overrides.max_priority_fee_per_gas,
    );

    if let VersionFields::V07 {
        paymaster_verification_gas_limit,
        paymaster_post_op_gas_limit,
        paymaster,
        ..
    } = &mut uo.version_fields
    {
        // Paymaster gas limits only exist alongside a paymaster.
        if paymaster.is_some() {
            pin(
                paymaster_verification_gas_limit,
                &overrides.paymaster_verification_gas_limit,
            );
            pin(
                paymaster_post_op_gas_limit,
                &overrides.paymaster_post_op_gas_limit,
            );
        }
    }

    if overrides.bypass_paymaster() {
        apply_paymaster_fields(&mut uo, paymaster_override_fields(overrides));
    }
    uo
}

/// Paymaster fields taken from the overrides; an empty `0x` means the account pays its own gas.
pub(crate) fn paymaster_override_fields(overrides: &UserOperationOverrides) -> PaymasterFields {
    let own_gas = overrides.paymaster.is_none()
        && overrides
            .paymaster_data
            .as_ref()
            .map_or(true, |d| d.is_empty());
    PaymasterFields {
        paymaster_and_data: Some(overrides.paymaster_and_data.clone().unwrap_or_default()),
        paymaster: if own_gas { None } else { overrides.paymaster },
        paymaster_data: if own_gas {
            None
        } else {
            overrides.paymaster_data.clone()
        },
        paymaster_verification_gas_limit: overrides.paymaster_verification_gas_limit,
        paymaster_post_op_gas_limit: overrides.paymaster_post_op_gas_limit,
    }
}

/// Copies the fields relevant to the operation's version into it.
pub(crate) fn apply_paymaster_fields(uo: &mut UserOperationStruct, fields: PaymasterFields) {
    match &mut uo.version_fields {
        VersionFields::V06 {
            paymaster_and_data,
            ..
        } => {
            *paymaster_and_data = Some(fields.paymaster_and_data.unwrap_or_else(Bytes::new));
        }
        VersionFields::V07 {
            paymaster,
            paymaster_data,
            paymaster_verification_gas_limit,
            paymaster_post_op_gas_limit,
            ..
        } => match fields.paymaster {
            Some(addr) => {
                *paymaster = Some(addr);
                *paymaster_data = Some(fields.paymaster_data.unwrap_or_default());
                *paymaster_verification_gas_limit = fields
                    .paymaster_verification_gas_limit
                    .or(*paymaster_verification_gas_limit)
                    .or(Some(Default::default()));
                *paymaster_post_op_gas_limit = fields
                    .paymaster_post_op_gas_limit
                    .or(*paymaster_post_op_gas_limit)
                    .or(Some(Default::default()));
            }
            None => {
                *paymaster = None;
                *paymaster_data = None;
                *paymaster_verification_gas_limit = None;
                *paymaster_post_op_gas_limit = None;
            }
        },
    }
}
