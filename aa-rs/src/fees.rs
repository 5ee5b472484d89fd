use crate::error::{AaError, Result};
use ethers::types::{U256, U512};
use serde::{Deserialize, Serialize};

/// Multipliers are applied in fixed point with 4 decimals.
const MULTIPLIER_SCALE: u64 = 10_000;

/// A positive scaling factor with at most 4 decimals (e.g. `1.05`).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Multiplier(f64);

impl Multiplier {
    pub fn new(value: f64) -> Result<Self> {
        let scaled = value * MULTIPLIER_SCALE as f64;
        if !value.is_finite() || value <= 0.0 || (scaled - scaled.round()).abs() > 1e-6 {
            return Err(AaError::InvalidMultiplier(value));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    fn scaled(&self) -> u64 {
        (self.0 * MULTIPLIER_SCALE as f64).round() as u64
    }

    /// `round(value * multiplier)`, rounding half up, saturating at `U256::MAX`.
    pub fn apply(&self, value: U256) -> U256 {
        let product = value.full_mul(U256::from(self.scaled()));
        let rounded = (product + U512::from(MULTIPLIER_SCALE / 2)) / U512::from(MULTIPLIER_SCALE);
        U256::try_from(rounded).unwrap_or(U256::MAX)
    }
}

impl TryFrom<f64> for Multiplier {
    type Error = AaError;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Multiplier> for f64 {
    fn from(m: Multiplier) -> f64 {
        m.0
    }
}

/// Per-field fee policy, used only when the caller gave no override.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeeOptionField {
    /// Scale the estimate, then clamp into `[min, max]`.
    Multiplier {
        multiplier: Multiplier,
        #[serde(default)]
        min: Option<U256>,
        #[serde(default)]
        max: Option<U256>,
    },
    /// Use this value regardless of the estimate.
    Literal(U256),
}

impl FeeOptionField {
    pub fn multiplier(value: f64) -> Result<Self> {
        Ok(FeeOptionField::Multiplier {
            multiplier: Multiplier::new(value)?,
            min: None,
            max: None,
        })
    }

    pub fn apply(&self, estimate: U256) -> U256 {
        match self {
            FeeOptionField::Literal(v) => *v,
            FeeOptionField::Multiplier {
                multiplier,
                min,
                max,
            } => {
                let mut v = multiplier.apply(estimate);
                if let Some(min) = min {
                    v = v.max(*min);
                }
                if let Some(max) = max {
                    v = v.min(*max);
                }
                v
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeOptions {
    pub call_gas_limit: Option<FeeOptionField>,
    pub verification_gas_limit: Option<FeeOptionField>,
    pub pre_verification_gas: Option<FeeOptionField>,
    pub max_fee_per_gas: Option<FeeOptionField>,
    pub max_priority_fee_per_gas: Option<FeeOptionField>,
    pub paymaster_verification_gas_limit: Option<FeeOptionField>,
    pub paymaster_post_op_gas_limit: Option<FeeOptionField>,
}

/// Chains whose preVerificationGas depends on the L1 data fee and moves between estimate and inclusion.
const L1_DATA_FEE_CHAINS: &[u64] = &[
    10, 420, 11155420, // optimism
    8453, 84531, 84532, // base
    42161, 42170, 421613, 421614, // arbitrum
];

impl FeeOptions {
    /// Default fee policy for `chain_id`.
    pub fn chain_default(chain_id: u64) -> Self {
        let m = |v: f64| FeeOptionField::Multiplier {
            multiplier: Multiplier(v),
            min: None,
            max: None,
        };
        Self {
            max_fee_per_gas: Some(m(1.5)),
            max_priority_fee_per_gas: Some(m(1.05)),
            pre_verification_gas: L1_DATA_FEE_CHAINS.contains(&chain_id).then(|| m(1.05)),
            ..Default::default()
        }
    }
}

/// Resolves one numeric field.
///
/// An exact override wins outright. Otherwise a configured fee option is
/// applied to the estimate. Otherwise the estimate is used as is.
pub fn resolve_field(
    estimate: U256,
    override_value: Option<U256>,
    fee_option: Option<&FeeOptionField>,
) -> U256 {
    if let Some(v) = override_value {
        return v;
    }
    match fee_option {
        Some(option) => option.apply(estimate),
        None => estimate,
    }
}
