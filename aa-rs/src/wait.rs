use crate::bundler::BundlerRpc;
use crate::error::{AaError, Result};
use crate::types::{SendResult, UserOperationReceipt};
use async_trait::async_trait;
use ethers::types::H256;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Polling policy for [`ConfirmationTracker`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WaitConfig {
    /// Number of receipt polls before giving up.
    pub tx_max_retries: u32,
    /// Delay before the first poll.
    pub tx_retry_interval: Duration,
    /// Growth factor of the delay between consecutive polls.
    pub tx_retry_multiplier: f64,
    /// Upper bound (exclusive) of the random delay added to every poll.
    pub max_jitter: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            tx_max_retries: 5,
            tx_retry_interval: Duration::from_millis(2_000),
            tx_retry_multiplier: 1.5,
            max_jitter: Duration::from_millis(100),
        }
    }
}

impl WaitConfig {
    /// `tx_retry_interval * tx_retry_multiplier^attempt`, without jitter.
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let secs = self.tx_retry_interval.as_secs_f64()
            * self
                .tx_retry_multiplier
                .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub trait Jitter: Send + Sync {
    /// A delay in `[0, max)`.
    fn jitter(&self, max: Duration) -> Duration;
}

pub struct RandJitter;

impl Jitter for RandJitter {
    fn jitter(&self, max: Duration) -> Duration {
        if max.is_zero() {
            return Duration::ZERO;
        }
        rand::thread_rng().gen_range(Duration::ZERO..max)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmationState {
    /// `attempt` polls have come back empty so far.
    Pending { attempt: u32 },
    Mined(Box<UserOperationReceipt>),
    /// Retries exhausted without a receipt.
    Dropped { attempts: u32 },
}

/// Polls the bundler for a user operation receipt with exponential backoff and jitter.
pub struct ConfirmationTracker {
    bundler: Arc<dyn BundlerRpc>,
    config: WaitConfig,
    sleeper: Arc<dyn Sleeper>,
    jitter: Arc<dyn Jitter>,
}

impl ConfirmationTracker {
    pub fn new(bundler: Arc<dyn BundlerRpc>, config: WaitConfig) -> Self {
        Self {
            bundler,
            config,
            sleeper: Arc::new(TokioSleeper),
            jitter: Arc::new(RandJitter),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn config(&self) -> &WaitConfig {
        &self.config
    }

    /// Advances one state. Only `Pending` does any work.
    pub async fn step(&self, hash: H256, state: ConfirmationState) -> ConfirmationState {
        let attempt = match state {
            ConfirmationState::Pending { attempt } => attempt,
            done => return done,
        };
        if attempt >= self.config.tx_max_retries {
            return ConfirmationState::Dropped { attempts: attempt };
        }

        let delay = self
            .config
            .retry_interval(attempt)
            .saturating_add(self.jitter.jitter(self.config.max_jitter));
        self.sleeper.sleep(delay).await;

        match self.bundler.get_user_operation_receipt(hash).await {
            Ok(Some(receipt)) => ConfirmationState::Mined(Box::new(receipt)),
            Ok(None) => ConfirmationState::Pending {
                attempt: attempt + 1,
            },
            Err(error) => {
                tracing::warn!(%error, ?hash, attempt, "failed to fetch user operation receipt");
                ConfirmationState::Pending {
                    attempt: attempt + 1,
                }
            }
        }
    }

    /// Runs the state machine to completion: `Mined` or `Dropped`.
    pub async fn track(&self, hash: H256) -> ConfirmationState {
        let mut state = ConfirmationState::Pending { attempt: 0 };
        loop {
            state = match self.step(hash, state).await {
                pending @ ConfirmationState::Pending { .. } => pending,
                done => return done,
            };
        }
    }

    /// Transaction hash that included `sent`.
    ///
    /// On exhaustion the error carries `sent.request` unchanged so it can be dropped and replaced.
    pub async fn wait(&self, sent: &SendResult) -> Result<H256> {
        match self.track(sent.hash).await {
            ConfirmationState::Mined(receipt) => {
                tracing::info!(
                    user_op_hash = ?sent.hash,
                    tx_hash = ?receipt.receipt.transaction_hash,
                    success = receipt.success,
                    "user operation mined"
                );
                Ok(receipt.receipt.transaction_hash)
            }
            _ => Err(AaError::WaitForUserOperation {
                hash: sent.hash,
                request: Box::new(sent.request.clone()),
            }),
        }
    }
}
