use crate::account::SmartAccount;
use crate::bundler::BundlerRpc;
use crate::error::{AaError, Result};
use crate::fees::{FeeOptions, Multiplier};
use crate::middleware::{MiddlewareChain, MiddlewareContext};
use crate::types::{
    SendResult, UserOperationByHash, UserOperationCallData, UserOperationOverrides,
    UserOperationReceipt, UserOperationRequest, UserOperationStruct,
};
use crate::wait::{ConfirmationTracker, WaitConfig};
use ethers::types::{Address, H256};
use std::sync::Arc;

/// Minimum fee bump for a replacement to be accepted over the original.
const DROP_AND_REPLACE_FEE_BUMP: f64 = 1.1;

/// Drives the pipeline: build, sign, send, wait, and drop-and-replace.
pub struct SmartAccountClient {
    bundler: Arc<dyn BundlerRpc>,
    chain_id: u64,
    middleware: MiddlewareChain,
    fee_options: FeeOptions,
    tracker: ConfirmationTracker,
    account: Option<Arc<dyn SmartAccount>>,
}

impl SmartAccountClient {
    /// Client with the chain's default fee options and default polling.
    pub fn new(bundler: Arc<dyn BundlerRpc>, chain_id: u64, middleware: MiddlewareChain) -> Self {
        Self {
            tracker: ConfirmationTracker::new(bundler.clone(), WaitConfig::default()),
            bundler,
            chain_id,
            middleware,
            fee_options: FeeOptions::chain_default(chain_id),
            account: None,
        }
    }

    pub fn with_account(mut self, account: Arc<dyn SmartAccount>) -> Self {
        self.account = Some(account);
        self
    }

    pub fn with_fee_options(mut self, fee_options: FeeOptions) -> Self {
        self.fee_options = fee_options;
        self
    }

    pub fn with_wait_config(mut self, config: WaitConfig) -> Self {
        self.tracker = ConfirmationTracker::new(self.bundler.clone(), config);
        self
    }

    pub fn with_tracker(mut self, tracker: ConfirmationTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// The explicit account, else the connected one.
    fn resolve_account<'a>(
        &'a self,
        account: Option<&'a dyn SmartAccount>,
    ) -> Result<&'a dyn SmartAccount> {
        account
            .or(self.account.as_deref())
            .ok_or(AaError::AccountNotFound)
    }

    fn check_chain(&self, action: &'static str, account: &dyn SmartAccount) -> Result<()> {
        let ep_chain = account.entry_point().chain_id;
        if ep_chain != self.chain_id {
            return Err(AaError::IncompatibleClient {
                action,
                reason: format!(
                    "account EntryPoint is on chain {ep_chain}, client is on chain {}",
                    self.chain_id
                ),
            });
        }
        Ok(())
    }

    /// Builds and fully estimates an unsigned operation.
    pub async fn build_user_operation(
        &self,
        calls: &UserOperationCallData,
        overrides: &UserOperationOverrides,
        account: Option<&dyn SmartAccount>,
    ) -> Result<UserOperationStruct> {
        let account = self.resolve_account(account)?;
        self.check_chain("buildUserOperation", account)?;

        let call_data = account.encode_calls(calls)?;
        let (nonce, factory) = tokio::try_join!(
            account.nonce(overrides.nonce_key.unwrap_or_default()),
            account.init_factory()
        )?;
        let uo = UserOperationStruct::new(
            account.entry_point().version,
            account.address(),
            nonce,
            call_data,
            factory,
            account.dummy_signature(),
        );
        self.run_middleware(uo, overrides, account).await
    }

    async fn run_middleware(
        &self,
        uo: UserOperationStruct,
        overrides: &UserOperationOverrides,
        account: &dyn SmartAccount,
    ) -> Result<UserOperationStruct> {
        let ctx = MiddlewareContext {
            account,
            overrides,
            fee_options: &self.fee_options,
        };
        self.middleware.run(uo, &ctx).await
    }

    /// Validates the struct, hashes it for the account's EntryPoint and signs the hash.
    pub async fn sign_user_operation(
        &self,
        uo: UserOperationStruct,
        account: Option<&dyn SmartAccount>,
    ) -> Result<UserOperationRequest> {
        let account = self.resolve_account(account)?;
        let mut request = uo.into_request()?;
        let hash = account.entry_point().hash(&request)?;
        let signature = account.sign_user_operation_hash(hash).await?;
        request.set_signature(signature);
        Ok(request)
    }

    /// Submits an already-signed request.
    pub async fn send_raw_user_operation(
        &self,
        request: UserOperationRequest,
        account: Option<&dyn SmartAccount>,
    ) -> Result<SendResult> {
        let account = self.resolve_account(account)?;
        let entry_point = account.entry_point();
        if request.version() != entry_point.version {
            return Err(AaError::EntryPointMismatch {
                address: entry_point.address,
                version: request.version().to_string(),
            });
        }

        let hash = self
            .bundler
            .send_user_operation(&request, entry_point.address)
            .await?;
        tracing::info!(
            user_op_hash = ?hash,
            sender = ?request.sender(),
            nonce = %request.nonce(),
            "user operation sent"
        );
        Ok(SendResult { hash, request })
    }

    /// Build, sign and send.
    pub async fn send_user_operation(
        &self,
        calls: &UserOperationCallData,
        overrides: &UserOperationOverrides,
        account: Option<&dyn SmartAccount>,
    ) -> Result<SendResult> {
        let uo = self.build_user_operation(calls, overrides, account).await?;
        let request = self.sign_user_operation(uo, account).await?;
        self.send_raw_user_operation(request, account).await
    }

    /// Polls until `sent` is mined and returns its transaction hash.
    pub async fn wait_for_user_operation_transaction(&self, sent: &SendResult) -> Result<H256> {
        self.tracker.wait(sent).await
    }

    /// Resubmits the intent of `uo_to_drop` (same sender, nonce and calldata) with fees
    /// of at least 110% of the original, so the bundler replaces it.
    pub async fn drop_and_replace_user_operation(
        &self,
        uo_to_drop: &UserOperationRequest,
        overrides: &UserOperationOverrides,
        account: Option<&dyn SmartAccount>,
    ) -> Result<SendResult> {
        let account = self.resolve_account(account)?;
        self.check_chain("dropAndReplaceUserOperation", account)?;
        if uo_to_drop.sender() != account.address() {
            return Err(AaError::IncompatibleClient {
                action: "dropAndReplaceUserOperation",
                reason: format!(
                    "operation sender {:?} is not account {:?}",
                    uo_to_drop.sender(),
                    account.address()
                ),
            });
        }

        let uo = UserOperationStruct::from_request_intent(uo_to_drop, account.dummy_signature());
        let ctx = MiddlewareContext {
            account,
            overrides,
            fee_options: &self.fee_options,
        };
        let market = self.middleware.estimate_fees(uo.clone(), &ctx).await?;

        let bump = Multiplier::new(DROP_AND_REPLACE_FEE_BUMP)?;
        let old = uo_to_drop.gas_values();
        let bumped = UserOperationOverrides {
            max_fee_per_gas: Some(
                market
                    .max_fee_per_gas
                    .unwrap_or_default()
                    .max(bump.apply(old.max_fee_per_gas)),
            ),
            max_priority_fee_per_gas: Some(
                market
                    .max_priority_fee_per_gas
                    .unwrap_or_default()
                    .max(bump.apply(old.max_priority_fee_per_gas)),
            ),
            ..overrides.clone()
        };
        tracing::info!(
            sender = ?uo_to_drop.sender(),
            nonce = %uo_to_drop.nonce(),
            max_fee_per_gas = ?bumped.max_fee_per_gas,
            max_priority_fee_per_gas = ?bumped.max_priority_fee_per_gas,
            "replacing user operation"
        );

        let uo = self.run_middleware(uo, &bumped, account).await?;
        let request = self.sign_user_operation(uo, Some(account)).await?;
        self.send_raw_user_operation(request, Some(account)).await
    }

    pub async fn get_user_operation_by_hash(&self, hash: H256) -> Result<Option<UserOperationByHash>> {
        self.bundler.get_user_operation_by_hash(hash).await
    }

    pub async fn get_user_operation_receipt(&self, hash: H256) -> Result<Option<UserOperationReceipt>> {
        self.bundler.get_user_operation_receipt(hash).await
    }

    pub async fn get_supported_entry_points(&self) -> Result<Vec<Address>> {
        self.bundler.supported_entry_points().await
    }

    /// Fails with `IncompatibleClient` unless the bundler serves the account's EntryPoint on this chain.
    pub async fn check_entry_point_supported(&self, account: Option<&dyn SmartAccount>) -> Result<()> {
        let account = self.resolve_account(account)?;
        self.check_chain("checkEntryPointSupported", account)?;
        let entry_point = account.entry_point();
        let supported = self.bundler.supported_entry_points().await?;
        if !supported.contains(&entry_point.address) {
            return Err(AaError::IncompatibleClient {
                action: "checkEntryPointSupported",
                reason: format!(
                    "bundler does not support EntryPoint {} at {:?}",
                    entry_point.version, entry_point.address
                ),
            });
        }
        Ok(())
    }
}
