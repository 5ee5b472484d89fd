use aa_userop::account::{SimpleAccount, SmartAccount};
use aa_userop::bundler::{BundlerClient, BundlerRpc};
use aa_userop::client::SmartAccountClient;
use aa_userop::config::{load_config, ClientConfig, ConfigOverrides};
use aa_userop::encoding;
use aa_userop::error::AaError;
use aa_userop::middleware::MiddlewareChain;
use aa_userop::paymaster::{PaymasterClient, PaymasterProvider};
use aa_userop::types::{
    Call, SendResult, UserOperationCallData, UserOperationOverrides, UserOperationRequest,
};
use aa_userop::wait::{ConfirmationState, ConfirmationTracker};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::prelude::*;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// In --json mode stdout carries a single JSON object; human-readable output goes to stderr.
macro_rules! outln {
    ($machine_mode:expr, $($arg:tt)*) => {{
        if $machine_mode {
            eprintln!($($arg)*);
        } else {
            println!($($arg)*);
        }
    }};
}

#[derive(Parser, Debug)]
#[command(name = "aa-userop", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the counterfactual smart account address (and deployment status).
    Account(AccountArgs),

    /// Print the EntryPoint hash of a user operation JSON file.
    Hash(HashArgs),

    /// Build, sign and send a user operation making one call.
    Send(SendArgs),

    /// Poll the bundler for a user operation receipt.
    Wait(WaitArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Client config (chain, RPC, bundler, EntryPoint, factory, paymaster).
    #[arg(long, default_value = "aa-userop.json")]
    config: PathBuf,

    /// Override the chain RPC URL.
    #[arg(long, env = "AA_USEROP_RPC_URL")]
    rpc: Option<String>,

    /// Override the bundler RPC URL.
    #[arg(long, env = "AA_USEROP_BUNDLER_URL")]
    bundler: Option<String>,

    /// Print a single JSON object to stdout. All other output goes to stderr.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct OwnerArgs {
    /// Smart account owner private key.
    #[arg(long, env = "AA_USEROP_OWNER_PRIVATE_KEY", hide_env_values = true)]
    owner_private_key: String,

    /// CREATE2 salt for the smart account.
    #[arg(long, default_value_t = 0)]
    salt: u64,
}

#[derive(Args, Debug)]
struct AccountArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    owner: OwnerArgs,
}

#[derive(Args, Debug)]
struct HashArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// JSON file holding a v0.6 or v0.7 user operation.
    #[arg(long)]
    user_op: PathBuf,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    owner: OwnerArgs,

    /// Call target.
    #[arg(long)]
    to: Address,

    /// Value in wei.
    #[arg(long, default_value = "0")]
    value: String,

    /// Calldata for the target.
    #[arg(long, default_value = "0x")]
    data: String,

    /// Sponsor gas through the paymaster in the config.
    #[arg(long, default_value_t = false)]
    sponsor_gas: bool,

    /// Exact maxFeePerGas (wei). Skips the fee estimate for this field.
    #[arg(long)]
    max_fee_per_gas: Option<String>,

    /// Exact maxPriorityFeePerGas (wei).
    #[arg(long)]
    max_priority_fee_per_gas: Option<String>,

    /// Build and sign, print, but do not send.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Do not wait for the receipt.
    #[arg(long, default_value_t = false)]
    no_wait: bool,

    /// If the operation is not mined in time, resubmit it once with bumped fees.
    #[arg(long, default_value_t = false)]
    replace_on_drop: bool,
}

#[derive(Args, Debug)]
struct WaitArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// User operation hash.
    #[arg(long)]
    hash: H256,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Always write logs to stderr so stdout can be used for script-friendly outputs.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Account(args) => cmd_account(args).await,
        Command::Hash(args) => cmd_hash(args),
        Command::Send(args) => cmd_send(args).await,
        Command::Wait(args) => cmd_wait(args).await,
    }
}

fn load(common: &CommonArgs) -> Result<ClientConfig> {
    load_config(
        &common.config,
        ConfigOverrides {
            rpc_url: common.rpc.clone(),
            bundler_url: common.bundler.clone(),
        },
    )
}

async fn connect_provider(cfg: &ClientConfig) -> Result<Arc<Provider<Http>>> {
    let provider =
        Provider::<Http>::try_from(cfg.rpc_url.as_str())?.interval(Duration::from_millis(350));
    let chain_id = provider.get_chainid().await?.as_u64();
    if chain_id != cfg.chain_id {
        return Err(anyhow!(
            "chainId mismatch: config has {}, RPC returned {}",
            cfg.chain_id,
            chain_id
        ));
    }
    Ok(Arc::new(provider))
}

async fn connect_account(
    cfg: &ClientConfig,
    owner: &OwnerArgs,
) -> Result<SimpleAccount<Provider<Http>>> {
    let provider = connect_provider(cfg).await?;
    let wallet = owner
        .owner_private_key
        .trim()
        .parse::<LocalWallet>()
        .context("invalid owner private key")?
        .with_chain_id(cfg.chain_id);
    let account = SimpleAccount::connect(
        provider,
        Arc::new(wallet),
        cfg.entry_point.clone(),
        cfg.factory,
        U256::from(owner.salt),
    )
    .await?;
    match cfg.typed_data_primary_type.as_deref() {
        Some(primary_type) => Ok(account.with_account_typed_data(primary_type).await?),
        None => Ok(account),
    }
}

async fn cmd_account(args: AccountArgs) -> Result<()> {
    let cfg = load(&args.common)?;
    let machine_mode = args.common.json;
    let account = connect_account(&cfg, &args.owner).await?;
    let deployed = account.is_deployed().await?;

    if machine_mode {
        let out = serde_json::json!({
            "owner": encoding::fmt_address(account.owner()),
            "smartAccount": encoding::fmt_address(account.address()),
            "isDeployed": deployed,
        });
        println!("{}", out);
    }

    outln!(machine_mode, "chainId:        {}", cfg.chain_id);
    outln!(
        machine_mode,
        "entryPoint:     {} ({})",
        encoding::fmt_address(cfg.entry_point.address),
        cfg.entry_point.version
    );
    outln!(machine_mode, "factory:        {}", encoding::fmt_address(cfg.factory));
    outln!(machine_mode, "owner:          {}", encoding::fmt_address(account.owner()));
    outln!(machine_mode, "smartAccount:   {}", encoding::fmt_address(account.address()));
    outln!(machine_mode, "isDeployed:     {}", deployed);

    Ok(())
}

fn cmd_hash(args: HashArgs) -> Result<()> {
    let cfg = load(&args.common)?;
    let raw = fs::read_to_string(&args.user_op)
        .with_context(|| format!("failed to read {}", args.user_op.display()))?;
    let request = UserOperationRequest::from_json(serde_json::from_str(&raw)?)?;
    if request.version() != cfg.entry_point.version {
        return Err(anyhow!(
            "user operation is {}, config EntryPoint is {}",
            request.version(),
            cfg.entry_point.version
        ));
    }
    let hash = cfg.entry_point.hash(&request)?;

    if args.common.json {
        println!("{}", serde_json::json!({ "userOpHash": encoding::fmt_h256(hash) }));
    } else {
        println!("{}", encoding::fmt_h256(hash));
    }
    Ok(())
}

async fn cmd_send(args: SendArgs) -> Result<()> {
    let cfg = load(&args.common)?;
    let machine_mode = args.common.json;

    let account: Arc<dyn SmartAccount> = Arc::new(connect_account(&cfg, &args.owner).await?);
    let bundler: Arc<dyn BundlerRpc> =
        Arc::new(BundlerClient::new(cfg.bundler_url.clone()).with_breadcrumb("aa-userop-cli"));

    let paymaster: Option<Arc<dyn PaymasterProvider>> = if args.sponsor_gas {
        let pm = cfg
            .paymaster
            .clone()
            .ok_or_else(|| anyhow!("--sponsor-gas requires a paymaster section in the config"))?;
        Some(Arc::new(PaymasterClient::new(pm.url, pm.context)))
    } else {
        None
    };

    let mut middleware = MiddlewareChain::new(bundler.clone(), paymaster);
    if cfg.simulate {
        middleware = middleware.with_simulator(bundler.clone());
    }
    let client = SmartAccountClient::new(bundler, cfg.chain_id, middleware)
    .with_account(account)
    .with_wait_config(cfg.wait);
    client.check_entry_point_supported(None).await?;

    let calls = UserOperationCallData::Single(Call {
        target: args.to,
        value: parse_u256_arg(&args.value).context("invalid --value")?,
        data: encoding::parse_bytes(&args.data).context("invalid --data")?,
    });
    let overrides = UserOperationOverrides {
        max_fee_per_gas: args
            .max_fee_per_gas
            .as_deref()
            .map(parse_u256_arg)
            .transpose()
            .context("invalid --max-fee-per-gas")?,
        max_priority_fee_per_gas: args
            .max_priority_fee_per_gas
            .as_deref()
            .map(parse_u256_arg)
            .transpose()
            .context("invalid --max-priority-fee-per-gas")?,
        ..Default::default()
    };

    let uo = client.build_user_operation(&calls, &overrides, None).await?;
    let request = client.sign_user_operation(uo, None).await?;
    outln!(
        machine_mode,
        "\nUserOperation (final):\n{}",
        serde_json::to_string_pretty(&request.to_json())?
    );

    if args.dry_run {
        outln!(machine_mode, "\n--dry-run set: not sending user operation.");
        return Ok(());
    }

    let mut sent = client.send_raw_user_operation(request, None).await?;
    outln!(machine_mode, "\nuserOpHash: {}", encoding::fmt_h256(sent.hash));

    if args.no_wait {
        outln!(machine_mode, "--no-wait set: not waiting for receipt.");
        print_result(machine_mode, &sent, None);
        return Ok(());
    }

    let tx_hash = match client.wait_for_user_operation_transaction(&sent).await {
        Ok(tx) => tx,
        Err(err @ AaError::WaitForUserOperation { .. }) if args.replace_on_drop => {
            let dropped = err
                .dropped_request()
                .cloned()
                .ok_or_else(|| anyhow!("wait error without the submitted request"))?;
            tracing::warn!(user_op_hash = ?sent.hash, "not mined in time, replacing with bumped fees");
            sent = client
                .drop_and_replace_user_operation(&dropped, &overrides, None)
                .await?;
            outln!(machine_mode, "replacement userOpHash: {}", encoding::fmt_h256(sent.hash));
            client.wait_for_user_operation_transaction(&sent).await?
        }
        Err(err) => return Err(err.into()),
    };

    outln!(machine_mode, "transactionHash: {}", encoding::fmt_h256(tx_hash));
    print_result(machine_mode, &sent, Some(tx_hash));
    Ok(())
}

async fn cmd_wait(args: WaitArgs) -> Result<()> {
    let cfg = load(&args.common)?;
    let machine_mode = args.common.json;
    let bundler: Arc<dyn BundlerRpc> =
        Arc::new(BundlerClient::new(cfg.bundler_url.clone()).with_breadcrumb("aa-userop-cli"));
    let tracker = ConfirmationTracker::new(bundler, cfg.wait);

    match tracker.track(args.hash).await {
        ConfirmationState::Mined(receipt) => {
            if machine_mode {
                println!("{}", serde_json::to_string(&receipt)?);
            }
            outln!(
                machine_mode,
                "UserOp receipt:\n{}",
                serde_json::to_string_pretty(&receipt)?
            );
            Ok(())
        }
        ConfirmationState::Dropped { attempts } => Err(anyhow!(
            "no receipt for {} after {} attempts",
            encoding::fmt_h256(args.hash),
            attempts
        )),
        ConfirmationState::Pending { .. } => Err(anyhow!("tracker stopped while pending")),
    }
}

fn print_result(machine_mode: bool, sent: &SendResult, tx_hash: Option<H256>) {
    if machine_mode {
        let out = serde_json::json!({
            "userOpHash": encoding::fmt_h256(sent.hash),
            "sender": encoding::fmt_address(sent.request.sender()),
            "nonce": encoding::fmt_u256(sent.request.nonce()),
            "transactionHash": tx_hash.map(encoding::fmt_h256),
        });
        println!("{}", out);
    }
}

/// Decimal or 0x-prefixed hex.
fn parse_u256_arg(s: &str) -> Result<U256> {
    let s = s.trim();
    if s.starts_with("0x") {
        encoding::parse_u256_quantity(s)
    } else {
        U256::from_dec_str(s).map_err(|e| anyhow!("{e}"))
    }
}
