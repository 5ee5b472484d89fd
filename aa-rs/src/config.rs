use crate::entrypoint::{EntryPointDef, EntryPointVersion};
use crate::paymaster::PaymasterContext;
use crate::wait::WaitConfig;
use anyhow::{anyhow, Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::{env, fs, path::Path, time::Duration};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfigRaw {
    pub chain_id: u64,
    pub rpc: String,
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    pub bundler_url: String,
    #[serde(default)]
    pub bundler_url_env_var: Option<String>,
    #[serde(default = "default_entry_point_version")]
    pub entry_point_version: String,
    #[serde(default)]
    pub entry_point_address: Option<String>,
    pub factory: String,
    #[serde(default)]
    pub paymaster: Option<PaymasterConfigRaw>,
    /// Run asset-change simulation before signing.
    #[serde(default)]
    pub simulate: bool,
    /// Sign under the account's EIP-712 domain with this primary type instead of `personal_sign`.
    #[serde(default)]
    pub typed_data_primary_type: Option<String>,

    #[serde(default)]
    pub tx_max_retries: Option<u32>,
    #[serde(default)]
    pub tx_retry_interval_ms: Option<u64>,
    #[serde(default)]
    pub tx_retry_multiplier: Option<f64>,
    #[serde(default)]
    pub max_jitter_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymasterConfigRaw {
    pub url: String,
    pub policy_id: String,
    #[serde(default)]
    pub webhook_data: Option<String>,
    /// Pay gas in this ERC-20 instead of sponsoring.
    #[serde(default)]
    pub erc20_token: Option<String>,
}

fn default_entry_point_version() -> String {
    "0.7.0".to_string()
}

#[derive(Debug, Clone)]
pub struct PaymasterConfig {
    pub url: String,
    pub context: PaymasterContext,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub bundler_url: String,
    pub entry_point: EntryPointDef,
    pub factory: Address,
    pub paymaster: Option<PaymasterConfig>,
    pub simulate: bool,
    pub typed_data_primary_type: Option<String>,
    pub wait: WaitConfig,
}

/// Values that win over the file (and its env vars), typically CLI flags.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub rpc_url: Option<String>,
    pub bundler_url: Option<String>,
}

pub fn load_config(path: &Path, overrides: ConfigOverrides) -> Result<ClientConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read client config at {}", path.display()))?;
    let raw: ClientConfigRaw = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse client config at {}", path.display()))?;
    resolve_config(raw, overrides)
}

pub fn resolve_config(raw: ClientConfigRaw, overrides: ConfigOverrides) -> Result<ClientConfig> {
    let rpc_url = pick_url(overrides.rpc_url, raw.rpc_env_var.as_deref(), &raw.rpc);
    let bundler_url = pick_url(
        overrides.bundler_url,
        raw.bundler_url_env_var.as_deref(),
        &raw.bundler_url,
    );

    let version: EntryPointVersion = raw
        .entry_point_version
        .parse()
        .map_err(|e| anyhow!("{e}"))?;
    let entry_point = match raw.entry_point_address.as_deref() {
        Some(addr) => EntryPointDef::custom(
            raw.chain_id,
            version,
            parse_addr(addr).context("invalid entryPointAddress")?,
        ),
        None => EntryPointDef::for_chain(raw.chain_id, version).map_err(|e| anyhow!("{e}"))?,
    };
    let factory = parse_addr(&raw.factory).context("invalid factory address")?;

    let paymaster = raw
        .paymaster
        .map(|pm| -> Result<PaymasterConfig> {
            let context = match pm.erc20_token {
                Some(token) => PaymasterContext::Erc20 {
                    policy_id: pm.policy_id,
                    token: parse_addr(&token).context("invalid paymaster erc20Token")?,
                    max_token_amount: None,
                },
                None => PaymasterContext::Sponsor {
                    policy_id: pm.policy_id,
                    webhook_data: pm.webhook_data,
                },
            };
            Ok(PaymasterConfig {
                url: pm.url,
                context,
            })
        })
        .transpose()?;

    let defaults = WaitConfig::default();
    let wait = WaitConfig {
        tx_max_retries: raw.tx_max_retries.unwrap_or(defaults.tx_max_retries),
        tx_retry_interval: raw
            .tx_retry_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.tx_retry_interval),
        tx_retry_multiplier: raw
            .tx_retry_multiplier
            .unwrap_or(defaults.tx_retry_multiplier),
        max_jitter: raw
            .max_jitter_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_jitter),
    };
    if !(wait.tx_retry_multiplier.is_finite() && wait.tx_retry_multiplier > 0.0) {
        return Err(anyhow!(
            "txRetryMultiplier must be positive, got {}",
            wait.tx_retry_multiplier
        ));
    }

    Ok(ClientConfig {
        chain_id: raw.chain_id,
        rpc_url,
        bundler_url,
        entry_point,
        factory,
        paymaster,
        simulate: raw.simulate,
        typed_data_primary_type: raw.typed_data_primary_type,
        wait,
    })
}

fn pick_url(flag: Option<String>, env_var: Option<&str>, file_value: &str) -> String {
    if let Some(url) = flag {
        url
    } else if let Some(env_var) = env_var {
        env::var(env_var).unwrap_or_else(|_| file_value.to_string())
    } else {
        file_value.to_string()
    }
}

fn parse_addr(s: &str) -> Result<Address> {
    s.parse::<Address>().map_err(|e| anyhow!("{e}"))
}
