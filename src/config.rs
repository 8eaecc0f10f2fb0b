use crate::chain::POLYGON_START_BLOCK;
use crate::rpc::RpcSettings;
use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub rpc_timeout: Duration,
    pub rpc_max_retries: u32,
    pub rpc_backoff: Duration,
    pub rpc_max_concurrent: usize,
    pub rpc_min_interval: Duration,
    pub start_block: u64,
    pub batch_blocks: u64,
    pub ingest_workers: usize,
    pub rebuild_workers: usize,
    pub data_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub min_join_coverage: f64,
    pub usdc_only_ctf_txs: bool,
}

/// Parse an optional variable; present-but-invalid is an error.
fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has invalid value {:?}: {}", name, raw, e)),
        _ => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chain_id: 137,
            rpc_urls: vec!["https://polygon-rpc.com".to_string()],
            rpc_timeout: Duration::from_secs(15),
            rpc_max_retries: 5,
            rpc_backoff: Duration::from_millis(500),
            rpc_max_concurrent: 4,
            rpc_min_interval: Duration::from_millis(50),
            start_block: POLYGON_START_BLOCK,
            batch_blocks: 20_000,
            ingest_workers: 8,
            rebuild_workers: 8,
            data_dir: PathBuf::from("data"),
            checkpoint_dir: PathBuf::from("data").join("checkpoints"),
            min_join_coverage: 0.5,
            usdc_only_ctf_txs: true,
        }
    }
}

impl Config {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Config {
            checkpoint_dir: data_dir.join("checkpoints"),
            data_dir,
            ..Config::default()
        }
    }

    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let d = Config::default();

        let chain_id: u64 = parse_var("CHAIN_ID", d.chain_id)?;

        let rpc_urls: Vec<String> = env::var("RPC_URLS")
            .or_else(|_| env::var("RPC_URL"))
            .unwrap_or_else(|_| {
                if chain_id == 80002 {
                    "https://rpc-amoy.polygon.technology".to_string()
                } else {
                    d.rpc_urls.join(",")
                }
            })
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if rpc_urls.is_empty() {
            bail!("RPC_URLS is set but contains no endpoints");
        }

        let timeout_secs: u64 = parse_var("RPC_TIMEOUT_SECS", d.rpc_timeout.as_secs())?;
        let rpc_max_retries: u32 = parse_var("RPC_MAX_RETRIES", d.rpc_max_retries)?;
        let backoff_ms: u64 = parse_var("RPC_BACKOFF_MS", d.rpc_backoff.as_millis() as u64)?;
        let rpc_max_concurrent: usize = parse_var("RPC_MAX_CONCURRENT", d.rpc_max_concurrent)?;
        let min_interval_ms: u64 =
            parse_var("RPC_MIN_INTERVAL_MS", d.rpc_min_interval.as_millis() as u64)?;

        let start_block: u64 = parse_var("START_BLOCK", d.start_block)?;
        let batch_blocks: u64 = parse_var("BATCH_BLOCKS", d.batch_blocks)?;
        if batch_blocks == 0 {
            bail!("BATCH_BLOCKS must be positive");
        }
        let ingest_workers: usize = parse_var("INGEST_WORKERS", d.ingest_workers)?;
        let rebuild_workers: usize = parse_var("REBUILD_WORKERS", d.rebuild_workers)?;
        if ingest_workers == 0 || rebuild_workers == 0 {
            bail!("INGEST_WORKERS and REBUILD_WORKERS must be positive");
        }

        let base = env::current_dir().context("resolve working directory")?;
        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base.join(&d.data_dir));
        let checkpoint_dir = env::var("CHECKPOINT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("checkpoints"));

        let min_join_coverage: f64 = parse_var("MIN_JOIN_COVERAGE", d.min_join_coverage)?;
        if !(0.0..=1.0).contains(&min_join_coverage) {
            bail!("MIN_JOIN_COVERAGE must be within 0..=1");
        }
        let usdc_only_ctf_txs: bool = parse_var("USDC_ONLY_CTF_TXS", d.usdc_only_ctf_txs)?;

        Ok(Config {
            chain_id,
            rpc_urls,
            rpc_timeout: Duration::from_secs(timeout_secs.clamp(5, 30)),
            rpc_max_retries,
            rpc_backoff: Duration::from_millis(backoff_ms),
            rpc_max_concurrent: rpc_max_concurrent.max(1),
            rpc_min_interval: Duration::from_millis(min_interval_ms),
            start_block,
            batch_blocks,
            ingest_workers,
            rebuild_workers,
            data_dir,
            checkpoint_dir,
            min_join_coverage,
            usdc_only_ctf_txs,
        })
    }

    pub fn rpc_settings(&self) -> RpcSettings {
        RpcSettings {
            endpoints: self.rpc_urls.clone(),
            timeout: self.rpc_timeout,
            max_retries: self.rpc_max_retries,
            backoff_base: self.rpc_backoff,
            max_concurrent: self.rpc_max_concurrent,
            min_interval: self.rpc_min_interval,
        }
    }
}
