use crate::chain::{decode_log, event_topics, ContractConfig};
use crate::error::{PipelineError, Result};
use crate::model::RawTransferEvent;
use crate::rpc::RpcPool;
use async_trait::async_trait;
use ethers::types::{Address, Filter, Log, Topic, ValueOrArray};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    pub events: Vec<RawTransferEvent>,
    /// Logs that matched the filter but could not be decoded.
    pub undecodable: usize,
    /// USDC transfers outside any conditional-token transaction.
    pub dropped_usdc: usize,
}

/// Where ingestion reads transfer logs from.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn chain_head(&self) -> Result<u64>;

    /// All conditional-token and collateral transfers in `from..=to`.
    async fn fetch_transfers(&self, from: u64, to: u64) -> Result<FetchedBatch>;
}

pub struct ChainLogSource {
    rpc: Arc<RpcPool>,
    contracts: ContractConfig,
    conditional_tokens: Address,
    collateral: Address,
    usdc_only_ctf_txs: bool,
    timestamp_concurrency: usize,
}

fn parse_address(s: &str) -> Result<Address> {
    s.parse()
        .map_err(|e| PipelineError::Config(format!("invalid contract address {}: {}", s, e)))
}

impl ChainLogSource {
    pub fn new(
        rpc: Arc<RpcPool>,
        contracts: ContractConfig,
        usdc_only_ctf_txs: bool,
    ) -> Result<Self> {
        let conditional_tokens = parse_address(&contracts.conditional_tokens)?;
        let collateral = parse_address(&contracts.collateral)?;
        Ok(Self {
            rpc,
            contracts,
            conditional_tokens,
            collateral,
            usdc_only_ctf_txs,
            timestamp_concurrency: 8,
        })
    }

    fn ctf_filter(&self, from: u64, to: u64) -> Filter {
        let topics = event_topics();
        let topic0: Topic = ValueOrArray::Array(vec![
            Some(topics.transfer_single),
            Some(topics.transfer_batch),
        ]);
        Filter::new()
            .from_block(from)
            .to_block(to)
            .address(ValueOrArray::Value(self.conditional_tokens))
            .topic0(topic0)
    }

    fn usdc_filter(&self, from: u64, to: u64) -> Filter {
        let topic0: Topic = ValueOrArray::Value(Some(event_topics().transfer));
        Filter::new()
            .from_block(from)
            .to_block(to)
            .address(ValueOrArray::Value(self.collateral))
            .topic0(topic0)
    }

    /// Fetch logs, halving the range whenever the provider refuses it.
    async fn logs_bisecting<F>(&self, make_filter: F, from: u64, to: u64) -> Result<Vec<Log>>
    where
        F: Fn(u64, u64) -> Filter + Send + Sync,
    {
        let mut pending = vec![(from, to)];
        let mut out = Vec::new();
        while let Some((a, b)) = pending.pop() {
            match self.rpc.get_logs(&make_filter(a, b)).await {
                Ok(logs) => out.extend(logs),
                Err(PipelineError::RangeTooLarge(msg)) if b > a => {
                    let mid = a + (b - a) / 2;
                    debug!("splitting {}..={} at {}: {}", a, b, mid, msg);
                    pending.push((mid + 1, b));
                    pending.push((a, mid));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn block_timestamps(&self, blocks: HashSet<u64>) -> Result<HashMap<u64, i64>> {
        let rpc = &self.rpc;
        stream::iter(blocks)
            .map(|b| async move { rpc.block_timestamp(b).await.map(|ts| (b, ts)) })
            .buffer_unordered(self.timestamp_concurrency)
            .try_collect()
            .await
    }
}

#[async_trait]
impl LogSource for ChainLogSource {
    async fn chain_head(&self) -> Result<u64> {
        self.rpc.block_number().await
    }

    async fn fetch_transfers(&self, from: u64, to: u64) -> Result<FetchedBatch> {
        let ctf_logs = self.logs_bisecting(|a, b| self.ctf_filter(a, b), from, to).await?;
        let usdc_logs = self.logs_bisecting(|a, b| self.usdc_filter(a, b), from, to).await?;

        let mut batch = FetchedBatch::default();
        let mut ctf_events = Vec::new();
        let mut usdc_events = Vec::new();
        for (logs, sink) in [(&ctf_logs, &mut ctf_events), (&usdc_logs, &mut usdc_events)] {
            for log in logs {
                match decode_log(log, &self.contracts) {
                    Ok(events) => sink.extend(events),
                    Err(e) => {
                        debug!(
                            "undecodable log {:?}/{:?}: {}",
                            log.transaction_hash, log.log_index, e
                        );
                        batch.undecodable += 1;
                    }
                }
            }
        }
        if batch.undecodable > 0 {
            warn!("blocks {}..={}: {} logs could not be decoded", from, to, batch.undecodable);
        }

        if self.usdc_only_ctf_txs {
            let ctf_txs: HashSet<&str> = ctf_events.iter().map(|e| e.tx_hash.as_str()).collect();
            let before = usdc_events.len();
            usdc_events.retain(|e| ctf_txs.contains(e.tx_hash.as_str()));
            batch.dropped_usdc = before - usdc_events.len();
        }

        let mut events = ctf_events;
        events.extend(usdc_events);
        let blocks: HashSet<u64> = events.iter().map(|e| e.block_number).collect();
        let timestamps = self.block_timestamps(blocks).await?;
        for e in &mut events {
            e.block_timestamp = timestamps.get(&e.block_number).copied();
        }
        events.sort_by_key(|e| e.key());
        batch.events = events;
        Ok(batch)
    }
}
