//! Stage 1: land raw transfer logs in per-worker staging partitions.
//!
//! The block range is split into contiguous slices, one per worker. Each
//! worker owns its checkpoint file and its raw partition, so workers share
//! nothing but the RPC budget.

mod source;

pub use source::{ChainLogSource, FetchedBatch, LogSource};

use crate::checkpoint::{checkpoint_path, load_all, Checkpoint};
use crate::error::{PipelineError, Result};
use crate::warehouse::{tables, UpsertReport, Warehouse};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub start_block: u64,
    pub batch_blocks: u64,
    pub workers: usize,
    /// Stop at this block instead of the chain head.
    pub to_block: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    /// Retry budget exhausted or write failed; checkpoint stays at the last good block.
    Halted { at_block: u64, error: String },
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub range_start: u64,
    pub range_end: u64,
    pub batches: u64,
    pub inserted: u64,
    pub unchanged: u64,
    pub undecodable: u64,
    /// USDC transfers outside any conditional-token transaction.
    pub dropped_usdc: u64,
    pub outcome: WorkerOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub head: u64,
    pub workers: Vec<WorkerReport>,
}

impl IngestReport {
    pub fn is_complete(&self) -> bool {
        self.workers.iter().all(|w| w.outcome == WorkerOutcome::Completed)
    }

    pub fn total_inserted(&self) -> u64 {
        self.workers.iter().map(|w| w.inserted).sum()
    }
}

/// Split `start..=end` into at most `parts` contiguous, non-empty ranges.
pub fn split_range(start: u64, end: u64, parts: usize) -> Vec<(u64, u64)> {
    if start > end || parts == 0 {
        return Vec::new();
    }
    let total = end - start + 1;
    let parts = (parts as u64).min(total);
    let base = total / parts;
    let rem = total % parts;
    let mut out = Vec::with_capacity(parts as usize);
    let mut cursor = start;
    for i in 0..parts {
        let len = base + u64::from(i < rem);
        out.push((cursor, cursor + len - 1));
        cursor += len;
    }
    out
}

/// Decide what each worker does this run. Unfinished checkpoints are
/// resumed as they are; once all are complete the next slice
/// `last_end + 1 ..= head` is split across workers.
pub fn plan_ranges(
    existing: &[Checkpoint],
    settings: &IngestSettings,
    head: u64,
) -> Vec<Checkpoint> {
    let unfinished: Vec<Checkpoint> =
        existing.iter().filter(|c| !c.is_complete()).cloned().collect();
    if !unfinished.is_empty() {
        return unfinished;
    }
    let start = existing
        .iter()
        .map(|c| c.range_end + 1)
        .max()
        .unwrap_or(settings.start_block);
    split_range(start, head, settings.workers)
        .into_iter()
        .enumerate()
        .map(|(id, (a, b))| match existing.iter().find(|c| c.worker_id == id) {
            Some(prev) => prev.reassign(a, b),
            None => Checkpoint::new(id, a, b),
        })
        .collect()
}

pub struct Ingestor<S> {
    source: Arc<S>,
    warehouse: Warehouse,
    checkpoint_dir: PathBuf,
    settings: IngestSettings,
}

impl<S: LogSource + 'static> Ingestor<S> {
    pub fn new(
        source: Arc<S>,
        warehouse: Warehouse,
        checkpoint_dir: PathBuf,
        settings: IngestSettings,
    ) -> Self {
        Self {
            source,
            warehouse,
            checkpoint_dir,
            settings,
        }
    }

    pub async fn run(&self) -> Result<IngestReport> {
        let head = match self.settings.to_block {
            Some(b) => b,
            None => self.source.chain_head().await?,
        };
        let existing = load_all(&self.checkpoint_dir)?;
        let plan = plan_ranges(&existing, &self.settings, head);
        if plan.is_empty() {
            info!("nothing to ingest up to block {}", head);
            return Ok(IngestReport { head, workers: Vec::new() });
        }

        let mut set = JoinSet::new();
        for cp in plan {
            let path = checkpoint_path(&self.checkpoint_dir, cp.worker_id);
            cp.save(&path)?;
            info!(
                "worker {}: blocks {}..={} (resuming at {})",
                cp.worker_id,
                cp.range_start,
                cp.range_end,
                cp.next_block()
            );
            set.spawn(run_worker(
                self.source.clone(),
                self.warehouse.clone(),
                path,
                cp,
                self.settings.batch_blocks,
            ));
        }

        let mut workers = Vec::new();
        while let Some(joined) = set.join_next().await {
            let report = joined
                .map_err(|e| PipelineError::Worker(format!("ingest worker aborted: {}", e)))??;
            workers.push(report);
        }
        workers.sort_by_key(|w| w.worker_id);
        let report = IngestReport { head, workers };
        info!(
            "ingest up to {}: {} new events, complete={}",
            head,
            report.total_inserted(),
            report.is_complete()
        );
        Ok(report)
    }
}

async fn write_batch(
    warehouse: &Warehouse,
    table: &str,
    batch: FetchedBatch,
) -> Result<UpsertReport> {
    let warehouse = warehouse.clone();
    let table = table.to_string();
    tokio::task::spawn_blocking(move || warehouse.upsert_raw_events(&table, &batch.events))
        .await
        .map_err(|e| PipelineError::Worker(format!("write task aborted: {}", e)))?
}

async fn run_worker<S: LogSource>(
    source: Arc<S>,
    warehouse: Warehouse,
    path: PathBuf,
    mut cp: Checkpoint,
    batch_blocks: u64,
) -> Result<WorkerReport> {
    let table = tables::raw_partition(cp.worker_id);
    let mut report = WorkerReport {
        worker_id: cp.worker_id,
        range_start: cp.range_start,
        range_end: cp.range_end,
        batches: 0,
        inserted: 0,
        unchanged: 0,
        undecodable: 0,
        dropped_usdc: 0,
        outcome: WorkerOutcome::Completed,
    };

    while !cp.is_complete() {
        let from = cp.next_block();
        let to = from.saturating_add(batch_blocks.max(1) - 1).min(cp.range_end);

        let mut dropped_usdc = 0;
        let written = match source.fetch_transfers(from, to).await {
            Ok(batch) => {
                report.undecodable += batch.undecodable as u64;
                dropped_usdc = batch.dropped_usdc;
                write_batch(&warehouse, &table, batch).await
            }
            Err(e) => Err(e),
        };
        let upsert = match written {
            Ok(u) => u,
            Err(e) => {
                warn!("worker {}: halting at block {}: {}", cp.worker_id, from, e);
                cp.record_error(from, e.to_string());
                cp.save(&path)?;
                report.outcome = WorkerOutcome::Halted {
                    at_block: from,
                    error: e.to_string(),
                };
                return Ok(report);
            }
        };

        cp.commit_batch(to, upsert.inserted as u64)?;
        cp.save(&path)?;
        report.batches += 1;
        report.inserted += upsert.inserted as u64;
        report.unchanged += upsert.unchanged as u64;
        report.dropped_usdc += dropped_usdc as u64;
        info!(
            "worker {}: blocks {}..={} committed \
             (+{} events, {} already stored, {} non-CTF USDC dropped)",
            cp.worker_id,
            from,
            to,
            upsert.inserted,
            upsert.unchanged,
            dropped_usdc
        );
    }
    Ok(report)
}
