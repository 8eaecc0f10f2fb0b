//! Stage orchestration.
//!
//! Every derived table is rebuilt in full and swapped in through
//! `Warehouse::replace_tables` behind its validation gate. Reconstruction and
//! aggregation fan out over hash buckets (transaction hash and wallet
//! respectively) so that a grouping key never spans two workers.

use crate::audit::{audit_wallet, WalletAudit};
use crate::chain::{get_contract_config, ContractConfig};
use crate::checkpoint::{load_all, Checkpoint};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::ids::normalize_tx_hash;
use crate::ingest::{
    ChainLogSource, IngestReport, IngestSettings, Ingestor, LogSource, WorkerOutcome,
};
use crate::mapping::{
    check_coverage, check_trade_ids, profile_feed, require_coverage, resolve_markets,
    resolve_resolutions, Enricher, MappingReport,
};
use crate::model::{
    EnrichedTrade, Market, MarketSource, PriceObservation, RawTransferEvent, ReconstructedTrade,
    Resolution, WalletAlias,
};
use crate::pnl::{self, PriceBook};
use crate::reconstruct::{ReconstructionReport, Reconstructor, TokenRegistry};
use crate::rpc::RpcPool;
use crate::validate;
use crate::warehouse::{read_jsonl, tables, SwapReport, Warehouse};
use futures_util::future::try_join_all;
use rust_decimal::Decimal;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Stable bucket for a grouping key.
pub fn bucket_of(key: &str, buckets: usize) -> usize {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() % buckets.max(1) as u64) as usize
}

fn partition<T, F>(rows: Vec<T>, buckets: usize, key: F) -> Vec<Vec<T>>
where
    F: Fn(&T) -> String,
{
    let buckets = buckets.max(1);
    let mut out: Vec<Vec<T>> = (0..buckets).map(|_| Vec::new()).collect();
    for row in rows {
        let b = bucket_of(&key(&row), buckets);
        out[b].push(row);
    }
    out
}

fn join_error(e: tokio::task::JoinError) -> PipelineError {
    PipelineError::Worker(format!("rebuild worker aborted: {}", e))
}

#[derive(Debug, Clone)]
pub struct AggregateReport {
    pub positions: usize,
    pub wallets: SwapReport,
    pub categories: SwapReport,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub checkpoints: Vec<Checkpoint>,
    pub tables: Vec<(String, usize)>,
}

pub struct Pipeline {
    config: Config,
    warehouse: Warehouse,
    contracts: ContractConfig,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self> {
        let warehouse = Warehouse::open(&config.data_dir)?;
        let contracts = get_contract_config(config.chain_id)?;
        Ok(Self {
            config,
            warehouse,
            contracts,
        })
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn ingest_settings(&self, to_block: Option<u64>) -> IngestSettings {
        IngestSettings {
            start_block: self.config.start_block,
            batch_blocks: self.config.batch_blocks,
            workers: self.config.ingest_workers,
            to_block,
        }
    }

    /// Stage 1 against the configured RPC endpoints.
    pub async fn ingest(&self, to_block: Option<u64>) -> Result<IngestReport> {
        let rpc = Arc::new(RpcPool::new(self.config.rpc_settings())?);
        let source =
            ChainLogSource::new(rpc, self.contracts.clone(), self.config.usdc_only_ctf_txs)?;
        self.ingest_from(Arc::new(source), to_block).await
    }

    pub async fn ingest_from<S: LogSource + 'static>(
        &self,
        source: Arc<S>,
        to_block: Option<u64>,
    ) -> Result<IngestReport> {
        let ingestor = Ingestor::new(
            source,
            self.warehouse.clone(),
            self.config.checkpoint_dir.clone(),
            self.ingest_settings(to_block),
        );
        ingestor.run().await
    }

    fn canonical_markets(&self) -> Result<Vec<Market>> {
        let rows: Vec<Market> = self.warehouse.read_table_or_empty(tables::MARKETS)?;
        Ok(resolve_markets(rows).rows.into_iter().filter(|m| m.canonical).collect())
    }

    fn raw_events(&self) -> Result<Vec<RawTransferEvent>> {
        let mut events = Vec::new();
        for name in self.warehouse.list_tables(tables::RAW_TRANSFERS_PREFIX)? {
            let rows: Vec<RawTransferEvent> = self.warehouse.read_table(&name)?;
            info!("{}: {} raw events", name, rows.len());
            events.extend(rows);
        }
        Ok(events)
    }

    /// Stage 2: rebuild the canonical trade table from every raw partition.
    pub async fn reconstruct(&self) -> Result<(ReconstructionReport, SwapReport)> {
        let events = self.raw_events()?;
        let markets = self.canonical_markets()?;
        let aliases: Vec<WalletAlias> = self.warehouse.read_table_or_empty(tables::WALLET_ALIASES)?;
        let registry = TokenRegistry::from_markets(&markets);
        info!(
            "reconstructing {} raw events against {} market tokens, {} aliases",
            events.len(),
            registry.len(),
            aliases.len()
        );
        let reconstructor = Arc::new(
            Reconstructor::new(registry, self.contracts.infrastructure_addresses(), &aliases)
                .with_conditional_tokens(&self.contracts.conditional_tokens),
        );

        let buckets =
            partition(events, self.config.rebuild_workers, |e| normalize_tx_hash(&e.tx_hash));
        let tasks = buckets.into_iter().map(|bucket| {
            let r = reconstructor.clone();
            tokio::task::spawn_blocking(move || r.reconstruct(bucket))
        });
        let results = try_join_all(tasks).await.map_err(join_error)?;

        let mut trades: Vec<ReconstructedTrade> = Vec::new();
        let mut report = ReconstructionReport::default();
        for (rows, part) in results {
            trades.extend(rows);
            report.merge(part);
        }
        trades.sort_by(|a, b| {
            let left = (a.block_number, &a.tx_hash, &a.wallet, &a.token_id, a.kind);
            let right = (b.block_number, &b.tx_hash, &b.wallet, &b.token_id, b.kind);
            left.cmp(&right)
        });

        info!(
            "reconstructed {} trades ({} redemptions/merges) from {} transactions \
             ({} duplicate events collapsed, {} USDC-only skipped)",
            report.trades,
            report.settlements,
            report.transactions,
            report.duplicate_events,
            report.skipped_transactions
        );
        for (confidence, n) in &report.by_confidence {
            info!("  confidence {:?}: {}", confidence, n);
        }
        for (quality, n) in report.by_quality.iter().filter(|(q, _)| !q.is_valid()) {
            warn!("  quarantined {}: {}", quality.as_str(), n);
        }
        if report.unreadable_legs > 0 {
            warn!("  {} token legs without a readable position id", report.unreadable_legs);
        }
        info!(
            "token coverage {:.1}% against {} canonical markets",
            report.token_coverage() * 100.0,
            markets.len()
        );
        require_coverage("token mapping", report.token_coverage(), self.config.min_join_coverage)?;

        let swap = self.warehouse.replace_table(tables::TRADES, &trades, validate::trades)?;
        Ok((report, swap))
    }

    /// Stage 3: join trades to markets and resolutions.
    pub async fn map(&self) -> Result<(MappingReport, SwapReport)> {
        let trades: Vec<ReconstructedTrade> = self.warehouse.read_table(tables::TRADES)?;
        check_trade_ids(&trades)?;
        let markets: Vec<Market> = self.warehouse.read_table_or_empty(tables::MARKETS)?;
        let resolutions: Vec<Resolution> = self.warehouse.read_table_or_empty(tables::RESOLUTIONS)?;
        profile_feed(tables::MARKETS, markets.iter().map(|m| m.condition_id.as_str()));
        profile_feed(tables::RESOLUTIONS, resolutions.iter().map(|r| r.condition_id.as_str()));

        let enricher = Enricher::new(markets, resolutions);
        let (rows, report) = enricher.enrich(&trades);
        if report.market_conflicts > 0 || report.resolution_conflicts > 0 {
            info!(
                "source precedence settled {} market and {} resolution conflicts",
                report.market_conflicts, report.resolution_conflicts
            );
        }
        check_coverage(&report, self.config.min_join_coverage)?;

        let expected = trades.len();
        let swap = self.warehouse.replace_table(tables::ENRICHED_TRADES, &rows, |rows| {
            validate::enriched(rows, expected)
        })?;
        Ok((report, swap))
    }

    /// Stage 4: wallet and wallet/category P&L.
    pub async fn aggregate(&self) -> Result<AggregateReport> {
        let trades: Vec<EnrichedTrade> = self.warehouse.read_table(tables::ENRICHED_TRADES)?;
        let observations: Vec<PriceObservation> =
            self.warehouse.read_table_or_empty(tables::PRICES)?;
        let prices = Arc::new(PriceBook::build(&trades, &observations));
        info!(
            "aggregating {} enriched trades with {} price marks",
            trades.len(),
            prices.len()
        );

        let buckets = partition(trades, self.config.rebuild_workers, |t| t.trade.wallet.clone());
        let tasks = buckets.into_iter().map(|bucket| {
            let prices = prices.clone();
            tokio::task::spawn_blocking(move || pnl::aggregate(&bucket, &prices))
        });
        let results = try_join_all(tasks).await.map_err(join_error)?;

        let mut positions = Vec::new();
        let mut wallets = Vec::new();
        let mut categories = Vec::new();
        for out in results {
            positions.extend(out.positions);
            wallets.extend(out.wallets);
            categories.extend(out.categories);
        }
        validate::positions(&positions)?;
        wallets.sort_by(|a, b| a.wallet.cmp(&b.wallet));
        categories.sort_by(|a, b| (&a.wallet, &a.category).cmp(&(&b.wallet, &b.category)));

        let realized: Decimal = wallets.iter().map(|w| w.realized_pnl).sum();
        let unrealized: Decimal = wallets.iter().map(|w| w.unrealized_pnl).sum();
        info!(
            "{} positions across {} wallets: realized {} unrealized {}",
            positions.len(),
            wallets.len(),
            realized,
            unrealized
        );

        let targets = [
            (tables::WALLET_PNL, wallets.as_slice()),
            (tables::WALLET_CATEGORY_PNL, categories.as_slice()),
        ];
        let swaps = self.warehouse.replace_tables(&targets, validate::wallet_pnl)?;
        let [wallet_swap, category_swap]: [SwapReport; 2] = swaps.try_into().map_err(|_| {
            PipelineError::validation(tables::WALLET_PNL, "expected two swapped tables")
        })?;
        Ok(AggregateReport {
            positions: positions.len(),
            wallets: wallet_swap,
            categories: category_swap,
        })
    }

    /// All four stages. Derived tables are only rebuilt on a gap-free ingest.
    pub async fn run(&self, to_block: Option<u64>) -> Result<AggregateReport> {
        let ingest = self.ingest(to_block).await?;
        self.rebuild_after(ingest).await
    }

    pub async fn rebuild_after(&self, ingest: IngestReport) -> Result<AggregateReport> {
        if !ingest.is_complete() {
            let halted: Vec<String> = ingest
                .workers
                .iter()
                .filter_map(|w| match &w.outcome {
                    WorkerOutcome::Halted { at_block, error } => {
                        Some(format!("worker {} at block {}: {}", w.worker_id, at_block, error))
                    }
                    WorkerOutcome::Completed => None,
                })
                .collect();
            return Err(PipelineError::IngestIncomplete(halted.join("; ")));
        }
        self.reconstruct().await?;
        self.map().await?;
        self.aggregate().await
    }

    /// Load a market feed file. Rows from the sources present in the file
    /// replace that source's previous rows; other sources are kept.
    pub fn import_markets(&self, path: &Path) -> Result<SwapReport> {
        let incoming: Vec<Market> = read_jsonl(path)?;
        profile_feed(&path.display().to_string(), incoming.iter().map(|m| m.condition_id.as_str()));
        let sources: HashSet<MarketSource> = incoming.iter().map(|m| m.source).collect();
        let existing: Vec<Market> = self.warehouse.read_table_or_empty(tables::MARKETS)?;
        let mut rows: Vec<Market> =
            existing.into_iter().filter(|m| !sources.contains(&m.source)).collect();
        rows.extend(incoming);

        let resolved = resolve_markets(rows);
        info!(
            "markets: {} rows, {} conditions with competing sources, {} rejected",
            resolved.rows.len(),
            resolved.conflicts,
            resolved.rejected
        );
        self.warehouse.replace_table(tables::MARKETS, &resolved.rows, validate::markets)
    }

    pub fn import_resolutions(&self, path: &Path) -> Result<SwapReport> {
        let incoming: Vec<Resolution> = read_jsonl(path)?;
        profile_feed(&path.display().to_string(), incoming.iter().map(|r| r.condition_id.as_str()));
        let sources: HashSet<MarketSource> = incoming.iter().map(|r| r.source).collect();
        let existing: Vec<Resolution> = self.warehouse.read_table_or_empty(tables::RESOLUTIONS)?;
        let mut rows: Vec<Resolution> =
            existing.into_iter().filter(|r| !sources.contains(&r.source)).collect();
        rows.extend(incoming);

        let resolved = resolve_resolutions(rows);
        info!(
            "resolutions: {} rows for {} conditions, {} rejected",
            resolved.rows.len(),
            resolved.canonical.len(),
            resolved.rejected
        );
        self.warehouse.replace_table(tables::RESOLUTIONS, &resolved.rows, validate::resolutions)
    }

    pub fn status(&self) -> Result<StatusReport> {
        let checkpoints = load_all(&self.config.checkpoint_dir)?;
        let mut tables = Vec::new();
        for name in self.warehouse.list_tables("")? {
            let rows = self.warehouse.row_count(&name)?;
            tables.push((name, rows));
        }
        Ok(StatusReport { checkpoints, tables })
    }

    pub fn archive(&self, table: &str) -> Result<String> {
        self.warehouse.archive(table)
    }

    pub fn audit(&self, wallet: &str, reference_volume: Option<Decimal>) -> Result<WalletAudit> {
        let aliases: Vec<WalletAlias> = self.warehouse.read_table_or_empty(tables::WALLET_ALIASES)?;
        let events = self.raw_events()?;
        let trades: Vec<ReconstructedTrade> = self.warehouse.read_table_or_empty(tables::TRADES)?;
        Ok(audit_wallet(wallet, &aliases, &events, &trades, reference_volume))
    }
}
