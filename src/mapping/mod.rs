//! Stage 3: join trades to the market dimension and to resolutions.
//!
//! Upstream feeds disagree, so each condition ID gets exactly one winning
//! row per table, picked by source precedence (API over CLOB over chain),
//! then most recent update, then a stable tie-break on content.

use crate::error::{PipelineError, Result};
use crate::ids::{is_canonical_condition_id, parse_condition_id, FormatProfile};
use crate::model::{
    DataQuality, EnrichedTrade, Market, MarketSource, ReconstructedTrade, Resolution,
};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct ResolvedMarkets {
    /// Every well-formed input row, normalized, with `canonical` set on the winners.
    pub rows: Vec<Market>,
    /// Condition IDs offered by more than one row.
    pub conflicts: usize,
    /// Rows dropped for an unusable condition ID.
    pub rejected: usize,
}

impl ResolvedMarkets {
    pub fn canonical(&self) -> impl Iterator<Item = &Market> {
        self.rows.iter().filter(|m| m.canonical)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedResolutions {
    /// Every usable row, normalized, winner derived.
    pub rows: Vec<Resolution>,
    pub canonical: Vec<Resolution>,
    pub conflicts: usize,
    pub rejected: usize,
}

/// Normalize condition IDs and flag one canonical row per condition.
pub fn resolve_markets(rows: Vec<Market>) -> ResolvedMarkets {
    let mut out = ResolvedMarkets::default();
    let mut by_id: BTreeMap<String, Vec<Market>> = BTreeMap::new();
    for mut m in rows {
        match parse_condition_id(&m.condition_id) {
            Ok(id) => {
                m.condition_id = id;
                m.canonical = false;
                by_id.entry(m.condition_id.clone()).or_default().push(m);
            }
            Err(q) => {
                warn!("market {:?} dropped: {}", m.condition_id, q.as_str());
                out.rejected += 1;
            }
        }
    }

    for (_, mut candidates) in by_id {
        if candidates.len() > 1 {
            out.conflicts += 1;
        }
        candidates.sort_by(|a, b| {
            (a.source, Reverse(a.updated_at), &a.question, &a.tokens).cmp(&(
                b.source,
                Reverse(b.updated_at),
                &b.question,
                &b.tokens,
            ))
        });
        candidates[0].canonical = true;
        out.rows.extend(candidates);
    }
    out
}

/// Why a resolution row cannot be used.
pub fn check_resolution(r: &Resolution) -> std::result::Result<(), String> {
    if r.payout_numerators.len() != 2 {
        return Err(format!("{} outcomes, expected 2", r.payout_numerators.len()));
    }
    if r.payout_denominator == 0 {
        return Err("zero payout denominator".into());
    }
    let sum: u128 = r.payout_numerators.iter().map(|n| u128::from(*n)).sum();
    if sum != u128::from(r.payout_denominator) {
        return Err(format!(
            "numerators sum to {} but denominator is {}",
            sum, r.payout_denominator
        ));
    }
    Ok(())
}

/// Validate resolutions and keep one per condition by source precedence.
/// The winning index is always derived from the payout vector.
pub fn resolve_resolutions(rows: Vec<Resolution>) -> ResolvedResolutions {
    let mut out = ResolvedResolutions::default();
    let mut by_id: BTreeMap<String, Vec<Resolution>> = BTreeMap::new();
    for mut r in rows {
        let id = match parse_condition_id(&r.condition_id) {
            Ok(id) => id,
            Err(q) => {
                warn!("resolution {:?} dropped: {}", r.condition_id, q.as_str());
                out.rejected += 1;
                continue;
            }
        };
        if let Err(reason) = check_resolution(&r) {
            warn!("resolution {} dropped: {}", id, reason);
            out.rejected += 1;
            continue;
        }
        let derived = r.derived_winner();
        if r.winning_index.is_some() && r.winning_index != derived {
            warn!(
                "resolution {}: feed winner {:?} disagrees with payout vector {:?}",
                id, r.winning_index, r.payout_numerators
            );
        }
        r.condition_id = id;
        r.winning_index = derived;
        by_id.entry(r.condition_id.clone()).or_default().push(r);
    }

    for (_, mut candidates) in by_id {
        if candidates.len() > 1 {
            out.conflicts += 1;
        }
        candidates.sort_by(|a, b| {
            (a.source, Reverse(a.resolved_at), &a.payout_numerators).cmp(&(
                b.source,
                Reverse(b.resolved_at),
                &b.payout_numerators,
            ))
        });
        out.canonical.push(candidates[0].clone());
        out.rows.extend(candidates);
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingReport {
    pub trades: usize,
    pub valid_trades: usize,
    pub quarantined_trades: usize,
    /// Quarantined because no market lists the position id.
    pub unmapped_trades: usize,
    pub matched_markets: usize,
    pub resolved_trades: usize,
    pub market_conflicts: usize,
    pub resolution_conflicts: usize,
    pub winners_by_source: BTreeMap<MarketSource, usize>,
}

impl MappingReport {
    /// Share of joinable trades that found their market. Trades whose
    /// position id matched no market count as misses, so a missing market
    /// table reads as zero coverage rather than a vacuous pass.
    pub fn coverage(&self) -> f64 {
        let joinable = self.valid_trades + self.unmapped_trades;
        if joinable == 0 {
            return if self.trades == 0 { 1.0 } else { 0.0 };
        }
        self.matched_markets as f64 / joinable as f64
    }
}

pub struct Enricher {
    markets: HashMap<String, Market>,
    resolutions: HashMap<String, Resolution>,
    market_conflicts: usize,
    resolution_conflicts: usize,
}

impl Enricher {
    pub fn new(markets: Vec<Market>, resolutions: Vec<Resolution>) -> Self {
        let markets = resolve_markets(markets);
        let resolutions = resolve_resolutions(resolutions);
        Self {
            market_conflicts: markets.conflicts,
            resolution_conflicts: resolutions.conflicts,
            markets: markets
                .rows
                .into_iter()
                .filter(|m| m.canonical)
                .map(|m| (m.condition_id.clone(), m))
                .collect(),
            resolutions: resolutions
                .canonical
                .into_iter()
                .map(|r| (r.condition_id.clone(), r))
                .collect(),
        }
    }

    /// One enriched row per trade. Quarantined trades pass through without
    /// joins; unresolved markets carry `None` for every resolution field.
    pub fn enrich(&self, trades: &[ReconstructedTrade]) -> (Vec<EnrichedTrade>, MappingReport) {
        let mut report = MappingReport {
            trades: trades.len(),
            market_conflicts: self.market_conflicts,
            resolution_conflicts: self.resolution_conflicts,
            ..Default::default()
        };
        let mut out = Vec::with_capacity(trades.len());
        for trade in trades {
            let mut row = EnrichedTrade {
                trade: trade.clone(),
                question: None,
                category: None,
                market_source: None,
                payout_numerators: None,
                payout_denominator: None,
                winning_index: None,
                resolution_source: None,
            };
            if !trade.quality.is_valid() {
                report.quarantined_trades += 1;
                if trade.quality == DataQuality::UnmappedToken {
                    report.unmapped_trades += 1;
                }
                out.push(row);
                continue;
            }
            report.valid_trades += 1;
            if let Some(m) = self.markets.get(&trade.condition_id) {
                report.matched_markets += 1;
                *report.winners_by_source.entry(m.source).or_default() += 1;
                row.question = Some(m.question.clone());
                row.category = m.category.clone();
                row.market_source = Some(m.source);
            }
            if let Some(r) = self.resolutions.get(&trade.condition_id) {
                report.resolved_trades += 1;
                row.payout_numerators = Some(r.payout_numerators.clone());
                row.payout_denominator = Some(r.payout_denominator);
                row.winning_index = r.winning_index;
                row.resolution_source = Some(r.source);
            }
            out.push(row);
        }
        (out, report)
    }
}

/// Valid trade rows must already carry canonical condition IDs; anything
/// else means a stage upstream skipped normalization.
pub fn check_trade_ids(trades: &[ReconstructedTrade]) -> Result<()> {
    let bad: Vec<&str> = trades
        .iter()
        .filter(|t| t.quality.is_valid() && !is_canonical_condition_id(&t.condition_id))
        .map(|t| t.condition_id.as_str())
        .take(5)
        .collect();
    if bad.is_empty() {
        return Ok(());
    }
    Err(PipelineError::SchemaMismatch(format!(
        "valid trades carry non-canonical condition ids, e.g. {:?}",
        bad
    )))
}

/// Warn when a raw feed mixes identifier conventions.
pub fn profile_feed<'a>(table: &str, ids: impl IntoIterator<Item = &'a str>) -> FormatProfile {
    let profile = FormatProfile::of(ids);
    if profile.is_mixed() || profile.uppercase > 0 {
        warn!(
            "{}: mixed condition id formats ({} prefixed, {} bare, {} uppercase)",
            table, profile.prefixed, profile.unprefixed, profile.uppercase
        );
    }
    profile
}

/// Near-zero coverage is a normalization bug or a missing market table,
/// not missing data.
pub fn require_coverage(what: &str, coverage: f64, min_coverage: f64) -> Result<()> {
    if coverage < min_coverage {
        return Err(PipelineError::SchemaMismatch(format!(
            "{} coverage {:.3} below minimum {:.3}; \
             check the market table and condition id normalization on both sides",
            what, coverage, min_coverage
        )));
    }
    Ok(())
}

pub fn check_coverage(report: &MappingReport, min_coverage: f64) -> Result<()> {
    let coverage = report.coverage();
    info!(
        "join coverage {:.1}% ({} of {} valid, {} unmapped), {} resolved",
        coverage * 100.0,
        report.matched_markets,
        report.valid_trades,
        report.unmapped_trades,
        report.resolved_trades
    );
    require_coverage("market join", coverage, min_coverage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Confidence, Direction, TradeKind};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    const CID: &str = "e3b1bc389210504ebcb9cffe4b0ed06ccac50561e0f24abb6379984cec030f00";

    fn market(cid: &str, source: MarketSource, question: &str, updated_at: Option<i64>) -> Market {
        Market {
            condition_id: cid.into(),
            question: question.into(),
            outcomes: vec!["Yes".into(), "No".into()],
            tokens: vec!["1".into(), "2".into()],
            category: Some("politics".into()),
            closed: false,
            volume: Decimal::ZERO,
            source,
            updated_at,
            canonical: false,
        }
    }

    fn resolution(
        cid: &str,
        numerators: Vec<u64>,
        denominator: u64,
        source: MarketSource,
    ) -> Resolution {
        Resolution {
            condition_id: cid.into(),
            payout_numerators: numerators,
            payout_denominator: denominator,
            winning_index: None,
            resolved_at: None,
            source,
        }
    }

    fn trade(cid: &str, quality: DataQuality) -> ReconstructedTrade {
        ReconstructedTrade {
            tx_hash: format!("0x{}", "a".repeat(64)),
            wallet: format!("0x{}", "b".repeat(40)),
            condition_id: cid.into(),
            outcome_index: 0,
            token_id: "1".into(),
            direction: Direction::Buy,
            kind: TradeKind::Fill,
            shares: dec!(500),
            price: dec!(0.4),
            usd_value: dec!(200),
            usdc_delta: dec!(-200),
            confidence: Confidence::High,
            quality,
            block_number: 1,
            block_timestamp: None,
        }
    }

    #[test]
    fn api_feed_wins_over_chain_regardless_of_order() {
        let rows = vec![
            market(&format!("0x{}", CID.to_uppercase()), MarketSource::Chain, "chain", Some(9)),
            market(CID, MarketSource::Api, "api", Some(1)),
        ];
        let mut reversed = rows.clone();
        reversed.reverse();
        for input in [rows, reversed] {
            let resolved = resolve_markets(input);
            let winners: Vec<_> = resolved.canonical().collect();
            assert_eq!(winners.len(), 1);
            assert_eq!(winners[0].question, "api");
            assert_eq!(winners[0].condition_id, CID);
            assert_eq!(resolved.conflicts, 1);
            assert_eq!(resolved.rows.len(), 2);
        }
    }

    #[test]
    fn newer_row_wins_within_a_source() {
        let resolved = resolve_markets(vec![
            market(CID, MarketSource::Clob, "old", Some(1)),
            market(CID, MarketSource::Clob, "new", Some(2)),
            market(CID, MarketSource::Clob, "undated", None),
        ]);
        assert_eq!(resolved.canonical().next().unwrap().question, "new");
    }

    #[test]
    fn sentinel_markets_are_rejected() {
        let resolved = resolve_markets(vec![market(&"0".repeat(64), MarketSource::Api, "?", None)]);
        assert_eq!(resolved.rejected, 1);
        assert!(resolved.rows.is_empty());
    }

    #[test]
    fn resolutions_must_sum_to_denominator() {
        assert!(check_resolution(&resolution(CID, vec![1, 0], 1, MarketSource::Api)).is_ok());
        assert!(check_resolution(&resolution(CID, vec![1, 1], 2, MarketSource::Api)).is_ok());
        assert!(check_resolution(&resolution(CID, vec![1, 0], 0, MarketSource::Api)).is_err());
        assert!(check_resolution(&resolution(CID, vec![1, 1], 1, MarketSource::Api)).is_err());
        assert!(check_resolution(&resolution(CID, vec![1, 0, 0], 1, MarketSource::Api)).is_err());
    }

    #[test]
    fn winner_comes_from_payout_vector() {
        let mut feed = resolution(CID, vec![0, 1], 1, MarketSource::Chain);
        feed.winning_index = Some(0);
        let api = resolution(CID, vec![1, 0], 1, MarketSource::Api);
        let resolved = resolve_resolutions(vec![feed, api]);
        assert_eq!(resolved.canonical.len(), 1);
        assert_eq!(resolved.canonical[0].source, MarketSource::Api);
        assert_eq!(resolved.canonical[0].winning_index, Some(0));
        assert_eq!(resolved.conflicts, 1);

        let chain_only = resolve_resolutions(vec![{
            let mut r = resolution(CID, vec![0, 1], 1, MarketSource::Chain);
            r.winning_index = Some(0);
            r
        }]);
        assert_eq!(chain_only.canonical[0].winning_index, Some(1));
    }

    #[test]
    fn enrich_keeps_one_row_per_trade_and_nulls_for_open_markets() {
        let other = "f".repeat(64);
        let enricher = Enricher::new(
            vec![
                market(CID, MarketSource::Api, "resolved", None),
                market(CID, MarketSource::Chain, "dup", None),
                market(&other, MarketSource::Api, "open", None),
            ],
            vec![resolution(&format!("0x{}", CID), vec![1, 0], 1, MarketSource::Api)],
        );
        let trades = vec![
            trade(CID, DataQuality::Valid),
            trade(&other, DataQuality::Valid),
            trade("", DataQuality::UnmappedToken),
        ];
        let (rows, report) = enricher.enrich(&trades);
        assert_eq!(rows.len(), trades.len());
        assert_eq!(rows[0].payout_numerators, Some(vec![1, 0]));
        assert_eq!(rows[0].winning_index, Some(0));
        assert_eq!(rows[0].question.as_deref(), Some("resolved"));
        assert!(!rows[1].is_resolved());
        assert_eq!(rows[1].winning_index, None);
        assert_eq!(rows[2].question, None);
        assert_eq!(report.valid_trades, 2);
        assert_eq!(report.matched_markets, 2);
        assert_eq!(report.quarantined_trades, 1);
        assert_eq!(report.unmapped_trades, 1);
        assert_eq!(report.market_conflicts, 1);
        assert!((report.coverage() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn low_coverage_is_a_schema_error() {
        let report = MappingReport {
            valid_trades: 100,
            matched_markets: 3,
            ..Default::default()
        };
        assert!(matches!(check_coverage(&report, 0.5), Err(PipelineError::SchemaMismatch(_))));
        assert!(check_coverage(&MappingReport::default(), 0.5).is_ok());
    }

    #[test]
    fn empty_market_table_fails_the_join_gate() {
        let enricher = Enricher::new(Vec::new(), Vec::new());
        let trades = vec![
            trade("", DataQuality::UnmappedToken),
            trade("", DataQuality::UnmappedToken),
        ];
        let (_, report) = enricher.enrich(&trades);
        assert_eq!(report.coverage(), 0.0);
        assert!(check_coverage(&report, 0.5).is_err());

        let only_bad_hashes = MappingReport {
            trades: 3,
            quarantined_trades: 3,
            ..Default::default()
        };
        assert_eq!(only_bad_hashes.coverage(), 0.0);
    }

    #[test]
    fn prefixed_ids_on_valid_trades_are_rejected() {
        assert!(check_trade_ids(&[trade(CID, DataQuality::Valid)]).is_ok());
        assert!(check_trade_ids(&[trade("", DataQuality::UnmappedToken)]).is_ok());
        let err = check_trade_ids(&[trade(&format!("0x{}", CID), DataQuality::Valid)]);
        assert!(matches!(err, Err(PipelineError::SchemaMismatch(_))));
    }
}
