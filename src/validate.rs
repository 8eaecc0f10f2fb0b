//! Gates run on a complete rebuilt table before it may replace production.

use crate::error::{PipelineError, Result};
use crate::ids::is_canonical_condition_id;
use crate::mapping::check_resolution;
use crate::model::{
    Confidence, EnrichedTrade, Market, ReconstructedTrade, Resolution, WalletPnl, WalletPosition,
};
use crate::reconstruct::conserves;
use crate::warehouse::tables;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;

fn first_duplicate<K, I>(keys: I) -> Option<K>
where
    K: Eq + Hash + Clone,
    I: IntoIterator<Item = K>,
{
    let mut seen = HashSet::new();
    keys.into_iter().find(|k| !seen.insert(k.clone()))
}

/// Unique fills == row count.
pub fn dedup_ratio(rows: &[ReconstructedTrade]) -> Result<()> {
    let distinct: HashSet<_> = rows.iter().map(|t| t.fill_id()).collect();
    if distinct.len() != rows.len() {
        return Err(PipelineError::validation(
            tables::TRADES,
            format!("{} rows for {} distinct fills", rows.len(), distinct.len()),
        ));
    }
    Ok(())
}

pub fn trades(rows: &[ReconstructedTrade]) -> Result<()> {
    dedup_ratio(rows)?;

    if let Some(t) = rows
        .iter()
        .find(|t| t.quality.is_valid() && !is_canonical_condition_id(&t.condition_id))
    {
        return Err(PipelineError::validation(
            tables::TRADES,
            format!("valid row {} / {} has condition id {:?}", t.tx_hash, t.wallet, t.condition_id),
        ));
    }

    if let Some(t) = rows
        .iter()
        .find(|t| t.quality.is_valid() && (t.price < Decimal::ZERO || t.price > Decimal::ONE))
    {
        return Err(PipelineError::validation(
            tables::TRADES,
            format!("valid row {} has price {}", t.tx_hash, t.price),
        ));
    }

    let mut by_tx: HashMap<&str, Vec<ReconstructedTrade>> = HashMap::new();
    for t in rows {
        by_tx.entry(t.tx_hash.as_str()).or_default().push(t.clone());
    }
    for (tx, group) in &by_tx {
        if group.iter().any(|t| t.confidence == Confidence::High) && !conserves(group) {
            return Err(PipelineError::validation(
                tables::TRADES,
                format!("{} is HIGH confidence but does not conserve shares and USDC", tx),
            ));
        }
    }
    Ok(())
}

/// The join must not multiply rows.
pub fn enriched(rows: &[EnrichedTrade], source_rows: usize) -> Result<()> {
    if rows.len() != source_rows {
        return Err(PipelineError::validation(
            tables::ENRICHED_TRADES,
            format!("fanout: {} enriched rows from {} trades", rows.len(), source_rows),
        ));
    }
    if let Some(id) = first_duplicate(rows.iter().map(|r| r.trade.fill_id())) {
        return Err(PipelineError::validation(
            tables::ENRICHED_TRADES,
            format!("fill {} / {} / {} appears twice", id.tx_hash, id.wallet, id.token_id),
        ));
    }
    Ok(())
}

/// One position per (wallet, condition, outcome).
pub fn positions(rows: &[WalletPosition]) -> Result<()> {
    let keys = rows
        .iter()
        .map(|p| (p.wallet.as_str(), p.condition_id.as_str(), p.outcome_index));
    if let Some((w, c, o)) = first_duplicate(keys) {
        return Err(PipelineError::validation(
            tables::WALLET_PNL,
            format!("position {} / {} / {} aggregated twice", w, c, o),
        ));
    }
    Ok(())
}

pub fn wallet_pnl(table: &str, rows: &[WalletPnl]) -> Result<()> {
    let keys = rows.iter().map(|r| (r.wallet.as_str(), r.category.as_deref()));
    if let Some((w, c)) = first_duplicate(keys) {
        return Err(PipelineError::validation(table, format!("{} / {:?} appears twice", w, c)));
    }
    if let Some(r) = rows.iter().find(|r| r.total_pnl != r.realized_pnl + r.unrealized_pnl) {
        return Err(PipelineError::validation(
            table,
            format!("{}: total does not equal realized + unrealized", r.wallet),
        ));
    }
    Ok(())
}

pub fn markets(rows: &[Market]) -> Result<()> {
    if let Some(m) = rows.iter().find(|m| !is_canonical_condition_id(&m.condition_id)) {
        return Err(PipelineError::validation(
            tables::MARKETS,
            format!("condition id {:?} is not canonical", m.condition_id),
        ));
    }
    let keys = rows.iter().map(|m| (m.condition_id.as_str(), m.source));
    if let Some((c, s)) = first_duplicate(keys) {
        return Err(PipelineError::validation(
            tables::MARKETS,
            format!("{} listed twice by source {:?}", c, s),
        ));
    }
    let mut canonical: BTreeMap<&str, usize> = BTreeMap::new();
    for m in rows {
        *canonical.entry(m.condition_id.as_str()).or_default() += usize::from(m.canonical);
    }
    if let Some((c, n)) = canonical.iter().find(|(_, n)| **n != 1) {
        return Err(PipelineError::validation(
            tables::MARKETS,
            format!("{} has {} canonical rows", c, n),
        ));
    }
    Ok(())
}

pub fn resolutions(rows: &[Resolution]) -> Result<()> {
    for r in rows {
        if !is_canonical_condition_id(&r.condition_id) {
            return Err(PipelineError::validation(
                tables::RESOLUTIONS,
                format!("condition id {:?} is not canonical", r.condition_id),
            ));
        }
        if let Err(reason) = check_resolution(r) {
            return Err(PipelineError::validation(
                tables::RESOLUTIONS,
                format!("{}: {}", r.condition_id, reason),
            ));
        }
    }
    let keys = rows.iter().map(|r| (r.condition_id.as_str(), r.source));
    if let Some((c, s)) = first_duplicate(keys) {
        return Err(PipelineError::validation(
            tables::RESOLUTIONS,
            format!("{} resolved twice by source {:?}", c, s),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataQuality, Direction, MarketSource, PnlStatus, TradeKind};
    use rust_decimal_macros::dec;

    const CID: &str = "e3b1bc389210504ebcb9cffe4b0ed06ccac50561e0f24abb6379984cec030f00";

    fn trade(wallet: char, shares: Decimal, usdc: Decimal) -> ReconstructedTrade {
        ReconstructedTrade {
            tx_hash: format!("0x{}", "1".repeat(64)),
            wallet: format!("0x{}", wallet.to_string().repeat(40)),
            condition_id: CID.into(),
            outcome_index: 0,
            token_id: "7".into(),
            direction: if shares.is_sign_negative() { Direction::Sell } else { Direction::Buy },
            kind: TradeKind::Fill,
            shares,
            price: dec!(0.4),
            usd_value: usdc.abs(),
            usdc_delta: usdc,
            confidence: Confidence::High,
            quality: DataQuality::Valid,
            block_number: 1,
            block_timestamp: None,
        }
    }

    fn pnl(wallet: &str) -> WalletPnl {
        WalletPnl {
            wallet: wallet.into(),
            category: None,
            realized_pnl: dec!(300),
            unrealized_pnl: dec!(0),
            total_pnl: dec!(300),
            cost_basis: dec!(200),
            trade_count: 1,
            resolved_positions: 1,
            open_positions: 0,
            unpriced_positions: 0,
            winning_positions: 1,
            win_rate: dec!(1),
            roi: dec!(1.5),
            quarantined_trades: 0,
            status: PnlStatus::Settled,
        }
    }

    #[test]
    fn duplicate_fills_fail_dedup_gate() {
        let buy = trade('a', dec!(500), dec!(-200));
        let sell = trade('b', dec!(-500), dec!(200));
        assert!(trades(&[buy.clone(), sell.clone()]).is_ok());
        assert!(matches!(
            trades(&[buy.clone(), buy, sell]),
            Err(PipelineError::Validation { .. })
        ));
    }

    #[test]
    fn high_confidence_must_conserve() {
        let buy = trade('a', dec!(500), dec!(-200));
        let sell = trade('b', dec!(-500), dec!(199));
        assert!(trades(&[buy.clone(), sell.clone()]).is_err());

        let mut relaxed = sell;
        relaxed.confidence = Confidence::Medium;
        let mut buy = buy;
        buy.confidence = Confidence::Medium;
        assert!(trades(&[buy, relaxed]).is_ok());
    }

    #[test]
    fn valid_rows_need_canonical_ids() {
        let mut t = trade('a', dec!(1), dec!(0));
        t.confidence = Confidence::Low;
        t.condition_id = format!("0x{}", CID);
        assert!(trades(&[t.clone()]).is_err());
        t.quality = DataQuality::MalformedConditionId;
        assert!(trades(&[t]).is_ok());
    }

    #[test]
    fn fanout_is_rejected() {
        let t = trade('a', dec!(500), dec!(-200));
        let row = EnrichedTrade {
            trade: t,
            question: None,
            category: None,
            market_source: None,
            payout_numerators: None,
            payout_denominator: None,
            winning_index: None,
            resolution_source: None,
        };
        assert!(enriched(&[row.clone()], 1).is_ok());
        assert!(enriched(&[row.clone(), row.clone()], 1).is_err());
        assert!(enriched(&[row.clone(), row], 2).is_err());
    }

    #[test]
    fn pnl_rows_are_unique_and_consistent() {
        assert!(wallet_pnl(tables::WALLET_PNL, &[pnl("a"), pnl("b")]).is_ok());
        assert!(wallet_pnl(tables::WALLET_PNL, &[pnl("a"), pnl("a")]).is_err());
        let mut broken = pnl("c");
        broken.total_pnl = dec!(0);
        assert!(wallet_pnl(tables::WALLET_PNL, &[broken]).is_err());
    }

    #[test]
    fn market_table_needs_one_canonical_row_per_condition() {
        let m = Market {
            condition_id: CID.into(),
            question: "q".into(),
            outcomes: vec!["Yes".into(), "No".into()],
            tokens: vec!["1".into(), "2".into()],
            category: None,
            closed: false,
            volume: Decimal::ZERO,
            source: MarketSource::Api,
            updated_at: None,
            canonical: true,
        };
        let mut chain = m.clone();
        chain.source = MarketSource::Chain;
        chain.canonical = false;
        assert!(markets(&[m.clone(), chain.clone()]).is_ok());
        chain.canonical = true;
        assert!(markets(&[m.clone(), chain]).is_err());
        assert!(markets(&[m.clone(), m]).is_err());
    }
}
