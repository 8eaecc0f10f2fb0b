//! Stage 4: positions and wallet P&L.
//!
//! Positions are rebuilt from individual enriched trades on every run and
//! never from a previously aggregated table. Resolved positions settle at
//! `shares * numerator / denominator`; open positions are marked at the
//! latest observed price of their outcome. Redemptions and merges close
//! a position against the contract, so they never move shares or cost.

mod prices;

pub use prices::PriceBook;

use crate::model::{EnrichedTrade, PnlStatus, WalletPnl, WalletPosition};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

pub const UNCATEGORIZED: &str = "uncategorized";
const MONEY_DECIMALS: u32 = 6;
const RATIO_DECIMALS: u32 = 6;

/// Settlement fraction carried on a resolved trade.
fn payout_of(t: &EnrichedTrade) -> Option<Decimal> {
    let numerators = t.payout_numerators.as_ref()?;
    let denominator = t.payout_denominator.filter(|d| *d > 0)?;
    let numerator = *numerators.get(t.trade.outcome_index as usize)?;
    Some(Decimal::from(numerator) / Decimal::from(denominator))
}

/// Net holdings per (wallet, condition, outcome) from valid fills only.
pub fn build_positions(trades: &[EnrichedTrade]) -> Vec<WalletPosition> {
    let mut positions: BTreeMap<(String, String, u8), WalletPosition> = BTreeMap::new();
    for t in trades.iter().filter(|t| t.trade.is_nettable()) {
        let key = (t.trade.wallet.clone(), t.trade.condition_id.clone(), t.trade.outcome_index);
        let position = positions.entry(key).or_insert_with(|| WalletPosition {
            wallet: t.trade.wallet.clone(),
            condition_id: t.trade.condition_id.clone(),
            outcome_index: t.trade.outcome_index,
            category: t.category.clone(),
            shares: Decimal::ZERO,
            cost_basis: Decimal::ZERO,
            trade_count: 0,
            payout: None,
        });
        position.shares += t.trade.shares;
        position.cost_basis -= t.trade.usdc_delta;
        position.trade_count += 1;
        if position.payout.is_none() {
            position.payout = payout_of(t);
        }
        if position.category.is_none() {
            position.category = t.category.clone();
        }
    }
    positions.into_values().collect()
}

/// Fold one wallet's positions (optionally restricted to a category) into a
/// P&L row.
pub fn summarize(
    wallet: &str,
    category: Option<String>,
    positions: &[&WalletPosition],
    prices: &PriceBook,
    quarantined_trades: u64,
) -> WalletPnl {
    let mut realized = Decimal::ZERO;
    let mut unrealized = Decimal::ZERO;
    let mut cost_basis = Decimal::ZERO;
    let (mut resolved, mut open, mut unpriced, mut winning) = (0u64, 0u64, 0u64, 0u64);

    for p in positions {
        if p.shares.is_zero() {
            continue;
        }
        match p.payout {
            Some(fraction) => {
                let pnl = p.shares * fraction - p.cost_basis;
                realized += pnl;
                cost_basis += p.cost_basis;
                resolved += 1;
                if pnl > Decimal::ZERO {
                    winning += 1;
                }
            }
            None => {
                open += 1;
                match prices.price(&p.condition_id, p.outcome_index) {
                    Some(mark) => {
                        unrealized += p.shares * mark - p.cost_basis;
                        cost_basis += p.cost_basis;
                    }
                    None => unpriced += 1,
                }
            }
        }
    }

    let realized = realized.round_dp(MONEY_DECIMALS);
    let unrealized = unrealized.round_dp(MONEY_DECIMALS);
    let total = realized + unrealized;
    let win_rate = if resolved > 0 {
        (Decimal::from(winning) / Decimal::from(resolved)).round_dp(RATIO_DECIMALS)
    } else {
        Decimal::ZERO
    };
    let roi = if cost_basis > Decimal::ZERO {
        (total / cost_basis).round_dp(RATIO_DECIMALS)
    } else {
        Decimal::ZERO
    };
    let status = if positions.is_empty() && quarantined_trades > 0 {
        PnlStatus::QuarantinedOnly
    } else if resolved == 0 && open == 0 {
        PnlStatus::Flat
    } else if open == 0 {
        PnlStatus::Settled
    } else if resolved == 0 {
        PnlStatus::AwaitingResolution
    } else {
        PnlStatus::Partial
    };

    WalletPnl {
        wallet: wallet.to_string(),
        category,
        realized_pnl: realized,
        unrealized_pnl: unrealized,
        total_pnl: total,
        cost_basis: cost_basis.round_dp(MONEY_DECIMALS),
        trade_count: positions.iter().map(|p| p.trade_count).sum(),
        resolved_positions: resolved,
        open_positions: open,
        unpriced_positions: unpriced,
        winning_positions: winning,
        win_rate,
        roi,
        quarantined_trades,
        status,
    }
}

#[derive(Debug, Clone, Default)]
pub struct PnlOutput {
    pub positions: Vec<WalletPosition>,
    pub wallets: Vec<WalletPnl>,
    pub categories: Vec<WalletPnl>,
}

/// Wallet and (wallet, category) rows for a set of trades. Every trade of a
/// wallet must be in the same call.
pub fn aggregate(trades: &[EnrichedTrade], prices: &PriceBook) -> PnlOutput {
    let positions = build_positions(trades);

    let mut quarantined: BTreeMap<&str, u64> = BTreeMap::new();
    for t in trades.iter().filter(|t| !t.trade.quality.is_valid()) {
        *quarantined.entry(t.trade.wallet.as_str()).or_default() += 1;
    }

    let mut by_wallet: BTreeMap<&str, Vec<&WalletPosition>> = BTreeMap::new();
    for p in &positions {
        by_wallet.entry(p.wallet.as_str()).or_default().push(p);
    }
    for wallet in quarantined.keys() {
        by_wallet.entry(*wallet).or_default();
    }

    let mut wallets = Vec::with_capacity(by_wallet.len());
    let mut categories = Vec::new();
    for (wallet, held) in &by_wallet {
        let q = quarantined.get(wallet).copied().unwrap_or_default();
        wallets.push(summarize(wallet, None, held, prices, q));

        let mut by_category: BTreeMap<&str, Vec<&WalletPosition>> = BTreeMap::new();
        for p in held {
            let label = p.category.as_deref().unwrap_or(UNCATEGORIZED);
            by_category.entry(label).or_default().push(*p);
        }
        for (label, group) in by_category {
            categories.push(summarize(wallet, Some(label.to_string()), &group, prices, 0));
        }
    }

    PnlOutput {
        positions,
        wallets,
        categories,
    }
}
