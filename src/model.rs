//! Rows flowing between pipeline stages.
//!
//! Every warehouse table holds rows of one of these types; the column
//! layout for each lives in `warehouse::schema`.
//! Money and share quantities are `Decimal`, never floats.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// USDC and conditional-token shares both use 6 decimals on Polygon.
pub const TOKEN_DECIMALS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Erc1155Single,
    Erc1155Batch,
    Erc20,
}

impl TransferKind {
    pub fn is_conditional_token(&self) -> bool {
        !matches!(self, TransferKind::Erc20)
    }
}

/// Identity of a raw event. Batch transfers expand into one row per
/// (id, value) pair, distinguished by `batch_index`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub tx_hash: String,
    pub log_index: u64,
    pub batch_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransferEvent {
    pub tx_hash: String,
    pub log_index: u64,
    #[serde(default)]
    pub batch_index: u32,
    pub block_number: u64,
    /// Unix seconds.
    pub block_timestamp: Option<i64>,
    pub contract: String,
    pub kind: TransferKind,
    pub operator: Option<String>,
    pub from: String,
    pub to: String,
    /// Position id (decimal) for ERC-1155 legs, `None` for ERC-20.
    pub token_id: Option<String>,
    /// Raw integer amount in base units, decimal string.
    pub amount: String,
}

impl RawTransferEvent {
    pub fn key(&self) -> EventKey {
        EventKey {
            tx_hash: self.tx_hash.clone(),
            log_index: self.log_index,
            batch_index: self.batch_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Buy,
    Sell,
}

/// How unambiguous the pairing of token and USDC legs was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Provenance / quarantine tag. Anything other than `Valid` is excluded
/// from joins and aggregates but kept in the table for auditing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    Valid,
    MalformedTxHash,
    AmountOverflow,
    UnmappedToken,
    SentinelConditionId,
    MalformedConditionId,
    NonBinaryOutcome,
    PriceOutOfRange,
}

impl DataQuality {
    pub fn is_valid(&self) -> bool {
        matches!(self, DataQuality::Valid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataQuality::Valid => "valid",
            DataQuality::MalformedTxHash => "malformed_tx_hash",
            DataQuality::AmountOverflow => "amount_overflow",
            DataQuality::UnmappedToken => "unmapped_token",
            DataQuality::SentinelConditionId => "sentinel_condition_id",
            DataQuality::MalformedConditionId => "malformed_condition_id",
            DataQuality::NonBinaryOutcome => "non_binary_outcome",
            DataQuality::PriceOutOfRange => "price_out_of_range",
        }
    }
}

/// What produced a ledger row. Redemptions and merges burn positions
/// against the conditional-tokens contract for collateral; they settle a
/// position rather than trade it, so netting and marks only use fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeKind {
    #[default]
    Fill,
    Redemption,
    Merge,
}

impl TradeKind {
    pub fn is_settlement(&self) -> bool {
        !matches!(self, TradeKind::Fill)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeKind::Fill => "fill",
            TradeKind::Redemption => "redemption",
            TradeKind::Merge => "merge",
        }
    }
}

/// Canonical identity of a fill. A position id maps to exactly one
/// (condition ID, outcome index), so it also covers unmapped tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FillId {
    pub tx_hash: String,
    pub wallet: String,
    pub token_id: String,
    pub kind: TradeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructedTrade {
    pub tx_hash: String,
    pub wallet: String,
    /// Empty when the token could not be mapped (quality says why).
    pub condition_id: String,
    pub outcome_index: u8,
    pub token_id: String,
    pub direction: Direction,
    #[serde(default)]
    pub kind: TradeKind,
    /// Signed: positive for BUY, negative for SELL.
    pub shares: Decimal,
    pub price: Decimal,
    /// Absolute notional.
    pub usd_value: Decimal,
    /// Signed USDC change seen by the wallet (negative when paying).
    pub usdc_delta: Decimal,
    pub confidence: Confidence,
    pub quality: DataQuality,
    pub block_number: u64,
    pub block_timestamp: Option<i64>,
}

impl ReconstructedTrade {
    pub fn fill_id(&self) -> FillId {
        FillId {
            tx_hash: self.tx_hash.clone(),
            wallet: self.wallet.clone(),
            token_id: self.token_id.clone(),
            kind: self.kind,
        }
    }

    /// Valid fills feed positions and marks; settlements and quarantined
    /// rows stay in the ledger only.
    pub fn is_nettable(&self) -> bool {
        self.quality.is_valid() && !self.kind.is_settlement()
    }
}

/// Upstream feed that produced a market or resolution row, highest
/// precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketSource {
    Api,
    Clob,
    Chain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub condition_id: String,
    pub question: String,
    pub outcomes: Vec<String>,
    /// ERC-1155 position id per outcome slot.
    pub tokens: Vec<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub volume: Decimal,
    pub source: MarketSource,
    #[serde(default)]
    pub updated_at: Option<i64>,
    /// Set on the row that won source precedence.
    #[serde(default)]
    pub canonical: bool,
}

impl Market {
    pub fn is_binary(&self) -> bool {
        self.outcomes.len() == 2 && self.tokens.len() == 2
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub condition_id: String,
    pub payout_numerators: Vec<u64>,
    pub payout_denominator: u64,
    #[serde(default)]
    pub winning_index: Option<u8>,
    #[serde(default)]
    pub resolved_at: Option<i64>,
    pub source: MarketSource,
}

impl Resolution {
    /// Fraction of one unit of collateral paid to `outcome`.
    pub fn payout_fraction(&self, outcome: u8) -> Option<Decimal> {
        let numerator = *self.payout_numerators.get(outcome as usize)?;
        if self.payout_denominator == 0 {
            return None;
        }
        Some(Decimal::from(numerator) / Decimal::from(self.payout_denominator))
    }

    /// Slot with the strictly largest numerator; `None` on an even split.
    pub fn derived_winner(&self) -> Option<u8> {
        let max = *self.payout_numerators.iter().max()?;
        let mut winners = self
            .payout_numerators
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == max);
        let (idx, _) = winners.next()?;
        if winners.next().is_some() {
            return None;
        }
        u8::try_from(idx).ok()
    }
}

/// Externally supplied mapping from an on-chain executing address to the
/// user-facing wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAlias {
    pub address: String,
    pub wallet: String,
}

/// Price candle / quote observation for an outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub condition_id: String,
    pub outcome_index: u8,
    pub price: Decimal,
    pub observed_at: i64,
}

/// Trade joined to its market and, once settled, its resolution.
/// Unresolved markets carry `None`, never defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedTrade {
    #[serde(flatten)]
    pub trade: ReconstructedTrade,
    pub question: Option<String>,
    pub category: Option<String>,
    pub market_source: Option<MarketSource>,
    pub payout_numerators: Option<Vec<u64>>,
    pub payout_denominator: Option<u64>,
    pub winning_index: Option<u8>,
    pub resolution_source: Option<MarketSource>,
}

impl EnrichedTrade {
    pub fn is_resolved(&self) -> bool {
        self.payout_numerators.is_some() && self.payout_denominator.is_some()
    }
}

/// Net holding of one outcome, rebuilt from trades on every run.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletPosition {
    pub wallet: String,
    pub condition_id: String,
    pub outcome_index: u8,
    pub category: Option<String>,
    pub shares: Decimal,
    /// USDC paid to acquire the position, net of USDC received from sells.
    pub cost_basis: Decimal,
    pub trade_count: u64,
    /// Payout fraction for this outcome once the market has resolved.
    pub payout: Option<Decimal>,
}

/// Whether a wallet's numbers are final, partial or not yet computable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PnlStatus {
    /// Every open position has resolved.
    Settled,
    /// Some positions resolved, some still open.
    Partial,
    /// Only unresolved positions: realized is 0 because nothing is realizable yet.
    AwaitingResolution,
    /// Trades exist but every position nets to zero shares.
    Flat,
    /// Only quarantined trades; nothing could be computed.
    QuarantinedOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletPnl {
    pub wallet: String,
    pub category: Option<String>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_pnl: Decimal,
    pub cost_basis: Decimal,
    pub trade_count: u64,
    pub resolved_positions: u64,
    pub open_positions: u64,
    pub unpriced_positions: u64,
    pub winning_positions: u64,
    pub win_rate: Decimal,
    pub roi: Decimal,
    pub quarantined_trades: u64,
    pub status: PnlStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn resolution(numerators: Vec<u64>, denominator: u64) -> Resolution {
        Resolution {
            condition_id: "c".repeat(64),
            payout_numerators: numerators,
            payout_denominator: denominator,
            winning_index: None,
            resolved_at: None,
            source: MarketSource::Api,
        }
    }

    #[test]
    fn payout_fraction_uses_denominator() {
        let r = resolution(vec![1, 0], 1);
        assert_eq!(r.payout_fraction(0), Some(dec!(1)));
        assert_eq!(r.payout_fraction(1), Some(dec!(0)));
        assert_eq!(r.payout_fraction(2), None);

        let split = resolution(vec![1, 1], 2);
        assert_eq!(split.payout_fraction(1), Some(dec!(0.5)));
        assert_eq!(split.derived_winner(), None);
        assert_eq!(resolution(vec![0, 1], 1).derived_winner(), Some(1));
    }

    #[test]
    fn source_precedence_orders_api_first() {
        let mut sources = vec![MarketSource::Chain, MarketSource::Api, MarketSource::Clob];
        sources.sort();
        assert_eq!(sources, vec![MarketSource::Api, MarketSource::Clob, MarketSource::Chain]);
    }

    #[test]
    fn trade_serializes_with_wire_names() {
        let trade = ReconstructedTrade {
            tx_hash: format!("0x{}", "a".repeat(64)),
            wallet: format!("0x{}", "b".repeat(40)),
            condition_id: "c".repeat(64),
            outcome_index: 0,
            token_id: "1".into(),
            direction: Direction::Buy,
            kind: TradeKind::Fill,
            shares: dec!(500),
            price: dec!(0.4),
            usd_value: dec!(200),
            usdc_delta: dec!(-200),
            confidence: Confidence::High,
            quality: DataQuality::Valid,
            block_number: 1,
            block_timestamp: None,
        };
        let json = serde_json::to_value(&trade).unwrap();
        assert_eq!(json["direction"], "BUY");
        assert_eq!(json["confidence"], "HIGH");
        assert_eq!(json["quality"], "valid");
        assert_eq!(json["kind"], "fill");
        let back: ReconstructedTrade = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(back, trade);

        let mut legacy = json;
        legacy.as_object_mut().unwrap().remove("kind");
        let back: ReconstructedTrade = serde_json::from_value(legacy).unwrap();
        assert_eq!(back.kind, TradeKind::Fill);
        assert!(back.is_nettable());
    }
}
