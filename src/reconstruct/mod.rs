//! Stage 2: infer signed fills from the transfer legs of each transaction.
//!
//! Legs are netted per participant inside one transaction hash. A
//! participant that gains position tokens and pays USDC bought; the reverse
//! sold. Anything that does not fit that shape is kept with a lower
//! confidence, and rows that cannot be mapped to a binary market are kept
//! with a quarantine tag instead of being dropped.
//!
//! Burning positions back to the conditional-tokens contract (redeem or
//! merge) is not a trade. Those legs become settlement rows with their own
//! `TradeKind` and never net against fills.

mod registry;

pub use registry::{TokenInfo, TokenRegistry};

use crate::chain::ZERO_ADDRESS;
use crate::ids::{
    is_valid_tx_hash, normalize_address, normalize_token_id, normalize_tx_hash, parse_condition_id,
};
use crate::model::{
    Confidence, DataQuality, Direction, EventKey, FillId, RawTransferEvent, ReconstructedTrade,
    TradeKind, WalletAlias, TOKEN_DECIMALS,
};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

const PRICE_DECIMALS: u32 = 6;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconstructionReport {
    pub raw_events: usize,
    pub duplicate_events: usize,
    pub transactions: usize,
    /// Transactions with USDC movement only.
    pub skipped_transactions: usize,
    /// Conditional-token legs whose position id could not be read.
    pub unreadable_legs: usize,
    pub unpaired_legs: usize,
    pub downgraded_transactions: usize,
    pub duplicate_fills: usize,
    /// Redemption and merge rows among `trades`.
    pub settlements: usize,
    pub trades: usize,
    pub by_confidence: BTreeMap<Confidence, usize>,
    pub by_quality: BTreeMap<DataQuality, usize>,
}

impl ReconstructionReport {
    pub fn merge(&mut self, other: ReconstructionReport) {
        self.raw_events += other.raw_events;
        self.duplicate_events += other.duplicate_events;
        self.transactions += other.transactions;
        self.skipped_transactions += other.skipped_transactions;
        self.unreadable_legs += other.unreadable_legs;
        self.unpaired_legs += other.unpaired_legs;
        self.downgraded_transactions += other.downgraded_transactions;
        self.duplicate_fills += other.duplicate_fills;
        self.settlements += other.settlements;
        self.trades += other.trades;
        for (k, v) in other.by_confidence {
            *self.by_confidence.entry(k).or_default() += v;
        }
        for (k, v) in other.by_quality {
            *self.by_quality.entry(k).or_default() += v;
        }
    }

    pub fn quarantined(&self) -> usize {
        self.by_quality
            .iter()
            .filter(|(q, _)| !q.is_valid())
            .map(|(_, n)| n)
            .sum()
    }

    /// Share of rows whose position id resolved through the market
    /// registry. An empty or mis-keyed market table drives this to zero.
    pub fn token_coverage(&self) -> f64 {
        if self.trades == 0 {
            return 1.0;
        }
        let unmapped = self.by_quality.get(&DataQuality::UnmappedToken).copied().unwrap_or(0);
        (self.trades - unmapped) as f64 / self.trades as f64
    }
}

/// Lowercase hashes and addresses so that events differing only in
/// formatting share an identity.
pub fn normalize_event(mut event: RawTransferEvent) -> RawTransferEvent {
    event.tx_hash = normalize_tx_hash(&event.tx_hash);
    event.from = normalize_address(&event.from);
    event.to = normalize_address(&event.to);
    event.contract = normalize_address(&event.contract);
    event
}

/// Raw base units to a 6-decimal quantity. `None` when the integer does not
/// fit the decimal mantissa.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let units: i128 = raw.trim().parse().ok()?;
    Decimal::try_from_i128_with_scale(units, TOKEN_DECIMALS).ok()
}

#[derive(Debug, Default)]
struct Party {
    tokens: BTreeMap<String, Decimal>,
    usdc: Decimal,
    /// Positions sent to the zero address, by token.
    burned: BTreeMap<String, Decimal>,
    /// Collateral paid out by the conditional-tokens contract.
    payout: Decimal,
    overflow: bool,
}

impl Party {
    fn has_net_effect(&self) -> bool {
        !self.usdc.is_zero() || self.tokens.values().any(|d| !d.is_zero())
    }
}

pub struct Reconstructor {
    registry: TokenRegistry,
    infrastructure: HashSet<String>,
    aliases: HashMap<String, String>,
    conditional_tokens: Option<String>,
}

impl Reconstructor {
    pub fn new(
        registry: TokenRegistry,
        infrastructure: HashSet<String>,
        aliases: &[WalletAlias],
    ) -> Self {
        let infrastructure = infrastructure.iter().map(|a| normalize_address(a)).collect();
        let aliases = aliases
            .iter()
            .map(|a| (normalize_address(&a.address), normalize_address(&a.wallet)))
            .collect();
        Self {
            registry,
            infrastructure,
            aliases,
            conditional_tokens: None,
        }
    }

    /// USDC sent by this contract is a redemption or merge payout.
    pub fn with_conditional_tokens(mut self, address: &str) -> Self {
        self.conditional_tokens = Some(normalize_address(address));
        self
    }

    fn wallet_of(&self, address: &str) -> Option<String> {
        if address == ZERO_ADDRESS || self.infrastructure.contains(address) {
            return None;
        }
        Some(self.aliases.get(address).cloned().unwrap_or_else(|| address.to_string()))
    }

    /// Rebuild trades for a set of raw events. All events of a transaction
    /// must be in the same call.
    pub fn reconstruct(
        &self,
        events: Vec<RawTransferEvent>,
    ) -> (Vec<ReconstructedTrade>, ReconstructionReport) {
        let mut report = ReconstructionReport {
            raw_events: events.len(),
            ..Default::default()
        };

        let mut unique: BTreeMap<EventKey, RawTransferEvent> = BTreeMap::new();
        for event in events {
            let event = normalize_event(event);
            unique.insert(event.key(), event);
        }
        report.duplicate_events = report.raw_events - unique.len();

        let mut fills: BTreeMap<FillId, ReconstructedTrade> = BTreeMap::new();
        let ordered: Vec<RawTransferEvent> = unique.into_values().collect();
        for group in ordered.chunk_by(|a, b| a.tx_hash == b.tx_hash) {
            report.transactions += 1;
            for trade in self.reconstruct_transaction(group, &mut report) {
                if fills.insert(trade.fill_id(), trade).is_some() {
                    report.duplicate_fills += 1;
                }
            }
        }

        let trades: Vec<ReconstructedTrade> = fills.into_values().collect();
        report.trades = trades.len();
        report.settlements = trades.iter().filter(|t| t.kind.is_settlement()).count();
        for t in &trades {
            *report.by_confidence.entry(t.confidence).or_default() += 1;
            *report.by_quality.entry(t.quality).or_default() += 1;
        }
        (trades, report)
    }

    fn reconstruct_transaction(
        &self,
        group: &[RawTransferEvent],
        report: &mut ReconstructionReport,
    ) -> Vec<ReconstructedTrade> {
        let tx_hash = group[0].tx_hash.clone();
        let block_number = group.iter().map(|e| e.block_number).max().unwrap_or_default();
        let block_timestamp = group.iter().filter_map(|e| e.block_timestamp).max();

        let mut parties: BTreeMap<String, Party> = BTreeMap::new();
        let mut has_token_leg = false;
        for event in group {
            let amount = parse_amount(&event.amount);
            let token = if event.kind.is_conditional_token() {
                match event.token_id.as_deref().and_then(normalize_token_id) {
                    Some(t) => Some(t),
                    None => {
                        report.unreadable_legs += 1;
                        continue;
                    }
                }
            } else {
                None
            };
            has_token_leg |= token.is_some();
            let burn = token.is_some() && event.to == ZERO_ADDRESS;
            let payout =
                token.is_none() && self.conditional_tokens.as_deref() == Some(event.from.as_str());

            let sides = [(&event.from, Decimal::NEGATIVE_ONE), (&event.to, Decimal::ONE)];
            for (address, sign) in sides {
                let Some(wallet) = self.wallet_of(address) else {
                    continue;
                };
                let party = parties.entry(wallet).or_default();
                party.overflow |= amount.is_none();
                let delta = amount.map(|a| a * sign).unwrap_or_default();
                match &token {
                    Some(t) if burn => *party.burned.entry(t.clone()).or_default() -= delta,
                    Some(t) => *party.tokens.entry(t.clone()).or_default() += delta,
                    None if payout => party.payout += delta,
                    None => party.usdc += delta,
                }
            }
        }

        if !has_token_leg {
            report.skipped_transactions += 1;
            return Vec::new();
        }
        for party in parties.values_mut() {
            if party.burned.is_empty() && !party.payout.is_zero() {
                party.usdc += std::mem::take(&mut party.payout);
            }
        }

        let net_parties = parties.values().filter(|p| p.has_net_effect()).count();
        let tx_quality = if is_valid_tx_hash(&tx_hash) {
            DataQuality::Valid
        } else {
            DataQuality::MalformedTxHash
        };

        let mut trades = Vec::new();
        for (wallet, party) in &parties {
            let legs: Vec<(&String, Decimal)> = party
                .tokens
                .iter()
                .filter(|(_, d)| party.overflow || !d.is_zero())
                .map(|(t, d)| (t, *d))
                .collect();
            if legs.is_empty() {
                continue;
            }
            let total_shares: Decimal = legs.iter().map(|(_, d)| d.abs()).sum();

            for (token_id, shares) in &legs {
                let usdc_delta = if legs.len() == 1 {
                    party.usdc
                } else if total_shares.is_zero() {
                    Decimal::ZERO
                } else {
                    (party.usdc * shares.abs() / total_shares).round_dp(TOKEN_DECIMALS)
                };
                let direction = if shares.is_sign_negative() {
                    Direction::Sell
                } else {
                    Direction::Buy
                };
                let paired = match direction {
                    Direction::Buy => usdc_delta.is_sign_negative() && !usdc_delta.is_zero(),
                    Direction::Sell => usdc_delta.is_sign_positive() && !usdc_delta.is_zero(),
                };
                let confidence = if !paired {
                    report.unpaired_legs += 1;
                    Confidence::Low
                } else if net_parties == 2 && legs.len() == 1 {
                    Confidence::High
                } else {
                    Confidence::Medium
                };

                let mut price = if paired && !shares.is_zero() {
                    (usdc_delta.abs() / shares.abs()).round_dp(PRICE_DECIMALS)
                } else {
                    Decimal::ZERO
                };
                let price_quality = if price > Decimal::ONE {
                    price = Decimal::ONE;
                    DataQuality::PriceOutOfRange
                } else {
                    DataQuality::Valid
                };

                let (condition_id, outcome_index, mapping_quality) = self.map_token(token_id);
                let overflow_quality = if party.overflow {
                    DataQuality::AmountOverflow
                } else {
                    DataQuality::Valid
                };
                let quality = [tx_quality, overflow_quality, mapping_quality, price_quality]
                    .into_iter()
                    .find(|q| !q.is_valid())
                    .unwrap_or(DataQuality::Valid);

                trades.push(ReconstructedTrade {
                    tx_hash: tx_hash.clone(),
                    wallet: wallet.clone(),
                    condition_id,
                    outcome_index,
                    token_id: (*token_id).clone(),
                    direction,
                    kind: TradeKind::Fill,
                    shares: *shares,
                    price,
                    usd_value: usdc_delta.abs(),
                    usdc_delta,
                    confidence,
                    quality,
                    block_number,
                    block_timestamp,
                });
            }
        }

        if trades.iter().any(|t| t.confidence == Confidence::High) && !conserves(&trades) {
            debug!("{}: two-party fill does not net to zero, downgrading", tx_hash);
            report.downgraded_transactions += 1;
            for t in trades.iter_mut().filter(|t| t.confidence == Confidence::High) {
                t.confidence = Confidence::Medium;
            }
        }

        for (wallet, party) in parties.iter().filter(|(_, p)| !p.burned.is_empty()) {
            let kind = self.settlement_kind(&party.burned);
            let total_burned: Decimal = party.burned.values().sum();
            for (token_id, burned) in &party.burned {
                let usdc_delta = if party.burned.len() == 1 {
                    party.payout
                } else if total_burned.is_zero() {
                    Decimal::ZERO
                } else {
                    (party.payout * *burned / total_burned).round_dp(TOKEN_DECIMALS)
                };
                let (condition_id, outcome_index, mapping_quality) = self.map_token(token_id);
                let overflow_quality = if party.overflow {
                    DataQuality::AmountOverflow
                } else {
                    DataQuality::Valid
                };
                let price = if burned.is_zero() {
                    Decimal::ZERO
                } else {
                    (usdc_delta / *burned).round_dp(PRICE_DECIMALS)
                };
                let quality = [tx_quality, overflow_quality, mapping_quality]
                    .into_iter()
                    .find(|q| !q.is_valid())
                    .unwrap_or(DataQuality::Valid);
                trades.push(ReconstructedTrade {
                    tx_hash: tx_hash.clone(),
                    wallet: wallet.clone(),
                    condition_id,
                    outcome_index,
                    token_id: token_id.clone(),
                    direction: Direction::Sell,
                    kind,
                    shares: -*burned,
                    price: price.min(Decimal::ONE),
                    usd_value: usdc_delta.abs(),
                    usdc_delta,
                    confidence: Confidence::High,
                    quality,
                    block_number,
                    block_timestamp,
                });
            }
        }
        trades
    }

    /// Burning equal amounts of both slots of one condition is a merge;
    /// anything else is a redemption.
    fn settlement_kind(&self, burned: &BTreeMap<String, Decimal>) -> TradeKind {
        let mut slots: BTreeMap<String, Vec<(u8, Decimal)>> = BTreeMap::new();
        for (token_id, amount) in burned {
            if let Some(info) = self.registry.lookup(token_id) {
                slots
                    .entry(info.condition_id.clone())
                    .or_default()
                    .push((info.outcome_index, *amount));
            }
        }
        let merged = slots.len() == 1
            && slots.values().all(|legs| {
                legs.len() == 2 && legs[0].0 != legs[1].0 && legs[0].1 == legs[1].1
            })
            && burned.len() == 2;
        if merged {
            TradeKind::Merge
        } else {
            TradeKind::Redemption
        }
    }

    fn map_token(&self, token_id: &str) -> (String, u8, DataQuality) {
        let Some(info) = self.registry.lookup(token_id) else {
            return (String::new(), 0, DataQuality::UnmappedToken);
        };
        match parse_condition_id(&info.condition_id) {
            Err(q) => (String::new(), info.outcome_index, q),
            Ok(cid) if !info.binary || info.outcome_index > 1 => {
                (cid, info.outcome_index, DataQuality::NonBinaryOutcome)
            }
            Ok(cid) => (cid, info.outcome_index, DataQuality::Valid),
        }
    }
}

/// Token and USDC deltas net to zero across the transaction's fills.
/// Settlement rows burn against the contract and are not counted.
pub fn conserves(trades: &[ReconstructedTrade]) -> bool {
    let mut shares: HashMap<&str, Decimal> = HashMap::new();
    let mut usdc = Decimal::ZERO;
    for t in trades.iter().filter(|t| !t.kind.is_settlement()) {
        *shares.entry(t.token_id.as_str()).or_default() += t.shares;
        usdc += t.usdc_delta;
    }
    usdc.is_zero() && shares.values().all(|s| s.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Market, MarketSource, TransferKind};
    use rust_decimal_macros::dec;

    const CID: &str = "e3b1bc389210504ebcb9cffe4b0ed06ccac50561e0f24abb6379984cec030f00";
    const EXCHANGE: &str = "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e";
    const ALICE: &str = "0x00000000000000000000000000000000000a11ce";
    const BOB: &str = "0x0000000000000000000000000000000000000b0b";
    const CAROL: &str = "0x00000000000000000000000000000000000ca201";
    const CTF: &str = "0x4d97dcd97ec945f40cf65f87097ace5ea0476045";

    fn tx(n: u8) -> String {
        format!("0x{}", format!("{:02x}", n).repeat(32))
    }

    fn leg(
        tx_hash: &str,
        log_index: u64,
        from: &str,
        to: &str,
        token: Option<&str>,
        amount: &str,
    ) -> RawTransferEvent {
        RawTransferEvent {
            tx_hash: tx_hash.into(),
            log_index,
            batch_index: 0,
            block_number: 50_000_000,
            block_timestamp: Some(1_700_000_000),
            contract: "0x4d97dcd97ec945f40cf65f87097ace5ea0476045".into(),
            kind: if token.is_some() {
                TransferKind::Erc1155Single
            } else {
                TransferKind::Erc20
            },
            operator: None,
            from: from.into(),
            to: to.into(),
            token_id: token.map(String::from),
            amount: amount.into(),
        }
    }

    fn market(cid: &str, tokens: &[&str]) -> Market {
        Market {
            condition_id: cid.into(),
            question: "Will it rain?".into(),
            outcomes: tokens.iter().enumerate().map(|(i, _)| format!("o{}", i)).collect(),
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            category: Some("weather".into()),
            closed: false,
            volume: Decimal::ZERO,
            source: MarketSource::Api,
            updated_at: None,
            canonical: true,
        }
    }

    fn reconstructor() -> Reconstructor {
        let markets = vec![market(CID, &["111", "222"])];
        let infra: HashSet<String> = [EXCHANGE.to_string()].into_iter().collect();
        Reconstructor::new(TokenRegistry::from_markets(&markets), infra, &[])
    }

    fn settling() -> Reconstructor {
        let markets = vec![market(CID, &["111", "222"])];
        let infra: HashSet<String> = [EXCHANGE.to_string(), CTF.to_string()].into_iter().collect();
        Reconstructor::new(TokenRegistry::from_markets(&markets), infra, &[])
            .with_conditional_tokens(CTF)
    }

    /// Alice buys 500 YES from Bob for 200 USDC.
    fn bilateral(tx_hash: &str) -> Vec<RawTransferEvent> {
        vec![
            leg(tx_hash, 1, BOB, ALICE, Some("111"), "500000000"),
            leg(tx_hash, 2, ALICE, BOB, None, "200000000"),
        ]
    }

    #[test]
    fn bilateral_fill_yields_buy_and_sell() {
        let (trades, report) = reconstructor().reconstruct(bilateral(&tx(1)));
        assert_eq!(trades.len(), 2);
        let alice = trades.iter().find(|t| t.wallet == ALICE).unwrap();
        assert_eq!(alice.direction, Direction::Buy);
        assert_eq!(alice.shares, dec!(500));
        assert_eq!(alice.price, dec!(0.4));
        assert_eq!(alice.usd_value, dec!(200));
        assert_eq!(alice.usdc_delta, dec!(-200));
        assert_eq!(alice.confidence, Confidence::High);
        assert_eq!(alice.quality, DataQuality::Valid);
        assert_eq!(alice.condition_id, CID);
        assert_eq!(alice.outcome_index, 0);

        let bob = trades.iter().find(|t| t.wallet == BOB).unwrap();
        assert_eq!(bob.direction, Direction::Sell);
        assert_eq!(bob.shares, dec!(-500));
        assert!(conserves(&trades));
        assert_eq!(report.by_confidence.get(&Confidence::High), Some(&2));
    }

    #[test]
    fn duplicated_events_collapse_to_distinct_fills() {
        let mut events = bilateral(&tx(0xab));
        events.extend(bilateral(&tx(0xab)));
        let mut shouted = bilateral(&tx(0xab).to_uppercase());
        for e in &mut shouted {
            e.from = e.from.to_uppercase();
            e.to = e.to.to_uppercase();
        }
        events.extend(shouted);
        events.extend(bilateral(&tx(2)));

        let (trades, report) = reconstructor().reconstruct(events);
        let distinct: HashSet<FillId> = trades.iter().map(|t| t.fill_id()).collect();
        assert_eq!(trades.len(), 4);
        assert_eq!(distinct.len(), trades.len());
        assert_eq!(report.raw_events, 8);
        assert_eq!(report.duplicate_events, 4);
    }

    #[test]
    fn infrastructure_addresses_are_not_parties() {
        let t = tx(3);
        let events = vec![
            leg(&t, 1, EXCHANGE, ALICE, Some("111"), "100000000"),
            leg(&t, 2, ALICE, EXCHANGE, None, "45000000"),
            leg(&t, 3, CAROL, EXCHANGE, Some("111"), "100000000"),
            leg(&t, 4, EXCHANGE, CAROL, None, "45000000"),
            leg(&t, 5, BOB, EXCHANGE, Some("111"), "0"),
        ];
        let (trades, _) = reconstructor().reconstruct(events);
        assert_eq!(trades.len(), 2);
        assert!(trades.iter().all(|t| t.confidence == Confidence::High));

        let mut events = bilateral(&tx(4));
        events.push(leg(&tx(4), 3, EXCHANGE, CAROL, None, "1000000"));
        let (trades, _) = reconstructor().reconstruct(events);
        assert!(trades.iter().all(|t| t.confidence == Confidence::Medium));
    }

    #[test]
    fn unpaired_leg_is_low_confidence_not_dropped() {
        let t = tx(5);
        let events = vec![leg(&t, 1, BOB, ALICE, Some("111"), "10000000")];
        let (trades, report) = reconstructor().reconstruct(events);
        assert_eq!(trades.len(), 2);
        assert!(trades.iter().all(|t| t.confidence == Confidence::Low));
        assert!(trades.iter().all(|t| t.price.is_zero()));
        assert_eq!(report.unpaired_legs, 2);
    }

    #[test]
    fn non_conserving_two_party_fill_is_downgraded() {
        let t = tx(6);
        let events = vec![
            leg(&t, 1, BOB, ALICE, Some("111"), "500000000"),
            leg(&t, 2, ALICE, BOB, None, "200000000"),
            leg(&t, 3, EXCHANGE, BOB, None, "1000000"),
        ];
        let (trades, report) = reconstructor().reconstruct(events);
        assert!(trades.iter().all(|t| t.confidence == Confidence::Medium));
        assert_eq!(report.downgraded_transactions, 1);
    }

    #[test]
    fn multi_token_usdc_is_split_pro_rata() {
        let t = tx(7);
        let events = vec![
            leg(&t, 1, BOB, ALICE, Some("111"), "300000000"),
            leg(&t, 2, BOB, ALICE, Some("222"), "100000000"),
            leg(&t, 3, ALICE, BOB, None, "200000000"),
        ];
        let (trades, _) = reconstructor().reconstruct(events);
        let yes = trades.iter().find(|t| t.wallet == ALICE && t.token_id == "111").unwrap();
        let no = trades.iter().find(|t| t.wallet == ALICE && t.token_id == "222").unwrap();
        assert_eq!(yes.usdc_delta, dec!(-150));
        assert_eq!(no.usdc_delta, dec!(-50));
        assert_eq!(no.outcome_index, 1);
        assert_eq!(yes.confidence, Confidence::Medium);
    }

    #[test]
    fn unmappable_rows_are_quarantined_with_a_reason() {
        let sentinel = "0".repeat(64);
        let markets = vec![
            market(CID, &["111", "222"]),
            market(&sentinel, &["333", "444"]),
            market("0x1234", &["555", "666"]),
            market(&"d".repeat(64), &["777", "888", "999"]),
        ];
        let r = Reconstructor::new(TokenRegistry::from_markets(&markets), HashSet::new(), &[]);
        let cases = [
            ("000", DataQuality::UnmappedToken),
            ("333", DataQuality::SentinelConditionId),
            ("555", DataQuality::MalformedConditionId),
            ("777", DataQuality::NonBinaryOutcome),
        ];
        for (i, (token, expected)) in cases.iter().enumerate() {
            let t = tx(10 + i as u8);
            let events = vec![
                leg(&t, 1, BOB, ALICE, Some(*token), "10000000"),
                leg(&t, 2, ALICE, BOB, None, "5000000"),
            ];
            let (trades, report) = r.reconstruct(events);
            assert!(trades.iter().all(|t| t.quality == *expected), "token {}", token);
            assert_eq!(report.quarantined(), 2);
        }
    }

    #[test]
    fn bad_hashes_overflow_and_prices_are_tagged() {
        let r = reconstructor();
        let (trades, _) = r.reconstruct(bilateral("0xdeadbeef"));
        assert!(trades.iter().all(|t| t.quality == DataQuality::MalformedTxHash));

        let t = tx(20);
        let huge = "1".repeat(40);
        let (trades, _) = r.reconstruct(vec![
            leg(&t, 1, BOB, ALICE, Some("111"), &huge),
            leg(&t, 2, ALICE, BOB, None, "1000000"),
        ]);
        assert!(trades.iter().all(|t| t.quality == DataQuality::AmountOverflow));

        let t = tx(21);
        let (trades, _) = r.reconstruct(vec![
            leg(&t, 1, BOB, ALICE, Some("111"), "1000000"),
            leg(&t, 2, ALICE, BOB, None, "3000000"),
        ]);
        let alice = trades.iter().find(|t| t.wallet == ALICE).unwrap();
        assert_eq!(alice.quality, DataQuality::PriceOutOfRange);
        assert_eq!(alice.price, Decimal::ONE);
    }

    #[test]
    fn aliases_merge_executing_addresses() {
        let markets = vec![market(CID, &["111", "222"])];
        let aliases = vec![WalletAlias {
            address: CAROL.to_uppercase().replacen("0X", "0x", 1),
            wallet: ALICE.into(),
        }];
        let r = Reconstructor::new(TokenRegistry::from_markets(&markets), HashSet::new(), &aliases);
        let t = tx(30);
        let (trades, _) = r.reconstruct(vec![
            leg(&t, 1, BOB, CAROL, Some("111"), "500000000"),
            leg(&t, 2, ALICE, BOB, None, "200000000"),
        ]);
        let alice: Vec<_> = trades.iter().filter(|t| t.wallet == ALICE).collect();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].confidence, Confidence::High);
        assert!(trades.iter().all(|t| t.wallet != CAROL));
    }

    #[test]
    fn usdc_only_transactions_are_skipped() {
        let t = tx(40);
        let events = vec![leg(&t, 1, ALICE, BOB, None, "1000000")];
        let (trades, report) = reconstructor().reconstruct(events);
        assert!(trades.is_empty());
        assert_eq!(report.skipped_transactions, 1);
    }

    #[test]
    fn redemption_is_a_settlement_not_a_sell() {
        let r = settling();
        let t = tx(50);
        let (trades, report) = r.reconstruct(vec![
            leg(&t, 1, ALICE, ZERO_ADDRESS, Some("111"), "500000000"),
            leg(&t, 2, CTF, ALICE, None, "500000000"),
        ]);
        assert_eq!(trades.len(), 1);
        let redeem = &trades[0];
        assert_eq!(redeem.wallet, ALICE);
        assert_eq!(redeem.kind, TradeKind::Redemption);
        assert_eq!(redeem.shares, dec!(-500));
        assert_eq!(redeem.usdc_delta, dec!(500));
        assert_eq!(redeem.price, dec!(1));
        assert_eq!(redeem.quality, DataQuality::Valid);
        assert!(!redeem.is_nettable());
        assert_eq!(report.settlements, 1);
        assert_eq!(report.unpaired_legs, 0);

        let burn = leg(&tx(51), 1, ALICE, ZERO_ADDRESS, Some("222"), "200000000");
        let (losing, _) = r.reconstruct(vec![burn]);
        assert_eq!(losing[0].kind, TradeKind::Redemption);
        assert_eq!(losing[0].usdc_delta, Decimal::ZERO);
        assert_eq!(losing[0].price, Decimal::ZERO);
    }

    #[test]
    fn burning_both_slots_equally_is_a_merge() {
        let r = settling();
        let t = tx(52);
        let (trades, _) = r.reconstruct(vec![
            leg(&t, 1, ALICE, ZERO_ADDRESS, Some("111"), "100000000"),
            leg(&t, 2, ALICE, ZERO_ADDRESS, Some("222"), "100000000"),
            leg(&t, 3, CTF, ALICE, None, "100000000"),
        ]);
        assert_eq!(trades.len(), 2);
        assert!(trades.iter().all(|t| t.kind == TradeKind::Merge));
        let payout: Decimal = trades.iter().map(|t| t.usdc_delta).sum();
        assert_eq!(payout, dec!(100));
    }

    #[test]
    fn settlement_in_a_fill_transaction_keeps_fills_conserving() {
        let r = settling();
        let t = tx(53);
        let mut events = bilateral(&t);
        events.push(leg(&t, 3, CAROL, ZERO_ADDRESS, Some("222"), "10000000"));
        events.push(leg(&t, 4, CTF, CAROL, None, "10000000"));
        let (trades, report) = r.reconstruct(events);
        let fills: Vec<_> = trades.iter().filter(|t| t.kind == TradeKind::Fill).collect();
        assert_eq!(fills.len(), 2);
        assert!(fills.iter().all(|t| t.confidence == Confidence::High));
        assert!(conserves(&trades));
        assert_eq!(report.downgraded_transactions, 0);
    }

    #[test]
    fn token_coverage_counts_unmapped_rows() {
        let empty = Reconstructor::new(TokenRegistry::default(), HashSet::new(), &[]);
        let (_, report) = empty.reconstruct(bilateral(&tx(60)));
        assert_eq!(report.trades, 2);
        assert_eq!(report.token_coverage(), 0.0);

        let (_, report) = reconstructor().reconstruct(bilateral(&tx(61)));
        assert_eq!(report.token_coverage(), 1.0);
        assert_eq!(ReconstructionReport::default().token_coverage(), 1.0);
    }

    #[test]
    fn amounts_use_six_decimals() {
        assert_eq!(parse_amount("1500000"), Some(dec!(1.5)));
        assert_eq!(parse_amount("abc"), None);
        assert_eq!(parse_amount(&"9".repeat(39)), None);
    }
}
