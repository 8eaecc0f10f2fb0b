//! Completeness audit for a single wallet: what the raw transfer store
//! holds for it against what made it into the canonical trade table.

use crate::ids::normalize_address;
use crate::model::{EventKey, RawTransferEvent, ReconstructedTrade, TradeKind, WalletAlias};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

const UNDATED: &str = "undated";
const MAX_SAMPLES: usize = 10;

/// One raw position transfer touching the wallet, for spot checks against
/// a block explorer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferSample {
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub at: Option<DateTime<Utc>>,
    pub inbound: bool,
    pub counterparty: String,
    pub token_id: Option<String>,
    pub amount: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonthlyActivity {
    pub transfers: u64,
    pub inbound: u64,
    pub outbound: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalletAudit {
    pub wallet: String,
    /// The wallet plus every executing address aliased to it.
    pub addresses: Vec<String>,
    pub token_transfers: u64,
    pub inbound: u64,
    pub outbound: u64,
    pub first_transfer_at: Option<DateTime<Utc>>,
    pub last_transfer_at: Option<DateTime<Utc>>,
    /// Keyed by `YYYY-MM`.
    pub monthly: BTreeMap<String, MonthlyActivity>,
    pub canonical_trades: u64,
    pub quarantined_trades: u64,
    /// Redemption and merge rows; not trading volume.
    pub settlements: BTreeMap<TradeKind, u64>,
    pub canonical_volume: Decimal,
    pub reference_volume: Option<Decimal>,
    /// canonical / reference volume.
    pub volume_coverage: Option<Decimal>,
    /// Most recent transfers first.
    pub samples: Vec<TransferSample>,
}

pub fn audit_wallet(
    wallet: &str,
    aliases: &[WalletAlias],
    events: &[RawTransferEvent],
    trades: &[ReconstructedTrade],
    reference_volume: Option<Decimal>,
) -> WalletAudit {
    let wallet = normalize_address(wallet);
    let mut addresses: BTreeSet<String> = aliases
        .iter()
        .filter(|a| normalize_address(&a.wallet) == wallet)
        .map(|a| normalize_address(&a.address))
        .collect();
    addresses.insert(wallet.clone());

    let mut audit = WalletAudit {
        wallet: wallet.clone(),
        addresses: addresses.iter().cloned().collect(),
        token_transfers: 0,
        inbound: 0,
        outbound: 0,
        first_transfer_at: None,
        last_transfer_at: None,
        monthly: BTreeMap::new(),
        canonical_trades: 0,
        quarantined_trades: 0,
        settlements: BTreeMap::new(),
        canonical_volume: Decimal::ZERO,
        reference_volume,
        volume_coverage: None,
        samples: Vec::new(),
    };
    let mut samples = Vec::new();

    let mut seen: HashSet<EventKey> = HashSet::new();
    for e in events.iter().filter(|e| e.kind.is_conditional_token()) {
        let from = normalize_address(&e.from);
        let to = normalize_address(&e.to);
        let inbound = addresses.contains(&to);
        let outbound = addresses.contains(&from);
        if !(inbound || outbound) {
            continue;
        }
        let mut key = e.key();
        key.tx_hash = key.tx_hash.to_ascii_lowercase();
        if !seen.insert(key) {
            continue;
        }

        audit.token_transfers += 1;
        audit.inbound += u64::from(inbound);
        audit.outbound += u64::from(outbound);

        let at = e.block_timestamp.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));
        if let Some(at) = at {
            audit.first_transfer_at = Some(audit.first_transfer_at.map_or(at, |f| f.min(at)));
            audit.last_transfer_at = Some(audit.last_transfer_at.map_or(at, |l| l.max(at)));
        }
        let month = at.map_or_else(|| UNDATED.to_string(), |at| at.format("%Y-%m").to_string());
        let bucket = audit.monthly.entry(month).or_default();
        bucket.transfers += 1;
        bucket.inbound += u64::from(inbound);
        bucket.outbound += u64::from(outbound);

        samples.push(TransferSample {
            tx_hash: e.tx_hash.to_ascii_lowercase(),
            log_index: e.log_index,
            block_number: e.block_number,
            at,
            inbound,
            counterparty: if inbound { from } else { to },
            token_id: e.token_id.clone(),
            amount: e.amount.clone(),
        });
    }
    samples.sort_by(|a, b| (b.block_number, b.log_index).cmp(&(a.block_number, a.log_index)));
    samples.truncate(MAX_SAMPLES);
    audit.samples = samples;

    for t in trades.iter().filter(|t| t.wallet == wallet) {
        if t.kind.is_settlement() {
            *audit.settlements.entry(t.kind).or_default() += 1;
        } else if t.quality.is_valid() {
            audit.canonical_trades += 1;
            audit.canonical_volume += t.usd_value;
        } else {
            audit.quarantined_trades += 1;
        }
    }

    audit.volume_coverage = reference_volume
        .filter(|r| *r > Decimal::ZERO)
        .map(|r| (audit.canonical_volume / r).round_dp(4));
    audit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Confidence, DataQuality, Direction, TransferKind};
    use rust_decimal_macros::dec;

    const W: &str = "0x00000000000000000000000000000000000a11ce";
    const PROXY: &str = "0x000000000000000000000000000000000000beef";
    const OTHER: &str = "0x0000000000000000000000000000000000000b0b";

    fn transfer(log_index: u64, from: &str, to: &str, ts: Option<i64>) -> RawTransferEvent {
        RawTransferEvent {
            tx_hash: format!("0x{}", "c".repeat(64)),
            log_index,
            batch_index: 0,
            block_number: 1,
            block_timestamp: ts,
            contract: "0x4d97dcd97ec945f40cf65f87097ace5ea0476045".into(),
            kind: TransferKind::Erc1155Single,
            operator: None,
            from: from.into(),
            to: to.into(),
            token_id: Some("1".into()),
            amount: "1000000".into(),
        }
    }

    fn trade(quality: DataQuality, usd: Decimal) -> ReconstructedTrade {
        ReconstructedTrade {
            tx_hash: format!("0x{}", "c".repeat(64)),
            wallet: W.into(),
            condition_id: "d".repeat(64),
            outcome_index: 0,
            token_id: "1".into(),
            direction: Direction::Buy,
            kind: TradeKind::Fill,
            shares: dec!(10),
            price: dec!(0.5),
            usd_value: usd,
            usdc_delta: -usd,
            confidence: Confidence::High,
            quality,
            block_number: 1,
            block_timestamp: None,
        }
    }

    #[test]
    fn counts_transfers_across_aliases_and_months() {
        let aliases = vec![WalletAlias {
            address: PROXY.to_uppercase().replacen("0X", "0x", 1),
            wallet: W.into(),
        }];
        // 2023-11-14 and 2024-01-01.
        let events = vec![
            transfer(1, OTHER, W, Some(1_700_000_000)),
            transfer(1, OTHER, W, Some(1_700_000_000)),
            transfer(2, PROXY, OTHER, Some(1_704_067_200)),
            transfer(3, OTHER, OTHER, Some(1_704_067_200)),
            transfer(4, OTHER, PROXY, None),
        ];
        let trades = vec![
            trade(DataQuality::Valid, dec!(50)),
            trade(DataQuality::UnmappedToken, dec!(9)),
        ];
        let audit = audit_wallet(W, &aliases, &events, &trades, Some(dec!(200)));

        assert_eq!(audit.addresses.len(), 2);
        assert_eq!(audit.token_transfers, 3);
        assert_eq!(audit.inbound, 2);
        assert_eq!(audit.outbound, 1);
        assert_eq!(audit.monthly["2023-11"].inbound, 1);
        assert_eq!(audit.monthly["2024-01"].outbound, 1);
        assert_eq!(audit.monthly[UNDATED].transfers, 1);
        assert_eq!(audit.first_transfer_at.map(|t| t.timestamp()), Some(1_700_000_000));
        assert_eq!(audit.last_transfer_at.map(|t| t.timestamp()), Some(1_704_067_200));
        assert_eq!(audit.canonical_trades, 1);
        assert_eq!(audit.quarantined_trades, 1);
        assert_eq!(audit.canonical_volume, dec!(50));
        assert_eq!(audit.volume_coverage, Some(dec!(0.25)));
        assert_eq!(audit.samples.len(), 3);
        assert_eq!(audit.samples[0].log_index, 4);
        assert!(audit.samples[0].inbound);
        assert_eq!(audit.samples[1].counterparty, OTHER);
        assert!(!audit.samples[1].inbound);
    }

    #[test]
    fn samples_are_capped_and_newest_first() {
        let events: Vec<RawTransferEvent> = (0..25)
            .map(|i| {
                let mut e = transfer(i, OTHER, W, Some(1_700_000_000 + i as i64));
                e.block_number = 100 + i;
                e
            })
            .collect();
        let audit = audit_wallet(W, &[], &events, &[], None);
        assert_eq!(audit.token_transfers, 25);
        assert_eq!(audit.samples.len(), MAX_SAMPLES);
        assert_eq!(audit.samples[0].block_number, 124);
        assert_eq!(audit.samples[MAX_SAMPLES - 1].block_number, 115);
    }

    #[test]
    fn redemptions_are_not_trading_volume() {
        let mut redeem = trade(DataQuality::Valid, dec!(500));
        redeem.kind = TradeKind::Redemption;
        redeem.token_id = "2".into();
        let trades = vec![trade(DataQuality::Valid, dec!(200)), redeem];
        let audit = audit_wallet(W, &[], &[], &trades, Some(dec!(200)));
        assert_eq!(audit.canonical_trades, 1);
        assert_eq!(audit.canonical_volume, dec!(200));
        assert_eq!(audit.settlements[&TradeKind::Redemption], 1);
        assert_eq!(audit.volume_coverage, Some(dec!(1)));
    }

    #[test]
    fn zero_reference_volume_gives_no_coverage() {
        let audit = audit_wallet(W, &[], &[], &[], Some(Decimal::ZERO));
        assert_eq!(audit.volume_coverage, None);
        assert_eq!(audit.token_transfers, 0);
    }
}
