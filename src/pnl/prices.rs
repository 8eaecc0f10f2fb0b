use crate::ids::parse_condition_id;
use crate::model::{Confidence, EnrichedTrade, PriceObservation};
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Mark {
    /// (unix seconds, block) of the observation; later wins.
    at: (i64, u64),
    price: Decimal,
}

/// Latest observed price per (condition, outcome).
#[derive(Debug, Clone, Default)]
pub struct PriceBook {
    latest: HashMap<(String, u8), Mark>,
}

impl PriceBook {
    /// Marks from valid, paired fills plus external price observations.
    pub fn build(trades: &[EnrichedTrade], observations: &[PriceObservation]) -> Self {
        let mut book = PriceBook::default();
        for t in trades {
            let t = &t.trade;
            if !t.is_nettable() || t.confidence == Confidence::Low || t.price <= Decimal::ZERO {
                continue;
            }
            let at = (t.block_timestamp.unwrap_or(i64::MIN), t.block_number);
            book.observe(&t.condition_id, t.outcome_index, at, t.price);
        }
        for o in observations {
            let Ok(condition_id) = parse_condition_id(&o.condition_id) else {
                continue;
            };
            if o.price < Decimal::ZERO || o.price > Decimal::ONE {
                continue;
            }
            book.observe(&condition_id, o.outcome_index, (o.observed_at, 0), o.price);
        }
        book
    }

    fn observe(&mut self, condition_id: &str, outcome: u8, at: (i64, u64), price: Decimal) {
        let mark = Mark { at, price };
        self.latest
            .entry((condition_id.to_string(), outcome))
            .and_modify(|m| {
                if at >= m.at {
                    *m = mark;
                }
            })
            .or_insert(mark);
    }

    /// Latest price for the outcome, or the complement of the other binary
    /// outcome's latest price.
    pub fn price(&self, condition_id: &str, outcome: u8) -> Option<Decimal> {
        if let Some(m) = self.latest.get(&(condition_id.to_string(), outcome)) {
            return Some(m.price);
        }
        if outcome > 1 {
            return None;
        }
        self.latest
            .get(&(condition_id.to_string(), 1 - outcome))
            .map(|m| Decimal::ONE - m.price)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn obs(outcome: u8, price: Decimal, at: i64) -> PriceObservation {
        PriceObservation {
            condition_id: format!("0x{}", "A".repeat(64)),
            outcome_index: outcome,
            price,
            observed_at: at,
        }
    }

    #[test]
    fn newest_observation_wins() {
        let book = PriceBook::build(&[], &[obs(0, dec!(0.61), 20), obs(0, dec!(0.40), 10)]);
        assert_eq!(book.price(&"a".repeat(64), 0), Some(dec!(0.61)));
    }

    #[test]
    fn missing_outcome_uses_complement() {
        let book = PriceBook::build(&[], &[obs(1, dec!(0.3), 1)]);
        assert_eq!(book.price(&"a".repeat(64), 0), Some(dec!(0.7)));
        assert_eq!(book.price(&"b".repeat(64), 0), None);
    }

    #[test]
    fn out_of_range_observations_are_ignored() {
        let book = PriceBook::build(&[], &[obs(0, dec!(1.5), 1)]);
        assert!(book.is_empty());
    }
}
