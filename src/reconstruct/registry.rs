use crate::ids::{normalize_condition_id, normalize_token_id};
use crate::model::Market;
use std::collections::HashMap;
use tracing::warn;

/// Where a position id lives: its condition and outcome slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub condition_id: String,
    pub outcome_index: u8,
    pub binary: bool,
}

/// Position id -> (condition, outcome) lookup built from the market catalog.
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    tokens: HashMap<String, TokenInfo>,
    conflicts: usize,
}

impl TokenRegistry {
    /// `tokens[i]` of a market is the position id of outcome slot `i`. The
    /// first market to claim a token keeps it.
    pub fn from_markets<'a>(markets: impl IntoIterator<Item = &'a Market>) -> Self {
        let mut registry = TokenRegistry::default();
        for market in markets {
            let condition_id = normalize_condition_id(&market.condition_id);
            let binary = market.is_binary();
            for (slot, raw) in market.tokens.iter().enumerate() {
                let (Some(token), Ok(outcome_index)) =
                    (normalize_token_id(raw), u8::try_from(slot))
                else {
                    continue;
                };
                let info = TokenInfo {
                    condition_id: condition_id.clone(),
                    outcome_index,
                    binary,
                };
                match registry.tokens.get(&token) {
                    Some(existing) if *existing != info => {
                        warn!(
                            "token {} claimed by {} and {}; keeping the first",
                            token, existing.condition_id, info.condition_id
                        );
                        registry.conflicts += 1;
                    }
                    Some(_) => {}
                    None => {
                        registry.tokens.insert(token, info);
                    }
                }
            }
        }
        registry
    }

    pub fn lookup(&self, token_id: &str) -> Option<&TokenInfo> {
        self.tokens.get(token_id)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn conflicts(&self) -> usize {
        self.conflicts
    }
}
