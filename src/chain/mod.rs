mod events;

pub use events::{
    decode_log, event_topics, DecodeError, EventTopics, TRANSFER_BATCH_SIGNATURE,
    TRANSFER_SIGNATURE, TRANSFER_SINGLE_SIGNATURE,
};

use crate::error::{PipelineError, Result};
use crate::ids::normalize_address;
use std::collections::HashSet;

pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Block the CTF exchange was deployed at on Polygon.
pub const POLYGON_START_BLOCK: u64 = 33_605_403;

#[derive(Debug, Clone)]
pub struct ContractConfig {
    pub exchange: String,
    pub neg_risk_adapter: String,
    pub neg_risk_exchange: String,
    pub collateral: String,
    pub conditional_tokens: String,
}

impl ContractConfig {
    /// Contracts and the zero address: they move tokens on behalf of
    /// wallets but never own a position.
    pub fn infrastructure_addresses(&self) -> HashSet<String> {
        [
            &self.exchange,
            &self.neg_risk_adapter,
            &self.neg_risk_exchange,
            &self.collateral,
            &self.conditional_tokens,
        ]
        .into_iter()
        .map(|a| normalize_address(a))
        .chain(std::iter::once(ZERO_ADDRESS.to_string()))
        .collect()
    }
}

pub fn get_contract_config(chain_id: u64) -> Result<ContractConfig> {
    match chain_id {
        137 => Ok(ContractConfig {
            exchange: "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E".to_string(),
            neg_risk_adapter: "0xd91E80cF2E7be2e162c6513ceD06f1dD0dA35296".to_string(),
            neg_risk_exchange: "0xC5d563A36AE78145C45a50134d48A1215220f80a".to_string(),
            collateral: "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174".to_string(),
            conditional_tokens: "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045".to_string(),
        }),
        80002 => Ok(ContractConfig {
            exchange: "0xdFE02Eb6733538f8Ea35D585af8DE5958AD99E40".to_string(),
            neg_risk_adapter: "0xd91E80cF2E7be2e162c6513ceD06f1dD0dA35296".to_string(),
            neg_risk_exchange: "0xC5d563A36AE78145C45a50134d48A1215220f80a".to_string(),
            collateral: "0x9c4e1703476e875070ee25b56a58b008cfb8fa78".to_string(),
            conditional_tokens: "0x69308FB512518e39F9b16112fA8d994F4e2Bf8bB".to_string(),
        }),
        _ => Err(PipelineError::Config(format!(
            "unsupported chain id {}: use 137 (Polygon) or 80002 (Amoy)",
            chain_id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_set_is_normalized() {
        let cfg = get_contract_config(137).unwrap();
        let infra = cfg.infrastructure_addresses();
        assert!(infra.contains("0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e"));
        assert!(infra.contains(ZERO_ADDRESS));
        assert_eq!(infra.len(), 6);
    }

    #[test]
    fn unknown_chain_is_a_config_error() {
        assert!(matches!(get_contract_config(1), Err(PipelineError::Config(_))));
    }
}
