use crate::chain::ContractConfig;
use crate::ids::normalize_address;
use crate::model::{RawTransferEvent, TransferKind};
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Log, H256, U256};
use ethers::utils::keccak256;
use thiserror::Error;

pub const TRANSFER_SINGLE_SIGNATURE: &str =
    "TransferSingle(address,address,address,uint256,uint256)";
pub const TRANSFER_BATCH_SIGNATURE: &str =
    "TransferBatch(address,address,address,uint256[],uint256[])";
pub const TRANSFER_SIGNATURE: &str = "Transfer(address,address,uint256)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTopics {
    pub transfer_single: H256,
    pub transfer_batch: H256,
    pub transfer: H256,
}

pub fn event_topics() -> EventTopics {
    EventTopics {
        transfer_single: H256::from(keccak256(TRANSFER_SINGLE_SIGNATURE)),
        transfer_batch: H256::from(keccak256(TRANSFER_BATCH_SIGNATURE)),
        transfer: H256::from(keccak256(TRANSFER_SIGNATURE)),
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("log was removed by a reorg")]
    Removed,
    #[error("log is missing {0}")]
    MissingField(&'static str),
    #[error("unexpected event topic {0}")]
    UnknownTopic(String),
    #[error("event emitted by unexpected contract {0}")]
    UnknownContract(String),
    #[error("malformed event payload: {0}")]
    Malformed(String),
}

fn topic_address(topic: &H256) -> String {
    format!("{:#x}", Address::from_slice(&topic.as_bytes()[12..]))
}

fn uint(token: &Token) -> Result<U256, DecodeError> {
    match token {
        Token::Uint(v) => Ok(*v),
        other => Err(DecodeError::Malformed(format!("expected uint256, got {:?}", other))),
    }
}

fn uint_array(token: &Token) -> Result<Vec<U256>, DecodeError> {
    match token {
        Token::Array(items) => items.iter().map(uint).collect(),
        other => Err(DecodeError::Malformed(format!("expected uint256[], got {:?}", other))),
    }
}

/// Decode a TransferSingle / TransferBatch / ERC-20 Transfer log into raw
/// transfer rows. Block timestamps are filled in later by the ingester.
pub fn decode_log(
    log: &Log,
    contracts: &ContractConfig,
) -> Result<Vec<RawTransferEvent>, DecodeError> {
    if log.removed == Some(true) {
        return Err(DecodeError::Removed);
    }
    let tx_hash = log.transaction_hash.ok_or(DecodeError::MissingField("transactionHash"))?;
    let log_index = log.log_index.ok_or(DecodeError::MissingField("logIndex"))?;
    let log_index = u64::try_from(log_index)
        .map_err(|_| DecodeError::Malformed("log index overflow".into()))?;
    let block_number = log.block_number.ok_or(DecodeError::MissingField("blockNumber"))?.as_u64();
    let topic0 = log.topics.first().ok_or(DecodeError::MissingField("topic0"))?;

    let contract = format!("{:#x}", log.address);
    let topics = event_topics();
    let base = RawTransferEvent {
        tx_hash: format!("{:#x}", tx_hash),
        log_index,
        batch_index: 0,
        block_number,
        block_timestamp: None,
        contract: contract.clone(),
        kind: TransferKind::Erc20,
        operator: None,
        from: String::new(),
        to: String::new(),
        token_id: None,
        amount: String::new(),
    };

    if *topic0 == topics.transfer_single || *topic0 == topics.transfer_batch {
        if contract != normalize_address(&contracts.conditional_tokens) {
            return Err(DecodeError::UnknownContract(contract));
        }
        if log.topics.len() < 4 {
            return Err(DecodeError::Malformed("ERC-1155 transfer needs 4 topics".into()));
        }
        let operator = topic_address(&log.topics[1]);
        let from = topic_address(&log.topics[2]);
        let to = topic_address(&log.topics[3]);

        if *topic0 == topics.transfer_single {
            let tokens = abi::decode(&[ParamType::Uint(256), ParamType::Uint(256)], &log.data)
                .map_err(|e| DecodeError::Malformed(e.to_string()))?;
            let id = uint(&tokens[0])?;
            let value = uint(&tokens[1])?;
            return Ok(vec![RawTransferEvent {
                kind: TransferKind::Erc1155Single,
                operator: Some(operator),
                from,
                to,
                token_id: Some(id.to_string()),
                amount: value.to_string(),
                ..base
            }]);
        }

        let array = ParamType::Array(Box::new(ParamType::Uint(256)));
        let tokens = abi::decode(&[array.clone(), array], &log.data)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let ids = uint_array(&tokens[0])?;
        let values = uint_array(&tokens[1])?;
        if ids.len() != values.len() {
            return Err(DecodeError::Malformed(format!(
                "batch has {} ids but {} values",
                ids.len(),
                values.len()
            )));
        }
        return ids
            .into_iter()
            .zip(values)
            .enumerate()
            .map(|(i, (id, value))| {
                let batch_index = u32::try_from(i)
                    .map_err(|_| DecodeError::Malformed("batch too large".into()))?;
                Ok(RawTransferEvent {
                    batch_index,
                    kind: TransferKind::Erc1155Batch,
                    operator: Some(operator.clone()),
                    from: from.clone(),
                    to: to.clone(),
                    token_id: Some(id.to_string()),
                    amount: value.to_string(),
                    ..base.clone()
                })
            })
            .collect();
    }

    if *topic0 == topics.transfer {
        if contract != normalize_address(&contracts.collateral) {
            return Err(DecodeError::UnknownContract(contract));
        }
        if log.topics.len() < 3 {
            return Err(DecodeError::Malformed("ERC-20 transfer needs 3 topics".into()));
        }
        let tokens = abi::decode(&[ParamType::Uint(256)], &log.data)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        return Ok(vec![RawTransferEvent {
            kind: TransferKind::Erc20,
            from: topic_address(&log.topics[1]),
            to: topic_address(&log.topics[2]),
            amount: uint(&tokens[0])?.to_string(),
            ..base
        }]);
    }

    Err(DecodeError::UnknownTopic(format!("{:#x}", topic0)))
}
