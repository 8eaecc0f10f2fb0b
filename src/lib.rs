pub mod audit;
pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod ids;
pub mod ingest;
pub mod mapping;
pub mod model;
pub mod pipeline;
pub mod pnl;
pub mod reconstruct;
pub mod rpc;
pub mod validate;
pub mod warehouse;

pub use audit::{audit_wallet, TransferSample, WalletAudit};
pub use chain::{get_contract_config, ContractConfig};
pub use checkpoint::Checkpoint;
pub use config::Config;
pub use error::{PipelineError, Result};
pub use ingest::{ChainLogSource, FetchedBatch, IngestReport, LogSource, WorkerOutcome};
pub use mapping::{Enricher, MappingReport};
pub use model::{
    Confidence, DataQuality, Direction, EnrichedTrade, Market, MarketSource, PnlStatus,
    RawTransferEvent, ReconstructedTrade, Resolution, TradeKind, WalletAlias, WalletPnl,
    WalletPosition,
};
pub use pipeline::{AggregateReport, Pipeline, StatusReport};
pub use pnl::PriceBook;
pub use reconstruct::{ReconstructionReport, Reconstructor, TokenRegistry};
pub use warehouse::{tables, Warehouse};
