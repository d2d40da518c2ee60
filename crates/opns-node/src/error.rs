use bitcoin::Txid;
use opns_common::OutpointParseError;
use opns_index::EventIndexError;
use opns_overlay::EngineError;
use opns_protocol::beef::BeefError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("key-value database: {0}")]
    Kv(#[from] kv::Error),

    #[error("storage: {0}")]
    Store(#[from] opns_storage::kv_store::KvStoreError),

    #[error("event index: {0}")]
    Index(#[from] EventIndexError),

    #[error("engine: {0}")]
    Engine(#[from] EngineError),

    #[error("network: {0}")]
    Network(#[from] reqwest::Error),

    #[error("envelope: {0}")]
    Beef(#[from] BeefError),

    #[error("transaction decode: {0}")]
    Consensus(#[from] bitcoin::consensus::encode::Error),

    #[error("bad outpoint: {0}")]
    Outpoint(#[from] OutpointParseError),

    #[error("fetched body for {0} does not hash to it")]
    TxidMismatch(Txid),

    #[error("spend endpoint returned {0} bytes, expected 0 or 32")]
    BadSpendResponse(usize),

    #[error("corrupt queue entry: {0}")]
    CorruptQueue(String),
}
