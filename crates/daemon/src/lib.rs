//! The daemon-side core: keyholder table, value-dependent chain
//! replication, region transfers, and index-backed searches.
//!
//! The communication layer stays outside this crate. Everything that
//! crosses a process boundary goes through [`ChainLink`], so tests drive
//! whole clusters through an in-memory implementation.

use tessera_core::wire::Status;
use tessera_core::{EntityId, Nonce, TransferId, Version, XferSeq};

pub mod keyholder;
pub mod replication;
pub mod search;
pub mod transfer;

pub use keyholder::{KeyPair, Keyholder, KeyholderTable};
pub use replication::{AttrFuncall, ReplicationManager, WriteOp};
pub use search::{SearchError, SearchResult};

/// Messages that move along a region chain.
#[derive(Debug, Clone)]
pub enum ChainMessage {
    Put {
        version: Version,
        fresh: bool,
        key: Vec<u8>,
        value: Vec<Vec<u8>>,
    },
    Del {
        version: Version,
        key: Vec<u8>,
    },
    /// Carries a version across a subspace-internal region boundary when
    /// old and new values hash to different regions.
    Subspace {
        version: Version,
        key: Vec<u8>,
        value: Vec<Vec<u8>>,
        next_point: u64,
    },
    Pending {
        version: Version,
        key: Vec<u8>,
    },
    Ack {
        version: Version,
        key: Vec<u8>,
    },
}

/// Messages that drive a region handoff.
#[derive(Debug, Clone)]
pub enum TransferMessage {
    More {
        xfer_id: TransferId,
    },
    Data {
        xfer_id: TransferId,
        seq: XferSeq,
        version: Version,
        key: Vec<u8>,
        value: Option<Vec<Vec<u8>>>,
    },
    Done {
        xfer_id: TransferId,
    },
}

#[derive(Debug, Clone)]
pub enum Message {
    Chain(ChainMessage),
    Transfer(TransferMessage),
}

/// Terminal answer for one client request.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub status: Status,
    pub value: Option<(Vec<Vec<u8>>, Version)>,
}

impl ClientResponse {
    pub fn status(status: Status) -> Self {
        Self {
            status,
            value: None,
        }
    }
}

/// The narrow contract with the communication layer. Sends are
/// fire-and-forget: a dropped message is recovered by the periodic
/// retransmission sweep, never by the sender blocking.
pub trait ChainLink: Send + Sync + 'static {
    fn send(&self, from: EntityId, to: EntityId, msg: Message) -> bool;

    fn respond(&self, client: EntityId, nonce: Nonce, response: ClientResponse) -> bool;
}
