//! State-region handoff on reconfiguration.
//!
//! The owner snapshots the region and streams entries one at a time
//! under a credit window. The receiver buffers out-of-order entries,
//! applies them unless a live write has already superseded the key, and
//! converges when a streamed entry matches a live-path trigger exactly.
//!
//! Lock order: keyholder stripe, then transfer state, then the store.
//! The region and peer identity of a transfer are immutable and sit
//! outside the state mutex so the live path can read them lock-free.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use tessera_core::{
    ClusterConfig, DataStore, EntityId, RegionId, TransferId, Version, XferSeq,
};

use crate::keyholder::KeyPair;
use crate::replication::ReplicationManager;
use crate::{ChainLink, Message, TransferMessage};

/// In-flight entries a receiver will buffer before declaring the stream
/// broken. Exceeding it means the sender's credits and our deliveries
/// diverged beyond what reordering explains.
pub const TRANSFER_WINDOW: usize = 1000;

/// The conventional address of a transfer's receiving side: not a chain
/// position, so it never collides with replica numbers.
pub fn transfer_entity(region: RegionId) -> EntityId {
    EntityId::new(region, u8::MAX)
}

#[derive(Debug, Clone)]
pub struct XferOp {
    pub has_value: bool,
    pub version: Version,
    pub key: Vec<u8>,
    pub value: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct TransferInState {
    /// Entries waiting for their predecessors, keyed by stream sequence.
    pub ops: BTreeMap<XferSeq, XferOp>,
    /// Live-path commits observed while the transfer runs.
    pub triggers: BTreeSet<(Vec<u8>, Version)>,
    pub xferred_so_far: XferSeq,
    pub started: bool,
    pub go_live: bool,
    pub triggered: bool,
    pub failed: bool,
}

pub struct TransferIn {
    pub id: TransferId,
    pub region: RegionId,
    /// The entity streaming at us from the old owner.
    pub replicate_from: EntityId,
    pub state: Mutex<TransferInState>,
}

impl TransferIn {
    pub fn new(id: TransferId, region: RegionId, replicate_from: EntityId) -> Self {
        Self {
            id,
            region,
            replicate_from,
            state: Mutex::new(TransferInState::default()),
        }
    }

    /// Either the stream converged with a live write, or it completed
    /// and drained.
    pub fn complete(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.triggered || (state.go_live && state.ops.is_empty())
    }

    pub fn failed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).failed
    }
}

pub struct TransferOutState<Snap> {
    pub snapshot: Snap,
    pub seq: XferSeq,
}

pub struct TransferOut<Snap> {
    pub id: TransferId,
    /// Our entity in the region being handed off.
    pub me: EntityId,
    /// The receiving side at the new owner.
    pub dest: EntityId,
    pub state: Mutex<TransferOutState<Snap>>,
}

impl<S: DataStore, L: ChainLink> ReplicationManager<S, L> {
    /// Reconcile transfer objects with the freshly installed
    /// configuration: build what is newly ordered, drop what is gone.
    pub(crate) fn reconfigure_transfers(&self, cfg: &ClusterConfig) {
        let us = self.instance();
        let in_specs = cfg.transfers_to(us);
        let out_specs = cfg.transfers_from(us);

        let mut tin = self.transfers_in.lock().unwrap_or_else(|e| e.into_inner());
        let mut by_region = self
            .transfers_in_by_region
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut tout = self.transfers_out.lock().unwrap_or_else(|e| e.into_inner());

        for spec in &in_specs {
            if tin.contains_key(&spec.id) {
                continue;
            }

            // The stream comes from the outgoing owner's entity, which
            // may no longer be the chain tail once we joined it.
            let source = cfg
                .entities
                .iter()
                .find(|(e, i)| e.region == spec.region && **i == spec.from)
                .map(|(e, _)| *e)
                .or_else(|| cfg.tail_of(&spec.region));

            let Some(source) = source else {
                warn!(xfer = %spec.id, "inbound transfer has no source chain");
                continue;
            };

            info!(xfer = %spec.id, region = %spec.region, "initiating inbound transfer");
            let xfer = Arc::new(TransferIn::new(spec.id, spec.region, source));
            by_region.insert(spec.region, xfer.clone());
            tin.insert(spec.id, xfer);
        }

        for spec in &out_specs {
            if tout.contains_key(&spec.id) || tin.contains_key(&spec.id) {
                continue;
            }

            let Some(me) = cfg.our_entity(&spec.region, us) else {
                warn!(xfer = %spec.id, "outbound transfer for a region we do not host");
                continue;
            };

            let snapshot = match self.store().snapshot(&spec.region) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error!(xfer = %spec.id, error = %e, "failed to snapshot region");
                    continue;
                }
            };

            info!(xfer = %spec.id, region = %spec.region, "initiating outbound transfer");
            tout.insert(
                spec.id,
                Arc::new(TransferOut {
                    id: spec.id,
                    me,
                    dest: transfer_entity(spec.region),
                    state: Mutex::new(TransferOutState { snapshot, seq: 0 }),
                }),
            );
        }

        let live_in: HashSet<TransferId> = in_specs.iter().map(|t| t.id).collect();
        tin.retain(|id, xfer| {
            if live_in.contains(id) {
                return true;
            }

            info!(xfer = %id, "stopping inbound transfer");
            by_region.remove(&xfer.region);
            false
        });

        let live_out: HashSet<TransferId> = out_specs.iter().map(|t| t.id).collect();
        tout.retain(|id, _| {
            if live_out.contains(id) {
                return true;
            }

            info!(xfer = %id, "stopping outbound transfer");
            false
        });
    }

    /// Source side: one credit arrived, push the next snapshot entry or
    /// signal the end of the stream.
    pub(crate) fn transfer_more(&self, from: EntityId, to: EntityId, xfer_id: TransferId) {
        let xfer = {
            let tout = self.transfers_out.lock().unwrap_or_else(|e| e.into_inner());
            tout.get(&xfer_id).cloned()
        };

        let Some(xfer) = xfer else {
            return;
        };

        if from != xfer.dest || to != xfer.me {
            return;
        }

        let mut state = xfer.state.lock().unwrap_or_else(|e| e.into_inner());

        let msg = match state.snapshot.next() {
            Some(entry) => {
                state.seq += 1;
                TransferMessage::Data {
                    xfer_id,
                    seq: state.seq,
                    version: entry.version,
                    key: entry.key,
                    value: entry.value,
                }
            }
            None => TransferMessage::Done { xfer_id },
        };

        if !self.link().send(xfer.me, xfer.dest, Message::Transfer(msg)) {
            error!(xfer = %xfer_id, "failed to stream transfer entry");
        }
    }

    /// Receiving side: buffer, order, and apply one streamed entry.
    pub(crate) fn transfer_data(
        &self,
        from: EntityId,
        xfer_id: TransferId,
        seq: XferSeq,
        version: Version,
        key: Vec<u8>,
        value: Option<Vec<Vec<u8>>>,
    ) {
        let xfer = {
            let tin = self.transfers_in.lock().unwrap_or_else(|e| e.into_inner());
            tin.get(&xfer_id).cloned()
        };

        let Some(xfer) = xfer else {
            return;
        };

        if from != xfer.replicate_from {
            return;
        }

        let cfg = self.config();
        let Ok(space) = cfg.space(xfer.region.space) else {
            return;
        };

        // Order the puts to disk against the live path for this key.
        let kp = KeyPair::new(xfer.region, key);
        let _stripe = self.keyholder_lock(&kp);
        let mut state = xfer.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.triggered || state.failed {
            return;
        }

        // With more than a window of out-of-order entries buffered, an
        // earlier entry was lost for good: the stream cannot recover.
        if state.ops.len() > TRANSFER_WINDOW {
            error!(xfer = %xfer_id, "transfer window overflowed, aborting");
            state.failed = true;
            return;
        }

        state.ops.insert(
            seq,
            XferOp {
                has_value: value.is_some(),
                version,
                key: kp.key.clone(),
                value: value.unwrap_or_default(),
            },
        );

        while let Some((&next_seq, _)) = state.ops.first_key_value() {
            if next_seq != state.xferred_so_far + 1 {
                break;
            }

            let one = state.ops.get(&next_seq).cloned().unwrap();

            // A live write we acked for exactly this version means the
            // two streams have met.
            if state.triggers.contains(&(one.key.clone(), one.version)) {
                state.triggered = true;
                info!(xfer = %xfer_id, "transfer converged with live writes");
                return;
            }

            // A live write at a greater version has superseded this
            // entry; drop it on the floor.
            let superseded = state
                .triggers
                .range((one.key.clone(), one.version)..=(one.key.clone(), u64::MAX))
                .next()
                .is_some();

            if !superseded {
                let applied = if one.has_value {
                    self.store()
                        .put(&xfer.region, space, &one.key, &one.value, one.version)
                } else {
                    self.store().del(&xfer.region, space, &one.key)
                };

                if let Err(e) = applied {
                    error!(xfer = %xfer_id, error = %e, "store failure, aborting transfer");
                    state.failed = true;
                    return;
                }
            }

            state.xferred_so_far += 1;
            state.ops.pop_first();
        }

        state.started = true;
        drop(state);

        let me = transfer_entity(xfer.region);
        if !self
            .link()
            .send(me, xfer.replicate_from, Message::Transfer(TransferMessage::More { xfer_id }))
        {
            error!(xfer = %xfer_id, "failed to return transfer credit");
        }
    }

    /// Receiving side: the sender exhausted its snapshot.
    pub(crate) fn transfer_done(&self, from: EntityId, xfer_id: TransferId) {
        let xfer = {
            let tin = self.transfers_in.lock().unwrap_or_else(|e| e.into_inner());
            tin.get(&xfer_id).cloned()
        };

        let Some(xfer) = xfer else {
            return;
        };

        if from != xfer.replicate_from {
            return;
        }

        let mut state = xfer.state.lock().unwrap_or_else(|e| e.into_inner());
        state.started = true;

        if !state.go_live && state.ops.is_empty() {
            state.go_live = true;
            info!(xfer = %xfer_id, region = %xfer.region, "transferred region going live");
        }
    }

    /// Kick transfers that have not seen their first entry by handing
    /// out a full window of credits.
    pub(crate) fn start_transfers(&self) {
        let xfers: Vec<Arc<TransferIn>> = {
            let tin = self.transfers_in.lock().unwrap_or_else(|e| e.into_inner());
            tin.values().cloned().collect()
        };

        for xfer in xfers {
            let started = xfer.state.lock().unwrap_or_else(|e| e.into_inner()).started;

            if started {
                continue;
            }

            let me = transfer_entity(xfer.region);

            for _ in 0..TRANSFER_WINDOW {
                self.link().send(
                    me,
                    xfer.replicate_from,
                    Message::Transfer(TransferMessage::More { xfer_id: xfer.id }),
                );
            }
        }
    }

    /// Keep nudging live transfers so the final entries and the done
    /// signal are re-requested if they were lost.
    pub(crate) fn finish_transfers(&self) {
        let xfers: Vec<Arc<TransferIn>> = {
            let tin = self.transfers_in.lock().unwrap_or_else(|e| e.into_inner());
            tin.values().cloned().collect()
        };

        for xfer in xfers {
            let nudge = {
                let state = xfer.state.lock().unwrap_or_else(|e| e.into_inner());
                state.go_live && !state.triggered && !state.failed
            };

            if nudge {
                let me = transfer_entity(xfer.region);
                self.link().send(
                    me,
                    xfer.replicate_from,
                    Message::Transfer(TransferMessage::More { xfer_id: xfer.id }),
                );
            }
        }
    }

    /// Whether an inbound transfer has brought the region fully over.
    pub fn transfer_complete(&self, xfer_id: TransferId) -> bool {
        let tin = self.transfers_in.lock().unwrap_or_else(|e| e.into_inner());
        tin.get(&xfer_id).map(|x| x.complete()).unwrap_or(false)
    }

    /// Whether an inbound transfer was aborted.
    pub fn transfer_failed(&self, xfer_id: TransferId) -> bool {
        let tin = self.transfers_in.lock().unwrap_or_else(|e| e.into_inner());
        tin.get(&xfer_id).map(|x| x.failed()).unwrap_or(false)
    }
}
