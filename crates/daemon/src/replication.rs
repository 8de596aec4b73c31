//! Value-dependent chain replication.
//!
//! Client mutations enter at the point leader (entity 0 of the key's
//! region in subspace 0), travel forward around the subspace ring, come
//! back as a `Pending` notice, and are committed by the point leader
//! before an `Ack` sweeps the ring in reverse committing everyone else.
//! When an update moves a record between regions of the same subspace,
//! the `Subspace` message carries it across the boundary and both the
//! old and the new region participate in the chain.
//!
//! Handlers are idempotent; lost messages are recovered exclusively by
//! the periodic retransmission sweep.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tessera_core::hyperspace::replication_point;
use tessera_core::wire::Status;
use tessera_core::{
    AttrNum, AttributeCheck, ClusterConfig, DataStore, EntityId, InstanceId, Nonce, RegionId,
    StorageConfig, Version,
};
use tessera_types::{point_hashes, Funcall, TypeError, TypeInfo};

use crate::keyholder::{DeferredOp, KeyPair, Keyholder, KeyholderTable, PendingOp, DEFAULT_LOCK_STRIPES};
use crate::transfer::{TransferIn, TransferOut};
use crate::{ChainLink, ChainMessage, ClientResponse, Message, TransferMessage};

pub const DEFAULT_RETRANSMIT_INTERVAL: Duration = Duration::from_millis(250);

/// One funcall aimed at one attribute of a space.
#[derive(Debug, Clone)]
pub struct AttrFuncall {
    pub attr: AttrNum,
    pub func: Funcall,
}

/// The client-visible mutations.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put(Vec<Vec<u8>>),
    CondPut {
        checks: Vec<AttributeCheck>,
        value: Vec<Vec<u8>>,
    },
    Atomic(Vec<AttrFuncall>),
    Del,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientOp {
    region: RegionId,
    client: EntityId,
    nonce: Nonce,
}

pub struct ReplicationManager<S: DataStore, L: ChainLink> {
    us: InstanceId,
    store: S,
    link: Arc<L>,
    config: RwLock<Arc<ClusterConfig>>,
    keyholders: KeyholderTable,
    clientops: Mutex<HashSet<ClientOp>>,
    pub(crate) transfers_in: Mutex<std::collections::HashMap<tessera_core::TransferId, Arc<TransferIn>>>,
    pub(crate) transfers_in_by_region: Mutex<std::collections::HashMap<RegionId, Arc<TransferIn>>>,
    pub(crate) transfers_out: Mutex<std::collections::HashMap<tessera_core::TransferId, Arc<TransferOut<S::Snapshot>>>>,
    retransmit_interval: Duration,
}

impl<S: DataStore, L: ChainLink> ReplicationManager<S, L> {
    pub fn new(us: InstanceId, store: S, link: Arc<L>, storage: &StorageConfig) -> Self {
        Self {
            us,
            store,
            link,
            config: RwLock::new(Arc::new(ClusterConfig::default())),
            keyholders: KeyholderTable::new(storage.lock_stripes.unwrap_or(DEFAULT_LOCK_STRIPES)),
            clientops: Mutex::new(HashSet::new()),
            transfers_in: Mutex::new(Default::default()),
            transfers_in_by_region: Mutex::new(Default::default()),
            transfers_out: Mutex::new(Default::default()),
            retransmit_interval: storage
                .retransmit_interval
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RETRANSMIT_INTERVAL),
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.us
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> Arc<ClusterConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Install a new coordinator configuration atomically. Deferred
    /// updates are cleared wholesale, keyholders for regions we no
    /// longer host are dropped, and their client operations surface as
    /// `RECONFIGURE`.
    pub fn reconfigure(&self, newconfig: ClusterConfig) {
        let newconfig = Arc::new(newconfig);

        self.reconfigure_transfers(&newconfig);

        *self.config.write().unwrap_or_else(|e| e.into_inner()) = newconfig.clone();

        let ours: HashSet<RegionId> = newconfig.regions_on(self.us).into_iter().collect();
        let mut displaced: Vec<(EntityId, Nonce)> = Vec::new();

        self.keyholders.for_each(|kp, kh| {
            kh.deferred.clear();

            if ours.contains(&kp.region) {
                return true;
            }

            for op in kh.pending.values_mut().chain(kh.blocked.values_mut()) {
                if let Some(client) = op.client.take() {
                    displaced.push(client);
                }
            }

            false
        });

        {
            let mut clientops = self.clientops.lock().unwrap_or_else(|e| e.into_inner());
            clientops.retain(|co| ours.contains(&co.region));
        }

        for (client, nonce) in displaced {
            self.link
                .respond(client, nonce, ClientResponse::status(Status::Reconfigure));
        }

        info!(version = newconfig.version, "installed configuration");
    }

    /// Dispatch one incoming message to its handler.
    pub fn deliver(&self, from: EntityId, to: EntityId, msg: Message) {
        match msg {
            Message::Chain(ChainMessage::Put {
                version,
                fresh,
                key,
                value,
            }) => self.chain_common(true, from, to, version, fresh, key, value),
            Message::Chain(ChainMessage::Del { version, key }) => {
                self.chain_common(false, from, to, version, false, key, Vec::new())
            }
            Message::Chain(ChainMessage::Subspace {
                version,
                key,
                value,
                next_point,
            }) => self.chain_subspace(from, to, version, key, value, next_point),
            Message::Chain(ChainMessage::Pending { version, key }) => {
                self.chain_pending(from, to, version, key)
            }
            Message::Chain(ChainMessage::Ack { version, key }) => {
                self.chain_ack(from, to, version, key)
            }
            Message::Transfer(TransferMessage::More { xfer_id }) => {
                self.transfer_more(from, to, xfer_id)
            }
            Message::Transfer(TransferMessage::Data {
                xfer_id,
                seq,
                version,
                key,
                value,
            }) => self.transfer_data(from, xfer_id, seq, version, key, value),
            Message::Transfer(TransferMessage::Done { xfer_id }) => {
                self.transfer_done(from, xfer_id)
            }
        }
    }

    // ------------------------------------------------------------------
    // client path
    // ------------------------------------------------------------------

    pub fn client_put(&self, from: EntityId, to: EntityId, nonce: Nonce, key: Vec<u8>, value: Vec<Vec<u8>>) {
        self.client_write(from, to, nonce, key, WriteOp::Put(value));
    }

    pub fn client_del(&self, from: EntityId, to: EntityId, nonce: Nonce, key: Vec<u8>) {
        self.client_write(from, to, nonce, key, WriteOp::Del);
    }

    pub fn client_cond_put(
        &self,
        from: EntityId,
        to: EntityId,
        nonce: Nonce,
        key: Vec<u8>,
        checks: Vec<AttributeCheck>,
        value: Vec<Vec<u8>>,
    ) {
        self.client_write(from, to, nonce, key, WriteOp::CondPut { checks, value });
    }

    pub fn client_atomic(
        &self,
        from: EntityId,
        to: EntityId,
        nonce: Nonce,
        key: Vec<u8>,
        funcs: Vec<AttrFuncall>,
    ) {
        self.client_write(from, to, nonce, key, WriteOp::Atomic(funcs));
    }

    /// Point reads bypass the chain: the point leader answers from its
    /// committed store.
    pub fn client_get(&self, from: EntityId, to: EntityId, nonce: Nonce, key: Vec<u8>) {
        let cfg = self.config();

        if !self.is_point_leader(&cfg, &to) {
            self.link
                .respond(from, nonce, ClientResponse::status(Status::Reconfigure));
            return;
        }

        let response = match self.store.get(&to.region, &key) {
            Ok(Some((value, version))) => ClientResponse {
                status: Status::Success,
                value: Some((value, version)),
            },
            Ok(None) => ClientResponse::status(Status::NotFound),
            Err(e) => {
                error!(error = %e, "store read failed");
                ClientResponse::status(Status::ServerError)
            }
        };

        self.link.respond(from, nonce, response);
    }

    fn client_write(&self, from: EntityId, to: EntityId, nonce: Nonce, key: Vec<u8>, op: WriteOp) {
        let cfg = self.config();

        if !from.is_client() {
            debug!(from = %from, "dropping client-only message from a non-client");
            return;
        }

        if !self.is_point_leader(&cfg, &to) {
            self.link
                .respond(from, nonce, ClientResponse::status(Status::Reconfigure));
            return;
        }

        // A client op that was committed before a restart is answered
        // from its durable marker instead of being executed again.
        if let Ok(true) = self.store.is_acked(&to.region, &to.region, nonce) {
            self.link
                .respond(from, nonce, ClientResponse::status(Status::Success));
            return;
        }

        let co = ClientOp {
            region: to.region,
            client: from,
            nonce,
        };

        {
            let mut clientops = self.clientops.lock().unwrap_or_else(|e| e.into_inner());

            if !clientops.insert(co.clone()) {
                return;
            }
        }

        let kp = KeyPair::new(to.region, key);
        let _stripe = self.keyholders.lock(&kp);
        let kh_arc = self.keyholders.get_or_create(&kp);
        let mut kh = kh_arc.lock().unwrap_or_else(|e| e.into_inner());

        let Ok(space) = cfg.space(kp.region.space) else {
            self.respond(&co, ClientResponse::status(Status::UnknownSpace));
            return;
        };

        let arity = match &op {
            WriteOp::Put(value) | WriteOp::CondPut { value, .. } => Some(value.len() + 1),
            _ => None,
        };

        if arity.is_some_and(|n| n != space.dimensionality()) {
            self.respond(&co, ClientResponse::status(Status::WrongArity));
            return;
        }

        if let WriteOp::Put(value) | WriteOp::CondPut { value, .. } = &op {
            let valid = space
                .attrs
                .iter()
                .skip(1)
                .zip(value.iter())
                .all(|(attr, bytes)| TypeInfo::of(attr.datatype).validate(bytes));

            if !valid {
                self.respond(&co, ClientResponse::status(Status::ServerError));
                return;
            }
        }

        // Find the most recent version: tail of blocked, else tail of
        // pending, else disk.
        let mut blocked = !kh.blocked.is_empty();
        let (oldversion, has_old, oldvalue) = match kh.latest() {
            Some((version, latest)) => (version, latest.has_value, latest.value.clone()),
            None => {
                let Some((has_disk, diskvalue, diskversion)) = self.from_disk(&kp.region, &kp.key)
                else {
                    self.respond(&co, ClientResponse::status(Status::ServerError));
                    return;
                };

                (diskversion, has_disk, diskvalue)
            }
        };

        let (has_value, value) = match op {
            WriteOp::Put(value) => (true, value),
            WriteOp::Del => (false, Vec::new()),
            WriteOp::CondPut { checks, value } => {
                if !has_old {
                    self.respond(&co, ClientResponse::status(Status::NotFound));
                    return;
                }

                let passed = checks
                    .iter()
                    .all(|c| crate::search::passes(space, &kp.key, &oldvalue, c));

                if !passed {
                    self.respond(&co, ClientResponse::status(Status::CmpFail));
                    return;
                }

                (true, value)
            }
            WriteOp::Atomic(funcs) => {
                if !has_old {
                    self.respond(&co, ClientResponse::status(Status::NotFound));
                    return;
                }

                match apply_funcalls(space, &oldvalue, &funcs) {
                    Ok(new_value) => (true, new_value),
                    Err(status) => {
                        self.respond(&co, ClientResponse::status(status));
                        return;
                    }
                }
            }
        };

        if !has_value && !has_old {
            // Deleting nothing: terminal success with not-found
            // semantics, no chain traffic.
            self.respond(&co, ClientResponse::status(Status::NotFound));
            return;
        }

        let mut newpend = PendingOp::with_client(has_value, value, from, nonce);

        if has_value && !has_old {
            // First write for the key, or a put racing a delete. Tag it
            // fresh and let the unblock machinery release it in order.
            blocked = true;
            newpend.fresh = true;
        }

        let Some((prev, this_old, this_new, next)) = self.prev_and_next(
            &cfg,
            &kp.region,
            &kp.key,
            has_value,
            &newpend.value,
            has_old,
            &oldvalue,
        ) else {
            self.respond(&co, ClientResponse::status(Status::ServerError));
            return;
        };

        newpend.prev = prev;
        newpend.this_old = this_old;
        newpend.this_new = this_new;
        newpend.next = next;

        if kp.region != newpend.this_old && kp.region != newpend.this_new {
            self.respond(&co, ClientResponse::status(Status::Reconfigure));
            return;
        }

        let version = oldversion + 1;

        if blocked {
            kh.blocked.insert(version, newpend);
            self.unblock(&cfg, &kp, &mut kh);
        } else {
            kh.pending.insert(version, newpend);
            let snapshot = kh.pending.get(&version).cloned().unwrap();
            self.send_update(&cfg, &kp.region, version, &kp.key, &snapshot);
        }
    }

    // ------------------------------------------------------------------
    // chain path
    // ------------------------------------------------------------------

    fn chain_common(
        &self,
        has_value: bool,
        from: EntityId,
        to: EntityId,
        version: Version,
        fresh: bool,
        key: Vec<u8>,
        value: Vec<Vec<u8>>,
    ) {
        let cfg = self.config();

        // We cannot receive fresh messages from others within our own
        // subspace.
        if fresh && from.region.subspace == to.region.subspace && from.region != to.region {
            info!(subspace = to.region.subspace, "dropping fresh message from our own subspace");
            return;
        }

        let kp = KeyPair::new(to.region, key);
        let _stripe = self.keyholders.lock(&kp);
        let kh_arc = self.keyholders.get_or_create(&kp);
        let mut kh = kh_arc.lock().unwrap_or_else(|e| e.into_inner());

        let Ok(space) = cfg.space(kp.region.space) else {
            return;
        };

        if has_value && space.dimensionality() != value.len() + 1 {
            return;
        }

        let oldversion = version - 1;
        let mut defer = false;
        let mut has_old = false;
        let mut oldvalue: Vec<Vec<u8>> = Vec::new();
        let smallest = kh.oldest_pending_version();

        if smallest.is_none() {
            let Some((has_disk, diskvalue, diskversion)) = self.from_disk(&kp.region, &kp.key)
            else {
                info!("dropping chain message because the store could not be read");
                return;
            };

            if diskversion >= version {
                self.send_ack_to(&cfg, &kp.region, from, version, &kp.key);
                return;
            } else if diskversion == oldversion {
                has_old = has_disk;
                oldvalue = diskvalue;
            } else {
                defer = true;
            }
        } else if smallest.unwrap() > version {
            // The version is already committed here.
            self.send_ack_to(&cfg, &kp.region, from, version, &kp.key);
            return;
        } else if kh.pending.contains_key(&version) {
            return;
        } else if fresh {
            has_old = false;
        } else if let Some(oldop) = kh.pending.get(&oldversion) {
            has_old = oldop.has_value;
            oldvalue = oldop.value.clone();
        } else if smallest.unwrap() > oldversion {
            // The predecessor is committed but this version is not
            // pending: a later update must have been tagged fresh, which
            // only a misbehaving point leader produces.
            info!("dropping chain message which violates version ordering");
            return;
        } else {
            defer = true;
        }

        if defer {
            kh.deferred.insert(version, DeferredOp { has_value, value, from });
            return;
        }

        if !has_value && !has_old {
            info!("chain region sees a double delete");
            return;
        }

        let mut newpend = PendingOp::new(has_value, value);
        newpend.fresh = fresh;

        let Some((prev, this_old, this_new, next)) = self.prev_and_next(
            &cfg,
            &kp.region,
            &kp.key,
            has_value,
            &newpend.value,
            has_old,
            &oldvalue,
        ) else {
            info!("dropping chain message with no routable regions");
            return;
        };

        newpend.prev = prev;
        newpend.this_old = this_old;
        newpend.this_new = this_new;
        newpend.next = next;

        if !(kp.region == newpend.this_old
            && self.sent_forward_or_from_tail(&cfg, &from, &to, &newpend.this_old, &newpend.prev))
        {
            info!("dropping chain message which didn't come from the right host");
            return;
        }

        newpend.mayack = kp.region.subspace != 0;

        // Deferred messages at or below this version are dead now.
        while let Some((&v, _)) = kh.deferred.first_key_value() {
            if v > version {
                break;
            }

            kh.deferred.pop_first();
        }

        kh.pending.insert(version, newpend);
        let snapshot = kh.pending.get(&version).cloned().unwrap();
        self.send_update(&cfg, &kp.region, version, &kp.key, &snapshot);
        self.move_deferred(&cfg, &to, &kp, &mut kh);
    }

    fn chain_subspace(
        &self,
        from: EntityId,
        to: EntityId,
        version: Version,
        key: Vec<u8>,
        value: Vec<Vec<u8>>,
        next_point: u64,
    ) {
        let cfg = self.config();
        let kp = KeyPair::new(to.region, key);
        let _stripe = self.keyholders.lock(&kp);
        let kh_arc = self.keyholders.get_or_create(&kp);
        let mut kh = kh_arc.lock().unwrap_or_else(|e| e.into_inner());

        let Ok(space) = cfg.space(kp.region.space) else {
            return;
        };

        if space.dimensionality() != value.len() + 1 {
            return;
        }

        match kh.pending.range(version..).next() {
            Some((&v, _)) if v > version => {
                info!("received a subspace transfer for a revision less than what we've seen");
            }
            Some(_) => return, // retransmission
            None => {}
        }

        let Ok(subspaces) = cfg.subspaces(to.region.space) else {
            return;
        };

        let next_subspace = if to.region.subspace < subspaces - 1 {
            to.region.subspace + 1
        } else {
            0
        };

        let mut newpend = PendingOp::new(true, value);
        newpend.prev = RegionId::default();
        newpend.this_old = from.region;
        newpend.this_new = to.region;
        newpend.next = RegionId::point(to.region.space, next_subspace, next_point);

        if !self.sent_forward_or_from_tail(&cfg, &from, &to, &newpend.this_new, &newpend.this_old) {
            info!("dropping subspace transfer which didn't come from the right host");
            return;
        }

        newpend.mayack = kp.region.subspace != 0;

        kh.pending.insert(version, newpend);
        let snapshot = kh.pending.get(&version).cloned().unwrap();
        self.send_update(&cfg, &kp.region, version, &kp.key, &snapshot);
        self.move_deferred(&cfg, &to, &kp, &mut kh);
    }

    fn chain_pending(&self, from: EntityId, to: EntityId, version: Version, key: Vec<u8>) {
        // Pending notices only travel within subspace 0.
        if to.region.subspace != 0 {
            return;
        }

        let cfg = self.config();
        let kp = KeyPair::new(to.region, key);
        let _stripe = self.keyholders.lock(&kp);

        let Some(kh_arc) = self.keyholders.get(&kp) else {
            return;
        };
        let mut kh = kh_arc.lock().unwrap_or_else(|e| e.into_inner());

        let Some(op) = kh.pending.get_mut(&version) else {
            return;
        };

        if op.this_old != op.this_new {
            return;
        }

        let this_old = op.this_old;
        let prev = op.prev;

        if !self.sent_backward_or_from_tail(&cfg, &from, &to, &this_old, &prev) {
            debug!("dropping inappropriately routed pending notice");
            return;
        }

        op.mayack = true;

        if self.is_point_leader(&cfg, &to) {
            let snapshot = op.clone();
            self.send_ack_for(&cfg, &kp.region, version, &kp.key, &snapshot);
            self.put_to_disk(&cfg, &kp, &mut kh, version);

            if let Some((client, nonce)) = kh.pending.get_mut(&version).and_then(|op| op.client.take())
            {
                if let Err(e) = self.store.mark_acked(&kp.region, &kp.region, nonce) {
                    warn!(error = %e, "failed to persist client-op marker");
                }

                self.respond(
                    &ClientOp {
                        region: kp.region,
                        client,
                        nonce,
                    },
                    ClientResponse::status(Status::Success),
                );
            }
        } else {
            self.send_backward(
                &cfg,
                &kp.region,
                ChainMessage::Pending {
                    version,
                    key: kp.key.clone(),
                },
            );
        }
    }

    fn chain_ack(&self, from: EntityId, to: EntityId, version: Version, key: Vec<u8>) {
        let cfg = self.config();
        let kp = KeyPair::new(to.region, key);
        let _stripe = self.keyholders.lock(&kp);

        let Some(kh_arc) = self.keyholders.get(&kp) else {
            return;
        };
        let mut kh = kh_arc.lock().unwrap_or_else(|e| e.into_inner());

        let Some(op) = kh.pending.get(&version) else {
            return;
        };

        let (this_old, this_new, next, mayack) = (op.this_old, op.this_new, op.next, op.mayack);

        let misrouted = if this_old == this_new && to.region == this_old {
            !self.sent_backward_or_from_head(&cfg, &from, &to, &this_old, &next)
        } else if to.region == this_old {
            !self.sent_backward_or_from_head(&cfg, &from, &to, &this_old, &this_new)
        } else if to.region == this_new {
            !self.sent_backward_or_from_head(&cfg, &from, &to, &this_new, &next)
        } else {
            true
        };

        if misrouted {
            debug!("dropping inappropriately routed ack");
            return;
        }

        if !mayack {
            debug!("dropping ack received before the pending notice");
            return;
        }

        // Record a convergence trigger before the commit reaches disk so
        // an in-progress transfer cannot overwrite this key.
        {
            let by_region = self
                .transfers_in_by_region
                .lock()
                .unwrap_or_else(|e| e.into_inner());

            if let Some(xfer) = by_region.get(&kp.region) {
                let mut state = xfer.state.lock().unwrap_or_else(|e| e.into_inner());
                state.triggers.insert((kp.key.clone(), version));
            }
        }

        let snapshot = {
            let op = kh.pending.get_mut(&version).unwrap();
            op.acked = true;
            op.clone()
        };

        self.put_to_disk(&cfg, &kp, &mut kh, version);

        while let Some((_, first)) = kh.pending.first_key_value() {
            if !first.acked {
                break;
            }

            kh.pending.pop_first();
        }

        self.send_ack_for(&cfg, &kp.region, version, &kp.key, &snapshot);
        self.unblock(&cfg, &kp, &mut kh);

        if kh.pending.is_empty() {
            if !kh.deferred.is_empty() {
                debug!("dropping deferred updates with the keyholder");
            }

            drop(kh);
            self.keyholders.remove(&kp);
        }
    }

    // ------------------------------------------------------------------
    // shared machinery
    // ------------------------------------------------------------------

    fn respond(&self, co: &ClientOp, response: ClientResponse) {
        {
            let mut clientops = self.clientops.lock().unwrap_or_else(|e| e.into_inner());
            clientops.remove(co);
        }

        self.link.respond(co.client, co.nonce, response);
    }

    pub(crate) fn is_point_leader(&self, cfg: &ClusterConfig, entity: &EntityId) -> bool {
        entity.region.subspace == 0
            && entity.number == 0
            && cfg.instance_of(entity) == Some(self.us)
    }

    fn from_disk(&self, region: &RegionId, key: &[u8]) -> Option<(bool, Vec<Vec<u8>>, Version)> {
        match self.store.get(region, key) {
            Ok(Some((value, version))) => Some((true, value, version)),
            Ok(None) => Some((false, Vec::new(), 0)),
            Err(e) => {
                error!(error = %e, "store returned an error reading the old value");
                None
            }
        }
    }

    /// Compute the four regions an update touches: where its
    /// acknowledgements come from, where it lives under the old and the
    /// new value, and where it goes next.
    #[allow(clippy::too_many_arguments)]
    fn prev_and_next(
        &self,
        cfg: &ClusterConfig,
        r: &RegionId,
        key: &[u8],
        has_new: bool,
        newvalue: &[Vec<u8>],
        has_old: bool,
        oldvalue: &[Vec<u8>],
    ) -> Option<(RegionId, RegionId, RegionId, RegionId)> {
        let space = cfg.space(r.space).ok()?;
        let subspaces = cfg.subspaces(r.space).ok()?;

        let prev_subspace = if r.subspace > 0 {
            r.subspace - 1
        } else {
            subspaces - 1
        };
        let next_subspace = if r.subspace < subspaces - 1 {
            r.subspace + 1
        } else {
            0
        };

        let this_dims = cfg.dimensions(r.space, r.subspace).ok()?;
        let prev_dims = cfg.dimensions(r.space, prev_subspace).ok()?;
        let next_dims = cfg.dimensions(r.space, next_subspace).ok()?;

        let point =
            |hashes: &(u64, Vec<u64>), dims: &[bool]| replication_point(hashes.0, &hashes.1, dims);

        let (prev, mut this_old, mut this_new, next);

        if has_old && has_new {
            let old_hashes = point_hashes(space, key, oldvalue);
            let new_hashes = point_hashes(space, key, newvalue);

            prev = RegionId::point(r.space, prev_subspace, point(&new_hashes, &prev_dims));
            this_old = RegionId::point(r.space, r.subspace, point(&old_hashes, &this_dims));
            this_new = RegionId::point(r.space, r.subspace, point(&new_hashes, &this_dims));
            next = RegionId::point(r.space, next_subspace, point(&old_hashes, &next_dims));
        } else if has_old {
            let old_hashes = point_hashes(space, key, oldvalue);

            prev = RegionId::point(r.space, prev_subspace, point(&old_hashes, &prev_dims));
            this_old = RegionId::point(r.space, r.subspace, point(&old_hashes, &this_dims));
            this_new = this_old;
            next = RegionId::point(r.space, next_subspace, point(&old_hashes, &next_dims));
        } else if has_new {
            let new_hashes = point_hashes(space, key, newvalue);

            prev = RegionId::point(r.space, prev_subspace, point(&new_hashes, &prev_dims));
            this_old = RegionId::point(r.space, r.subspace, point(&new_hashes, &this_dims));
            this_new = this_old;
            next = RegionId::point(r.space, next_subspace, point(&new_hashes, &next_dims));
        } else {
            return None;
        }

        // An update never jumps regions once in flight, so pin this_old
        // and this_new to the hosting region when they intersect it;
        // equality tests elsewhere rely on it.
        if r.overlaps(&this_old) {
            this_old = *r;
        }

        if r.overlaps(&this_new) {
            this_new = *r;
        }

        Some((prev, this_old, this_new, next))
    }

    fn unblock(&self, cfg: &ClusterConfig, kp: &KeyPair, kh: &mut Keyholder) {
        // We cannot unblock so long as there are messages pending.
        if !kh.pending.is_empty() || kh.blocked.is_empty() {
            return;
        }

        loop {
            let Some((&version, _)) = kh.blocked.first_key_value() else {
                break;
            };

            let op = kh.blocked.remove(&version).unwrap();
            kh.pending.insert(version, op);
            let snapshot = kh.pending.get(&version).cloned().unwrap();
            self.send_update(cfg, &kp.region, version, &kp.key, &snapshot);

            match kh.blocked.first_key_value() {
                Some((_, next)) if !next.fresh => continue,
                _ => break,
            }
        }
    }

    /// Retry deferred chain messages now that something new is pending.
    fn move_deferred(&self, cfg: &ClusterConfig, to: &EntityId, kp: &KeyPair, kh: &mut Keyholder) {
        loop {
            let Some((&version, _)) = kh.deferred.first_key_value() else {
                return;
            };

            let oldversion = version - 1;

            let Some(smallest) = kh.oldest_pending_version() else {
                // Only reachable when nothing was actually added to
                // pending; drop everything rather than loop.
                error!("deferred retry ran without a pending anchor");
                kh.deferred.clear();
                return;
            };

            if smallest >= version || kh.pending.contains_key(&version) {
                kh.deferred.pop_first();
                continue;
            }

            let (has_old, oldvalue) = if let Some(oldop) = kh.pending.get(&oldversion) {
                (oldop.has_value, oldop.value.clone())
            } else if smallest > oldversion {
                kh.deferred.pop_first();
                continue;
            } else {
                // Still missing its predecessor.
                return;
            };

            let defrd = kh.deferred.get(&version).unwrap().clone();

            if !defrd.has_value && !has_old {
                kh.deferred.pop_first();
                continue;
            }

            let Some((prev, this_old, this_new, next)) = self.prev_and_next(
                cfg,
                &kp.region,
                &kp.key,
                defrd.has_value,
                &defrd.value,
                has_old,
                &oldvalue,
            ) else {
                kh.deferred.pop_first();
                continue;
            };

            if !(kp.region == this_old
                && self.sent_forward_or_from_tail(cfg, &defrd.from, to, &this_old, &prev))
            {
                kh.deferred.pop_first();
                continue;
            }

            let mut newpend = PendingOp::new(defrd.has_value, defrd.value);
            newpend.prev = prev;
            newpend.this_old = this_old;
            newpend.this_new = this_new;
            newpend.next = next;
            newpend.mayack = to.region.subspace != 0;

            kh.deferred.pop_first();
            kh.pending.insert(version, newpend);
            let snapshot = kh.pending.get(&version).cloned().unwrap();
            self.send_update(cfg, &kp.region, version, &kp.key, &snapshot);
        }
    }

    fn put_to_disk(
        &self,
        cfg: &ClusterConfig,
        kp: &KeyPair,
        kh: &mut Keyholder,
        version: Version,
    ) -> bool {
        let Some(op) = kh.pending.get(&version) else {
            return false;
        };

        // The marking below guarantees that all lesser versions are on
        // disk whenever this one is.
        if op.ondisk {
            return true;
        }

        let Ok(space) = cfg.space(kp.region.space) else {
            error!(space = %kp.region.space, "committing into an unknown space");
            return false;
        };

        let success = if !op.has_value || (op.this_old != op.this_new && kp.region == op.this_old) {
            match self.store.del(&kp.region, space, &kp.key) {
                Ok(()) => true,
                Err(e) => {
                    error!(error = %e, "store delete failed while committing");
                    false
                }
            }
        } else {
            match self.store.put(&kp.region, space, &kp.key, &op.value, version) {
                Ok(()) => true,
                Err(e) => {
                    error!(error = %e, "store put failed while committing");
                    false
                }
            }
        };

        if success {
            for (_, op) in kh.pending.range_mut(..=version) {
                op.ondisk = true;
            }
        }

        success
    }

    // ------------------------------------------------------------------
    // message emission
    // ------------------------------------------------------------------

    fn send(&self, from: EntityId, to: EntityId, msg: Message) {
        if !self.link.send(from, to, msg) {
            debug!(from = %from, to = %to, "link dropped a message");
        }
    }

    fn send_update(
        &self,
        cfg: &ClusterConfig,
        pending_in: &RegionId,
        version: Version,
        key: &[u8],
        op: &PendingOp,
    ) {
        if op.this_old == op.this_new {
            let payload = if op.has_value {
                ChainMessage::Put {
                    version,
                    fresh: op.fresh,
                    key: key.to_vec(),
                    value: op.value.clone(),
                }
            } else {
                ChainMessage::Del {
                    version,
                    key: key.to_vec(),
                }
            };

            let info = ChainMessage::Pending {
                version,
                key: key.to_vec(),
            };

            if op.next.subspace == 0 {
                // The ring wraps here: the last chain hands a pending
                // notice to the tail of subspace 0.
                self.send_forward_else_tail(cfg, pending_in, payload, &op.next, info.clone());
            } else {
                self.send_forward_else_head(cfg, pending_in, payload.clone(), &op.next, payload);
            }

            if pending_in.subspace == 0 && op.mayack {
                self.send_backward(cfg, pending_in, info);
            }
        } else if *pending_in == op.this_old {
            let oldmsg = ChainMessage::Put {
                version,
                fresh: op.fresh,
                key: key.to_vec(),
                value: op.value.clone(),
            };
            let newmsg = ChainMessage::Subspace {
                version,
                key: key.to_vec(),
                value: op.value.clone(),
                next_point: op.next.mask,
            };
            self.send_forward_else_head(cfg, &op.this_old, oldmsg, &op.this_new, newmsg);
        } else if *pending_in == op.this_new {
            let oldmsg = ChainMessage::Subspace {
                version,
                key: key.to_vec(),
                value: op.value.clone(),
                next_point: op.next.mask,
            };
            let newmsg = ChainMessage::Put {
                version,
                fresh: op.fresh,
                key: key.to_vec(),
                value: op.value.clone(),
            };
            self.send_forward_else_head(cfg, &op.this_new, oldmsg, &op.next, newmsg);
        } else {
            warn!("no send_update case matches this update");
        }
    }

    fn send_ack_for(
        &self,
        cfg: &ClusterConfig,
        pending_in: &RegionId,
        version: Version,
        key: &[u8],
        op: &PendingOp,
    ) {
        let msg = ChainMessage::Ack {
            version,
            key: key.to_vec(),
        };

        if *pending_in == op.this_old {
            self.send_backward_else_tail(cfg, pending_in, msg.clone(), &op.prev, msg);
        } else if *pending_in == op.this_new {
            self.send_backward_else_tail(cfg, pending_in, msg.clone(), &op.this_old, msg);
        }
    }

    fn send_ack_to(
        &self,
        cfg: &ClusterConfig,
        from_region: &RegionId,
        to: EntityId,
        version: Version,
        key: &[u8],
    ) {
        let Some(me) = cfg.our_entity(from_region, self.us) else {
            return;
        };

        self.send(
            me,
            to,
            Message::Chain(ChainMessage::Ack {
                version,
                key: key.to_vec(),
            }),
        );
    }

    fn send_forward_else_head(
        &self,
        cfg: &ClusterConfig,
        region: &RegionId,
        msg: ChainMessage,
        else_region: &RegionId,
        else_msg: ChainMessage,
    ) {
        let Some(me) = cfg.our_entity(region, self.us) else {
            return;
        };

        if let Some(next) = me.number.checked_add(1).and_then(|n| cfg.entity_at(&me.region, n)) {
            self.send(me, next, Message::Chain(msg));
        } else if let Some(head) = cfg.head_of(else_region) {
            self.send(me, head, Message::Chain(else_msg));
        }
    }

    fn send_forward_else_tail(
        &self,
        cfg: &ClusterConfig,
        region: &RegionId,
        msg: ChainMessage,
        else_region: &RegionId,
        else_msg: ChainMessage,
    ) {
        let Some(me) = cfg.our_entity(region, self.us) else {
            return;
        };

        if let Some(next) = me.number.checked_add(1).and_then(|n| cfg.entity_at(&me.region, n)) {
            self.send(me, next, Message::Chain(msg));
        } else if let Some(tail) = cfg.tail_of(else_region) {
            self.send(me, tail, Message::Chain(else_msg));
        }
    }

    fn send_backward_else_tail(
        &self,
        cfg: &ClusterConfig,
        region: &RegionId,
        msg: ChainMessage,
        else_region: &RegionId,
        else_msg: ChainMessage,
    ) {
        let Some(me) = cfg.our_entity(region, self.us) else {
            return;
        };

        if me.number > 0 {
            if let Some(prev) = cfg.entity_at(&me.region, me.number - 1) {
                self.send(me, prev, Message::Chain(msg));
            }
        } else if let Some(tail) = cfg.tail_of(else_region) {
            self.send(me, tail, Message::Chain(else_msg));
        }
    }

    fn send_backward(&self, cfg: &ClusterConfig, region: &RegionId, msg: ChainMessage) {
        let Some(me) = cfg.our_entity(region, self.us) else {
            return;
        };

        if me.number > 0 {
            if let Some(prev) = cfg.entity_at(&me.region, me.number - 1) {
                self.send(me, prev, Message::Chain(msg));
            }
        }
    }

    // ------------------------------------------------------------------
    // routing checks
    // ------------------------------------------------------------------

    fn sent_forward_or_from_tail(
        &self,
        cfg: &ClusterConfig,
        from: &EntityId,
        to: &EntityId,
        chain: &RegionId,
        tail: &RegionId,
    ) -> bool {
        (from.region == to.region
            && from.region == *chain
            && from.number.checked_add(1) == Some(to.number))
            || cfg.tail_of(tail).as_ref() == Some(from)
    }

    fn sent_backward_or_from_head(
        &self,
        cfg: &ClusterConfig,
        from: &EntityId,
        to: &EntityId,
        chain: &RegionId,
        head: &RegionId,
    ) -> bool {
        (from.region == to.region
            && from.region == *chain
            && to.number.checked_add(1) == Some(from.number))
            || cfg.head_of(head).as_ref() == Some(from)
    }

    fn sent_backward_or_from_tail(
        &self,
        cfg: &ClusterConfig,
        from: &EntityId,
        to: &EntityId,
        chain: &RegionId,
        tail: &RegionId,
    ) -> bool {
        (from.region == to.region
            && from.region == *chain
            && to.number.checked_add(1) == Some(from.number))
            || cfg.tail_of(tail).as_ref() == Some(from)
    }

    // ------------------------------------------------------------------
    // periodic sweep
    // ------------------------------------------------------------------

    /// Re-send the head of every pending window and re-issue backward
    /// pending notices in subspace 0. This is the only recovery path for
    /// lost messages.
    pub fn retransmit(&self) {
        let cfg = self.config();

        for kp in self.keyholders.pairs() {
            let _stripe = self.keyholders.lock(&kp);

            let Some(kh_arc) = self.keyholders.get(&kp) else {
                continue;
            };
            let mut kh = kh_arc.lock().unwrap_or_else(|e| e.into_inner());

            if kh.pending.is_empty() {
                self.unblock(&cfg, &kp, &mut kh);
            }

            if kh.pending.is_empty() {
                if !kh.deferred.is_empty() {
                    debug!("dropping deferred updates with no pending anchor");
                }

                drop(kh);
                self.keyholders.remove(&kp);
                continue;
            }

            let (&version, op) = kh.pending.first_key_value().unwrap();
            let snapshot = op.clone();
            self.send_update(&cfg, &kp.region, version, &kp.key, &snapshot);

            if kp.region.subspace == 0 {
                self.send_backward(
                    &cfg,
                    &kp.region,
                    ChainMessage::Pending {
                        version,
                        key: kp.key.clone(),
                    },
                );
            }
        }
    }

    /// One synchronous pass of everything the background task drives:
    /// retransmission plus both transfer nudges.
    pub fn sweep_once(&self) {
        self.retransmit();
        self.start_transfers();
        self.finish_transfers();
    }

    /// Drive retransmission and the transfer nudges until cancelled.
    pub async fn run_sweep(self: Arc<Self>, cancel: CancellationToken) {
        info!("replication sweep task started");
        let mut tick = tokio::time::interval(self.retransmit_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut round = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            self.retransmit();

            // Every second.
            if round % 4 == 0 {
                self.start_transfers();
            }

            // Every ten seconds.
            if round % 40 == 0 {
                self.finish_transfers();
            }

            round += 1;
        }

        info!("replication sweep task stopped");
    }

    pub(crate) fn link(&self) -> &Arc<L> {
        &self.link
    }

    pub(crate) fn keyholder_lock(&self, kp: &KeyPair) -> MutexGuard<'_, ()> {
        self.keyholders.lock(kp)
    }
}

/// Fold client funcalls over an old attribute vector, mapping algebra
/// failures onto wire statuses.
pub(crate) fn apply_funcalls(
    space: &tessera_core::Space,
    oldvalue: &[Vec<u8>],
    funcs: &[AttrFuncall],
) -> Result<Vec<Vec<u8>>, Status> {
    let mut newvalue = oldvalue.to_vec();

    for af in funcs {
        if af.attr == 0 {
            return Err(Status::ServerError);
        }

        let Some(datatype) = space.attr_type(af.attr) else {
            return Err(Status::ServerError);
        };

        let info = TypeInfo::of(datatype);

        if !info.check_args(&af.func) {
            return Err(Status::ServerError);
        }

        let slot = (af.attr - 1) as usize;

        match info.apply(&newvalue[slot], std::slice::from_ref(&af.func)) {
            Ok(applied) => newvalue[slot] = applied,
            Err(TypeError::Overflow) => return Err(Status::Overflow),
            Err(_) => return Err(Status::ServerError),
        }
    }

    Ok(newvalue)
}
