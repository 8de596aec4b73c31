//! Shared fixtures for tessera tests: canned spaces, cluster
//! configurations, and a single-process multi-node harness driven by an
//! in-memory chain link.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tessera_core::{
    Attribute, ClusterConfig, DataType, EntityId, InstanceId, Nonce, RegionId, Space, SpaceId,
    StorageConfig, Subspace, TransferSpec,
};
use tessera_daemon::{
    ChainLink, ClientResponse, Message, ReplicationManager,
};
use tessera_fjall::FjallStore;
use tessera_types::TypeInfo;

pub type TestManager = ReplicationManager<FjallStore, MemoryLink>;

/// A users-like space: string key, one string attribute, one int64
/// attribute, hashed by key in subspace 0 and by the values in
/// subspace 1.
pub fn users_space(id: SpaceId) -> Space {
    Space {
        id,
        name: "users".into(),
        attrs: vec![
            Attribute::new("username", DataType::String),
            Attribute::new("name", DataType::String),
            Attribute::new("age", DataType::Int64),
        ],
        subspaces: vec![Subspace::new(vec![0]), Subspace::new(vec![1, 2])],
        doc_indexes: vec![],
    }
}

/// A space holding one document attribute beside the key.
pub fn profiles_space(id: SpaceId) -> Space {
    Space {
        id,
        name: "profiles".into(),
        attrs: vec![
            Attribute::new("id", DataType::String),
            Attribute::new("profile", DataType::Document),
        ],
        subspaces: vec![Subspace::new(vec![0])],
        doc_indexes: vec![],
    }
}

/// Configuration with one region per subspace, each served by the given
/// chains. `chains[s]` lists the instances of subspace `s` in chain
/// order.
pub fn whole_subspace_config(space: Space, chains: &[&[InstanceId]]) -> ClusterConfig {
    let mut entities = BTreeMap::new();

    for (subspace, chain) in chains.iter().enumerate() {
        let region = RegionId::new(space.id, subspace as u16, 0, 0);

        for (number, instance) in chain.iter().enumerate() {
            entities.insert(EntityId::new(region, number as u8), *instance);
        }
    }

    ClusterConfig {
        version: 1,
        spaces: [(space.id, space)].into(),
        entities,
        transfers: vec![],
    }
}

/// Split one subspace of an existing configuration into two half-point
/// regions, each with its own chain.
pub fn split_subspace(
    config: &mut ClusterConfig,
    space: SpaceId,
    subspace: u16,
    low_chain: &[InstanceId],
    high_chain: &[InstanceId],
) {
    config
        .entities
        .retain(|e, _| !(e.region.space == space && e.region.subspace == subspace));

    let low = RegionId::new(space, subspace, 1, 0);
    let high = RegionId::new(space, subspace, 1, 0x8000_0000_0000_0000);

    for (number, instance) in low_chain.iter().enumerate() {
        config
            .entities
            .insert(EntityId::new(low, number as u8), *instance);
    }

    for (number, instance) in high_chain.iter().enumerate() {
        config
            .entities
            .insert(EntityId::new(high, number as u8), *instance);
    }
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: EntityId,
    pub to: EntityId,
    pub msg: Message,
}

/// The whole network in a mutex: sends enqueue, the harness pumps. No
/// handler ever runs inside another handler's stack frame, mirroring
/// the socket layer's queueing.
#[derive(Default)]
pub struct MemoryLink {
    queue: Mutex<VecDeque<Envelope>>,
    responses: Mutex<Vec<(EntityId, Nonce, ClientResponse)>>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Envelope> {
        let mut queue = self.queue.lock().unwrap();
        queue.drain(..).collect()
    }

    pub fn take_response(&self, nonce: Nonce) -> Option<ClientResponse> {
        let mut responses = self.responses.lock().unwrap();
        let at = responses.iter().position(|(_, n, _)| *n == nonce)?;
        Some(responses.remove(at).2)
    }

    pub fn response_count(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

impl ChainLink for MemoryLink {
    fn send(&self, from: EntityId, to: EntityId, msg: Message) -> bool {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(Envelope { from, to, msg });
        true
    }

    fn respond(&self, client: EntityId, nonce: Nonce, response: ClientResponse) -> bool {
        let mut responses = self.responses.lock().unwrap();
        responses.push((client, nonce, response));
        true
    }
}

/// A single-process cluster: one manager per instance, all wired to one
/// [`MemoryLink`].
pub struct Cluster {
    pub link: Arc<MemoryLink>,
    pub nodes: HashMap<InstanceId, Arc<TestManager>>,
    pub config: ClusterConfig,
    client: EntityId,
    nonces: AtomicU64,
    _dirs: Vec<tempfile::TempDir>,
}

impl Cluster {
    pub fn new(config: ClusterConfig, instances: &[InstanceId]) -> Self {
        let link = Arc::new(MemoryLink::new());
        let mut nodes = HashMap::new();
        let mut dirs = Vec::new();

        let storage = StorageConfig {
            path: None,
            cache: Some(8),
            lock_stripes: Some(64),
            retransmit_interval: Some(250),
        };

        for instance in instances {
            let dir = tempfile::tempdir().expect("tempdir");
            let store = FjallStore::open(dir.path(), Some(8)).expect("open store");
            dirs.push(dir);

            let manager = Arc::new(ReplicationManager::new(
                *instance,
                store,
                link.clone(),
                &storage,
            ));
            manager.reconfigure(config.clone());
            nodes.insert(*instance, manager);
        }

        Self {
            link,
            nodes,
            config,
            client: EntityId::client(1),
            nonces: AtomicU64::new(1),
            _dirs: dirs,
        }
    }

    pub fn node(&self, instance: InstanceId) -> &Arc<TestManager> {
        &self.nodes[&instance]
    }

    pub fn reconfigure(&mut self, config: ClusterConfig) {
        self.config = config.clone();

        for node in self.nodes.values() {
            node.reconfigure(config.clone());
        }
    }

    fn route(&self, to: &EntityId) -> Option<InstanceId> {
        if to.number == u8::MAX {
            return self
                .config
                .transfers
                .iter()
                .find(|t| t.region == to.region)
                .map(|t| t.to);
        }

        self.config.entities.get(to).copied()
    }

    /// Deliver queued messages until the network is quiet. Returns how
    /// many messages were delivered.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;

        loop {
            let batch = self.link.drain();

            if batch.is_empty() {
                return delivered;
            }

            for env in batch {
                let Some(instance) = self.route(&env.to) else {
                    continue;
                };

                if let Some(node) = self.nodes.get(&instance) {
                    node.deliver(env.from, env.to, env.msg);
                    delivered += 1;
                }
            }
        }
    }

    /// Pump, interleaving sweep passes so lost or deferred work makes
    /// progress, until the cluster goes quiet.
    pub fn settle(&self) {
        for _ in 0..64 {
            self.pump();

            for node in self.nodes.values() {
                node.sweep_once();
            }

            if self.pump() == 0 {
                return;
            }
        }
    }

    pub fn next_nonce(&self) -> Nonce {
        self.nonces.fetch_add(1, Ordering::Relaxed)
    }

    /// The point leader serving `key`: entity 0 of the subspace-0 region
    /// covering the key's hash.
    pub fn point_leader(&self, space: &Space, key: &[u8]) -> EntityId {
        let point = TypeInfo::of(space.key_type())
            .hash(key)
            .expect("key type must be hashable");
        let region = self
            .config
            .locate(space.id, 0, point)
            .expect("no region covers the key");
        EntityId::new(region, 0)
    }

    fn leader_node(&self, leader: &EntityId) -> &Arc<TestManager> {
        let instance = self
            .config
            .instance_of(leader)
            .expect("point leader not mapped");
        &self.nodes[&instance]
    }

    /// Issue a put and run the cluster until it answers.
    pub fn put(&self, space: &Space, key: &[u8], value: Vec<Vec<u8>>) -> ClientResponse {
        let leader = self.point_leader(space, key);
        let nonce = self.next_nonce();
        self.leader_node(&leader)
            .client_put(self.client, leader, nonce, key.to_vec(), value);
        self.settle();
        self.link
            .take_response(nonce)
            .expect("put did not terminate")
    }

    pub fn del(&self, space: &Space, key: &[u8]) -> ClientResponse {
        let leader = self.point_leader(space, key);
        let nonce = self.next_nonce();
        self.leader_node(&leader)
            .client_del(self.client, leader, nonce, key.to_vec());
        self.settle();
        self.link
            .take_response(nonce)
            .expect("del did not terminate")
    }

    pub fn get(&self, space: &Space, key: &[u8]) -> ClientResponse {
        let leader = self.point_leader(space, key);
        let nonce = self.next_nonce();
        self.leader_node(&leader)
            .client_get(self.client, leader, nonce, key.to_vec());
        self.settle();
        self.link
            .take_response(nonce)
            .expect("get did not terminate")
    }

    pub fn cond_put(
        &self,
        space: &Space,
        key: &[u8],
        checks: Vec<tessera_core::AttributeCheck>,
        value: Vec<Vec<u8>>,
    ) -> ClientResponse {
        let leader = self.point_leader(space, key);
        let nonce = self.next_nonce();
        self.leader_node(&leader).client_cond_put(
            self.client,
            leader,
            nonce,
            key.to_vec(),
            checks,
            value,
        );
        self.settle();
        self.link
            .take_response(nonce)
            .expect("cond_put did not terminate")
    }

    pub fn atomic(
        &self,
        space: &Space,
        key: &[u8],
        funcs: Vec<tessera_daemon::replication::AttrFuncall>,
    ) -> ClientResponse {
        let leader = self.point_leader(space, key);
        let nonce = self.next_nonce();
        self.leader_node(&leader)
            .client_atomic(self.client, leader, nonce, key.to_vec(), funcs);
        self.settle();
        self.link
            .take_response(nonce)
            .expect("atomic did not terminate")
    }

    /// Fire several writes before any settles, then run them all to
    /// completion. Returns the nonces in issue order.
    pub fn concurrent_atomics(
        &self,
        space: &Space,
        key: &[u8],
        batches: Vec<Vec<tessera_daemon::replication::AttrFuncall>>,
    ) -> Vec<Nonce> {
        let leader = self.point_leader(space, key);
        let mut nonces = Vec::new();

        for funcs in batches {
            let nonce = self.next_nonce();
            self.leader_node(&leader)
                .client_atomic(self.client, leader, nonce, key.to_vec(), funcs);
            nonces.push(nonce);
        }

        self.settle();
        nonces
    }

    /// Order a transfer of `region` to `target` in a fresh configuration
    /// version and install it cluster-wide.
    pub fn order_transfer(
        &mut self,
        id: tessera_core::TransferId,
        region: RegionId,
        from: InstanceId,
        to: InstanceId,
    ) {
        let mut config = self.config.clone();
        config.version += 1;
        config.transfers.push(TransferSpec {
            id,
            region,
            from,
            to,
        });
        self.reconfigure(config);
    }
}
