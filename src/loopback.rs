//! A chain link for single-process deployments: every entity lives in
//! this daemon, so messages loop straight back through a queue.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::{debug, info};

use tessera_core::{EntityId, Nonce};
use tessera_daemon::{ChainLink, ClientResponse, Message};

#[derive(Default)]
pub struct LoopbackLink {
    queue: Mutex<VecDeque<(EntityId, EntityId, Message)>>,
    notify: Notify,
}

impl LoopbackLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<(EntityId, EntityId, Message)> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(..).collect()
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl ChainLink for LoopbackLink {
    fn send(&self, from: EntityId, to: EntityId, msg: Message) -> bool {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back((from, to, msg));
        }

        self.notify.notify_one();
        true
    }

    fn respond(&self, client: EntityId, nonce: Nonce, response: ClientResponse) -> bool {
        // Client sockets are outside this process; surface terminations
        // in the log until a frontend picks them up.
        if let Some((_, version)) = &response.value {
            info!(client = %client, nonce, status = ?response.status, version, "client op terminated");
        } else {
            debug!(client = %client, nonce, status = ?response.status, "client op terminated");
        }

        true
    }
}
