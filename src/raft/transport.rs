use super::{ClusterId, Envelope, MemberId, RaftMachine, RaftMessage, Received};
use crate::error::Result;

use log::{debug, error, warn};
use std::sync::{Arc, Mutex};

/// Sends messages to other cluster members. Delivery is best-effort: messages
/// may be dropped, delayed, duplicated or reordered, which Raft tolerates.
pub trait Outbound: Send + Sync {
    /// Sends a message to the given member.
    fn send(&self, to: MemberId, message: RaftMessage);
}

/// Hands envelopes to a channel, e.g. for a router thread or a test harness.
impl Outbound for crossbeam::channel::Sender<Envelope> {
    fn send(&self, to: MemberId, message: RaftMessage) {
        if let Err(err) = crossbeam::channel::Sender::send(self, Envelope { to, message }) {
            error!("Failed to send message to {}: {}", to, err);
        }
    }
}

/// Receives messages from the transport and feeds them to the Raft machine.
/// Messages are dropped until the handler is bound to a cluster, and messages
/// for other clusters are always dropped.
pub struct InboundHandler {
    cluster_id: Mutex<Option<ClusterId>>,
    machine: Arc<RaftMachine>,
}

impl InboundHandler {
    pub fn new(machine: Arc<RaftMachine>) -> Self {
        Self { cluster_id: Mutex::new(None), machine }
    }

    /// Binds the handler to a cluster, once it has been discovered or
    /// bootstrapped.
    pub fn bind(&self, cluster_id: ClusterId) -> Result<()> {
        debug!("Binding member {} to cluster {}", self.machine.me(), cluster_id);
        *self.cluster_id.lock()? = Some(cluster_id);
        Ok(())
    }

    /// Handles a received message.
    pub fn handle(&self, received: Received) -> Result<()> {
        match *self.cluster_id.lock()? {
            None => {
                warn!("Dropping {:?} from {}, not bound to a cluster", received.message.message_type(), received.message.from);
                return Ok(());
            }
            Some(cluster_id) if cluster_id != received.cluster_id => {
                warn!(
                    "Dropping {:?} from {} for cluster {}, we are in cluster {}",
                    received.message.message_type(),
                    received.message.from,
                    received.cluster_id,
                    cluster_id
                );
                return Ok(());
            }
            Some(_) => {}
        }
        self.machine.handle(received.message)
    }
}
