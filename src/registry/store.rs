//! Client registry implementation
//!
//! One mutex guards both the attached set (which drives session lifecycle edges)
//! and the broadcast targets. Broadcasting copies the target list under the lock
//! and writes outside it, so attach/detach never waits on a slow client.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use super::sink::{ClientId, PacketSink};

/// Attached-count edge caused by a register/deregister call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Attached count went from 0 to 1
    FirstAttached,
    /// Attached count went from 1 to 0
    LastDetached,
    None,
}

/// Result of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Sinks that accepted the payload
    pub delivered: usize,
    /// Sinks that failed and were evicted
    pub evicted: usize,
}

struct Target {
    id: ClientId,
    sink: Weak<dyn PacketSink>,
}

#[derive(Default)]
struct Inner {
    targets: Vec<Target>,
    attached: HashSet<ClientId>,
}

/// Synchronized set of attached clients
///
/// Holds only weak references; the owner of each connection keeps it alive.
#[derive(Default)]
pub struct ClientRegistry {
    inner: Mutex<Inner>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a client
    ///
    /// Registering an id twice is a no-op.
    pub fn register<S: PacketSink + 'static>(&self, sink: &Arc<S>) -> Transition {
        let id = sink.id();
        let weak: Weak<dyn PacketSink> = Arc::downgrade(sink) as Weak<dyn PacketSink>;

        let mut inner = self.inner.lock();
        if !inner.attached.insert(id) {
            return Transition::None;
        }
        inner.targets.push(Target { id, sink: weak });

        tracing::debug!(client_id = id, attached = inner.attached.len(), "Client registered");

        if inner.attached.len() == 1 {
            Transition::FirstAttached
        } else {
            Transition::None
        }
    }

    /// Detach a client; unknown ids are ignored
    pub fn deregister(&self, id: ClientId) -> Transition {
        let mut inner = self.inner.lock();
        inner.targets.retain(|t| t.id != id);
        if !inner.attached.remove(&id) {
            return Transition::None;
        }

        tracing::debug!(client_id = id, attached = inner.attached.len(), "Client deregistered");

        if inner.attached.is_empty() {
            Transition::LastDetached
        } else {
            Transition::None
        }
    }

    /// Send a payload to every target
    ///
    /// A target that fails is evicted from the targets and closed. Its attachment
    /// stays until the owner deregisters it, so lifecycle edges are only ever
    /// produced by register/deregister.
    pub fn broadcast(&self, payload: &Bytes) -> BroadcastOutcome {
        let snapshot: Vec<Arc<dyn PacketSink>> = {
            let mut inner = self.inner.lock();
            inner.targets.retain(|t| t.sink.strong_count() > 0);
            inner.targets.iter().filter_map(|t| t.sink.upgrade()).collect()
        };

        let mut outcome = BroadcastOutcome::default();
        let mut failed = Vec::new();

        for sink in &snapshot {
            match sink.send(payload.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    tracing::debug!(
                        client_id = sink.id(),
                        error = %e,
                        "Send failed, evicting client"
                    );
                    sink.close();
                    failed.push(sink.id());
                }
            }
        }

        if !failed.is_empty() {
            outcome.evicted = failed.len();
            self.inner.lock().targets.retain(|t| !failed.contains(&t.id));
        }

        outcome
    }

    /// Drop every client and close it
    ///
    /// Returns the number of attached clients. No lifecycle edge is reported; the
    /// caller is expected to tear the session down itself.
    pub fn clear(&self) -> usize {
        let (targets, attached) = {
            let mut inner = self.inner.lock();
            let attached = inner.attached.len();
            inner.attached.clear();
            (std::mem::take(&mut inner.targets), attached)
        };

        for sink in targets.iter().filter_map(|t| t.sink.upgrade()) {
            sink.close();
        }

        attached
    }

    /// Number of attached clients
    pub fn attached_count(&self) -> usize {
        self.inner.lock().attached.len()
    }

    /// Number of clients still receiving broadcasts
    pub fn target_count(&self) -> usize {
        self.inner.lock().targets.len()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.inner.lock().attached.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().attached.is_empty()
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ClientRegistry")
            .field("attached", &inner.attached.len())
            .field("targets", &inner.targets.len())
            .finish()
    }
}
