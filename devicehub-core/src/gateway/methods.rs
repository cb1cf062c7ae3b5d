//! Pending method-call correlation.
//!
//! Every in-flight direct method call has an entry keyed by request id. A
//! single dispatcher feeds responses from the broker back to the waiting
//! caller; entries are removed on resolve or timeout, and any response
//! arriving after its entry is gone is discarded.

use crate::MethodResponse;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Default)]
pub struct PendingMethodCalls {
    pending: Mutex<HashMap<String, oneshot::Sender<MethodResponse>>>,
}

impl PendingMethodCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call and hand back the receiver the caller awaits.
    pub fn insert(&self, request_id: &str) -> oneshot::Receiver<MethodResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.to_string(), tx);
        rx
    }

    /// Deliver a response to its waiting caller. Returns false when no entry
    /// matches (late arrival after timeout, or a response we never asked for).
    pub fn resolve(&self, response: MethodResponse) -> bool {
        let sender = self.pending.lock().remove(&response.request_id);
        match sender {
            Some(sender) => sender.send(response).is_ok(),
            None => {
                debug!("Discarding uncorrelated method response {}", response.request_id);
                false
            }
        }
    }

    /// Drop a pending entry, typically on timeout or connection teardown.
    pub fn remove(&self, request_id: &str) {
        self.pending.lock().remove(request_id);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
