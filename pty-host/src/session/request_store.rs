// Correlated request/reply round trips with clients
//
// The host sometimes needs an answer only a client can give. Each question
// gets a fresh correlation id; the reply is matched back by that id. Waiting
// is bounded by the store's timeout.

use super::error::{PtyHostError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

pub struct RequestStore<T> {
    last_request_id: AtomicU64,
    timeout: Duration,
    pending: StdMutex<HashMap<u64, oneshot::Sender<T>>>,
}

impl<T: Send> RequestStore<T> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_request_id: AtomicU64::new(0),
            timeout,
            pending: StdMutex::new(HashMap::new()),
        }
    }

    /// Issue a request and wait for its reply.
    ///
    /// `announce` receives the new correlation id and should deliver the
    /// question to whoever can answer it.
    pub async fn create_request(&self, announce: impl FnOnce(u64)) -> Result<T> {
        let request_id = self.last_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id, tx);

        announce(request_id);

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Either the deadline passed or the store dropped the sender
            _ => {
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&request_id);
                tracing::warn!("Request {} timed out", request_id);
                Err(PtyHostError::RequestTimedOut { request_id })
            }
        }
    }

    /// Deliver the reply for `request_id`. Late or unknown replies are dropped.
    pub fn accept_reply(&self, request_id: u64, reply: T) {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => tracing::warn!("Reply for unknown request {}", request_id),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
