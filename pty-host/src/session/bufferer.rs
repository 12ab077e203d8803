// Data bufferer - coalesces high-frequency pty output per session
//
// The first chunk after an idle period arms a single flush timer; chunks that
// arrive before it fires are appended and do not re-arm it. Buffers are never
// shared between sessions.

use super::protocol::SessionId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default throttle window for coalescing output
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(5);

/// Receives coalesced output. Runs while the bufferer's lock is held so that
/// flushes for one id are delivered in order; it must not call back into the
/// bufferer.
pub type FlushCallback = Arc<dyn Fn(SessionId, String) + Send + Sync>;

struct PendingBuffer {
    data: Vec<String>,
    timer: JoinHandle<()>,
}

struct Inner {
    callback: FlushCallback,
    buffers: StdMutex<HashMap<SessionId, PendingBuffer>>,
}

impl Inner {
    fn push(self: &Arc<Self>, id: SessionId, data: String, throttle: Duration) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = buffers.get_mut(&id) {
            pending.data.push(data);
            return;
        }

        let inner = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(throttle).await;
            inner.flush(id);
        });
        buffers.insert(
            id,
            PendingBuffer {
                data: vec![data],
                timer,
            },
        );
    }

    fn flush(&self, id: SessionId) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = buffers.remove(&id) {
            pending.timer.abort();
            (self.callback)(id, pending.data.concat());
        }
    }
}

pub struct DataBufferer {
    inner: Arc<Inner>,
    subscriptions: StdMutex<HashMap<SessionId, JoinHandle<()>>>,
}

impl DataBufferer {
    pub fn new(callback: FlushCallback) -> Self {
        Self {
            inner: Arc::new(Inner {
                callback,
                buffers: StdMutex::new(HashMap::new()),
            }),
            subscriptions: StdMutex::new(HashMap::new()),
        }
    }

    /// Start coalescing chunks from `source` for `id`.
    ///
    /// When the sender side is dropped, whatever is still buffered is flushed.
    pub fn start_buffering(
        &self,
        id: SessionId,
        mut source: mpsc::UnboundedReceiver<String>,
        throttle: Duration,
    ) {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(chunk) = source.recv().await {
                inner.push(id, chunk, throttle);
            }
            inner.flush(id);
        });

        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = subscriptions.insert(id, task) {
            previous.abort();
        }
    }

    /// Deliver anything buffered for `id` now. No-op when nothing is pending.
    pub fn flush_buffer(&self, id: SessionId) {
        self.inner.flush(id);
    }

    /// Flush and stop listening to `id`'s source
    pub fn stop_buffering(&self, id: SessionId) {
        self.inner.flush(id);
        let task = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Wait until `id`'s source has closed and its tail has been flushed
    pub async fn drain(&self, id: SessionId) {
        let task = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.flush(id);
    }

    pub fn is_buffering(&self, id: SessionId) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Flush and unsubscribe everything
    pub fn dispose(&self) {
        let ids: Vec<SessionId> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        for id in ids {
            self.stop_buffering(id);
        }
        let pending: Vec<SessionId> = self
            .inner
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        for id in pending {
            self.inner.flush(id);
        }
    }
}

impl Drop for DataBufferer {
    fn drop(&mut self) {
        self.dispose();
    }
}
