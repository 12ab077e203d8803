// Timer primitives for persistent processes

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Runs a callback once after `delay`. Scheduling again restarts the delay.
pub struct RunOnceScheduler {
    delay: Duration,
    runner: Arc<dyn Fn() + Send + Sync>,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl RunOnceScheduler {
    pub fn new(delay: Duration, runner: Arc<dyn Fn() + Send + Sync>) -> Self {
        Self {
            delay,
            runner,
            handle: StdMutex::new(None),
        }
    }

    pub fn schedule(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = handle.take() {
            previous.abort();
        }
        let delay = self.delay;
        let runner = Arc::clone(&self.runner);
        *handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            runner();
        }));
    }

    pub fn cancel(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for RunOnceScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A one-shot gate that opens on demand or by itself once its deadline passes.
///
/// Waiting can never outlast the deadline.
pub struct AutoOpenBarrier {
    opened: watch::Sender<bool>,
    deadline: Instant,
}

impl AutoOpenBarrier {
    pub fn new(timeout: Duration) -> Self {
        let (opened, _) = watch::channel(false);
        Self {
            opened,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn open(&self) {
        self.opened.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.opened.borrow() || Instant::now() >= self.deadline
    }

    pub async fn wait(&self) {
        let mut rx = self.opened.subscribe();
        let _ = tokio::time::timeout_at(self.deadline, rx.wait_for(|open| *open)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_scheduler(delay: Duration) -> (RunOnceScheduler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let scheduler = RunOnceScheduler::new(
            delay,
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (scheduler, count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_once_after_delay() {
        let (scheduler, count) = counting_scheduler(Duration::from_secs(60));
        scheduler.schedule();
        assert!(scheduler.is_scheduled());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_run() {
        let (scheduler, count) = counting_scheduler(Duration::from_secs(1));
        scheduler.schedule();
        scheduler.cancel();
        assert!(!scheduler.is_scheduled());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_restarts_delay() {
        let (scheduler, count) = counting_scheduler(Duration::from_secs(10));
        scheduler.schedule();
        tokio::time::sleep(Duration::from_secs(8)).await;
        scheduler.schedule();
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_barrier_opens_on_demand() {
        let barrier = Arc::new(AutoOpenBarrier::new(Duration::from_secs(4)));
        let opener = Arc::clone(&barrier);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            opener.open();
        });

        let start = Instant::now();
        barrier.wait().await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(barrier.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_barrier_opens_itself_at_deadline() {
        let barrier = AutoOpenBarrier::new(Duration::from_secs(4));
        let start = Instant::now();
        barrier.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert!(barrier.is_open());
    }
}
