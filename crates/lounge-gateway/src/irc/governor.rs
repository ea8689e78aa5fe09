//! Admission control for new IRC connections.
//!
//! Networks temporarily ban hosts that connect too quickly, so every bridge
//! connection goes through one FIFO drained at no more than
//! [`MAX_CONNECTIONS_PER_WINDOW`] starts per [`CONNECTION_WINDOW`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

pub const CONNECTION_WINDOW: Duration = Duration::from_secs(15);
pub const MAX_CONNECTIONS_PER_WINDOW: usize = 3;

/// Wait before re-checking a full window.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Pause between consecutive admissions.
pub const DRAIN_DELAY: Duration = Duration::from_millis(500);

/// Timestamps of recent admissions.
#[derive(Debug)]
pub struct SlidingWindow {
    recent: VecDeque<Instant>,
    window: Duration,
    max: usize,
}

impl SlidingWindow {
    pub fn new(window: Duration, max: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(max),
            window,
            max,
        }
    }

    /// Record an admission at `now` if the window has room.
    pub fn try_admit(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.recent.front() {
            if now.duration_since(*oldest) >= self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.recent.len() < self.max {
            self.recent.push_back(now);
            true
        } else {
            false
        }
    }
}

struct PendingConnection {
    label: String,
    start: Box<dyn FnOnce() + Send>,
}

/// Handle to the admission queue. Cloning shares the queue.
#[derive(Clone)]
pub struct AdmissionGovernor {
    queue: mpsc::UnboundedSender<PendingConnection>,
    pending: Arc<AtomicUsize>,
}

impl AdmissionGovernor {
    /// Spawn the drain task. Must be called within a tokio runtime.
    pub fn spawn() -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        tokio::spawn(drain(
            rx,
            pending.clone(),
            SlidingWindow::new(CONNECTION_WINDOW, MAX_CONNECTIONS_PER_WINDOW),
        ));
        Self { queue, pending }
    }

    /// Queue a connection start. Returns how many were waiting ahead of it.
    pub fn enqueue(&self, label: impl Into<String>, start: impl FnOnce() + Send + 'static) -> usize {
        let label = label.into();
        let ahead = self.pending.fetch_add(1, Ordering::AcqRel);
        debug!(label, ahead, "IRC connection queued");
        let job = PendingConnection {
            label,
            start: Box::new(start),
        };
        if self.queue.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        ahead
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

async fn drain(
    mut rx: mpsc::UnboundedReceiver<PendingConnection>,
    pending: Arc<AtomicUsize>,
    mut window: SlidingWindow,
) {
    while let Some(job) = rx.recv().await {
        while !window.try_admit(Instant::now()) {
            debug!(label = %job.label, "Connection window full, retrying");
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        pending.fetch_sub(1, Ordering::AcqRel);
        info!(label = %job.label, "IRC connection admitted");
        (job.start)();
        tokio::time::sleep(DRAIN_DELAY).await;
    }
}
