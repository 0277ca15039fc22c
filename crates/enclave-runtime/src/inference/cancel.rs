use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

struct CancelInner {
    flag: AtomicBool,
    // Dropped on cancel so that `signal` disconnects and wakes blocking selects.
    trigger: Mutex<Option<crossbeam::channel::Sender<()>>>,
    signal: crossbeam::channel::Receiver<()>,
    watch: tokio::sync::watch::Sender<bool>,
}

/// A token that can be used to cancel an ongoing inference.
///
/// Cancellation is cooperative: the generation loop observes it at its next
/// checkpoint. Producers blocked on a full channel are woken through
/// [`CancelToken::signal`] (threads) or [`CancelToken::cancelled`] (tasks).
#[derive(Clone)]
pub struct CancelToken(Arc<CancelInner>);

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, signal) = crossbeam::channel::bounded(0);
        let (watch, _) = tokio::sync::watch::channel(false);
        Self(Arc::new(CancelInner {
            flag: AtomicBool::new(false),
            trigger: Mutex::new(Some(trigger)),
            signal,
            watch,
        }))
    }

    /// Request cancellation. Returns `true` for the first request only.
    pub fn cancel(&self) -> bool {
        if self.0.flag.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.0.trigger.lock().take();
        self.0.watch.send_replace(true);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.flag.load(Ordering::SeqCst)
    }

    /// A receiver that never yields a message and disconnects once cancelled.
    /// Meant for `crossbeam::select!`.
    pub fn signal(&self) -> &crossbeam::channel::Receiver<()> {
        &self.0.signal
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.0.watch.subscribe();
        // The sender lives as long as `self`, so this only returns on `true`.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// A point in time after which an inference counts as timed out.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn from_timeout(timeout: Option<Duration>) -> Option<Self> {
        timeout.map(Self::after)
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_sticky_and_reported_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.clone().is_cancelled());
    }

    #[test]
    fn signal_disconnects_on_cancel() {
        let token = CancelToken::new();
        assert!(matches!(
            token.signal().try_recv(),
            Err(crossbeam::channel::TryRecvError::Empty)
        ));
        token.cancel();
        assert!(matches!(
            token.signal().try_recv(),
            Err(crossbeam::channel::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn signal_wakes_a_blocked_select() {
        let token = CancelToken::new();
        let (_tx, rx) = crossbeam::channel::bounded::<u32>(0);
        let waker = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.cancel();
        });
        crossbeam::select! {
            recv(rx) -> _ => panic!("no message was sent"),
            recv(token.signal()) -> msg => assert!(msg.is_err()),
        }
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn cancelled_resolves_for_tasks() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn deadline_expires() {
        let deadline = Deadline::after(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
        assert!(Deadline::from_timeout(None).is_none());
    }
}
