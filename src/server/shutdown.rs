//! Shutdown broadcast for the server's event loops.

use mio::Waker;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// A one-shot flag that also wakes every poll loop blocked on it.
#[derive(Default)]
pub struct ShutdownSignal {
    triggered: AtomicBool,
    wakers: Mutex<Vec<Arc<Waker>>>,
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a loop to wake on shutdown. A loop registered after the signal
    /// fired is woken immediately.
    pub fn register(&self, waker: Arc<Waker>) {
        let mut wakers = self.wakers.lock();
        if self.is_triggered() {
            wake(&waker);
        }
        wakers.push(waker);
    }

    /// Sets the flag and wakes every registered loop. Returns false if the
    /// signal had already fired.
    pub fn trigger(&self) -> bool {
        let wakers = self.wakers.lock();
        if self.triggered.swap(true, Ordering::SeqCst) {
            return false;
        }
        for waker in wakers.iter() {
            wake(waker);
        }
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

fn wake(waker: &Waker) {
    if let Err(e) = waker.wake() {
        warn!(error = %e, "Failed to wake event loop for shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll, Token};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_trigger_once() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.is_triggered());
    }

    #[test]
    fn test_trigger_wakes_blocked_poll() {
        let mut poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(9)).unwrap());
        let signal = Arc::new(ShutdownSignal::new());
        signal.register(waker);

        let trigger = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.trigger();
        });

        let start = Instant::now();
        let mut events = Events::with_capacity(4);
        while !signal.is_triggered() {
            poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_register_after_trigger_wakes_immediately() {
        let mut poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(1)).unwrap());
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.register(waker);

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert!(events.iter().any(|e| e.token() == Token(1)));
    }
}
