use std::sync::Arc;

use tokio::sync::Semaphore;

/// Broadcasts a single shutdown notification to any number of
/// subscribers.
///
/// - Clone the handle to subscribe; there is no separate sender type.
/// - Each handle observes the signal at most once, including handles
///   cloned after the signal was already sent.
/// - Sending more than once is harmless.
///
/// The implementation closes a zero-permit [`Semaphore`]: `acquire` on a
/// closed semaphore returns an error, which doubles as the notification,
/// and closing twice is a no-op.
#[derive(Debug)]
pub struct ShutdownSignal {
    semaphore: Arc<Semaphore>,
    seen: bool,
}

impl ShutdownSignal {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(0)),
            seen: false,
        }
    }

    /// Notify all current and future subscribers.
    pub fn send(&self) {
        self.semaphore.close();
    }

    /// Wait for the signal.
    ///
    /// Resolves at most once per handle; once a handle has observed the
    /// signal, later `recv` calls on it never resolve.
    pub async fn recv(&mut self) {
        if self.seen {
            return std::future::pending().await;
        }
        // A zero-permit semaphore can never hand out a permit, so this
        // only returns once the semaphore is closed, i.e. once the
        // signal was sent.
        let result = self.semaphore.acquire().await;
        debug_assert!(result.is_err(), "0-permit semaphore gave out a permit");
        self.seen = true;
    }

    /// Whether the signal has been sent. Does not consume this handle's
    /// one observation.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.semaphore.is_closed()
    }
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            semaphore: self.semaphore.clone(),
            // Every clone gets its own chance to observe the signal,
            // even if the original already has.
            seen: false,
        }
    }
}
