/// Bounded request dispatcher
///
/// `max_in_flight` requests run concurrently, up to `max_queue` more wait
/// FIFO for a slot. Waiting longer than `wait_timeout`, or arriving to a
/// full queue, yields `DispatchError::Overloaded`.
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_in_flight: usize,
    pub max_queue: usize,
    pub wait_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            max_queue: 256,
            wait_timeout: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher overloaded")]
    Overloaded,
    #[error("request cancelled while waiting for capacity")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub in_flight: usize,
    pub queued: usize,
}

struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

struct State {
    in_flight: usize,
    queue: VecDeque<Waiter>,
    next_id: u64,
}

#[derive(Clone)]
pub struct Dispatcher {
    config: DispatcherConfig,
    state: Arc<Mutex<State>>,
}

/// In-flight slot; dropping it releases the slot to the next waiter.
pub struct Permit {
    dispatcher: Dispatcher,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.dispatcher.release();
    }
}

enum Admission {
    Granted,
    Queued(u64, oneshot::Receiver<()>),
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(State {
                in_flight: 0,
                queue: VecDeque::new(),
                next_id: 0,
            })),
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        let state = self.state.lock();
        DispatcherStats {
            in_flight: state.in_flight,
            queued: state.queue.len(),
        }
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Permit, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let (id, mut grant) = match self.admit()? {
            Admission::Granted => return Ok(self.permit()),
            Admission::Queued(id, grant) => (id, grant),
        };

        let outcome = tokio::select! {
            res = &mut grant => match res {
                Ok(()) => return Ok(self.permit()),
                Err(_) => DispatchError::Overloaded,
            },
            _ = tokio::time::sleep(self.config.wait_timeout) => DispatchError::Overloaded,
            _ = cancel.cancelled() => DispatchError::Cancelled,
        };

        // Still queued: withdraw. Otherwise a release already handed us the slot.
        let withdrawn = {
            let mut state = self.state.lock();
            let before = state.queue.len();
            state.queue.retain(|w| w.id != id);
            state.queue.len() != before
        };
        if !withdrawn && grant.try_recv().is_ok() {
            return Ok(self.permit());
        }

        if outcome == DispatchError::Overloaded {
            warn!(
                wait_ms = self.config.wait_timeout.as_millis() as u64,
                "dispatcher wait timed out"
            );
        }
        Err(outcome)
    }

    /// Runs `fut` while holding a slot.
    pub async fn run<F, T>(&self, cancel: &CancellationToken, fut: F) -> Result<T, DispatchError>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire(cancel).await?;
        Ok(fut.await)
    }

    fn admit(&self) -> Result<Admission, DispatchError> {
        let mut state = self.state.lock();
        if state.in_flight < self.config.max_in_flight && state.queue.is_empty() {
            state.in_flight += 1;
            return Ok(Admission::Granted);
        }
        if state.queue.len() >= self.config.max_queue {
            debug!(
                in_flight = state.in_flight,
                queued = state.queue.len(),
                "dispatcher queue full"
            );
            return Err(DispatchError::Overloaded);
        }
        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = oneshot::channel();
        state.queue.push_back(Waiter { id, grant: tx });
        Ok(Admission::Queued(id, rx))
    }

    fn permit(&self) -> Permit {
        Permit {
            dispatcher: self.clone(),
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.queue.pop_front() {
            // Slot moves to the waiter; in_flight is unchanged.
            if waiter.grant.send(()).is_ok() {
                return;
            }
        }
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(max_in_flight: usize, max_queue: usize, wait_ms: u64) -> Dispatcher {
        Dispatcher::new(DispatcherConfig {
            max_in_flight,
            max_queue,
            wait_timeout: Duration::from_millis(wait_ms),
        })
    }

    #[tokio::test]
    async fn test_immediate_grant_and_release() {
        let d = dispatcher(2, 0, 10);
        let cancel = CancellationToken::new();

        let a = d.acquire(&cancel).await.unwrap();
        let _b = d.acquire(&cancel).await.unwrap();
        assert_eq!(d.stats().in_flight, 2);

        drop(a);
        assert_eq!(d.stats().in_flight, 1);
    }

    #[tokio::test]
    async fn test_full_queue_is_overloaded() {
        let d = dispatcher(1, 0, 10);
        let cancel = CancellationToken::new();

        let _held = d.acquire(&cancel).await.unwrap();
        assert_eq!(d.acquire(&cancel).await.err(), Some(DispatchError::Overloaded));
    }

    #[tokio::test]
    async fn test_wait_timeout_is_overloaded() {
        let d = dispatcher(1, 4, 20);
        let cancel = CancellationToken::new();

        let _held = d.acquire(&cancel).await.unwrap();
        assert_eq!(d.acquire(&cancel).await.err(), Some(DispatchError::Overloaded));
        assert_eq!(d.stats().queued, 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter() {
        let d = dispatcher(1, 4, 5_000);
        let cancel = CancellationToken::new();
        let _held = d.acquire(&cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let d2 = d.clone();
        let token = waiter_cancel.clone();
        let handle = tokio::spawn(async move { d2.acquire(&token).await.err() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter_cancel.cancel();
        assert_eq!(handle.await.unwrap(), Some(DispatchError::Cancelled));
        assert_eq!(d.stats().queued, 0);
    }
}
