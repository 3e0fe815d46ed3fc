//! Cancellable ring timers.
//!
//! The controller arms one timer per ringing session and cancels it on the
//! first transition out of `Ringing`. The [`Scheduler`] trait keeps the
//! controller independent of the clock: the hub uses [`TokioScheduler`],
//! tests drive [`ManualScheduler`] by hand.

use crate::session::SessionId;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::trace;

/// Arms and cancels session timers.
pub trait Scheduler: Send {
    /// Handle used to cancel a pending timer.
    type Handle: Send;

    /// Report `session` as expired once `delay` has elapsed.
    fn schedule(&mut self, session: SessionId, delay: Duration) -> Self::Handle;

    /// Cancel a pending timer. Cancelling a fired timer is a no-op.
    fn cancel(&mut self, handle: Self::Handle);
}

/// Timers backed by tokio tasks.
///
/// Expired sessions are sent to the channel given at construction; the hub
/// reads the other end.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    expired: mpsc::UnboundedSender<SessionId>,
}

impl TokioScheduler {
    /// Create a scheduler that reports expirations on `expired`.
    #[must_use]
    pub fn new(expired: mpsc::UnboundedSender<SessionId>) -> Self {
        Self { expired }
    }
}

impl Scheduler for TokioScheduler {
    type Handle = AbortHandle;

    fn schedule(&mut self, session: SessionId, delay: Duration) -> AbortHandle {
        let expired = self.expired.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trace!(session = %session, "Ring timer fired");
            let _ = expired.send(session);
        });
        task.abort_handle()
    }

    fn cancel(&mut self, handle: AbortHandle) {
        handle.abort();
    }
}

/// A scheduler with a hand-driven clock.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    now: Duration,
    next_handle: u64,
    pending: BTreeMap<u64, (Duration, SessionId)>,
}

impl ManualScheduler {
    /// Create a scheduler at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward and return the sessions whose timers fired,
    /// in deadline order.
    pub fn advance(&mut self, by: Duration) -> Vec<SessionId> {
        self.now += by;
        let now = self.now;

        let mut due: Vec<(u64, Duration, SessionId)> = self
            .pending
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(handle, (deadline, session))| (*handle, *deadline, *session))
            .collect();
        due.sort_by_key(|(handle, deadline, _)| (*deadline, *handle));

        for (handle, _, _) in &due {
            self.pending.remove(handle);
        }
        due.into_iter().map(|(_, _, session)| session).collect()
    }

    /// Number of timers still pending.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Scheduler for ManualScheduler {
    type Handle = u64;

    fn schedule(&mut self, session: SessionId, delay: Duration) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.pending.insert(handle, (self.now + delay, session));
        handle
    }

    fn cancel(&mut self, handle: u64) {
        self.pending.remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CallTracker;
    use callway_protocol::CallType;

    fn session_ids(n: usize) -> Vec<SessionId> {
        let mut tracker = CallTracker::new();
        (0..n)
            .map(|i| {
                tracker
                    .open(&format!("caller-{i}"), &format!("callee-{i}"), CallType::Audio, None)
                    .unwrap()
                    .id
            })
            .collect()
    }

    #[test]
    fn test_manual_scheduler_fires_in_order() {
        let ids = session_ids(2);
        let mut scheduler = ManualScheduler::new();
        scheduler.schedule(ids[0], Duration::from_secs(30));
        scheduler.advance(Duration::from_secs(10));
        scheduler.schedule(ids[1], Duration::from_secs(5));

        assert!(scheduler.advance(Duration::from_secs(4)).is_empty());
        assert_eq!(scheduler.advance(Duration::from_secs(1)), vec![ids[1]]);
        assert_eq!(scheduler.advance(Duration::from_secs(20)), vec![ids[0]]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_manual_scheduler_cancel() {
        let ids = session_ids(1);
        let mut scheduler = ManualScheduler::new();
        let handle = scheduler.schedule(ids[0], Duration::from_secs(30));
        scheduler.cancel(handle);

        assert!(scheduler.advance(Duration::from_secs(60)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_fires_after_delay() {
        let ids = session_ids(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx);
        scheduler.schedule(ids[0], Duration::from_secs(30));

        tokio::time::sleep(Duration::from_millis(29_900)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rx.recv().await, Some(ids[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_cancel() {
        let ids = session_ids(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx);
        let handle = scheduler.schedule(ids[0], Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(10)).await;
        scheduler.cancel(handle);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(rx.try_recv().is_err());
    }
}
