//! Call lifecycle controller.
//!
//! Validates client call events against the tracked sessions, applies the
//! state machine and routes the resulting frames. Every failure here is
//! local: the offending event is dropped or answered with a notice, and the
//! connection carries on.

use crate::call::{transition, CallEvent, CallInput, Step, Termination};
use crate::registry::ConnectionRegistry;
use crate::router::{RouterStats, SignalRouter};
use crate::scheduler::Scheduler;
use crate::session::{CallState, CallTracker, SessionId, TrackerError};
use callway_protocol::{error_codes, CallType, ClientFrame, ServerFrame};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Default time a call may ring before it is abandoned.
pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(30);

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How long a call may ring unanswered.
    pub ring_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ring_timeout: DEFAULT_RING_TIMEOUT,
        }
    }
}

/// What the controller did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A new session is ringing.
    Ringing(SessionId),
    /// The callee is not online; the caller was told.
    Unavailable,
    /// The callee is in another call; the caller was told.
    Busy,
    /// The initiation was refused for the caller's own reasons.
    Refused(TrackerError),
    /// The session moved to (or stayed in) a state.
    Entered(CallState),
    /// The session ended and was removed.
    Ended(Termination),
    /// The event did not apply to any session it could touch.
    Ignored(&'static str),
}

/// Call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallStats {
    pub started: u64,
    pub unavailable: u64,
    pub busy: u64,
    pub rejected: u64,
    pub hangup: u64,
    pub disconnected: u64,
    pub timed_out: u64,
}

impl CallStats {
    fn record_end(&mut self, termination: Termination) {
        match termination {
            Termination::Rejected => self.rejected += 1,
            Termination::Hangup => self.hangup += 1,
            Termination::Disconnected => self.disconnected += 1,
            Termination::TimedOut => self.timed_out += 1,
        }
    }
}

/// Owns the call sessions and drives them through their lifecycle.
pub struct CallController<S: Scheduler> {
    tracker: CallTracker,
    router: SignalRouter,
    scheduler: S,
    timers: HashMap<SessionId, S::Handle>,
    config: ControllerConfig,
    stats: CallStats,
}

impl<S: Scheduler> CallController<S> {
    /// Create a controller with no sessions.
    #[must_use]
    pub fn new(scheduler: S, config: ControllerConfig) -> Self {
        Self {
            tracker: CallTracker::new(),
            router: SignalRouter::new(),
            scheduler,
            timers: HashMap::new(),
            config,
            stats: CallStats::default(),
        }
    }

    /// Get the session tracker.
    #[must_use]
    pub fn tracker(&self) -> &CallTracker {
        &self.tracker
    }

    /// Get the scheduler, e.g. to drive a manual clock.
    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    /// Get call counters.
    #[must_use]
    pub fn stats(&self) -> CallStats {
        self.stats
    }

    /// Get routing counters.
    #[must_use]
    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    /// Number of ring timers currently armed.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Handle a call frame from `sender`.
    pub fn handle_frame(
        &mut self,
        registry: &ConnectionRegistry,
        sender: &str,
        frame: ClientFrame,
    ) -> Outcome {
        match frame {
            ClientFrame::CallUser {
                to,
                call_type,
                caller_info,
            } => self.initiate(registry, sender, &to, call_type, caller_info),
            ClientFrame::AcceptCall { to } => self.signal(registry, sender, &to, CallInput::Accept),
            ClientFrame::RejectCall { to } => self.signal(registry, sender, &to, CallInput::Reject),
            ClientFrame::EndCall { to } => self.signal(registry, sender, &to, CallInput::Hangup),
            ClientFrame::Offer { to, offer } => {
                self.signal(registry, sender, &to, CallInput::Offer(offer))
            }
            ClientFrame::Answer { to, answer } => {
                self.signal(registry, sender, &to, CallInput::Answer(answer))
            }
            ClientFrame::IceCandidate { to, candidate } => {
                self.signal(registry, sender, &to, CallInput::IceCandidate(candidate))
            }
            ClientFrame::Ping { .. } => Outcome::Ignored("not a call event"),
        }
    }

    /// Start a call from `caller` to `callee`.
    pub fn initiate(
        &mut self,
        registry: &ConnectionRegistry,
        caller: &str,
        callee: &str,
        call_type: CallType,
        caller_info: Option<Value>,
    ) -> Outcome {
        if registry.lookup(callee).is_none() {
            info!(caller = %caller, callee = %callee, "Call: callee unavailable");
            self.stats.unavailable += 1;
            self.router.route(
                registry,
                caller,
                ServerFrame::CallUnavailable { to: callee.to_string() },
            );
            return Outcome::Unavailable;
        }

        let (id, caller_info) = match self.tracker.open(caller, callee, call_type, caller_info) {
            Ok(session) => (session.id, session.caller_info.clone()),
            Err(TrackerError::CalleeBusy(_)) => {
                info!(caller = %caller, callee = %callee, "Call: callee busy");
                self.stats.busy += 1;
                self.router.route(
                    registry,
                    caller,
                    ServerFrame::CallBusy { to: callee.to_string() },
                );
                return Outcome::Busy;
            }
            Err(err) => {
                debug!(caller = %caller, callee = %callee, error = %err, "Call: initiation refused");
                let code = match err {
                    TrackerError::SelfCall => error_codes::SELF_CALL,
                    _ => error_codes::ALREADY_IN_CALL,
                };
                self.router
                    .route(registry, caller, ServerFrame::error(code, err.to_string()));
                return Outcome::Refused(err);
            }
        };

        let timer = self.scheduler.schedule(id, self.config.ring_timeout);
        self.timers.insert(id, timer);
        self.stats.started += 1;

        info!(
            session = %id,
            caller = %caller,
            callee = %callee,
            call_type = %call_type,
            "Call: ringing"
        );

        self.router.route(
            registry,
            callee,
            ServerFrame::IncomingCall {
                from: caller.to_string(),
                call_type,
                caller_info,
            },
        );

        Outcome::Ringing(id)
    }

    /// Apply a participant's input to their current session.
    ///
    /// `to` must name the sender's peer in that session; anything else is a
    /// stale or foreign event and is dropped.
    pub fn signal(
        &mut self,
        registry: &ConnectionRegistry,
        sender: &str,
        to: &str,
        input: CallInput,
    ) -> Outcome {
        let Some(session) = self.tracker.session_of(sender) else {
            debug!(sender = %sender, to = %to, event = input.name(), "Call: no active session");
            return Outcome::Ignored("no active session");
        };
        let Some(role) = session.role_of(sender) else {
            return Outcome::Ignored("sender is not a participant");
        };
        if session.participant(role.other()) != to {
            debug!(
                session = %session.id,
                sender = %sender,
                to = %to,
                event = input.name(),
                "Call: event addressed outside the session"
            );
            return Outcome::Ignored("destination is not the peer");
        }

        let id = session.id;
        self.apply(registry, id, CallEvent::Input { from: role, input })
    }

    /// End whatever session `user` was in because their connection went away.
    pub fn disconnect(&mut self, registry: &ConnectionRegistry, user: &str) -> Outcome {
        let Some(session) = self.tracker.session_of(user) else {
            return Outcome::Ignored("no active session");
        };
        let Some(role) = session.role_of(user) else {
            return Outcome::Ignored("sender is not a participant");
        };
        let id = session.id;
        self.apply(registry, id, CallEvent::Disconnected(role))
    }

    /// Handle an expired ring timer.
    pub fn ring_timeout(&mut self, registry: &ConnectionRegistry, id: SessionId) -> Outcome {
        self.timers.remove(&id);
        self.apply(registry, id, CallEvent::RingTimeout)
    }

    fn apply(&mut self, registry: &ConnectionRegistry, id: SessionId, event: CallEvent) -> Outcome {
        let Some(session) = self.tracker.get(id) else {
            debug!(session = %id, "Call: event for ended session");
            return Outcome::Ignored("session already ended");
        };

        let result = transition(session, event);
        let deliveries: Vec<(String, ServerFrame)> = result
            .notices
            .into_iter()
            .map(|notice| (session.participant(notice.to).to_string(), notice.frame))
            .collect();

        let outcome = match result.step {
            Step::Ignore(reason) => {
                debug!(session = %id, state = session.state.as_str(), reason, "Call: event ignored");
                return Outcome::Ignored(reason);
            }
            Step::Enter(state) => {
                if self.tracker.set_state(id, state) == Some(CallState::Ringing)
                    && state != CallState::Ringing
                {
                    self.cancel_timer(id);
                }
                Outcome::Entered(state)
            }
            Step::End(termination) => {
                self.cancel_timer(id);
                if let Some(closed) = self.tracker.close(id) {
                    info!(
                        session = %id,
                        caller = %closed.caller,
                        callee = %closed.callee,
                        reason = termination.as_str(),
                        "Call: ended"
                    );
                }
                self.stats.record_end(termination);
                Outcome::Ended(termination)
            }
        };

        for (to, frame) in deliveries {
            self.router.route(registry, &to, frame);
        }

        outcome
    }

    fn cancel_timer(&mut self, id: SessionId) {
        if let Some(timer) = self.timers.remove(&id) {
            debug!(session = %id, "Call: ring timer cancelled");
            self.scheduler.cancel(timer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionHandle;
    use crate::scheduler::ManualScheduler;
    use callway_protocol::EndReason;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    type Inbox = mpsc::UnboundedReceiver<Arc<ServerFrame>>;

    struct Fixture {
        registry: ConnectionRegistry,
        controller: CallController<ManualScheduler>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: ConnectionRegistry::new(),
                controller: CallController::new(ManualScheduler::new(), ControllerConfig::default()),
            }
        }

        fn connect(&mut self, user: &str) -> Inbox {
            let (tx, rx) = mpsc::unbounded_channel();
            self.registry.register(ConnectionHandle::new(user, tx));
            rx
        }

        fn send(&mut self, sender: &str, frame: ClientFrame) -> Outcome {
            self.controller.handle_frame(&self.registry, sender, frame)
        }

        fn call(&mut self, caller: &str, callee: &str) -> Outcome {
            self.send(
                caller,
                ClientFrame::CallUser {
                    to: callee.into(),
                    call_type: CallType::Video,
                    caller_info: Some(json!({"fullname": caller})),
                },
            )
        }

        fn elapse(&mut self, by: Duration) -> Vec<Outcome> {
            let expired = self.controller.scheduler_mut().advance(by);
            expired
                .into_iter()
                .map(|id| self.controller.ring_timeout(&self.registry, id))
                .collect()
        }
    }

    fn drain(inbox: &mut Inbox) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = inbox.try_recv() {
            frames.push((*frame).clone());
        }
        frames
    }

    #[test]
    fn test_full_video_call() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice");
        let mut bob = fx.connect("bob");

        let Outcome::Ringing(id) = fx.call("alice", "bob") else {
            panic!("call did not ring");
        };
        assert_eq!(
            drain(&mut bob),
            vec![ServerFrame::IncomingCall {
                from: "alice".into(),
                call_type: CallType::Video,
                caller_info: Some(json!({"fullname": "alice"})),
            }]
        );

        assert_eq!(
            fx.send("bob", ClientFrame::AcceptCall { to: "alice".into() }),
            Outcome::Entered(CallState::Negotiating)
        );
        assert_eq!(drain(&mut alice), vec![ServerFrame::CallAccepted { from: "bob".into() }]);

        let offer = json!({"type": "offer", "sdp": "v=0"});
        fx.send(
            "alice",
            ClientFrame::Offer {
                to: "bob".into(),
                offer: offer.clone(),
            },
        );
        assert_eq!(
            drain(&mut bob),
            vec![ServerFrame::Offer {
                from: "alice".into(),
                offer,
            }]
        );

        let answer = json!({"type": "answer", "sdp": "v=0"});
        assert_eq!(
            fx.send(
                "bob",
                ClientFrame::Answer {
                    to: "alice".into(),
                    answer: answer.clone(),
                },
            ),
            Outcome::Entered(CallState::Active)
        );
        assert_eq!(
            drain(&mut alice),
            vec![ServerFrame::Answer {
                from: "bob".into(),
                answer,
            }]
        );
        assert_eq!(fx.controller.tracker().get(id).unwrap().state, CallState::Active);

        assert_eq!(
            fx.send("bob", ClientFrame::EndCall { to: "alice".into() }),
            Outcome::Ended(Termination::Hangup)
        );
        assert_eq!(
            drain(&mut alice),
            vec![ServerFrame::CallEnded {
                from: "bob".into(),
                reason: EndReason::Hangup,
            }]
        );
        assert!(fx.controller.tracker().get(id).is_none());
        assert!(fx.controller.tracker().session_of("alice").is_none());
        assert!(fx.controller.tracker().session_of("bob").is_none());
    }

    #[test]
    fn test_call_to_offline_user() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice");

        assert_eq!(fx.call("alice", "bob"), Outcome::Unavailable);
        assert_eq!(drain(&mut alice), vec![ServerFrame::CallUnavailable { to: "bob".into() }]);
        assert!(fx.controller.tracker().is_empty());
        assert_eq!(fx.controller.pending_timers(), 0);
    }

    #[test]
    fn test_busy_callee_keeps_existing_session() {
        let mut fx = Fixture::new();
        let _alice = fx.connect("alice");
        let mut bob = fx.connect("bob");
        let mut carol = fx.connect("carol");

        let Outcome::Ringing(id) = fx.call("alice", "bob") else {
            panic!("call did not ring");
        };
        drain(&mut bob);

        assert_eq!(fx.call("carol", "bob"), Outcome::Busy);
        assert_eq!(drain(&mut carol), vec![ServerFrame::CallBusy { to: "bob".into() }]);
        assert!(drain(&mut bob).is_empty());

        let session = fx.controller.tracker().session_of("bob").unwrap();
        assert_eq!(session.id, id);
        assert_eq!(session.caller, "alice");
        assert_eq!(session.state, CallState::Ringing);
        assert_eq!(fx.controller.tracker().len(), 1);
    }

    #[test]
    fn test_caller_already_in_call() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice");
        let _bob = fx.connect("bob");
        let _carol = fx.connect("carol");

        fx.call("alice", "bob");
        drain(&mut alice);

        assert!(matches!(
            fx.call("alice", "carol"),
            Outcome::Refused(TrackerError::CallerBusy(_))
        ));
        assert!(matches!(
            drain(&mut alice).as_slice(),
            [ServerFrame::Error { code: error_codes::ALREADY_IN_CALL, .. }]
        ));
    }

    #[test]
    fn test_reject_discards_session() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice");
        let _bob = fx.connect("bob");

        let Outcome::Ringing(id) = fx.call("alice", "bob") else {
            panic!("call did not ring");
        };
        assert_eq!(
            fx.send("bob", ClientFrame::RejectCall { to: "alice".into() }),
            Outcome::Ended(Termination::Rejected)
        );
        assert_eq!(drain(&mut alice), vec![ServerFrame::CallRejected { from: "bob".into() }]);
        assert!(fx.controller.tracker().get(id).is_none());
        assert!(fx.controller.tracker().session_of("alice").is_none());
        assert!(fx.controller.tracker().session_of("bob").is_none());
        assert_eq!(fx.controller.pending_timers(), 0);
        assert_eq!(fx.controller.scheduler_mut().pending(), 0);
    }

    #[test]
    fn test_unanswered_call_times_out() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice");
        let mut bob = fx.connect("bob");

        let Outcome::Ringing(id) = fx.call("alice", "bob") else {
            panic!("call did not ring");
        };
        drain(&mut bob);

        assert!(fx.elapse(Duration::from_millis(29_999)).is_empty());
        assert_eq!(fx.elapse(Duration::from_millis(1)), vec![Outcome::Ended(Termination::TimedOut)]);

        assert_eq!(drain(&mut alice), vec![ServerFrame::CallTimeout { peer: "bob".into() }]);
        assert_eq!(drain(&mut bob), vec![ServerFrame::CallTimeout { peer: "alice".into() }]);
        assert!(fx.controller.tracker().get(id).is_none());
        assert_eq!(fx.controller.stats().timed_out, 1);
    }

    #[test]
    fn test_accept_just_before_timeout_cancels_timer() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice");
        let _bob = fx.connect("bob");

        let Outcome::Ringing(id) = fx.call("alice", "bob") else {
            panic!("call did not ring");
        };

        assert!(fx.elapse(Duration::from_millis(29_900)).is_empty());
        fx.send("bob", ClientFrame::AcceptCall { to: "alice".into() });
        drain(&mut alice);

        assert!(fx.elapse(Duration::from_secs(60)).is_empty());
        assert_eq!(fx.controller.tracker().get(id).unwrap().state, CallState::Negotiating);
        assert!(drain(&mut alice).is_empty());
    }

    #[test]
    fn test_stale_timer_is_ignored() {
        let mut fx = Fixture::new();
        let _alice = fx.connect("alice");
        let _bob = fx.connect("bob");

        let Outcome::Ringing(id) = fx.call("alice", "bob") else {
            panic!("call did not ring");
        };
        fx.send("bob", ClientFrame::AcceptCall { to: "alice".into() });

        // A timer that fired anyway, racing the accept.
        assert!(matches!(
            fx.controller.ring_timeout(&fx.registry, id),
            Outcome::Ignored(_)
        ));
        assert_eq!(fx.controller.tracker().get(id).unwrap().state, CallState::Negotiating);
    }

    #[test]
    fn test_disconnect_ends_active_call() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice");
        let _bob = fx.connect("bob");

        fx.call("alice", "bob");
        fx.send("bob", ClientFrame::AcceptCall { to: "alice".into() });
        fx.send(
            "bob",
            ClientFrame::Answer {
                to: "alice".into(),
                answer: json!({}),
            },
        );
        drain(&mut alice);

        let bob_id = fx.registry.lookup("bob").unwrap().id();
        fx.registry.unregister("bob", bob_id);
        assert_eq!(
            fx.controller.disconnect(&fx.registry, "bob"),
            Outcome::Ended(Termination::Disconnected)
        );
        assert_eq!(
            drain(&mut alice),
            vec![ServerFrame::CallEnded {
                from: "bob".into(),
                reason: EndReason::Disconnected,
            }]
        );
        assert!(fx.controller.tracker().is_empty());
    }

    #[test]
    fn test_foreign_and_stale_events_ignored() {
        let mut fx = Fixture::new();
        let _alice = fx.connect("alice");
        let mut bob = fx.connect("bob");
        let _carol = fx.connect("carol");

        // No session at all.
        assert!(matches!(
            fx.send("carol", ClientFrame::EndCall { to: "bob".into() }),
            Outcome::Ignored(_)
        ));

        fx.call("alice", "bob");
        drain(&mut bob);

        // Carol is not part of the call.
        assert!(matches!(
            fx.send("carol", ClientFrame::AcceptCall { to: "alice".into() }),
            Outcome::Ignored(_)
        ));
        // Bob addresses someone other than his peer.
        assert!(matches!(
            fx.send("bob", ClientFrame::AcceptCall { to: "carol".into() }),
            Outcome::Ignored(_)
        ));
        assert_eq!(
            fx.controller.tracker().session_of("bob").unwrap().state,
            CallState::Ringing
        );

        fx.send("bob", ClientFrame::RejectCall { to: "alice".into() });
        // Replayed after the session is gone.
        assert!(matches!(
            fx.send(
                "alice",
                ClientFrame::IceCandidate {
                    to: "bob".into(),
                    candidate: json!({}),
                },
            ),
            Outcome::Ignored(_)
        ));
        assert!(drain(&mut bob).is_empty());
    }

    #[test]
    fn test_self_call_refused() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice");

        assert_eq!(fx.call("alice", "alice"), Outcome::Refused(TrackerError::SelfCall));
        assert!(matches!(
            drain(&mut alice).as_slice(),
            [ServerFrame::Error { code: error_codes::SELF_CALL, .. }]
        ));
    }

    #[test]
    fn test_new_attempt_after_terminal_state() {
        let mut fx = Fixture::new();
        let _alice = fx.connect("alice");
        let _bob = fx.connect("bob");

        let Outcome::Ringing(first) = fx.call("alice", "bob") else {
            panic!("call did not ring");
        };
        fx.send("alice", ClientFrame::EndCall { to: "bob".into() });

        let Outcome::Ringing(second) = fx.call("alice", "bob") else {
            panic!("second call did not ring");
        };
        assert_ne!(first, second);
        assert_eq!(fx.controller.stats().started, 2);
        assert_eq!(fx.controller.stats().hangup, 1);
    }
}
