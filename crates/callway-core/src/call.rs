//! Call lifecycle state machine.
//!
//! [`transition`] is a pure function from a session and an event to the
//! next step plus the frames each participant should receive. It performs
//! no I/O and reads no clock; the controller applies its result.

use crate::session::{CallSession, CallState, Role};
use callway_protocol::{EndReason, ServerFrame};
use serde_json::Value;

/// Call-control and negotiation input sent by a participant.
#[derive(Debug, Clone, PartialEq)]
pub enum CallInput {
    Accept,
    Reject,
    Hangup,
    Offer(Value),
    Answer(Value),
    IceCandidate(Value),
}

impl CallInput {
    /// Event name, for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            CallInput::Accept => "accept-call",
            CallInput::Reject => "reject-call",
            CallInput::Hangup => "end-call",
            CallInput::Offer(_) => "offer",
            CallInput::Answer(_) => "answer",
            CallInput::IceCandidate(_) => "ice-candidate",
        }
    }
}

/// Something that happened to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// A participant sent a frame.
    Input { from: Role, input: CallInput },
    /// A participant's connection was unregistered.
    Disconnected(Role),
    /// The ring timer fired.
    RingTimeout,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Termination {
    Rejected,
    Hangup,
    Disconnected,
    TimedOut,
}

impl Termination {
    /// Label used for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Rejected => "rejected",
            Termination::Hangup => "hangup",
            Termination::Disconnected => "disconnected",
            Termination::TimedOut => "timeout",
        }
    }
}

/// What to do with the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Drop the event; the session is unchanged.
    Ignore(&'static str),
    /// Keep the session, now in the given state.
    Enter(CallState),
    /// Remove the session.
    End(Termination),
}

/// A frame addressed to one side of the call.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub to: Role,
    pub frame: ServerFrame,
}

/// Result of feeding an event to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub step: Step,
    pub notices: Vec<Notice>,
}

impl Transition {
    fn ignore(reason: &'static str) -> Self {
        Self {
            step: Step::Ignore(reason),
            notices: Vec::new(),
        }
    }

    fn step(step: Step, notices: Vec<Notice>) -> Self {
        Self { step, notices }
    }
}

/// Compute the effect of `event` on `session`.
#[must_use]
pub fn transition(session: &CallSession, event: CallEvent) -> Transition {
    let state = session.state;

    match event {
        CallEvent::Input { from, input } => {
            let sender = session.participant(from).to_string();
            let peer = from.other();

            match (state, input) {
                (CallState::Ringing, CallInput::Accept) if from == Role::Callee => Transition::step(
                    Step::Enter(CallState::Negotiating),
                    vec![Notice {
                        to: peer,
                        frame: ServerFrame::CallAccepted { from: sender },
                    }],
                ),
                (CallState::Ringing, CallInput::Reject) if from == Role::Callee => Transition::step(
                    Step::End(Termination::Rejected),
                    vec![Notice {
                        to: peer,
                        frame: ServerFrame::CallRejected { from: sender },
                    }],
                ),
                (CallState::Ringing, CallInput::Accept | CallInput::Reject) => {
                    Transition::ignore("only the callee can answer")
                }
                (_, CallInput::Accept | CallInput::Reject) => {
                    Transition::ignore("call is not ringing")
                }

                (_, CallInput::Hangup) => Transition::step(
                    Step::End(Termination::Hangup),
                    vec![Notice {
                        to: peer,
                        frame: ServerFrame::CallEnded {
                            from: sender,
                            reason: EndReason::Hangup,
                        },
                    }],
                ),

                (CallState::Ringing, _) => Transition::ignore("negotiation before accept"),

                (_, CallInput::Offer(offer)) => Transition::step(
                    Step::Enter(state),
                    vec![Notice {
                        to: peer,
                        frame: ServerFrame::Offer {
                            from: sender,
                            offer,
                        },
                    }],
                ),
                (_, CallInput::Answer(answer)) => Transition::step(
                    Step::Enter(CallState::Active),
                    vec![Notice {
                        to: peer,
                        frame: ServerFrame::Answer {
                            from: sender,
                            answer,
                        },
                    }],
                ),
                (_, CallInput::IceCandidate(candidate)) => Transition::step(
                    Step::Enter(state),
                    vec![Notice {
                        to: peer,
                        frame: ServerFrame::IceCandidate {
                            from: sender,
                            candidate,
                        },
                    }],
                ),
            }
        }

        CallEvent::Disconnected(role) => Transition::step(
            Step::End(Termination::Disconnected),
            vec![Notice {
                to: role.other(),
                frame: ServerFrame::CallEnded {
                    from: session.participant(role).to_string(),
                    reason: EndReason::Disconnected,
                },
            }],
        ),

        CallEvent::RingTimeout if state == CallState::Ringing => Transition::step(
            Step::End(Termination::TimedOut),
            vec![
                Notice {
                    to: Role::Caller,
                    frame: ServerFrame::CallTimeout {
                        peer: session.callee.clone(),
                    },
                },
                Notice {
                    to: Role::Callee,
                    frame: ServerFrame::CallTimeout {
                        peer: session.caller.clone(),
                    },
                },
            ],
        ),
        CallEvent::RingTimeout => Transition::ignore("ring timer outlived ringing"),
    }
}
