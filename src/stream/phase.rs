//! Tunnel lifecycle state machine.
//!
//! ```text
//! Idle → Resolving → Dialing → Upgrading → Relaying → Cancelling → Done
//!            └──────────┴──────────┴── Fail ──────────────────────→ Done
//! ```

use statig::prelude::*;
use tracing::debug;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Request accepted; fetching and validating the instance.
    Resolve,
    /// Instance validated; opening the server connection.
    Dial,
    /// Server connection open; switching the client protocol.
    Upgrade,
    /// Both connections exist; relay tasks running.
    Relay,
    /// First relay result received; tearing both connections down.
    Cancel,
    /// Second relay result received.
    Finish,
    /// Resolve, dial or upgrade failed.
    Fail,
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// Per-tunnel phase tracker. Only used for logging and assertions.
#[derive(Debug, Default)]
pub struct TunnelPhases {
    pub target: String,
}

#[state_machine(
    initial = "State::idle()",
    state(derive(Debug, Clone, PartialEq)),
    after_transition = "Self::on_transition"
)]
impl TunnelPhases {
    #[state]
    fn idle(&mut self, event: &PhaseEvent) -> Outcome<State> {
        match event {
            PhaseEvent::Resolve => Transition(State::resolving()),
            _ => Handled,
        }
    }

    #[state]
    fn resolving(&mut self, event: &PhaseEvent) -> Outcome<State> {
        match event {
            PhaseEvent::Dial => Transition(State::dialing()),
            PhaseEvent::Fail => Transition(State::done()),
            _ => Handled,
        }
    }

    #[state]
    fn dialing(&mut self, event: &PhaseEvent) -> Outcome<State> {
        match event {
            PhaseEvent::Upgrade => Transition(State::upgrading()),
            PhaseEvent::Fail => Transition(State::done()),
            _ => Handled,
        }
    }

    #[state]
    fn upgrading(&mut self, event: &PhaseEvent) -> Outcome<State> {
        match event {
            PhaseEvent::Relay => Transition(State::relaying()),
            PhaseEvent::Fail => Transition(State::done()),
            _ => Handled,
        }
    }

    #[state]
    fn relaying(&mut self, event: &PhaseEvent) -> Outcome<State> {
        match event {
            PhaseEvent::Cancel => Transition(State::cancelling()),
            _ => Handled,
        }
    }

    #[state]
    fn cancelling(&mut self, event: &PhaseEvent) -> Outcome<State> {
        match event {
            PhaseEvent::Finish => Transition(State::done()),
            _ => Handled,
        }
    }

    /// Terminal.
    #[state]
    fn done(&mut self, event: &PhaseEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }
}

impl TunnelPhases {
    fn on_transition(&mut self, source: &State, target: &State) {
        debug!(tunnel = %self.target, from = ?source, to = ?target, "tunnel phase");
    }
}

/// Owns the running machine for one `Streamer::handle` call.
pub struct PhaseTracker {
    machine: StateMachine<TunnelPhases>,
}

impl PhaseTracker {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            machine: TunnelPhases {
                target: target.into(),
            }
            .state_machine(),
        }
    }

    pub fn advance(&mut self, event: PhaseEvent) {
        self.machine.handle(&event);
    }

    pub fn state(&self) -> &State {
        self.machine.state()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state(), State::Done {})
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_walks_every_phase() {
        let mut phases = PhaseTracker::new("default/testvmi");
        assert_eq!(phases.state(), &State::Idle {});

        let expected = [
            (PhaseEvent::Resolve, State::Resolving {}),
            (PhaseEvent::Dial, State::Dialing {}),
            (PhaseEvent::Upgrade, State::Upgrading {}),
            (PhaseEvent::Relay, State::Relaying {}),
            (PhaseEvent::Cancel, State::Cancelling {}),
            (PhaseEvent::Finish, State::Done {}),
        ];
        for (event, state) in expected {
            phases.advance(event);
            assert_eq!(phases.state(), &state);
        }
        assert!(phases.is_done());
    }

    #[test]
    fn failures_before_relaying_end_the_tunnel() {
        for steps in [
            &[PhaseEvent::Resolve][..],
            &[PhaseEvent::Resolve, PhaseEvent::Dial],
            &[PhaseEvent::Resolve, PhaseEvent::Dial, PhaseEvent::Upgrade],
        ] {
            let mut phases = PhaseTracker::new("default/testvmi");
            for step in steps {
                phases.advance(*step);
            }
            phases.advance(PhaseEvent::Fail);
            assert!(phases.is_done(), "Fail after {steps:?} should reach Done");
        }
    }

    #[test]
    fn relaying_ignores_failure_events() {
        let mut phases = PhaseTracker::new("default/testvmi");
        for event in [
            PhaseEvent::Resolve,
            PhaseEvent::Dial,
            PhaseEvent::Upgrade,
            PhaseEvent::Relay,
            PhaseEvent::Fail,
        ] {
            phases.advance(event);
        }
        assert_eq!(phases.state(), &State::Relaying {});
    }

    #[test]
    fn done_is_terminal() {
        let mut phases = PhaseTracker::new("default/testvmi");
        phases.advance(PhaseEvent::Resolve);
        phases.advance(PhaseEvent::Fail);
        phases.advance(PhaseEvent::Resolve);
        assert!(phases.is_done());
    }
}
