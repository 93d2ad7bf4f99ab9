//! Shared machinery for the send and receive state machines.
//!
//! Each machine is a state enum with a pure transition function plus an
//! action per state. The action touches the wire and reports an [`Event`];
//! the transition function alone decides where that event leads, so the
//! tables can be tested without any I/O.

use log::trace;

/// Outcome of a state action.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    /// The step succeeded.
    Pass,
    /// The peer is busy (NAK in place of ACK, or nothing to receive).
    Busy,
    /// The peer is sending at the same time (ENQ in place of ACK).
    Wait,
    /// Unexpected byte, bad length, bad checksum or timeout.
    Deny,
    /// Device fault or retry ceiling reached.
    Fail,
    /// The current frame is done and another frame of the same message follows.
    Continue,
}

pub trait StateMachine {
    type State: Copy + PartialEq + core::fmt::Debug;

    /// Used as a prefix in trace output.
    const NAME: &'static str;
    const INITIAL: Self::State;
    /// Its action runs once, then the machine stops.
    const FINAL: Self::State;

    /// Runs the action for `state`.
    fn step(&mut self, state: Self::State) -> Event;

    fn transition(state: Self::State, event: Event) -> Self::State;

    fn run(&mut self) {
        let mut state = Self::INITIAL;
        loop {
            let event = self.step(state);
            if state == Self::FINAL {
                break;
            }
            let next = Self::transition(state, event);
            trace!("{}: {:?} --{:?}--> {:?}", Self::NAME, state, event, next);
            state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    enum Light {
        Red,
        Green,
        Off,
    }

    struct Counter {
        visited: Vec<Light>,
        events: Vec<Event>,
    }

    impl StateMachine for Counter {
        type State = Light;
        const NAME: &'static str = "test";
        const INITIAL: Light = Light::Red;
        const FINAL: Light = Light::Off;

        fn step(&mut self, state: Light) -> Event {
            self.visited.push(state);
            self.events.pop().unwrap_or(Event::Fail)
        }

        fn transition(state: Light, event: Event) -> Light {
            match (state, event) {
                (Light::Red, Event::Pass) => Light::Green,
                (Light::Green, Event::Pass) => Light::Red,
                _ => Light::Off,
            }
        }
    }

    #[test]
    fn final_action_runs_once() {
        // Popped from the back.
        let mut machine = Counter {
            visited: Vec::new(),
            events: vec![Event::Deny, Event::Pass, Event::Pass, Event::Pass],
        };
        machine.run();
        assert_eq!(
            machine.visited,
            vec![Light::Red, Light::Green, Light::Red, Light::Green, Light::Off]
        );
        assert!(machine.events.is_empty());
    }
}
