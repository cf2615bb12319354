use rust_fsm::*;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomStatus {
    #[default]
    Waiting,
    Countdown,
    InProgress,
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoomEvent {
    /// Host started with every member ready.
    Start,
    CountdownElapsed,
    /// The room emptied during the countdown.
    Abort,
    AllFinished,
    TimeExpired,
    /// Host reopened a finished room.
    Reset,
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoomStatus::Waiting => "WAITING",
            RoomStatus::Countdown => "COUNTDOWN",
            RoomStatus::InProgress => "IN_PROGRESS",
            RoomStatus::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

impl fmt::Display for RoomEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Transition table for a room's race lifecycle.
pub struct RoomMachine;

impl StateMachineImpl for RoomMachine {
    type Input = RoomEvent;
    type State = RoomStatus;
    type Output = ();
    const INITIAL_STATE: Self::State = RoomStatus::Waiting;

    fn transition(state: &Self::State, input: &Self::Input) -> Option<Self::State> {
        match (state, input) {
            (RoomStatus::Waiting, RoomEvent::Start) => Some(RoomStatus::Countdown),
            (RoomStatus::Countdown, RoomEvent::CountdownElapsed) => Some(RoomStatus::InProgress),
            (RoomStatus::Countdown, RoomEvent::Abort) => Some(RoomStatus::Waiting),
            (RoomStatus::InProgress, RoomEvent::AllFinished) => Some(RoomStatus::Finished),
            (RoomStatus::InProgress, RoomEvent::TimeExpired) => Some(RoomStatus::Finished),
            (RoomStatus::Finished, RoomEvent::Reset) => Some(RoomStatus::Waiting),
            _ => None,
        }
    }

    fn output(_state: &Self::State, _input: &Self::Input) -> Option<Self::Output> {
        None
    }
}
