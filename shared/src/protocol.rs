use serde::{Deserialize, Serialize};

use crate::fsm::RoomStatus;
use crate::passages::Passage;
use crate::types::{
    PlayerView, RaceId, RaceResult, RaceResultSet, RoomCode, RoomSettings, RoomView, UserId,
};

/// A single key press as seen by the typing area.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "ch")]
pub enum Keystroke {
    Char(char),
    Backspace,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum ClientMsg {
    Join {
        room: String,
        user_id: UserId,
        username: String,
    },
    Leave,
    Ready {
        ready: bool,
    },
    SettingsUpdate {
        settings: RoomSettings,
    },
    Start,
    Key {
        key: Keystroke,
    },
    Reset,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    InvalidRoomCode,
    RoomFull,
    RoomInProgress,
    NotHost,
    NotReady,
    NotMember,
    InvalidSettings,
    InvalidTransition,
    InvalidKeystroke,
    ImplausibleResult,
    BadMessage,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum ServerMsg {
    RoomState {
        room: RoomView,
    },
    PlayerJoined {
        player: PlayerView,
    },
    PlayerLeft {
        user_id: UserId,
    },
    HostChanged {
        user_id: UserId,
    },
    ReadyChanged {
        user_id: UserId,
        ready: bool,
    },
    SettingsChanged {
        settings: RoomSettings,
    },
    StatusChanged {
        status: RoomStatus,
    },
    CountdownTick {
        remaining: u32,
    },
    RaceStart {
        race_id: RaceId,
        passage: Passage,
        duration: u32,
        started_at_ms: u64,
    },
    Progress {
        user_id: UserId,
        index: usize,
        progress: u8,
        wpm: u32,
        accuracy: f64,
    },
    PlayerFinished {
        result: RaceResult,
    },
    RaceFinished {
        results: RaceResultSet,
    },
    Rejected {
        code: ErrorCode,
        message: String,
    },
}

/// Room broadcasts carry a per-room sequence number so clients can detect
/// gaps and discard anything older than their last snapshot.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Envelope {
    pub seq: u64,
    pub room: RoomCode,
    pub event: ServerMsg,
}
