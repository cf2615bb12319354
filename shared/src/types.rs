use serde::{Deserialize, Serialize};
use std::fmt;

use crate::fsm::RoomStatus;
use crate::passages::Passage;

/// Maximum number of members a room admits.
pub const MAX_PLAYERS: usize = 4;

/// Number of countdown ticks between `start` and the race beginning.
pub const COUNTDOWN_TICKS: u32 = 3;

pub const MIN_DURATION_SECS: u32 = 15;
pub const MAX_DURATION_SECS: u32 = 300;

pub const CATEGORIES: &[&str] = &["common", "programming", "literature", "science", "random"];

pub type UserId = String;
/// Race ids travel as opaque strings on the wire.
pub type RaceId = String;

/// Six character alphanumeric room code, normalised to upper case.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    pub const LEN: usize = 6;

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.len() == Self::LEN && raw.chars().all(|c| c.is_ascii_alphanumeric()) {
            Some(Self(raw.to_ascii_uppercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RoomCode::parse(&value).ok_or_else(|| format!("invalid room code `{value}`"))
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "easy" => Some(Difficulty::Easy),
            "medium" => Some(Difficulty::Medium),
            "hard" => Some(Difficulty::Hard),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSettings {
    pub difficulty: Difficulty,
    /// Race length in seconds.
    pub duration: u32,
    pub category: String,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            difficulty: Difficulty::Medium,
            duration: 60,
            category: "common".to_string(),
        }
    }
}

impl RoomSettings {
    /// Returns a description of the first invalid field, if any.
    pub fn validate(&self) -> Result<(), String> {
        if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&self.duration) {
            return Err(format!(
                "duration must be between {MIN_DURATION_SECS} and {MAX_DURATION_SECS} seconds"
            ));
        }
        if !CATEGORIES.contains(&self.category.as_str()) {
            return Err(format!("unknown category `{}`", self.category));
        }
        Ok(())
    }

    /// Category filter for passage selection; `random` matches any category.
    pub fn category_filter(&self) -> Option<&str> {
        match self.category.as_str() {
            "random" => None,
            other => Some(other),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerView {
    pub user_id: UserId,
    pub username: String,
    pub ready: bool,
    /// 0-100
    pub progress: u8,
    pub wpm: u32,
    pub is_host: bool,
}

/// Snapshot of a room as presented to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomView {
    pub code: RoomCode,
    pub status: RoomStatus,
    pub settings: RoomSettings,
    pub players: Vec<PlayerView>,
    pub host_id: Option<UserId>,
    /// Only populated once the race is running.
    pub passage: Option<Passage>,
    pub race_id: Option<RaceId>,
    pub created_at_ms: u64,
    /// Sequence number of the last event broadcast before this snapshot.
    pub seq: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RaceStatus {
    Finished,
    Dnf,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WpmSample {
    /// Whole seconds since race start.
    pub time: u32,
    pub wpm: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaceResult {
    pub user_id: UserId,
    pub username: String,
    pub wpm: u32,
    pub raw_wpm: u32,
    /// Percentage with two decimals.
    pub accuracy: f64,
    pub errors: u32,
    /// Seconds.
    pub time: f64,
    /// Assigned by the server; any client-supplied value is discarded.
    #[serde(default)]
    pub rank: u32,
    #[serde(default)]
    pub wpm_timeline: Vec<WpmSample>,
    /// 0-100; how steady the timeline was.
    #[serde(default)]
    pub consistency: u32,
    pub status: RaceStatus,
}

impl RaceResult {
    pub fn dnf(user_id: UserId, username: String, duration: u32) -> Self {
        Self {
            user_id,
            username,
            wpm: 0,
            raw_wpm: 0,
            accuracy: 100.0,
            errors: 0,
            time: duration as f64,
            rank: 0,
            wpm_timeline: Vec::new(),
            consistency: 100,
            status: RaceStatus::Dnf,
        }
    }
}

/// The ranked, write-once outcome of one race.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaceResultSet {
    pub race_id: RaceId,
    pub room_code: RoomCode,
    pub passage_id: String,
    pub difficulty: Difficulty,
    pub duration: u32,
    pub results: Vec<RaceResult>,
    pub committed_at_ms: u64,
}
