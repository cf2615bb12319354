use tokio::time::{Duration, Instant};
use typerace_shared::{
    passages::Passage,
    protocol::Keystroke,
    types::{RaceResult, RaceStatus, UserId, WpmSample},
    wpm::{accuracy, consistency, gross_wpm, wpm},
};

use crate::error::RoomError;

/// Typing faster than this is treated as suspicious.
pub const MAX_PLAUSIBLE_WPM: u32 = 300;

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressSnapshot {
    pub index: usize,
    /// 0-100
    pub progress: u8,
    pub wpm: u32,
    pub accuracy: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum KeyOutcome {
    Progress(ProgressSnapshot),
    Finished(RaceResult),
}

/// Server-side typing state of one player in one race.
///
/// Timing is relative to the race start, so players who hesitate after the
/// start are measured over the same clock as everyone else. Errors are
/// counted when a character is mistyped and are not refunded by backspace.
#[derive(Debug)]
pub struct TypingProgressTracker {
    user_id: UserId,
    username: String,
    passage: Vec<char>,
    started_at: Instant,
    /// Correctness of every character currently typed, in order.
    typed: Vec<bool>,
    errors: u32,
    keystrokes: usize,
    last_correct_at: Option<Instant>,
    timeline: Vec<WpmSample>,
    result: Option<RaceResult>,
}

impl TypingProgressTracker {
    pub fn new(user_id: UserId, username: String, passage: &Passage, started_at: Instant) -> Self {
        Self {
            user_id,
            username,
            passage: passage.text.chars().collect(),
            started_at,
            typed: Vec::new(),
            errors: 0,
            keystrokes: 0,
            last_correct_at: None,
            timeline: Vec::new(),
            result: None,
        }
    }

    pub fn apply(&mut self, key: Keystroke, now: Instant) -> Result<KeyOutcome, RoomError> {
        if self.result.is_some() {
            return Err(RoomError::InvalidKeystroke("passage already completed".into()));
        }

        match key {
            Keystroke::Backspace => {
                self.typed.pop();
            }
            Keystroke::Char(ch) => {
                if ch.is_control() {
                    return Err(RoomError::InvalidKeystroke(format!(
                        "control character U+{:04X}",
                        ch as u32
                    )));
                }
                let correct = self.passage.get(self.typed.len()) == Some(&ch);
                if correct {
                    self.last_correct_at = Some(now);
                } else {
                    self.errors += 1;
                }
                self.typed.push(correct);
            }
        }
        self.keystrokes += 1;

        if self.typed.len() >= self.passage.len() {
            return Ok(KeyOutcome::Finished(self.finish(now)));
        }
        Ok(KeyOutcome::Progress(self.snapshot(now)))
    }

    pub fn snapshot(&self, now: Instant) -> ProgressSnapshot {
        let seconds = match &self.result {
            Some(result) => result.time,
            None => self.elapsed(now),
        };
        ProgressSnapshot {
            index: self.typed.len(),
            progress: self.progress(),
            wpm: wpm(self.correct(), seconds),
            accuracy: accuracy(self.correct(), self.typed.len()),
        }
    }

    /// Appends one timeline sample for every whole second elapsed so far.
    pub fn sample(&mut self, now: Instant) {
        if self.result.is_some() {
            return;
        }
        let whole_seconds = now.saturating_duration_since(self.started_at).as_secs() as u32;
        let correct = self.correct();
        while (self.timeline.len() as u32) < whole_seconds {
            let time = self.timeline.len() as u32 + 1;
            self.timeline.push(WpmSample {
                time,
                wpm: wpm(correct, time as f64),
            });
        }
    }

    /// Closes the tracker as DNF with the state reached when the race ran out.
    /// A tracker that already finished keeps its result.
    pub fn time_out(&mut self, duration: Duration) -> RaceResult {
        if let Some(result) = &self.result {
            return result.clone();
        }
        self.sample(self.started_at + duration);
        let seconds = duration.as_secs_f64();
        let result = self.build_result(RaceStatus::Dnf, seconds);
        self.result = Some(result.clone());
        result
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_some()
    }

    pub fn has_input(&self) -> bool {
        self.keystrokes > 0
    }

    /// True once the player has been typing for a second at an inhuman rate.
    pub fn is_suspicious(&self, now: Instant) -> bool {
        let seconds = self.elapsed(now);
        seconds > 1.0 && gross_wpm(self.correct(), seconds) > MAX_PLAUSIBLE_WPM as f64
    }

    fn finish(&mut self, now: Instant) -> RaceResult {
        self.sample(now);
        let seconds = self.elapsed(self.last_correct_at.unwrap_or(now));
        let result = self.build_result(RaceStatus::Finished, seconds);
        self.result = Some(result.clone());
        result
    }

    fn build_result(&self, status: RaceStatus, seconds: f64) -> RaceResult {
        RaceResult {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            wpm: wpm(self.correct(), seconds),
            raw_wpm: wpm(self.typed.len(), seconds),
            accuracy: accuracy(self.correct(), self.typed.len()),
            errors: self.errors,
            time: (seconds * 1000.0).round() / 1000.0,
            rank: 0,
            wpm_timeline: self.timeline.clone(),
            consistency: consistency(&self.timeline),
            status,
        }
    }

    fn correct(&self) -> usize {
        self.typed.iter().filter(|c| **c).count()
    }

    fn progress(&self) -> u8 {
        if self.passage.is_empty() {
            return 100;
        }
        ((self.typed.len() * 100) as f64 / self.passage.len() as f64).round() as u8
    }

    fn elapsed(&self, at: Instant) -> f64 {
        at.saturating_duration_since(self.started_at).as_secs_f64()
    }
}
