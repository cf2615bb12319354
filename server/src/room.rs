use rust_fsm::StateMachineImpl;
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};
use typerace_shared::{
    fsm::{RoomEvent, RoomMachine, RoomStatus},
    passages::Passage,
    protocol::{Envelope, Keystroke, ServerMsg},
    types::{
        PlayerView, RaceId, RaceResult, RoomCode, RoomSettings, RoomView, UserId,
        COUNTDOWN_TICKS, MAX_PLAYERS,
    },
};
use uuid::Uuid;

use crate::{
    broadcast::{ProgressThrottle, RaceBroadcaster},
    config::RaceTiming,
    current_timestamp,
    error::RoomError,
    passages::PassageProvider,
    results::{RaceMeta, ResultsAdjudicator, SubmitOutcome},
    tracker::{KeyOutcome, ProgressSnapshot, TypingProgressTracker},
};

/// Identifies one socket; a user who reconnects gets a new one.
pub type ConnectionId = Uuid;

/// Collaborators shared by every room.
#[derive(Clone)]
pub struct RoomContext {
    pub passages: Arc<dyn PassageProvider>,
    pub adjudicator: Arc<ResultsAdjudicator>,
    pub timing: RaceTiming,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct UserRef {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug)]
struct Member {
    user_id: UserId,
    username: String,
    ready: bool,
    connection: Option<ConnectionId>,
    progress: u8,
    wpm: u32,
}

impl Member {
    fn view(&self, is_host: bool) -> PlayerView {
        PlayerView {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            ready: self.ready,
            progress: self.progress,
            wpm: self.wpm,
            is_host,
        }
    }
}

#[derive(Debug)]
struct Countdown {
    started_at: Instant,
    ticks_sent: u32,
}

#[derive(Debug)]
struct Race {
    id: RaceId,
    passage: Passage,
    started_at_ms: u64,
    deadline: Instant,
    trackers: HashMap<UserId, TypingProgressTracker>,
}

struct RoomInner {
    status: RoomStatus,
    settings: RoomSettings,
    /// Join order; the first member is the host.
    members: Vec<Member>,
    /// Members at the moment the host started. Only they may rejoin mid-race.
    roster: Vec<(UserId, String)>,
    countdown: Option<Countdown>,
    /// Chosen at start, revealed when the countdown ends.
    pending_passage: Option<Passage>,
    race: Option<Race>,
    throttle: ProgressThrottle,
    empty_since: Option<Instant>,
}

/// One race room. Every mutation goes through `inner`, so capacity checks,
/// readiness checks and race completion never interleave within a room.
pub struct Room {
    code: RoomCode,
    created_at_ms: u64,
    ctx: RoomContext,
    broadcaster: RaceBroadcaster,
    closed: AtomicBool,
    inner: Mutex<RoomInner>,
}

impl Room {
    pub fn new(code: RoomCode, ctx: RoomContext, settings: RoomSettings, now: Instant) -> Self {
        let throttle = ProgressThrottle::new(ctx.timing.progress_interval);
        Self {
            broadcaster: RaceBroadcaster::new(code.clone()),
            code,
            created_at_ms: current_timestamp(),
            ctx,
            closed: AtomicBool::new(false),
            inner: Mutex::new(RoomInner {
                status: RoomStatus::Waiting,
                settings,
                members: Vec::new(),
                roster: Vec::new(),
                countdown: None,
                pending_passage: None,
                race: None,
                throttle,
                empty_since: Some(now),
            }),
        }
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.broadcaster.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn view(&self) -> RoomView {
        let inner = self.inner.lock().await;
        self.view_locked(&inner)
    }

    pub async fn join(
        &self,
        user: UserRef,
        connection: Option<ConnectionId>,
    ) -> Result<RoomView, RoomError> {
        let mut inner = self.inner.lock().await;
        if self.is_closed() {
            return Err(RoomError::NotFound(self.code.to_string()));
        }

        if let Some(member) = inner.members.iter_mut().find(|m| m.user_id == user.user_id) {
            if connection.is_some() {
                member.connection = connection;
            }
            debug!(room = %self.code, user = %user.user_id, "member reattached");
            return Ok(self.view_locked(&inner));
        }

        let rejoining = inner.roster.iter().any(|(id, _)| *id == user.user_id);
        match inner.status {
            RoomStatus::Waiting => {}
            RoomStatus::Countdown | RoomStatus::InProgress | RoomStatus::Finished if rejoining => {}
            _ => return Err(RoomError::RoomInProgress),
        }
        if inner.members.len() >= MAX_PLAYERS {
            return Err(RoomError::RoomFull);
        }

        let mut member = Member {
            user_id: user.user_id.clone(),
            username: user.username,
            ready: false,
            connection,
            progress: 0,
            wpm: 0,
        };
        if let Some(tracker) = inner
            .race
            .as_ref()
            .and_then(|race| race.trackers.get(&user.user_id))
        {
            let snapshot = tracker.snapshot(Instant::now());
            member.progress = snapshot.progress;
            member.wpm = snapshot.wpm;
        }

        let is_host = inner.members.is_empty();
        self.broadcaster.publish(ServerMsg::PlayerJoined {
            player: member.view(is_host),
        });
        inner.members.push(member);
        inner.empty_since = None;

        info!(
            room = %self.code,
            user = %user.user_id,
            players = inner.members.len(),
            rejoining,
            "player joined"
        );
        Ok(self.view_locked(&inner))
    }

    /// Removes a member. When `connection` is given and no longer matches the
    /// member's current socket, the call is a stale disconnect and is ignored.
    /// Returns whether the member was removed.
    pub async fn leave(
        &self,
        user_id: &str,
        connection: Option<ConnectionId>,
        now: Instant,
    ) -> Result<bool, RoomError> {
        let mut inner = self.inner.lock().await;
        let index = inner
            .members
            .iter()
            .position(|m| m.user_id == user_id)
            .ok_or(RoomError::NotMember)?;

        if let (Some(conn), Some(current)) = (connection, inner.members[index].connection) {
            if conn != current {
                debug!(room = %self.code, user = user_id, "ignoring disconnect of replaced connection");
                return Ok(false);
            }
        }

        inner.members.remove(index);
        inner.throttle.forget(user_id);
        self.broadcaster.publish(ServerMsg::PlayerLeft {
            user_id: user_id.to_string(),
        });
        if index == 0 {
            if let Some(host) = inner.members.first() {
                info!(room = %self.code, host = %host.user_id, "host reassigned");
                self.broadcaster.publish(ServerMsg::HostChanged {
                    user_id: host.user_id.clone(),
                });
            }
        }
        if inner.members.is_empty() {
            inner.empty_since = Some(now);
        }

        info!(room = %self.code, user = user_id, players = inner.members.len(), "player left");

        let status = inner.status;
        match status {
            RoomStatus::Countdown if inner.members.is_empty() => self.abort_countdown(&mut inner),
            RoomStatus::InProgress => self.check_completion(&mut inner),
            _ => {}
        }
        Ok(true)
    }

    pub async fn set_ready(&self, user_id: &str, ready: bool) -> Result<RoomView, RoomError> {
        let mut inner = self.inner.lock().await;
        let status = inner.status;
        let member = inner
            .members
            .iter_mut()
            .find(|m| m.user_id == user_id)
            .ok_or(RoomError::NotMember)?;
        if status != RoomStatus::Waiting {
            return Err(RoomError::RoomInProgress);
        }

        if member.ready != ready {
            member.ready = ready;
            self.broadcaster.publish(ServerMsg::ReadyChanged {
                user_id: user_id.to_string(),
                ready,
            });
        }
        Ok(self.view_locked(&inner))
    }

    pub async fn update_settings(
        &self,
        user_id: &str,
        settings: RoomSettings,
    ) -> Result<RoomView, RoomError> {
        let mut inner = self.inner.lock().await;
        require_host(&inner, user_id)?;
        if inner.status != RoomStatus::Waiting {
            return Err(RoomError::RoomInProgress);
        }
        settings.validate().map_err(RoomError::InvalidSettings)?;

        if inner.settings != settings {
            inner.settings = settings.clone();
            self.broadcaster
                .publish(ServerMsg::SettingsChanged { settings });
        }
        Ok(self.view_locked(&inner))
    }

    /// Host action: WAITING → COUNTDOWN. The passage is picked now but stays
    /// hidden until the countdown ends.
    pub async fn start(&self, user_id: &str, now: Instant) -> Result<RoomView, RoomError> {
        let mut inner = self.inner.lock().await;
        require_host(&inner, user_id)?;
        if inner.status != RoomStatus::Waiting {
            warn!(room = %self.code, state = %inner.status, "start rejected");
            return Err(RoomError::InvalidTransition {
                from: inner.status,
                event: RoomEvent::Start,
            });
        }
        if inner.members.is_empty() || !inner.members.iter().all(|m| m.ready) {
            return Err(RoomError::NotReady);
        }

        let difficulty = inner.settings.difficulty;
        let category = inner.settings.category_filter().map(str::to_owned);
        let passage = self
            .ctx
            .passages
            .passage(difficulty, category.as_deref())
            .await;

        self.apply(&mut inner, RoomEvent::Start)?;
        inner.roster = inner
            .members
            .iter()
            .map(|m| (m.user_id.clone(), m.username.clone()))
            .collect();
        inner.pending_passage = Some(passage);
        inner.countdown = Some(Countdown {
            started_at: now,
            ticks_sent: 1,
        });
        self.broadcaster.publish(ServerMsg::CountdownTick {
            remaining: COUNTDOWN_TICKS,
        });

        info!(room = %self.code, players = inner.roster.len(), "countdown started");
        Ok(self.view_locked(&inner))
    }

    /// Advances server-side timers: countdown ticks, timeline samples,
    /// coalesced progress and the race deadline.
    pub async fn tick(&self, now: Instant) {
        let mut inner = self.inner.lock().await;
        let status = inner.status;
        match status {
            RoomStatus::Countdown => self.advance_countdown(&mut inner, now),
            RoomStatus::InProgress => {
                if let Some(race) = inner.race.as_mut() {
                    for tracker in race.trackers.values_mut() {
                        tracker.sample(now);
                    }
                }
                for update in inner.throttle.flush_due(now) {
                    self.broadcaster.publish(update);
                }
                let expired = inner.race.as_ref().map_or(false, |r| now >= r.deadline);
                if expired {
                    self.finish_race(&mut inner, RoomEvent::TimeExpired);
                }
            }
            _ => {}
        }
    }

    pub async fn keystroke(
        &self,
        user_id: &str,
        key: Keystroke,
        now: Instant,
    ) -> Result<(), RoomError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.status != RoomStatus::InProgress {
            return Err(RoomError::InvalidKeystroke(format!(
                "no race running (room is {})",
                inner.status
            )));
        }
        if !inner.members.iter().any(|m| m.user_id == user_id) {
            return Err(RoomError::NotMember);
        }
        let Some(race) = inner.race.as_mut() else {
            return Err(RoomError::InvalidKeystroke("no race running".into()));
        };
        let race_id = race.id.clone();
        let tracker = race.trackers.get_mut(user_id).ok_or(RoomError::NotMember)?;

        let outcome = tracker.apply(key, now)?;
        if tracker.is_suspicious(now) {
            warn!(room = %self.code, user = user_id, "Suspicious typing speed");
        }
        let snapshot = tracker.snapshot(now);

        if let Some(member) = inner.members.iter_mut().find(|m| m.user_id == user_id) {
            member.progress = snapshot.progress;
            member.wpm = snapshot.wpm;
        }
        let update = progress_msg(user_id, &snapshot);

        match outcome {
            KeyOutcome::Progress(_) => {
                if let Some(update) = inner.throttle.offer(user_id, update, now) {
                    self.broadcaster.publish(update);
                }
            }
            KeyOutcome::Finished(result) => {
                inner.throttle.settle(user_id);
                self.broadcaster.publish(update);
                info!(room = %self.code, user = user_id, wpm = result.wpm, "player finished");
                self.record(&race_id, result.clone());
                self.broadcaster
                    .publish(ServerMsg::PlayerFinished { result });
                self.check_completion(inner);
            }
        }
        Ok(())
    }

    /// Client-reported result. Players whose keystrokes the server tracked
    /// keep the server's figures.
    pub async fn submit_result(
        &self,
        race_id: Option<RaceId>,
        result: RaceResult,
    ) -> Result<SubmitOutcome, RoomError> {
        let mut inner = self.inner.lock().await;
        let race_id = race_id
            .or_else(|| inner.race.as_ref().map(|r| r.id.clone()))
            .or_else(|| self.ctx.adjudicator.current_race(&self.code))
            .ok_or_else(|| RoomError::NotFound(format!("no race in room {}", self.code)))?;

        let live_race = inner
            .race
            .as_ref()
            .filter(|r| inner.status == RoomStatus::InProgress && r.id == race_id);
        let live = live_race.is_some();
        if let Some(tracker) = live_race.and_then(|r| r.trackers.get(&result.user_id)) {
            if tracker.has_input() {
                debug!(room = %self.code, user = %result.user_id, "keeping server-tracked result");
                return Ok(SubmitOutcome::Duplicate);
            }
        }

        let announced = result.clone();
        let outcome = self
            .ctx
            .adjudicator
            .submit(&self.code, &race_id, result, false)?;
        if live && outcome == SubmitOutcome::Accepted {
            self.broadcaster.publish(ServerMsg::PlayerFinished {
                result: RaceResult { rank: 0, ..announced },
            });
            self.check_completion(&mut inner);
        }
        Ok(outcome)
    }

    /// Host action: FINISHED → WAITING with the same members, all unready.
    pub async fn reset(&self, user_id: &str) -> Result<RoomView, RoomError> {
        let mut inner = self.inner.lock().await;
        require_host(&inner, user_id)?;
        self.apply(&mut inner, RoomEvent::Reset)?;

        inner.race = None;
        inner.roster.clear();
        inner.pending_passage = None;
        inner.countdown = None;
        inner.throttle.clear();
        for member in &mut inner.members {
            member.ready = false;
            member.progress = 0;
            member.wpm = 0;
        }

        let view = self.view_locked(&inner);
        self.broadcaster
            .publish(ServerMsg::RoomState { room: view.clone() });
        info!(room = %self.code, "room reset");
        Ok(view)
    }

    /// Messages that bring a (re)joining participant up to date with a race
    /// already under way or just finished.
    pub async fn resume_messages(&self, user_id: &str, now: Instant) -> Vec<ServerMsg> {
        let inner = self.inner.lock().await;
        let Some(race) = inner.race.as_ref() else {
            return Vec::new();
        };
        match inner.status {
            RoomStatus::InProgress => {
                let mut messages = vec![ServerMsg::RaceStart {
                    race_id: race.id.clone(),
                    passage: race.passage.clone(),
                    duration: inner.settings.duration,
                    started_at_ms: race.started_at_ms,
                }];
                if let Some(tracker) = race.trackers.get(user_id) {
                    messages.push(progress_msg(user_id, &tracker.snapshot(now)));
                }
                messages
            }
            RoomStatus::Finished => self
                .ctx
                .adjudicator
                .latest(&self.code)
                .map(|set| {
                    vec![ServerMsg::RaceFinished {
                        results: (*set).clone(),
                    }]
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Marks the room closed when it has been empty for the grace period.
    /// A closed room refuses joins and is dropped by the registry.
    pub async fn close_if_idle(&self, now: Instant) -> bool {
        let inner = self.inner.lock().await;
        let idle = inner.members.is_empty()
            && inner.empty_since.map_or(false, |since| {
                now.saturating_duration_since(since) >= self.ctx.timing.eviction_grace
            });
        if idle {
            self.closed.store(true, Ordering::SeqCst);
        }
        idle
    }

    fn apply(&self, inner: &mut RoomInner, event: RoomEvent) -> Result<(), RoomError> {
        match RoomMachine::transition(&inner.status, &event) {
            Some(next) => {
                info!(room = %self.code, from = %inner.status, to = %next, "state transition");
                inner.status = next;
                self.broadcaster
                    .publish(ServerMsg::StatusChanged { status: next });
                Ok(())
            }
            None => {
                warn!(room = %self.code, state = %inner.status, %event, "rejected invalid transition");
                Err(RoomError::InvalidTransition {
                    from: inner.status,
                    event,
                })
            }
        }
    }

    fn advance_countdown(&self, inner: &mut RoomInner, now: Instant) {
        let tick = self.ctx.timing.countdown_tick.max(Duration::from_millis(1));
        let Some(countdown) = inner.countdown.as_mut() else {
            return;
        };
        let elapsed_ticks =
            (now.saturating_duration_since(countdown.started_at).as_nanos() / tick.as_nanos()) as u32;

        while countdown.ticks_sent < COUNTDOWN_TICKS && countdown.ticks_sent <= elapsed_ticks {
            self.broadcaster.publish(ServerMsg::CountdownTick {
                remaining: COUNTDOWN_TICKS - countdown.ticks_sent,
            });
            countdown.ticks_sent += 1;
        }
        if elapsed_ticks >= COUNTDOWN_TICKS {
            self.begin_race(inner, now);
        }
    }

    fn begin_race(&self, inner: &mut RoomInner, now: Instant) {
        let Some(passage) = inner.pending_passage.take() else {
            error!(room = %self.code, "countdown ended without a passage");
            return;
        };
        if self.apply(inner, RoomEvent::CountdownElapsed).is_err() {
            return;
        }
        inner.countdown = None;
        inner.throttle.clear();
        for member in &mut inner.members {
            member.progress = 0;
            member.wpm = 0;
        }

        let race_id = Uuid::new_v4().to_string();
        let duration = inner.settings.duration;
        let trackers = inner
            .roster
            .iter()
            .map(|(id, name)| {
                (
                    id.clone(),
                    TypingProgressTracker::new(id.clone(), name.clone(), &passage, now),
                )
            })
            .collect();

        self.ctx.adjudicator.open(
            &self.code,
            &race_id,
            inner.roster.clone(),
            RaceMeta {
                passage_id: passage.id.clone(),
                passage_chars: passage.char_count,
                difficulty: inner.settings.difficulty,
                duration,
            },
        );

        let started_at_ms = current_timestamp();
        self.broadcaster.publish(ServerMsg::RaceStart {
            race_id: race_id.clone(),
            passage: passage.clone(),
            duration,
            started_at_ms,
        });
        info!(room = %self.code, race_id = %race_id, passage_id = %passage.id, "race started");

        inner.race = Some(Race {
            id: race_id,
            passage,
            started_at_ms,
            deadline: now + Duration::from_secs(duration as u64),
            trackers,
        });
    }

    fn abort_countdown(&self, inner: &mut RoomInner) {
        if self.apply(inner, RoomEvent::Abort).is_err() {
            return;
        }
        inner.countdown = None;
        inner.pending_passage = None;
        inner.roster.clear();
        for member in &mut inner.members {
            member.ready = false;
        }
        info!(room = %self.code, "countdown aborted");
    }

    /// Ends the race once every participant still present is done. A race
    /// nobody is left in ends immediately.
    fn check_completion(&self, inner: &mut RoomInner) {
        if inner.status != RoomStatus::InProgress {
            return;
        }
        let Some(race) = inner.race.as_ref() else {
            return;
        };
        let submitted = self.ctx.adjudicator.submitted(&race.id);
        let done = inner
            .roster
            .iter()
            .filter(|(id, _)| inner.members.iter().any(|m| m.user_id == *id))
            .all(|(id, _)| {
                race.trackers.get(id).map_or(false, |t| t.is_finished()) || submitted.contains(id)
            });
        if done {
            self.finish_race(inner, RoomEvent::AllFinished);
        }
    }

    fn finish_race(&self, inner: &mut RoomInner, event: RoomEvent) {
        if self.apply(inner, event).is_err() {
            return;
        }
        let duration = Duration::from_secs(inner.settings.duration as u64);
        let Some(race) = inner.race.as_mut() else {
            return;
        };
        let race_id = race.id.clone();
        let unfinished: Vec<RaceResult> = race
            .trackers
            .values_mut()
            .filter(|t| !t.is_finished())
            .map(|t| t.time_out(duration))
            .collect();
        for result in unfinished {
            self.record(&race_id, result);
        }
        inner.throttle.clear();

        match self.ctx.adjudicator.finalize(&self.code, &race_id) {
            Ok(set) => {
                self.broadcaster.publish(ServerMsg::RaceFinished {
                    results: (*set).clone(),
                });
            }
            Err(e) => error!(room = %self.code, race_id = %race_id, "finalize failed: {e}"),
        }
    }

    fn record(&self, race_id: &str, result: RaceResult) {
        let user = result.user_id.clone();
        match self.ctx.adjudicator.submit(&self.code, race_id, result, true) {
            Ok(outcome) => debug!(room = %self.code, user = %user, ?outcome, "result recorded"),
            Err(e) => warn!(room = %self.code, user = %user, "result not recorded: {e}"),
        }
    }

    fn view_locked(&self, inner: &RoomInner) -> RoomView {
        RoomView {
            code: self.code.clone(),
            status: inner.status,
            settings: inner.settings.clone(),
            players: inner
                .members
                .iter()
                .enumerate()
                .map(|(i, m)| m.view(i == 0))
                .collect(),
            host_id: inner.members.first().map(|m| m.user_id.clone()),
            passage: inner.race.as_ref().map(|r| r.passage.clone()),
            race_id: inner.race.as_ref().map(|r| r.id.clone()),
            created_at_ms: self.created_at_ms,
            seq: self.broadcaster.last_seq(),
        }
    }
}

fn require_host(inner: &RoomInner, user_id: &str) -> Result<(), RoomError> {
    if !inner.members.iter().any(|m| m.user_id == user_id) {
        return Err(RoomError::NotMember);
    }
    match inner.members.first() {
        Some(host) if host.user_id == user_id => Ok(()),
        _ => Err(RoomError::NotHost),
    }
}

fn progress_msg(user_id: &str, snapshot: &ProgressSnapshot) -> ServerMsg {
    ServerMsg::Progress {
        user_id: user_id.to_string(),
        index: snapshot.index,
        progress: snapshot.progress,
        wpm: snapshot.wpm,
        accuracy: snapshot.accuracy,
    }
}
