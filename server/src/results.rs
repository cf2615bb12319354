use dashmap::DashMap;
use std::{cmp::Ordering, collections::HashMap, sync::Arc};
use tracing::{debug, info, warn};
use typerace_shared::{
    types::{Difficulty, RaceId, RaceResult, RaceResultSet, RaceStatus, RoomCode, UserId},
    wpm::wpm,
};

use crate::{
    current_timestamp,
    error::RoomError,
    store::{commit_with_retry, ResultStore},
    tracker::MAX_PLAUSIBLE_WPM,
};

/// What the adjudicator needs to know about a race to judge submissions.
#[derive(Clone, Debug)]
pub struct RaceMeta {
    pub passage_id: String,
    pub passage_chars: usize,
    pub difficulty: Difficulty,
    pub duration: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubmitOutcome {
    Accepted,
    /// The participant already has a result; the new one is ignored.
    Duplicate,
    /// The race was already committed; the committed set is returned unchanged.
    Stale(Arc<RaceResultSet>),
}

#[derive(Debug)]
struct RaceEntry {
    room_code: RoomCode,
    meta: RaceMeta,
    /// Participants in join order; ties in ranking fall back to this order.
    participants: Vec<(UserId, String)>,
    submissions: HashMap<UserId, RaceResult>,
    committed: Option<Arc<RaceResultSet>>,
}

/// Collects per-player outcomes and commits one ranked result set per race.
pub struct ResultsAdjudicator {
    races: DashMap<RaceId, RaceEntry>,
    latest: DashMap<RoomCode, RaceId>,
    store: Arc<dyn ResultStore>,
    commit_retries: u32,
}

impl ResultsAdjudicator {
    pub fn new(store: Arc<dyn ResultStore>, commit_retries: u32) -> Self {
        Self {
            races: DashMap::new(),
            latest: DashMap::new(),
            store,
            commit_retries,
        }
    }

    pub fn open(
        &self,
        room_code: &RoomCode,
        race_id: &str,
        participants: Vec<(UserId, String)>,
        meta: RaceMeta,
    ) {
        debug!(room = %room_code, race_id, players = participants.len(), "race opened");
        self.races.insert(
            race_id.to_string(),
            RaceEntry {
                room_code: room_code.clone(),
                meta,
                participants,
                submissions: HashMap::new(),
                committed: None,
            },
        );
        // Only the newest race of a room is kept; older committed sets are in the store.
        if let Some(previous) = self.latest.insert(room_code.clone(), race_id.to_string()) {
            if previous != race_id {
                self.races.remove(&previous);
            }
        }
    }

    /// Records one result. Results from trusted sources (the server's own
    /// trackers) skip plausibility checks; client figures never do.
    pub fn submit(
        &self,
        room_code: &RoomCode,
        race_id: &str,
        mut result: RaceResult,
        trusted: bool,
    ) -> Result<SubmitOutcome, RoomError> {
        let mut entry = self
            .races
            .get_mut(race_id)
            .filter(|e| &e.room_code == room_code)
            .ok_or_else(|| RoomError::NotFound(format!("{room_code}/{race_id}")))?;

        if let Some(set) = &entry.committed {
            debug!(room = %room_code, race_id, user = %result.user_id, "stale submission ignored");
            return Ok(SubmitOutcome::Stale(set.clone()));
        }

        let Some((_, username)) = entry
            .participants
            .iter()
            .find(|(id, _)| *id == result.user_id)
            .cloned()
        else {
            return Err(RoomError::NotMember);
        };

        if !trusted {
            validate(&entry.meta, &result)?;
        }
        if entry.submissions.contains_key(&result.user_id) {
            return Ok(SubmitOutcome::Duplicate);
        }

        result.rank = 0;
        result.username = username;
        if result.status == RaceStatus::Dnf {
            result.time = entry.meta.duration as f64;
        }
        entry.submissions.insert(result.user_id.clone(), result);
        Ok(SubmitOutcome::Accepted)
    }

    /// Users with a recorded result for the race.
    pub fn submitted(&self, race_id: &str) -> Vec<UserId> {
        self.races
            .get(race_id)
            .map(|e| e.submissions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Ranks and commits the race exactly once. Participants without a result
    /// are recorded as DNF. Later calls return the committed set untouched.
    pub fn finalize(
        &self,
        room_code: &RoomCode,
        race_id: &str,
    ) -> Result<Arc<RaceResultSet>, RoomError> {
        let mut entry = self
            .races
            .get_mut(race_id)
            .filter(|e| &e.room_code == room_code)
            .ok_or_else(|| RoomError::NotFound(format!("{room_code}/{race_id}")))?;

        if let Some(set) = &entry.committed {
            return Ok(set.clone());
        }

        let mut results: Vec<RaceResult> = entry
            .participants
            .iter()
            .map(|(id, name)| {
                entry.submissions.get(id).cloned().unwrap_or_else(|| {
                    RaceResult::dnf(id.clone(), name.clone(), entry.meta.duration)
                })
            })
            .collect();
        rank_results(&mut results);

        let set = Arc::new(RaceResultSet {
            race_id: race_id.to_string(),
            room_code: room_code.clone(),
            passage_id: entry.meta.passage_id.clone(),
            difficulty: entry.meta.difficulty,
            duration: entry.meta.duration,
            results,
            committed_at_ms: current_timestamp(),
        });
        entry.committed = Some(set.clone());
        drop(entry);

        info!(room = %room_code, race_id, players = set.results.len(), "race results finalized");
        self.persist(set.clone());
        Ok(set)
    }

    /// Most recent committed result set for a room.
    pub fn latest(&self, room_code: &RoomCode) -> Option<Arc<RaceResultSet>> {
        let race_id = self.latest.get(room_code)?.value().clone();
        self.races.get(&race_id)?.committed.clone()
    }

    /// Most recently opened race for a room, committed or not.
    pub fn current_race(&self, room_code: &RoomCode) -> Option<RaceId> {
        self.latest.get(room_code).map(|r| r.value().clone())
    }

    /// Drops in-memory state of an evicted room. Committed sets live on in the store.
    pub fn forget_room(&self, room_code: &RoomCode) {
        self.races.retain(|_, e| &e.room_code != room_code);
        self.latest.remove(room_code);
    }

    fn persist(&self, set: Arc<RaceResultSet>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(commit_with_retry(self.store.clone(), set, self.commit_retries));
            }
            Err(_) => warn!(race_id = %set.race_id, "no runtime available; results not persisted"),
        }
    }
}

/// Finishers before DNFs, then higher WPM, then shorter time. Remaining ties
/// keep the incoming (join) order. Ranks are assigned 1..=N.
pub fn rank_results(results: &mut [RaceResult]) {
    results.sort_by(|a, b| {
        let dnf = |r: &RaceResult| r.status == RaceStatus::Dnf;
        dnf(a)
            .cmp(&dnf(b))
            .then_with(|| b.wpm.cmp(&a.wpm))
            .then_with(|| a.time.partial_cmp(&b.time).unwrap_or(Ordering::Equal))
    });
    for (i, result) in results.iter_mut().enumerate() {
        result.rank = i as u32 + 1;
    }
}

fn validate(meta: &RaceMeta, result: &RaceResult) -> Result<(), RoomError> {
    let implausible = |why: String| Err(RoomError::ImplausibleResult(why));

    if !result.accuracy.is_finite() || !(0.0..=100.0).contains(&result.accuracy) {
        return implausible(format!("accuracy {} out of range", result.accuracy));
    }
    if !result.time.is_finite() || result.time <= 0.0 || result.time > meta.duration as f64 {
        return implausible(format!("time {}s outside race duration", result.time));
    }
    if result.wpm > MAX_PLAUSIBLE_WPM {
        return implausible(format!("{} wpm exceeds {MAX_PLAUSIBLE_WPM}", result.wpm));
    }
    // Cannot type more correct characters than the passage holds.
    let ceiling = wpm(meta.passage_chars, result.time) + 1;
    if result.wpm > ceiling {
        return implausible(format!(
            "{} wpm impossible for {} chars in {}s",
            result.wpm, meta.passage_chars, result.time
        ));
    }
    Ok(())
}
