use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use rand::{distributions::Alphanumeric, Rng};
use std::sync::Arc;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info};
use typerace_shared::types::{RaceResultSet, RoomCode, RoomSettings, RoomView, UserId};

use crate::{
    error::RoomError,
    room::{ConnectionId, Room, RoomContext, UserRef},
};

/// Attempts to join a code whose room is being evicted underneath us.
const JOIN_ATTEMPTS: usize = 3;

/// Owns every live room. Rooms are only reachable through these methods;
/// all per-room mutation is serialized inside [`Room`].
pub struct RoomRegistry {
    rooms: DashMap<RoomCode, Arc<Room>>,
    /// Room each user currently belongs to.
    memberships: DashMap<UserId, RoomCode>,
    /// Held while a user's join is decided, so one user never lands in two rooms.
    join_locks: DashMap<UserId, Arc<Mutex<()>>>,
    ctx: RoomContext,
}

impl RoomRegistry {
    pub fn new(ctx: RoomContext) -> Self {
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            join_locks: DashMap::new(),
            ctx,
        }
    }

    pub fn context(&self) -> &RoomContext {
        &self.ctx
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn parse_code(raw: &str) -> Result<RoomCode, RoomError> {
        RoomCode::parse(raw).ok_or_else(|| RoomError::InvalidRoomCode(raw.to_string()))
    }

    /// New room under a random unused code.
    pub fn create_room(&self, settings: RoomSettings) -> Result<Arc<Room>, RoomError> {
        settings.validate().map_err(RoomError::InvalidSettings)?;
        loop {
            let Some(code) = RoomCode::parse(&random_code()) else {
                continue;
            };
            if let Entry::Vacant(slot) = self.rooms.entry(code.clone()) {
                let room = Arc::new(Room::new(
                    code.clone(),
                    self.ctx.clone(),
                    settings,
                    Instant::now(),
                ));
                slot.insert(room.clone());
                info!(room = %code, "room created");
                return Ok(room);
            }
        }
    }

    pub fn create_or_get(&self, code: &RoomCode) -> Arc<Room> {
        self.rooms
            .entry(code.clone())
            .or_insert_with(|| {
                info!(room = %code, "room created on first join");
                Arc::new(Room::new(
                    code.clone(),
                    self.ctx.clone(),
                    RoomSettings::default(),
                    Instant::now(),
                ))
            })
            .value()
            .clone()
    }

    pub fn get(&self, code: &RoomCode) -> Result<Arc<Room>, RoomError> {
        self.rooms
            .get(code)
            .map(|r| r.value().clone())
            .filter(|room| !room.is_closed())
            .ok_or_else(|| RoomError::NotFound(code.to_string()))
    }

    /// Joins `code`, creating the room if it does not exist yet. A user who
    /// belongs to another room leaves it once the new room has admitted them;
    /// a rejected join leaves the previous membership untouched.
    pub async fn join(
        &self,
        code: &RoomCode,
        user: UserRef,
        connection: Option<ConnectionId>,
    ) -> Result<(Arc<Room>, RoomView), RoomError> {
        let user_id = user.user_id.clone();
        let lock = self.join_locks.entry(user_id.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            self.join_exclusive(code, user, connection).await
        };
        drop(lock);
        self.join_locks
            .remove_if(&user_id, |_, l| Arc::strong_count(l) == 1);
        result
    }

    async fn join_exclusive(
        &self,
        code: &RoomCode,
        user: UserRef,
        connection: Option<ConnectionId>,
    ) -> Result<(Arc<Room>, RoomView), RoomError> {
        let previous = self
            .memberships
            .get(&user.user_id)
            .map(|r| r.value().clone())
            .filter(|previous| previous != code);

        let (room, view) = self.admit(code, &user, connection).await?;
        if let Some(previous) = previous {
            debug!(user = %user.user_id, from = %previous, to = %code, "switching rooms");
            let _ = self.leave(&previous, &user.user_id, None).await;
        }
        self.memberships.insert(user.user_id, code.clone());
        Ok((room, view))
    }

    async fn admit(
        &self,
        code: &RoomCode,
        user: &UserRef,
        connection: Option<ConnectionId>,
    ) -> Result<(Arc<Room>, RoomView), RoomError> {
        for _ in 0..JOIN_ATTEMPTS {
            let room = self.create_or_get(code);
            match room.join(user.clone(), connection).await {
                Ok(view) => return Ok((room, view)),
                Err(RoomError::NotFound(_)) if room.is_closed() => {
                    self.rooms.remove_if(code, |_, r| Arc::ptr_eq(r, &room));
                }
                Err(e) => return Err(e),
            }
        }
        Err(RoomError::NotFound(code.to_string()))
    }

    /// Removes `user_id` from the room. With a connection id, the leave only
    /// applies while that connection is still the member's current one.
    pub async fn leave(
        &self,
        code: &RoomCode,
        user_id: &str,
        connection: Option<ConnectionId>,
    ) -> Result<bool, RoomError> {
        let room = self.get(code)?;
        let removed = room.leave(user_id, connection, Instant::now()).await?;
        if removed {
            self.memberships.remove_if(user_id, |_, c| c == code);
        }
        Ok(removed)
    }

    pub async fn update_settings(
        &self,
        code: &RoomCode,
        user_id: &str,
        settings: RoomSettings,
    ) -> Result<RoomView, RoomError> {
        self.get(code)?.update_settings(user_id, settings).await
    }

    /// Latest committed results for a room.
    pub fn results(&self, code: &RoomCode) -> Result<Arc<RaceResultSet>, RoomError> {
        self.ctx
            .adjudicator
            .latest(code)
            .ok_or_else(|| RoomError::NotFound(format!("no results for room {code}")))
    }

    /// Drives every room's timers concurrently, then evicts rooms that have
    /// been empty for the grace period.
    pub async fn tick_all(&self, now: Instant) {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|r| r.value().clone()).collect();
        join_all(rooms.iter().map(|room| async move {
            room.tick(now).await;
            if room.close_if_idle(now).await {
                self.evict(room);
            }
        }))
        .await;
    }

    fn evict(&self, room: &Arc<Room>) {
        let code = room.code();
        if self
            .rooms
            .remove_if(code, |_, r| Arc::ptr_eq(r, room))
            .is_some()
        {
            self.memberships.retain(|_, c| *c != *code);
            self.ctx.adjudicator.forget_room(code);
            info!(room = %code, "room evicted");
        }
    }
}

fn random_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RoomCode::LEN)
        .map(char::from)
        .collect()
}
