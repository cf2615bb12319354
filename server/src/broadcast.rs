use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::{
    sync::broadcast,
    time::{Duration, Instant},
};
use tracing::debug;
use typerace_shared::{
    protocol::{Envelope, ServerMsg},
    types::{RoomCode, UserId},
};

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of room events to every connected member.
///
/// Callers publish while holding the room lock, so sequence numbers follow the
/// order in which the room accepted the mutations. Delivery is best-effort: a
/// receiver that falls behind loses the oldest events and sees `Lagged`
/// instead of slowing anyone else down.
#[derive(Debug)]
pub struct RaceBroadcaster {
    room: RoomCode,
    tx: broadcast::Sender<Envelope>,
    seq: AtomicU64,
}

impl RaceBroadcaster {
    pub fn new(room: RoomCode) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            room,
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ServerMsg) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let receivers = self.tx.send(Envelope {
            seq,
            room: self.room.clone(),
            event,
        });
        debug!(room = %self.room, seq, receivers = receivers.unwrap_or(0), "published");
        seq
    }

    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct Slot {
    last_sent: Option<Instant>,
    pending: Option<ServerMsg>,
}

/// Coalesces progress updates so each sender emits at most one per interval.
/// Only the latest pending update survives; completion bypasses the throttle.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    slots: BTreeMap<UserId, Slot>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            slots: BTreeMap::new(),
        }
    }

    /// Returns the update if it may go out now; otherwise holds it back.
    pub fn offer(&mut self, user: &str, update: ServerMsg, now: Instant) -> Option<ServerMsg> {
        let interval = self.interval;
        let slot = self.slots.entry(user.to_string()).or_default();
        let due = slot
            .last_sent
            .map_or(true, |last| now.saturating_duration_since(last) >= interval);
        if due {
            slot.last_sent = Some(now);
            slot.pending = None;
            Some(update)
        } else {
            slot.pending = Some(update);
            None
        }
    }

    /// Held-back updates whose interval has passed.
    pub fn flush_due(&mut self, now: Instant) -> Vec<ServerMsg> {
        let interval = self.interval;
        let mut due = Vec::new();
        for slot in self.slots.values_mut() {
            let ready = slot
                .last_sent
                .map_or(true, |last| now.saturating_duration_since(last) >= interval);
            if ready {
                if let Some(update) = slot.pending.take() {
                    slot.last_sent = Some(now);
                    due.push(update);
                }
            }
        }
        due
    }

    /// Drops anything pending for `user`; used when a final value is sent directly.
    pub fn settle(&mut self, user: &str) {
        if let Some(slot) = self.slots.get_mut(user) {
            slot.pending = None;
        }
    }

    pub fn forget(&mut self, user: &str) {
        self.slots.remove(user);
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(user: &str, index: usize) -> ServerMsg {
        ServerMsg::Progress {
            user_id: user.into(),
            index,
            progress: 0,
            wpm: 0,
            accuracy: 100.0,
        }
    }

    fn index_of(msg: &ServerMsg) -> usize {
        match msg {
            ServerMsg::Progress { index, .. } => *index,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_sequence_numbers_follow_publish_order() {
        let broadcaster = RaceBroadcaster::new(RoomCode::parse("ABCD12").unwrap());
        let mut rx = broadcaster.subscribe();
        for remaining in [3, 2, 1] {
            broadcaster.publish(ServerMsg::CountdownTick { remaining });
        }

        let mut seen = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            seen.push(envelope.seq);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(broadcaster.last_seq(), 3);
    }

    #[test]
    fn test_publish_without_receivers_is_harmless() {
        let broadcaster = RaceBroadcaster::new(RoomCode::parse("ZZZZ99").unwrap());
        assert_eq!(broadcaster.publish(ServerMsg::CountdownTick { remaining: 1 }), 1);
    }

    #[test]
    fn test_throttle_coalesces_to_latest() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(200));
        let t0 = Instant::now();

        assert!(throttle.offer("a", progress("a", 1), t0).is_some());
        assert!(throttle.offer("a", progress("a", 2), t0 + Duration::from_millis(50)).is_none());
        assert!(throttle.offer("a", progress("a", 3), t0 + Duration::from_millis(100)).is_none());

        assert!(throttle.flush_due(t0 + Duration::from_millis(150)).is_empty());
        let flushed = throttle.flush_due(t0 + Duration::from_millis(200));
        assert_eq!(flushed.len(), 1);
        assert_eq!(index_of(&flushed[0]), 3);
    }

    #[test]
    fn test_throttle_is_per_sender() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(200));
        let t0 = Instant::now();
        assert!(throttle.offer("a", progress("a", 1), t0).is_some());
        assert!(throttle.offer("b", progress("b", 1), t0).is_some());
    }

    #[test]
    fn test_settle_discards_pending() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(200));
        let t0 = Instant::now();
        throttle.offer("a", progress("a", 1), t0);
        throttle.offer("a", progress("a", 2), t0);
        throttle.settle("a");
        assert!(throttle.flush_due(t0 + Duration::from_secs(1)).is_empty());
    }
}
