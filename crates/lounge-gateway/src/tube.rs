//! Server-authoritative shared video playback.
//!
//! One [`RoomTube`] per room holds the authoritative [`TubeState`]. Only the
//! owner's play/pause/seek/progress/ended events mutate it; loads, queue
//! additions and ejects are accepted from anyone. Every change is persisted
//! to the shared store before it is broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lounge_types::events::{ServerEvent, TubeEvent};
use lounge_types::models::{QueuedVideo, TubePhase, TubeSnapshot, TubeState, now_ms};
use lounge_types::sync::HEARTBEAT_INTERVAL;

use crate::dispatcher::{Audience, Dispatcher};

/// An owner that has sent nothing authoritative for this long (three missed
/// heartbeats) can be replaced by the next connection that asks.
pub const OWNER_STALE_MS: i64 = 15_000;

pub const QUEUE_CAP: usize = 100;
pub const PLAYED_HISTORY_CAP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TubeOutcome {
    /// Authoritative state changed: persist and broadcast.
    Changed,
    /// Caller may not make this change. State untouched.
    Rejected,
    /// Nothing to change.
    Unchanged,
}

/// Authoritative tube of one room.
#[derive(Debug, Default)]
pub struct RoomTube {
    pub state: TubeState,
    /// Wall-clock ms of the owner's last authoritative event
    owner_seen_at: i64,
    /// Owner that disconnected with nobody claiming the seat since
    released_by: Option<String>,
    ticker: Option<JoinHandle<()>>,
}

impl RoomTube {
    pub fn from_state(state: TubeState) -> Self {
        let owner_seen_at = state.last_update;
        Self {
            state,
            owner_seen_at,
            released_by: None,
            ticker: None,
        }
    }

    fn owner_is_stale(&self, now: i64) -> bool {
        now - self.owner_seen_at > OWNER_STALE_MS
    }

    /// Whether `actor` may act as owner, taking ownership when the seat is
    /// empty or the current owner went quiet.
    fn claim(&mut self, actor: &str, now: i64) -> bool {
        match self.state.owner_id.as_deref() {
            Some(owner) if owner == actor => {}
            Some(owner) if !self.owner_is_stale(now) => {
                debug!(owner, actor, "Ignoring non-owner tube event");
                return false;
            }
            previous => {
                info!(?previous, actor, "Tube ownership passes to next active connection");
                self.state.owner_id = Some(actor.to_string());
                self.released_by = None;
            }
        }
        self.owner_seen_at = now;
        true
    }

    pub fn apply(&mut self, actor: &str, event: &TubeEvent, now: i64) -> TubeOutcome {
        match event {
            TubeEvent::Load { video_id, title } => {
                match video_id.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                    Some(video_id) => {
                        let video = QueuedVideo {
                            video_id: video_id.to_string(),
                            title: title.clone(),
                            added_by: Some(actor.to_string()),
                        };
                        self.load(video, actor, now);
                    }
                    None => self.eject(now),
                }
                TubeOutcome::Changed
            }

            TubeEvent::Play { timestamp } | TubeEvent::Pause { timestamp } => {
                if self.state.phase() == TubePhase::Empty {
                    return TubeOutcome::Unchanged;
                }
                if !self.claim(actor, now) {
                    return TubeOutcome::Rejected;
                }
                let position = timestamp.unwrap_or_else(|| self.state.position_at(now));
                self.state.is_playing = matches!(event, TubeEvent::Play { .. });
                self.set_anchor(position, now);
                TubeOutcome::Changed
            }

            TubeEvent::Seek { timestamp } | TubeEvent::Progress { timestamp } => {
                if self.state.phase() == TubePhase::Empty {
                    return TubeOutcome::Unchanged;
                }
                if !self.claim(actor, now) {
                    return TubeOutcome::Rejected;
                }
                self.set_anchor(*timestamp, now);
                TubeOutcome::Changed
            }

            TubeEvent::Ended => {
                if self.state.phase() == TubePhase::Empty {
                    return TubeOutcome::Unchanged;
                }
                if !self.claim(actor, now) {
                    return TubeOutcome::Rejected;
                }
                self.advance(now);
                TubeOutcome::Changed
            }

            TubeEvent::Queue { video_id, title } => {
                let video_id = video_id.trim();
                if video_id.is_empty() || self.state.queue.len() >= QUEUE_CAP {
                    return TubeOutcome::Rejected;
                }
                let video = QueuedVideo {
                    video_id: video_id.to_string(),
                    title: title.clone(),
                    added_by: Some(actor.to_string()),
                };
                if self.state.video_id.is_none() {
                    self.load(video, actor, now);
                } else {
                    self.state.queue.push(video);
                }
                TubeOutcome::Changed
            }

            TubeEvent::RequestState => TubeOutcome::Unchanged,
        }
    }

    fn set_anchor(&mut self, position: f64, now: i64) {
        self.state.timestamp = if position.is_finite() { position.max(0.0) } else { 0.0 };
        self.state.last_update = now;
    }

    /// Load a new video, paused at zero pending the owner's first heartbeat.
    fn load(&mut self, video: QueuedVideo, actor: &str, now: i64) {
        self.retire_current();
        let keep_owner = self
            .state
            .owner_id
            .as_deref()
            .is_some_and(|owner| owner != actor && !self.owner_is_stale(now));
        if !keep_owner {
            self.state.owner_id = Some(actor.to_string());
            self.owner_seen_at = now;
            self.released_by = None;
        }
        self.make_current(video);
        self.state.is_playing = false;
        self.set_anchor(0.0, now);
    }

    /// Explicit eject: always accepted, clears video and owner.
    fn eject(&mut self, now: i64) {
        self.retire_current();
        self.state.video_id = None;
        self.state.is_playing = false;
        self.state.owner_id = None;
        self.released_by = None;
        self.set_anchor(0.0, now);
    }

    /// End of media: next queued video, or empty.
    fn advance(&mut self, now: i64) {
        self.retire_current();
        self.state.is_playing = false;
        self.set_anchor(0.0, now);
        if !self.state.queue.is_empty() {
            let next = self.state.queue.remove(0);
            self.make_current(next);
        }
    }

    fn make_current(&mut self, video: QueuedVideo) {
        self.state.video_id = Some(video.video_id);
        self.state.title = video.title;
        self.state.added_by = video.added_by;
    }

    /// Move the current video, if any, into played history.
    fn retire_current(&mut self) {
        let title = self.state.title.take();
        let added_by = self.state.added_by.take();
        if let Some(video_id) = self.state.video_id.take() {
            self.state.history.push(QueuedVideo {
                video_id,
                title,
                added_by,
            });
            let overflow = self.state.history.len().saturating_sub(PLAYED_HISTORY_CAP);
            self.state.history.drain(..overflow);
        }
    }

    /// Drop ownership held by `socket_id`, re-anchoring at the current
    /// position so followers keep extrapolating correctly.
    pub fn release_owner(&mut self, socket_id: &str, now: i64) -> bool {
        if self.state.owner_id.as_deref() != Some(socket_id) {
            return false;
        }
        let position = self.state.position_at(now);
        self.state.owner_id = None;
        self.released_by = Some(socket_id.to_string());
        self.set_anchor(position, now);
        true
    }

    /// Hand the seat from `from` to `to`. Also succeeds when `from` released
    /// it on disconnect and nobody has claimed it since.
    pub fn transfer_owner(&mut self, from: &str, to: &str, now: i64) -> bool {
        let held = match self.state.owner_id.as_deref() {
            Some(owner) => owner == from,
            None => self.released_by.as_deref() == Some(from),
        };
        if !held {
            return false;
        }
        self.state.owner_id = Some(to.to_string());
        self.owner_seen_at = now;
        self.released_by = None;
        true
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

/// Owns every room's tube and the drift-correction anchors sent to followers.
#[derive(Clone)]
pub struct TubeSyncCoordinator {
    inner: Arc<TubeInner>,
}

struct TubeInner {
    dispatcher: Dispatcher,
    rooms: RwLock<HashMap<String, Arc<Mutex<RoomTube>>>>,
}

impl TubeSyncCoordinator {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            inner: Arc::new(TubeInner {
                dispatcher,
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Load every persisted tube state, e.g. after a restart.
    pub async fn restore_all(&self) -> usize {
        let states = self.inner.dispatcher.store().get_all_tube_states().await;
        let mut rooms = self.inner.rooms.write().await;
        let count = states.len();
        for (room_id, state) in states {
            rooms.insert(room_id, Arc::new(Mutex::new(RoomTube::from_state(state))));
        }
        count
    }

    /// Handle to a room's tube, created on first access from the store or empty.
    async fn room(&self, room_id: &str) -> Arc<Mutex<RoomTube>> {
        if let Some(tube) = self.inner.rooms.read().await.get(room_id) {
            return tube.clone();
        }

        let persisted = match self.inner.dispatcher.store().get_tube_state(room_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(room_id, "Ignoring unreadable tube state: {}", e);
                None
            }
        };

        let mut rooms = self.inner.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(
                    persisted.map(RoomTube::from_state).unwrap_or_default(),
                ))
            })
            .clone()
    }

    pub async fn snapshot(&self, room_id: &str) -> TubeSnapshot {
        let tube = self.room(room_id).await;
        let tube = tube.lock().await;
        tube.state.snapshot(now_ms())
    }

    /// Current state without creating the room.
    pub async fn peek(&self, room_id: &str) -> Option<TubeSnapshot> {
        let tube = self.inner.rooms.read().await.get(room_id).cloned()?;
        let tube = tube.lock().await;
        Some(tube.state.snapshot(now_ms()))
    }

    pub async fn handle(&self, room_id: &str, actor: &str, event: TubeEvent) -> TubeOutcome {
        let tube = self.room(room_id).await;
        let mut guard = tube.lock().await;
        let now = now_ms();
        let outcome = guard.apply(actor, &event, now);

        match outcome {
            TubeOutcome::Changed => {
                self.commit(room_id, &mut guard, &tube).await;
            }
            TubeOutcome::Rejected | TubeOutcome::Unchanged => {
                // Non-owners resync from the authoritative state.
                let snapshot = guard.state.snapshot(now);
                self.inner
                    .dispatcher
                    .send_to_socket(actor, ServerEvent::TubeState(snapshot))
                    .await;
            }
        }
        outcome
    }

    /// Persist, then broadcast, then (re)arm the room ticker.
    async fn commit(&self, room_id: &str, tube: &mut RoomTube, handle: &Arc<Mutex<RoomTube>>) {
        let dispatcher = &self.inner.dispatcher;
        if let Err(e) = dispatcher.store().set_tube_state(room_id, &tube.state).await {
            warn!(room_id, "Could not persist tube state: {}", e);
        }
        dispatcher
            .broadcast_room(
                room_id,
                ServerEvent::TubeState(tube.state.snapshot(now_ms())),
                Audience::Everyone,
            )
            .await;
        self.arm_ticker(room_id, tube, handle);
    }

    /// Re-broadcast the anchor every heartbeat interval while playing so
    /// followers always have a fresh one. Idle rooms run no ticker.
    fn arm_ticker(&self, room_id: &str, tube: &mut RoomTube, handle: &Arc<Mutex<RoomTube>>) {
        if tube.state.phase() != TubePhase::Playing {
            tube.stop_ticker();
            return;
        }
        if tube.ticker.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let dispatcher = self.inner.dispatcher.clone();
        let weak = Arc::downgrade(handle);
        let room_id = room_id.to_string();
        tube.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(handle) = weak.upgrade() else {
                    break;
                };
                let snapshot = {
                    let tube = handle.lock().await;
                    if !tube.state.is_playing {
                        break;
                    }
                    tube.state.snapshot(now_ms())
                };
                dispatcher
                    .deliver_local(&room_id, &ServerEvent::TubeState(snapshot), &Audience::Everyone)
                    .await;
            }
            debug!(room_id, "Tube ticker stopped");
        }));
    }

    /// A connection joined `room_id`.
    pub async fn member_joined(&self, room_id: &str) {
        self.inner.dispatcher.store().clear_tube_idle(room_id).await;
        let tube = self.room(room_id).await;
        let mut guard = tube.lock().await;
        self.arm_ticker(room_id, &mut guard, &tube);
    }

    /// A connection left `room_id`. Releases its ownership; when the room is
    /// now empty, stops periodic work and leaves the state durable in the store.
    pub async fn member_left(&self, room_id: &str, socket_id: &str, room_emptied: bool) {
        let Some(tube) = self.inner.rooms.read().await.get(room_id).cloned() else {
            return;
        };
        let now = now_ms();
        let mut guard = tube.lock().await;

        if guard.release_owner(socket_id, now) {
            info!(room_id, socket_id, "Tube owner left, awaiting next heartbeat");
            if room_emptied {
                if let Err(e) = self
                    .inner
                    .dispatcher
                    .store()
                    .set_tube_state(room_id, &guard.state)
                    .await
                {
                    warn!(room_id, "Could not persist tube state: {}", e);
                }
            } else {
                self.commit(room_id, &mut guard, &tube).await;
            }
        }

        if room_emptied {
            guard.stop_ticker();
            drop(guard);
            self.inner.rooms.write().await.remove(room_id);
            self.inner.dispatcher.store().mark_tube_idle(room_id, now).await;
            debug!(room_id, "Room empty, tube parked in store");
        }
    }

    /// Hand ownership from a previous connection to its reconnected successor.
    pub async fn transfer_owner(&self, room_id: &str, from: &str, to: &str) {
        let tube = self.room(room_id).await;
        let mut guard = tube.lock().await;
        if guard.transfer_owner(from, to, now_ms()) {
            info!(room_id, from, to, "Tube ownership carried over on reconnect");
            self.commit(room_id, &mut guard, &tube).await;
        }
    }

    /// Adopt a state change made on another instance. Not re-persisted or
    /// re-published: the originating instance already did both.
    pub async fn apply_remote(&self, room_id: &str, snapshot: &TubeSnapshot) {
        let Some(tube) = self.inner.rooms.read().await.get(room_id).cloned() else {
            return;
        };
        let mut guard = tube.lock().await;
        guard.state = snapshot.state.clone();
        guard.owner_seen_at = now_ms();
        self.arm_ticker(room_id, &mut guard, &tube);
    }

    /// Forget rooms whose persisted state was pruned.
    pub async fn forget(&self, room_ids: &[String]) {
        let mut rooms = self.inner.rooms.write().await;
        for room_id in room_ids {
            if let Some(tube) = rooms.remove(room_id) {
                tube.lock().await.stop_ticker();
            }
        }
    }
}
