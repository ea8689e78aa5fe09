//! Follower-side playback synchronization.
//!
//! Every follower runs this independently of server pushes: it turns the last
//! `tube:state` snapshot plus its own receive time into an expected playback
//! position and decides whether a corrective seek is needed.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::models::TubeSnapshot;

/// Drift beyond this many seconds triggers a corrective seek.
pub const DRIFT_TOLERANCE_SECS: f64 = 3.0;

/// After a corrective seek, locally generated pause events are swallowed for
/// this long so the seek cannot bounce back as a pause.
pub const SEEK_PAUSE_SUPPRESSION_MS: i64 = 1_000;

/// Owner heartbeat cadence while playing.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long a player gets to become ready before a manual retry is offered.
pub const PLAYER_READY_TIMEOUT: Duration = Duration::from_secs(8);

/// True when the local player is far enough from the expected position to
/// warrant a seek.
pub fn needs_reseek(local_position: f64, expected_position: f64) -> bool {
    (local_position - expected_position).abs() > DRIFT_TOLERANCE_SECS
}

/// The last authoritative state as seen by a follower, corrected for the
/// offset between the server clock and the local clock.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerAnchor {
    pub timestamp: f64,
    pub is_playing: bool,
    pub last_update: i64,
    /// `server_time - received_at`, in ms.
    pub offset_ms: i64,
}

impl ServerAnchor {
    pub fn from_snapshot(snapshot: &TubeSnapshot, received_at: i64) -> Self {
        Self {
            timestamp: snapshot.state.timestamp,
            is_playing: snapshot.state.is_playing,
            last_update: snapshot.state.last_update,
            offset_ms: snapshot.server_time - received_at,
        }
    }

    pub fn estimated_server_now(&self, local_now: i64) -> i64 {
        local_now + self.offset_ms
    }

    pub fn expected_position(&self, local_now: i64) -> f64 {
        if !self.is_playing {
            return self.timestamp;
        }
        let elapsed = (self.estimated_server_now(local_now) - self.last_update) as f64 / 1000.0;
        self.timestamp + elapsed
    }
}

/// Drift-correction state kept by one follower.
#[derive(Debug, Clone, Default)]
pub struct FollowerSync {
    socket_id: Option<String>,
    anchor: Option<ServerAnchor>,
    is_owner: bool,
    suppress_pause_until: Option<i64>,
}

impl FollowerSync {
    pub fn new(socket_id: impl Into<String>) -> Self {
        Self {
            socket_id: Some(socket_id.into()),
            ..Default::default()
        }
    }

    pub fn anchor(&self) -> Option<&ServerAnchor> {
        self.anchor.as_ref()
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Record a `tube:state` broadcast received at local time `received_at`.
    pub fn observe(&mut self, snapshot: &TubeSnapshot, received_at: i64) {
        self.is_owner = snapshot.state.owner_id.is_some()
            && snapshot.state.owner_id.as_deref() == self.socket_id.as_deref();
        self.anchor = snapshot
            .state
            .video_id
            .as_ref()
            .map(|_| ServerAnchor::from_snapshot(snapshot, received_at));
    }

    /// Returns the position to seek to when the local player has drifted past
    /// tolerance. The owner never corrects itself from its own echoes.
    pub fn correction(&mut self, local_position: f64, local_now: i64) -> Option<f64> {
        if self.is_owner {
            return None;
        }
        let expected = self.anchor.as_ref()?.expected_position(local_now);
        if !needs_reseek(local_position, expected) {
            return None;
        }
        debug!(
            local_position,
            expected, "drift beyond tolerance, seeking follower"
        );
        self.suppress_pause_until = Some(local_now + SEEK_PAUSE_SUPPRESSION_MS);
        Some(expected.max(0.0))
    }

    /// Whether a locally generated pause should be sent to the server.
    /// Pauses triggered by our own corrective seek are swallowed.
    pub fn should_emit_pause(&mut self, local_now: i64) -> bool {
        match self.suppress_pause_until {
            Some(until) if local_now < until => false,
            Some(_) => {
                self.suppress_pause_until = None;
                true
            }
            None => true,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PlaybackError {
    #[error("video {video_id} was not ready after {waited:?}; retry to load it again")]
    NotReady { video_id: String, waited: Duration },
}

/// Wait for a player to report ready, bounded by [`PLAYER_READY_TIMEOUT`].
/// A timeout is recoverable and never touches authoritative state.
pub async fn wait_until_ready<F, T>(video_id: &str, ready: F) -> Result<T, PlaybackError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(PLAYER_READY_TIMEOUT, ready)
        .await
        .map_err(|_| PlaybackError::NotReady {
            video_id: video_id.to_string(),
            waited: PLAYER_READY_TIMEOUT,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TubeState;

    fn snapshot(timestamp: f64, playing: bool, last_update: i64, server_time: i64) -> TubeSnapshot {
        TubeState {
            video_id: Some("abc123".into()),
            is_playing: playing,
            timestamp,
            last_update,
            owner_id: Some("owner".into()),
            ..Default::default()
        }
        .snapshot(server_time)
    }

    #[test]
    fn reseek_threshold_is_exclusive() {
        assert!(!needs_reseek(10.0, 13.0));
        assert!(!needs_reseek(13.0, 10.0));
        assert!(needs_reseek(10.0, 13.01));
        assert!(needs_reseek(13.01, 10.0));
    }

    #[test]
    fn expected_position_uses_clock_offset() {
        // Server clock is 2s ahead of ours.
        let snap = snapshot(5.0, true, 100_000, 100_000);
        let anchor = ServerAnchor::from_snapshot(&snap, 98_000);
        assert_eq!(anchor.offset_ms, 2_000);
        // One local second later the server is 1s past its anchor.
        assert_eq!(anchor.expected_position(99_000), 6.0);
    }

    #[test]
    fn paused_anchor_does_not_advance() {
        let anchor = ServerAnchor::from_snapshot(&snapshot(7.0, false, 0, 0), 0);
        assert_eq!(anchor.expected_position(60_000), 7.0);
    }

    #[test]
    fn follower_joining_after_heartbeat_seeks_once() {
        let mut sync = FollowerSync::new("follower");
        sync.observe(&snapshot(5.0, true, 50_000, 50_000), 50_000);

        let target = sync.correction(0.0, 50_000).unwrap();
        assert!((target - 5.0).abs() < 1e-9);

        // Once the player is there, no further seek.
        assert_eq!(sync.correction(5.1, 50_100), None);
    }

    #[test]
    fn seek_suppresses_pause_for_one_second() {
        let mut sync = FollowerSync::new("follower");
        sync.observe(&snapshot(30.0, true, 0, 0), 0);
        assert!(sync.correction(0.0, 0).is_some());

        assert!(!sync.should_emit_pause(500));
        assert!(!sync.should_emit_pause(999));
        assert!(sync.should_emit_pause(1_000));
        assert!(sync.should_emit_pause(1_500));
    }

    #[test]
    fn owner_never_self_corrects() {
        let mut sync = FollowerSync::new("owner");
        sync.observe(&snapshot(100.0, true, 0, 0), 0);
        assert!(sync.is_owner());
        assert_eq!(sync.correction(0.0, 0), None);
    }

    #[test]
    fn no_anchor_without_video() {
        let mut sync = FollowerSync::new("follower");
        sync.observe(&TubeState::default().snapshot(0), 0);
        assert!(sync.anchor().is_none());
        assert_eq!(sync.correction(42.0, 0), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_wait_times_out() {
        let result = wait_until_ready("abc123", std::future::pending::<()>()).await;
        assert_eq!(
            result,
            Err(PlaybackError::NotReady {
                video_id: "abc123".into(),
                waited: PLAYER_READY_TIMEOUT,
            })
        );
    }

    #[tokio::test]
    async fn ready_wait_passes_through() {
        assert_eq!(wait_until_ready("abc123", async { 7 }).await, Ok(7));
    }
}
