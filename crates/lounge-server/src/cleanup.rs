use std::time::Duration;

use lounge_gateway::coordinator::RoomCoordinator;

/// How often housekeeping runs.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that prunes expired reconnect identities, tube states of
/// long-idle rooms and lapsed in-memory store keys.
pub async fn run_cleanup_loop(coordinator: RoomCoordinator, tube_grace: Duration) {
    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);

    loop {
        interval.tick().await;
        coordinator.sweep(tube_grace).await;
    }
}
