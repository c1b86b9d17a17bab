//! Shutdown watch shared by both transports.

use tokio::sync::watch;

/// Resolves once shutdown is raised or its sender is gone.
///
/// Other changes to the watch are absorbed here, so a caller racing
/// this against a read never abandons a half-read line or frame.
pub(crate) async fn shutdown_raised(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}
