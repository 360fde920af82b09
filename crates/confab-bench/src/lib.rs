//! Shared helpers for confab benchmarks and load tools.

use confab_core::{JwtAuth, Socket, SocketIdentity, UserId};
use confab_protocol::Frame;
use std::time::Duration;
use tokio::sync::mpsc;

/// Token secret matching the server's dev-mode default.
pub const DEV_SECRET: &str = "change-me";

/// Sign a connect token for `user_id` with the dev-mode secret.
///
/// # Panics
///
/// Panics if signing fails.
#[must_use]
pub fn dev_token(user_id: UserId) -> String {
    JwtAuth::new(DEV_SECRET, Duration::from_secs(3600))
        .sign(user_id)
        .expect("token signing")
}

/// A socket wired to an in-process queue, for driving the registry
/// without a network transport.
#[must_use]
pub fn local_socket(user_id: UserId) -> (Socket, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Socket::new(SocketIdentity::new(user_id), tx), rx)
}
