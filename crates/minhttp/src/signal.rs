// Copyright 2024-2026 Pipeway Developers <dev@pipeway.dev>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shutdown signal detection

use tokio::signal::ctrl_c;

/// Future that resolves when a graceful shutdown has been requested.
///
/// Detects a `SIGINT`.
///
/// **BEWARE:** this alters process state by _permanently_ registering an
/// interrupt handler through [`tokio`], so it should only be called near a
/// program's entry point. The usual caveats around signals apply: they are
/// only detected after this is first called, multiple signals may be
/// collapsed into one, etc.
///
/// # Panics
///
/// Panics if [`tokio::signal`] cannot register the handler.
pub async fn graceful_shutdown_requested() {
    ctrl_c().await.expect("Unable to await CTRL-C");
}

/// Future that resolves when a fast shutdown has been requested.
///
/// A fast shutdown is requested by multiple `SIGINT`s or at least one
/// `SIGTERM`.
///
/// **BEWARE:** same caveats as [`graceful_shutdown_requested`].
///
/// # Panics
///
/// Panics if [`tokio::signal`] cannot register the handlers.
pub async fn fast_shutdown_requested() {
    let want_to_shutdown = async {
        ctrl_c().await.expect("Unable to await CTRL-C");
        ctrl_c().await.expect("Unable to await CTRL-C");
    };

    #[cfg(unix)]
    let want_to_shutdown = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("Can't register SIGTERM handler");
        tokio::select! {
            _ = want_to_shutdown => {},
            _ = sigterm.recv() => {},
        };
    };

    want_to_shutdown.await
}

// Signal handlers are global and permanent, which destroys test isolation,
// so these functions are exercised manually rather than by automated tests.
