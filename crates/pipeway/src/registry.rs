// Copyright 2024-2026 Pipeway Developers <dev@pipeway.dev>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process-wide rendezvous state

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::pipe::{ReceiverHandle, SenderHandle};

/// Process-wide map from rendezvous path to per-path state.
///
/// A path is in at most one of two states at any instant: unestablished
/// (a partial pipe is collecting participants) or established (a transfer is
/// in flight). All mutation happens under one lock; critical sections are
/// pure bookkeeping and never span body I/O.
pub struct Registry {
    pub(crate) paths: Mutex<Paths>,
    next_participant: AtomicU64,
}

#[derive(Default)]
pub(crate) struct Paths {
    pub(crate) unestablished: HashMap<String, UnestablishedPipe>,
    pub(crate) established: HashSet<String>,
}

/// Partial rendezvous state before quorum.
pub(crate) struct UnestablishedPipe {
    /// Receiver count every participant on this path must agree on. Fixed by
    /// whichever participant arrived first.
    pub(crate) expected: u64,
    pub(crate) sender: Option<SenderHandle>,
    pub(crate) receivers: Vec<ReceiverHandle>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            paths: Mutex::new(Paths::default()),
            next_participant: AtomicU64::new(1),
        })
    }

    pub(crate) fn next_participant_id(&self) -> u64 {
        self.next_participant.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether a transfer is currently in flight on `path`.
    pub fn is_established(&self, path: &str) -> bool {
        self.paths.lock().unwrap().established.contains(path)
    }

    /// Release `path` once its transfer concludes, making it available for a
    /// fresh rendezvous.
    pub fn clear_established(&self, path: &str) {
        self.paths.lock().unwrap().established.remove(path);
        debug!(%path, "path released");
    }

    /// Remove one participant from the partial pipe at `path`.
    ///
    /// Fired by close-watchers when a waiting client disconnects. Identity is
    /// compared so a watcher can never evict a participant other than its
    /// own; removing the last participant removes the record.
    pub(crate) fn deregister(&self, path: &str, participant: u64) {
        let mut paths = self.paths.lock().unwrap();
        let Some(pipe) = paths.unestablished.get_mut(path) else {
            return;
        };
        if pipe.sender.as_ref().is_some_and(|s| s.id == participant) {
            pipe.sender = None;
            debug!(%path, participant, "waiting sender deregistered");
        } else {
            let before = pipe.receivers.len();
            pipe.receivers.retain(|r| r.id != participant);
            if pipe.receivers.len() != before {
                debug!(%path, participant, "waiting receiver deregistered");
            }
        }
        if pipe.sender.is_none() && pipe.receivers.is_empty() {
            paths.unestablished.remove(path);
            debug!(%path, "empty pipe removed");
        }
    }
}
