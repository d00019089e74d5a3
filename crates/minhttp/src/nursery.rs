// Copyright 2024-2026 Pipeway Developers <dev@pipeway.dev>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Keeps child tasks from outliving the task that spawned them

use std::future::Future;

use tokio::select;
use tokio::sync::{mpsc, watch};

/// Limits the lifetimes of async child tasks.
///
/// A small take on the nursery idea from structured concurrency: wrap a
/// [`Future`] in [`chaperone`](Nursery::chaperone) before spawning it, and
/// [`finish`](Nursery::finish) (or dropping the [`Nursery`]) will not resolve
/// until every wrapped future has ceased to exist. Dropping the [`Nursery`]
/// additionally wakes all chaperoned futures so they cancel themselves the
/// next time they are polled.
///
/// **BEWARE:** this only works on multithreaded [`tokio`] runtimes; the
/// [`Drop`] impl has to block the current thread while children wind down.
/// Panic propagation is not implemented.
pub struct Nursery {
    /// Flipped to true to tell children to cancel themselves ASAP
    canceled: watch::Sender<bool>,
    /// Cloned into children; holds `children_done` open while any child exists
    child_sender: Option<mpsc::Sender<()>>,
    /// Resolves (returns `None`) once no `child_sender` clone remains
    children_done: mpsc::Receiver<()>,
}

// An mpsc queue as a refcount looks odd, but it's the mechanism suggested by
// the tokio shutdown docs: no JoinHandle tracking, spawning stays with the
// caller, and it can be drained from both async and sync (Drop) contexts.

/// Indicates a [`Future`] was canceled because its [`Nursery`] was dropped.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Canceled;

impl Nursery {
    /// Construct a new [`Nursery`].
    pub fn new() -> Self {
        let (canceled, _) = watch::channel(false);
        let (child_sender, children_done) = mpsc::channel(1);
        Self {
            canceled,
            child_sender: Some(child_sender),
            children_done,
        }
    }

    /// Wrap `task` so this [`Nursery`] waits for it and can cancel it.
    pub fn chaperone<T: Send>(
        &mut self,
        task: impl Future<Output = T> + Send + 'static,
    ) -> impl Future<Output = Result<T, Canceled>> + Send + 'static {
        let mut canceled = self.canceled.subscribe();
        let child_sender = self
            .child_sender
            .clone()
            .expect("Bug: Nursery's child_sender should only be None during shutdown");
        async move {
            let _child_sender = child_sender; // holds children_done open while this future exists
            let canceled = canceled.wait_for(|&canceled| canceled);
            select! {
                // Biased so a cancellation check happens on every poll even
                // when `task` is always ready.
                biased;
                _ = canceled => Err(Canceled),
                val = task => Ok(val),
            }
        }
    }

    /// Consume the [`Nursery`], waiting gracefully for children to finish.
    ///
    /// # Cancel Safety
    ///
    /// Canceling the returned [`Future`] cancels all children and blocks
    /// until they finish.
    pub async fn finish(mut self) {
        self.child_sender = None; // otherwise recv would deadlock
        assert!(self.children_done.recv().await.is_none());
    }

    /// Synchronously drain the nursery. Invalidates `self`.
    fn block_until_finished(&mut self) {
        self.child_sender = None; // otherwise blocking_recv would deadlock
        assert!(self.children_done.blocking_recv().is_none());
    }
}

impl Default for Nursery {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Nursery {
    fn drop(&mut self) {
        // send fails iff there are no children, in which case there's
        // nothing to wait for and no reason to pay for block_in_place.
        if self.canceled.send(true).is_ok() {
            // block_in_place offloads this worker's queue so it can't
            // contain a child we'd deadlock waiting on.
            tokio::task::block_in_place(|| self.block_until_finished());
        }
    }
}
