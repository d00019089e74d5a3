// Copyright 2024-2026 Pipeway Developers <dev@pipeway.dev>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-path rendezvous state machine and participant handles
//!
//! Arrivals are serialised under the registry lock; after each arrival the
//! establishment predicate (one sender, exactly `n` receivers) is evaluated
//! once. On establishment the participants are captured into a
//! [`TransferJob`] and every close-watcher is revoked, so that from then on
//! disconnects are the transfer engine's business, not ours.

use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use hyper::header::HeaderValue;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use minhttp::response::GenericResponse;

use crate::body::RelayBody;
use crate::error::Reject;
use crate::registry::{Paths, Registry, UnestablishedPipe};
use crate::route;

/// Write side of a sender's streaming progress response.
///
/// Lines are queued synchronously (the channel is unbounded; line volume is
/// bounded by the receiver count), so progress can be written under the
/// registry lock without suspending.
#[derive(Clone)]
pub struct Progress {
    tx: mpsc::UnboundedSender<Result<Bytes, anyhow::Error>>,
}

impl Progress {
    pub fn new(tx: mpsc::UnboundedSender<Result<Bytes, anyhow::Error>>) -> Self {
        Self { tx }
    }

    /// Queue one protocol line on the sender's response. A vanished sender
    /// just means nobody is listening; that's not our problem here.
    pub(crate) fn line(&self, line: impl std::fmt::Display) {
        let _ = self.tx.send(Ok(Bytes::from(format!("{line}\n"))));
    }

    /// Destroy the sender's connection by failing its response stream.
    pub(crate) fn destroy(&self) {
        let _ = self
            .tx
            .send(Err(anyhow::anyhow!("relay destroyed the connection")));
    }
}

/// One-shot arming state shared between a registered participant and its
/// [`CloseWatcher`] guard.
#[derive(Clone)]
pub(crate) struct Armed(Arc<AtomicBool>);

impl Armed {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Revoke the watcher. Idempotent; happens under the registry lock at
    /// establishment, before any transfer I/O.
    pub(crate) fn revoke(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn disarm(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Deregisters a waiting participant when its connection goes away.
///
/// The guard is attached to whatever the HTTP runtime drops when the client
/// disconnects: the sender's response body, or the receiver's pending
/// response future. It captures the record key and the participant identity
/// rather than any pointer into the record, and fires at most once.
pub struct CloseWatcher {
    registry: Arc<Registry>,
    path: String,
    participant: u64,
    armed: Armed,
}

impl Drop for CloseWatcher {
    fn drop(&mut self) {
        if self.armed.disarm() {
            self.registry.deregister(&self.path, self.participant);
        }
    }
}

/// A registered sender: its request body, content metadata, and the progress
/// channel feeding its open response.
pub struct SenderHandle {
    pub(crate) id: u64,
    pub(crate) body: RelayBody,
    pub(crate) content_type: Option<HeaderValue>,
    pub(crate) content_length: Option<u64>,
    pub(crate) progress: Progress,
    pub(crate) armed: Armed,
}

/// A registered receiver: the channel its response will be delivered on once
/// the transfer starts.
pub struct ReceiverHandle {
    pub(crate) id: u64,
    pub(crate) respond: oneshot::Sender<GenericResponse>,
    pub(crate) armed: Armed,
}

/// A complete rendezvous captured for the transfer engine.
pub struct TransferJob {
    pub(crate) path: String,
    pub(crate) sender: SenderHandle,
    pub(crate) receivers: Vec<ReceiverHandle>,
}

/// What registering a sender produced.
pub enum SenderRegistered {
    /// Waiting for receivers; the pipe keeps the sender until quorum.
    Waiting(CloseWatcher),
    /// This arrival completed the quorum.
    Established(TransferJob, CloseWatcher),
}

/// What registering a receiver produced. Either way the response arrives on
/// the returned channel; nothing is written to the receiver until then.
pub enum ReceiverRegistered {
    Waiting(oneshot::Receiver<GenericResponse>, CloseWatcher),
    Established(
        TransferJob,
        oneshot::Receiver<GenericResponse>,
        CloseWatcher,
    ),
}

/// Register a sender on `path` expecting `requested` receivers.
///
/// `body` is the sender's request body, kept unread until establishment.
/// Progress lines are queued on `progress` as specified by the protocol.
pub fn register_sender(
    registry: &Arc<Registry>,
    path: &str,
    requested: i64,
    body: RelayBody,
    content_type: Option<HeaderValue>,
    content_length: Option<u64>,
    progress: Progress,
) -> Result<SenderRegistered, Reject> {
    if route::is_reserved(path) {
        return Err(Reject::ReservedPath {
            path: path.to_owned(),
        });
    }
    if requested <= 0 {
        return Err(Reject::BadCount { n: requested });
    }
    let expected = requested as u64;

    let mut guard = registry.paths.lock().unwrap();
    let paths = &mut *guard;
    if paths.established.contains(path) {
        return Err(Reject::SenderAlreadyEstablished {
            path: path.to_owned(),
        });
    }

    // Participant state is only created once every check has passed: a
    // CloseWatcher dropped on a rejection path would try to re-enter the
    // registry lock held right here.
    let new_participant = move || {
        let armed = Armed::new();
        let id = registry.next_participant_id();
        let watcher = CloseWatcher {
            registry: registry.clone(),
            path: path.to_owned(),
            participant: id,
            armed: armed.clone(),
        };
        let handle = SenderHandle {
            id,
            body,
            content_type,
            content_length,
            progress,
            armed,
        };
        (handle, watcher)
    };

    match paths.unestablished.entry(path.to_owned()) {
        Entry::Occupied(mut entry) => {
            let pipe = entry.get_mut();
            if pipe.sender.is_some() {
                return Err(Reject::DuplicateSender {
                    path: path.to_owned(),
                });
            }
            if pipe.expected != expected {
                return Err(Reject::CountMismatch {
                    expected: pipe.expected,
                    requested,
                });
            }
            let (handle, watcher) = new_participant();

            let connected = pipe.receivers.len();
            handle
                .progress
                .line(format_args!("[INFO] Waiting for {expected} receiver(s)..."));
            handle.progress.line(format_args!(
                "[INFO] {connected} receiver(s) has/have been connected."
            ));

            if connected as u64 == expected {
                handle.progress.line("Start sending!");
                let pipe = entry.remove();
                let job = establish(paths, path.to_owned(), handle, pipe.receivers);
                Ok(SenderRegistered::Established(job, watcher))
            } else {
                pipe.sender = Some(handle);
                debug!(%path, connected, expected, "sender joined a partial pipe");
                Ok(SenderRegistered::Waiting(watcher))
            }
        }
        Entry::Vacant(entry) => {
            let (handle, watcher) = new_participant();
            handle
                .progress
                .line(format_args!("[INFO] Waiting for {expected} receiver(s)..."));
            entry.insert(UnestablishedPipe {
                expected,
                sender: Some(handle),
                receivers: Vec::new(),
            });
            debug!(%path, expected, "sender opened a pipe");
            Ok(SenderRegistered::Waiting(watcher))
        }
    }
}

/// Register a receiver on `path` expecting `requested` receivers in total.
pub fn register_receiver(
    registry: &Arc<Registry>,
    path: &str,
    requested: i64,
) -> Result<ReceiverRegistered, Reject> {
    if requested <= 0 {
        return Err(Reject::BadCount { n: requested });
    }
    let expected = requested as u64;

    let mut guard = registry.paths.lock().unwrap();
    let paths = &mut *guard;
    if paths.established.contains(path) {
        return Err(Reject::ReceiverAlreadyEstablished {
            path: path.to_owned(),
        });
    }

    // Deferred for the same reason as in register_sender: a watcher dropped
    // on a rejection path would deadlock on the lock held here.
    let new_participant = move || {
        let (respond_tx, respond_rx) = oneshot::channel();
        let armed = Armed::new();
        let id = registry.next_participant_id();
        let watcher = CloseWatcher {
            registry: registry.clone(),
            path: path.to_owned(),
            participant: id,
            armed: armed.clone(),
        };
        let handle = ReceiverHandle {
            id,
            respond: respond_tx,
            armed,
        };
        (handle, respond_rx, watcher)
    };

    match paths.unestablished.entry(path.to_owned()) {
        Entry::Occupied(mut entry) => {
            let pipe = entry.get_mut();
            if pipe.expected != expected {
                return Err(Reject::CountMismatch {
                    expected: pipe.expected,
                    requested,
                });
            }
            if pipe.receivers.len() as u64 == pipe.expected {
                return Err(Reject::ReceiversFull);
            }
            let (handle, respond_rx, watcher) = new_participant();

            pipe.receivers.push(handle);
            if let Some(sender) = &pipe.sender {
                sender.progress.line("[INFO] A receiver was connected.");
            }

            let quorum = pipe.receivers.len() as u64 == pipe.expected && pipe.sender.is_some();
            if quorum {
                let pipe = entry.remove();
                if let Some(sender) = pipe.sender {
                    sender.progress.line(format_args!(
                        "[INFO] Start sending with {expected} receiver(s)!"
                    ));
                    let job = establish(paths, path.to_owned(), sender, pipe.receivers);
                    return Ok(ReceiverRegistered::Established(job, respond_rx, watcher));
                }
            }
            debug!(%path, expected, "receiver joined a partial pipe");
            Ok(ReceiverRegistered::Waiting(respond_rx, watcher))
        }
        Entry::Vacant(entry) => {
            let (handle, respond_rx, watcher) = new_participant();
            entry.insert(UnestablishedPipe {
                expected,
                sender: None,
                receivers: vec![handle],
            });
            debug!(%path, expected, "receiver opened a pipe");
            Ok(ReceiverRegistered::Waiting(respond_rx, watcher))
        }
    }
}

/// Capture a complete pipe: revoke every watcher, flip the path to
/// established, and package the participants for the transfer engine.
fn establish(
    paths: &mut Paths,
    path: String,
    sender: SenderHandle,
    receivers: Vec<ReceiverHandle>,
) -> TransferJob {
    sender.armed.revoke();
    for receiver in &receivers {
        receiver.armed.revoke();
    }
    paths.established.insert(path.clone());
    info!(%path, receivers = receivers.len(), "rendezvous established");
    TransferJob {
        path,
        sender,
        receivers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http_body_util::Full;

    use crate::body;

    fn test_body() -> RelayBody {
        body::erase(Full::new(Bytes::from("payload")))
    }

    struct TestSender {
        lines: mpsc::UnboundedReceiver<Result<Bytes, anyhow::Error>>,
    }

    impl TestSender {
        fn next_line(&mut self) -> String {
            let item = self
                .lines
                .try_recv()
                .expect("expected a queued progress line");
            String::from_utf8(item.unwrap().to_vec()).unwrap()
        }

        fn no_more_lines(&mut self) {
            assert!(self.lines.try_recv().is_err());
        }
    }

    /// The registration enums hold live bodies and can't derive Debug, so
    /// unwrap_err is off the table.
    fn reject<T>(result: Result<T, Reject>) -> Reject {
        match result {
            Ok(_) => panic!("expected the registration to be rejected"),
            Err(reject) => reject,
        }
    }

    fn register_test_sender(
        registry: &Arc<Registry>,
        path: &str,
        n: i64,
    ) -> (Result<SenderRegistered, Reject>, TestSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let result = register_sender(
            registry,
            path,
            n,
            test_body(),
            None,
            Some(7),
            Progress::new(tx),
        );
        (result, TestSender { lines: rx })
    }

    #[tokio::test]
    async fn first_sender_waits_and_announces() {
        let registry = Registry::new();
        let (result, mut sender) = register_test_sender(&registry, "/t", 2);
        assert!(matches!(result, Ok(SenderRegistered::Waiting(_))));
        assert_eq!(sender.next_line(), "[INFO] Waiting for 2 receiver(s)...\n");
        sender.no_more_lines();
        assert!(registry.paths.lock().unwrap().unestablished.contains_key("/t"));
    }

    #[tokio::test]
    async fn second_sender_is_rejected() {
        let registry = Registry::new();
        let (first, _lines) = register_test_sender(&registry, "/t", 1);
        let _keep = first.unwrap();
        let (second, _) = register_test_sender(&registry, "/t", 1);
        assert_eq!(
            reject(second),
            Reject::DuplicateSender { path: "/t".into() }
        );
    }

    #[tokio::test]
    async fn sender_count_must_match_the_pipe() {
        let registry = Registry::new();
        let _receiver = register_receiver(&registry, "/t", 2).unwrap();
        let (result, _) = register_test_sender(&registry, "/t", 3);
        assert_eq!(
            reject(result),
            Reject::CountMismatch {
                expected: 2,
                requested: 3
            }
        );
    }

    #[tokio::test]
    async fn receiver_count_must_match_the_pipe() {
        let registry = Registry::new();
        let _receiver = register_receiver(&registry, "/t", 2).unwrap();
        let err = reject(register_receiver(&registry, "/t", 1));
        assert_eq!(
            err,
            Reject::CountMismatch {
                expected: 2,
                requested: 1
            }
        );
    }

    #[tokio::test]
    async fn nonpositive_counts_are_rejected() {
        let registry = Registry::new();
        assert_eq!(
            reject(register_receiver(&registry, "/t", 0)),
            Reject::BadCount { n: 0 }
        );
        let (result, _) = register_test_sender(&registry, "/t", -1);
        assert_eq!(reject(result), Reject::BadCount { n: -1 });
        assert!(registry.paths.lock().unwrap().unestablished.is_empty());
    }

    #[tokio::test]
    async fn reserved_paths_refuse_senders() {
        let registry = Registry::new();
        for path in ["/", "/version", "/help"] {
            let (result, _) = register_test_sender(&registry, path, 1);
            assert_eq!(
                reject(result),
                Reject::ReservedPath { path: path.into() }
            );
        }
    }

    #[tokio::test]
    async fn receivers_beyond_the_quorum_are_rejected() {
        let registry = Registry::new();
        let _first = register_receiver(&registry, "/t", 1).unwrap();
        let err = reject(register_receiver(&registry, "/t", 1));
        assert_eq!(err, Reject::ReceiversFull);
    }

    #[tokio::test]
    async fn sender_arrival_can_complete_the_quorum() {
        let registry = Registry::new();
        let _r1 = register_receiver(&registry, "/t", 2).unwrap();
        let _r2 = register_receiver(&registry, "/t", 2).unwrap();

        let (result, mut sender) = register_test_sender(&registry, "/t", 2);
        let Ok(SenderRegistered::Established(job, _watcher)) = result else {
            panic!("quorum was complete; sender arrival should establish");
        };
        assert_eq!(job.path, "/t");
        assert_eq!(job.receivers.len(), 2);

        assert_eq!(sender.next_line(), "[INFO] Waiting for 2 receiver(s)...\n");
        assert_eq!(
            sender.next_line(),
            "[INFO] 2 receiver(s) has/have been connected.\n"
        );
        assert_eq!(sender.next_line(), "Start sending!\n");
        sender.no_more_lines();

        let paths = registry.paths.lock().unwrap();
        assert!(paths.unestablished.is_empty());
        assert!(paths.established.contains("/t"));
    }

    #[tokio::test]
    async fn receiver_arrival_can_complete_the_quorum() {
        let registry = Registry::new();
        let (result, mut sender) = register_test_sender(&registry, "/t", 1);
        let _waiting = result.unwrap();
        assert_eq!(sender.next_line(), "[INFO] Waiting for 1 receiver(s)...\n");

        let outcome = register_receiver(&registry, "/t", 1).unwrap();
        let ReceiverRegistered::Established(job, _rx, _watcher) = outcome else {
            panic!("receiver arrival should establish");
        };
        assert_eq!(job.receivers.len(), 1);

        assert_eq!(sender.next_line(), "[INFO] A receiver was connected.\n");
        assert_eq!(
            sender.next_line(),
            "[INFO] Start sending with 1 receiver(s)!\n"
        );
        sender.no_more_lines();
    }

    #[tokio::test]
    async fn intermediate_receivers_only_announce() {
        let registry = Registry::new();
        let (result, mut sender) = register_test_sender(&registry, "/t", 3);
        let _waiting = result.unwrap();
        assert_eq!(sender.next_line(), "[INFO] Waiting for 3 receiver(s)...\n");

        let _r1 = register_receiver(&registry, "/t", 3).unwrap();
        assert_eq!(sender.next_line(), "[INFO] A receiver was connected.\n");
        sender.no_more_lines();

        let _r2 = register_receiver(&registry, "/t", 3).unwrap();
        assert_eq!(sender.next_line(), "[INFO] A receiver was connected.\n");
        sender.no_more_lines();
    }

    #[tokio::test]
    async fn establishment_revokes_every_watcher() {
        let registry = Registry::new();
        let r1 = register_receiver(&registry, "/t", 1).unwrap();
        let (result, _lines) = register_test_sender(&registry, "/t", 1);

        let Ok(SenderRegistered::Established(job, sender_watcher)) = result else {
            panic!("should establish");
        };
        assert!(!job.sender.armed.is_armed());
        for receiver in &job.receivers {
            assert!(!receiver.armed.is_armed());
        }

        // Dropping revoked watchers must not disturb the established path.
        drop(sender_watcher);
        drop(r1);
        let paths = registry.paths.lock().unwrap();
        assert!(paths.established.contains("/t"));
        assert!(paths.unestablished.is_empty());
    }

    #[tokio::test]
    async fn established_paths_reject_both_roles() {
        let registry = Registry::new();
        let _r = register_receiver(&registry, "/t", 1).unwrap();
        let (result, _lines) = register_test_sender(&registry, "/t", 1);
        let _job = result.unwrap();

        let (sender_retry, _) = register_test_sender(&registry, "/t", 1);
        assert_eq!(
            reject(sender_retry),
            Reject::SenderAlreadyEstablished { path: "/t".into() }
        );
        assert_eq!(
            reject(register_receiver(&registry, "/t", 1)),
            Reject::ReceiverAlreadyEstablished { path: "/t".into() }
        );
    }

    #[tokio::test]
    async fn dropped_sender_watcher_frees_the_path() {
        let registry = Registry::new();
        let (result, _lines) = register_test_sender(&registry, "/t", 1);
        let Ok(SenderRegistered::Waiting(watcher)) = result else {
            panic!("no receivers yet");
        };
        drop(watcher);
        assert!(registry.paths.lock().unwrap().unestablished.is_empty());

        // The path is immediately reusable.
        let (result, _lines) = register_test_sender(&registry, "/t", 1);
        assert!(matches!(result, Ok(SenderRegistered::Waiting(_))));
    }

    #[tokio::test]
    async fn dropped_receiver_watcher_keeps_other_participants() {
        let registry = Registry::new();
        let (result, _lines) = register_test_sender(&registry, "/t", 2);
        let _sender = result.unwrap();
        let outcome = register_receiver(&registry, "/t", 2).unwrap();
        let ReceiverRegistered::Waiting(_rx, watcher) = outcome else {
            panic!("one of two receivers can't establish");
        };

        drop(watcher);
        let paths = registry.paths.lock().unwrap();
        let pipe = &paths.unestablished["/t"];
        assert!(pipe.sender.is_some());
        assert!(pipe.receivers.is_empty());
    }
}
