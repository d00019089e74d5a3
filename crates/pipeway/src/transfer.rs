// Copyright 2024-2026 Pipeway Developers <dev@pipeway.dev>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Established-transfer fan-out engine
//!
//! Single-shot per path: pump the sender's byte stream into every receiver's
//! response, then release the path. Backpressure is end-to-end: each
//! receiver sits behind a bounded channel, and the source only advances once
//! every live receiver has buffered the current chunk, so the slowest
//! receiver paces the sender while faster ones drain their windows.

use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::Response;
use tokio::sync::mpsc;
use tracing::{info, warn};

use minhttp::response::GenericResponse;

use crate::body::{self, BodyStream, RelayBody};
use crate::multipart;
use crate::pipe::TransferJob;
use crate::registry::Registry;

/// Chunks buffered per receiver before the source is paused.
const RECEIVER_WINDOW: usize = 16;

type Source = BoxStream<'static, Result<Bytes, anyhow::Error>>;
type Outlet = mpsc::Sender<Result<Bytes, anyhow::Error>>;

/// Run one transfer to completion and release the path.
pub async fn run(registry: Arc<Registry>, job: TransferJob) {
    let TransferJob {
        path,
        sender,
        receivers,
    } = job;
    let progress = sender.progress.clone();

    // Multipart senders donate their first part; everyone else pipes the
    // request body straight through.
    let selected = select_source(
        sender.body,
        sender.content_type.clone(),
        sender.content_length,
    )
    .await;
    let (source, content_type, content_length) = match selected {
        Ok(selected) => selected,
        Err(err) => {
            warn!(%path, "could not read multipart upload: {err:#}");
            progress.line("[ERROR] Sending Failed.");
            for receiver in receivers {
                let _ = receiver.respond.send(aborted_response());
            }
            registry.clear_established(&path);
            return;
        }
    };

    // Flush every receiver's response head. A receiver that vanished between
    // establishment and now counts as closed halfway.
    let mut outlets = Vec::with_capacity(receivers.len());
    for receiver in receivers {
        let (tx, respond_body) = body::streamed(RECEIVER_WINDOW);
        let response = receiver_response(content_type.as_ref(), content_length, respond_body);
        if receiver.respond.send(response).is_ok() {
            outlets.push(tx);
        }
    }

    let outcome = if outlets.is_empty() {
        Outcome::AllReceiversClosed
    } else {
        pump(source, &mut outlets).await
    };

    match outcome {
        Outcome::SourceEnded { bytes } => {
            info!(%path, bytes, "transfer complete");
            progress.line("[INFO] Sending Successful!");
            // Dropping the outlets below ends each receiver body cleanly.
        }
        Outcome::SourceFailed(err) => {
            warn!(%path, "transfer failed: {err:#}");
            progress.line("[ERROR] Sending Failed.");
            // Destroy the remaining receivers. The error is queued behind
            // any buffered chunks; a receiver that never drains holds its
            // slot until it disconnects, which is the no-timeout contract.
            future::join_all(
                outlets
                    .iter()
                    .map(|tx| tx.send(Err(anyhow!("sender stream failed")))),
            )
            .await;
        }
        Outcome::AllReceiversClosed => {
            info!(%path, "all receivers closed halfway");
            progress.line("[INFO] All receiver(s) was/were closed halfway.");
            progress.destroy();
        }
    }

    drop(outlets);
    registry.clear_established(&path);
}

enum Outcome {
    SourceEnded { bytes: u64 },
    SourceFailed(anyhow::Error),
    AllReceiversClosed,
}

/// Duplicate `source` into every outlet until it ends, it fails, or no
/// receiver is left.
async fn pump(mut source: Source, outlets: &mut Vec<Outlet>) -> Outcome {
    let mut transferred = 0u64;
    loop {
        let chunk = match source.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => return Outcome::SourceFailed(err),
            None => return Outcome::SourceEnded { bytes: transferred },
        };
        if chunk.is_empty() {
            continue;
        }
        transferred += chunk.len() as u64;

        let sends = outlets.iter().map(|tx| tx.send(Ok(chunk.clone())));
        let delivered = future::join_all(sends).await;
        // A failed send means that receiver's response body was dropped:
        // the client disconnected. Detach it and keep going.
        let mut delivered = delivered.into_iter();
        outlets.retain(|_| delivered.next().is_some_and(|sent| sent.is_ok()));
        if outlets.is_empty() {
            return Outcome::AllReceiversClosed;
        }
    }
}

/// Pick the byte stream receivers will see, plus its content metadata.
async fn select_source(
    body: RelayBody,
    content_type: Option<HeaderValue>,
    content_length: Option<u64>,
) -> Result<(Source, Option<HeaderValue>, Option<u64>), anyhow::Error> {
    match content_type {
        Some(ref ct) if multipart::is_multipart(Some(ct)) => {
            let part = multipart::first_part(body, ct).await?;
            Ok((part.stream, part.content_type, part.content_length))
        }
        _ => Ok((BodyStream(body).boxed(), content_type, content_length)),
    }
}

fn receiver_response(
    content_type: Option<&HeaderValue>,
    content_length: Option<u64>,
    body: RelayBody,
) -> GenericResponse {
    let mut response = Response::new(body);
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, content_type.clone());
    }
    if let Some(content_length) = content_length {
        response
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(content_length));
    }
    response
}

/// 200 whose body fails immediately; hyper aborts the connection.
fn aborted_response() -> GenericResponse {
    let (tx, body) = body::streamed(1);
    let _ = tx.try_send(Err(anyhow!("transfer aborted before any data")));
    Response::new(body)
}
