// Copyright 2024-2026 Pipeway Developers <dev@pipeway.dev>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP front: request routing and server lifecycle

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response};
use tokio::net::TcpListener;
use tracing::info;

use minhttp::response::{text, GenericResponse, StatusCode};
use minhttp::signal::{fast_shutdown_requested, graceful_shutdown_requested};
use minhttp::Server;

use crate::body::{self, RelayBody};
use crate::pipe::{self, CloseWatcher, Progress, ReceiverRegistered, SenderRegistered};
use crate::registry::Registry;
use crate::route;
use crate::transfer;
use crate::{pages, Opts};

/// Run the relay until it is signaled to shut down.
///
/// The first `SIGINT` drains gracefully: no new connections, in-flight
/// rendezvous and transfers run until their connections finish. A second
/// `SIGINT` or a `SIGTERM` tears everything down at once, which also
/// destroys every in-flight transfer's connections.
pub async fn run(opts: Opts) -> anyhow::Result<()> {
    let registry = Registry::new();
    let fallback_host: Arc<str> = format!("{}:{}", opts.host, opts.port).into();

    let server = Server::new(opts.max_clients);
    let address = SocketAddr::from((opts.host, opts.port));
    info!("Listening on {address}");
    let listener = TcpListener::bind(address).await?;
    let connections = futures::stream::unfold(listener, |listener| async {
        Some((listener.accept().await, listener))
    });

    let run = server.serve(connections, move |request, _peer| {
        let registry = registry.clone();
        let fallback_host = fallback_host.clone();
        async move { respond(&registry, &fallback_host, request).await }
    });

    let graceful_shutdown = async {
        graceful_shutdown_requested().await;
        info!("Graceful shutdown requested...");
        server.graceful_shutdown().await;
    };

    tokio::select! {
        biased;
        _ = fast_shutdown_requested() => info!("Fast shutdown requested..."),
        _ = async { tokio::join!(run, graceful_shutdown) } => {}
    };

    Ok(())
}

/// Adapt a hyper request to the type-erased body the engine works on.
pub async fn respond(
    registry: &Arc<Registry>,
    fallback_host: &str,
    request: Request<Incoming>,
) -> GenericResponse {
    let (parts, body) = request.into_parts();
    let body = body.map_err(anyhow::Error::from).boxed();
    handle(registry, fallback_host, Request::from_parts(parts, body)).await
}

/// Route one request: reserved GETs go to the static pages, everything else
/// is a rendezvous participant.
pub async fn handle(
    registry: &Arc<Registry>,
    fallback_host: &str,
    request: Request<RelayBody>,
) -> GenericResponse {
    let path = route::canonical_path(request.uri().path());
    let requested = route::receiver_count(request.uri().query());

    match *request.method() {
        Method::GET => match path.as_str() {
            "/" => pages::index(),
            "/version" => pages::version(),
            "/help" => pages::help(request.headers(), fallback_host),
            _ => receive(registry, &path, requested).await,
        },
        Method::POST | Method::PUT => send(registry, &path, requested, request).await,
        ref method => text(
            StatusCode::BAD_REQUEST,
            format!("Error: Unsupported method: {method}\n"),
        ),
    }
}

/// Register a sender and answer with its streaming progress response.
async fn send(
    registry: &Arc<Registry>,
    path: &str,
    requested: i64,
    request: Request<RelayBody>,
) -> GenericResponse {
    let content_length = request.body().size_hint().exact();
    let content_type = request.headers().get(CONTENT_TYPE).cloned();
    let body = request.into_body();

    let (progress_tx, progress_body) = body::unbounded();
    let registered = pipe::register_sender(
        registry,
        path,
        requested,
        body,
        content_type,
        content_length,
        Progress::new(progress_tx),
    );

    match registered {
        Err(reject) => reject.into_response(),
        Ok(SenderRegistered::Established(job, watcher)) => {
            tokio::spawn(transfer::run(registry.clone(), job));
            sender_response(progress_body, watcher)
        }
        Ok(SenderRegistered::Waiting(watcher)) => sender_response(progress_body, watcher),
    }
}

/// The sender's response: progress lines as they happen. The close-watcher
/// rides on the body so that hyper dropping the response (client gone)
/// deregisters a still-waiting sender.
fn sender_response(progress_body: RelayBody, watcher: CloseWatcher) -> GenericResponse {
    let mut response = Response::new(body::guarded(progress_body, watcher));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Register a receiver and wait for the transfer to open its response.
///
/// Nothing is written to the receiver until establishment; if this future is
/// dropped while waiting (client gone), the close-watcher held across the
/// await deregisters the receiver.
async fn receive(registry: &Arc<Registry>, path: &str, requested: i64) -> GenericResponse {
    match pipe::register_receiver(registry, path, requested) {
        Err(reject) => reject.into_response(),
        Ok(ReceiverRegistered::Established(job, response, _watcher)) => {
            tokio::spawn(transfer::run(registry.clone(), job));
            await_transfer(response).await
        }
        Ok(ReceiverRegistered::Waiting(response, watcher)) => {
            let response = await_transfer(response).await;
            drop(watcher); // revoked at establishment; no-op by now
            response
        }
    }
}

async fn await_transfer(
    response: tokio::sync::oneshot::Receiver<GenericResponse>,
) -> GenericResponse {
    match response.await {
        Ok(response) => response,
        // The transfer engine dropped the reply channel without answering.
        // Can't happen outside a bug, but a 500 beats a panic in a relay.
        Err(_) => text(StatusCode::INTERNAL_SERVER_ERROR, "internal error\n"),
    }
}
