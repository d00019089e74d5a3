// Copyright 2024-2026 Pipeway Developers <dev@pipeway.dev>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`Server`]-related things

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::{service_fn, HttpService};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::nursery::Nursery;
use crate::response::GenericResponse;

/// Serves HTTP connections while allowing for graceful shutdowns.
///
/// Connections beyond `max_connections` get a minimal 503 without even being
/// parsed, so a flood of clients can't exhaust memory on request state.
pub struct Server {
    concurrent_connections: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Create a new [`Server`] handling at most `max_connections` at once.
    pub fn new(max_connections: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            concurrent_connections: Arc::new(Semaphore::new(max_connections)),
            shutdown,
        }
    }

    /// Serve incoming `connections` with `responder`.
    ///
    /// `connections` is a stream of accepted connection-like objects and
    /// `responder` maps HTTP requests to responses. Each connection runs in
    /// its own task. [`serve`](Self::serve) resolves once
    /// [`graceful_shutdown`](Self::graceful_shutdown) has been called (or
    /// `connections` is exhausted) and no connection is still in flight.
    ///
    /// # Cancel Safety
    ///
    /// Cancellation propagates to every connection handled by this call and
    /// blocks until they all terminate; canceling a connection abruptly
    /// closes it.
    pub async fn serve<P, C, R, F>(&self, connections: P, responder: R)
    where
        P: Stream<Item = std::io::Result<(C, SocketAddr)>>,
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        R: Fn(Request<Incoming>, SocketAddr) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = GenericResponse> + Send,
    {
        let respond = move |request: Request<_>, peer_addr| {
            let respond = responder.clone();
            async move {
                info!("Request: {} {}", request.method(), request.uri());
                let response = respond(request, peer_addr).await;
                info!("Response: {}", response.status());
                response
            }
        };

        // Created first so it is destroyed last; this receiver is what keeps
        // graceful_shutdown() from resolving early.
        let mut shutdown_receiver = self.shutdown.subscribe();
        let mut was_shutdown = pin!(shutdown_receiver.wait_for(|&done| done).map(|_| None));

        let mut nursery = Nursery::new();

        info!("Started serving");

        // scope is only to force `connections` to be dropped
        {
            let mut connections = pin!(connections);
            loop {
                let accepted = select! {
                    // biased so no connection is accepted after shutdown
                    biased;
                    x = &mut was_shutdown => x,
                    x = connections.next() => x,
                };
                let Some(accepted) = accepted else { break };
                let (connection, peer_addr) = match accepted {
                    Ok(a) => a,
                    Err(err) => {
                        error!("Couldn't accept connection: {err}");
                        continue;
                    }
                };

                let connection_span = info_span!("connection", addr = %peer_addr);
                async {
                    info!("Connected.");

                    let permit = match self.concurrent_connections.clone().try_acquire_owned() {
                        Ok(p) => p,
                        Err(_) => {
                            warn!("Too many connections; sending minimal 503.");
                            let _ = refuse_connection(connection).await;
                            return;
                        }
                    };

                    let respond = respond.clone();
                    let service =
                        service_fn(move |r| respond(r, peer_addr).map(Ok::<_, Infallible>));
                    let mut shutdown_receiver = self.shutdown.subscribe();
                    let connection_task = async move {
                        let _permit = permit;
                        let wants_shutdown = shutdown_receiver.wait_for(|&done| done);

                        let http_connection = http1::Builder::new()
                            // Keep serving the response after the request
                            // body ends; a relay sender uploads while its
                            // progress lines stream back.
                            .half_close(true)
                            .serve_connection(TokioIo::new(connection), service);

                        if let Err(err) =
                            with_graceful_shutdown(http_connection, wants_shutdown).await
                        {
                            error!("Error serving connection: {err}");
                        }
                        info!("Disconnected.");
                    };
                    tokio::task::spawn(
                        nursery
                            .chaperone(connection_task)
                            .instrument(Span::current()),
                    );
                }
                .instrument(connection_span.or_current())
                .await;
            }
        }

        nursery.finish().await;
        info!("Stopped serving");
    }

    /// Gracefully shut down the server.
    ///
    /// New [`serve`](Self::serve) calls resolve immediately; existing ones
    /// drop their connection stream, then wait for in-flight connections to
    /// finish their current request.
    ///
    /// # Cancel Safety
    ///
    /// Once polled, canceling does not stop the shutdown.
    pub async fn graceful_shutdown(&self) {
        self.shutdown.send_replace(true);
        // Resolves once every serve() call has dropped its receiver.
        self.shutdown.closed().await;
    }
}

/// Cheaply refuse an HTTP 1 connection with a minimal 503.
async fn refuse_connection(mut connection: impl AsyncWriteExt + Unpin) -> std::io::Result<()> {
    // Skip request parsing entirely; preemptively supplying a response is
    // allowed by RFC 9110 section 7.5. The write gets one second, so a slow
    // client can't pin this task either.
    let write_response = async {
        let msg = b"HTTP/1.1 503 Service Unavailable\r\n\
                    Content-Type: text/plain;charset=utf-8\r\n\
                    Content-Length: 19\r\n\
                    \r\n\
                    Relay is too busy.\n";
        connection.write_all(msg).await?;
        connection.shutdown().await
    };
    select! {
         result = write_response => result,
         _ = sleep(Duration::from_secs(1)) => Err(std::io::ErrorKind::TimedOut.into()),
    }
}

/// Gracefully terminate `connection` if `want_shutdown` resolves.
async fn with_graceful_shutdown<I, S, B>(
    connection: http1::Connection<I, S>,
    want_shutdown: impl Future,
) -> Result<(), hyper::Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + 'static,
    S: HttpService<Incoming, ResBody = B>,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: Body + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // Polling the connection and requesting graceful shutdown both need
    // exclusive access, hence the manual poll_fn.
    let mut connection = pin!(connection);
    let mut want_shutdown = pin!(want_shutdown.fuse());
    std::future::poll_fn(|cx| {
        if want_shutdown.as_mut().poll(cx).is_ready() {
            connection.as_mut().graceful_shutdown();
        }
        connection.as_mut().poll(cx)
    })
    .await
}
