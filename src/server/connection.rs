// Connection handling module
// Serves one accepted TCP connection on the worker's event loop

use std::any::Any;
use std::cell::Cell;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use futures::FutureExt;
use http::header::{HeaderName, HeaderValue, REFERER, SERVER, USER_AGENT};
use http::Version;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body as _, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use super::worker::WorkerShared;
use crate::app::{Handler, Request, RequestError, Response};
use crate::logger::{self, AccessLogEntry};

/// Accept a connection, enforcing the per-worker connection limit.
pub(crate) fn accept_connection(stream: TcpStream, peer_addr: SocketAddr, shared: &Rc<WorkerShared>) {
    // Increment counter first, then check limit
    let prev_count = shared.stats.active.fetch_add(1, Ordering::SeqCst);

    if let Some(max_conn) = shared.options.max_connections {
        if prev_count >= max_conn {
            shared.stats.release();
            tracing::warn!(
                worker = shared.slot,
                "max connections reached: {prev_count}/{max_conn}, rejecting {peer_addr}"
            );
            drop(stream);
            return;
        }
    }

    tracing::trace!(worker = shared.slot, "accepted connection from {peer_addr}");
    handle_connection(stream, peer_addr, Rc::clone(shared));
}

/// Per-connection bookkeeping shared with the request service
#[derive(Default)]
struct ConnectionState {
    requests: Cell<u64>,
    request_started: Notify,
}

/// Serve a single connection in a task on the current `LocalSet`.
///
/// The connection ends when the client closes it, when keep-alive expires,
/// when `connection_timeout` elapses, or after the worker starts draining.
fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, shared: Rc<WorkerShared>) {
    tokio::task::spawn_local(async move {
        let io = TokioIo::new(stream);
        let state = Rc::new(ConnectionState::default());

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .keep_alive(shared.options.keep_alive.is_some())
            .header_read_timeout(shared.options.header_read_timeout());

        let service_shared = Rc::clone(&shared);
        let service_state = Rc::clone(&state);
        let conn = builder.serve_connection(
            io,
            service_fn(move |req| {
                let shared = Rc::clone(&service_shared);
                service_state.requests.set(service_state.requests.get() + 1);
                service_state.request_started.notify_one();
                async move { Ok::<_, Infallible>(dispatch(req, peer_addr, &shared).await) }
            }),
        );
        let mut conn = std::pin::pin!(conn);

        let mut drain = shared.drain.subscribe();
        let mut drain_requested = *drain.borrow_and_update();
        let mut shutdown_sent = false;
        let deadline = tokio::time::sleep(shared.options.connection_timeout);
        tokio::pin!(deadline);
        // Re-armed when draining starts
        let first_request = tokio::time::sleep(shared.options.backlog_drain);
        tokio::pin!(first_request);

        loop {
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(err) = result {
                        tracing::debug!(worker = shared.slot, "connection from {peer_addr} ended: {err}");
                    }
                    break;
                }
                _ = drain.changed(), if !drain_requested => {
                    drain_requested = true;
                    if state.requests.get() > 0 {
                        conn.as_mut().graceful_shutdown();
                        shutdown_sent = true;
                    } else {
                        first_request
                            .as_mut()
                            .reset(tokio::time::Instant::now() + shared.options.backlog_drain);
                    }
                }
                // A connection that has not sent its first request yet gets the
                // backlog window to send it, so a queued request is still answered
                () = state.request_started.notified(), if drain_requested && !shutdown_sent => {
                    conn.as_mut().graceful_shutdown();
                    shutdown_sent = true;
                }
                () = &mut first_request, if drain_requested && !shutdown_sent => {
                    tracing::debug!(worker = shared.slot, "closing silent connection from {peer_addr}");
                    conn.as_mut().graceful_shutdown();
                    shutdown_sent = true;
                }
                () = &mut deadline => {
                    tracing::warn!(
                        worker = shared.slot,
                        "connection from {peer_addr} timed out after {:?}",
                        shared.options.connection_timeout
                    );
                    break;
                }
            }
        }

        shared.stats.release();
    });
}

/// Collect the body, run the handler and decorate the response.
async fn dispatch(req: http::Request<Incoming>, peer_addr: SocketAddr, shared: &WorkerShared) -> Response {
    let started = Instant::now();
    let entry = shared
        .options
        .access_log
        .then(|| access_entry(&req, peer_addr, shared.slot));

    let mut response = match collect_request(req, shared.options.max_body_size).await {
        Ok(request) => call_handler(&*shared.handler, request, shared.slot).await,
        Err(err) => {
            tracing::debug!(worker = shared.slot, "rejecting request from {peer_addr}: {err}");
            err.into_response()
        }
    };

    if !response.headers().contains_key(SERVER) {
        if let Ok(value) = HeaderValue::from_str(&shared.options.server_name) {
            response.headers_mut().insert(SERVER, value);
        }
    }

    shared.stats.record_request(shared.options.max_requests);

    if let Some(mut entry) = entry {
        entry.status = response.status().as_u16();
        entry.body_bytes = response
            .body()
            .size_hint()
            .exact()
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0);
        entry.request_time_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        logger::log_access(&entry, &shared.options.access_log_format);
    }

    response
}

async fn collect_request(req: http::Request<Incoming>, limit: usize) -> Result<Request, RequestError> {
    let (parts, body) = req.into_parts();
    let body = Limited::new(body, limit)
        .collect()
        .await
        .map_err(|e| {
            if e.is::<LengthLimitError>() {
                RequestError::BodyTooLarge { limit }
            } else {
                RequestError::Body(e.to_string())
            }
        })?
        .to_bytes();
    Ok(Request::from_parts(parts, body))
}

/// Run the handler, turning errors and panics into responses for this
/// request only.
async fn call_handler(handler: &dyn Handler, request: Request, slot: usize) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match AssertUnwindSafe(async { handler.call(request).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            tracing::warn!(worker = slot, "{method} {path} failed: {err}");
            err.into_response()
        }
        Err(panic) => {
            let err = RequestError::Panic(panic_message(panic.as_ref()));
            tracing::error!(worker = slot, "{method} {path}: {err}");
            err.into_response()
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn access_entry(req: &http::Request<Incoming>, peer_addr: SocketAddr, slot: usize) -> AccessLogEntry {
    let header = |name: HeaderName| {
        req.headers()
            .get(name)
            .and_then(|v: &HeaderValue| v.to_str().ok())
            .map(ToString::to_string)
    };

    let mut entry = AccessLogEntry::new(
        peer_addr.to_string(),
        req.method().to_string(),
        req.uri().path().to_string(),
    );
    entry.query = req.uri().query().map(ToString::to_string);
    entry.http_version = match req.version() {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2",
        _ => "1.1",
    }
    .to_string();
    entry.referer = header(REFERER);
    entry.user_agent = header(USER_AGENT);
    entry.worker = slot;
    entry
}
