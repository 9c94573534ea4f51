// Worker event loop
// Accepts connections on this process's listener and serves them on a
// single-threaded `LocalSet` until told to stop or recycled

use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};

use super::connection::accept_connection;
use super::control::{ControlMessage, ControlSender};
use crate::app::Handler;
use crate::config::{LoggingConfig, PerformanceConfig};

/// Pause after a failed `accept`, e.g. when out of file descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Header read timeout when keep-alive is off
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a worker left its accept loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Asked to stop by the supervisor or a signal
    Stopped,
    /// Served its request quota and asks to be replaced
    MaxRequests,
}

/// Connection handling knobs of one worker
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Idle keep-alive timeout, `None` closes after each response
    pub keep_alive: Option<Duration>,
    pub connection_timeout: Duration,
    pub max_connections: Option<usize>,
    pub max_body_size: usize,
    /// Requests served before recycling, `None` never recycles
    pub max_requests: Option<u64>,
    /// How long queued connections are still accepted after stopping
    pub backlog_drain: Duration,
    pub access_log: bool,
    pub access_log_format: String,
    pub server_name: String,
}

impl WorkerOptions {
    /// `max_requests` is the effective limit (jitter already applied), 0 = unlimited.
    pub fn from_config(performance: &PerformanceConfig, logging: &LoggingConfig, max_requests: u64) -> Self {
        Self {
            keep_alive: match performance.keep_alive_timeout {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            connection_timeout: Duration::from_secs(performance.connection_timeout),
            max_connections: performance
                .max_connections
                .map(|n| usize::try_from(n).unwrap_or(usize::MAX)),
            max_body_size: usize::try_from(performance.max_body_size).unwrap_or(usize::MAX),
            max_requests: (max_requests > 0).then_some(max_requests),
            backlog_drain: Duration::from_millis(performance.backlog_drain_ms),
            access_log: logging.access_log,
            access_log_format: logging.access_log_format.clone(),
            server_name: performance.server_name.clone(),
        }
    }
}

impl WorkerOptions {
    /// How long a client may take to send request headers
    pub fn header_read_timeout(&self) -> Duration {
        self.keep_alive.unwrap_or(HEADER_READ_TIMEOUT)
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(&PerformanceConfig::default(), &LoggingConfig::default(), 0)
    }
}

/// Counters reported to the supervisor in heartbeats
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub(crate) served: AtomicU64,
    pub(crate) active: AtomicUsize,
    idle: Notify,
    recycle: Notify,
}

impl WorkerStats {
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    /// Connections currently open
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn release(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_one();
        }
    }

    pub(crate) fn record_request(&self, max_requests: Option<u64>) {
        let served = self.served.fetch_add(1, Ordering::SeqCst) + 1;
        if max_requests.is_some_and(|max| served >= max) {
            self.recycle.notify_one();
        }
    }

    async fn wait_idle(&self) {
        while self.active() > 0 {
            self.idle.notified().await;
        }
    }
}

/// State shared by the accept loop and every connection task
pub(crate) struct WorkerShared {
    pub slot: usize,
    pub handler: Rc<dyn Handler>,
    pub options: WorkerOptions,
    pub stats: Arc<WorkerStats>,
    /// Flipped to `true` once the listener is closed; connections finish
    /// their current request and close
    pub drain: watch::Sender<bool>,
}

pub struct Worker {
    shared: Rc<WorkerShared>,
}

impl Worker {
    pub fn new(slot: usize, handler: Rc<dyn Handler>, options: WorkerOptions) -> Self {
        Self {
            shared: Rc::new(WorkerShared {
                slot,
                handler,
                options,
                stats: Arc::new(WorkerStats::default()),
                drain: watch::channel(false).0,
            }),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Serve `listener` until `stop` turns `true` or the request quota is
    /// used up, then drain.
    ///
    /// Must run inside a `LocalSet`. Returns once every connection accepted
    /// by this worker has been closed.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut stop: watch::Receiver<bool>,
        control: &ControlSender,
    ) -> ExitReason {
        let slot = self.shared.slot;
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(worker = slot, "accepting connections on {addr}");
        }

        let reason = self.accept_loop(&listener, &mut stop).await;
        control.send(ControlMessage::Exiting { reason });
        tracing::info!(
            worker = slot,
            ?reason,
            "stopping, {} connections still open",
            self.shared.stats.active()
        );

        self.drain_backlog(listener).await;
        self.shared.drain.send_replace(true);
        self.shared.stats.wait_idle().await;

        tracing::info!(worker = slot, served = self.shared.stats.served(), "worker drained");
        reason
    }

    async fn accept_loop(&self, listener: &TcpListener, stop: &mut watch::Receiver<bool>) -> ExitReason {
        loop {
            if *stop.borrow_and_update() {
                return ExitReason::Stopped;
            }

            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => accept_connection(stream, peer_addr, &self.shared),
                        Err(e) => {
                            tracing::error!(worker = self.shared.slot, "failed to accept connection: {e}");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }

                changed = stop.changed() => {
                    // Every stop source is gone
                    if changed.is_err() {
                        return ExitReason::Stopped;
                    }
                }

                () = self.shared.stats.recycle.notified() => {
                    return ExitReason::MaxRequests;
                }
            }
        }
    }

    /// Take over connections already queued in the backlog, then close the
    /// listener so new connections go to the other workers.
    async fn drain_backlog(&self, listener: TcpListener) {
        let window = self.shared.options.backlog_drain;
        let deadline = tokio::time::Instant::now() + window;
        let mut drained = 0usize;

        while !window.is_zero() {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            drained += 1;
                            accept_connection(stream, peer_addr, &self.shared);
                        }
                        Err(e) => {
                            tracing::debug!(worker = self.shared.slot, "backlog drain stopped: {e}");
                            break;
                        }
                    }
                }

                () = tokio::time::sleep_until(deadline) => break,
            }
        }

        drop(listener);
        tracing::debug!(
            worker = self.shared.slot,
            "listener closed after taking {drained} queued connections"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use crate::app::response::build_text_response;
    use crate::app::{Request, RequestError};
    use http::StatusCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::LocalSet;

    fn test_handler() -> Rc<dyn Handler> {
        Rc::new(|req: Request| async move {
            match req.uri().path() {
                "/panic" => panic!("handler blew up"),
                "/slow" => {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok::<_, RequestError>(build_text_response(StatusCode::OK, "slow"))
                }
                _ => Ok(build_text_response(StatusCode::OK, "ok")),
            }
        })
    }

    fn quiet_options() -> WorkerOptions {
        WorkerOptions {
            access_log: false,
            ..WorkerOptions::default()
        }
    }

    async fn send(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        send(
            addr,
            &format!("GET {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n"),
        )
        .await
    }

    /// Read one response off a connection that stays open.
    async fn read_response(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed mid-response");
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf).into_owned();
            if let Some((head, body)) = text.split_once("\r\n\r\n") {
                let length = head.lines().find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                });
                if length.is_some_and(|len| body.len() >= len) {
                    return text;
                }
            }
        }
    }

    struct Running {
        addr: SocketAddr,
        stop: watch::Sender<bool>,
        stats: Arc<WorkerStats>,
        task: tokio::task::JoinHandle<ExitReason>,
    }

    async fn start(options: WorkerOptions) -> Running {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stop_rx) = watch::channel(false);
        let worker = Worker::new(0, test_handler(), options);
        let stats = worker.stats();
        let task = tokio::task::spawn_local(async move {
            worker
                .serve(listener, stop_rx, &ControlSender::detached())
                .await
        });
        Running {
            addr,
            stop,
            stats,
            task,
        }
    }

    #[tokio::test]
    async fn panicking_request_does_not_affect_others() {
        LocalSet::new()
            .run_until(async {
                let worker = start(quiet_options()).await;

                let slow = tokio::task::spawn_local(get(worker.addr, "/slow"));
                let panicked = get(worker.addr, "/panic").await;
                assert!(panicked.starts_with("HTTP/1.1 500"), "{panicked}");

                let slow = slow.await.unwrap();
                assert!(slow.starts_with("HTTP/1.1 200"), "{slow}");
                assert!(slow.ends_with("slow"));

                let after = get(worker.addr, "/").await;
                assert!(after.starts_with("HTTP/1.1 200"));

                worker.stop.send(true).unwrap();
                assert_eq!(worker.task.await.unwrap(), ExitReason::Stopped);
                assert_eq!(worker.stats.served(), 3);
            })
            .await;
    }

    #[tokio::test]
    async fn graceful_stop_finishes_in_flight_request() {
        LocalSet::new()
            .run_until(async {
                let worker = start(quiet_options()).await;

                let slow = tokio::task::spawn_local(get(worker.addr, "/slow"));
                tokio::time::sleep(Duration::from_millis(50)).await;
                assert_eq!(worker.stats.active(), 1);

                worker.stop.send(true).unwrap();
                let slow = slow.await.unwrap();
                assert!(slow.starts_with("HTTP/1.1 200"), "{slow}");

                assert_eq!(worker.task.await.unwrap(), ExitReason::Stopped);
                assert_eq!(worker.stats.active(), 0);
                assert!(TcpStream::connect(worker.addr).await.is_err());
            })
            .await;
    }

    #[tokio::test]
    async fn worker_recycles_after_max_requests() {
        LocalSet::new()
            .run_until(async {
                let worker = start(WorkerOptions {
                    max_requests: Some(2),
                    ..quiet_options()
                })
                .await;

                assert!(get(worker.addr, "/").await.starts_with("HTTP/1.1 200"));
                assert!(get(worker.addr, "/").await.starts_with("HTTP/1.1 200"));

                assert_eq!(worker.task.await.unwrap(), ExitReason::MaxRequests);
                assert_eq!(worker.stats.served(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_with_413() {
        LocalSet::new()
            .run_until(async {
                let worker = start(WorkerOptions {
                    max_body_size: 8,
                    ..quiet_options()
                })
                .await;

                let response = send(
                    worker.addr,
                    "POST / HTTP/1.1\r\nHost: test\r\nConnection: close\r\nContent-Length: 16\r\n\r\n0123456789abcdef",
                )
                .await;
                assert!(response.starts_with("HTTP/1.1 413"), "{response}");

                worker.stop.send(true).unwrap();
                worker.task.await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn responses_carry_server_header() {
        LocalSet::new()
            .run_until(async {
                let worker = start(WorkerOptions {
                    server_name: "prefork-test".to_string(),
                    ..quiet_options()
                })
                .await;

                let response = get(worker.addr, "/").await.to_lowercase();
                assert!(response.contains("server: prefork-test"), "{response}");

                worker.stop.send(true).unwrap();
                worker.task.await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn keep_alive_connection_serves_several_requests() {
        LocalSet::new()
            .run_until(async {
                let worker = start(quiet_options()).await;

                let mut stream = TcpStream::connect(worker.addr).await.unwrap();
                for _ in 0..2 {
                    stream
                        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n")
                        .await
                        .unwrap();
                    let response = read_response(&mut stream).await;
                    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
                    assert!(response.ends_with("ok"));
                }
                assert_eq!(worker.stats.served(), 2);
                assert_eq!(worker.stats.active(), 1);

                // The idle connection is closed as soon as the backlog window ends
                worker.stop.send(true).unwrap();
                let reason = tokio::time::timeout(Duration::from_secs(2), worker.task)
                    .await
                    .expect("idle keep-alive connection held up the drain")
                    .unwrap();
                assert_eq!(reason, ExitReason::Stopped);

                let mut rest = Vec::new();
                assert_eq!(stream.read_to_end(&mut rest).await.unwrap(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn silent_connection_does_not_hold_up_drain() {
        LocalSet::new()
            .run_until(async {
                let worker = start(WorkerOptions {
                    keep_alive: None,
                    ..quiet_options()
                })
                .await;

                assert!(get(worker.addr, "/").await.starts_with("HTTP/1.1 200"));

                let mut silent = TcpStream::connect(worker.addr).await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                assert_eq!(worker.stats.active(), 1);

                worker.stop.send(true).unwrap();
                let reason = tokio::time::timeout(Duration::from_secs(2), worker.task)
                    .await
                    .expect("silent connection held up the drain")
                    .unwrap();
                assert_eq!(reason, ExitReason::Stopped);
                assert_eq!(worker.stats.active(), 0);

                let mut rest = Vec::new();
                assert_eq!(silent.read_to_end(&mut rest).await.unwrap(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn connection_accepted_before_drain_may_still_send_its_request() {
        LocalSet::new()
            .run_until(async {
                let worker = start(WorkerOptions {
                    backlog_drain: Duration::from_millis(300),
                    ..quiet_options()
                })
                .await;

                let mut late = TcpStream::connect(worker.addr).await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                worker.stop.send(true).unwrap();
                // Past the backlog window, inside the first-request window
                tokio::time::sleep(Duration::from_millis(400)).await;

                late.write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n")
                    .await
                    .unwrap();
                let response = read_response(&mut late).await;
                assert!(response.starts_with("HTTP/1.1 200"), "{response}");

                assert_eq!(worker.task.await.unwrap(), ExitReason::Stopped);
            })
            .await;
    }

    #[test]
    fn options_follow_configuration() {
        let performance = PerformanceConfig {
            keep_alive_timeout: 0,
            max_connections: None,
            ..PerformanceConfig::default()
        };
        let options = WorkerOptions::from_config(&performance, &LoggingConfig::default(), 0);
        assert_eq!(options.keep_alive, None);
        assert_eq!(options.header_read_timeout(), HEADER_READ_TIMEOUT);
        assert_eq!(options.max_connections, None);
        assert_eq!(options.max_requests, None);

        let options = WorkerOptions::from_config(&PerformanceConfig::default(), &LoggingConfig::default(), 250);
        assert_eq!(options.keep_alive, Some(Duration::from_secs(5)));
        assert_eq!(options.header_read_timeout(), Duration::from_secs(5));
        assert_eq!(options.max_requests, Some(250));
    }
}
