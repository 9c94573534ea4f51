// Supervisor integration tests
// Workers are real `serve worker` processes

use std::net::SocketAddr;
use std::time::Duration;

use prefork::config::Config;
use prefork::supervisor::{PoolPhase, PoolStatus, RunningPool, Supervisor, WorkerState};
use prefork::{StartupError, SupervisorError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const SERVE: &str = env!("CARGO_BIN_EXE_serve");
const GRACE: Duration = Duration::from_secs(5);

fn config(workers: usize) -> Config {
    let mut config = Config::default();
    config.server.bind = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.workers = workers;
    config.server.app = Some("builtin:echo".to_string());
    config.supervisor.graceful_timeout = 5;
    config.supervisor.heartbeat_interval_ms = 200;
    config.logging.access_log = false;
    config.logging.level = "warn".to_string();
    config
}

fn supervisor(config: &Config) -> Supervisor {
    Supervisor::from_config(config)
        .unwrap()
        .with_program(SERVE, ["worker"])
}

async fn wait_until(pool: &RunningPool, mut done: impl FnMut(&PoolStatus) -> bool) -> PoolStatus {
    let mut status = pool.handle().subscribe();
    let result = tokio::time::timeout(Duration::from_secs(15), status.wait_for(|s| done(s))).await;
    match result {
        Ok(Ok(status)) => (*status).clone(),
        Ok(Err(_)) => panic!("monitor stopped early"),
        Err(_) => panic!("timed out, last status: {:?}", pool.status()),
    }
}

async fn echo(addr: SocketAddr, body: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "POST /echo HTTP/1.1\r\nHost: test\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test(flavor = "multi_thread")]
async fn every_worker_reaches_running() {
    let pool = supervisor(&config(4)).start().await.unwrap();
    assert_ne!(pool.local_addr().port(), 0);

    let status = wait_until(&pool, |s| s.running() == 4).await;
    assert_eq!(status.workers.len(), 4);
    assert!(status.workers.iter().all(|w| w.pid.is_some()));

    assert!(pool.shutdown(GRACE).await);
    let report = pool.monitor().await.unwrap();
    assert_eq!(report.restarts(), 0);
    assert_eq!(report.forced_kills, 0);
    assert!(report.workers.iter().all(|w| w.state == WorkerState::Dead));
}

#[tokio::test(flavor = "multi_thread")]
async fn killed_worker_is_replaced() {
    let pool = supervisor(&config(2)).start().await.unwrap();
    let status = wait_until(&pool, |s| s.running() == 2).await;
    let victim = status.workers[0].pid.unwrap();

    let killed = std::process::Command::new("kill")
        .args(["-9", &victim.to_string()])
        .status()
        .unwrap();
    assert!(killed.success());

    let status = wait_until(&pool, |s| s.running() == 2 && s.workers[0].generation == 2).await;
    assert_eq!(status.workers[0].restarts, 1);
    assert_eq!(status.workers[0].crashes, 1);
    assert_ne!(status.workers[0].pid, Some(victim));
    assert_eq!(status.workers[1].generation, 1);

    pool.shutdown(GRACE).await;
    pool.monitor().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_shutdowns_drain_once() {
    let pool = supervisor(&config(2)).start().await.unwrap();
    wait_until(&pool, |s| s.running() == 2).await;

    let (a, b) = (pool.handle(), pool.handle());
    let (first, second) = tokio::join!(a.shutdown(GRACE), b.shutdown(GRACE));
    assert!(first ^ second, "exactly one caller starts the drain");

    assert_eq!(a.status().phase, PoolPhase::Stopped);
    // Later calls return immediately
    assert!(!pool.shutdown(GRACE).await);
    pool.monitor().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn workers_outliving_the_grace_period_are_killed() {
    // `sleep` ignores the closed stdin, so only the kill stops it
    let pool = Supervisor::from_config(&config(2))
        .unwrap()
        .with_program("sleep", ["30"])
        .start()
        .await
        .unwrap();
    wait_until(&pool, |s| s.workers.iter().all(|w| w.pid.is_some())).await;

    let started = std::time::Instant::now();
    assert!(pool.shutdown(Duration::from_millis(300)).await);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");

    let report = pool.monitor().await.unwrap();
    assert_eq!(report.forced_kills, 2);
    assert!(report.workers.iter().all(|w| w.crashes == 0));
    assert!(report.workers.iter().all(|w| w.state == WorkerState::Dead));
}

#[tokio::test(flavor = "multi_thread")]
async fn occupied_port_fails_before_spawning() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = config(2);
    config.server.port = occupied.local_addr().unwrap().port();

    match supervisor(&config).start().await {
        Err(StartupError::Bind(err)) => assert_eq!(err.addr, occupied.local_addr().unwrap()),
        Err(other) => panic!("expected a bind error, got {other}"),
        Ok(_) => panic!("pool started on an occupied port"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_workers_is_rejected() {
    assert!(matches!(
        supervisor(&config(0)).start().await,
        Err(StartupError::NoWorkers)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn hundred_concurrent_requests_without_restarts() {
    let pool = supervisor(&config(4)).start().await.unwrap();
    wait_until(&pool, |s| s.running() == 4).await;
    let addr = pool.local_addr();

    let requests: Vec<_> = (0..100)
        .map(|i| tokio::spawn(async move { (i, echo(addr, &format!("request-{i}")).await) }))
        .collect();
    for request in requests {
        let (i, response) = request.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with(&format!("request-{i}")));
    }

    let status = pool.status();
    assert_eq!(status.running(), 4);
    assert_eq!(status.restarts(), 0);

    pool.shutdown(GRACE).await;
    pool.monitor().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_that_cannot_boot_ends_in_crash_loop() {
    let mut config = config(1);
    config.supervisor.crash_loop_limit = 3;
    config.supervisor.restart_backoff_ms = 10;

    let pool = Supervisor::from_config(&config)
        .unwrap()
        .with_program("false", Vec::<String>::new())
        .start()
        .await
        .unwrap();

    match pool.monitor().await {
        Err(SupervisorError::CrashLoop { slot, crashes, .. }) => {
            assert_eq!(slot, 0);
            assert_eq!(crashes, 3);
        }
        other => panic!("expected a crash loop, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn recycled_worker_is_not_a_crash() {
    let mut config = config(1);
    config.performance.max_requests = 3;

    let pool = supervisor(&config).start().await.unwrap();
    wait_until(&pool, |s| s.running() == 1).await;

    for i in 0..3 {
        let response = echo(pool.local_addr(), &format!("r{i}")).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    }

    let status = wait_until(&pool, |s| s.running() == 1 && s.workers[0].generation == 2).await;
    assert_eq!(status.crashes(), 0);
    assert_eq!(status.workers[0].restarts, 1);
    assert_eq!(status.workers[0].served, 3);

    pool.shutdown(GRACE).await;
    pool.monitor().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_replaces_every_worker() {
    let pool = supervisor(&config(2)).start().await.unwrap();
    wait_until(&pool, |s| s.running() == 2).await;

    pool.handle().reload();
    let status = wait_until(&pool, |s| {
        s.running() == 2 && s.workers.iter().all(|w| w.generation == 2)
    })
    .await;
    assert_eq!(status.crashes(), 0);

    let response = echo(pool.local_addr(), "after reload").await;
    assert!(response.ends_with("after reload"));

    pool.shutdown(GRACE).await;
    pool.monitor().await.unwrap();
}
