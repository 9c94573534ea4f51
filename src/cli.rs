// Command line entry point
// `serve` runs the supervisor; the hidden `serve worker` is what the
// supervisor executes for every worker process

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::app::AppRegistry;
use crate::config::{Config, Overrides};
use crate::error::{ConfigError, SupervisorError, WorkerError};
use crate::logger;
use crate::server::{process, signal, WorkerContext};
use crate::supervisor::Supervisor;

/// Startup failure: bind, spawn, runtime
pub const EXIT_STARTUP: u8 = 1;
pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_CRASH_LOOP: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "serve", author, version, about = "Pre-forking HTTP server", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Address to bind
    #[arg(short, long)]
    bind: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Number of worker processes
    #[arg(short, long)]
    workers: Option<usize>,

    /// Application to serve, `module:object`
    #[arg(short, long)]
    app: Option<String>,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Seconds workers get to finish in-flight requests on shutdown
    #[arg(long, value_name = "SECONDS")]
    graceful_timeout: Option<u64>,

    /// Seconds without a heartbeat before a worker is killed (0 disables)
    #[arg(short, long = "timeout", value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Idle keep-alive timeout in seconds (0 disables keep-alive)
    #[arg(long = "keep-alive", value_name = "SECONDS")]
    keep_alive: Option<u64>,

    /// Requests a worker serves before it is replaced (0 disables)
    #[arg(long)]
    max_requests: Option<u64>,

    /// Random extra requests added to `--max-requests` per worker
    #[arg(long)]
    max_requests_jitter: Option<u64>,

    #[arg(long)]
    log_level: Option<String>,

    /// Print the effective configuration as TOML and exit
    #[arg(long, conflicts_with = "check_config")]
    print_config: bool,

    /// Validate the configuration and application, then exit
    #[arg(long)]
    check_config: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Worker process entry, started by the supervisor
    #[command(hide = true)]
    Worker,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            bind: self.bind.clone(),
            port: self.port,
            workers: self.workers,
            app: self.app.clone(),
            graceful_timeout: self.graceful_timeout,
            worker_timeout: self.timeout,
            keep_alive_timeout: self.keep_alive,
            max_requests: self.max_requests,
            max_requests_jitter: self.max_requests_jitter,
            log_level: self.log_level.clone(),
        }
    }
}

/// Parse the command line and run, mapping every outcome to an exit code.
pub fn run(registry: &AppRegistry) -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Worker) => run_worker(registry),
        None => run_supervisor(&cli, registry),
    }
}

fn run_worker(registry: &AppRegistry) -> ExitCode {
    let context = match WorkerContext::from_env() {
        Ok(context) => context,
        Err(e) => {
            eprintln!("serve worker: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    logger::init(&context.logging);

    match process::run(context, registry) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("worker failed: {e}");
            match e {
                WorkerError::Config(_) | WorkerError::Context(_) => ExitCode::from(EXIT_CONFIG),
                WorkerError::Listen { .. } | WorkerError::Runtime(_) => ExitCode::from(EXIT_STARTUP),
            }
        }
    }
}

fn run_supervisor(cli: &Cli, registry: &AppRegistry) -> ExitCode {
    let config = match Config::load(cli.config.as_deref(), &cli.overrides()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if cli.print_config {
        return match toml::to_string_pretty(&config) {
            Ok(text) => {
                print!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: failed to render configuration: {e}");
                ExitCode::from(EXIT_CONFIG)
            }
        };
    }

    logger::init(&config.logging);

    let supervisor = match prepare(&config, registry) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if cli.check_config {
        let spec = supervisor.spec();
        println!(
            "configuration ok: {} workers serving {} on {}",
            spec.count, spec.app, spec.addr
        );
        return ExitCode::SUCCESS;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("failed to start runtime: {e}");
            return ExitCode::from(EXIT_STARTUP);
        }
    };
    runtime.block_on(supervise(supervisor, &config))
}

/// Build the supervisor, checking the application is known to this binary.
fn prepare(config: &Config, registry: &AppRegistry) -> Result<Supervisor, ConfigError> {
    let supervisor = Supervisor::from_config(config)?;
    registry.resolve(&supervisor.spec().app)?;
    Ok(supervisor)
}

async fn supervise(supervisor: Supervisor, config: &Config) -> ExitCode {
    let app = supervisor.spec().app.to_string();
    let pool = match supervisor.start().await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(EXIT_STARTUP);
        }
    };
    logger::log_server_start(&pool.local_addr(), &app, config);

    if let Err(e) = signal::spawn_supervisor_signals(pool.handle(), config.supervisor.graceful_timeout()) {
        tracing::error!("failed to install signal handlers: {e}");
        pool.shutdown(Duration::ZERO).await;
        return ExitCode::from(EXIT_STARTUP);
    }

    match pool.monitor().await {
        Ok(report) => {
            tracing::info!(
                "shut down: {} requests served, {} restarts, {} workers killed after the grace period",
                report.served(),
                report.restarts(),
                report.forced_kills
            );
            ExitCode::SUCCESS
        }
        Err(e @ SupervisorError::CrashLoop { .. }) => {
            tracing::error!("{e}");
            ExitCode::from(EXIT_CRASH_LOOP)
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(EXIT_STARTUP)
        }
    }
}
