// Worker process launcher
// Starts worker processes and turns their control output and exit into
// supervisor events

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

use crate::server::{ControlMessage, WorkerContext, CONTEXT_ENV};

/// How long control lines still buffered after a worker exits are read
const EXIT_FLUSH_TIMEOUT: Duration = Duration::from_millis(200);

/// Something that happened to one generation of a slot
#[derive(Debug)]
pub(crate) enum Event {
    Message {
        slot: usize,
        generation: u64,
        message: ControlMessage,
    },
    Exited {
        slot: usize,
        generation: u64,
        /// `None` when waiting on the process failed
        status: Option<ExitStatus>,
    },
}

/// Supervisor side of a running worker process
#[derive(Debug)]
pub(crate) struct ChildControl {
    pub pid: Option<u32>,
    stdin: Option<ChildStdin>,
    kill: Option<oneshot::Sender<()>>,
}

impl ChildControl {
    /// Control block without a process behind it
    #[cfg(test)]
    pub const fn detached(pid: Option<u32>) -> Self {
        Self {
            pid,
            stdin: None,
            kill: None,
        }
    }

    /// Ask the worker to drain by closing its stdin.
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            // Watcher already gone means the process was reaped
            let _ = kill.send(());
        }
    }
}

#[derive(Debug)]
pub(crate) struct Spawner {
    program: PathBuf,
    args: Vec<OsString>,
    template: WorkerContext,
    max_requests: u64,
    max_requests_jitter: u64,
    events: mpsc::UnboundedSender<Event>,
}

impl Spawner {
    pub fn new(
        program: PathBuf,
        args: Vec<OsString>,
        template: WorkerContext,
        max_requests_jitter: u64,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            program,
            args,
            max_requests: template.max_requests,
            template,
            max_requests_jitter,
            events,
        }
    }

    /// Launch generation `generation` of `slot`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, slot: usize, generation: u64) -> io::Result<ChildControl> {
        let context = WorkerContext {
            slot,
            generation,
            max_requests: self.request_quota(),
            ..self.template.clone()
        };
        let context = context
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(CONTEXT_ENV, context)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdout not captured"))?;
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(watch(
            child,
            stdout,
            kill_rx,
            slot,
            generation,
            self.events.clone(),
        ));

        tracing::debug!(worker = slot, generation, "spawned worker process {pid:?}");
        Ok(ChildControl {
            pid,
            stdin,
            kill: Some(kill_tx),
        })
    }

    /// Per-process request limit, spread so workers do not all recycle at once
    fn request_quota(&self) -> u64 {
        if self.max_requests == 0 || self.max_requests_jitter == 0 {
            return self.max_requests;
        }
        let jitter = rand::thread_rng().gen_range(0..=self.max_requests_jitter);
        self.max_requests.saturating_add(jitter)
    }
}

/// Forward a worker's control messages and report its exit.
///
/// Dropping the kill sender (the slot went away) kills the process too.
async fn watch(
    mut child: Child,
    stdout: ChildStdout,
    mut kill: oneshot::Receiver<()>,
    slot: usize,
    generation: u64,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut stdout_open = true;
    let mut kill_armed = true;

    let forward = |line: String| match ControlMessage::decode(&line) {
        Ok(message) => {
            let _ = events.send(Event::Message {
                slot,
                generation,
                message,
            });
        }
        Err(_) => tracing::debug!(worker = slot, "ignoring worker output: {line}"),
    };

    let status = loop {
        tokio::select! {
            line = lines.next_line(), if stdout_open => {
                match line {
                    Ok(Some(line)) => forward(line),
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        tracing::debug!(worker = slot, "control channel read failed: {e}");
                        stdout_open = false;
                    }
                }
            }

            status = child.wait() => break status,

            _ = &mut kill, if kill_armed => {
                kill_armed = false;
                if let Err(e) = child.start_kill() {
                    tracing::warn!(worker = slot, "failed to kill worker: {e}");
                }
            }
        }
    };

    if stdout_open {
        let flush = async {
            while let Ok(Some(line)) = lines.next_line().await {
                forward(line);
            }
        };
        let _ = tokio::time::timeout(EXIT_FLUSH_TIMEOUT, flush).await;
    }

    let status = match status {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::error!(worker = slot, "failed to wait for worker: {e}");
            None
        }
    };
    let _ = events.send(Event::Exited {
        slot,
        generation,
        status,
    });
}
