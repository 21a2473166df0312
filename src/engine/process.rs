//! Worker processes for process isolation

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// How to launch one worker. `worker --rule <id>` is appended per rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// The running binary, which carries the hidden `worker` subcommand
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("Cannot locate the running executable")?;
        Ok(Self::new(program))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    fn command(&self, rule_id: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(["worker", "--rule", rule_id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

#[derive(Debug)]
pub enum ChildOutcome {
    Finished {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    TimedOut,
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buffer);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

/// Poll until the child exits or `deadline` passes. No deadline waits forever.
fn wait_until(child: &mut Child, deadline: Option<Instant>) -> Result<Option<ExitStatus>> {
    let mut pause = Duration::from_millis(2);
    loop {
        if let Some(status) = child.try_wait().context("Failed to poll worker process")? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        let nap = match deadline {
            Some(deadline) if now >= deadline => return Ok(None),
            Some(deadline) => pause.min(deadline - now),
            None => pause,
        };
        std::thread::sleep(nap);
        pause = (pause * 2).min(Duration::from_millis(25));
    }
}

/// Run one rule in a worker process. `Err` means the process could not be
/// started or observed at all.
pub fn run_child(worker: &WorkerCommand, rule_id: &str, timeout: Duration) -> Result<ChildOutcome> {
    let deadline = Instant::now().checked_add(timeout);
    let mut child = worker
        .command(rule_id)
        .spawn()
        .with_context(|| format!("Failed to spawn worker {}", worker.program.display()))?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    match wait_until(&mut child, deadline)? {
        Some(status) => Ok(ChildOutcome::Finished {
            status,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        }),
        None => {
            tracing::debug!("Killing worker for {} after {:?}", rule_id, timeout);
            let _ = child.kill();
            let _ = child.wait();
            Ok(ChildOutcome::TimedOut)
        }
    }
}
