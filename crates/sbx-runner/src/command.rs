use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::fsutil::{ensure_dir, shell_join};

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Observer invoked once per command after it finishes, successful or not.
pub type Tracer = Arc<dyn Fn(&CommandReport) + Send + Sync>;

/// An external program plus its arguments. Cheap to clone.
#[derive(Clone)]
pub struct RunnableCommand {
    program: String,
    args: Vec<String>,
    label: Option<String>,
    workdir: Option<PathBuf>,
    env: Vec<(String, String)>,
    tracer: Option<Tracer>,
}

impl fmt::Debug for RunnableCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("label", &self.label)
            .field("workdir", &self.workdir)
            .field("env", &self.env)
            .field("tracer", &self.tracer.is_some())
            .finish()
    }
}

impl RunnableCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            label: None,
            workdir: None,
            env: Vec::new(),
            tracer: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub(crate) fn observer(&self) -> Option<&Tracer> {
        self.tracer.as_ref()
    }

    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        shell_join(&parts)
    }

    /// The label if one was given, otherwise the quoted command line.
    pub fn identity(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.command_line())
    }

    /// Runs the command to completion on the calling thread. With a timeout
    /// the child runs in its own process group and the whole group is killed
    /// once the deadline passes.
    pub fn execute(&self, timeout: Option<Duration>) -> Execution {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            if timeout.is_some() {
                cmd.process_group(0);
            }
        }

        let started_at = Utc::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Execution {
                    outcome: CommandOutcome::SpawnError {
                        message: format!("failed to start {}: {}", self.program, e),
                    },
                    output: String::new(),
                    started_at,
                    finished_at: Utc::now(),
                }
            }
        };

        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let outcome = match wait_child(&mut child, timeout) {
            Ok(Waited::Exited(status)) => outcome_from_status(status),
            Ok(Waited::TimedOut(after)) => CommandOutcome::TimedOut {
                after_ms: after.as_millis() as u64,
            },
            Err(e) => CommandOutcome::SpawnError {
                message: format!("failed to wait for {}: {}", self.program, e),
            },
        };

        let mut output = Vec::new();
        for reader in [stdout_reader, stderr_reader].into_iter().flatten() {
            if let Ok(bytes) = reader.join() {
                output.extend_from_slice(&bytes);
            }
        }

        Execution {
            outcome,
            output: String::from_utf8_lossy(&output).into_owned(),
            started_at,
            finished_at: Utc::now(),
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

enum Waited {
    Exited(ExitStatus),
    TimedOut(Duration),
}

fn wait_child(child: &mut Child, timeout: Option<Duration>) -> io::Result<Waited> {
    let Some(limit) = timeout else {
        return child.wait().map(Waited::Exited);
    };
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Waited::Exited(status));
        }
        let elapsed = start.elapsed();
        if elapsed >= limit {
            kill_child(child);
            let _ = child.wait();
            return Ok(Waited::TimedOut(elapsed));
        }
        thread::sleep(CHILD_POLL_INTERVAL.min(limit - elapsed));
    }
}

fn kill_child(child: &mut Child) {
    #[cfg(unix)]
    {
        // The child leads its own process group; take its descendants too so
        // they release the output pipes.
        let pgid = child.id() as libc::pid_t;
        // SAFETY: kill(2) with a negative pid signals a process group and has
        // no memory-safety preconditions.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

fn outcome_from_status(status: ExitStatus) -> CommandOutcome {
    if status.success() {
        CommandOutcome::Success
    } else {
        CommandOutcome::Failed {
            code: status.code(),
        }
    }
}

/// Result of running one command, before it is tagged with batch metadata.
#[derive(Debug, Clone)]
pub struct Execution {
    pub outcome: CommandOutcome,
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    Success,
    Failed { code: Option<i32> },
    SpawnError { message: String },
    TimedOut { after_ms: u64 },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Success)
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::Success => write!(f, "ok"),
            CommandOutcome::Failed { code: Some(code) } => write!(f, "exit status {}", code),
            CommandOutcome::Failed { code: None } => write!(f, "terminated by signal"),
            CommandOutcome::SpawnError { message } => write!(f, "{}", message),
            CommandOutcome::TimedOut { after_ms } => write!(f, "timed out after {}ms", after_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    /// Position of the item in the submitted batch.
    pub index: usize,
    pub operation_id: u64,
    pub level: u32,
    pub identity: String,
    pub outcome: CommandOutcome,
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CommandReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Append-only log shared by every command that targets the same sandbox.
#[derive(Debug, Clone)]
pub struct OperationLog {
    path: PathBuf,
    guard: Arc<Mutex<()>>,
}

impl OperationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, report: &CommandReport) -> io::Result<()> {
        let mut chunk = format!(
            "[{}] op={} level={} {} -> {}\n",
            report.finished_at.to_rfc3339(),
            report.operation_id,
            report.level,
            report.identity,
            report.outcome
        );
        chunk.push_str(&report.output);
        if !report.output.is_empty() && !report.output.ends_with('\n') {
            chunk.push('\n');
        }
        let _held = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_dir(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(chunk.as_bytes())
    }

    pub fn read_to_string(&self) -> io::Result<String> {
        fs::read_to_string(&self.path)
    }
}

/// A command tagged with its dependency level.
#[derive(Debug, Clone)]
pub struct ExecutionItem {
    pub level: u32,
    pub command: RunnableCommand,
    pub log: Option<OperationLog>,
}

impl ExecutionItem {
    pub fn new(level: u32, command: RunnableCommand) -> Self {
        Self {
            level,
            command,
            log: None,
        }
    }

    pub fn with_log(mut self, log: OperationLog) -> Self {
        self.log = Some(log);
        self
    }
}
