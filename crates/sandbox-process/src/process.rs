use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::resource::{Resource, getrlimit, setrlimit};
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use sandbox::{ExecutionResult, Outcome, Phase, ResourceLimits, SandboxError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capture::{Captured, capture};
use crate::jail::{self, Jail, Report, ReportPipe};

/// How long output readers may keep draining after the jail is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(200);
/// How long the jail gets to tear its namespace down after SIGTERM.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const MAX_OPEN_FILES: u64 = 256;
const MAX_FILE_SIZE_BYTES: u64 = 64 * 1024 * 1024;

/// One process launch under limits.
pub(crate) struct Invocation<'a> {
    pub argv: &'a [String],
    pub jail: &'a Jail,
    pub limits: &'a ResourceLimits,
    pub timeout: Duration,
    pub search_path: &'a str,
    pub cancel: &'a CancellationToken,
}

#[derive(Debug)]
enum Termination {
    /// `cpu` is what the jail measured for the payload's whole tree.
    Exited {
        status: ExitStatus,
        cpu: Option<Duration>,
    },
    TimedOut,
    Cancelled,
}

pub(crate) struct Finished {
    termination: Termination,
    stdout: Captured,
    stderr: Captured,
    cpu_limit: Duration,
    pub elapsed: Duration,
}

/// Process group of the outer jail process. Killed on drop so that a
/// dropped worker future cannot leave anything behind.
struct ProcessGroup(Option<Pid>);

impl ProcessGroup {
    /// Requires the child to have been spawned with `process_group(0)` so that
    /// its PGID equals its PID.
    fn of(child: &tokio::process::Child) -> Self {
        Self(
            child
                .id()
                .and_then(|pid| i32::try_from(pid).ok())
                .map(Pid::from_raw),
        )
    }

    /// Ask the jail to take its namespace down and reap it. Falls back to
    /// SIGKILL for the group when the jail does not exit in time.
    async fn shut_down(&mut self, child: &mut tokio::process::Child) {
        let Some(pid) = self.0 else {
            return;
        };
        let _ = kill(pid, Signal::SIGTERM);
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(pid = %pid, error = %e, "failed to reap jail"),
            Err(_) => {
                warn!(pid = %pid, "jail ignored shutdown, killing its group");
                self.kill();
                if let Err(e) = child.wait().await {
                    warn!(pid = %pid, error = %e, "failed to reap jail");
                }
            }
        }
        // Anything that never made it into the namespace.
        self.kill();
        self.0 = None;
    }

    fn kill(&self) {
        if let Some(pgid) = self.0 {
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }

    /// The leader was reaped; its namespace died with it.
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[derive(Debug, Clone, Copy)]
struct Rlimits {
    cpu_secs: u64,
    memory_bytes: u64,
}

impl Rlimits {
    fn from_limits(limits: &ResourceLimits) -> Self {
        Self {
            cpu_secs: limits.cpu_secs(),
            memory_bytes: limits.memory_bytes(),
        }
    }

    /// Runs in the forked child before `exec`; only async-signal-safe calls.
    fn apply(self) -> std::io::Result<()> {
        // Soft CPU limit delivers SIGXCPU, the hard one a second later SIGKILL.
        lower(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs + 1)?;
        lower(Resource::RLIMIT_AS, self.memory_bytes, self.memory_bytes)?;
        lower(Resource::RLIMIT_CORE, 0, 0)?;
        lower(Resource::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES)?;
        lower(Resource::RLIMIT_FSIZE, MAX_FILE_SIZE_BYTES, MAX_FILE_SIZE_BYTES)?;
        Ok(())
    }
}

/// Set a limit, never above the inherited hard limit (raising it needs privileges).
fn lower(resource: Resource, soft: u64, hard: u64) -> std::io::Result<()> {
    let (_, current_hard) = getrlimit(resource)?;
    let hard = hard.min(current_hard);
    setrlimit(resource, soft.min(hard), hard)?;
    Ok(())
}

/// Spawn `argv` inside `inv.jail` and wait for exit, timeout, or
/// cancellation. Nothing started by the call survives it.
pub(crate) async fn run(inv: &Invocation<'_>) -> sandbox::Result<Finished> {
    let (program, args) = inv
        .argv
        .split_first()
        .ok_or_else(|| SandboxError::SpawnFailed("empty command".into()))?;

    let mut report = ReportPipe::new()
        .map_err(|e| SandboxError::SpawnFailed(format!("report pipe: {e}")))?;
    let rlimits = Rlimits::from_limits(inv.limits);
    let jail = inv.jail.clone();
    let writer = report.writer();
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .env_clear()
        .env("PATH", inv.search_path)
        .env("HOME", jail::WORKDIR)
        .env("TMPDIR", "/tmp")
        .env("LANG", "C.UTF-8")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    // SAFETY: the hook runs in the freshly forked child and only makes
    // async-signal-safe calls on data prepared before the fork.
    unsafe {
        command.pre_exec(move || {
            jail.enter(writer)?;
            rlimits.apply()
        });
    }

    let spawned = command.spawn();
    report.close_writer();
    let mut child = spawned.map_err(|e| SandboxError::SpawnFailed(format!("{program}: {e}")))?;
    let mut group = ProcessGroup::of(&child);
    let started = Instant::now();

    let stop = CancellationToken::new();
    let cap = inv.limits.max_output_bytes;
    let stdout = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(capture(pipe, cap, stop.clone())));
    let stderr = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(capture(pipe, cap, stop.clone())));

    let waited = tokio::select! {
        status = child.wait() => status.map(|status| Termination::Exited { status, cpu: None }),
        _ = tokio::time::sleep(inv.timeout) => Ok(Termination::TimedOut),
        _ = inv.cancel.cancelled() => Ok(Termination::Cancelled),
    };
    let elapsed = started.elapsed();

    let termination = match waited {
        Ok(Termination::Exited { status, .. }) => {
            group.disarm();
            match report.take() {
                Some(Report::Finished { status, cpu }) => Termination::Exited {
                    status: ExitStatus::from_raw(status),
                    cpu: Some(cpu),
                },
                Some(Report::SetupFailed(errno)) => {
                    stop.cancel();
                    return Err(SandboxError::SpawnFailed(format!(
                        "{program}: sandbox setup failed: {errno}"
                    )));
                }
                None => Termination::Exited { status, cpu: None },
            }
        }
        Ok(other) => {
            group.shut_down(&mut child).await;
            other
        }
        Err(e) => {
            group.shut_down(&mut child).await;
            stop.cancel();
            return Err(SandboxError::ExecFailed(format!("wait {program}: {e}")));
        }
    };

    let stdout = collect(stdout, &stop).await;
    let stderr = collect(stderr, &stop).await;

    debug!(
        program = %program,
        termination = ?termination,
        elapsed_ms = elapsed.as_millis() as u64,
        "process finished"
    );

    Ok(Finished {
        termination,
        stdout,
        stderr,
        cpu_limit: Duration::from_secs(rlimits.cpu_secs),
        elapsed,
    })
}

async fn collect(task: Option<JoinHandle<Captured>>, stop: &CancellationToken) -> Captured {
    let Some(mut task) = task else {
        return Captured::default();
    };
    match tokio::time::timeout(DRAIN_GRACE, &mut task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            stop.cancel();
            task.await.unwrap_or_default()
        }
    }
}

impl Finished {
    /// `true` only for a normal exit with status 0.
    pub fn succeeded(&self) -> bool {
        matches!(&self.termination, Termination::Exited { status, .. } if status.success())
    }

    /// `(outcome, exit_code, signal)`.
    fn classify(&self) -> (Outcome, Option<i32>, Option<i32>) {
        let killed = Some(Signal::SIGKILL as i32);
        let Termination::Exited { status, cpu } = &self.termination else {
            let outcome = match self.termination {
                Termination::TimedOut => Outcome::Timeout,
                _ => Outcome::Cancelled,
            };
            return (outcome, None, killed);
        };
        if let Some(code) = status.code() {
            let outcome = if code != 0 && self.allocation_failed() {
                Outcome::ResourceExhausted
            } else {
                Outcome::Completed
            };
            return (outcome, Some(code), None);
        }

        let signal = status.signal();
        let outcome = match signal.map(Signal::try_from) {
            // RLIMIT_CPU soft limit and RLIMIT_FSIZE.
            Some(Ok(Signal::SIGXCPU | Signal::SIGXFSZ)) => Outcome::ResourceExhausted,
            // RLIMIT_CPU hard limit, for programs that survive SIGXCPU.
            Some(Ok(Signal::SIGKILL)) if cpu.is_some_and(|cpu| cpu >= self.cpu_limit) => {
                Outcome::ResourceExhausted
            }
            Some(Ok(Signal::SIGABRT)) if self.allocation_failed() => Outcome::ResourceExhausted,
            _ => Outcome::Crashed,
        };
        (outcome, None, signal)
    }

    fn allocation_failed(&self) -> bool {
        reports_allocation_failure(&String::from_utf8_lossy(&self.stderr.bytes))
    }

    /// Convert into the public result. `duration` covers every phase run so far.
    pub fn into_result(self, phase: Phase, duration: Duration, cap: usize) -> ExecutionResult {
        let (outcome, exit_code, signal) = self.classify();
        let (stdout, stdout_truncated) = self.stdout.into_text(cap);
        let (stderr, stderr_truncated) = self.stderr.into_text(cap);
        ExecutionResult {
            stdout,
            stderr,
            exit_code,
            signal,
            duration_ms: duration.as_millis() as u64,
            truncated: stdout_truncated || stderr_truncated,
            outcome,
            phase,
        }
    }
}

/// Whether stderr ends the way a runtime dies when an allocation fails under
/// `RLIMIT_AS`. Only the runtimes' own final messages count, so a program
/// that merely prints something about memory is not misreported.
fn reports_allocation_failure(stderr: &str) -> bool {
    let last = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    // Python, Ruby, C++ (libstdc++ terminate), Rust (alloc error hook).
    last == "MemoryError"
        || last.starts_with("MemoryError:")
        || last.ends_with("(NoMemoryError)")
        || last == "what():  std::bad_alloc"
        || (last.starts_with("memory allocation of ") && last.ends_with(" bytes failed"))
        // V8 prints its stack trace after this line.
        || stderr.lines().any(|line| {
            line.starts_with("FATAL ERROR:") && line.ends_with("JavaScript heap out of memory")
        })
}
