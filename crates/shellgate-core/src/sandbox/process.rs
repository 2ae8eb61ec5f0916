//! Child process supervision: spawn, bounded capture, timeout and
//! cancellation with a graceful-then-forced stop.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::error::{SandboxError, SandboxResult};
use crate::cancel::CancelSignal;

/// Kernel resource limits applied to the child before exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_secs: Option<u64>,
    pub max_file_bytes: u64,
}

/// What to run and under which budget.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub script: String,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub grace: Duration,
    pub max_output_bytes: usize,
    pub limits: Option<ResourceLimits>,
}

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited { code: i32 },
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit: ProcessExit,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub duration_ms: u64,
}

enum Stop {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Run `spec.script` under `/bin/sh -c` in its own process group.
pub async fn run(spec: &ProcessSpec, cancel: &CancelSignal) -> SandboxResult<ProcessOutput> {
    let start = Instant::now();

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(&spec.script)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    apply_pre_exec(&mut cmd, spec.limits);

    let mut child = cmd.spawn().map_err(SandboxError::Spawn)?;
    let pid = child.id();
    debug!(?pid, cwd = %spec.cwd.display(), "spawned child");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let cap = spec.max_output_bytes;
    let out_task = tokio::spawn(read_capped(stdout, cap));
    let err_task = tokio::spawn(read_capped(stderr, cap));

    let stop = tokio::select! {
        status = child.wait() => Stop::Exited(status),
        _ = deadline(spec.timeout) => Stop::TimedOut,
        _ = cancel.cancelled() => Stop::Cancelled,
    };

    let exit = match stop {
        Stop::Exited(status) => ProcessExit::Exited {
            code: exit_code(status?),
        },
        Stop::TimedOut => {
            warn!(?pid, "process exceeded its time budget");
            terminate(&mut child, pid, spec.grace).await;
            ProcessExit::TimedOut
        }
        Stop::Cancelled => {
            debug!(?pid, "cancelling process");
            terminate(&mut child, pid, spec.grace).await;
            ProcessExit::Cancelled
        }
    };

    // Background grandchildren can hold the pipes open; bound the wait.
    let (stdout, out_trunc) = collect(out_task, spec.grace).await;
    let (stderr, err_trunc) = collect(err_task, spec.grace).await;

    Ok(ProcessOutput {
        exit,
        stdout,
        stderr,
        truncated: out_trunc || err_trunc,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Set a hard and soft rlimit inside a `pre_exec` hook.
#[cfg(unix)]
macro_rules! set_limit {
    ($resource:expr, $value:expr) => {{
        let limit = libc::rlimit {
            rlim_cur: $value as libc::rlim_t,
            rlim_max: $value as libc::rlim_t,
        };
        if libc::setrlimit($resource, &limit) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }};
}

#[cfg(unix)]
fn apply_pre_exec(cmd: &mut Command, limits: Option<ResourceLimits>) {
    // SAFETY: the closure only calls async-signal-safe libc functions.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if let Some(limits) = limits {
                set_limit!(libc::RLIMIT_CORE, 0u64);
                set_limit!(libc::RLIMIT_FSIZE, limits.max_file_bytes);
                if let Some(cpu) = limits.cpu_secs {
                    set_limit!(libc::RLIMIT_CPU, cpu);
                }
                #[cfg(target_os = "linux")]
                {
                    let (on, unused): (libc::c_ulong, libc::c_ulong) = (1, 0);
                    if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, on, unused, unused, unused) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
            }
            Ok(())
        });
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending::<()>().await,
    }
}

/// SIGTERM the group, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    signal_group(pid, Signal::Term);
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    warn!(?pid, "process ignored SIGTERM, killing");
    signal_group(pid, Signal::Kill);
    if let Err(e) = child.kill().await {
        debug!(?pid, error = %e, "kill after group signal");
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg has no memory-safety preconditions.
    unsafe {
        libc::killpg(pid as libc::pid_t, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Read up to `cap` bytes and drain the rest so the writer never blocks.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> (Vec<u8>, bool) {
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(buf.len());
                if n > room {
                    truncated = true;
                }
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    (buf, truncated)
}

async fn collect(
    task: tokio::task::JoinHandle<(Vec<u8>, bool)>,
    wait: Duration,
) -> (String, bool) {
    let abort = task.abort_handle();
    match tokio::time::timeout(wait, task).await {
        Ok(Ok((bytes, truncated))) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
        Ok(Err(_)) => (String::new(), true),
        Err(_) => {
            abort.abort();
            (String::new(), true)
        }
    }
}
