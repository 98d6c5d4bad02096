//! Supervised execution of one untrusted program
//!
//! The child is started in its own process group with a cleared environment
//! and gets its limits applied between fork and exec. The supervisor feeds
//! stdin, captures bounded stdout/stderr, samples peak memory and enforces the
//! wall-clock deadline. Whatever the outcome, the whole process group is
//! SIGKILLed before this returns.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use nix::sys::prctl;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::{setgid, setgroups, setuid, Gid, Pid, Uid};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::config::{NetworkIsolation, SandboxConfig};
use crate::cancel::CancelToken;

/// `PATH` seen by sandboxed programs and used to resolve bare program names
pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

const READ_CHUNK: usize = 8192;
/// How long pipes may stay open after the process group has been killed
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("program not found: {0}")]
    NotFound(String),
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("lost track of {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// What to run
#[derive(Debug, Clone, Copy)]
pub struct ProcessSpec<'a> {
    /// Absolute path, see [`resolve_program`]
    pub program: &'a Path,
    pub args: &'a [String],
    pub work_dir: &'a Path,
    pub stdin: Option<&'a [u8]>,
}

/// Limits for one supervised run
#[derive(Debug, Clone)]
pub struct ProcessLimits {
    pub wall_time: Duration,
    pub memory_kb: u64,
    /// Also enforce `memory_kb` through RLIMIT_AS
    pub address_space: bool,
    /// Bytes kept per stream
    pub output_bytes: usize,
    pub open_files: u64,
    pub fsize_kb: u64,
    pub max_processes: Option<u64>,
    pub network: NetworkIsolation,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub memory_poll: Duration,
}

impl ProcessLimits {
    pub fn new(config: &SandboxConfig, wall_time: Duration, memory_mb: u32) -> Self {
        Self {
            wall_time,
            memory_kb: memory_mb as u64 * 1024,
            address_space: true,
            output_bytes: config.max_output_bytes,
            open_files: config.open_files,
            fsize_kb: config.fsize_kb,
            max_processes: config.max_processes,
            network: config.network,
            uid: config.uid,
            gid: config.gid,
            memory_poll: Duration::from_millis(config.memory_poll_ms.max(1)),
        }
    }

    pub fn with_address_space(mut self, enabled: bool) -> Self {
        self.address_space = enabled;
        self
    }

    pub fn with_output_bytes(mut self, bytes: usize) -> Self {
        self.output_bytes = bytes;
        self
    }

    /// RLIMIT_CPU backstop: one second above the wall deadline, rounded up
    fn cpu_secs(&self) -> u64 {
        self.wall_time.as_millis().div_ceil(1000) as u64 + 1
    }
}

/// Bytes read from one output stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub data: Vec<u8>,
    /// Output beyond the capture bound was discarded
    pub truncated: bool,
}

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// How the supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    TimedOut,
    MemoryExceeded,
    Cancelled,
}

/// Raw outcome from a supervised run (no verdict interpretation)
#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub termination: Termination,
    pub stdout: Captured,
    pub stderr: Captured,
    pub elapsed: Duration,
    /// Peak resident set size, `None` when it could not be sampled
    pub peak_memory_kb: Option<u64>,
}

/// Values copied into the pre-exec hook.
#[derive(Debug, Clone, Copy)]
struct ChildIsolation {
    memory_bytes: Option<u64>,
    cpu_secs: u64,
    fsize_bytes: u64,
    open_files: u64,
    max_processes: Option<u64>,
    network: NetworkIsolation,
    uid: Option<u32>,
    gid: Option<u32>,
}

impl ChildIsolation {
    fn from_limits(limits: &ProcessLimits) -> Self {
        Self {
            memory_bytes: limits.address_space.then(|| limits.memory_kb * 1024),
            cpu_secs: limits.cpu_secs(),
            fsize_bytes: limits.fsize_kb * 1024,
            open_files: limits.open_files,
            max_processes: limits.max_processes,
            network: limits.network,
            uid: limits.uid,
            gid: limits.gid,
        }
    }
}

enum Stop {
    /// The leader exited and is still unreaped
    Exited(io::Result<()>),
    TimedOut,
    MemoryExceeded,
    Cancelled,
}

/// Find the executable for `program`.
///
/// Names containing a slash are taken relative to `work_dir`; bare names are
/// looked up in [`SANDBOX_PATH`].
pub fn resolve_program(program: &str, work_dir: &Path) -> Result<PathBuf, LaunchError> {
    if program.is_empty() {
        return Err(LaunchError::NotFound("<empty command>".to_string()));
    }

    let found = if program.contains('/') {
        Some(work_dir.join(program)).filter(|path| path.is_file())
    } else {
        SANDBOX_PATH
            .split(':')
            .map(|dir| Path::new(dir).join(program))
            .find(|path| path.is_file())
    };

    found.ok_or_else(|| LaunchError::NotFound(program.to_string()))
}

/// Run one program to completion under the given limits.
pub async fn spawn_supervised(
    spec: ProcessSpec<'_>,
    limits: &ProcessLimits,
    cancel: &CancelToken,
) -> Result<ProcessReport, LaunchError> {
    let program = spec.program.display().to_string();
    debug!(
        "Spawning {} {:?} in {} (wall={:?}, memory={}KB, address_space={})",
        program,
        spec.args,
        spec.work_dir.display(),
        limits.wall_time,
        limits.memory_kb,
        limits.address_space
    );

    let mut command = Command::new(spec.program);
    command
        .args(spec.args)
        .current_dir(spec.work_dir)
        .env_clear()
        .env("PATH", SANDBOX_PATH)
        .env("HOME", spec.work_dir)
        .env("TMPDIR", spec.work_dir)
        .env("LANG", "C.UTF-8")
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let isolation = ChildIsolation::from_limits(limits);
    // SAFETY: the hook only issues raw syscalls on copied values; it does not
    // allocate or take locks in the forked child.
    unsafe {
        command.pre_exec(move || isolate_child(&isolation));
    }

    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        program: program.clone(),
        source,
    })?;
    let started = Instant::now();
    let pid = child.id();

    let stdin_task = match (child.stdin.take(), spec.stdin) {
        (Some(mut pipe), Some(data)) => {
            let data = data.to_vec();
            Some(tokio::spawn(async move {
                // The program may exit without reading all of its input.
                let _ = pipe.write_all(&data).await;
                let _ = pipe.shutdown().await;
            }))
        }
        _ => None,
    };
    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(capture(out, limits.output_bytes)));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(capture(err, limits.output_bytes)));

    let peak = AtomicU64::new(0);
    let stop = tokio::select! {
        exited = wait_exited(pid) => Stop::Exited(exited),
        _ = cancel.cancelled() => Stop::Cancelled,
        _ = watch_memory(pid, limits.memory_kb, limits.memory_poll, &peak) => Stop::MemoryExceeded,
        _ = tokio::time::sleep(limits.wall_time) => Stop::TimedOut,
    };
    let elapsed = started.elapsed();

    // Sweep the group even after a normal exit: forked descendants die here.
    // The leader is not reaped yet, so its pid (the group id) cannot have been
    // reused.
    kill_group(pid);

    let termination = match stop {
        Stop::Exited(Ok(())) => match child.wait().await {
            Ok(status) => exit_termination(status),
            Err(source) => {
                abort(stdin_task);
                return Err(LaunchError::Wait { program, source });
            }
        },
        Stop::Exited(Err(source)) => {
            abort(stdin_task);
            return Err(LaunchError::Wait { program, source });
        }
        stop => {
            if let Err(e) = child.kill().await {
                warn!("Failed to reap {}: {}", program, e);
            }
            match stop {
                Stop::TimedOut => Termination::TimedOut,
                Stop::MemoryExceeded => Termination::MemoryExceeded,
                _ => Termination::Cancelled,
            }
        }
    };

    let stdout = collect(stdout_task).await;
    let stderr = collect(stderr_task).await;
    abort(stdin_task);

    let peak_kb = peak.load(Ordering::Relaxed);
    let report = ProcessReport {
        termination,
        stdout,
        stderr,
        elapsed,
        peak_memory_kb: (peak_kb > 0).then_some(peak_kb),
    };
    debug!(
        "{} finished: {:?} in {:?}, peak={:?}KB, stdout={}B{}",
        program,
        report.termination,
        report.elapsed,
        report.peak_memory_kb,
        report.stdout.data.len(),
        if report.stdout.truncated { " (truncated)" } else { "" }
    );
    Ok(report)
}

/// Runs in the forked child right before exec.
fn isolate_child(iso: &ChildIsolation) -> io::Result<()> {
    prctl::set_pdeathsig(Signal::SIGKILL)?;

    if iso.network != NetworkIsolation::Off {
        // A root worker that drops to `uid` keeps its user namespace so the
        // setuid below is still permitted.
        let flags = if iso.uid.is_some() {
            CloneFlags::CLONE_NEWNET
        } else {
            CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET
        };
        if let Err(errno) = unshare(flags) {
            if iso.network == NetworkIsolation::Strict {
                return Err(errno.into());
            }
        }
    }

    lower_limit(Resource::RLIMIT_CORE, 0, 0)?;
    lower_limit(Resource::RLIMIT_CPU, iso.cpu_secs, iso.cpu_secs + 1)?;
    lower_limit(Resource::RLIMIT_FSIZE, iso.fsize_bytes, iso.fsize_bytes)?;
    lower_limit(Resource::RLIMIT_NOFILE, iso.open_files, iso.open_files)?;
    if let Some(bytes) = iso.memory_bytes {
        lower_limit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    if let Some(count) = iso.max_processes {
        lower_limit(Resource::RLIMIT_NPROC, count, count)?;
    }

    if let Some(gid) = iso.gid {
        setgroups(&[])?;
        setgid(Gid::from_raw(gid))?;
    }
    if let Some(uid) = iso.uid {
        setuid(Uid::from_raw(uid))?;
    }

    prctl::set_no_new_privs()?;
    Ok(())
}

/// setrlimit, never raising above the current hard limit
fn lower_limit(resource: Resource, soft: u64, hard: u64) -> Result<(), Errno> {
    let (_, current_hard) = getrlimit(resource)?;
    let hard = hard.min(current_hard);
    setrlimit(resource, soft.min(hard), hard)
}

fn exit_termination(status: ExitStatus) -> Termination {
    match (status.code(), status.signal()) {
        (Some(code), _) => Termination::Exited(code),
        (None, Some(signal)) => Termination::Signaled(signal),
        (None, None) => Termination::Signaled(Signal::SIGKILL as i32),
    }
}

/// Resolves once the leader has exited, leaving it a zombie for `Child::wait`.
async fn wait_exited(pid: Option<u32>) -> io::Result<()> {
    let Some(pid) = pid else { return Ok(()) };
    let pid = Pid::from_raw(pid as i32);
    tokio::task::spawn_blocking(move || loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(io::Error::from(errno)),
        }
    })
    .await
    .map_err(io::Error::other)?
}

fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pid, e),
    }
}

async fn capture<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> Captured {
    let mut captured = Captured::default();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(captured.data.len());
                if n > room {
                    captured.truncated = true;
                }
                captured.data.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    captured
}

async fn collect(task: Option<JoinHandle<Captured>>) -> Captured {
    let Some(mut task) = task else {
        return Captured::default();
    };
    match tokio::time::timeout(DRAIN_GRACE, &mut task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(_)) => Captured::default(),
        Err(_) => {
            // Something outside the group still holds the pipe open.
            task.abort();
            Captured {
                data: Vec::new(),
                truncated: true,
            }
        }
    }
}

fn abort(task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        task.abort();
    }
}

/// Resolves only when the sampled peak exceeds `limit_kb`.
async fn watch_memory(pid: Option<u32>, limit_kb: u64, every: Duration, peak: &AtomicU64) {
    let Some(pid) = pid else {
        return std::future::pending().await;
    };
    let status_path = format!("/proc/{}/status", pid);
    loop {
        if let Ok(status) = tokio::fs::read_to_string(&status_path).await {
            if let Some(kb) = parse_peak_rss_kb(&status) {
                peak.fetch_max(kb, Ordering::Relaxed);
                if kb > limit_kb {
                    return;
                }
            }
        }
        tokio::time::sleep(every).await;
    }
}

/// `VmHWM` from a `/proc/<pid>/status` dump
pub fn parse_peak_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmHWM:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_limits(wall_ms: u64) -> ProcessLimits {
        let config = SandboxConfig {
            network: NetworkIsolation::BestEffort,
            ..SandboxConfig::default()
        };
        ProcessLimits::new(&config, Duration::from_millis(wall_ms), 256)
    }

    async fn run_sh(
        script: &str,
        stdin: Option<&[u8]>,
        limits: &ProcessLimits,
    ) -> ProcessReport {
        let dir = tempfile::tempdir().unwrap();
        let sh = resolve_program("sh", dir.path()).unwrap();
        let args = vec!["-c".to_string(), script.to_string()];
        let spec = ProcessSpec {
            program: &sh,
            args: &args,
            work_dir: dir.path(),
            stdin,
        };
        spawn_supervised(spec, limits, &CancelToken::new())
            .await
            .unwrap()
    }

    /// False once the process is gone or a zombie.
    fn alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => {
                let state = stat.rsplit(')').next().and_then(|s| s.trim().chars().next());
                !matches!(state, Some('Z') | Some('X') | None)
            }
            Err(_) => false,
        }
    }

    async fn assert_dead(pid: i32) {
        for _ in 0..20 {
            if !alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process {} outlived the run", pid);
    }

    #[tokio::test]
    async fn test_stdin_is_echoed() {
        let report = run_sh("cat", Some(b"1 2\n"), &test_limits(2000)).await;
        assert_eq!(report.termination, Termination::Exited(0));
        assert_eq!(report.stdout.text(), "1 2\n");
        assert!(!report.stdout.truncated);
    }

    #[tokio::test]
    async fn test_exit_code_and_stderr() {
        let report = run_sh("echo oops >&2; exit 3", None, &test_limits(2000)).await;
        assert_eq!(report.termination, Termination::Exited(3));
        assert_eq!(report.stderr.text(), "oops\n");
    }

    #[tokio::test]
    async fn test_signal_is_reported() {
        let report = run_sh("kill -SEGV $$", None, &test_limits(2000)).await;
        assert_eq!(report.termination, Termination::Signaled(Signal::SIGSEGV as i32));
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        std::env::set_var("JUDGE_WORKER_SECRET", "leak");
        let report = run_sh("echo \"[$JUDGE_WORKER_SECRET]\"; echo $PATH", None, &test_limits(2000)).await;
        assert_eq!(report.stdout.text(), format!("[]\n{}\n", SANDBOX_PATH));
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let report = run_sh("while :; do :; done", None, &test_limits(300)).await;
        assert_eq!(report.termination, Termination::TimedOut);
        assert!(report.elapsed >= Duration::from_millis(300));
        assert!(report.elapsed < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_forked_descendants_do_not_survive_exit() {
        let report = run_sh("sleep 30 & echo $!; exit 0", None, &test_limits(2000)).await;
        assert_eq!(report.termination, Termination::Exited(0));
        let pid: i32 = report.stdout.text().trim().parse().unwrap();
        assert_dead(pid).await;
    }

    #[tokio::test]
    async fn test_forked_descendants_do_not_survive_timeout() {
        let report = run_sh(
            "sleep 30 & echo $!; while :; do :; done",
            None,
            &test_limits(300),
        )
        .await;
        assert_eq!(report.termination, Termination::TimedOut);
        let pid: i32 = report.stdout.text().trim().parse().unwrap();
        assert_dead(pid).await;
    }

    #[tokio::test]
    async fn test_output_flood_is_truncated() {
        let limits = test_limits(5000).with_output_bytes(1024);
        let report = run_sh("head -c 200000 /dev/zero", None, &limits).await;
        assert_eq!(report.termination, Termination::Exited(0));
        assert_eq!(report.stdout.data.len(), 1024);
        assert!(report.stdout.truncated);
    }

    #[tokio::test]
    async fn test_cancel_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let sh = resolve_program("sh", dir.path()).unwrap();
        let args = vec!["-c".to_string(), "sleep 30".to_string()];
        let spec = ProcessSpec {
            program: &sh,
            args: &args,
            work_dir: dir.path(),
            stdin: None,
        };
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let report = spawn_supervised(spec, &test_limits(10_000), &cancel)
            .await
            .unwrap();
        assert_eq!(report.termination, Termination::Cancelled);
        assert!(report.elapsed < Duration::from_secs(5));
    }

    /// Holds ~50MB in the shell itself: command substitution buffers in the
    /// parent, so the sampled leader is the one that grows.
    const MEMORY_HOG: &str = "x=$(head -c 50000000 /dev/zero | tr '\\0' a); sleep 2; echo ${#x}";

    #[tokio::test]
    async fn test_memory_watcher_kills_over_limit() {
        let config = SandboxConfig {
            network: NetworkIsolation::BestEffort,
            ..SandboxConfig::default()
        };
        let limits =
            ProcessLimits::new(&config, Duration::from_millis(5000), 16).with_address_space(false);
        let report = run_sh(MEMORY_HOG, None, &limits).await;
        assert_eq!(report.termination, Termination::MemoryExceeded);
        assert!(report.peak_memory_kb.unwrap() > 16 * 1024);
        assert!(report.stdout.data.is_empty());
    }

    /// Under RLIMIT_AS the allocation itself fails: the shell reports it and
    /// exits non-zero (or aborts) instead of being killed by the watcher.
    #[tokio::test]
    async fn test_address_space_limit_fails_allocation() {
        let config = SandboxConfig {
            network: NetworkIsolation::BestEffort,
            ..SandboxConfig::default()
        };
        let limits = ProcessLimits::new(&config, Duration::from_millis(5000), 32);
        let report = run_sh(MEMORY_HOG, None, &limits).await;
        assert!(
            matches!(report.termination, Termination::Exited(code) if code != 0)
                || matches!(report.termination, Termination::Signaled(_)),
            "unexpected termination {:?}",
            report.termination
        );
        assert!(report.stdout.data.is_empty());
    }

    #[test]
    fn test_resolve_program() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_program("sh", dir.path()).unwrap().is_absolute());
        assert!(matches!(
            resolve_program("definitely-not-a-compiler", dir.path()),
            Err(LaunchError::NotFound(_))
        ));
        assert!(matches!(
            resolve_program("./main", dir.path()),
            Err(LaunchError::NotFound(_))
        ));

        std::fs::write(dir.path().join("main"), b"").unwrap();
        assert_eq!(
            resolve_program("./main", dir.path()).unwrap(),
            dir.path().join("./main")
        );
    }

    #[test]
    fn test_parse_peak_rss() {
        let status = "Name:\tsh\nVmPeak:\t  2500 kB\nVmHWM:\t    1180 kB\nVmRSS:\t 1100 kB\n";
        assert_eq!(parse_peak_rss_kb(status), Some(1180));
        assert_eq!(parse_peak_rss_kb("Name:\tzombie\n"), None);
    }
}
