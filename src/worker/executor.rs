use std::fs::File;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};
use crate::task::{JudgeStatus, ResourceUsage};

/// How a finished process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
}

impl Termination {
    pub fn success(&self) -> bool {
        matches!(self, Termination::Exited(0))
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Exited(code) => write!(f, "exit code {code}"),
            Termination::Signaled(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// One external program to run under limits.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub limits: ResourceUsage,
    /// Files created here count against the disk limits.
    pub output_dir: Option<PathBuf>,
    /// Also cap the address space at a multiple of the memory limit, so a
    /// runaway allocation fails before it can exhaust the host. The verdict
    /// still comes from resident memory. Off for anything that maps far more
    /// than it uses (compilers, valgrind).
    pub limit_address_space: bool,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            stdin: None,
            stdout: None,
            stderr: None,
            limits: ResourceUsage::unbounded(),
            output_dir: None,
            limit_address_space: false,
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

    pub fn stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    pub fn limits(mut self, limits: ResourceUsage) -> Self {
        self.limits = limits;
        self
    }

    pub fn watch_output(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn limit_address_space(mut self, enabled: bool) -> Self {
        self.limit_address_space = enabled;
        self
    }
}

/// Outcome of one execution; usage is normalized to the reference machine.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub termination: Termination,
    pub usage: ResourceUsage,
    /// Killed by the wall-clock deadline.
    pub timed_out: bool,
    /// Killed because resident memory went over the limit.
    pub memory_exceeded: bool,
}

impl ExecutionResult {
    /// Verdict against `limits`, or `None` for a clean run within them.
    ///
    /// `leak_exit_code` is the exit code a memory checker wrapping the
    /// program reports errors with.
    pub fn verdict(&self, limits: &ResourceUsage, leak_exit_code: Option<i32>) -> Option<JudgeStatus> {
        let over = |used: i64, limit: Option<u64>| limit.is_some_and(|l| used >= 0 && used as u64 > l);

        if self.timed_out
            || self.termination == Termination::Signaled(libc::SIGXCPU)
            || over(self.usage.time_msecs, bound_ms(limits))
        {
            return Some(JudgeStatus::TimeLimitExceeded);
        }
        if self.termination == Termination::Signaled(libc::SIGXFSZ)
            || over(self.usage.file_count, limits.file_count_limit())
            || over(self.usage.file_size_bytes, limits.file_size_limit())
        {
            return Some(JudgeStatus::DiskLimitExceeded);
        }
        if self.memory_exceeded || over(self.usage.memory_bytes, limits.memory_limit()) {
            return Some(JudgeStatus::MemoryLimitExceeded);
        }
        match self.termination {
            Termination::Exited(0) => None,
            Termination::Exited(code) if Some(code) == leak_exit_code => Some(JudgeStatus::MemoryLeak),
            _ => Some(JudgeStatus::RuntimeError),
        }
    }
}

/// Address-space rlimit for a memory limit: twice the limit plus room for
/// shared libraries and stacks. Resident memory crosses the limit long
/// before the address space runs out.
pub fn address_space_backstop(memory_limit: u64) -> u64 {
    memory_limit
        .saturating_mul(2)
        .saturating_add(ADDRESS_SPACE_SLACK)
}

const ADDRESS_SPACE_SLACK: u64 = 256 * 1024 * 1024;

/// How often resident memory is sampled while a limited process runs.
const MEMORY_POLL: Duration = Duration::from_millis(10);

fn bound_ms(limits: &ResourceUsage) -> Option<u64> {
    limits.time_limit().map(|d| d.as_millis() as u64)
}

/// Runs programs under rlimits and a wall-clock deadline, in their own
/// process group, with a fixed environment.
///
/// Every execution is cancellable: on cancellation or deadline the whole
/// process group is killed and reaped before returning.
#[derive(Debug, Clone)]
pub struct Executor {
    env: Vec<(String, String)>,
    run_as: Option<u32>,
    slowness: f64,
}

impl Executor {
    pub fn new(config: &RunnerConfig) -> Self {
        // Dropping privileges is only possible (and only needed) as root.
        let run_as = config
            .worker_uid
            .filter(|_| unsafe { libc::geteuid() } == 0);
        Self {
            env: config.task_env_pairs(),
            run_as,
            slowness: config.relative_slowness,
        }
    }

    pub fn drops_privileges(&self) -> bool {
        self.run_as.is_some()
    }

    pub async fn execute(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }
        let limits = invocation.limits.scale_time(self.slowness);
        let mut command = self.command(invocation, &limits)?;

        let child = spawn(&mut command).await.map_err(|source| RunnerError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;
        let pid = child.id() as libc::pid_t;
        let mut group = ProcessGroup::new(pid);
        let started = Instant::now();
        tracing::debug!(program = %invocation.program.display(), pid, "Spawned process");

        let mut waiter = tokio::task::spawn_blocking(move || wait_child(pid));
        let deadline = async {
            match limits.time_limit() {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let memory_watch = async {
            match limits.memory_limit() {
                Some(limit) => rss_exceeds(pid, limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(memory_watch);

        let mut timed_out = false;
        let mut memory_exceeded = false;
        let waited = tokio::select! {
            biased;
            waited = &mut waiter => waited,
            _ = &mut deadline => {
                timed_out = true;
                group.kill();
                (&mut waiter).await
            }
            _ = &mut memory_watch => {
                memory_exceeded = true;
                group.kill();
                (&mut waiter).await
            }
            _ = cancel.cancelled() => {
                group.kill();
                let _ = waiter.await;
                group.reaped();
                tracing::debug!(pid, "Process killed on cancellation");
                return Err(RunnerError::Cancelled);
            }
        };
        let elapsed = started.elapsed();
        group.reaped();

        let (status, rusage) = waited
            .map_err(|e| RunnerError::Internal(format!("wait task failed: {e}")))??;
        let termination = if libc::WIFSIGNALED(status) {
            Termination::Signaled(libc::WTERMSIG(status))
        } else {
            Termination::Exited(libc::WEXITSTATUS(status))
        };

        let (file_count, mut file_size_bytes) = match &invocation.output_dir {
            Some(dir) => {
                let (count, size) = measure_dir(dir);
                (count as i64, size as i64)
            }
            None => (-1, -1),
        };
        if let Some(stdout) = &invocation.stdout {
            let written = std::fs::metadata(stdout).map(|m| m.len() as i64).unwrap_or(0);
            file_size_bytes = file_size_bytes.max(0) + written;
        }

        let usage = ResourceUsage {
            time_msecs: (elapsed.as_secs_f64() * 1000.0 / self.slowness).round() as i64,
            memory_bytes: rusage.ru_maxrss.max(0) * 1024,
            file_count,
            file_size_bytes,
        };
        tracing::debug!(
            program = %invocation.program.display(),
            %termination,
            timed_out,
            memory_exceeded,
            time_msecs = usage.time_msecs,
            memory_bytes = usage.memory_bytes,
            "Process finished"
        );
        Ok(ExecutionResult {
            termination,
            usage,
            timed_out,
            memory_exceeded,
        })
    }

    fn command(&self, invocation: &Invocation, limits: &ResourceUsage) -> Result<Command> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .process_group(0)
            .stdin(redirect_in(invocation.stdin.as_deref())?)
            .stdout(redirect_out(invocation.stdout.as_deref())?)
            .stderr(redirect_out(invocation.stderr.as_deref())?);

        if let Some(uid) = self.run_as {
            command.uid(uid).gid(uid);
        }

        let address_space = limits
            .memory_limit()
            .filter(|_| invocation.limit_address_space)
            .map(address_space_backstop);
        // Backstop for busy loops if the deadline kill is delayed.
        let cpu_secs = limits.time_limit().map(|t| t.as_secs() + 1 + u64::from(t.subsec_nanos() > 0));
        let file_size = limits.file_size_limit();

        unsafe {
            command.pre_exec(move || {
                if let Some(bytes) = address_space {
                    apply_rlimit(libc::RLIMIT_AS, bytes)?;
                }
                if let Some(secs) = cpu_secs {
                    apply_rlimit(libc::RLIMIT_CPU, secs)?;
                }
                if let Some(bytes) = file_size {
                    apply_rlimit(libc::RLIMIT_FSIZE, bytes)?;
                }
                apply_rlimit(libc::RLIMIT_CORE, 0)?;
                Ok(())
            });
        }
        Ok(command)
    }
}

/// Spawn, retrying briefly on `ETXTBSY`: an executable written moments ago
/// can still be open for writing in a child forked concurrently.
async fn spawn(command: &mut Command) -> io::Result<std::process::Child> {
    let mut attempts = 0;
    loop {
        match command.spawn() {
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            other => return other,
        }
    }
}

fn redirect_in(path: Option<&Path>) -> io::Result<Stdio> {
    Ok(match path {
        Some(path) => Stdio::from(File::open(path)?),
        None => Stdio::null(),
    })
}

fn redirect_out(path: Option<&Path>) -> io::Result<Stdio> {
    Ok(match path {
        Some(path) => Stdio::from(File::create(path)?),
        None => Stdio::null(),
    })
}

fn apply_rlimit(resource: libc::__rlimit_resource_t, value: u64) -> io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    let rc = unsafe { libc::setrlimit(resource, &rlim) };
    if rc != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Resolves once the resident set of `pid` exceeds `limit` bytes. Never
/// resolves if the process can no longer be sampled.
async fn rss_exceeds(pid: libc::pid_t, limit: u64) {
    let page = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as u64,
        _ => 4096,
    };
    let statm = format!("/proc/{pid}/statm");
    let mut ticker = tokio::time::interval(MEMORY_POLL);
    loop {
        ticker.tick().await;
        let Ok(raw) = tokio::fs::read_to_string(&statm).await else {
            return std::future::pending().await;
        };
        let resident = raw
            .split_whitespace()
            .nth(1)
            .and_then(|pages| pages.parse::<u64>().ok())
            .unwrap_or(0);
        let resident_bytes = resident.saturating_mul(page);
        if resident_bytes > limit {
            tracing::debug!(pid, resident_bytes, limit, "Memory limit exceeded");
            return;
        }
    }
}

/// Block until `pid` exits and collect its resource usage.
fn wait_child(pid: libc::pid_t) -> io::Result<(libc::c_int, libc::rusage)> {
    let mut status: libc::c_int = 0;
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if rc == pid {
            return Ok((status, usage));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Kills the child's process group unless it was reaped cleanly, and sweeps
/// up stragglers (background children) once the leader is gone.
struct ProcessGroup {
    pgid: libc::pid_t,
    done: bool,
}

impl ProcessGroup {
    fn new(pgid: libc::pid_t) -> Self {
        Self { pgid, done: false }
    }

    fn kill(&self) {
        unsafe {
            libc::kill(-self.pgid, libc::SIGKILL);
        }
    }

    /// True while some process is still in the group. A group id cannot be
    /// reused while it has members.
    fn occupied(&self) -> bool {
        unsafe { libc::kill(-self.pgid, 0) == 0 }
    }

    /// Sweep stragglers after the leader was reaped. Only signals a group
    /// that still has members, so an emptied group id that was handed out
    /// again is left alone.
    fn reaped(&mut self) {
        if !self.done {
            if self.occupied() {
                self.kill();
            }
            self.done = true;
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if !self.done {
            self.kill();
        }
    }
}

/// Regular files under `dir` and their total size.
///
/// The directory belongs to the candidate, who may have made parts of it
/// unreadable or removed them mid-scan; those parts are skipped.
fn measure_dir(dir: &Path) -> (u64, u64) {
    let mut count = 0;
    let mut size = 0;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %current.display(), error = %e, "Skipping unreadable output directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                pending.push(entry.path());
            } else if meta.is_file() {
                count += 1;
                size += meta.len();
            }
        }
    }
    (count, size)
}
