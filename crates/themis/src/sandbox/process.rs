//! Process-based sandbox
//!
//! Every build and every run gets a fresh private directory under the
//! configured root. The child runs in its own session with rlimits applied
//! before exec and a scrubbed environment. With filesystem isolation on, it
//! also gets private mount, PID, IPC and UTS namespaces and a read-only
//! root in which only its work directory is writable; a root judge runs
//! it under a pooled unprivileged uid. The parent enforces the wall clock
//! and memory limits by killing the whole process group.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Pid, geteuid, pipe2};
use tempfile::TempDir;
use themis_common::{AppError, AppResult, SubmissionId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::{Duration, MissedTickBehavior, interval, sleep, timeout};
use tracing::{debug, info, warn};

use super::identity::{Identity, UidLease, UidPool};
use super::isolation::{ExitReport, IsolationPlan, JailPlan};
use super::jail::{Jail, WorkDir, c_path};
use super::memory::{self, MemorySample};
use super::{Outcome, Prepared, Program, ResourceLimits, Sandbox};
use crate::config::SandboxConfig;
use crate::constants::{ALLOCATION_FAILURE_MARKERS, DIAGNOSTIC_LIMIT_BYTES, SANDBOX_PATH};
use crate::languages::Toolchain;

/// How long to keep draining pipes after the child is reaped
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Process sandbox built on rlimits, sessions and namespaces
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    config: SandboxConfig,
    /// Present when the judge is root and can switch ids
    uids: Option<Arc<UidPool>>,
}

impl ProcessSandbox {
    /// Create the sandbox, making sure the root directory exists.
    pub fn new(config: SandboxConfig) -> AppResult<Self> {
        std::fs::create_dir_all(&config.root).map_err(|e| {
            AppError::SandboxError(format!(
                "Failed to create sandbox root {}: {}",
                config.root.display(),
                e
            ))
        })?;
        let uids = geteuid()
            .is_root()
            .then(|| Arc::new(UidPool::new(config.uid_base, config.uid_count)));
        if uids.is_some() {
            // Pooled uids reach their directories through the root
            let mode = std::fs::metadata(&config.root)?.permissions().mode();
            if mode & 0o001 == 0 {
                std::fs::set_permissions(
                    &config.root,
                    std::fs::Permissions::from_mode(mode | 0o011),
                )?;
            }
        }
        Ok(Self { config, uids })
    }

    /// Run a trivial program under the configured isolation.
    ///
    /// Fails when the host does not allow it, e.g. without CAP_SYS_ADMIN
    /// and with unprivileged user namespaces disabled.
    pub async fn self_check(&self) -> AppResult<()> {
        let scratch = self.private_dir("check-")?;
        let limits = ResourceLimits::new(5_000, 64);
        let outcome = self
            .supervise(Launch {
                command: vec!["/bin/sh".to_string(), "-c".to_string(), "exit 0".to_string()],
                cwd: scratch.path(),
                read_only: None,
                env: Vec::new(),
                input: "",
                limits,
                plan: IsolationPlan::new(
                    limits.time_limit_ms,
                    None,
                    self.config.output_limit_bytes,
                    self.config.isolate_network,
                ),
                output_limit: DIAGNOSTIC_LIMIT_BYTES as u64,
                kill_on_overflow: false,
            })
            .await?;

        if outcome.exit_code != Some(0) {
            return Err(AppError::SandboxError(format!(
                "Sandbox self-check failed: {}",
                compiler_log(&outcome)
            )));
        }
        info!(
            isolate_filesystem = self.config.isolate_filesystem,
            isolate_network = self.config.isolate_network,
            pooled_uids = self.uids.is_some(),
            "Sandbox self-check passed"
        );
        Ok(())
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn private_dir(&self, prefix: &str) -> AppResult<TempDir> {
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.config.root)
            .map_err(|e| AppError::SandboxError(format!("Failed to create {prefix}dir: {e}")))
    }

    /// Pick the program's identity and give it the work directory.
    async fn identity_for(&self, work_dir: &Path) -> AppResult<(Identity, Option<UidLease>)> {
        let lease = match &self.uids {
            Some(pool) => Some(pool.acquire().await?),
            None => None,
        };
        let identity = match &lease {
            Some(lease) => lease.identity(),
            None if self.config.isolate_filesystem => Identity::mapped(),
            None => Identity::Inherit,
        };
        if let Some((uid, gid)) = identity.owner() {
            std::os::unix::fs::chown(work_dir, Some(uid.as_raw()), Some(gid.as_raw()))?;
        }
        Ok((identity, lease))
    }

    /// Spawn a command under the given plan and supervise it to completion.
    async fn supervise(&self, launch: Launch<'_>) -> AppResult<Outcome> {
        let Some((program, args)) = launch.command.split_first() else {
            return Err(AppError::SandboxError("Empty command".to_string()));
        };

        // Held until the program is reaped
        let (identity, _lease) = self.identity_for(launch.cwd).await?;
        let mut plan = launch
            .plan
            .with_identity(identity, self.config.max_processes);

        let mut jail = None;
        let mut report_pipe = None;
        if self.config.isolate_filesystem {
            let mut work_dirs = vec![WorkDir {
                path: launch.cwd,
                writable: true,
            }];
            if let Some(path) = launch.read_only {
                work_dirs.push(WorkDir {
                    path,
                    writable: false,
                });
            }
            let built = Jail::build(&self.config.root, &work_dirs)?;
            let (reader, writer) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
                .map_err(|e| AppError::SandboxError(format!("Failed to create report pipe: {e}")))?;
            plan = plan.in_jail(JailPlan {
                root: c_path(built.root())?,
                mounts: built.mounts().to_vec(),
                cwd: c_path(launch.cwd)?,
                report_fd: writer.as_raw_fd(),
            });
            jail = Some(built);
            report_pipe = Some((reader, writer));
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(launch.cwd)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("TMPDIR", launch.cwd)
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let address_space_bytes = plan.address_space_bytes;
        // SAFETY: `apply` only issues raw syscalls, which is all that is
        // permitted between fork and exec.
        unsafe {
            command.pre_exec(move || plan.apply());
        }

        let started = Instant::now();
        let spawned = command
            .spawn()
            .map_err(|e| AppError::SandboxError(format!("Failed to spawn {program}: {e}")));
        // Only the child may hold the write end from here on
        let report_reader: Option<OwnedFd> = report_pipe.map(|(reader, _writer)| reader);
        let mut child = spawned?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::SandboxError("Child reaped before supervision".to_string()))?;
        // A jailed child is the keeper; it and the init it forks are not
        // the program
        let supervisor = jail.is_some().then_some(pid);

        let input = launch.input.as_bytes().to_vec();
        let stdin = child.stdin.take();
        let feeder = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                // The program may exit without reading everything
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            }
        });
        let stdout_task = tokio::spawn(capture(
            child.stdout.take(),
            launch.output_limit,
            launch.kill_on_overflow.then_some(pid),
        ));
        let stderr_task = tokio::spawn(capture(
            child.stderr.take(),
            DIAGNOSTIC_LIMIT_BYTES as u64,
            None,
        ));

        let deadline = sleep(Duration::from_millis(launch.limits.time_limit_ms));
        tokio::pin!(deadline);
        let mut ticker = interval(Duration::from_millis(self.config.memory_poll_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let memory_limit_kb = launch.limits.memory_limit_kb();
        let mut peak = MemorySample::default();

        let termination = loop {
            tokio::select! {
                status = child.wait() => break Termination::Exited(status),
                _ = &mut deadline => {
                    kill_group(pid);
                    break Termination::TimedOut;
                }
                _ = ticker.tick() => {
                    peak = peak.max(memory::sample_group(pid, supervisor));
                    if peak.resident_peak_kb > memory_limit_kb {
                        kill_group(pid);
                        break Termination::MemoryExceeded;
                    }
                }
            }
        };

        let (status, killed_at_deadline, killed_for_memory) = match termination {
            Termination::Exited(status) => (status, false, false),
            Termination::TimedOut => (child.wait().await, true, false),
            Termination::MemoryExceeded => (child.wait().await, false, true),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        // Stray descendants would keep the pipes open
        kill_group(pid);
        feeder.abort();

        let status = status.map_err(|e| AppError::SandboxError(format!("Failed to reap child: {e}")))?;
        // The keeper only exits like the init; the report has the program's
        // own status
        let status = report_reader
            .as_ref()
            .and_then(ExitReport::read_from)
            .map_or(status, |report| ExitStatus::from_raw(report.status));

        let (stdout, overflowed) = drain(stdout_task).await;
        let (stderr, _) = drain(stderr_task).await;
        drop(jail);

        let mut stderr = String::from_utf8_lossy(&stderr).into_owned();
        let address_space_kb = address_space_bytes.map(|bytes| bytes / 1024);
        let died_at_ceiling = !status.success()
            && address_space_kb.is_some_and(|ceiling| peak.virtual_peak_kb * 100 >= ceiling * 95);
        // A single allocation past the ceiling is refused outright and
        // never shows up in the samples
        let allocation_refused =
            !status.success() && address_space_kb.is_some() && reports_allocation_failure(&stderr);
        let cpu_exhausted = status.signal() == Some(Signal::SIGXCPU as i32);

        if overflowed && launch.kill_on_overflow {
            stderr = format!("Output limit of {} bytes exceeded", launch.output_limit);
        }

        Ok(Outcome {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr,
            exit_code: status.code(),
            signal: status.signal(),
            elapsed_ms,
            peak_memory_kb: peak.resident_peak_kb,
            timed_out: killed_at_deadline || cpu_exhausted,
            oom: killed_for_memory
                || peak.resident_peak_kb > memory_limit_kb
                || died_at_ceiling
                || allocation_refused,
            compile_failed: false,
        })
    }

    fn address_space_for(&self, limits: ResourceLimits, enabled: bool) -> Option<u64> {
        enabled.then(|| {
            limits.memory_limit_mb * self.config.address_space_multiplier.max(1) * 1024 * 1024
        })
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn prepare(
        &self,
        submission_id: SubmissionId,
        toolchain: &Toolchain,
        code: &str,
    ) -> AppResult<Prepared> {
        let workspace = Workspace(self.private_dir("build-")?);
        let build_dir = workspace.path().to_path_buf();

        tokio::fs::write(build_dir.join(&toolchain.source_file), code).await?;

        if let Some(compile) = &toolchain.compile {
            let limits = ResourceLimits::new(
                self.config.compile_time_limit_ms,
                self.config.compile_memory_limit_mb,
            );
            let plan = IsolationPlan::new(
                limits.time_limit_ms,
                None,
                limits.memory_limit_mb * 1024 * 1024,
                self.config.isolate_network,
            );
            let outcome = self
                .supervise(Launch {
                    command: Toolchain::resolve(compile, &build_dir),
                    cwd: &build_dir,
                    read_only: None,
                    env: toolchain.resolved_env(&build_dir),
                    input: "",
                    limits,
                    plan,
                    output_limit: DIAGNOSTIC_LIMIT_BYTES as u64,
                    kill_on_overflow: false,
                })
                .await?;

            if outcome.timed_out {
                debug!(submission_id = %submission_id, "Compilation timed out");
                return Ok(Prepared::CompileFailed {
                    log: "Compilation timed out".to_string(),
                });
            }
            if outcome.exit_code != Some(0) {
                debug!(submission_id = %submission_id, "Compilation failed");
                return Ok(Prepared::CompileFailed {
                    log: compiler_log(&outcome),
                });
            }
        }

        seal(&build_dir).await?;

        Ok(Prepared::Ready(
            Program::from_toolchain(submission_id, &build_dir, toolchain).holding(workspace),
        ))
    }

    async fn run(
        &self,
        program: &Program,
        input: &str,
        limits: ResourceLimits,
    ) -> AppResult<Outcome> {
        let limits = limits.clamped(self.config.max_time_limit_ms, self.config.max_memory_limit_mb);
        let scratch = self.private_dir("run-")?;

        let plan = IsolationPlan::new(
            limits.time_limit_ms,
            self.address_space_for(limits, program.limit_address_space),
            self.config.output_limit_bytes,
            self.config.isolate_network,
        );

        let outcome = self
            .supervise(Launch {
                command: program.command.clone(),
                cwd: scratch.path(),
                read_only: Some(&program.build_dir),
                env: program.env.clone(),
                input,
                limits,
                plan,
                output_limit: self.config.output_limit_bytes,
                kill_on_overflow: true,
            })
            .await?;

        if let Err(e) = scratch.close() {
            warn!(submission_id = %program.submission_id, "Failed to remove run directory: {}", e);
        }
        Ok(outcome)
    }
}

/// Everything needed to launch one supervised process
struct Launch<'a> {
    command: Vec<String>,
    /// Working directory, the only writable one
    cwd: &'a Path,
    /// Directory the program may read but not change
    read_only: Option<&'a Path>,
    env: Vec<(String, String)>,
    input: &'a str,
    limits: ResourceLimits,
    plan: IsolationPlan,
    output_limit: u64,
    kill_on_overflow: bool,
}

enum Termination {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    MemoryExceeded,
}

/// Private build directory, writable again just before removal
#[derive(Debug)]
struct Workspace(TempDir);

impl Workspace {
    fn path(&self) -> &Path {
        self.0.path()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = std::fs::set_permissions(self.0.path(), std::fs::Permissions::from_mode(0o755));
    }
}

/// Make the build directory read-only for the runs that follow.
async fn seal(build_dir: &Path) -> AppResult<()> {
    tokio::fs::set_permissions(build_dir, std::fs::Permissions::from_mode(0o555)).await?;
    Ok(())
}

fn compiler_log(outcome: &Outcome) -> String {
    let mut log = outcome.stderr.trim_end().to_string();
    let stdout = outcome.stdout.trim_end();
    if !stdout.is_empty() {
        if !log.is_empty() {
            log.push('\n');
        }
        log.push_str(stdout);
    }
    if log.is_empty() {
        log = match outcome.signal {
            Some(signal) => format!("Compiler killed by signal {signal}"),
            None => format!("Compiler exited with code {}", outcome.exit_code.unwrap_or(-1)),
        };
    }
    truncate_utf8(log, DIAGNOSTIC_LIMIT_BYTES)
}

fn truncate_utf8(mut text: String, limit: usize) -> String {
    if text.len() > limit {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

/// Read a pipe up to `limit` bytes.
///
/// With `kill_pid` set, the process group is killed as soon as the limit is
/// crossed; otherwise the rest is drained and discarded.
async fn capture<R>(reader: Option<R>, limit: u64, kill_pid: Option<u32>) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };

    let limit = limit as usize;
    let mut captured = Vec::new();
    let mut overflowed = false;
    let mut chunk = vec![0u8; 8192];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if overflowed {
            continue;
        }
        let room = limit.saturating_sub(captured.len());
        if n > room {
            captured.extend_from_slice(&chunk[..room]);
            overflowed = true;
            if let Some(pid) = kill_pid {
                kill_group(pid);
                break;
            }
        } else {
            captured.extend_from_slice(&chunk[..n]);
        }
    }

    (captured, overflowed)
}

async fn drain(task: tokio::task::JoinHandle<(Vec<u8>, bool)>) -> (Vec<u8>, bool) {
    match timeout(PIPE_DRAIN_GRACE, task).await {
        Ok(Ok(captured)) => captured,
        _ => (Vec::new(), false),
    }
}

fn reports_allocation_failure(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    ALLOCATION_FAILURE_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker))
}

fn kill_group(pid: u32) {
    // ESRCH once the group is gone
    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "é".repeat(10);
        let truncated = truncate_utf8(text, 5);
        assert_eq!(truncated, "éé");
    }

    #[test]
    fn test_compiler_log_falls_back_to_status() {
        let outcome = Outcome {
            exit_code: Some(1),
            ..Outcome::default()
        };
        assert_eq!(compiler_log(&outcome), "Compiler exited with code 1");

        let outcome = Outcome {
            stderr: "main.cpp:1: error\n".to_string(),
            exit_code: Some(1),
            ..Outcome::default()
        };
        assert_eq!(compiler_log(&outcome), "main.cpp:1: error");
    }

    #[test]
    fn test_allocation_failures_are_recognised() {
        assert!(reports_allocation_failure(
            "Traceback (most recent call last):\n  File \"main.py\", line 1\nMemoryError\n"
        ));
        assert!(reports_allocation_failure(
            "terminate called after throwing an instance of 'std::bad_alloc'"
        ));
        assert!(reports_allocation_failure("memory allocation of 1073741824 bytes failed"));
        assert!(!reports_allocation_failure("Segmentation fault"));
        assert!(!reports_allocation_failure(""));
    }

    #[tokio::test]
    async fn test_capture_stops_at_limit() {
        let data: &[u8] = &[b'x'; 100];
        let (captured, overflowed) = capture(Some(data), 10, None).await;
        assert_eq!(captured.len(), 10);
        assert!(overflowed);

        let (captured, overflowed) = capture(Some(&b"ok"[..]), 10, None).await;
        assert_eq!(captured, b"ok");
        assert!(!overflowed);
    }
}
