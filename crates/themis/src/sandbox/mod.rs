//! Resource-bounded execution of untrusted programs
//!
//! [`Sandbox`] is the only seam through which the pipeline runs foreign
//! code. Implementations must enforce the limits themselves: a program is
//! never trusted to terminate, stay within memory, or leave the judge alone.
//!
//! Execution problems the *program* causes (timeouts, crashes, memory
//! blowups, failed builds) are reported inside [`Outcome`]. An `Err` means
//! the sandbox itself failed and the attempt may be retried.

mod identity;
mod isolation;
mod jail;
mod memory;
mod process;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use themis_common::{AppResult, SubmissionId};

use crate::languages::Toolchain;

pub use process::ProcessSandbox;

/// Hard ceilings for one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Wall-clock limit in milliseconds
    pub time_limit_ms: u64,
    /// Memory limit in megabytes
    pub memory_limit_mb: u64,
}

impl ResourceLimits {
    pub fn new(time_limit_ms: u64, memory_limit_mb: u64) -> Self {
        Self {
            time_limit_ms,
            memory_limit_mb,
        }
    }

    pub fn memory_limit_kb(&self) -> u64 {
        self.memory_limit_mb * 1024
    }

    /// Clamp to the judge-wide maxima.
    pub fn clamped(self, max_time_limit_ms: u64, max_memory_limit_mb: u64) -> Self {
        Self {
            time_limit_ms: self.time_limit_ms.min(max_time_limit_ms),
            memory_limit_mb: self.memory_limit_mb.min(max_memory_limit_mb),
        }
    }
}

/// Raw result of running one program on one input
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub stdout: String,
    /// Truncated diagnostic output (stderr, or the compiler log)
    pub stderr: String,
    /// Exit code, absent when killed by a signal
    pub exit_code: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
    pub elapsed_ms: u64,
    pub peak_memory_kb: u64,
    /// Forcibly stopped at the time limit
    pub timed_out: bool,
    /// Forcibly stopped (or died) at the memory limit
    pub oom: bool,
    /// The build step failed; nothing was executed
    pub compile_failed: bool,
}

impl Outcome {
    /// Outcome standing in for every test case when the build fails.
    pub fn compile_failure(log: impl Into<String>) -> Self {
        Self {
            stderr: log.into(),
            compile_failed: true,
            ..Self::default()
        }
    }

    /// A clean exit with code 0.
    pub fn success(stdout: impl Into<String>, elapsed_ms: u64, peak_memory_kb: u64) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: Some(0),
            elapsed_ms,
            peak_memory_kb,
            ..Self::default()
        }
    }

    pub fn peak_memory_mb(&self) -> f64 {
        self.peak_memory_kb as f64 / 1024.0
    }
}

/// A built program ready to be run against test inputs
#[derive(Debug)]
pub struct Program {
    pub submission_id: SubmissionId,
    /// Directory holding the build artifacts
    pub build_dir: PathBuf,
    /// Fully resolved run command
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub limit_address_space: bool,
    workspace: Option<Arc<dyn Send + Sync + std::fmt::Debug>>,
}

impl Program {
    pub fn new(submission_id: SubmissionId, build_dir: &Path, command: Vec<String>) -> Self {
        Self {
            submission_id,
            build_dir: build_dir.to_path_buf(),
            command,
            env: Vec::new(),
            limit_address_space: true,
            workspace: None,
        }
    }

    /// Build a program from a toolchain's run command.
    pub fn from_toolchain(submission_id: SubmissionId, build_dir: &Path, toolchain: &Toolchain) -> Self {
        Self {
            submission_id,
            build_dir: build_dir.to_path_buf(),
            command: Toolchain::resolve(&toolchain.run, build_dir),
            env: toolchain.resolved_env(build_dir),
            limit_address_space: toolchain.limit_address_space,
            workspace: None,
        }
    }

    /// Keep `guard` alive for as long as the program exists; the build
    /// directory is removed when it drops.
    pub(crate) fn holding<G: Send + Sync + std::fmt::Debug + 'static>(mut self, guard: G) -> Self {
        self.workspace = Some(Arc::new(guard));
        self
    }
}

/// Result of the build step
#[derive(Debug)]
pub enum Prepared {
    Ready(Program),
    CompileFailed { log: String },
}

/// Capability to build and run untrusted programs under hard limits
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Write the source into a private build directory and build it.
    async fn prepare(
        &self,
        submission_id: SubmissionId,
        toolchain: &Toolchain,
        code: &str,
    ) -> AppResult<Prepared>;

    /// Run a prepared program on one input under `limits`.
    async fn run(&self, program: &Program, input: &str, limits: ResourceLimits)
        -> AppResult<Outcome>;
}
