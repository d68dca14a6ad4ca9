//! Runs real `/bin/sh` and `python3` programs through the process sandbox.
#![cfg(target_os = "linux")]

use std::path::Path;

use themis::comparator;
use themis::config::SandboxConfig;
use themis::languages::{self, Toolchain};
use themis::sandbox::{Outcome, Prepared, Program, ProcessSandbox, ResourceLimits, Sandbox};
use themis_common::{ComparisonMode, Verdict};
use uuid::Uuid;

fn config(root: &tempfile::TempDir, isolate_filesystem: bool) -> SandboxConfig {
    SandboxConfig {
        root: root.path().to_path_buf(),
        output_limit_bytes: 64 * 1024,
        isolate_network: false,
        isolate_filesystem,
        ..SandboxConfig::default()
    }
}

/// Fully isolated sandbox, or `None` where the host forbids namespaces.
async fn jailed(root: &tempfile::TempDir) -> Option<ProcessSandbox> {
    let sandbox = ProcessSandbox::new(config(root, true)).unwrap();
    match sandbox.self_check().await {
        Ok(()) => Some(sandbox),
        Err(e) => {
            eprintln!("filesystem isolation unavailable, skipping: {e}");
            None
        }
    }
}

/// Jailed where possible, plain rlimits otherwise.
async fn sandbox(root: &tempfile::TempDir) -> ProcessSandbox {
    match jailed(root).await {
        Some(sandbox) => sandbox,
        None => ProcessSandbox::new(config(root, false)).unwrap(),
    }
}

fn has_python() -> bool {
    ["/usr/bin/python3", "/usr/local/bin/python3"]
        .iter()
        .any(|path| Path::new(path).exists())
}

fn shell() -> Toolchain {
    Toolchain::interpreted("main.sh", &["/bin/sh", "{build}/main.sh"])
}

/// Shell "compiled" by a syntax check
fn checked_shell() -> Toolchain {
    Toolchain::compiled(
        "main.sh",
        &["/bin/sh", "-n", "{build}/main.sh"],
        &["/bin/sh", "{build}/main.sh"],
    )
}

async fn build(sandbox: &ProcessSandbox, toolchain: &Toolchain, code: &str) -> Program {
    match sandbox.prepare(Uuid::new_v4(), toolchain, code).await.unwrap() {
        Prepared::Ready(program) => program,
        Prepared::CompileFailed { log } => panic!("unexpected build failure: {log}"),
    }
}

async fn run(code: &str, input: &str, limits: ResourceLimits) -> Outcome {
    let root = tempfile::tempdir().unwrap();
    let sandbox = sandbox(&root).await;
    let program = build(&sandbox, &shell(), code).await;
    sandbox.run(&program, input, limits).await.unwrap()
}

async fn run_python(code: &str, limits: ResourceLimits) -> Outcome {
    let root = tempfile::tempdir().unwrap();
    let sandbox = sandbox(&root).await;
    let program = build(&sandbox, &languages::python::toolchain(), code).await;
    sandbox.run(&program, "", limits).await.unwrap()
}

#[tokio::test]
async fn test_echo_is_accepted() {
    let outcome = run("read x; echo \"$x\"", "0 1\n", ResourceLimits::new(2000, 64)).await;

    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.stdout, "0 1\n");
    assert!(!outcome.timed_out);
    assert_eq!(
        comparator::score("0 1", &outcome.stdout, &outcome, ComparisonMode::Normalized),
        Verdict::Accepted
    );
}

#[tokio::test]
async fn test_infinite_loop_is_stopped_at_deadline() {
    let outcome = run("while :; do :; done", "", ResourceLimits::new(300, 64)).await;

    assert!(outcome.timed_out);
    assert!(outcome.elapsed_ms >= 300);
    assert!(outcome.elapsed_ms < 5000);
    assert_eq!(
        comparator::score("", &outcome.stdout, &outcome, ComparisonMode::Normalized),
        Verdict::TimeLimitExceeded
    );
}

#[tokio::test]
async fn test_nonzero_exit_is_runtime_error() {
    let outcome = run("echo partial; exit 3", "", ResourceLimits::new(2000, 64)).await;

    assert_eq!(outcome.exit_code, Some(3));
    assert!(!outcome.timed_out);
    assert_eq!(
        comparator::score("partial", &outcome.stdout, &outcome, ComparisonMode::Normalized),
        Verdict::RuntimeError
    );
}

#[tokio::test]
async fn test_output_flood_is_killed() {
    let outcome = run("while :; do echo flood; done", "", ResourceLimits::new(5000, 64)).await;

    assert!(!outcome.timed_out);
    assert!(outcome.signal.is_some());
    assert!(outcome.stdout.len() <= 64 * 1024);
    assert!(outcome.stderr.contains("Output limit"));
}

#[tokio::test]
async fn test_environment_is_scrubbed() {
    let outcome = run("echo \"[$HOME][$PATH]\"", "", ResourceLimits::new(2000, 64)).await;
    assert_eq!(outcome.stdout, "[][/usr/local/bin:/usr/bin:/bin]\n");
}

#[tokio::test]
async fn test_syntax_error_fails_the_build() {
    let root = tempfile::tempdir().unwrap();
    let sandbox = sandbox(&root).await;

    let prepared = sandbox
        .prepare(Uuid::new_v4(), &checked_shell(), "if then fi (")
        .await
        .unwrap();
    assert!(matches!(prepared, Prepared::CompileFailed { .. }));

    let program = build(&sandbox, &checked_shell(), "echo built").await;
    let outcome = sandbox
        .run(&program, "", ResourceLimits::new(2000, 64))
        .await
        .unwrap();
    assert_eq!(outcome.stdout, "built\n");
}

#[tokio::test]
async fn test_build_dir_is_removed_with_the_program() {
    let root = tempfile::tempdir().unwrap();
    let sandbox = sandbox(&root).await;

    let program = build(&sandbox, &shell(), "echo hi").await;
    let build_dir = program.build_dir.clone();
    assert!(build_dir.exists());

    drop(program);
    assert!(!build_dir.exists());
}

#[tokio::test]
async fn test_gradual_allocation_is_memory_limit_exceeded() {
    if !has_python() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let code = "chunks = []\nwhile True:\n    chunks.append(bytearray(1 << 20))\n";
    let outcome = run_python(code, ResourceLimits::new(5000, 64)).await;

    assert!(outcome.oom, "{outcome:?}");
    assert!(!outcome.timed_out);
    assert_eq!(
        comparator::score("", &outcome.stdout, &outcome, ComparisonMode::Normalized),
        Verdict::MemoryLimitExceeded
    );
}

#[tokio::test]
async fn test_single_large_allocation_is_memory_limit_exceeded() {
    if !has_python() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    // Refused in one piece by the address space ceiling
    let outcome = run_python("buffer = bytearray(512 << 20)\n", ResourceLimits::new(5000, 64)).await;

    assert!(outcome.oom, "{outcome:?}");
    assert_eq!(
        comparator::score("", &outcome.stdout, &outcome, ComparisonMode::Normalized),
        Verdict::MemoryLimitExceeded
    );
}

#[tokio::test]
async fn test_small_program_is_not_memory_limit_exceeded() {
    if !has_python() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let outcome = run_python("print(sum(range(1000)))\n", ResourceLimits::new(5000, 64)).await;

    assert_eq!(outcome.exit_code, Some(0), "{outcome:?}");
    assert!(!outcome.oom);
    assert_eq!(outcome.stdout, "499500\n");
}

#[tokio::test]
async fn test_writes_outside_the_work_directory_fail() {
    let root = tempfile::tempdir().unwrap();
    let Some(sandbox) = jailed(&root).await else {
        return;
    };
    let tmp_marker = format!("/tmp/themis-escape-{}", Uuid::new_v4());
    let code = format!(
        "echo x > ../escaped || echo parent-denied\n\
         echo x > {tmp_marker} || echo tmp-denied\n\
         echo x > own && echo own-written\n"
    );

    let program = build(&sandbox, &shell(), &code).await;
    let outcome = sandbox
        .run(&program, "", ResourceLimits::new(2000, 64))
        .await
        .unwrap();

    assert_eq!(outcome.stdout, "parent-denied\ntmp-denied\nown-written\n");
    assert!(!root.path().join("escaped").exists());
    assert!(!Path::new(&tmp_marker).exists());
}

#[tokio::test]
async fn test_build_dir_is_read_only_at_run_time() {
    let root = tempfile::tempdir().unwrap();
    let Some(sandbox) = jailed(&root).await else {
        return;
    };

    let program = build(&sandbox, &shell(), "echo x > \"$0\" || echo denied").await;
    let outcome = sandbox
        .run(&program, "", ResourceLimits::new(2000, 64))
        .await
        .unwrap();

    assert_eq!(outcome.stdout, "denied\n");
    let source = std::fs::read_to_string(program.build_dir.join("main.sh")).unwrap();
    assert!(source.starts_with("echo x"));
}

#[tokio::test]
async fn test_program_cannot_see_the_judge() {
    let root = tempfile::tempdir().unwrap();
    let Some(sandbox) = jailed(&root).await else {
        return;
    };
    let judge = std::process::id();
    let code = format!(
        "kill -0 {judge} 2>/dev/null && echo judge-visible\n\
         echo \"pid=$$\"\n\
         id -u\n"
    );

    let program = build(&sandbox, &shell(), &code).await;
    let outcome = sandbox
        .run(&program, "", ResourceLimits::new(2000, 64))
        .await
        .unwrap();

    let lines: Vec<&str> = outcome.stdout.lines().collect();
    assert_eq!(lines.len(), 2, "{outcome:?}");
    // Second process of its own PID namespace, after the init
    assert_eq!(lines[0], "pid=2");
    assert_ne!(lines[1], "0");
}
