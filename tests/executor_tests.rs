use std::path::Path;
use std::time::{Duration, Instant};

use judge_runner::config::RunnerConfig;
use judge_runner::error::RunnerError;
use judge_runner::task::{JudgeStatus, ResourceUsage};
use judge_runner::worker::{Executor, Invocation, Termination};
use tokio_util::sync::CancellationToken;

/// Create a test executor with default configuration
fn test_executor() -> Executor {
    Executor::new(&RunnerConfig::default())
}

fn shell(dir: &Path, script: &str) -> Invocation {
    Invocation::new("/bin/sh", dir).args(["-c", script])
}

#[tokio::test]
async fn test_execute_writes_stdout_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");
    let executor = test_executor();

    let invocation = shell(dir.path(), "echo hello").stdout(&out);
    let result = executor
        .execute(&invocation, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.termination, Termination::Exited(0));
    assert!(!result.timed_out);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello\n");
    assert!(result.usage.time_msecs >= 0);
    assert!(result.usage.memory_bytes > 0);
    assert_eq!(result.verdict(&ResourceUsage::new(1000, 256 << 20), None), None);
}

#[tokio::test]
async fn test_execute_stdin_redirect() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.txt");
    let out = dir.path().join("out.txt");
    std::fs::write(&input, "1 2\n3 4\n").unwrap();

    let invocation = Invocation::new("/bin/cat", dir.path()).stdin(&input).stdout(&out);
    let result = test_executor()
        .execute(&invocation, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.termination.success());
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "1 2\n3 4\n");
}

#[tokio::test]
async fn test_execute_nonzero_exit_is_runtime_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = test_executor()
        .execute(&shell(dir.path(), "exit 3"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.termination, Termination::Exited(3));
    assert_eq!(
        result.verdict(&ResourceUsage::unbounded(), None),
        Some(JudgeStatus::RuntimeError)
    );
    // The leak exit code only matters when it is the one configured.
    assert_eq!(
        result.verdict(&ResourceUsage::unbounded(), Some(3)),
        Some(JudgeStatus::MemoryLeak)
    );
}

/// A program sleeping past its limit is killed at the deadline and judged
/// time_limit_exceeded, with the measured time at least the limit.
#[tokio::test]
async fn test_execute_sleep_exceeds_time_limit() {
    let dir = tempfile::tempdir().unwrap();
    let limits = ResourceUsage::new(1000, 256 * 1024 * 1024);
    let invocation = Invocation::new("/bin/sleep", dir.path())
        .arg("5")
        .limits(limits);

    let started = Instant::now();
    let result = test_executor()
        .execute(&invocation, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.timed_out);
    assert!(result.usage.time_msecs >= 1000);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(
        result.verdict(&limits, None),
        Some(JudgeStatus::TimeLimitExceeded)
    );
}

#[tokio::test]
async fn test_execute_time_is_normalized_by_slowness() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RunnerConfig::default();
    config.relative_slowness = 2.0;
    let executor = Executor::new(&config);

    // 1.5 s on the reference machine is 3 s on this one.
    let limits = ResourceUsage::new(1500, -1);
    let invocation = Invocation::new("/bin/sleep", dir.path())
        .arg("1")
        .limits(limits);
    let result = executor
        .execute(&invocation, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!result.timed_out);
    assert!(result.usage.time_msecs >= 400, "time {}", result.usage.time_msecs);
    assert!(result.usage.time_msecs < 1500, "time {}", result.usage.time_msecs);
    assert_eq!(result.verdict(&limits, None), None);
}

#[tokio::test]
async fn test_execute_cancellation_kills_process() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let invocation = Invocation::new("/bin/sleep", dir.path()).arg("30");
    let result = test_executor().execute(&invocation, &cancel).await;

    assert!(matches!(result, Err(RunnerError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_execute_already_cancelled_does_not_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let invocation = shell(dir.path(), &format!("touch {}", marker.display()));
    let result = test_executor().execute(&invocation, &cancel).await;

    assert!(matches!(result, Err(RunnerError::Cancelled)));
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_execute_missing_program() {
    let dir = tempfile::tempdir().unwrap();
    let invocation = Invocation::new("/nonexistent/program", dir.path());
    let result = test_executor()
        .execute(&invocation, &CancellationToken::new())
        .await;

    match result {
        Err(e @ RunnerError::Spawn { .. }) => assert!(e.is_infrastructure()),
        other => panic!("expected spawn error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_execute_environment_is_fixed() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("env.txt");
    let invocation =
        shell(dir.path(), "echo \"$ONLINE_JUDGE $ACMOJ ${HOME:-unset}\"").stdout(&out);

    test_executor()
        .execute(&invocation, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&out).unwrap(), "true true unset\n");
}

#[tokio::test]
async fn test_execute_file_size_limit() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("big.out");
    let limits = ResourceUsage {
        time_msecs: 5000,
        memory_bytes: -1,
        file_count: -1,
        file_size_bytes: 1000,
    };
    let invocation = shell(dir.path(), "exec head -c 100000 /dev/zero")
        .stdout(&out)
        .limits(limits);

    let result = test_executor()
        .execute(&invocation, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.termination, Termination::Signaled(libc::SIGXFSZ));
    assert!(std::fs::metadata(&out).unwrap().len() <= 1000);
    assert_eq!(
        result.verdict(&limits, None),
        Some(JudgeStatus::DiskLimitExceeded)
    );
}

#[tokio::test]
async fn test_execute_file_count_limit() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path().join("run");
    std::fs::create_dir(&run_dir).unwrap();
    let limits = ResourceUsage {
        time_msecs: 5000,
        memory_bytes: -1,
        file_count: 2,
        file_size_bytes: -1,
    };
    let invocation = shell(&run_dir, "for i in 1 2 3; do echo $i > f$i; done")
        .limits(limits)
        .watch_output(&run_dir);

    let result = test_executor()
        .execute(&invocation, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.termination.success());
    assert_eq!(result.usage.file_count, 3);
    assert_eq!(result.usage.file_size_bytes, 6);
    assert_eq!(
        result.verdict(&limits, None),
        Some(JudgeStatus::DiskLimitExceeded)
    );
}

#[tokio::test]
async fn test_execute_stderr_is_separate() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let err = dir.path().join("err");
    let invocation = shell(dir.path(), "echo ok; echo oops >&2")
        .stdout(&out)
        .stderr(&err);

    test_executor()
        .execute(&invocation, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&out).unwrap(), "ok\n");
    assert_eq!(std::fs::read_to_string(&err).unwrap(), "oops\n");
}


#[tokio::test]
async fn test_execute_memory_hog_is_mle() {
    let dir = tempfile::tempdir().unwrap();
    let limits = ResourceUsage::new(10_000, 64 * 1024 * 1024);
    // The shell keeps the whole substitution in memory.
    let invocation = shell(
        dir.path(),
        "x=$(head -c 200000000 /dev/zero | tr '\\0' a); echo ${#x}",
    )
    .limits(limits)
    .limit_address_space(true);

    let started = Instant::now();
    let result = test_executor()
        .execute(&invocation, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!result.timed_out);
    assert!(!result.termination.success());
    assert_eq!(
        result.verdict(&limits, None),
        Some(JudgeStatus::MemoryLimitExceeded)
    );
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_execute_unreadable_output_dir_is_measured_leniently() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path().join("run");
    std::fs::create_dir(&run_dir).unwrap();
    let invocation = shell(
        &run_dir,
        "mkdir locked && echo x > locked/f && echo y > top && chmod 000 locked",
    )
    .limits(ResourceUsage::new(5000, -1))
    .watch_output(&run_dir);

    let result = test_executor()
        .execute(&invocation, &CancellationToken::new())
        .await;

    std::process::Command::new("chmod")
        .args(["755", "locked"])
        .current_dir(&run_dir)
        .status()
        .unwrap();
    let result = result.unwrap();
    assert!(result.termination.success());
    assert!(result.usage.file_count >= 1);
    assert_eq!(result.verdict(&ResourceUsage::new(5000, -1), None), None);
}

#[tokio::test]
async fn test_execute_background_children_are_swept() {
    let dir = tempfile::tempdir().unwrap();
    let invocation = shell(dir.path(), "sleep 30 >/dev/null 2>&1 & echo $! > bg.pid");

    let started = Instant::now();
    let result = test_executor()
        .execute(&invocation, &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.termination.success());
    assert!(started.elapsed() < Duration::from_secs(5));

    let pid: i32 = std::fs::read_to_string(dir.path().join("bg.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    // Dead means gone, or a zombie waiting for init.
    let dead = || match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z')),
    };
    let deadline = Instant::now() + Duration::from_secs(2);
    while !dead() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(dead(), "background sleep {pid} outlived the run");
}
