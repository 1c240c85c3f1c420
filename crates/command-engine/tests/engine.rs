//! Dispatch, retry and cancellation behaviour of the engine

mod common;

use command_engine::{
    CommandDescriptor, Deadline, Engine, EngineConfig, Error, ErrorKind, ExecControl,
    RetryPolicy, Stdin, cancellation,
};
use smol::Timer;
use std::path::Path;
use std::time::{Duration, Instant};

fn retrying(max_retries: u32) -> Engine {
    Engine::new(EngineConfig {
        retry: RetryPolicy {
            initial_delay_ms: 10,
            max_delay_ms: 50,
            ..RetryPolicy::with_retries(max_retries)
        },
        ..EngineConfig::default()
    })
    .unwrap()
}

/// Shell snippet that bumps a counter file and succeeds from the `succeed_at`th run on
fn flaky(counter: &Path, succeed_at: u32) -> CommandDescriptor {
    let script = format!(
        "n=$(cat {f} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {f}; echo run $n; [ $n -ge {k} ]",
        f = counter.display(),
        k = succeed_at
    );
    CommandDescriptor::new(script).shell(true)
}

fn runs(counter: &Path) -> u32 {
    std::fs::read_to_string(counter)
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

#[smol_potat::test]
async fn test_retry_until_success() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");

    let result = retrying(2).execute(&flaky(&counter, 3)).await.unwrap();
    assert_eq!(result.stdout, "run 3\n");
    assert_eq!(runs(&counter), 3);
}

#[smol_potat::test]
async fn test_retries_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");

    let err = retrying(2).execute(&flaky(&counter, 10)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Command);
    assert_eq!(err.result().unwrap().stdout, "run 3\n");
    assert_eq!(runs(&counter), 3);
}

#[smol_potat::test]
async fn test_no_retries_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");

    Engine::default()
        .execute(&flaky(&counter, 2))
        .await
        .unwrap_err();
    assert_eq!(runs(&counter), 1);
}

#[smol_potat::test]
async fn test_output_overflow_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    let engine = Engine::new(EngineConfig {
        max_buffer_bytes: 4096,
        kill_grace_ms: 200,
        retry: RetryPolicy {
            initial_delay_ms: 10,
            ..RetryPolicy::with_retries(2)
        },
        ..EngineConfig::default()
    })
    .unwrap();

    let err = engine
        .execute(
            &CommandDescriptor::new(format!("echo 1 >> {}; yes", counter.display())).shell(true),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Command);
    assert_eq!(std::fs::read_to_string(&counter).unwrap(), "1\n");
}

#[smol_potat::test]
async fn test_nothrow_result_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");

    let result = retrying(3)
        .execute(&flaky(&counter, 10).nothrow(true))
        .await
        .unwrap();
    assert_eq!(result.exit_code, Some(1));
    assert_eq!(runs(&counter), 1);
}

#[smol_potat::test]
async fn test_stream_stdin_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    let reader = futures::io::Cursor::new(b"input".to_vec());

    let err = retrying(3)
        .execute(&flaky(&counter, 10).stdin(Stdin::stream(reader)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Command);
    assert_eq!(runs(&counter), 1);
}

#[smol_potat::test]
async fn test_buffered_stdin_is_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    let script = format!(
        "read line; n=$(cat {f} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {f}; echo $line; [ $n -ge 2 ]",
        f = counter.display()
    );

    let result = retrying(1)
        .execute(&CommandDescriptor::new(script).shell(true).stdin("again"))
        .await
        .unwrap();
    assert_eq!(result.stdout, "again\n");
    assert_eq!(runs(&counter), 2);
}

#[smol_potat::test]
async fn test_configuration_errors_are_not_retried() {
    let started = Instant::now();
    let err = retrying(5)
        .execute(&CommandDescriptor::new("echo").cwd("/no/such/directory"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[smol_potat::test]
async fn test_empty_command_fails_before_spawn() {
    let err = Engine::default()
        .execute(&CommandDescriptor::new("  "))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[smol_potat::test]
async fn test_cancel_running_command() {
    let (handle, signal) = cancellation();
    let engine = Engine::default();
    let descriptor = CommandDescriptor::new("echo begun; sleep 30").shell(true);

    let canceller = smol::spawn(async move {
        Timer::after(Duration::from_millis(200)).await;
        handle.cancel();
    });
    let started = Instant::now();
    let err = engine
        .execute_with(
            &descriptor,
            ExecControl {
                cancel: Some(signal),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    canceller.await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(err.is_cancelled());
    match err {
        Error::Timeout {
            deadline, partial, ..
        } => {
            assert_eq!(deadline, Deadline::Cancelled);
            assert_eq!(partial.stdout, "begun\n");
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[smol_potat::test]
async fn test_cancel_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let (handle, signal) = cancellation();
    handle.cancel();

    let err = Engine::default()
        .execute_with(
            &CommandDescriptor::new("touch").arg(marker.display().to_string()),
            ExecControl {
                cancel: Some(signal),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(!marker.exists());
}

#[smol_potat::test]
async fn test_cancel_stops_retrying() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    let engine = Engine::new(EngineConfig {
        retry: RetryPolicy {
            initial_delay_ms: 5_000,
            ..RetryPolicy::with_retries(3)
        },
        ..EngineConfig::default()
    })
    .unwrap();
    let (handle, signal) = cancellation();

    let canceller = smol::spawn(async move {
        Timer::after(Duration::from_millis(300)).await;
        handle.cancel();
    });
    let started = Instant::now();
    let err = engine
        .execute_with(
            &flaky(&counter, 10),
            ExecControl {
                cancel: Some(signal),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    canceller.await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(err.kind(), ErrorKind::Command);
    assert_eq!(runs(&counter), 1);
}

#[smol_potat::test]
async fn test_default_timeout_from_config() {
    let engine = Engine::new(
        EngineConfig::from_yaml_str("default_timeout_ms: 150\nkill_grace_ms: 100\n").unwrap(),
    )
    .unwrap();

    let err = engine
        .execute(&CommandDescriptor::new("sleep").arg("10"))
        .await
        .unwrap_err();
    match err {
        Error::Timeout { deadline, .. } => {
            assert_eq!(deadline, Deadline::Elapsed(Duration::from_millis(150)))
        }
        other => panic!("expected timeout, got {:?}", other),
    }

    // a per-command timeout wins over the default
    let result = engine
        .execute(
            &CommandDescriptor::new("sleep 0.3; echo late")
                .shell(true)
                .timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert_eq!(result.stdout, "late\n");
}

#[smol_potat::test]
async fn test_concurrent_calls_are_independent() {
    let engine = Engine::default();
    let calls = (0..8).map(|i| {
        let engine = &engine;
        async move {
            engine
                .execute(&CommandDescriptor::new(format!("echo {}", i)).shell(true))
                .await
        }
    });

    let results = futures::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap().stdout, format!("{}\n", i));
    }
}
