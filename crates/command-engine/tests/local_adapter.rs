//! Local execution through the engine

mod common;

use command_engine::{
    Adapter, AdapterOptions, CommandDescriptor, Engine, EngineConfig, Error, ErrorKind,
    ExecControl, LocalAdapter, LocalOptions, OutputChunk, OutputSource, ResourceKind, Stdin,
    TransferOptions,
};
use std::time::{Duration, Instant};

#[smol_potat::test]
async fn test_echo_hi() {
    common::init_tracing();
    let engine = Engine::default();
    let result = engine
        .execute(
            &CommandDescriptor::new("echo")
                .arg("hi")
                .on(LocalOptions::default()),
        )
        .await
        .unwrap();

    assert_eq!(result.stdout, "hi\n");
    assert_eq!(result.stderr, "");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.signal, None);
    assert_eq!(result.adapter, "local");
    assert_eq!(result.host, None);
}

#[smol_potat::test]
async fn test_nonzero_exit_carries_output() {
    let engine = Engine::default();
    let descriptor = CommandDescriptor::new("echo partial; echo oops >&2; exit 3").shell(true);

    match engine.execute(&descriptor).await.unwrap_err() {
        Error::Command { result, reason, .. } => {
            assert_eq!(result.exit_code, Some(3));
            assert_eq!(result.stdout, "partial\n");
            assert_eq!(result.stderr, "oops\n");
            assert_eq!(reason, None);
        }
        other => panic!("expected command error, got {:?}", other),
    }

    let result = engine.execute(&descriptor.nothrow(true)).await.unwrap();
    assert_eq!(result.exit_code, Some(3));
    assert!(!result.success());
}

#[smol_potat::test]
async fn test_env_and_cwd() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::default();
    let result = engine
        .execute(
            &CommandDescriptor::new("echo \"$GREETING\" && pwd")
                .shell(true)
                .env("GREETING", "hello there")
                .cwd(dir.path()),
        )
        .await
        .unwrap();

    let canonical = dir.path().canonicalize().unwrap();
    let mut lines = result.stdout.lines();
    assert_eq!(lines.next(), Some("hello there"));
    let pwd = std::path::PathBuf::from(lines.next().unwrap())
        .canonicalize()
        .unwrap();
    assert_eq!(pwd, canonical);
}

#[smol_potat::test]
async fn test_args_are_not_shell_expanded() {
    let result = Engine::default()
        .execute(&CommandDescriptor::new("printf").args(["%s|", "$HOME", "a b"]))
        .await
        .unwrap();
    assert_eq!(result.stdout, "$HOME|a b|");
}

#[smol_potat::test]
async fn test_large_stdin_while_draining_output() {
    let input: String = (0..20_000).map(|i| format!("line {}\n", i)).collect();
    let result = Engine::default()
        .execute(&CommandDescriptor::new("cat").stdin(input.clone()))
        .await
        .unwrap();
    assert_eq!(result.stdout, input);
}

#[smol_potat::test]
async fn test_stream_stdin() {
    let reader = futures::io::Cursor::new(b"b\na\nc\n".to_vec());
    let result = Engine::default()
        .execute(&CommandDescriptor::new("sort").stdin(Stdin::stream(reader)))
        .await
        .unwrap();
    assert_eq!(result.stdout, "a\nb\nc\n");
}

#[smol_potat::test]
async fn test_timeout_kills_process_and_reaps_it() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("pid");
    let engine = Engine::new(EngineConfig {
        kill_grace_ms: 200,
        ..EngineConfig::default()
    })
    .unwrap();

    let script = format!(
        "trap '' TERM; echo $$ > {}; echo started; sleep 30",
        pidfile.display()
    );
    let started = Instant::now();
    let err = engine
        .execute(
            &CommandDescriptor::new("sh")
                .arg("-c")
                .arg(script)
                .timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_millis(300 + 200 + 1_000));
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(!err.is_cancelled());
    assert_eq!(err.partial_output().unwrap().stdout, "started\n");

    let pid: i32 = std::fs::read_to_string(&pidfile)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    // a zombie would still accept signal 0
    let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None);
    assert_eq!(alive, Err(nix::errno::Errno::ESRCH));
}

#[smol_potat::test]
async fn test_nothrow_does_not_hide_timeout() {
    let err = Engine::default()
        .execute(
            &CommandDescriptor::new("sleep")
                .arg("5")
                .nothrow(true)
                .timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[smol_potat::test]
async fn test_output_limit() {
    let engine = Engine::new(EngineConfig {
        max_buffer_bytes: 4096,
        kill_grace_ms: 200,
        ..EngineConfig::default()
    })
    .unwrap();
    let err = engine
        .execute(&CommandDescriptor::new("yes").nothrow(true))
        .await
        .unwrap_err();

    match err {
        Error::Command { result, reason, .. } => {
            assert!(result.stdout.is_empty());
            assert!(reason.unwrap().contains("4096"));
        }
        other => panic!("expected command error, got {:?}", other),
    }
}

#[smol_potat::test]
async fn test_missing_program() {
    let err = Engine::default()
        .execute(&CommandDescriptor::new("definitely-not-a-real-program-xyz"))
        .await
        .unwrap_err();
    match err {
        Error::NotFound { kind, name } => {
            assert_eq!(kind, ResourceKind::Program);
            assert_eq!(name, "definitely-not-a-real-program-xyz");
        }
        other => panic!("expected not found, got {:?}", other),
    }
}

#[smol_potat::test]
async fn test_live_output_in_order() {
    let (tx, rx) = async_channel::bounded::<OutputChunk>(1);
    let engine = Engine::default();
    let descriptor =
        CommandDescriptor::new("for i in 1 2 3; do echo out$i; echo err$i >&2; done").shell(true);

    let collector = smol::spawn(async move {
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Ok(chunk) = rx.recv().await {
            match chunk.source {
                OutputSource::Stdout => stdout.push_str(&chunk.data),
                OutputSource::Stderr => stderr.push_str(&chunk.data),
            }
        }
        (stdout, stderr)
    });

    let result = engine
        .execute_with(
            &descriptor,
            ExecControl {
                output: Some(tx),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (stdout, stderr) = collector.await;
    assert_eq!(stdout, "out1\nout2\nout3\n");
    assert_eq!(stderr, "err1\nerr2\nerr3\n");
    assert_eq!(result.stdout, stdout);
}

#[smol_potat::test]
async fn test_local_transfer_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let original = dir.path().join("original.bin");
    let uploaded = dir.path().join("uploaded.bin");
    let downloaded = dir.path().join("downloaded.bin");
    let bytes: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
    std::fs::write(&original, &bytes).unwrap();

    let engine = Engine::default();
    let local = AdapterOptions::Local(LocalOptions::default());
    engine
        .upload_file(
            &local,
            &original,
            &uploaded.display().to_string(),
            &TransferOptions::default(),
        )
        .await
        .unwrap();
    engine
        .download_file(
            &local,
            &uploaded.display().to_string(),
            &downloaded,
            &TransferOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read(&downloaded).unwrap(), bytes);
}

#[smol_potat::test]
async fn test_transfer_failure_kind() {
    let err = LocalAdapter::new()
        .upload_file(
            std::path::Path::new("/no/such/file"),
            "/tmp/never-written",
            &TransferOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transfer);
}
