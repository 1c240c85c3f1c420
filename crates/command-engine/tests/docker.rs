//! Docker execution against a stub docker client

mod common;

use command_engine::{
    AdapterOptions, CommandDescriptor, DockerOptions, Engine, Error, ErrorKind, ResourceKind,
    TransferOptions,
};
use common::Stubs;

#[smol_potat::test]
async fn test_exec_in_running_container() {
    common::init_tracing();
    let stubs = Stubs::new();
    let engine = Engine::new(stubs.config()).unwrap();

    let result = engine
        .execute(
            &CommandDescriptor::new("echo \"$MODE\"; pwd")
                .shell(true)
                .env("MODE", "replica")
                .cwd("/")
                .on(DockerOptions::container("web")),
        )
        .await
        .unwrap();

    assert_eq!(result.stdout, "replica\n/\n");
    assert_eq!(result.adapter, "docker");
    assert_eq!(result.host.as_deref(), Some("web"));
    let log = stubs.log("docker");
    assert_eq!(log.len(), 1);
    assert!(log[0].starts_with("exec -w / -e MODE=replica web sh -c"), "{}", log[0]);
}

#[smol_potat::test]
async fn test_stdin_is_forwarded() {
    let stubs = Stubs::new();
    let engine = Engine::new(stubs.config()).unwrap();

    let result = engine
        .execute(
            &CommandDescriptor::new("wc")
                .arg("-l")
                .stdin("a\nb\nc\n")
                .on(DockerOptions::container("web")),
        )
        .await
        .unwrap();
    assert_eq!(result.stdout.trim(), "3");
    assert!(stubs.log("docker")[0].starts_with("exec -i web wc -l"));
}

#[smol_potat::test]
async fn test_image_mode_uses_throwaway_container() {
    let stubs = Stubs::new();
    let engine = Engine::new(stubs.config()).unwrap();

    let result = engine
        .execute(
            &CommandDescriptor::new("echo")
                .arg("from image")
                .on(DockerOptions::image("alpine:3.19")),
        )
        .await
        .unwrap();
    assert_eq!(result.stdout, "from image\n");
    assert_eq!(
        stubs.log("docker"),
        ["run --rm -i alpine:3.19 echo from image"]
    );
}

#[smol_potat::test]
async fn test_missing_container_is_not_found() {
    let stubs = Stubs::new();
    let engine = Engine::new(stubs.config()).unwrap();

    let err = engine
        .execute(
            &CommandDescriptor::new("true")
                .nothrow(true)
                .on(DockerOptions::container("missing")),
        )
        .await
        .unwrap_err();
    match err {
        Error::NotFound { kind, name } => {
            assert_eq!(kind, ResourceKind::Container);
            assert_eq!(name, "missing");
        }
        other => panic!("expected not found, got {:?}", other),
    }
}

#[smol_potat::test]
async fn test_command_failure_inside_container() {
    let stubs = Stubs::new();
    let engine = Engine::new(stubs.config()).unwrap();

    let err = engine
        .execute(
            &CommandDescriptor::new("echo broken >&2; exit 7")
                .shell(true)
                .on(DockerOptions::container("web")),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Command);
    let result = err.result().unwrap();
    assert_eq!(result.exit_code, Some(7));
    assert_eq!(result.stderr, "broken\n");
}

#[smol_potat::test]
async fn test_copy_round_trip() {
    let stubs = Stubs::new();
    let engine = Engine::new(stubs.config()).unwrap();
    let work = tempfile::tempdir().unwrap();
    let original = work.path().join("config.toml");
    let in_container = work.path().join("container-copy.toml");
    let fetched = work.path().join("fetched.toml");
    std::fs::write(&original, "port = 8080\n").unwrap();

    let web = AdapterOptions::Docker(DockerOptions::container("web"));
    engine
        .upload_file(
            &web,
            &original,
            &in_container.display().to_string(),
            &TransferOptions::default(),
        )
        .await
        .unwrap();
    engine
        .download_file(
            &web,
            &in_container.display().to_string(),
            &fetched,
            &TransferOptions {
                preserve_attributes: true,
                ..TransferOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&fetched).unwrap(), "port = 8080\n");
    let log = stubs.log("docker");
    assert_eq!(
        log[0],
        format!(
            "cp {} web:{}",
            original.display(),
            in_container.display()
        )
    );
    assert!(log[1].starts_with("cp -a web:"));
}

#[smol_potat::test]
async fn test_copy_from_missing_container_is_transfer_error() {
    let stubs = Stubs::new();
    let engine = Engine::new(stubs.config()).unwrap();
    let work = tempfile::tempdir().unwrap();

    let err = engine
        .download_file(
            &AdapterOptions::Docker(DockerOptions::container("missing")),
            "/etc/hostname",
            &work.path().join("hostname"),
            &TransferOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transfer);
}

#[smol_potat::test]
async fn test_image_mode_cannot_copy() {
    let stubs = Stubs::new();
    let engine = Engine::new(stubs.config()).unwrap();

    let err = engine
        .upload_file(
            &AdapterOptions::Docker(DockerOptions::image("alpine:3.19")),
            std::path::Path::new("/etc/hostname"),
            "/tmp/hostname",
            &TransferOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(stubs.log("docker").is_empty());
}

#[smol_potat::test]
async fn test_availability() {
    let stubs = Stubs::new();
    let engine = Engine::new(stubs.config()).unwrap();

    assert!(
        engine
            .is_available(&AdapterOptions::Docker(DockerOptions::container("web")))
            .await
    );
    assert!(
        !engine
            .is_available(&AdapterOptions::Docker(DockerOptions::container("missing")))
            .await
    );
    assert!(
        !engine
            .is_available(&AdapterOptions::Docker(DockerOptions::default()))
            .await
    );
}
