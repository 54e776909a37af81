mod common;

use std::process::Command;

use common::*;
use devsup::config::CONFIG_ENV;
use devsup::control::{self, EXIT_UNREACHABLE, Request, Response};
use devsup::supervisor::EXIT_CONFIG;
use devsup::{ChildStatus, Supervisor};

const DEVSUP: &str = env!("CARGO_BIN_EXE_devsup");

#[test]
fn status_and_stop_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("devsup.sock");
    let settings = devsup::SupervisorSettings {
        control_socket: Some(socket.clone()),
        ..fast_settings()
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    let sup = Supervisor::new(config(settings, vec![fixture("quiet", &[])]), rt.handle().clone())
        .unwrap()
        .with_control_socket()
        .unwrap();
    let running = Running::spawn(sup, rt);
    running.wait_for("quiet", ChildStatus::Ready);

    let first = control::request(&socket, &Request::Status).unwrap();
    let Response::Status { children } = first else {
        panic!("unexpected {first:?}");
    };
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].status, ChildStatus::Ready);
    assert_eq!(control::status_exit_code(&children), 0);

    // Nothing changed in between, so the rendering is identical.
    let Response::Status { children: again } =
        control::request(&socket, &Request::Status).unwrap()
    else {
        panic!("status not answered twice");
    };
    assert_eq!(control::render_status(&children), control::render_status(&again));

    assert_eq!(
        control::request(&socket, &Request::Stop).unwrap(),
        Response::Stopping
    );
    let outcome = running.finish();
    assert_eq!(outcome.exit_code(), 0);
    assert!(!socket.exists(), "socket left behind");
}

#[test]
fn cli_status_reports_ready_services() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("devsup.sock");
    let settings = devsup::SupervisorSettings {
        control_socket: Some(socket.clone()),
        ..fast_settings()
    };
    let rt = tokio::runtime::Runtime::new().unwrap();
    let sup = Supervisor::new(config(settings, vec![fixture("quiet", &[])]), rt.handle().clone())
        .unwrap()
        .with_control_socket()
        .unwrap();
    let running = Running::spawn(sup, rt);
    running.wait_for("quiet", ChildStatus::Ready);

    let output = Command::new(DEVSUP)
        .env_remove(CONFIG_ENV)
        .args(["status", "--socket"])
        .arg(&socket)
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(0), "{stdout}");
    assert!(stdout.starts_with("quiet Ready port=- since="), "{stdout}");
    assert!(stdout.trim_end().ends_with("restarts=0"), "{stdout}");

    let stop = Command::new(DEVSUP)
        .env_remove(CONFIG_ENV)
        .args(["stop", "--socket"])
        .arg(&socket)
        .output()
        .unwrap();
    assert_eq!(stop.status.code(), Some(0));
    running.finish();
}

#[test]
fn cli_status_without_supervisor_is_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(DEVSUP)
        .env_remove(CONFIG_ENV)
        .args(["status", "--socket"])
        .arg(dir.path().join("absent.sock"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(EXIT_UNREACHABLE));
}

#[test]
fn cli_run_with_invalid_config_exits_with_config_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devsup.toml");
    std::fs::write(
        &path,
        r#"
[[services]]
name = "a"
command = ["true"]

[[services]]
name = "a"
command = ["true"]
"#,
    )
    .unwrap();

    let output = Command::new(DEVSUP)
        .env(CONFIG_ENV, &path)
        .arg("run")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(EXIT_CONFIG));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("duplicate service name"), "{stderr}");
}
