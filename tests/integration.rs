//! End-to-end tests against real PTY devices and real child processes

#![cfg(unix)]

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mochi_ptyproc::{
    Error, ExitStatus, ProcessConfig, ProcessState, PtyDevice, PtyProcess, PtyReader,
    WindowSize, AUX_PLACEHOLDER,
};

fn sh(script: &str) -> ProcessConfig {
    ProcessConfig::new(["/bin/sh", "-c", script])
}

/// Read a stream until end-of-stream
fn read_all(reader: &PtyReader) -> String {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match (&*reader).read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Read until `needle` shows up
fn read_until(reader: &PtyReader, needle: &str) -> String {
    let mut out = String::new();
    let mut buf = [0u8; 1024];
    while !out.contains(needle) {
        match (&*reader).read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => out.push_str(&String::from_utf8_lossy(&buf[..n])),
        }
    }
    out
}

fn has_real_pty() -> bool {
    let process = PtyProcess::start(ProcessConfig::new(["/bin/true"]).console(true)).unwrap();
    let real = process.channels().primary().is_console();
    process.wait_for();
    real
}

#[test]
fn test_echo_output_and_exit() {
    let process = PtyProcess::start(ProcessConfig::new(["/bin/echo", "hi"])).unwrap();
    assert!(process.pid() > 0);

    let output = read_all(&process.reader().unwrap());
    assert!(output.contains("hi"), "output: {:?}", output);
    assert_eq!(process.wait_for(), ExitStatus::Exited(0));
    assert_eq!(process.state(), ProcessState::Terminated);
    assert_eq!(process.exit_status().unwrap(), ExitStatus::Exited(0));
}

#[test]
fn test_exit_code() {
    let process = PtyProcess::start(sh("exit 3")).unwrap();
    assert_eq!(process.wait_for(), ExitStatus::Exited(3));
    assert_eq!(process.wait_for().code(), 3);
}

#[test]
fn test_missing_executable_fails_start() {
    let err = PtyProcess::start(ProcessConfig::new(["/nonexistent/mochi-ptyproc"])).unwrap_err();
    assert!(matches!(err, Error::Spawn { .. }), "got {err}");
}

#[test]
fn test_invalid_config_fails_start() {
    let err = PtyProcess::start(ProcessConfig::default()).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));

    let err = PtyProcess::start(
        ProcessConfig::new(["/bin/true"]).directory("/nonexistent/mochi-ptyproc"),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[test]
fn test_auxiliary_channel_is_independent() {
    if !has_real_pty() {
        return;
    }
    let config = ProcessConfig::new([
        "/bin/sh",
        "-c",
        "echo main; echo side > \"$0\"",
        AUX_PLACEHOLDER,
    ])
    .auxiliary_channel(true);
    let process = PtyProcess::start(config).unwrap();

    let aux = process.aux_reader().unwrap().expect("aux reader");
    assert!(process.aux_writer().unwrap().is_some());

    let aux_handle = thread::spawn(move || read_all(&aux));
    let main = read_all(&process.reader().unwrap());
    let side = aux_handle.join().unwrap();

    assert_eq!(process.wait_for(), ExitStatus::Exited(0));
    assert!(main.contains("main"), "main: {:?}", main);
    assert!(!main.contains("side"), "main: {:?}", main);
    assert!(side.contains("side"), "aux: {:?}", side);
}

#[test]
fn test_no_aux_streams_without_aux_channel() {
    let process = PtyProcess::start(ProcessConfig::new(["/bin/true"])).unwrap();
    assert!(process.aux_reader().unwrap().is_none());
    assert!(process.aux_writer().unwrap().is_none());
    process.wait_for();
}

#[test]
fn test_destroy_without_requested_streams() {
    let process = PtyProcess::start(ProcessConfig::new(["/bin/sleep", "30"])).unwrap();
    assert!(process.is_running());

    let status = process.destroy().unwrap();
    assert_eq!(status, ExitStatus::Signaled(libc::SIGTERM));
    assert_eq!(process.state(), ProcessState::Terminated);
    assert!(!process.is_running());
}

#[test]
fn test_concurrent_waiters() {
    let process = Arc::new(PtyProcess::start(sh("sleep 0.2; exit 5")).unwrap());

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let process = Arc::clone(&process);
            thread::spawn(move || process.wait_for())
        })
        .collect();

    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), ExitStatus::Exited(5));
    }
}

#[test]
fn test_request_stop_escalates_to_kill() {
    let process = PtyProcess::start(sh("trap '' TERM; echo ready; while :; do sleep 0.05; done"))
        .unwrap()
        .with_grace_period(Duration::from_millis(200));

    let reader = process.reader().unwrap();
    let ready = read_until(&reader, "ready");
    assert!(ready.contains("ready"), "output: {:?}", ready);

    let status = process.request_stop().unwrap();
    assert_eq!(status, ExitStatus::Signaled(libc::SIGKILL));
}

#[test]
fn test_signals_after_exit_are_not_delivered() {
    let process = PtyProcess::start(ProcessConfig::new(["/bin/true"])).unwrap();
    process.wait_for();

    assert!(!process.is_running());
    assert!(!process.terminate().unwrap());
    assert!(!process.kill().unwrap());
    assert!(!process.interrupt().unwrap());
}

#[test]
fn test_initial_size() {
    if !has_real_pty() {
        return;
    }
    let config = ProcessConfig::new(["/bin/stty", "size"]).size(WindowSize::new(120, 40));
    let process = PtyProcess::start(config).unwrap();
    let output = read_all(&process.reader().unwrap());
    assert!(output.contains("40 120"), "output: {:?}", output);
    assert_eq!(process.window_size().unwrap(), WindowSize::new(120, 40));
    process.wait_for();
}

#[test]
fn test_resize_while_running() {
    if !has_real_pty() {
        return;
    }
    let process = PtyProcess::start(sh("read line; stty size")).unwrap();
    process.resize(WindowSize::new(100, 30)).unwrap();
    assert_eq!(process.window_size().unwrap(), WindowSize::new(100, 30));

    (&*process.writer().unwrap()).write_all(b"go\n").unwrap();
    let output = read_all(&process.reader().unwrap());
    assert!(output.contains("30 100"), "output: {:?}", output);
    assert_eq!(process.wait_for(), ExitStatus::Exited(0));
}

#[test]
fn test_resize_after_exit_is_noop() {
    let process = PtyProcess::start(ProcessConfig::new(["/bin/true"])).unwrap();
    process.wait_for();
    process.resize(WindowSize::new(100, 50)).unwrap();
}

#[test]
fn test_console_mode_separates_stderr() {
    if !has_real_pty() {
        return;
    }
    let process = PtyProcess::start(sh("echo out; echo err >&2").console(true)).unwrap();

    let error = process.error_reader().unwrap();
    let error_handle = thread::spawn(move || read_all(&error));
    let output = read_all(&process.reader().unwrap());
    let errors = error_handle.join().unwrap();

    assert_eq!(process.wait_for(), ExitStatus::Exited(0));
    assert!(output.contains("out"), "stdout: {:?}", output);
    assert!(!output.contains("err"), "stdout: {:?}", output);
    assert!(errors.contains("err"), "stderr: {:?}", errors);
}

#[test]
fn test_stderr_merged_by_default() {
    let process = PtyProcess::start(sh("echo err >&2")).unwrap();
    let output = read_all(&process.reader().unwrap());
    assert!(output.contains("err"), "output: {:?}", output);
    assert_eq!(read_all(&process.error_reader().unwrap()), "");
    process.wait_for();
}

#[test]
fn test_console_mode_disables_echo() {
    if !has_real_pty() {
        return;
    }
    let process = PtyProcess::start(sh("read line; echo got-$line").console(true)).unwrap();
    (&*process.writer().unwrap()).write_all(b"secret\n").unwrap();
    let output = read_all(&process.reader().unwrap());
    assert!(output.contains("got-secret"), "output: {:?}", output);
    assert!(!output.replace("got-secret", "").contains("secret"), "output: {:?}", output);
    process.wait_for();
}

#[test]
fn test_working_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let expected = tmp.path().canonicalize().unwrap();
    let process = PtyProcess::start(ProcessConfig::new(["/bin/pwd"]).directory(tmp.path())).unwrap();
    let output = read_all(&process.reader().unwrap());
    assert!(
        output.contains(expected.to_str().unwrap()),
        "output: {:?}",
        output
    );
    process.wait_for();
}

#[test]
fn test_environment() {
    let config = sh("echo \"greeting=$GREETING\"").env_clear().env("GREETING", "hello");
    let process = PtyProcess::start(config).unwrap();
    let output = read_all(&process.reader().unwrap());
    assert!(output.contains("greeting=hello"), "output: {:?}", output);
    process.wait_for();
}

#[test]
fn test_write_to_child() {
    if !has_real_pty() {
        return;
    }
    let process = PtyProcess::start(ProcessConfig::new(["/bin/cat"])).unwrap();
    let writer = process.writer().unwrap();
    (&*writer).write_all(b"ping\n\x04").unwrap();

    let output = read_all(&process.reader().unwrap());
    assert!(output.contains("ping"), "output: {:?}", output);
    assert_eq!(process.wait_for(), ExitStatus::Exited(0));
}

#[test]
fn test_stream_identity_and_close() {
    let process = PtyProcess::start(ProcessConfig::new(["/bin/sleep", "30"])).unwrap();

    let a = process.reader().unwrap();
    let b = process.reader().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&process.writer().unwrap(), &process.writer().unwrap()));

    a.close();
    a.close();
    assert_eq!(read_all(&b), "");

    process.kill().unwrap();
    assert_eq!(process.wait_for(), ExitStatus::Signaled(libc::SIGKILL));
}

#[test]
fn test_reader_unblocks_on_exit() {
    let process = PtyProcess::start(sh("sleep 0.2")).unwrap();
    let reader = process.reader().unwrap();
    let handle = thread::spawn(move || read_all(&reader));
    assert_eq!(process.wait_for(), ExitStatus::Exited(0));
    handle.join().unwrap();
}
