//! Child process plumbing shared by every backend that spawns programs.

use crate::cancel::CancellationToken;
use crate::io::{InputSource, OutputSink, Slot};
use crate::RuntimeError;
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus};
use std::time::Duration;
use tracing::debug;
use wait_timeout::ChildExt;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Spawn `cmd` with the given streams and wait for it, killing the child if
/// `cancel` fires first. Output routed to non-inherited sinks is pumped on
/// scoped threads so arbitrary writers can be used.
pub(crate) fn run_child(
    mut cmd: Command,
    stdin: &InputSource,
    stdout: &mut OutputSink,
    stderr: &mut OutputSink,
    cancel: &CancellationToken,
) -> Result<ExitStatus, RuntimeError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    if cancel.is_cancelled() {
        return Err(RuntimeError::Cancelled(format!(
            "execution cancelled before '{program}' started"
        )));
    }

    cmd.stdin(stdin.child_stdio())
        .stdout(stdout.child_stdio(Slot::Stdout))
        .stderr(stderr.child_stdio(Slot::Stderr));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd
        .spawn()
        .map_err(|source| RuntimeError::Launch { program: program.clone(), source })?;
    debug!("spawned '{program}' (pid {})", child.id());

    let child_stdin = child.stdin.take();
    let child_stdout = child.stdout.take();
    let child_stderr = child.stderr.take();

    std::thread::scope(|scope| {
        if let (Some(mut pipe), InputSource::Bytes(bytes)) = (child_stdin, stdin) {
            scope.spawn(move || {
                let _ = pipe.write_all(bytes);
            });
        }
        if let Some(pipe) = child_stdout {
            scope.spawn(move || pump(pipe, stdout));
        }
        if let Some(pipe) = child_stderr {
            scope.spawn(move || pump(pipe, stderr));
        }
        wait_cancellable(&mut child, cancel, &program)
    })
}

fn wait_cancellable(
    child: &mut Child,
    cancel: &CancellationToken,
    program: &str,
) -> Result<ExitStatus, RuntimeError> {
    loop {
        if let Some(status) = child.wait_timeout(POLL_INTERVAL)? {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            debug!("cancelling '{program}'");
            kill_group(child);
            let _ = child.kill();
            let _ = child.wait();
            return Err(RuntimeError::Cancelled(format!(
                "execution of '{program}' cancelled"
            )));
        }
    }
}

/// Kill the child's whole process group so grandchildren holding the output
/// pipes go away with it.
#[cfg(unix)]
fn kill_group(child: &Child) {
    let Ok(pgid) = i32::try_from(child.id()) else {
        return;
    };
    // SAFETY: kill() with a negative pid signals the group the child leads;
    // the child is not reaped yet so the group id is still ours.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if ret != 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::ESRCH) {
            debug!("failed to kill process group {pgid}: {errno}");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

fn pump(mut from: impl Read, to: &mut OutputSink) {
    let mut buf = [0_u8; 8192];
    loop {
        match from.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if to.write_all(&buf[..n]).is_err() {
                    break;
                }
                let _ = to.flush();
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::exit::ExitCode;
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn pumps_output_into_writers() {
        let (mut out, out_buf) = OutputSink::buffer();
        let (mut err, err_buf) = OutputSink::buffer();
        let status = run_child(
            sh("echo out; echo err >&2; exit 3"),
            &InputSource::Null,
            &mut out,
            &mut err,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(ExitCode::from_status(status).unwrap(), ExitCode::from(3));
        assert_eq!(out_buf.to_string_lossy(), "out\n");
        assert_eq!(err_buf.to_string_lossy(), "err\n");
    }

    #[test]
    fn feeds_stdin_bytes() {
        let (mut out, out_buf) = OutputSink::buffer();
        run_child(
            Command::new("cat"),
            &InputSource::Bytes(b"piped input".to_vec()),
            &mut out,
            &mut OutputSink::Null,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(out_buf.to_string_lossy(), "piped input");
    }

    #[test]
    fn missing_program_is_launch_error() {
        let err = run_child(
            Command::new("/nonexistent/hatch-test-binary"),
            &InputSource::Null,
            &mut OutputSink::Null,
            &mut OutputSink::Null,
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::Launch { .. }));
    }

    #[test]
    fn cancellation_kills_child() {
        let cancel = CancellationToken::new();
        let remote = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            remote.cancel();
        });
        let start = Instant::now();
        let err = run_child(
            sh("sleep 30"),
            &InputSource::Null,
            &mut OutputSink::Null,
            &mut OutputSink::Null,
            &cancel,
        )
        .unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, RuntimeError::Cancelled(_)));
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn cancellation_does_not_wait_for_grandchildren() {
        let cancel = CancellationToken::new();
        let remote = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            remote.cancel();
        });
        let (mut out, out_buf) = OutputSink::buffer();
        let (mut err, _) = OutputSink::buffer();
        let start = Instant::now();
        let result = run_child(
            sh("sleep 30; echo done"),
            &InputSource::Null,
            &mut out,
            &mut err,
            &cancel,
        );
        canceller.join().unwrap();
        assert!(matches!(result, Err(RuntimeError::Cancelled(_))));
        assert!(start.elapsed() < Duration::from_secs(10), "{:?}", start.elapsed());
        assert!(out_buf.is_empty());
    }
}
