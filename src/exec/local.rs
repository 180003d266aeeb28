//! FX-011: Local execution via `bash -c`.
//!
//! stdin is closed so nothing can block on a prompt. On Unix the child runs
//! in its own process group, and a timeout kills the whole group.

use super::{CommandRequest, ExecError, ExecOutput};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Instant;
use wait_timeout::ChildExt;

/// Run a shell instruction locally and capture its output.
pub fn exec_local(request: &CommandRequest<'_>) -> Result<ExecOutput, ExecError> {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(request.script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(dir) = request.cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in &request.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(ExecError::Spawn)?;
    let started = Instant::now();

    // Drain pipes on threads so a chatty build cannot fill them and stall.
    let (tx, rx) = mpsc::channel();
    let mut pending = 0;
    if let Some(out) = child.stdout.take() {
        drain(Stream::Stdout, out, tx.clone());
        pending += 1;
    }
    if let Some(err) = child.stderr.take() {
        drain(Stream::Stderr, err, tx.clone());
        pending += 1;
    }
    drop(tx);

    let status = match request.timeout {
        Some(limit) => match child.wait_timeout(limit).map_err(ExecError::Io)? {
            Some(status) => status,
            None => {
                kill_group(&mut child);
                let _ = child.wait();
                return Err(ExecError::TimedOut(limit));
            }
        },
        None => child.wait().map_err(ExecError::Io)?,
    };

    // A background job left behind by the script still holds the pipes
    // open, so the readers share the same deadline as the wait.
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while pending > 0 {
        let received = match request.timeout {
            Some(limit) => {
                let remaining = limit.saturating_sub(started.elapsed());
                rx.recv_timeout(remaining)
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok((Stream::Stdout, bytes)) => stdout = bytes,
            Ok((Stream::Stderr, bytes)) => stderr = bytes,
            Err(RecvTimeoutError::Timeout) => {
                kill_group(&mut child);
                return Err(ExecError::TimedOut(
                    request.timeout.unwrap_or_default(),
                ));
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
        pending -= 1;
    }

    Ok(ExecOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
    })
}

enum Stream {
    Stdout,
    Stderr,
}

fn drain<R: Read + Send + 'static>(stream: Stream, mut reader: R, tx: Sender<(Stream, Vec<u8>)>) {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        let _ = tx.send((stream, buf));
    });
}

fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .arg("-KILL")
            .arg("--")
            .arg(format!("-{}", child.id()))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    let _ = child.kill();
}
