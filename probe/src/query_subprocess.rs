//! Subprocess query driver
//!
//! Runs `/bin/sh -c <command>` with the canonical environment, feeds the
//! configured payload to stdin, and captures stdout (optionally
//! interleaved with stderr). The child is made leader of its own process
//! group at spawn so that a timeout can TERM the entire tree; shell
//! children would otherwise survive the shell.

use shared::status::{Failure, Outcome};
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::queries::SubprocessSpec;
use crate::query_raw::take_partial;
use crate::runnable::lock;

/// Runs the command once, bounded by `timeout`.
pub async fn execute(spec: &SubprocessSpec, timeout: Duration, partial: &Mutex<String>) -> Outcome {
    lock(partial).clear();
    let deadline = Instant::now() + timeout;

    debug!("Running process: /bin/sh -c {:?}", spec.command);

    let mut command = Command::new("/bin/sh");
    command
        .arg("-c")
        .arg(&spec.command)
        .env_clear()
        .envs(&spec.environment)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(if spec.merge_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .process_group(0)
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => return Err(Failure::critical(format!("Failed to run command: {err}"))),
    };

    let pid = child.id();
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let data = spec.data.clone();

    let mut work = Box::pin(async move {
        let feed = async {
            if let Some(mut stdin) = stdin {
                if !data.is_empty() {
                    // A child that exits without reading is not an error;
                    // its exit status tells the real story.
                    let _ = stdin.write_all(data.as_bytes()).await;
                }
                // Dropping the handle closes the child's stdin.
            }
        };

        tokio::join!(feed, drain(stdout, partial), drain(stderr, partial));
        child.wait().await
    });

    match tokio::time::timeout_at(deadline, &mut work).await {
        Ok(Ok(status)) => {
            let output = take_partial(partial);
            if status.success() {
                return Ok(output);
            }
            match status.code() {
                Some(127) => Err(Failure::critical("Command not found.")),
                Some(code) => Err(
                    Failure::critical(format!("Command exited with status {code}"))
                        .with_partial(output),
                ),
                None => {
                    let signal = status.signal().unwrap_or(0);
                    Err(
                        Failure::critical(format!("Command terminated by signal {signal}"))
                            .with_partial(output),
                    )
                }
            }
        }
        Ok(Err(err)) => Err(Failure::critical(format!("Failed to run command: {err}"))),
        Err(_) => {
            terminate_group(pid);
            // Reap the child; a process group that ignores TERM is left
            // to the kill-on-drop backstop.
            let _ = tokio::time::timeout(Duration::from_secs(2), &mut work).await;
            Err(Failure::critical("Timeout waiting for command to finish.")
                .with_partial(take_partial(partial)))
        }
    }
}

/// Appends everything the reader produces to the partial buffer.
async fn drain<R: AsyncRead + Unpin>(reader: Option<R>, partial: &Mutex<String>) {
    let Some(mut reader) = reader else { return };
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => lock(partial).push_str(&String::from_utf8_lossy(&buf[..n])),
        }
    }
}

/// Sends SIGTERM to the child's whole process group.
fn terminate_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    // The child became a group leader at spawn; the negative pid targets
    // every process in the group.
    let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
    if ret != 0 {
        warn!(
            "Failed to send TERM to process group {}: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}
