use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::models::config::ScriptSpec;
use crate::storage::logs::{JobLogWriter, LogStream, StreamStats};

/// How the child process came to rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal exit with a code.
    Exited(i32),
    /// Killed by a signal, or the exit status was unobtainable.
    Abnormal,
    /// The process never started.
    SpawnFailed,
}

/// Raw facts from one supervised execution. The runner combines these with
/// the job's cancellation mark to pick the terminal status, so the executor
/// itself never classifies an exit as canceled.
pub struct ExecReport {
    pub timed_out: bool,
    pub exit: ExitKind,
    pub stdout: StreamStats,
    pub stderr: StreamStats,
}

/// Single-quote a string for the shell, escaping embedded quotes.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Compose the command line: quoted script path and quoted arguments,
/// joined with spaces.
fn compose_command_line(spec: &ScriptSpec, args: &[String]) -> String {
    let mut parts = vec![shell_quote(&spec.path.to_string_lossy())];
    parts.extend(args.iter().map(|a| shell_quote(a)));
    parts.join(" ")
}

/// SIGTERM the child's process group; fall back to the direct pid if the
/// group signal is refused.
fn terminate(pid: u32) {
    let pid = pid as i32;
    unsafe {
        if libc::kill(-pid, libc::SIGTERM) != 0 {
            libc::kill(pid, libc::SIGTERM);
        }
    }
}

fn classify(status: std::process::ExitStatus) -> ExitKind {
    match status.code() {
        Some(code) => ExitKind::Exited(code),
        // No code on Unix means the child was signalled.
        None => ExitKind::Abnormal,
    }
}

/// Pump a child stream into a channel in 8 KiB chunks, preserving producer
/// order. The channel closes at EOF or read error.
fn spawn_reader<R>(mut reader: R) -> mpsc::Receiver<Vec<u8>>
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Child stream read ended with error: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

fn closed_channel() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(1);
    drop(tx);
    rx
}

/// Run one job to rest: spawn the script in its own process group, pipe its
/// output into the log writer, arm the timeout, honor cancellation, and wait
/// for the child and both streams to finish.
///
/// A script that ignores SIGTERM keeps the supervision loop alive until it
/// actually exits; no SIGKILL escalation is performed.
pub async fn run(
    spec: &ScriptSpec,
    args: &[String],
    mut writer: JobLogWriter,
    kill_rx: oneshot::Receiver<()>,
) -> ExecReport {
    let command_line = compose_command_line(spec, args);

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(&command_line)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // New process group so timeout/cancel can take down the whole subtree.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!("Failed to spawn '{}': {}", spec.id, e);
            writer.push_stderr_note(&format!("spawn error: {}", e));
            let (stdout, stderr) = writer.finalize().await;
            return ExecReport {
                timed_out: false,
                exit: ExitKind::SpawnFailed,
                stdout,
                stderr,
            };
        }
    };

    let pid = child.id();
    let mut stdout_rx = match child.stdout.take() {
        Some(s) => spawn_reader(s),
        None => closed_channel(),
    };
    let mut stderr_rx = match child.stderr.take() {
        Some(s) => spawn_reader(s),
        None => closed_channel(),
    };

    // Disabled timeouts become a sleep that never realistically fires.
    let timeout_fut = if spec.timeout_sec > 0 {
        tokio::time::sleep(Duration::from_secs(spec.timeout_sec))
    } else {
        tokio::time::sleep(Duration::from_secs(u64::MAX / 2))
    };
    tokio::pin!(timeout_fut);

    let mut kill_rx = kill_rx;
    let mut kill_seen = false;
    let mut timed_out = false;
    let mut exit: Option<ExitKind> = None;
    let mut stdout_open = true;
    let mut stderr_open = true;

    loop {
        tokio::select! {
            chunk = stdout_rx.recv(), if stdout_open => match chunk {
                Some(data) => writer.write(LogStream::Stdout, &data).await,
                None => stdout_open = false,
            },
            chunk = stderr_rx.recv(), if stderr_open => match chunk {
                Some(data) => writer.write(LogStream::Stderr, &data).await,
                None => stderr_open = false,
            },
            status = child.wait(), if exit.is_none() => {
                exit = Some(match status {
                    Ok(st) => classify(st),
                    Err(e) => {
                        tracing::error!("Failed to reap child for '{}': {}", spec.id, e);
                        ExitKind::Abnormal
                    }
                });
            }
            _ = &mut kill_rx, if !kill_seen => {
                kill_seen = true;
                if let Some(pid) = pid {
                    terminate(pid);
                }
            }
            _ = &mut timeout_fut, if !timed_out => {
                timed_out = true;
                tracing::info!("Script '{}' exceeded {}s timeout", spec.id, spec.timeout_sec);
                if let Some(pid) = pid {
                    terminate(pid);
                }
            }
        }

        if exit.is_some() && !stdout_open && !stderr_open {
            break;
        }
    }

    let (stdout, stderr) = writer.finalize().await;
    ExecReport {
        timed_out,
        exit: exit.unwrap_or(ExitKind::Abnormal),
        stdout,
        stderr,
    }
}
