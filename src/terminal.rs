//! Remote shell sessions: pairs a local PTY with an operator WebSocket.
//!
//! Each `terminal` control message opens a dedicated channel to the server,
//! identified by the request id. Operator frames are either binary (raw pty
//! input) or JSON text carrying `input`/`resize`; pty output flows back as
//! binary chunks. The bridge does not authenticate — the transport already
//! did.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::session;
use crate::state::AgentState;

pub const WEB_SSH_DISABLED_MSG: &str =
    "\n\nWeb SSH is disabled. Enable it by running without the --disable-web-ssh flag.";

const OUTPUT_CHUNK: usize = 4096;
const INITIAL_COLS: u16 = 80;
const INITIAL_ROWS: u16 = 24;
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct TermCommand {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    cols: u16,
    #[serde(default)]
    rows: u16,
    #[serde(default)]
    input: String,
}

#[derive(Debug, PartialEq)]
enum OperatorFrame {
    Input(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Ignore,
}

/// Text frames that fail to parse as JSON are treated as raw input.
fn parse_operator_frame(text: &str) -> OperatorFrame {
    match serde_json::from_str::<TermCommand>(text) {
        Ok(cmd) => match cmd.kind.as_str() {
            "input" if !cmd.input.is_empty() => OperatorFrame::Input(cmd.input.into_bytes()),
            "resize" if cmd.cols > 0 && cmd.rows > 0 => OperatorFrame::Resize {
                cols: cmd.cols,
                rows: cmd.rows,
            },
            _ => OperatorFrame::Ignore,
        },
        Err(_) => OperatorFrame::Input(text.as_bytes().to_vec()),
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    if name.contains(std::path::MAIN_SEPARATOR) {
        let path = Path::new(name);
        return path.is_file().then(|| path.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{name}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

/// Shell preference: the `/etc/passwd` entry for the current user when it
/// resolves on PATH, then zsh, bash, sh.
#[cfg(unix)]
fn select_shell() -> Option<String> {
    let mut shell = String::new();
    if let Ok(passwd) = std::fs::read_to_string("/etc/passwd") {
        let user = std::env::var("USER").ok();
        let home = std::env::var("HOME").ok();
        for line in passwd.lines() {
            let parts: Vec<&str> = line.split(':').collect();
            if parts.len() < 7 || parts[6].is_empty() {
                continue;
            }
            let matches_user = user.as_deref() == Some(parts[0]);
            let matches_home = home.as_deref().is_some_and(|h| !h.is_empty() && parts[5] == h);
            if matches_user || matches_home {
                shell = parts[6].to_string();
                break;
            }
        }
    }
    if !shell.is_empty() && find_in_path(&shell).is_none() {
        shell.clear();
    }
    if shell.is_empty() {
        for candidate in ["zsh", "bash", "sh"] {
            if find_in_path(candidate).is_some() {
                shell = candidate.to_string();
                break;
            }
        }
    }
    (!shell.is_empty()).then_some(shell)
}

#[cfg(windows)]
fn select_shell() -> Option<String> {
    ["pwsh", "powershell", "cmd"]
        .into_iter()
        .find(|s| find_in_path(s).is_some())
        .map(String::from)
}

struct ShellSession {
    shell: String,
    child: Box<dyn Child + Send + Sync>,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
}

impl ShellSession {
    /// Returns the session plus the channel carrying pty output chunks.
    fn spawn() -> Result<(Self, mpsc::UnboundedReceiver<Vec<u8>>)> {
        let shell = select_shell().ok_or_else(|| anyhow!("no supported shell found"))?;
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: INITIAL_ROWS,
                cols: INITIAL_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow!("openpty: {e}"))?;

        // Interactive mode first, plain invocation as fallback.
        let child = match pair.slave.spawn_command(interactive_command(&shell)) {
            Ok(child) => child,
            Err(_) => pair
                .slave
                .spawn_command(shell_command(&shell))
                .map_err(|e| anyhow!("failed to start {shell}: {e}"))?,
        };
        info!("terminal session started with shell {shell}");

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| anyhow!("pty reader: {e}"))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| anyhow!("pty writer: {e}"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("pty-reader".into())
            .spawn(move || {
                let mut buf = [0u8; OUTPUT_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(_) => break,
                    }
                }
            })
            .context("spawning pty reader thread")?;

        Ok((
            Self {
                shell,
                child,
                master: pair.master,
                writer,
            },
            rx,
        ))
    }

    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        if let Err(e) = self.master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            warn!("pty resize to {cols}x{rows} failed: {e}");
        }
    }

    /// Ctrl-C thrice, Ctrl-D, `exit`, then up to five seconds of patience
    /// before the process group is killed.
    async fn graceful_shutdown(mut self) {
        for _ in 0..3 {
            if self.write(&[0x03]).is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = self.write(&[0x04]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = self.write(b"exit\n");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let deadline = tokio::time::Instant::now() + SHUTDOWN_WAIT;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("shell {} exited with {}", self.shell, status.exit_code());
                    return;
                }
                Ok(None) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                _ => break,
            }
        }
        kill_process_group(&mut self.child);
    }
}

impl Drop for ShellSession {
    // Covers cancellation: a session task aborted mid-stream must not leak
    // the shell process.
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut Box<dyn Child + Send + Sync>) {
    if let Some(pid) = child.process_id() {
        // The pty slave made the shell a session leader, so its pid is the
        // process group id.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Box<dyn Child + Send + Sync>) {
    let _ = child.kill();
}

#[cfg(unix)]
fn interactive_command(shell: &str) -> CommandBuilder {
    let mut cmd = shell_command(shell);
    cmd.arg("-i");
    cmd
}

#[cfg(not(unix))]
fn interactive_command(shell: &str) -> CommandBuilder {
    shell_command(shell)
}

fn shell_command(shell: &str) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(shell);
    cmd.env("TERM", "xterm-256color");
    cmd.env("LANG", "C.UTF-8");
    cmd.env("LC_ALL", "C.UTF-8");
    cmd
}

/// Serve one remote shell session over its dedicated WebSocket channel.
/// Errors never propagate to the agent: they end the session.
pub async fn run_session(state: Arc<AgentState>, request_id: String) {
    let url = match session::terminal_url(&state.cfg, &request_id) {
        Ok(url) => url,
        Err(e) => {
            warn!("terminal session {request_id}: bad endpoint: {e:#}");
            return;
        }
    };
    let mut ws = match session::connect_ws(&state, &url).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("terminal session {request_id}: connect failed: {e:#}");
            return;
        }
    };

    if state.cfg.disable_web_ssh {
        let _ = ws.send(Message::Text(WEB_SSH_DISABLED_MSG.into())).await;
        let _ = ws.close(None).await;
        info!("terminal session {request_id} refused (web ssh disabled)");
        return;
    }

    let (mut shell, mut output) = match ShellSession::spawn() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ws.send(Message::Text(format!("Error: {e}\r\n"))).await;
            let _ = ws.close(None).await;
            warn!("terminal session {request_id}: {e:#}");
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = ws.split();
    loop {
        tokio::select! {
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Binary(bytes))) => {
                    if shell.write(&bytes).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => match parse_operator_frame(&text) {
                    OperatorFrame::Input(bytes) => {
                        if shell.write(&bytes).is_err() {
                            break;
                        }
                    }
                    OperatorFrame::Resize { cols, rows } => shell.resize(cols, rows),
                    OperatorFrame::Ignore => {}
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("terminal session {request_id}: transport error: {e}");
                    break;
                }
            },
            chunk = output.recv() => match chunk {
                Some(bytes) => {
                    if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                // Pty reached EOF: the shell is gone.
                None => break,
            },
        }
    }

    shell.graceful_shutdown().await;
    let _ = ws_tx.close().await;
    info!("terminal session {request_id} closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusal_message_names_the_kill_switch() {
        assert!(WEB_SSH_DISABLED_MSG.contains("Web SSH is disabled"));
        assert!(WEB_SSH_DISABLED_MSG.contains("--disable-web-ssh"));
    }

    #[test]
    fn json_frames_map_to_input_and_resize() {
        assert_eq!(
            parse_operator_frame(r#"{"type":"input","input":"ls\n"}"#),
            OperatorFrame::Input(b"ls\n".to_vec())
        );
        assert_eq!(
            parse_operator_frame(r#"{"type":"resize","cols":120,"rows":40}"#),
            OperatorFrame::Resize {
                cols: 120,
                rows: 40
            }
        );
    }

    #[test]
    fn malformed_json_is_raw_input() {
        assert_eq!(
            parse_operator_frame("plain keystrokes"),
            OperatorFrame::Input(b"plain keystrokes".to_vec())
        );
    }

    #[test]
    fn zero_dimensions_and_unknown_types_are_ignored() {
        assert_eq!(
            parse_operator_frame(r#"{"type":"resize","cols":0,"rows":40}"#),
            OperatorFrame::Ignore
        );
        assert_eq!(
            parse_operator_frame(r#"{"type":"detach"}"#),
            OperatorFrame::Ignore
        );
        assert_eq!(
            parse_operator_frame(r#"{"type":"input","input":""}"#),
            OperatorFrame::Ignore
        );
    }

    #[cfg(unix)]
    #[test]
    fn a_shell_is_always_found() {
        // Any sane Unix test environment carries at least /bin/sh.
        let shell = select_shell().expect("shell");
        assert!(find_in_path(&shell).is_some());
    }
}
