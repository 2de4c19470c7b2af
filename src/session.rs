//! Process supervisor: owns the single live PTY-backed claude session.
//!
//! The registry is an `Option<LiveSession>` behind one mutex, so "at most one
//! session per server" holds structurally. Presence in the registry is the
//! sole source of truth: explicit kill and the child's own exit both go
//! through a check-and-remove, which makes the two racing paths idempotent.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{AppError, ErrorCode};

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Events the supervisor delivers to an attached transport.
#[derive(Debug)]
pub enum SessionEvent {
    /// Raw terminal output bytes.
    Output(Vec<u8>),
    /// The process ended; the transport sends this one error frame and closes.
    Exited(AppError),
    /// A newer transport took over, or the session is being torn down.
    Detached,
}

struct Attachment {
    tx: mpsc::UnboundedSender<SessionEvent>,
    generation: u64,
}

struct LiveSession {
    id: String,
    exercise_id: String,
    workspace: PathBuf,
    created_at: DateTime<Utc>,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    attachment: Option<Attachment>,
}

/// Snapshot of the live session for the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub exercise_id: String,
    pub workspace_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub transport_attached: bool,
}

pub struct SessionManager {
    claude_bin: Option<PathBuf>,
    current: Mutex<Option<LiveSession>>,
    next_generation: AtomicU64,
}

impl SessionManager {
    pub fn new(claude_bin: Option<PathBuf>) -> Self {
        Self {
            claude_bin,
            current: Mutex::new(None),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Whether the claude executable was resolvable at startup.
    pub fn claude_available(&self) -> bool {
        self.claude_bin.is_some()
    }

    /// Spawn a new session in `workspace`, killing any live session first so
    /// callers never observe two processes alive.
    pub fn spawn(
        self: &Arc<Self>,
        session_id: &str,
        exercise_id: &str,
        workspace: &Path,
        initial_input: Option<&str>,
    ) -> Result<(), AppError> {
        let claude = self.claude_bin.as_ref().ok_or_else(|| {
            AppError::with_action(
                ErrorCode::ClaudeNotFound,
                "claude executable not found on PATH",
                "Install Claude Code (https://claude.com/claude-code) and restart the server",
            )
        })?;

        let mut guard = self.current.lock().unwrap();
        if let Some(old) = guard.take() {
            info!(session = %old.id, "killing previous session before spawn");
            teardown(old);
        }

        let pty = native_pty_system()
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(spawn_err)?;

        let cmd = build_command(claude, workspace);
        let child = pty.slave.spawn_command(cmd).map_err(spawn_err)?;
        // Drop the slave so the master sees EOF once the child exits.
        drop(pty.slave);

        let reader = pty.master.try_clone_reader().map_err(spawn_err)?;
        let mut writer = pty.master.take_writer().map_err(spawn_err)?;
        let killer = child.clone_killer();

        if let Some(input) = initial_input {
            let _ = writer.write_all(input.as_bytes());
            let _ = writer.flush();
        }

        *guard = Some(LiveSession {
            id: session_id.to_string(),
            exercise_id: exercise_id.to_string(),
            workspace: workspace.to_path_buf(),
            created_at: Utc::now(),
            master: pty.master,
            writer,
            killer,
            attachment: None,
        });
        drop(guard);

        self.watch(session_id.to_string(), reader, child);
        info!(session = session_id, exercise = exercise_id, workspace = %workspace.display(), "session spawned");
        Ok(())
    }

    /// Pump PTY output into the registry and turn child exit into the
    /// `PTY_EXITED` notification. Registered at spawn, before any caller can
    /// observe the session.
    fn watch(
        self: &Arc<Self>,
        session_id: String,
        mut reader: Box<dyn Read + Send>,
        mut child: Box<dyn Child + Send + Sync>,
    ) {
        let manager = Arc::clone(self);
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => manager.forward_output(&session_id, buf[..n].to_vec()),
                }
            }
            match child.wait() {
                Ok(status) => {
                    info!(session = %session_id, code = status.exit_code(), "pty child exited")
                }
                Err(e) => warn!(session = %session_id, "failed to reap pty child: {e}"),
            }
            manager.handle_exit(&session_id);
        });
    }

    fn forward_output(&self, session_id: &str, chunk: Vec<u8>) {
        let guard = self.current.lock().unwrap();
        if let Some(session) = guard.as_ref() {
            if session.id == session_id {
                if let Some(attachment) = &session.attachment {
                    let _ = attachment.tx.send(SessionEvent::Output(chunk));
                }
            }
        }
    }

    /// Child-exit path. Must stay idempotent against an explicit kill racing
    /// the natural exit: if the registry entry is already gone this is a
    /// no-op, so no double-teardown and no duplicate error frame.
    fn handle_exit(&self, session_id: &str) {
        let mut guard = self.current.lock().unwrap();
        let matches = guard
            .as_ref()
            .map(|s| s.id == session_id)
            .unwrap_or(false);
        if !matches {
            debug!(session = session_id, "exit for already-removed session ignored");
            return;
        }
        let mut session = guard.take().unwrap();
        if let Some(attachment) = session.attachment.take() {
            let _ = attachment.tx.send(SessionEvent::Exited(AppError::with_action(
                ErrorCode::PtyExited,
                "the claude process ended",
                "Restart the exercise to begin a new session",
            )));
        }
        info!(session = session_id, "session removed after exit");
    }

    /// Bind a transport to the session, displacing any previous transport
    /// without touching the process. Returns a generation token the caller
    /// passes back to [`detach`].
    pub fn attach(
        &self,
        session_id: &str,
        tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<u64, AppError> {
        let mut guard = self.current.lock().unwrap();
        let session = guard
            .as_mut()
            .filter(|s| s.id == session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        if let Some(old) = session.attachment.take() {
            debug!(session = session_id, "displacing previously attached transport");
            let _ = old.tx.send(SessionEvent::Detached);
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        session.attachment = Some(Attachment { tx, generation });
        Ok(generation)
    }

    /// Unbind a transport. Only the attachment carrying `generation` is
    /// removed, so a stale transport cannot detach its replacement.
    pub fn detach(&self, session_id: &str, generation: u64) {
        let mut guard = self.current.lock().unwrap();
        if let Some(session) = guard.as_mut().filter(|s| s.id == session_id) {
            if session
                .attachment
                .as_ref()
                .map(|a| a.generation == generation)
                .unwrap_or(false)
            {
                session.attachment = None;
            }
        }
    }

    /// Kill the named session: detach its transport, terminate the process,
    /// remove the entry.
    pub fn kill(&self, session_id: &str) -> bool {
        let mut guard = self.current.lock().unwrap();
        let matches = guard
            .as_ref()
            .map(|s| s.id == session_id)
            .unwrap_or(false);
        if !matches {
            return false;
        }
        let session = guard.take().unwrap();
        info!(session = session_id, "killing session");
        teardown(session);
        true
    }

    /// Kill whatever session is live, if any. Reset is deliberately coarse:
    /// it does not check which exercise the session belongs to.
    pub fn kill_current(&self) -> bool {
        let mut guard = self.current.lock().unwrap();
        match guard.take() {
            Some(session) => {
                info!(session = %session.id, "killing active session");
                teardown(session);
                true
            }
            None => false,
        }
    }

    /// Resize the terminal. No-op when the session does not exist.
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        let guard = self.current.lock().unwrap();
        if let Some(session) = guard.as_ref().filter(|s| s.id == session_id) {
            let _ = session.master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            });
        }
    }

    /// Write raw input bytes to the process. No-op when the session does not exist.
    pub fn write(&self, session_id: &str, bytes: &[u8]) {
        let mut guard = self.current.lock().unwrap();
        if let Some(session) = guard.as_mut().filter(|s| s.id == session_id) {
            let _ = session.writer.write_all(bytes);
            let _ = session.writer.flush();
        }
    }

    /// Reuse support: the session already running in `workspace`, if any.
    /// A UI that mounts twice fires two near-simultaneous start requests for
    /// the same resolved path; the second should get the first's session.
    pub fn find_by_workspace(&self, workspace: &Path) -> Option<String> {
        let guard = self.current.lock().unwrap();
        guard
            .as_ref()
            .filter(|s| s.workspace == workspace)
            .map(|s| s.id.clone())
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        let guard = self.current.lock().unwrap();
        guard
            .as_ref()
            .filter(|s| s.id == session_id)
            .map(|s| SessionStatus {
                session_id: s.id.clone(),
                exercise_id: s.exercise_id.clone(),
                workspace_path: s.workspace.clone(),
                created_at: s.created_at,
                transport_attached: s.attachment.is_some(),
            })
    }
}

/// Detach-before-kill: the transport must stop observing the session before
/// the process handle goes away.
fn teardown(mut session: LiveSession) {
    if let Some(attachment) = session.attachment.take() {
        let _ = attachment.tx.send(SessionEvent::Detached);
    }
    if let Err(e) = session.killer.kill() {
        warn!(session = %session.id, "failed to kill pty child: {e}");
    }
}

fn spawn_err(e: impl std::fmt::Display) -> AppError {
    AppError::with_action(
        ErrorCode::PtySpawnFailed,
        format!("failed to start claude in a pseudo-terminal: {e}"),
        "Check that claude is installed and executable, then restart the exercise",
    )
}

fn session_not_found(session_id: &str) -> AppError {
    AppError::new(
        ErrorCode::SessionNotFound,
        format!("no session with id '{session_id}'"),
    )
}

/// Build the claude invocation for `workspace`.
///
/// The child inherits our environment, which carries markers claude uses to
/// detect that it is running inside an existing claude session; those are
/// blanked so the spawned CLI starts normally. Windows installs resolve to a
/// `.cmd` shim that must run through the command interpreter.
fn build_command(claude: &Path, workspace: &Path) -> CommandBuilder {
    let mut cmd = if needs_shell_wrapper(claude) {
        let mut cmd = CommandBuilder::new("cmd.exe");
        cmd.arg("/C");
        cmd.arg(claude);
        cmd
    } else {
        CommandBuilder::new(claude)
    };
    cmd.cwd(workspace);
    cmd.env("CLAUDECODE", "");
    for (key, _) in std::env::vars() {
        if key.starts_with("CLAUDE_CODE_") {
            cmd.env(&key, "");
        }
    }
    cmd
}

fn needs_shell_wrapper(path: &Path) -> bool {
    if !cfg!(windows) {
        return false;
    }
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("cmd") || ext.eq_ignore_ascii_case("bat")
    )
}

/// Locate the claude executable on PATH. Called once at server startup.
pub fn find_claude() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    let names: &[&str] = if cfg!(windows) {
        &["claude.exe", "claude.cmd", "claude.bat", "claude"]
    } else {
        &["claude"]
    };
    for dir in std::env::split_paths(&path) {
        for name in names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}
