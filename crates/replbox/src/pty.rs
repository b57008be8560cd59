//! PTY Session Manager.
//!
//! Owns the table of live shells, keyed by connection id. Each shell gets
//! three OS threads: a reader that forwards output chunks into a bounded
//! channel, a writer that drains queued input, and a waiter that reaps the
//! process. Output ordering within one shell is preserved by the single
//! reader.
//!
//! Exit is detected by the waiter, not by output EOF: a background job
//! started from the shell keeps the terminal open after the shell is gone.
//!
//! Registration is keyed by connection id and tagged with a generation
//! number, so a shell that exits after being replaced can never remove the
//! registration of its successor.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TerminalConfig;

const READ_BUFFER_SIZE: usize = 8192;

/// How long the waiter lets the reader drain output written just before exit.
const EXIT_OUTPUT_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("working directory does not exist: {0}")]
    MissingWorkingDirectory(PathBuf),

    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),

    #[error("terminal input closed for session {0}")]
    InputClosed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Something a shell produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Raw output bytes, chunked at arbitrary boundaries.
    Output(Bytes),
    /// The shell exited on its own and its registration was removed.
    Exited,
}

/// Public description of a live shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyHandle {
    pub process_id: Option<u32>,
    pub working_directory: PathBuf,
    pub columns: u16,
    generation: u64,
}

impl PtyHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct PtySession {
    handle: PtyHandle,
    input: std_mpsc::Sender<Vec<u8>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    reaped: Arc<AtomicBool>,
    _master: Mutex<Box<dyn MasterPty + Send>>,
}

impl PtySession {
    fn kill(&self) {
        if let Ok(mut killer) = self.killer.lock() {
            kill_unless_reaped(&mut **killer, &self.reaped);
        }
    }
}

/// A reaped pid may already belong to another process.
fn kill_unless_reaped(killer: &mut (dyn ChildKiller + Send + Sync), reaped: &AtomicBool) {
    if !reaped.load(Ordering::SeqCst) {
        // The process may already be gone.
        let _ = killer.kill();
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.kill();
    }
}

type Registry = DashMap<String, Arc<PtySession>>;

pub struct PtyManager {
    sessions: Arc<Registry>,
    next_generation: AtomicU64,
    config: TerminalConfig,
}

impl PtyManager {
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
            config,
        }
    }

    /// Spawn a shell in `workspace_root` and register it under `session_id`.
    ///
    /// An existing shell for the same session is killed and replaced. Output
    /// is delivered through the returned receiver, which ends after
    /// [`PtyEvent::Exited`] or once the shell is terminated.
    pub fn create(
        &self,
        session_id: &str,
        workspace_root: &Path,
    ) -> Result<(PtyHandle, mpsc::Receiver<PtyEvent>), PtyError> {
        if !workspace_root.is_dir() {
            return Err(PtyError::MissingWorkingDirectory(
                workspace_root.to_path_buf(),
            ));
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: self.config.rows,
                cols: self.config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&self.config.shell);
        cmd.cwd(workspace_root);
        cmd.env("TERM", &self.config.term);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("{}: {}", self.config.shell, e)))?;
        // Only the child keeps the slave side open, so reads hit EOF on exit.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = PtyHandle {
            process_id: child.process_id(),
            working_directory: workspace_root.to_path_buf(),
            columns: self.config.cols,
            generation,
        };

        let (output_tx, output_rx) = mpsc::channel(self.config.output_buffer.max(1));
        let (input_tx, input_rx) = std_mpsc::channel();
        let reaped = Arc::new(AtomicBool::new(false));

        let session = Arc::new(PtySession {
            handle: handle.clone(),
            input: input_tx,
            killer: Mutex::new(child.clone_killer()),
            reaped: reaped.clone(),
            _master: Mutex::new(pair.master),
        });

        spawn_writer(
            session_id,
            writer,
            input_rx,
            child.clone_killer(),
            reaped.clone(),
        )?;

        // Register before the waiter starts so an immediate exit finds its entry.
        if let Some(previous) = self.sessions.insert(session_id.to_string(), session) {
            info!(
                "Replacing terminal for session {} (pid {:?})",
                session_id, previous.handle.process_id
            );
            previous.kill();
        }

        let (reader_done_tx, reader_done_rx) = std_mpsc::channel::<()>();
        let reader_thread = {
            let output_tx = output_tx.clone();
            let mut killer = child.clone_killer();
            let reaped = reaped.clone();
            let id = session_id.to_string();
            std::thread::Builder::new()
                .name("pty-reader".into())
                .spawn(move || {
                    if pump_output(reader, &output_tx) == PumpEnd::ReadError {
                        // Treated as process exit; the waiter cleans up.
                        debug!("Killing shell for session {} after read error", id);
                        kill_unless_reaped(&mut *killer, &reaped);
                    }
                    drop(reader_done_tx);
                })
        };

        if let Err(e) = reader_thread {
            // Dropping the removed session kills the child.
            self.sessions
                .remove_if(session_id, |_, s| s.handle.generation == generation);
            let _ = child.wait();
            return Err(PtyError::SpawnFailed(e.to_string()));
        }

        let sessions = self.sessions.clone();
        let id = session_id.to_string();
        let waiter_thread = std::thread::Builder::new()
            .name("pty-waiter".into())
            .spawn(move || {
                let status = child.wait();
                reaped.store(true, Ordering::SeqCst);
                debug!("Shell for session {} exited: {:?}", id, status);

                // Output the shell wrote before exiting goes out first. A
                // background job holding the terminal open only delays this
                // by the grace period.
                let _ = reader_done_rx.recv_timeout(EXIT_OUTPUT_GRACE);

                let removed = sessions
                    .remove_if(&id, |_, s| s.handle.generation == generation)
                    .is_some();
                if removed {
                    info!("Terminal for session {} exited on its own", id);
                    let _ = output_tx.blocking_send(PtyEvent::Exited);
                }
            });

        if let Err(e) = waiter_thread {
            self.sessions
                .remove_if(session_id, |_, s| s.handle.generation == generation);
            return Err(PtyError::SpawnFailed(e.to_string()));
        }

        info!(
            "Spawned {} for session {} in {} (pid {:?})",
            self.config.shell,
            session_id,
            workspace_root.display(),
            handle.process_id
        );

        Ok((handle, output_rx))
    }

    /// Queue `data` for the shell's input. A session without a terminal is
    /// not an error.
    pub fn write(&self, session_id: &str, data: &[u8]) -> Result<(), PtyError> {
        let Some(session) = self.sessions.get(session_id).map(|s| s.clone()) else {
            return Ok(());
        };

        session
            .input
            .send(data.to_vec())
            .map_err(|_| PtyError::InputClosed(session_id.to_string()))
    }

    /// Kill the shell for `session_id` and drop its registration without
    /// waiting for the process to exit. Safe to call repeatedly.
    pub fn terminate(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            info!(
                "Terminating terminal for session {} (pid {:?})",
                session_id, session.handle.process_id
            );
            session.kill();
        }
    }

    pub fn terminate_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.terminate(&id);
        }
    }

    pub fn handle(&self, session_id: &str) -> Option<PtyHandle> {
        self.sessions.get(session_id).map(|s| s.handle.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Drop for PtyManager {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    Eof,
    ReadError,
    ReceiverClosed,
}

/// Forward shell output until EOF, a read error or a dropped receiver.
fn pump_output(mut reader: Box<dyn Read + Send>, output: &mpsc::Sender<PtyEvent>) -> PumpEnd {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return PumpEnd::Eof,
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if output.blocking_send(PtyEvent::Output(chunk)).is_err() {
                    return PumpEnd::ReceiverClosed;
                }
            }
            // Linux reports EIO once every slave side is closed.
            Err(e) if e.raw_os_error() == Some(5) => return PumpEnd::Eof,
            Err(e) => {
                debug!("PTY read ended: {}", e);
                return PumpEnd::ReadError;
            }
        }
    }
}

fn spawn_writer(
    session_id: &str,
    mut writer: Box<dyn Write + Send>,
    input: std_mpsc::Receiver<Vec<u8>>,
    mut killer: Box<dyn ChildKiller + Send + Sync>,
    reaped: Arc<AtomicBool>,
) -> Result<(), PtyError> {
    let id = session_id.to_string();
    std::thread::Builder::new()
        .name("pty-writer".into())
        .spawn(move || {
            for chunk in input {
                let result = writer.write_all(&chunk).and_then(|_| writer.flush());
                if let Err(e) = result {
                    // Treated as process exit: the waiter reaps the killed
                    // shell and cleans up.
                    warn!("Terminal input for session {} failed: {}", id, e);
                    kill_unless_reaped(&mut *killer, &reaped);
                    break;
                }
            }
        })
        .map(|_| ())
        .map_err(|e| PtyError::SpawnFailed(e.to_string()))
}
