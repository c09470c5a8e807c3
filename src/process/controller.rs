use std::{
    io::{ErrorKind, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Sender};
use log::{debug, error, info, warn};

use crate::models::{
    error::{LaunchError, TerminationError},
    message::{ExitOutcome, QueueMessage, RunToken},
};
use crate::output::decoder::ChunkDecoder;

use super::tree::{kill_group, kill_tree};

const READ_BUFFER_SIZE: usize = 4096;

/// How long the readers may keep draining output after the process exited.
/// Pipes still held open by orphaned helpers are abandoned after this.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Owns the OS process of one queue entry. Re-armed for every run.
#[derive(Debug)]
pub struct ProcessController {
    program: PathBuf,
    pid: Option<u32>,
    monitoring: Option<Arc<AtomicBool>>,
    /// Set by the waiter once the child has been reaped.
    exited: Option<Arc<AtomicBool>>,
    /// The child leads its own process group.
    group_leader: bool,
}

impl ProcessController {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            pid: None,
            monitoring: None,
            exited: None,
            group_leader: false,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn set_program(&mut self, program: impl Into<PathBuf>) {
        self.program = program.into();
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Launches the program. Output chunks and the single exit notification
    /// for this run are sent on `sender`, tagged with `token`.
    pub fn start(
        &mut self,
        redirect: bool,
        token: RunToken,
        sender: Sender<QueueMessage>,
    ) -> Result<u32, LaunchError> {
        let launch_error = |source| LaunchError {
            program: self.program.clone(),
            source,
        };
        // The working directory changes below, so a relative path must be
        // resolved against ours first.
        let program = std::path::absolute(&self.program).map_err(launch_error)?;

        let mut command = Command::new(&program);
        if let Some(dir) = program.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        if redirect {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            // Own group so helpers left behind can be killed with the job.
            // Only without a terminal: a background group may not read it.
            #[cfg(unix)]
            std::os::unix::process::CommandExt::process_group(&mut command, 0);
        } else {
            command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        }

        let mut child = command.spawn().map_err(launch_error)?;
        let pid = child.id();
        info!("Started '{}' with pid {}.", self.program.display(), pid);

        let monitoring = Arc::new(AtomicBool::new(redirect));
        let exited = Arc::new(AtomicBool::new(false));
        let (drained_tx, drained_rx) = bounded(2);
        let mut readers = 0;
        if redirect {
            if let Some(stdout) = child.stdout.take() {
                let reader = Reader::new(token, &sender, &monitoring, &drained_tx);
                reader.spawn(stdout);
                readers += 1;
            }
            if let Some(stderr) = child.stderr.take() {
                let reader = Reader::new(token, &sender, &monitoring, &drained_tx);
                reader.spawn(stderr);
                readers += 1;
            }
        }
        drop(drained_tx);

        let waiter_monitoring = Arc::clone(&monitoring);
        let waiter_exited = Arc::clone(&exited);
        thread::spawn(move || {
            let outcome = match child.wait() {
                Ok(status) => ExitOutcome {
                    code: status.code(),
                    success: status.success(),
                },
                Err(e) => {
                    error!("Failed to wait for child process {}: {}", pid, e);
                    ExitOutcome {
                        code: None,
                        success: false,
                    }
                }
            };
            waiter_exited.store(true, Ordering::SeqCst);

            // Deliver the remaining chunks before the exit notification,
            // unless a leftover helper keeps the pipes open.
            let deadline = Instant::now() + OUTPUT_DRAIN_GRACE;
            for _ in 0..readers {
                if drained_rx.recv_deadline(deadline).is_err() {
                    debug!("Output of process {} still open after exit, detaching readers.", pid);
                    waiter_monitoring.store(false, Ordering::SeqCst);
                    break;
                }
            }
            let _ = sender.send(QueueMessage::Exited(token, outcome));
        });

        self.pid = Some(pid);
        self.monitoring = Some(monitoring);
        self.exited = Some(exited);
        self.group_leader = cfg!(unix) && redirect;
        Ok(pid)
    }

    /// Stops forwarding output from the current run.
    pub fn stop_monitoring(&self) {
        if let Some(monitoring) = &self.monitoring {
            monitoring.store(false, Ordering::SeqCst);
        }
    }

    /// Marks the run as over once its exit has been handled.
    pub fn clear(&mut self) {
        self.stop_monitoring();
        self.monitoring = None;
        self.exited = None;
        self.pid = None;
        self.group_leader = false;
    }

    fn has_exited(&self) -> bool {
        self.exited
            .as_ref()
            .is_some_and(|exited| exited.load(Ordering::SeqCst))
    }

    /// Kills the process and all of its descendants, including helpers
    /// that outlived it in its process group.
    pub fn terminate(&self) -> Result<(), TerminationError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        // A reaped pid may already belong to someone else.
        let result = if self.has_exited() {
            Ok(())
        } else {
            kill_tree(pid)
        };
        if self.group_leader {
            match kill_group(pid) {
                Ok(()) | Err(TerminationError::AlreadyExited(_)) => {}
                Err(e) => warn!("{}", e),
            }
        }
        result
    }
}

/// Forwards one output stream of a run as decoded chunks.
struct Reader {
    token: RunToken,
    sender: Sender<QueueMessage>,
    monitoring: Arc<AtomicBool>,
    drained: Sender<()>,
}

impl Reader {
    fn new(
        token: RunToken,
        sender: &Sender<QueueMessage>,
        monitoring: &Arc<AtomicBool>,
        drained: &Sender<()>,
    ) -> Self {
        Self {
            token,
            sender: sender.clone(),
            monitoring: Arc::clone(monitoring),
            drained: drained.clone(),
        }
    }

    fn forward(&self, text: String) {
        if !text.is_empty() && self.monitoring.load(Ordering::SeqCst) {
            let _ = self.sender.send(QueueMessage::Output(self.token, text));
        }
    }

    fn spawn<R: Read + Send + 'static>(self, mut stream: R) {
        thread::spawn(move || {
            let mut decoder = ChunkDecoder::new();
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => self.forward(decoder.push(&buf[..n])),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("Output reader for entry {} stopped: {}", self.token.entry, e);
                        break;
                    }
                }
            }
            self.forward(decoder.finish());
            let _ = self.drained.send(());
        });
    }
}
