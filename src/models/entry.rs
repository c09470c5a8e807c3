use std::fmt;

use crossbeam_channel::Sender;
use log::error;

use crate::output::transcoder::StreamTranscoder;
use crate::process::controller::ProcessController;

use super::{
    error::LaunchError,
    event::EntryField,
    message::{ExitOutcome, QueueMessage, RunToken},
};

pub const STATUS_QUEUED: &str = "Queued";
pub const STATUS_RUNNING: &str = "Running";
pub const STATUS_FINISHED: &str = "Finished";
pub const STATUS_STOPPED: &str = "Stopped";
pub const STATUS_MARKED_FINISHED: &str = "Marked finished";
pub const STOPPED_MARKER: &str = "\n-- forcefully stopped --\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cloneable view of an entry, handed out to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub name: String,
    pub status: String,
    pub output: String,
    pub working: bool,
    pub finished: bool,
    pub error: bool,
    pub pid: Option<u32>,
}

/// One queued program invocation and its captured state.
#[derive(Debug)]
pub struct QueueEntry {
    id: EntryId,
    name: String,
    status: String,
    output: String,
    working: bool,
    finished: bool,
    error: bool,
    process: ProcessController,
    transcoder: StreamTranscoder,
    run: Option<u64>,
    stop_requested: bool,
}

impl QueueEntry {
    pub fn new(id: EntryId, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id,
            process: ProcessController::new(&name),
            name,
            status: STATUS_QUEUED.to_string(),
            output: String::new(),
            working: false,
            finished: false,
            error: false,
            transcoder: StreamTranscoder::new(),
            run: None,
            stop_requested: false,
        }
    }

    /// Rebuilds an entry from persisted state.
    pub fn restored(id: EntryId, name: impl Into<String>, finished: bool, output: String) -> Self {
        let mut entry = Self::new(id, name);
        entry.finished = finished;
        entry.status = if finished { STATUS_FINISHED } else { STATUS_QUEUED }.to_string();
        entry.output = output;
        entry
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn is_working(&self) -> bool {
        self.working
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    /// Whether the scheduler may pick this entry.
    pub fn is_eligible(&self) -> bool {
        !self.finished && !self.working && !self.error
    }

    pub fn current_run(&self) -> Option<u64> {
        self.run
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            id: self.id,
            name: self.name.clone(),
            status: self.status.clone(),
            output: self.output.clone(),
            working: self.working,
            finished: self.finished,
            error: self.error,
            pid: self.process.pid(),
        }
    }

    /// Renames the entry. Only allowed before it has run to completion.
    pub fn rename(&mut self, name: impl Into<String>) -> bool {
        if self.working || self.finished {
            return false;
        }
        self.name = name.into();
        self.process.set_program(&self.name);
        true
    }

    /// Starts a new run. On failure the entry is left failed, not working.
    pub fn start(
        &mut self,
        run: u64,
        redirect: bool,
        sender: Sender<QueueMessage>,
    ) -> Result<Vec<EntryField>, (LaunchError, Vec<EntryField>)> {
        self.output.clear();
        self.transcoder = StreamTranscoder::new();
        self.stop_requested = false;
        self.error = false;
        self.finished = false;
        self.working = true;

        let token = RunToken {
            entry: self.id,
            run,
        };
        match self.process.start(redirect, token, sender) {
            Ok(_) => {
                self.run = Some(run);
                self.status = STATUS_RUNNING.to_string();
                Ok(vec![
                    EntryField::Output,
                    EntryField::Error,
                    EntryField::Finished,
                    EntryField::Working,
                    EntryField::Status,
                ])
            }
            Err(err) => {
                self.working = false;
                self.finished = false;
                self.error = true;
                self.run = None;
                self.output
                    .push_str(&format!("Error while starting {}:\n\n{}", self.name, err));
                self.status = err.to_string();
                Err((
                    err,
                    vec![
                        EntryField::Output,
                        EntryField::Error,
                        EntryField::Finished,
                        EntryField::Working,
                        EntryField::Status,
                    ],
                ))
            }
        }
    }

    /// Feeds one chunk of process output through the transcoder.
    pub fn append_output(&mut self, chunk: &str) -> Vec<EntryField> {
        if self.stop_requested {
            return Vec::new();
        }
        let transcribed = self.transcoder.feed(&mut self.output, chunk);
        let mut changed = Vec::new();
        if transcribed.log_changed {
            changed.push(EntryField::Output);
        }
        if let Some(status) = transcribed.status {
            self.status = status;
            changed.push(EntryField::Status);
        }
        changed
    }

    /// Records the end of the current run.
    pub fn finish_run(&mut self, outcome: ExitOutcome) -> Vec<EntryField> {
        self.process.clear();
        self.run = None;
        self.working = false;
        self.finished = true;
        self.error = !outcome.success || self.stop_requested;
        self.status = if self.stop_requested {
            STATUS_STOPPED
        } else {
            STATUS_FINISHED
        }
        .to_string();
        vec![
            EntryField::Working,
            EntryField::Finished,
            EntryField::Error,
            EntryField::Status,
        ]
    }

    /// Kills the running process tree and marks the output. The exit
    /// notification of the killed run finishes the entry.
    pub fn force_stop(&mut self) -> Vec<EntryField> {
        if !self.working {
            return Vec::new();
        }
        self.stop_requested = true;
        self.process.stop_monitoring();
        if let Err(e) = self.process.terminate() {
            error!("Failed to stop entry {}: {}", self.id, e);
        }
        self.output.push_str(STOPPED_MARKER);
        vec![EntryField::Output]
    }

    /// Makes a finished or failed entry eligible again.
    pub fn reset(&mut self) -> Vec<EntryField> {
        self.finished = false;
        self.error = false;
        self.status = STATUS_QUEUED.to_string();
        vec![EntryField::Finished, EntryField::Error, EntryField::Status]
    }

    pub fn mark_finished(&mut self) -> Vec<EntryField> {
        self.finished = true;
        self.status = STATUS_MARKED_FINISHED.to_string();
        vec![EntryField::Finished, EntryField::Status]
    }
}
