use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::models::{
    entry::{EntryId, EntrySnapshot, QueueEntry},
    error::{QueueError, StorageResult},
    event::{EntryField, QueueEvent},
    message::{ExitOutcome, QueueMessage, RunToken},
};
use crate::persistence::{
    autosave::{Debouncer, DEFAULT_SAVE_DELAY},
    codec::{self, PersistedEntry},
    store::{MemoryStore, Settings, StateStore},
};

use super::scheduler::{next_eligible, RunNext};

struct QueueState {
    entries: Vec<QueueEntry>,
    working: bool,
    current_entry: Option<EntryId>,
    redirect_output: bool,
    last_path: Option<PathBuf>,
    /// Run id to the entry that owns the run.
    runs: HashMap<u64, EntryId>,
    next_id: u64,
    next_run: u64,
}

impl QueueState {
    fn allocate_id(&mut self) -> EntryId {
        self.next_id += 1;
        EntryId(self.next_id)
    }

    fn allocate_run(&mut self) -> u64 {
        self.next_run += 1;
        self.next_run
    }

    fn index_of(&self, id: EntryId) -> Result<usize, QueueError> {
        self.entries
            .iter()
            .position(|entry| entry.id() == id)
            .ok_or(QueueError::NotFound(id))
    }

    fn settings(&self) -> Settings {
        let persisted: Vec<PersistedEntry> = self
            .entries
            .iter()
            .map(|entry| PersistedEntry {
                name: entry.name().to_string(),
                finished: entry.is_finished(),
                output: entry.output().to_string(),
            })
            .collect();
        Settings {
            queue: codec::encode(&persisted),
            redirect_output: self.redirect_output,
            last_path: self.last_path.clone(),
            ..Settings::default()
        }
    }
}

struct Shared {
    state: Mutex<QueueState>,
    sender: Sender<QueueMessage>,
    receiver: Receiver<QueueMessage>,
    subscribers: Mutex<Vec<Sender<QueueEvent>>>,
    store: Box<dyn StateStore>,
    autosave: Debouncer,
}

/// Owns the queue and runs its entries one at a time.
///
/// Cheap to clone; clones share the same queue. Operator commands and
/// process events (applied through [`dispatch`](Self::dispatch)) are
/// serialised by one lock, so transcoder updates are atomic per chunk.
#[derive(Clone)]
pub struct QueueManager {
    shared: Arc<Shared>,
}

impl QueueManager {
    pub fn new(store: Box<dyn StateStore>, save_delay: Duration) -> Self {
        let (sender, receiver) = unbounded();
        QueueManager {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    entries: Vec::new(),
                    working: false,
                    current_entry: None,
                    redirect_output: true,
                    last_path: None,
                    runs: HashMap::new(),
                    next_id: 0,
                    next_run: 0,
                }),
                sender,
                receiver,
                subscribers: Mutex::new(Vec::new()),
                store,
                autosave: Debouncer::new(save_delay),
            }),
        }
    }

    /// A manager whose state is never written to disk.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::new()), DEFAULT_SAVE_DELAY)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Notifications ──────────────────────────────────────────────────────

    pub fn subscribe(&self) -> Receiver<QueueEvent> {
        let (sender, receiver) = unbounded();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        receiver
    }

    fn publish(&self, event: QueueEvent) {
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn publish_fields(&self, id: EntryId, fields: Vec<EntryField>) {
        for field in fields {
            self.publish(QueueEvent::EntryChanged(id, field));
        }
    }

    fn set_working(&self, state: &mut QueueState, working: bool) {
        if state.working != working {
            state.working = working;
            self.publish(QueueEvent::WorkingChanged(working));
        }
    }

    fn set_current(&self, state: &mut QueueState, current: Option<EntryId>) {
        if state.current_entry != current {
            state.current_entry = current;
            self.publish(QueueEvent::CurrentEntryChanged(current));
        }
    }

    // ── Process events ─────────────────────────────────────────────────────

    /// Receiving end of the process event channel, for the worker thread.
    pub fn messages(&self) -> Receiver<QueueMessage> {
        self.shared.receiver.clone()
    }

    /// Asks the worker thread to exit.
    pub fn shutdown(&self) {
        let _ = self.shared.sender.send(QueueMessage::Shutdown);
    }

    /// Applies one process event. Returns `false` for [`QueueMessage::Shutdown`].
    pub fn dispatch(&self, message: QueueMessage) -> bool {
        match message {
            QueueMessage::Output(token, text) => self.handle_output(token, &text),
            QueueMessage::Exited(token, outcome) => self.handle_exit(token, outcome),
            QueueMessage::Shutdown => return false,
        }
        true
    }

    /// Waits up to `timeout` for one process event and applies it.
    pub fn pump(&self, timeout: Duration) -> bool {
        match self.shared.receiver.recv_timeout(timeout) {
            Ok(message) => {
                self.dispatch(message);
                true
            }
            Err(_) => false,
        }
    }

    fn handle_output(&self, token: RunToken, text: &str) {
        let changed = {
            let mut state = self.lock();
            if state.runs.get(&token.run) != Some(&token.entry) {
                debug!("Dropping output of stale run {} for entry {}.", token.run, token.entry);
                return;
            }
            let Ok(index) = state.index_of(token.entry) else {
                return;
            };
            let fields = state.entries[index].append_output(text);
            let changed = !fields.is_empty();
            self.publish_fields(token.entry, fields);
            changed
        };
        if changed {
            self.trigger_save();
        }
    }

    fn handle_exit(&self, token: RunToken, outcome: ExitOutcome) {
        let mut state = self.lock();
        let Some(id) = state.runs.remove(&token.run) else {
            debug!("Exit of unknown run {} ignored.", token.run);
            return;
        };
        let Ok(index) = state.index_of(id) else {
            debug!("Exit of run {} for removed entry {} ignored.", token.run, id);
            return;
        };
        let entry = &mut state.entries[index];
        if entry.current_run() != Some(token.run) {
            debug!("Exit of superseded run {} for entry {} ignored.", token.run, id);
            return;
        }

        let fields = entry.finish_run(outcome);
        info!(
            "Entry {} '{}' exited (code {:?}).",
            id,
            entry.name(),
            outcome.code
        );
        self.publish_fields(id, fields);
        self.persist(&state);
        self.publish(QueueEvent::EntryFinished(id));

        if state.current_entry != Some(id) {
            return;
        }
        if !state.working {
            // A stopped queue or a single run: nothing follows it.
            self.set_current(&mut state, None);
        } else if let RunNext::Exhausted = self.run_next_locked(&mut state) {
            info!("Queue finished.");
            self.set_current(&mut state, None);
            self.set_working(&mut state, false);
        }
    }

    // ── Scheduling ─────────────────────────────────────────────────────────

    /// Starts working through the queue. Returns whether the queue is running.
    pub fn run_queuer(&self) -> bool {
        let mut state = self.lock();
        if state.working {
            return true;
        }

        // An entry started on its own becomes the current one; the queue
        // continues once it exits.
        if let Some(id) = state
            .entries
            .iter()
            .find(|entry| entry.is_working())
            .map(QueueEntry::id)
        {
            self.set_current(&mut state, Some(id));
            self.set_working(&mut state, true);
            return true;
        }

        if next_eligible(&state.entries).is_none() {
            info!("Nothing to run.");
            return false;
        }

        info!("Queue started.");
        self.set_working(&mut state, true);
        match self.run_next_locked(&mut state) {
            RunNext::Started(_) => true,
            RunNext::Exhausted => {
                self.set_current(&mut state, None);
                self.set_working(&mut state, false);
                false
            }
        }
    }

    /// Starts the first eligible entry, skipping over entries that fail to launch.
    pub fn run_next(&self) -> RunNext {
        let mut state = self.lock();
        self.run_next_locked(&mut state)
    }

    fn run_next_locked(&self, state: &mut QueueState) -> RunNext {
        while let Some(index) = next_eligible(&state.entries) {
            if let Some(id) = self.run_program_locked(state, index) {
                return RunNext::Started(id);
            }
        }
        RunNext::Exhausted
    }

    /// Launches the entry at `index`. A launch failure is recorded on the
    /// entry and yields `None`.
    fn run_program_locked(&self, state: &mut QueueState, index: usize) -> Option<EntryId> {
        let run = state.allocate_run();
        let redirect = state.redirect_output;
        let id = state.entries[index].id();

        let entry = &mut state.entries[index];
        match entry.start(run, redirect, self.shared.sender.clone()) {
            Ok(fields) => {
                info!("Entry {} '{}' is running.", id, entry.name());
                state.runs.insert(run, id);
                self.set_current(state, Some(id));
                self.publish_fields(id, fields);
                Some(id)
            }
            Err((err, fields)) => {
                warn!("Entry {}: {}", id, err);
                self.publish_fields(id, fields);
                self.persist(state);
                None
            }
        }
    }

    /// Runs a single entry without starting the whole queue.
    pub fn start_entry(&self, id: EntryId) -> Result<(), QueueError> {
        let mut state = self.lock();
        let index = state.index_of(id)?;
        if state.entries.iter().any(QueueEntry::is_working) {
            return Err(QueueError::Busy);
        }
        self.run_program_locked(&mut state, index);
        Ok(())
    }

    /// Stops the queue and kills every working entry's process tree.
    pub fn force_stop(&self) {
        let mut state = self.lock();
        self.set_working(&mut state, false);
        for entry in state.entries.iter_mut().filter(|entry| entry.is_working()) {
            info!("Force stopping entry {} '{}'.", entry.id(), entry.name());
            let fields = entry.force_stop();
            self.publish_fields(entry.id(), fields);
        }
        self.persist(&state);
    }

    /// Applies process events until no entry is working or `timeout`
    /// passes. Returns whether every entry has stopped.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.lock().entries.iter().any(QueueEntry::is_working) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.pump((deadline - now).min(Duration::from_millis(50)));
        }
    }

    /// Kills one entry. A running queue continues with the next entry once
    /// the stopped one has exited.
    pub fn force_stop_entry(&self, id: EntryId) -> Result<(), QueueError> {
        let mut state = self.lock();
        let index = state.index_of(id)?;
        let entry = &mut state.entries[index];
        if entry.is_working() {
            info!("Force stopping entry {} '{}'.", id, entry.name());
        }
        let fields = entry.force_stop();
        self.publish_fields(id, fields);
        self.persist(&state);
        Ok(())
    }

    // ── Queue editing ──────────────────────────────────────────────────────

    pub fn add_to_queue(&self, path: impl AsRef<Path>) -> EntryId {
        let path = path.as_ref();
        let mut state = self.lock();
        let id = state.allocate_id();
        state
            .entries
            .push(QueueEntry::new(id, path.to_string_lossy().into_owned()));
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            state.last_path = Some(dir.to_path_buf());
        }
        info!("Entry {} '{}' queued.", id, path.display());
        self.publish(QueueEvent::EntryAdded(id));
        self.persist(&state);
        id
    }

    pub fn remove_from_queue(&self, id: EntryId) -> Result<(), QueueError> {
        let mut state = self.lock();
        let index = state.index_of(id)?;
        if state.entries[index].is_working() {
            return Err(QueueError::EntryWorking(id));
        }
        state.entries.remove(index);
        if state.current_entry == Some(id) {
            self.set_current(&mut state, None);
        }
        self.publish(QueueEvent::EntryRemoved(id));
        self.persist(&state);
        Ok(())
    }

    /// Makes a finished or failed entry eligible again, in place.
    pub fn reset_entry(&self, id: EntryId) -> Result<(), QueueError> {
        self.edit_idle_entry(id, QueueEntry::reset)
    }

    pub fn mark_finished(&self, id: EntryId) -> Result<(), QueueError> {
        self.edit_idle_entry(id, QueueEntry::mark_finished)
    }

    pub fn rename_entry(&self, id: EntryId, name: impl Into<String>) -> Result<(), QueueError> {
        let mut state = self.lock();
        let index = state.index_of(id)?;
        let entry = &mut state.entries[index];
        if entry.is_working() {
            return Err(QueueError::EntryWorking(id));
        }
        if !entry.rename(name) {
            return Err(QueueError::AlreadyFinished(id));
        }
        self.publish(QueueEvent::EntryChanged(id, EntryField::Name));
        self.persist(&state);
        Ok(())
    }

    fn edit_idle_entry(
        &self,
        id: EntryId,
        edit: fn(&mut QueueEntry) -> Vec<EntryField>,
    ) -> Result<(), QueueError> {
        let mut state = self.lock();
        let index = state.index_of(id)?;
        let entry = &mut state.entries[index];
        if entry.is_working() {
            return Err(QueueError::EntryWorking(id));
        }
        let fields = edit(entry);
        self.publish_fields(id, fields);
        self.persist(&state);
        Ok(())
    }

    /// Moves an entry to `index`, shifting the entries in between.
    pub fn move_entry(&self, id: EntryId, index: usize) -> Result<(), QueueError> {
        let mut state = self.lock();
        let from = state.index_of(id)?;
        let len = state.entries.len();
        if index >= len {
            return Err(QueueError::IndexOutOfRange { index, len });
        }
        if from != index {
            let entry = state.entries.remove(from);
            state.entries.insert(index, entry);
            self.publish(QueueEvent::QueueReordered);
            self.persist(&state);
        }
        Ok(())
    }

    /// Removes every finished entry. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let mut state = self.lock();
        let (finished, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.entries)
            .into_iter()
            .partition(QueueEntry::is_finished);
        state.entries = kept;
        for entry in &finished {
            if state.current_entry == Some(entry.id()) {
                self.set_current(&mut state, None);
            }
            self.publish(QueueEvent::EntryRemoved(entry.id()));
        }
        if !finished.is_empty() {
            self.persist(&state);
        }
        finished.len()
    }

    pub fn clear_all(&self) -> Result<usize, QueueError> {
        let mut state = self.lock();
        if state.entries.iter().any(QueueEntry::is_working) {
            return Err(QueueError::Busy);
        }
        let removed = std::mem::take(&mut state.entries);
        self.set_current(&mut state, None);
        for entry in &removed {
            self.publish(QueueEvent::EntryRemoved(entry.id()));
        }
        self.persist(&state);
        Ok(removed.len())
    }

    pub fn set_redirect_output(&self, redirect: bool) {
        self.lock().redirect_output = redirect;
        self.trigger_save();
    }

    // ── Queries ────────────────────────────────────────────────────────────

    pub fn redirect_output(&self) -> bool {
        self.lock().redirect_output
    }

    pub fn is_working(&self) -> bool {
        self.lock().working
    }

    pub fn current_entry(&self) -> Option<EntryId> {
        self.lock().current_entry
    }

    pub fn last_path(&self) -> Option<PathBuf> {
        self.lock().last_path.clone()
    }

    pub fn entries(&self) -> Vec<EntrySnapshot> {
        self.lock().entries.iter().map(QueueEntry::snapshot).collect()
    }

    pub fn entry(&self, id: EntryId) -> Option<EntrySnapshot> {
        let state = self.lock();
        let index = state.index_of(id).ok()?;
        Some(state.entries[index].snapshot())
    }

    // ── Persistence ────────────────────────────────────────────────────────

    /// Writes the queue to the store now.
    pub fn save(&self) -> StorageResult<()> {
        let settings = self.lock().settings();
        self.shared.autosave.clear();
        self.shared.store.save(&settings)
    }

    fn persist(&self, state: &QueueState) {
        self.shared.autosave.clear();
        if let Err(e) = self.shared.store.save(&state.settings()) {
            error!("Failed to save queue to {}: {}", self.shared.store.name(), e);
        }
    }

    /// Schedules a deferred save; bursts of changes are written once.
    pub fn trigger_save(&self) {
        let shared = Arc::downgrade(&self.shared);
        self.shared.autosave.trigger(move || {
            if let Some(shared) = shared.upgrade() {
                if let Err(e) = (QueueManager { shared }).save() {
                    error!("Deferred save failed: {}", e);
                }
            }
        });
    }

    /// Replaces the queue with the stored one. Returns the number of
    /// entries restored; corrupt records are skipped.
    pub fn load(&self) -> StorageResult<usize> {
        let Some(settings) = self.shared.store.load()? else {
            return Ok(0);
        };
        let decoded = codec::decode(&settings.queue);

        let mut state = self.lock();
        if state.entries.iter().any(QueueEntry::is_working) {
            return Err(QueueError::Busy.into());
        }
        for entry in std::mem::take(&mut state.entries) {
            self.publish(QueueEvent::EntryRemoved(entry.id()));
        }
        state.runs.clear();
        self.set_current(&mut state, None);
        self.set_working(&mut state, false);

        for persisted in decoded.entries {
            let id = state.allocate_id();
            state.entries.push(QueueEntry::restored(
                id,
                persisted.name,
                persisted.finished,
                persisted.output,
            ));
            self.publish(QueueEvent::EntryAdded(id));
        }
        state.redirect_output = settings.redirect_output;
        state.last_path = settings.last_path;

        info!(
            "Loaded {} entries from {} ({} skipped).",
            state.entries.len(),
            self.shared.store.name(),
            decoded.skipped.len()
        );
        Ok(state.entries.len())
    }
}
