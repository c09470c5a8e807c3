#![cfg(unix)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use program_queuer::{
    manager::queue_manager::QueueManager,
    models::{
        entry::{EntryId, STOPPED_MARKER},
        error::QueueError,
        event::QueueEvent,
    },
    persistence::{autosave::DEFAULT_SAVE_DELAY, store::FileStore},
};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(15);

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Applies process events until `done` holds.
fn pump_until(manager: &QueueManager, done: impl Fn(&QueueManager) -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !done(manager) {
        assert!(Instant::now() < deadline, "timed out waiting for queue state");
        manager.pump(Duration::from_millis(20));
    }
}

fn finished(manager: &QueueManager, id: EntryId) -> bool {
    manager.entry(id).is_some_and(|entry| entry.finished)
}

#[test]
fn queue_runs_entries_in_order_then_goes_idle() {
    let dir = TempDir::new().unwrap();
    let p1 = script(dir.path(), "p1.sh", "echo one");
    let p2 = script(
        dir.path(),
        "p2.sh",
        "while [ ! -f go ]; do sleep 0.05; done\necho two",
    );

    let manager = QueueManager::in_memory();
    let events = manager.subscribe();
    let a = manager.add_to_queue(&p1);
    let b = manager.add_to_queue(&p2);

    assert!(manager.run_queuer());
    assert!(manager.is_working());
    assert_eq!(manager.current_entry(), Some(a));

    pump_until(&manager, |m| finished(m, a));
    let first = manager.entry(a).unwrap();
    assert!(!first.working);
    assert!(!first.error);
    assert_eq!(first.output, "one\n");
    assert_eq!(first.status, "Finished");
    assert_eq!(manager.current_entry(), Some(b));
    assert!(manager.is_working());
    assert!(manager.entry(b).unwrap().working);

    fs::write(dir.path().join("go"), "").unwrap();
    pump_until(&manager, |m| finished(m, b));
    assert!(!manager.entry(b).unwrap().working);
    assert!(!manager.is_working());
    assert_eq!(manager.current_entry(), None);

    let events: Vec<_> = events.try_iter().collect();
    let expected = [
        QueueEvent::WorkingChanged(true),
        QueueEvent::CurrentEntryChanged(Some(a)),
        QueueEvent::EntryFinished(a),
        QueueEvent::CurrentEntryChanged(Some(b)),
        QueueEvent::EntryFinished(b),
        QueueEvent::CurrentEntryChanged(None),
        QueueEvent::WorkingChanged(false),
    ];
    let observed: Vec<_> = events
        .iter()
        .filter(|event| expected.contains(event))
        .cloned()
        .collect();
    assert_eq!(observed, expected);
}

#[test]
fn launch_failure_is_recorded_and_queue_advances() {
    let dir = TempDir::new().unwrap();
    let good = script(dir.path(), "good.sh", "echo fine");

    let manager = QueueManager::in_memory();
    let bad = manager.add_to_queue(dir.path().join("missing.sh"));
    let ok = manager.add_to_queue(&good);

    assert!(manager.run_queuer());
    let failed = manager.entry(bad).unwrap();
    assert!(failed.error);
    assert!(!failed.finished);
    assert!(!failed.working);
    assert!(failed.output.contains("missing.sh"));
    assert_eq!(manager.current_entry(), Some(ok));

    pump_until(&manager, |m| !m.is_working());
    assert!(finished(&manager, ok));
    // The failed entry is not retried until it is reset.
    assert!(!manager.entry(bad).unwrap().finished);
    assert!(!manager.run_queuer());
}

#[test]
fn progress_redraws_collapse_to_final_line() {
    let dir = TempDir::new().unwrap();
    let program = script(
        dir.path(),
        "progress.sh",
        "printf 'working\\n'\nprintf '10%%\\r'\nsleep 0.3\nprintf '50%%\\r'\nsleep 0.3\nprintf '\\rDone\\r\\n'",
    );

    let manager = QueueManager::in_memory();
    let id = manager.add_to_queue(&program);
    manager.run_queuer();
    pump_until(&manager, |m| finished(m, id));

    let entry = manager.entry(id).unwrap();
    assert!(entry.output.starts_with("working\n"));
    assert!(entry.output.ends_with("Done\r\n"));
    assert_eq!(entry.output.matches("Done").count(), 1);
    assert!(!entry.error);
}

#[test]
fn failing_exit_marks_error_but_finishes() {
    let dir = TempDir::new().unwrap();
    let program = script(dir.path(), "fail.sh", "echo oops >&2\nexit 4");

    let manager = QueueManager::in_memory();
    let id = manager.add_to_queue(&program);
    manager.run_queuer();
    pump_until(&manager, |m| finished(m, id));

    let entry = manager.entry(id).unwrap();
    assert!(entry.error);
    assert_eq!(entry.output, "oops\n");
    assert!(!manager.is_working());

    manager.reset_entry(id).unwrap();
    let entry = manager.entry(id).unwrap();
    assert!(!entry.finished && !entry.error);
}

#[cfg(target_os = "linux")]
fn is_alive(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        // The state field follows the parenthesised command name.
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
#[test]
fn force_stop_kills_process_tree_and_leaves_others_alone() {
    let dir = TempDir::new().unwrap();
    let spawner = script(
        dir.path(),
        "spawner.sh",
        "sleep 60 &\necho $! > child.pid\necho started\nwait",
    );
    let other = script(dir.path(), "other.sh", "echo other");

    let manager = QueueManager::in_memory();
    let running = manager.add_to_queue(&spawner);
    let pending = manager.add_to_queue(&other);
    assert!(manager.run_queuer());

    let pid_file = dir.path().join("child.pid");
    pump_until(&manager, |m| {
        m.entry(running).is_some_and(|e| e.output.contains("started"))
    });
    let child: u32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    let parent = manager.entry(running).unwrap().pid.unwrap();
    assert!(is_alive(child));

    manager.force_stop();
    assert!(!manager.is_working());

    pump_until(&manager, |m| finished(m, running));
    let stopped = manager.entry(running).unwrap();
    assert!(!stopped.working);
    assert!(stopped.error);
    assert_eq!(stopped.status, "Stopped");
    assert!(stopped.output.ends_with(STOPPED_MARKER));

    let deadline = Instant::now() + TIMEOUT;
    while is_alive(child) || is_alive(parent) {
        assert!(Instant::now() < deadline, "process tree survived force stop");
        std::thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(manager.current_entry(), None);
    let untouched = manager.entry(pending).unwrap();
    assert!(!untouched.finished);
    assert!(!untouched.working);
    assert!(untouched.output.is_empty());
}

#[test]
fn leftover_helper_does_not_hold_back_the_queue() {
    let dir = TempDir::new().unwrap();
    let job = script(dir.path(), "job.sh", "(sleep 20 &)\necho parent-done\nexit 0");
    let next = script(dir.path(), "next.sh", "echo next");

    let manager = QueueManager::in_memory();
    let first = manager.add_to_queue(&job);
    let second = manager.add_to_queue(&next);
    manager.run_queuer();

    pump_until(&manager, |m| finished(m, first));
    let entry = manager.entry(first).unwrap();
    assert_eq!(entry.output, "parent-done\n");
    assert_eq!(entry.status, "Finished");
    assert!(!entry.error);

    pump_until(&manager, |m| finished(m, second));
    pump_until(&manager, |m| !m.is_working());
    manager.remove_from_queue(first).unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn force_stop_reaches_orphaned_helpers() {
    let dir = TempDir::new().unwrap();
    let job = script(
        dir.path(),
        "orphans.sh",
        "(sleep 30 & echo $! > helper.pid)\necho started\nsleep 30",
    );

    let manager = QueueManager::in_memory();
    let id = manager.add_to_queue(&job);
    manager.run_queuer();
    pump_until(&manager, |m| {
        m.entry(id).is_some_and(|e| e.output.contains("started"))
    });
    let helper: u32 = fs::read_to_string(dir.path().join("helper.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(is_alive(helper));

    manager.force_stop();
    pump_until(&manager, |m| finished(m, id));
    assert_eq!(manager.entry(id).unwrap().status, "Stopped");
    manager.remove_from_queue(id).unwrap();

    let deadline = Instant::now() + TIMEOUT;
    while is_alive(helper) {
        assert!(Instant::now() < deadline, "orphaned helper survived force stop");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn relative_program_path_launches() {
    let cwd = std::env::current_dir().unwrap();
    let dir = tempfile::tempdir_in(&cwd).unwrap();
    let program = script(dir.path(), "rel.sh", "echo relative");
    let relative = program.strip_prefix(&cwd).unwrap().to_path_buf();

    let manager = QueueManager::in_memory();
    let id = manager.add_to_queue(&relative);
    manager.run_queuer();
    pump_until(&manager, |m| finished(m, id));

    let entry = manager.entry(id).unwrap();
    assert!(!entry.error);
    assert_eq!(entry.output, "relative\n");
    assert_eq!(entry.name, relative.to_string_lossy());
}

#[test]
fn stopping_current_entry_continues_with_next() {
    let dir = TempDir::new().unwrap();
    let slow = script(dir.path(), "slow.sh", "echo begin\nsleep 60");
    let quick = script(dir.path(), "quick.sh", "echo quick");

    let manager = QueueManager::in_memory();
    let a = manager.add_to_queue(&slow);
    let b = manager.add_to_queue(&quick);
    manager.run_queuer();
    pump_until(&manager, |m| {
        m.entry(a).is_some_and(|e| e.output.contains("begin"))
    });

    assert_eq!(manager.remove_from_queue(a), Err(QueueError::EntryWorking(a)));
    assert_eq!(manager.start_entry(b), Err(QueueError::Busy));

    manager.force_stop_entry(a).unwrap();
    pump_until(&manager, |m| finished(m, b));
    assert_eq!(manager.entry(a).unwrap().status, "Stopped");
    assert_eq!(manager.entry(b).unwrap().output, "quick\n");
    pump_until(&manager, |m| !m.is_working());

    manager.remove_from_queue(a).unwrap();
    assert_eq!(manager.entries().len(), 1);
}

#[test]
fn started_entry_is_adopted_by_run_queuer() {
    let dir = TempDir::new().unwrap();
    let gate = script(
        dir.path(),
        "gate.sh",
        "while [ ! -f open ]; do sleep 0.05; done",
    );
    let next = script(dir.path(), "next.sh", "echo next");

    let manager = QueueManager::in_memory();
    let first = manager.add_to_queue(&gate);
    let second = manager.add_to_queue(&next);

    manager.start_entry(first).unwrap();
    assert!(!manager.is_working());
    assert!(manager.run_queuer());
    assert_eq!(manager.current_entry(), Some(first));
    assert!(!manager.entry(second).unwrap().working);

    fs::write(dir.path().join("open"), "").unwrap();
    pump_until(&manager, |m| finished(m, second));
    pump_until(&manager, |m| !m.is_working());
}

#[test]
fn queue_survives_restart() {
    let dir = TempDir::new().unwrap();
    let program = script(dir.path(), "say.sh", "printf 'a|b;c\\n'");
    let settings = dir.path().join("state").join("settings.json");

    let manager = QueueManager::new(Box::new(FileStore::new(&settings)), DEFAULT_SAVE_DELAY);
    let done = manager.add_to_queue(&program);
    manager.add_to_queue(dir.path().join("later.sh"));
    manager.set_redirect_output(true);
    manager.run_queuer();
    pump_until(&manager, |m| finished(m, done));
    manager.save().unwrap();

    let restored = QueueManager::new(Box::new(FileStore::new(&settings)), DEFAULT_SAVE_DELAY);
    assert_eq!(restored.load().unwrap(), 2);
    let entries = restored.entries();
    assert_eq!(entries[0].name, program.to_string_lossy());
    assert!(entries[0].finished);
    assert_eq!(entries[0].status, "Finished");
    assert_eq!(entries[0].output, "a|b;c\n");
    assert!(!entries[1].finished);
    assert_eq!(entries[1].status, "Queued");
    assert_eq!(restored.last_path(), Some(dir.path().to_path_buf()));
}
