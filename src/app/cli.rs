use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    str::SplitWhitespace,
    thread,
    time::Duration,
};

use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEventKind},
    execute, terminal,
};
use log::error;

use crate::manager::queue_manager::QueueManager;
use crate::models::{entry::EntryId, event::QueueEvent};

const EXIT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn run_cli(manager: QueueManager) -> io::Result<()> {
    println!("Program queuer started. Enter a command, 'help' for a list, or 'exit' to quit.");
    spawn_notifier(&manager);

    let mut commands_history: Vec<String> = Vec::new();
    let mut history_index = 0;

    terminal::enable_raw_mode()?;
    let result = loop {
        let input = match read_line(&commands_history, &mut history_index) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(e) => break Err(e),
        };
        commands_history.push(input.clone());
        history_index = commands_history.len();

        if !execute_command(&manager, &input) {
            break Ok(());
        }
    };
    terminal::disable_raw_mode()?;
    result
}

/// Reads one line in raw mode. `None` means the line was abandoned.
fn read_line(history: &[String], history_index: &mut usize) -> io::Result<Option<String>> {
    print!("\r>>> ");
    io::stdout().flush()?;

    let mut input = String::new();
    loop {
        let Event::Key(key_event) = event::read()? else {
            continue;
        };
        if key_event.kind != KeyEventKind::Press {
            continue;
        }
        match key_event.code {
            KeyCode::Enter => {
                print!("\r\n");
                return Ok(Some(input));
            }
            KeyCode::Up => {
                if *history_index > 0 {
                    *history_index -= 1;
                }
                if let Some(command) = history.get(*history_index) {
                    input = command.clone();
                    redraw(&input)?;
                }
            }
            KeyCode::Down => {
                if *history_index < history.len() {
                    *history_index += 1;
                }
                if *history_index == history.len() {
                    clear_line()?;
                    return Ok(None);
                }
                if let Some(command) = history.get(*history_index) {
                    input = command.clone();
                    redraw(&input)?;
                }
            }
            KeyCode::Char(c) => {
                input.push(c);
                print!("{}", c);
                io::stdout().flush()?;
            }
            KeyCode::Backspace => {
                input.pop();
                redraw(&input)?;
            }
            _ => {}
        }
    }
}

/// Runs one command line. Returns `false` when the user asked to exit.
fn execute_command(manager: &QueueManager, input: &str) -> bool {
    let mut args = input.split_whitespace();
    match args.next() {
        Some("add") => {
            let paths: Vec<&str> = args.collect();
            if paths.is_empty() {
                say("Program path must be specified.");
            }
            for path in paths {
                let path = resolve_path(manager.last_path().as_deref(), path);
                let id = manager.add_to_queue(&path);
                say(&format!("Queued {} as entry {}.", path.display(), id));
            }
        }
        Some("remove") => with_id(&mut args, |id, _| match manager.remove_from_queue(id) {
            Ok(()) => say(&format!("Removed entry {}.", id)),
            Err(e) => say(&e.to_string()),
        }),
        Some("run") => {
            if manager.run_queuer() {
                say("Queue is running.");
            } else {
                say("Nothing to run.");
            }
        }
        Some("start") => with_id(&mut args, |id, _| match manager.start_entry(id) {
            Ok(()) => say(&format!("Started entry {}.", id)),
            Err(e) => say(&e.to_string()),
        }),
        Some("stop") => match args.next() {
            None => {
                manager.force_stop();
                say("Queue stopped.");
            }
            Some(raw) => match parse_id(raw) {
                Some(id) => match manager.force_stop_entry(id) {
                    Ok(()) => say(&format!("Stopped entry {}.", id)),
                    Err(e) => say(&e.to_string()),
                },
                None => say("Invalid entry ID format."),
            },
        },
        Some("reset") => with_id(&mut args, |id, _| match manager.reset_entry(id) {
            Ok(()) => say(&format!("Entry {} queued again.", id)),
            Err(e) => say(&e.to_string()),
        }),
        Some("finish") => with_id(&mut args, |id, _| match manager.mark_finished(id) {
            Ok(()) => say(&format!("Entry {} marked finished.", id)),
            Err(e) => say(&e.to_string()),
        }),
        Some("rename") => with_id(&mut args, |id, rest| {
            let name = rest.collect::<Vec<_>>().join(" ");
            if name.is_empty() {
                say("New name must be specified.");
                return;
            }
            match manager.rename_entry(id, name) {
                Ok(()) => say(&format!("Renamed entry {}.", id)),
                Err(e) => say(&e.to_string()),
            }
        }),
        Some("move") => with_id(&mut args, |id, rest| match rest.next().map(str::parse::<usize>) {
            Some(Ok(index)) => match manager.move_entry(id, index) {
                Ok(()) => say(&format!("Moved entry {} to position {}.", id, index)),
                Err(e) => say(&e.to_string()),
            },
            _ => say("Target position must be specified."),
        }),
        Some("redirect") => match args.next() {
            Some("on") => manager.set_redirect_output(true),
            Some("off") => manager.set_redirect_output(false),
            _ => say(&format!(
                "Output redirection is {}.",
                if manager.redirect_output() { "on" } else { "off" }
            )),
        },
        Some("list") => print_list(manager),
        Some("watch") => with_id(&mut args, |id, _| match manager.entry(id) {
            Some(entry) => {
                say(&format!("Entry {} status: {}", id, entry.status));
                for line in entry.output.lines() {
                    say(line);
                }
            }
            None => say(&format!("Entry {} not found", id)),
        }),
        Some("clear") => match args.next() {
            Some("finished") => say(&format!("Removed {} finished entries.", manager.clear_finished())),
            Some("all") => match manager.clear_all() {
                Ok(count) => say(&format!("Removed {} entries.", count)),
                Err(e) => say(&format!("Cannot clear list: {}.", e)),
            },
            _ => say("Use `clear finished` or `clear all`."),
        },
        Some("save") => match manager.save() {
            Ok(()) => say("Queue saved."),
            Err(e) => say(&format!("Failed to save queue: {}", e)),
        },
        Some("help") => print_help(),
        Some("exit") => {
            if manager.entries().iter().any(|entry| entry.working) {
                say("Stopping running programs...");
                manager.force_stop();
                if !manager.wait_until_idle(EXIT_STOP_TIMEOUT) {
                    error!("Programs still running after {:?}; saving anyway.", EXIT_STOP_TIMEOUT);
                }
            }
            if let Err(e) = manager.save() {
                error!("Failed to save queue on exit: {}", e);
            }
            say("Exiting the program...");
            return false;
        }
        Some(cmd) => say(&format!("Unknown command: {}. Please try again.", cmd)),
        None => {}
    }
    true
}

fn with_id<'a>(
    args: &mut SplitWhitespace<'a>,
    action: impl FnOnce(EntryId, &mut SplitWhitespace<'a>),
) {
    match args.next() {
        Some(raw) => match parse_id(raw) {
            Some(id) => action(id, args),
            None => say("Invalid entry ID format."),
        },
        None => say("Entry ID must be specified."),
    }
}

fn parse_id(raw: &str) -> Option<EntryId> {
    raw.parse::<u64>().ok().map(EntryId)
}

fn resolve_path(last_path: Option<&Path>, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    match last_path {
        Some(base) if path.is_relative() && !path.exists() => base.join(path),
        _ => std::path::absolute(&path).unwrap_or(path),
    }
}

fn print_list(manager: &QueueManager) {
    let entries = manager.entries();
    if entries.is_empty() {
        say("Queue is empty");
        return;
    }
    let current = manager.current_entry();
    say(&format!(
        "\tQueue ({}):",
        if manager.is_working() { "running" } else { "idle" }
    ));
    say(&format!("{}\t {} \t {} \t {}", "ID", "State", "Status", "Program"));
    say(&"-".repeat(60));
    for entry in entries {
        let state = if entry.working {
            "working"
        } else if entry.error {
            "failed"
        } else if entry.finished {
            "finished"
        } else {
            "queued"
        };
        let marker = if current == Some(entry.id) { "*" } else { "" };
        say(&format!(
            "{}{}\t {} \t {} \t {}",
            entry.id, marker, state, entry.status, entry.name
        ));
    }
}

fn print_help() {
    for line in [
        "add <path>...        queue programs",
        "remove <id>          remove an entry",
        "run                  work through the queue",
        "start <id>           run a single entry",
        "stop [<id>]          kill the queue or one entry",
        "reset <id>           queue an entry again",
        "finish <id>          mark an entry finished",
        "rename <id> <name>   change a program path",
        "move <id> <index>    reorder the queue",
        "redirect [on|off]    capture program output",
        "list                 show the queue",
        "watch <id>           show an entry's output",
        "clear finished|all   empty the queue",
        "save                 write the queue to disk",
        "exit                 stop, save and quit",
    ] {
        say(line);
    }
}

/// Prints finish notifications while the prompt is open.
fn spawn_notifier(manager: &QueueManager) {
    let events = manager.subscribe();
    let manager = manager.clone();
    thread::spawn(move || {
        for event in events {
            if let QueueEvent::EntryFinished(id) = event {
                if let Some(entry) = manager.entry(id) {
                    say(&format!("Entry {} finished: {}", id, entry.status));
                }
            }
        }
    });
}

fn say(line: &str) {
    println!("\r{}", line);
}

fn redraw(input: &str) -> io::Result<()> {
    clear_line()?;
    print!(">>> {}", input);
    io::stdout().flush()
}

fn clear_line() -> io::Result<()> {
    execute!(
        io::stdout(),
        cursor::MoveToColumn(0),
        terminal::Clear(terminal::ClearType::CurrentLine)
    )
}
