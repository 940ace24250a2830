use std::io;
use std::path::PathBuf;

use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{error::ReadlineError, Config, Context, Editor, Helper};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::control::{Status, SupervisorHandle};
use crate::protocol;

const COMMANDS: [&str; 5] = ["status", "send ", "restart", "stop", "exit"];



/*
    @@@
    @CmdCompleter;
    . Drops CmdCompleter into 'rl.set_helper(Some(...))' and get instant, prefix-based command completion.
    . Plugs into rustyline to provide simple tab-completion based on a fixed list of command names.
*/
struct CmdCompleter {
    commands: Vec<String>,
}
impl Helper for CmdCompleter {}
impl Hinter for CmdCompleter {
    type Hint = String;
}
impl Highlighter for CmdCompleter {}
impl Validator for CmdCompleter {}
impl Completer for CmdCompleter {
    type Candidate = Pair;
    fn complete(&self, line: &str, _pos: usize, _ctx: &Context<'_>) -> Result<(usize, Vec<Pair>), ReadlineError> {
        let matches = self
            .commands
            .iter()
            .filter(|cmd| cmd.starts_with(line))
            .map(|cmd| Pair {
                display: cmd.trim_end().to_string(),
                replacement: cmd.clone(),
            })
            .collect();
        Ok((0, matches))
    }
}

/// One line typed at the console.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Status,
    /// Payload for the child: JSON if it parses, otherwise the raw text.
    Send(Value),
    Restart,
    /// Forced shutdown of the supervisor.
    Stop,
    /// Leaves the console; the supervisor keeps running.
    Exit,
    Empty,
    Unknown(String),
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Self {
        let input = line.trim();
        match input {
            "" => ConsoleCommand::Empty,
            "status" => ConsoleCommand::Status,
            "restart" => ConsoleCommand::Restart,
            "stop" => ConsoleCommand::Stop,
            "exit" => ConsoleCommand::Exit,
            cmd if cmd.starts_with("send ") => {
                ConsoleCommand::Send(protocol::decode_line(cmd["send ".len()..].trim()))
            }
            other => ConsoleCommand::Unknown(other.to_string()),
        }
    }
}

fn print_status(status: &Status) {
    let pid = status.pid.map_or_else(|| String::from("-"), |pid| pid.to_string());
    let port = status.port.map_or_else(|| String::from("-"), |port| port.to_string());
    let window = status
        .window_opened_at
        .map_or_else(|| String::from("-"), |at| at.format("%Y-%m-%d %H:%M:%S").to_string());
    println!(
        "pid {pid}  port {port}  starts {}  attempts {}  wait {:.3}s  window since {window}  monitoring {}  forcekill {}",
        status.starts,
        status.attempts,
        status.wait.as_secs_f64(),
        status.monitoring,
        status.forcekill,
    );
}



/*
    @@@
    @run_shell();
    . Runs the rustyline prompt on a blocking thread so the supervisor task keeps running.
    . Maps status, send <text>, restart, stop and exit onto the SupervisorHandle.
    . Returns once the operator exits, stops the supervisor, or the supervisor ends on its own.
*/
pub async fn run_shell(handle: SupervisorHandle, history: Option<PathBuf>) -> rustyline::Result<()> {
    let runtime = Handle::current();
    tokio::task::spawn_blocking(move || console_loop(handle, history, runtime))
        .await
        .map_err(|e| ReadlineError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

fn console_loop(handle: SupervisorHandle, history: Option<PathBuf>, runtime: Handle) -> rustyline::Result<()> {
    let config = Config::builder().build();
    let mut rl = Editor::with_config(config)?;
    rl.set_helper(Some(CmdCompleter {
        commands: COMMANDS.into_iter().map(String::from).collect(),
    }));
    if let Some(path) = &history {
        let _ = rl.load_history(path);
    }

    loop {
        if handle.termination().is_some() {
            break;
        }
        let line = match rl.readline("supervisor> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        };
        rl.add_history_entry(line.trim())?;

        match ConsoleCommand::parse(&line) {
            ConsoleCommand::Empty => {}
            ConsoleCommand::Status => match runtime.block_on(handle.status()) {
                Ok(status) => print_status(&status),
                Err(e) => println!("{e}"),
            },
            ConsoleCommand::Send(payload) => {
                if let Err(e) = runtime.block_on(handle.send_message(&payload)) {
                    println!("{e}");
                }
            }
            ConsoleCommand::Restart => {
                if let Err(e) = runtime.block_on(handle.restart()) {
                    println!("{e}");
                }
            }
            ConsoleCommand::Stop => {
                if let Err(e) = handle.kill_child_process() {
                    warn!(error = %e, "stop from console failed");
                }
                break;
            }
            ConsoleCommand::Exit => break,
            ConsoleCommand::Unknown(other) => println!("Unknown command: {}", other),
        }
    }

    if let Some(path) = &history {
        rl.save_history(path)?;
        debug!(history = %path.display(), "console history saved");
    }
    Ok(())
}
