//! Line-oriented operator console
//!
//! Each input line is parsed into a [`ConsoleCommand`] and executed against a
//! [`Console`]. Status and error strings are printed as returned.

use std::str::FromStr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::console::Console;
use crate::error::ConsoleError;
use crate::scheduler::{ConfigKind, JobSubmissionForm, NodeRequestForm, SchedulerCommand};

pub const PROMPT: &str = "hpc> ";

pub const HELP: &str = "\
Commands:
  run <command>                      run a command and print its output
  send <command>                     send a command to the interactive shell
  jobs                               list your queued jobs (squeue)
  history                            list your past jobs (sacct)
  cancel <job id>                    cancel a job (scancel)
  alloc cpu <hours> <nodes> <mem> <cores>
  alloc gpu <hours> <nodes> <mem> <gpu type> <gpu count>
                                     request an allocation (salloc)
  configs [cpu|gpu]                  list job submission configs
  submit <cpu|gpu> <config> <script> <output> <hours> <mem> <job name>
                                     submit a batch job through a config
  vnc                                list your VNC servers
  tunnel <node> <local port>         forward localhost:<port> to <node>:22
  untunnel <node>                    close the tunnel to <node>
  tunnels                            list active tunnels
  pwd                                remote working directory at login
  help                               show this help
  logout | quit                      close all tunnels and disconnect";

const SUBMIT_USAGE: &str = "submit <cpu|gpu> <config> <script> <output> <hours> <mem> <job name>";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown command '{0}'. Type 'help' for a list of commands.")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Run(String),
    Send(String),
    Jobs,
    History,
    Cancel(String),
    Allocate { gpu: bool, args: Vec<String> },
    Configs(ConfigKind),
    Submit { kind: ConfigKind, args: Vec<String> },
    Vnc,
    Tunnel { node: String, port: u16 },
    Untunnel(String),
    Tunnels,
    Pwd,
    Help,
    Logout,
}

impl FromStr for ConsoleCommand {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        let command = match word.to_ascii_lowercase().as_str() {
            "run" if !rest.is_empty() => Self::Run(rest.to_string()),
            "run" => return Err(ParseError::Usage("run <command>")),
            "send" if !rest.is_empty() => Self::Send(rest.to_string()),
            "send" => return Err(ParseError::Usage("send <command>")),
            "jobs" => Self::Jobs,
            "history" => Self::History,
            "cancel" => match args.as_slice() {
                [id] => Self::Cancel(id.to_string()),
                _ => return Err(ParseError::Usage("cancel <job id>")),
            },
            "alloc" => match args.split_first() {
                Some((&"cpu", fields)) => Self::Allocate {
                    gpu: false,
                    args: fields.iter().map(|s| s.to_string()).collect(),
                },
                Some((&"gpu", fields)) => Self::Allocate {
                    gpu: true,
                    args: fields.iter().map(|s| s.to_string()).collect(),
                },
                _ => return Err(ParseError::Usage("alloc cpu|gpu <hours> <nodes> <mem> ...")),
            },
            "configs" => match args.as_slice() {
                [] => Self::Configs(ConfigKind::default()),
                [kind] => Self::Configs(
                    kind.parse()
                        .map_err(|_| ParseError::Usage("configs [cpu|gpu]"))?,
                ),
                _ => return Err(ParseError::Usage("configs [cpu|gpu]")),
            },
            "submit" => match args.split_first() {
                Some((kind, fields)) => Self::Submit {
                    kind: kind.parse().map_err(|_| ParseError::Usage(SUBMIT_USAGE))?,
                    args: fields.iter().map(|s| s.to_string()).collect(),
                },
                None => return Err(ParseError::Usage(SUBMIT_USAGE)),
            },
            "vnc" => Self::Vnc,
            "tunnel" => match args.as_slice() {
                [node, port] => Self::Tunnel {
                    node: node.to_string(),
                    port: port
                        .parse()
                        .map_err(|_| ParseError::Usage("tunnel <node> <local port>"))?,
                },
                _ => return Err(ParseError::Usage("tunnel <node> <local port>")),
            },
            "untunnel" => match args.as_slice() {
                [node] => Self::Untunnel(node.to_string()),
                _ => return Err(ParseError::Usage("untunnel <node>")),
            },
            "tunnels" => Self::Tunnels,
            "pwd" => Self::Pwd,
            "help" | "?" => Self::Help,
            "logout" | "quit" | "exit" => Self::Logout,
            other => return Err(ParseError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

/// Positional `alloc` fields into the request form. Missing ones stay empty.
fn allocation_form(gpu: bool, args: &[String]) -> NodeRequestForm {
    let field = |i: usize| args.get(i).cloned();
    NodeRequestForm {
        gpu,
        hours: field(0),
        nodes: field(1),
        memory: field(2),
        cpu_cores: if gpu { None } else { field(3) },
        gpu_type: if gpu { field(3) } else { None },
        gpu_count: if gpu { field(4) } else { None },
    }
}

/// Positional `submit` fields into the submission form. Missing ones stay empty.
fn submission_form(kind: ConfigKind, args: &[String], email: Option<&str>) -> JobSubmissionForm {
    let field = |i: usize| args.get(i).cloned();
    JobSubmissionForm {
        kind,
        config: field(0),
        script: field(1),
        output: field(2),
        hours: field(3),
        memory: field(4),
        job_name: field(5),
        email: email.map(str::to_string),
    }
}

/// What the loop should do after a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Continue(String),
    Exit(String),
}

pub async fn execute(console: &Console, command: ConsoleCommand) -> Result<Outcome, ConsoleError> {
    let text = match command {
        ConsoleCommand::Run(cmd) => console.connection().run_command(&cmd).await?,
        ConsoleCommand::Send(cmd) => {
            console.connection().run_async_command(&cmd).await?;
            "Sent.".to_string()
        }
        ConsoleCommand::Jobs => {
            let user = console.current_user()?;
            console.scheduler(&SchedulerCommand::Queue { user }).await?
        }
        ConsoleCommand::History => {
            let user = console.current_user()?;
            console.scheduler(&SchedulerCommand::History { user }).await?
        }
        ConsoleCommand::Cancel(id) => {
            let command = SchedulerCommand::cancel(&id)?;
            let output = console.scheduler(&command).await?;
            if output.is_empty() {
                format!("Cancelled job {}.", id)
            } else {
                output
            }
        }
        ConsoleCommand::Allocate { gpu, args } => {
            let request = allocation_form(gpu, &args).validate()?;
            console.scheduler(&SchedulerCommand::Allocate(request)).await?
        }
        ConsoleCommand::Configs(kind) => {
            let configs = console.scheduler(&SchedulerCommand::ListConfigs { kind }).await?;
            if configs.is_empty() {
                format!("No {} configs found.", kind.as_str())
            } else {
                configs
            }
        }
        ConsoleCommand::Submit { kind, args } => {
            let job = submission_form(kind, &args, console.email()).validate()?;
            console.scheduler(&SchedulerCommand::Submit(job)).await?
        }
        ConsoleCommand::Vnc => {
            let servers = console.scheduler(&SchedulerCommand::VncList).await?;
            if servers.is_empty() {
                "No VNC servers found.".to_string()
            } else {
                servers
            }
        }
        ConsoleCommand::Tunnel { node, port } => console.tunnels().setup_tunnel(&node, port).await?,
        ConsoleCommand::Untunnel(node) => console.tunnels().close_tunnel(&node).await?,
        ConsoleCommand::Tunnels => format_tunnels(console).await,
        ConsoleCommand::Pwd => console
            .connection()
            .remote_working_dir()
            .unwrap_or_else(|| "Remote working directory unknown.".to_string()),
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Logout => return Ok(Outcome::Exit(console.logout().await)),
    };
    Ok(Outcome::Continue(text))
}

async fn format_tunnels(console: &Console) -> String {
    let tunnels = console.tunnels().tunnels().await;
    if tunnels.is_empty() {
        return "No active tunnels.".to_string();
    }

    let mut out = format!(
        "{:<20} {:<16} {:<8} {:>8} {:>8}  {}",
        "NODE", "LOCAL", "STATE", "ACTIVE", "TOTAL", "OPENED"
    );
    for t in tunnels {
        out.push('\n');
        out.push_str(&format!(
            "{:<20} {:<16} {:<8} {:>8} {:>8}  {}",
            t.node,
            format!("localhost:{}", t.local_port),
            if t.running { "running" } else { "stopped" },
            t.active_channels,
            t.total_connections,
            t.opened_at.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    out
}

/// Read commands from `input` until logout or end of input
pub async fn run<R, W>(console: &Console, input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    loop {
        output.write_all(PROMPT.as_bytes()).await?;
        output.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match line.parse::<ConsoleCommand>() {
            Ok(command) => {
                debug!("REPL command: {:?}", command);
                match execute(console, command).await {
                    Ok(Outcome::Continue(text)) => text,
                    Ok(Outcome::Exit(text)) => {
                        output.write_all(format!("{}\n", text).as_bytes()).await?;
                        output.flush().await?;
                        return Ok(());
                    }
                    Err(e) => e.to_string(),
                }
            }
            Err(e) => e.to_string(),
        };

        if !reply.is_empty() {
            output.write_all(reply.as_bytes()).await?;
            output.write_all(b"\n").await?;
        }
    }
    output.write_all(b"\n").await?;
    output.flush().await
}
