use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roundtable::client::{NodeClient, RequestError, default_socket_path};
use roundtable::model::{ChatEntry, LogChange, RosterEntry};
use roundtable::protocol::{Event, LogLevel, Request, Response};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "roundtable", about = "roundtable CLI")]
struct Cli {
    /// Path to the node daemon's control socket.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the node daemon.
    Up {
        /// Run in the foreground (default: background).
        #[arg(long)]
        foreground: bool,
        /// State directory.
        #[arg(long)]
        state_dir: Option<PathBuf>,
        /// Rendezvous service address.
        #[arg(long)]
        rendezvous: Option<String>,
        /// Directory of agent endpoint sockets.
        #[arg(long)]
        endpoints_dir: Option<PathBuf>,
        /// Keep everything in memory.
        #[arg(long)]
        ephemeral: bool,
    },
    /// Stop the node daemon.
    Down,
    /// Show the session status.
    Status,
    /// Host a room.
    Host {
        /// Room id to request (default: assigned by the rendezvous service).
        #[arg(long)]
        room: Option<String>,
    },
    /// Join a room as a guest.
    Join {
        /// Room id.
        room: String,
    },
    /// Leave the current session.
    Leave,
    /// Send a prompt to the roundtable.
    Say {
        /// Prompt text.
        text: String,
    },
    /// Ask every agent to introduce itself.
    RollCall,
    /// Collect the latest reply from every enabled agent.
    Harvest,
    /// Print the chat log.
    History,
    /// List session participants.
    Roster,
    /// Replace the text of a message (local only).
    Edit {
        /// Message index.
        index: usize,
        /// New text.
        text: String,
    },
    /// Delete a message for everyone.
    Delete {
        /// Message index.
        index: usize,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
    /// Clear the chat log for everyone.
    Clear {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
    /// Set your display name.
    Name {
        /// Display name (empty to reset).
        username: String,
    },
    /// Rescan agent endpoints.
    Scan,
    /// List bound agents.
    Agents,
    /// Enable an agent.
    Enable {
        /// Agent key or name.
        agent: String,
    },
    /// Disable an agent.
    Disable {
        /// Agent key or name.
        agent: String,
    },
    /// Set context injection options.
    Context {
        /// Prepend earlier messages to each prompt.
        #[arg(long)]
        include_history: Option<bool>,
        /// Leave an agent's own replies out of its context.
        #[arg(long)]
        smart_context: Option<bool>,
    },
    /// Follow log, roster and status events.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket_path = cli.socket.unwrap_or_else(default_socket_path);

    match cli.command {
        Command::Up {
            foreground,
            state_dir,
            rendezvous,
            endpoints_dir,
            ephemeral,
        } => cmd_up(
            &socket_path,
            foreground,
            state_dir,
            rendezvous,
            endpoints_dir,
            ephemeral,
        ),
        Command::Down => {
            let mut client = connect(&socket_path).await?;
            client.request(Request::Shutdown).await?;
            println!("Node shutting down.");
            Ok(())
        }
        Command::Status => simple(&socket_path, Request::Status).await,
        Command::Host { room } => {
            eprintln!("Registering room...");
            simple(&socket_path, Request::StartHost { room_id: room }).await
        }
        Command::Join { room } => {
            eprintln!("Joining {room}...");
            simple(&socket_path, Request::JoinRoom { room_id: room }).await
        }
        Command::Leave => simple(&socket_path, Request::LeaveSession).await,
        Command::Say { text } => simple(&socket_path, Request::SendPrompt { text }).await,
        Command::RollCall => simple(&socket_path, Request::RollCall).await,
        Command::Harvest => simple(&socket_path, Request::Harvest).await,
        Command::History => {
            let mut client = connect(&socket_path).await?;
            let data = client.request(Request::History).await?;
            let entries: Vec<ChatEntry> =
                serde_json::from_value(data.unwrap_or_default()).context("bad history reply")?;
            for (index, entry) in entries.iter().enumerate() {
                println!("{}", format_entry(index, entry));
            }
            Ok(())
        }
        Command::Roster => {
            let mut client = connect(&socket_path).await?;
            let data = client.request(Request::Roster).await?;
            let roster: Vec<RosterEntry> =
                serde_json::from_value(data.unwrap_or_default()).context("bad roster reply")?;
            for entry in &roster {
                println!("{}", format_roster_entry(entry));
            }
            Ok(())
        }
        Command::Edit { index, text } => {
            simple(&socket_path, Request::EditMessage { index, text }).await
        }
        Command::Delete { index, yes } => {
            if !yes && !confirm(&format!("Delete message {index} for everyone?"))? {
                println!("Cancelled.");
                return Ok(());
            }
            let mut client = connect(&socket_path).await?;
            client
                .request(Request::DeleteMessage {
                    index,
                    confirm: true,
                })
                .await?;
            println!("Deleted.");
            Ok(())
        }
        Command::Clear { yes } => {
            if !yes && !confirm("Clear the chat log for everyone?")? {
                println!("Cancelled.");
                return Ok(());
            }
            let mut client = connect(&socket_path).await?;
            client
                .request(Request::ClearSession { confirm: true })
                .await?;
            println!("Cleared.");
            Ok(())
        }
        Command::Name { username } => {
            simple(&socket_path, Request::SetUsername { username }).await
        }
        Command::Scan => simple(&socket_path, Request::ScanAgents).await,
        Command::Agents => simple(&socket_path, Request::ListAgents).await,
        Command::Enable { agent } => {
            simple(&socket_path, Request::SetAgentEnabled {
                agent,
                enabled: true,
            })
            .await
        }
        Command::Disable { agent } => {
            simple(&socket_path, Request::SetAgentEnabled {
                agent,
                enabled: false,
            })
            .await
        }
        Command::Context {
            include_history,
            smart_context,
        } => {
            simple(&socket_path, Request::SetContextOptions {
                include_history,
                smart_context,
            })
            .await
        }
        Command::Watch => cmd_watch(&socket_path).await,
    }
}

async fn connect(socket_path: &Path) -> Result<NodeClient> {
    NodeClient::connect(socket_path).await.with_context(|| {
        format!(
            "failed to connect to node at {}. Is the daemon running? Try: roundtable up",
            socket_path.display()
        )
    })
}

/// Send one request and print its data.
async fn simple(socket_path: &Path, req: Request) -> Result<()> {
    let mut client = connect(socket_path).await?;
    match client.request(req).await {
        Ok(data) => {
            print_json(&data);
            Ok(())
        }
        Err(e) => match e.downcast_ref::<RequestError>() {
            Some(err) => anyhow::bail!("{} ({})", err.message, err.code),
            None => Err(e),
        },
    }
}

async fn cmd_watch(socket_path: &Path) -> Result<()> {
    let client = connect(socket_path).await?;
    let (_writer, mut reader) = client.into_split();
    eprintln!("Watching events. Ctrl-C to stop.");
    loop {
        tokio::select! {
            next = reader.next() => {
                let Some(resp) = next else {
                    eprintln!("Node disconnected.");
                    return Ok(());
                };
                if let Response::Event { event } = resp? {
                    println!("{}", format_event(&event));
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn cmd_up(
    socket_path: &Path,
    foreground: bool,
    state_dir: Option<PathBuf>,
    rendezvous: Option<String>,
    endpoints_dir: Option<PathBuf>,
    ephemeral: bool,
) -> Result<()> {
    let node_bin = find_node_binary();

    let mut cmd = std::process::Command::new(&node_bin);
    cmd.arg("--socket").arg(socket_path);
    if let Some(ref dir) = state_dir {
        cmd.arg("--state-dir").arg(dir);
    }
    if let Some(ref addr) = rendezvous {
        cmd.arg("--rendezvous").arg(addr);
    }
    if let Some(ref dir) = endpoints_dir {
        cmd.arg("--endpoints-dir").arg(dir);
    }
    if ephemeral {
        cmd.arg("--ephemeral");
    }

    if foreground {
        let status = cmd
            .status()
            .with_context(|| format!("failed to run {}", node_bin.display()))?;
        if !status.success() {
            anyhow::bail!("node exited with status {status}");
        }
    } else {
        cmd.stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", node_bin.display()))?;
        println!("Node daemon started (pid {}).", child.id());
    }
    Ok(())
}

fn find_node_binary() -> PathBuf {
    // Check next to this binary
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let candidate = dir.join("roundtable-node");
        if candidate.exists() {
            return candidate;
        }
    }
    // Fall back to PATH
    PathBuf::from("roundtable-node")
}

/// Ask a yes/no question on stdin. Anything but `y`/`yes` is a no.
fn confirm(question: &str) -> Result<bool> {
    eprint!("{question} [y/N] ");
    std::io::stderr().flush().ok();
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn format_entry(index: usize, entry: &ChatEntry) -> String {
    format!("[{index}] {}: {}", entry.sender, entry.text)
}

fn format_roster_entry(entry: &RosterEntry) -> String {
    let role = if entry.is_host { " (host)" } else { "" };
    let agents: Vec<&str> = entry.bound_agents.iter().map(String::as_str).collect();
    if agents.is_empty() {
        format!("{}{role}", entry.display_name)
    } else {
        format!("{}{role}: {}", entry.display_name, agents.join(", "))
    }
}

fn format_event(event: &Event) -> String {
    match event {
        Event::Log { change } => match change {
            LogChange::Appended { index, entry } => format_entry(*index, entry),
            LogChange::Edited { index, entry } => {
                format!("{} (edited)", format_entry(*index, entry))
            }
            LogChange::Deleted { index, .. } => format!("-- message {index} deleted"),
            LogChange::Cleared => "-- log cleared".to_string(),
            LogChange::Replaced { len } => format!("-- log synced ({len} messages)"),
        },
        Event::RosterChanged { roster } => {
            let names: Vec<String> = roster.iter().map(format_roster_entry).collect();
            format!("-- roster: {}", names.join(" | "))
        }
        Event::StatusChanged { status } => {
            let room = status.room_id.as_deref().unwrap_or("-");
            format!("-- status: {} (room {room}, {} links)", status.status, status.links)
        }
        Event::SystemLog { level, message } => {
            let tag = match level {
                LogLevel::Info => "info",
                LogLevel::Success => "ok",
                LogLevel::Warning => "warn",
                LogLevel::Error => "error",
            };
            format!("[{tag}] {message}")
        }
    }
}

fn print_json(data: &Option<serde_json::Value>) {
    if let Some(v) = data
        && let Ok(text) = serde_json::to_string_pretty(v)
    {
        println!("{text}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use roundtable::model::EntryKind;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_context_flags() {
        let cli = Cli::try_parse_from(["roundtable", "context", "--smart-context", "false"]).unwrap();
        match cli.command {
            Command::Context {
                include_history,
                smart_context,
            } => {
                assert_eq!(include_history, None);
                assert_eq!(smart_context, Some(false));
            }
            _ => panic!("expected context command"),
        }
    }

    #[test]
    fn confirmation_answers() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("nope"));
    }

    #[test]
    fn formats_entries_and_roster() {
        let entry = ChatEntry::new("Claude", "hi", EntryKind::Agent("claude".to_string()));
        assert_eq!(format_entry(3, &entry), "[3] Claude: hi");

        let roster = RosterEntry {
            peer_id: "p".to_string(),
            display_name: "Ada".to_string(),
            bound_agents: ["Claude".to_string(), "Gemini".to_string()].into(),
            is_host: true,
        };
        assert_eq!(format_roster_entry(&roster), "Ada (host): Claude, Gemini");
    }
}
