mod headless;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use pairchat_core::chat::Origin;
use pairchat_core::{
    Capabilities, ChannelAdapter, ConnectionState, PairingState, SessionCoordinator, SessionEvent,
    SessionEventListener, SessionHandle, SettingsStore, UserIntent,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::headless::{HeadlessConnector, HeadlessDevices, HeadlessPlayer};

const HELP: &str = "\
commands:
  /next          find a new partner
  /call          start a call
  /hangup        end the call
  /share <link>  watch a video together
  /play, /pause  shared playback
  /quit          leave
anything else is sent as a chat message";

#[derive(Parser, Debug)]
#[command(name = "pairchat")]
#[command(about = "Talk to a random stranger from your terminal")]
struct Args {
    /// Relay WebSocket URL (ws:// or wss://)
    #[arg(short, long)]
    relay: Option<String>,

    /// Name shown to your partners
    #[arg(short, long)]
    name: Option<String>,

    /// Directory holding settings.json
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Store --relay and --name for next time
    #[arg(long)]
    save: bool,
}

#[derive(Debug, PartialEq)]
enum Command {
    Intent(UserIntent),
    Help,
    Quit,
}

fn parse_line(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Intent(UserIntent::SendChat(line.to_string())));
    };
    let (cmd, arg) = rest
        .split_once(char::is_whitespace)
        .map(|(c, a)| (c, a.trim()))
        .unwrap_or((rest, ""));

    let command = match cmd {
        "next" => Command::Intent(UserIntent::FindNewPartner),
        "call" => Command::Intent(UserIntent::StartCall),
        "hangup" => Command::Intent(UserIntent::EndCall),
        "share" if !arg.is_empty() => Command::Intent(UserIntent::ShareMedia(arg.to_string())),
        "play" => Command::Intent(UserIntent::SetPlaying(true)),
        "pause" => Command::Intent(UserIntent::SetPlaying(false)),
        "quit" | "exit" => Command::Quit,
        _ => Command::Help,
    };
    Some(command)
}

struct ConsolePrinter;

impl SessionEventListener for ConsolePrinter {
    fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::ConnectionStateChanged(ConnectionState::Reconnecting { attempt }) => {
                println!("* reconnecting (attempt {attempt})");
            }
            SessionEvent::ConnectionStateChanged(ConnectionState::Connected) => {
                println!("* connected to relay");
            }
            SessionEvent::PairingChanged(PairingState::Waiting) => {
                println!("* looking for someone to talk to...");
            }
            SessionEvent::PairingChanged(PairingState::Paired(partner)) => {
                println!("* you are now talking to {}. Say hi!", partner.label);
            }
            SessionEvent::ChatMessageAdded(msg) if msg.origin == Origin::Peer => {
                println!("{}: {}", msg.sender_name, msg.text);
            }
            SessionEvent::CallStarted { role } => println!("* call starting ({role:?})"),
            SessionEvent::CallEnded => println!("* call ended"),
            SessionEvent::PlaybackChanged(state) if state.media_id.is_some() => {
                println!("* playback {}", if state.playing { "playing" } else { "paused" });
            }
            SessionEvent::CapabilityError(msg) => println!("! {msg}"),
            SessionEvent::IntentRejected(msg) => println!("! {msg}"),
            SessionEvent::Status(msg) => println!("* {msg}"),
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pairchat_core=info,pairchat_cli=info".into()),
        )
        .init();

    let args = Args::parse();

    let data_dir = args
        .data_dir
        .or_else(|| dirs::config_dir().map(|d| d.join("pairchat")))
        .ok_or_else(|| anyhow!("no config directory found, pass --data-dir"))?;
    let store = SettingsStore::new(&data_dir);

    let mut settings = store.get();
    if let Some(relay) = args.relay {
        settings.relay_url = relay;
    }
    if let Some(name) = args.name {
        settings.display_name = Some(name);
    }
    if args.save {
        store
            .set_relay_url(&settings.relay_url)
            .context("refusing to save relay url")?;
        store.set_display_name(settings.display_name.clone());
    }

    let (adapter, channel_rx) =
        ChannelAdapter::start(settings.channel_config()).context("cannot start relay channel")?;

    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    let (player_tx, player_rx) = mpsc::unbounded_channel();
    let (intent_tx, intent_rx) = mpsc::unbounded_channel();

    let coordinator = SessionCoordinator::new(
        settings.session_options(),
        Capabilities {
            devices: Box::new(HeadlessDevices),
            connector: Box::new(HeadlessConnector),
            player: Box::new(HeadlessPlayer::new(player_tx)),
        },
        Box::new(adapter.handle()),
        peer_tx,
    );
    coordinator.add_listener(Arc::new(ConsolePrinter));
    let handle = SessionHandle::new(intent_tx, coordinator.watch());
    let mut session = tokio::spawn(coordinator.run(channel_rx, peer_rx, player_rx, intent_rx));

    tracing::info!(relay = %settings.relay_url, "pairchat started");
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            _ = &mut session => {
                tracing::info!("session ended");
                adapter.shutdown().await;
                return Ok(());
            }
        };
        let Some(line) = line else { break };

        match parse_line(&line) {
            None => {}
            Some(Command::Help) => println!("{HELP}"),
            Some(Command::Quit) => break,
            Some(Command::Intent(intent)) => {
                if handle.submit(intent).is_err() {
                    break;
                }
            }
        }
    }

    let _ = handle.shutdown();
    if let Err(e) = session.await {
        tracing::warn!("session task failed: {e}");
    }
    adapter.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_chat() {
        assert_eq!(
            parse_line("  hello there "),
            Some(Command::Intent(UserIntent::SendChat("hello there".into())))
        );
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn slash_commands_map_to_intents() {
        assert_eq!(
            parse_line("/next"),
            Some(Command::Intent(UserIntent::FindNewPartner))
        );
        assert_eq!(
            parse_line("/share  https://youtu.be/dQw4w9WgXcQ "),
            Some(Command::Intent(UserIntent::ShareMedia(
                "https://youtu.be/dQw4w9WgXcQ".into()
            )))
        );
        assert_eq!(
            parse_line("/pause"),
            Some(Command::Intent(UserIntent::SetPlaying(false)))
        );
        assert_eq!(parse_line("/quit"), Some(Command::Quit));
    }

    #[test]
    fn unknown_or_incomplete_commands_show_help() {
        assert_eq!(parse_line("/share"), Some(Command::Help));
        assert_eq!(parse_line("/dance"), Some(Command::Help));
    }
}
