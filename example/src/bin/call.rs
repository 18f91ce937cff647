use anyhow::{bail, Result};
use clap::Parser;
use peer_call::media::{CpalDevices, MediaDevices};
use peer_call::signaling::relay::Relay;
use peer_call::signaling::rtc::RtcTransport;
use peer_call::status::{self, format_elapsed, media_indicator};
use peer_call::{
    CallState, ChannelStatus, Client, ClientArgs, ClientEvent, Config, MediaKind, MemoryStorage,
    Notice, NullPreview, VirtualDevices,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

/// Runs two clients in one process, connected through an in-process relay,
/// and places a call from one to the other.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// identity of the calling client
    #[arg(long, default_value = "alice@example.com")]
    caller: String,
    /// identity of the client that answers
    #[arg(long, default_value = "bob@example.com")]
    callee: String,
    /// place a voice call instead of a video call
    #[arg(long)]
    audio_only: bool,
    /// seconds to stay in the call before hanging up
    #[arg(long, default_value_t = 5)]
    seconds: u64,
    /// probe the host microphone for the caller instead of using virtual devices
    #[arg(long)]
    microphone: bool,
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} [{}] {} - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                chrono::Local::now().format("%H:%M:%S.%3f"),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Debug)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    // the demo uses throwaway storage
    config.auto_login = false;

    let relay = Relay::new();
    let caller_devices: Arc<dyn MediaDevices> = if cli.microphone {
        Arc::new(CpalDevices)
    } else {
        Arc::new(VirtualDevices::new())
    };
    let (caller, mut caller_events) = start_client(&relay, &config, caller_devices)?;
    let (callee, callee_events) = start_client(&relay, &config, Arc::new(VirtualDevices::new()))?;

    callee.login(&cli.callee).await?;
    let answering = tokio::spawn(answer_calls(callee.clone(), callee_events));
    caller.login(&cli.caller).await?;
    wait_until_connected(&mut caller_events).await?;

    let kind = if cli.audio_only {
        MediaKind::Audio
    } else {
        MediaKind::Video
    };
    caller.call(&cli.callee, kind).await?;

    tokio::select! {
        r = run_call(&caller, &mut caller_events, Duration::from_secs(cli.seconds)) => {
            if let Err(e) = r {
                println!("call failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!();
            caller.hang_up().await?;
        }
    }

    caller.shutdown().await?;
    callee.shutdown().await?;
    answering.abort();
    Ok(())
}

fn start_client(
    relay: &Relay,
    config: &Config,
    devices: Arc<dyn MediaDevices>,
) -> Result<(Client, mpsc::UnboundedReceiver<ClientEvent>)> {
    let transport = RtcTransport::new(relay.clone(), config.ice_servers.clone())?;
    Ok(Client::start(ClientArgs {
        config: config.clone(),
        transport: Arc::new(transport),
        devices,
        preview: Box::new(NullPreview),
        storage: Box::new(MemoryStorage::new()),
    }))
}

async fn wait_until_connected(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Result<()> {
    while let Some(event) = events.recv().await {
        print_event("caller", &event);
        match event {
            ClientEvent::Channel(ChannelStatus::Connected) => return Ok(()),
            ClientEvent::Notice(Notice::Signal(e)) => bail!("failed to connect: {}", e),
            _ => {}
        }
    }
    bail!("caller stopped before connecting")
}

/// follows the caller until the call is over, hanging up after `duration`
async fn run_call(
    caller: &Client,
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    duration: Duration,
) -> Result<()> {
    let mut hang_up_at: Option<Instant> = None;
    let mut in_call = false;
    loop {
        let at = hang_up_at;
        let deadline = async move {
            match at {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Some(event) => event,
                    None => bail!("caller stopped"),
                };
                print_event("caller", &event);
                match &event {
                    ClientEvent::StateChanged(snapshot) => match snapshot.state {
                        CallState::Dialing => in_call = true,
                        CallState::Active if hang_up_at.is_none() => {
                            hang_up_at = Some(Instant::now() + duration);
                        }
                        CallState::Idle if in_call => return Ok(()),
                        _ => {}
                    },
                    ClientEvent::Notice(notice) if !in_call => bail!("{}", notice),
                    _ => {}
                }
            }
            _ = deadline => {
                log::info!("hanging up after {:?}", duration);
                hang_up_at = None;
                caller.hang_up().await?;
            }
        }
    }
}

async fn answer_calls(callee: Client, mut events: mpsc::UnboundedReceiver<ClientEvent>) {
    while let Some(event) = events.recv().await {
        print_event("callee", &event);
        if let ClientEvent::IncomingCall { .. } = event {
            if let Err(e) = callee.accept_inbound().await {
                log::error!("failed to accept call: {}", e);
            }
        }
    }
}

fn print_event(who: &str, event: &ClientEvent) {
    match event {
        ClientEvent::StateChanged(snapshot) => {
            let view = status::project(snapshot);
            println!("[{}] {} | {}", who, view.status_text, view.call_status);
        }
        ClientEvent::Elapsed(elapsed) => println!("[{}] {}", who, format_elapsed(*elapsed)),
        ClientEvent::MediaState { audio, video } => println!(
            "[{}] microphone {} camera {}",
            who,
            media_indicator(*audio).0,
            media_indicator(*video).0
        ),
        ClientEvent::IncomingCall { from, kind } => {
            println!("[{}] incoming {} from {}", who, kind.call_label(), from)
        }
        ClientEvent::Notice(notice) => println!("[{}] {}", who, notice),
        other => log::debug!("[{}] {:?}", who, other),
    }
}
