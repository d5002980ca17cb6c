//! Prints a meeting's roster and chat as they change, without joining it.

use std::collections::HashSet;
use std::time::Duration;

use clap::Parser;
use rendezvous_client::transport::{HttpTransport, SignalingTransport};
use rendezvous_client::views::MessageLog;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rendezvous-watch", version, about = "Watch a meeting's roster and chat")]
struct Args {
    /// Base URL of the signaling server.
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    server: String,

    /// Meeting to watch.
    #[arg(long)]
    meeting: String,

    /// Seconds between polls.
    #[arg(long, default_value_t = 2)]
    interval: u64,

    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rendezvous_watch=info,rendezvous_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let transport = HttpTransport::with_timeout(&args.server, Duration::from_secs(args.timeout))?;
    info!(server = %args.server, meeting = %args.meeting, "Watching meeting");

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    let mut roster: HashSet<String> = HashSet::new();
    let mut log = MessageLog::new();
    let mut printed: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }

        match transport.lookup(&args.meeting).await {
            Ok(current) => {
                let ids: HashSet<String> = current.peers.iter().map(|p| p.peer_id.clone()).collect();
                for peer in current.peers.iter().filter(|p| !roster.contains(&p.peer_id)) {
                    info!(peer_id = %peer.peer_id, name = %peer.display_name, "Joined");
                }
                for gone in roster.difference(&ids) {
                    info!(peer_id = %gone, "Left");
                }
                roster = ids;
            }
            Err(e) => warn!(%e, "Roster poll failed"),
        }

        match transport.list_messages(&args.meeting, log.last_id()).await {
            Ok(messages) => {
                log.merge(messages);
                for message in log.messages().iter().filter(|m| printed.insert(m.id.clone())) {
                    info!(author = %message.author_name, "{}", message.body);
                }
            }
            Err(e) => warn!(%e, "Chat poll failed"),
        }
    }

    info!("Stopped");
    Ok(())
}
