use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use rendezvous_services::model::{PeerRegistration, Roster};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::calls::CallManager;
use crate::error::SessionError;
use crate::media::{CallMetadata, MediaStream, PeerEndpoint};
use crate::transport::SignalingTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Registering,
    Active,
    Leaving,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Roster poll cadence.
    pub discovery_interval: Duration,
    /// Liveness refresh cadence. Must stay below the server eviction window.
    pub heartbeat_interval: Duration,
    /// Upper bound of the random delay added before the first roster poll.
    pub max_jitter: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            max_jitter: Duration::from_millis(500),
        }
    }
}

/// Who we are in the meeting once registered.
#[derive(Debug, Clone)]
pub struct JoinedMeeting {
    pub meeting_id: String,
    pub peer_id: String,
    /// Roster returned by the initial registration.
    pub roster: Roster,
}

struct Running {
    joined: JoinedMeeting,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Running {
    fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Peer discovery: registers, dials the roster, then keeps two independent
/// loops running (roster poll and heartbeat) until `leave`.
pub struct DiscoveryAgent {
    transport: Arc<dyn SignalingTransport>,
    endpoint: Arc<dyn PeerEndpoint>,
    calls: CallManager,
    config: DiscoveryConfig,
    state: watch::Sender<DiscoveryState>,
    running: Mutex<Option<Running>>,
}

impl DiscoveryAgent {
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        endpoint: Arc<dyn PeerEndpoint>,
        config: DiscoveryConfig,
    ) -> Self {
        let calls = CallManager::new(endpoint.clone());
        let (state, _) = watch::channel(DiscoveryState::Idle);
        Self {
            transport,
            endpoint,
            calls,
            config,
            state,
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<DiscoveryState> {
        self.state.subscribe()
    }

    pub fn calls(&self) -> &CallManager {
        &self.calls
    }

    pub fn joined(&self) -> Option<JoinedMeeting> {
        self.running.lock().as_ref().map(|r| r.joined.clone())
    }

    /// Waits for our peer id, registers, dials everyone already present and
    /// starts the background loops.
    pub async fn join(
        &self,
        meeting_id: &str,
        display_name: &str,
        contact_handle: Option<&str>,
        local_stream: MediaStream,
    ) -> Result<JoinedMeeting, SessionError> {
        let transitioned = self.state.send_if_modified(|state| {
            if *state == DiscoveryState::Idle {
                *state = DiscoveryState::Registering;
                true
            } else {
                false
            }
        });
        if !transitioned {
            return Err(SessionError::AlreadyJoined);
        }

        let peer_id = match self.endpoint.open().await {
            Ok(id) => id,
            Err(e) => {
                self.state.send_replace(DiscoveryState::Idle);
                return Err(e.into());
            }
        };
        self.calls.set_local_peer_id(&peer_id);

        let mut registration = PeerRegistration::new(&peer_id, display_name);
        if let Some(handle) = contact_handle {
            registration = registration.with_contact(handle);
        }
        let roster = match self.transport.register(meeting_id, &registration).await {
            Ok(roster) => roster,
            Err(e) => {
                self.state.send_replace(DiscoveryState::Idle);
                return Err(e.into());
            }
        };
        info!(%meeting_id, %peer_id, peers = roster.count, "Registered in meeting");

        let ctx = LoopContext {
            transport: self.transport.clone(),
            calls: self.calls.clone(),
            meeting_id: meeting_id.to_string(),
            peer_id: peer_id.clone(),
            local_stream: local_stream.clone(),
            metadata: CallMetadata {
                user_name: display_name.to_string(),
            },
        };
        ctx.dial_new(&roster).await;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let jitter = random_jitter(self.config.max_jitter);
        let tasks = vec![
            self.calls.spawn_answering(Some(local_stream)),
            tokio::spawn(discovery_loop(
                ctx.clone(),
                self.config.discovery_interval,
                jitter,
                shutdown_rx.clone(),
            )),
            tokio::spawn(heartbeat_loop(
                ctx,
                registration,
                self.config.heartbeat_interval,
                shutdown_rx,
            )),
        ];

        let joined = JoinedMeeting {
            meeting_id: meeting_id.to_string(),
            peer_id,
            roster,
        };
        *self.running.lock() = Some(Running {
            joined: joined.clone(),
            shutdown,
            tasks,
        });
        self.state.send_replace(DiscoveryState::Active);
        Ok(joined)
    }

    /// Stops the loops, unregisters and tears down every call. Transport
    /// failure while unregistering is logged; the peer then ages out.
    pub async fn leave(&self) -> Result<(), SessionError> {
        let Some(mut running) = self.running.lock().take() else {
            return Err(SessionError::NotJoined);
        };
        self.state.send_replace(DiscoveryState::Leaving);
        running.stop();

        let JoinedMeeting {
            meeting_id,
            peer_id,
            ..
        } = &running.joined;
        if let Err(e) = self.transport.unregister(meeting_id, peer_id).await {
            warn!(%meeting_id, %peer_id, %e, "Unregister failed");
        }
        self.calls.hangup_all();
        self.endpoint.destroy().await;

        info!(%meeting_id, %peer_id, "Left meeting");
        self.state.send_replace(DiscoveryState::Idle);
        Ok(())
    }
}

impl Drop for DiscoveryAgent {
    fn drop(&mut self) {
        if let Some(mut running) = self.running.get_mut().take() {
            running.stop();
            self.calls.hangup_all();
        }
    }
}

#[derive(Clone)]
struct LoopContext {
    transport: Arc<dyn SignalingTransport>,
    calls: CallManager,
    meeting_id: String,
    peer_id: String,
    local_stream: MediaStream,
    metadata: CallMetadata,
}

impl LoopContext {
    /// Dials peers in `roster` we have no call with. Failures stay per peer.
    async fn dial_new(&self, roster: &Roster) {
        for peer in &roster.peers {
            if peer.peer_id == self.peer_id || self.calls.is_tracked(&peer.peer_id) {
                continue;
            }
            if let Err(e) = self
                .calls
                .dial(&peer.peer_id, &self.local_stream, self.metadata.clone())
                .await
            {
                warn!(meeting_id = %self.meeting_id, peer_id = %peer.peer_id, %e, "Could not dial peer");
            }
        }
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

async fn discovery_loop(
    ctx: LoopContext,
    every: Duration,
    jitter: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every + jitter, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match ctx.transport.lookup(&ctx.meeting_id).await {
                    Ok(roster) => ctx.dial_new(&roster).await,
                    Err(e) => warn!(meeting_id = %ctx.meeting_id, %e, "Roster poll failed"),
                }
            }
        }
    }
    debug!(meeting_id = %ctx.meeting_id, "Discovery loop stopped");
}

async fn heartbeat_loop(
    ctx: LoopContext,
    registration: PeerRegistration,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                // Only the liveness side effect matters; the roster is dropped.
                if let Err(e) = ctx.transport.register(&ctx.meeting_id, &registration).await {
                    warn!(meeting_id = %ctx.meeting_id, peer_id = %ctx.peer_id, %e, "Heartbeat failed");
                }
            }
        }
    }
    debug!(meeting_id = %ctx.meeting_id, "Heartbeat loop stopped");
}
