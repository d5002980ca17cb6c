//! In-process stand-ins for the WebRTC library and capture devices.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::error::{CallError, MediaError};
use crate::media::{
    CallEvent, CallMetadata, IncomingCall, MediaCall, MediaConstraints, MediaDevices, MediaStream,
    MediaTrack, PeerEndpoint, TrackKind,
};

type IncomingSender = mpsc::UnboundedSender<Box<dyn IncomingCall>>;

/// Routes calls between endpoints in the same process.
#[derive(Default)]
pub struct LoopbackNetwork {
    endpoints: DashMap<String, IncomingSender>,
    failing: DashSet<String>,
    next_id: AtomicU64,
    calls_placed: AtomicU64,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn endpoint(self: &Arc<Self>) -> Arc<LoopbackEndpoint> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(LoopbackEndpoint {
            network: self.clone(),
            id: parking_lot::Mutex::new(None),
            requested_id: None,
            incoming_tx: tx,
            incoming_rx: Mutex::new(rx),
        })
    }

    /// Endpoint that will be assigned `peer_id` on open.
    pub fn endpoint_with_id(self: &Arc<Self>, peer_id: &str) -> Arc<LoopbackEndpoint> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(LoopbackEndpoint {
            network: self.clone(),
            id: parking_lot::Mutex::new(None),
            requested_id: Some(peer_id.to_string()),
            incoming_tx: tx,
            incoming_rx: Mutex::new(rx),
        })
    }

    /// Calls towards `peer_id` fail after setup, like an ICE failure.
    pub fn fail_calls_to(&self, peer_id: &str) {
        self.failing.insert(peer_id.to_string());
    }

    pub fn heal(&self, peer_id: &str) {
        self.failing.remove(peer_id);
    }

    /// Total outbound calls placed through the network.
    pub fn calls_placed(&self) -> u64 {
        self.calls_placed.load(Ordering::SeqCst)
    }
}

pub struct LoopbackEndpoint {
    network: Arc<LoopbackNetwork>,
    id: parking_lot::Mutex<Option<String>>,
    requested_id: Option<String>,
    incoming_tx: IncomingSender,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<Box<dyn IncomingCall>>>,
}

impl LoopbackEndpoint {
    pub fn peer_id(&self) -> Option<String> {
        self.id.lock().clone()
    }
}

#[async_trait]
impl PeerEndpoint for LoopbackEndpoint {
    async fn open(&self) -> Result<String, CallError> {
        if let Some(id) = self.peer_id() {
            return Ok(id);
        }
        // Id assignment is asynchronous in real libraries.
        tokio::task::yield_now().await;
        let id = self.requested_id.clone().unwrap_or_else(|| {
            let n = self.network.next_id.fetch_add(1, Ordering::SeqCst);
            format!("peer-{}", n)
        });
        self.network
            .endpoints
            .insert(id.clone(), self.incoming_tx.clone());
        *self.id.lock() = Some(id.clone());
        debug!(peer_id = %id, "Loopback endpoint open");
        Ok(id)
    }

    async fn call(
        &self,
        remote_peer_id: &str,
        local_stream: MediaStream,
        metadata: CallMetadata,
    ) -> Result<Arc<dyn MediaCall>, CallError> {
        let local_id = self.peer_id().ok_or(CallError::NotOpen)?;
        let remote = self
            .network
            .endpoints
            .get(remote_peer_id)
            .map(|tx| tx.clone())
            .ok_or_else(|| CallError::PeerUnavailable(remote_peer_id.to_string()))?;
        self.network.calls_placed.fetch_add(1, Ordering::SeqCst);

        let (to_caller, caller_rx) = mpsc::unbounded_channel();
        let (to_callee, callee_rx) = mpsc::unbounded_channel();
        let caller = Arc::new(LoopbackCall::new(
            remote_peer_id,
            caller_rx,
            to_caller.clone(),
            to_callee.clone(),
        ));

        if self.network.failing.contains(remote_peer_id) {
            let _ = to_caller.send(CallEvent::Failed(CallError::ConnectionFailed(
                "ICE negotiation failed".to_string(),
            )));
            return Ok(caller);
        }

        let incoming = LoopbackIncoming {
            from: local_id,
            metadata,
            caller_stream: local_stream,
            to_caller,
            to_callee,
            callee_rx,
        };
        if remote.send(Box::new(incoming)).is_err() {
            return Err(CallError::PeerUnavailable(remote_peer_id.to_string()));
        }
        Ok(caller)
    }

    async fn next_incoming(&self) -> Option<Box<dyn IncomingCall>> {
        self.incoming_rx.lock().await.recv().await
    }

    async fn destroy(&self) {
        if let Some(id) = self.id.lock().take() {
            self.network.endpoints.remove(&id);
        }
        self.incoming_rx.lock().await.close();
    }
}

struct LoopbackCall {
    remote_peer_id: String,
    events: Mutex<mpsc::UnboundedReceiver<CallEvent>>,
    to_self: mpsc::UnboundedSender<CallEvent>,
    to_remote: mpsc::UnboundedSender<CallEvent>,
    closed: AtomicBool,
}

impl LoopbackCall {
    fn new(
        remote_peer_id: &str,
        events: mpsc::UnboundedReceiver<CallEvent>,
        to_self: mpsc::UnboundedSender<CallEvent>,
        to_remote: mpsc::UnboundedSender<CallEvent>,
    ) -> Self {
        Self {
            remote_peer_id: remote_peer_id.to_string(),
            events: Mutex::new(events),
            to_self,
            to_remote,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MediaCall for LoopbackCall {
    fn remote_peer_id(&self) -> &str {
        &self.remote_peer_id
    }

    async fn next_event(&self) -> CallEvent {
        if self.closed.load(Ordering::Acquire) {
            return CallEvent::Closed;
        }
        self.events.lock().await.recv().await.unwrap_or(CallEvent::Closed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.to_remote.send(CallEvent::Closed);
            let _ = self.to_self.send(CallEvent::Closed);
        }
    }
}

struct LoopbackIncoming {
    from: String,
    metadata: CallMetadata,
    caller_stream: MediaStream,
    to_caller: mpsc::UnboundedSender<CallEvent>,
    to_callee: mpsc::UnboundedSender<CallEvent>,
    callee_rx: mpsc::UnboundedReceiver<CallEvent>,
}

#[async_trait]
impl IncomingCall for LoopbackIncoming {
    fn remote_peer_id(&self) -> &str {
        &self.from
    }

    fn metadata(&self) -> &CallMetadata {
        &self.metadata
    }

    async fn answer(self: Box<Self>, local_stream: MediaStream) -> Result<Arc<dyn MediaCall>, CallError> {
        let this = *self;
        this.to_caller
            .send(CallEvent::RemoteStream(local_stream))
            .map_err(|_| CallError::PeerUnavailable(this.from.clone()))?;
        let _ = this.to_callee.send(CallEvent::RemoteStream(this.caller_stream));
        Ok(Arc::new(LoopbackCall::new(
            &this.from,
            this.callee_rx,
            this.to_callee,
            this.to_caller,
        )))
    }

    fn reject(self: Box<Self>) {
        let _ = self.to_caller.send(CallEvent::Failed(CallError::Rejected));
    }
}

/// Capture devices that succeed unless an error is configured for them.
#[derive(Debug, Clone, Default)]
pub struct FakeDevices {
    pub camera: Option<MediaError>,
    pub microphone: Option<MediaError>,
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
        if constraints.video {
            if let Some(e) = &self.camera {
                return Err(e.clone());
            }
        }
        if constraints.audio {
            if let Some(e) = &self.microphone {
                return Err(e.clone());
            }
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(TrackKind::Video));
        }
        Ok(MediaStream::new(tracks))
    }
}
