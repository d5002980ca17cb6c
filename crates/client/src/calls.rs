use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CallError;
use crate::media::{CallEvent, CallMetadata, IncomingCall, MediaCall, MediaStream, PeerEndpoint};

/// What happened to a remote peer's call, for whoever renders tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallUpdate {
    Connected { peer_id: String },
    Ended { peer_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialOutcome {
    Started,
    /// A call to this peer already exists or is being placed.
    AlreadyTracked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Answered,
    Rejected,
}

struct ActiveCall {
    call: Arc<dyn MediaCall>,
    remote_stream: Option<MediaStream>,
    outbound: bool,
}

enum Slot {
    Pending,
    Active(ActiveCall),
}

struct TrackedCall {
    generation: u64,
    slot: Slot,
}

impl TrackedCall {
    /// Outbound attempt the remote side has not yet answered.
    fn is_unanswered_outbound(&self) -> bool {
        match &self.slot {
            Slot::Pending => true,
            Slot::Active(active) => active.outbound && active.remote_stream.is_none(),
        }
    }
}

struct Inner {
    endpoint: Arc<dyn PeerEndpoint>,
    calls: DashMap<String, TrackedCall>,
    local_streams: Mutex<Vec<MediaStream>>,
    local_peer_id: Mutex<Option<String>>,
    generation: AtomicU64,
    updates: broadcast::Sender<CallUpdate>,
}

/// Keeps at most one call per remote peer.
///
/// A slot is reserved before the endpoint is asked to dial, so a second
/// attempt racing the first sees the reservation and backs off. A failed or
/// closed call frees its slot, so the next discovery cycle may dial again.
///
/// When both sides dial each other at once, the peer with the greater id
/// yields: it answers the inbound call and drops its own attempt.
#[derive(Clone)]
pub struct CallManager {
    inner: Arc<Inner>,
}

impl CallManager {
    pub fn new(endpoint: Arc<dyn PeerEndpoint>) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                endpoint,
                calls: DashMap::new(),
                local_streams: Mutex::new(Vec::new()),
                local_peer_id: Mutex::new(None),
                generation: AtomicU64::new(1),
                updates,
            }),
        }
    }

    /// Our own peer id, used for the simultaneous-dial tie-break.
    pub fn set_local_peer_id(&self, peer_id: &str) {
        *self.inner.local_peer_id.lock() = Some(peer_id.to_string());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallUpdate> {
        self.inner.updates.subscribe()
    }

    /// True when a call to `peer_id` is active or being placed.
    pub fn is_tracked(&self, peer_id: &str) -> bool {
        self.inner.calls.contains_key(peer_id)
    }

    pub fn tracked_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.inner.calls.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    /// Remote streams by peer id, for rendering.
    pub fn remote_streams(&self) -> HashMap<String, MediaStream> {
        self.inner
            .calls
            .iter()
            .filter_map(|entry| match &entry.value().slot {
                Slot::Active(ActiveCall {
                    remote_stream: Some(stream),
                    ..
                }) => Some((entry.key().clone(), stream.clone())),
                _ => None,
            })
            .collect()
    }

    pub async fn dial(
        &self,
        remote_peer_id: &str,
        local_stream: &MediaStream,
        metadata: CallMetadata,
    ) -> Result<DialOutcome, CallError> {
        let generation = self.next_generation();
        match self.inner.calls.entry(remote_peer_id.to_string()) {
            Entry::Occupied(_) => {
                debug!(peer_id = %remote_peer_id, "Call already tracked, not dialing");
                return Ok(DialOutcome::AlreadyTracked);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(TrackedCall {
                    generation,
                    slot: Slot::Pending,
                });
            }
        }
        self.remember_local_stream(local_stream);

        debug!(peer_id = %remote_peer_id, "Dialing peer");
        match self
            .inner
            .endpoint
            .call(remote_peer_id, local_stream.clone(), metadata)
            .await
        {
            Ok(call) => {
                self.activate(remote_peer_id, generation, call, true, None);
                Ok(DialOutcome::Started)
            }
            Err(e) => {
                warn!(peer_id = %remote_peer_id, %e, "Dial failed");
                self.release(remote_peer_id, generation);
                Err(e)
            }
        }
    }

    /// Answers an inbound call, or rejects it when we cannot take it.
    pub async fn answer(
        &self,
        incoming: Box<dyn IncomingCall>,
        local_stream: Option<&MediaStream>,
    ) -> Result<AnswerOutcome, CallError> {
        let remote_peer_id = incoming.remote_peer_id().to_string();
        let Some(local_stream) = local_stream else {
            warn!(peer_id = %remote_peer_id, "No local stream, rejecting call");
            incoming.reject();
            return Err(CallError::NoLocalStream);
        };

        let generation = self.next_generation();
        let superseded = match self.inner.calls.entry(remote_peer_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_unanswered_outbound() && self.yields_to(&remote_peer_id) {
                    let previous = std::mem::replace(
                        occupied.get_mut(),
                        TrackedCall {
                            generation,
                            slot: Slot::Pending,
                        },
                    );
                    info!(peer_id = %remote_peer_id, "Simultaneous dial, taking the inbound call");
                    Some(previous)
                } else {
                    drop(occupied);
                    debug!(peer_id = %remote_peer_id, "Call already tracked, rejecting inbound");
                    incoming.reject();
                    return Ok(AnswerOutcome::Rejected);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(TrackedCall {
                    generation,
                    slot: Slot::Pending,
                });
                None
            }
        };
        if let Some(TrackedCall {
            slot: Slot::Active(active),
            ..
        }) = superseded
        {
            active.call.close();
        }
        self.remember_local_stream(local_stream);

        match incoming.answer(local_stream.clone()).await {
            Ok(call) => {
                self.activate(&remote_peer_id, generation, call, false, None);
                Ok(AnswerOutcome::Answered)
            }
            Err(e) => {
                warn!(peer_id = %remote_peer_id, %e, "Answer failed");
                self.release(&remote_peer_id, generation);
                Err(e)
            }
        }
    }

    /// Answers inbound calls until the endpoint is destroyed.
    pub fn spawn_answering(&self, local_stream: Option<MediaStream>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(incoming) = manager.inner.endpoint.next_incoming().await {
                if let Err(e) = manager.answer(incoming, local_stream.as_ref()).await {
                    warn!(%e, "Inbound call not answered");
                }
            }
            debug!("Endpoint closed, no more inbound calls");
        })
    }

    /// Closes every call and stops every local track handed to the manager.
    pub fn hangup_all(&self) {
        let peers: Vec<String> = self.inner.calls.iter().map(|e| e.key().clone()).collect();
        for peer_id in peers {
            if let Some((_, tracked)) = self.inner.calls.remove(&peer_id) {
                if let Slot::Active(active) = tracked.slot {
                    active.call.close();
                    let _ = self.inner.updates.send(CallUpdate::Ended { peer_id });
                }
            }
        }
        for stream in self.inner.local_streams.lock().drain(..) {
            stream.stop_all();
        }
        info!("All calls closed");
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::SeqCst)
    }

    fn yields_to(&self, remote_peer_id: &str) -> bool {
        match self.inner.local_peer_id.lock().as_deref() {
            Some(local) => local > remote_peer_id,
            None => false,
        }
    }

    fn remember_local_stream(&self, stream: &MediaStream) {
        let mut streams = self.inner.local_streams.lock();
        if !streams.iter().any(|s| s.id() == stream.id()) {
            streams.push(stream.clone());
        }
    }

    /// Frees the slot if it still belongs to `generation`.
    fn release(&self, peer_id: &str, generation: u64) -> bool {
        let removed = self
            .inner
            .calls
            .remove_if(peer_id, |_, tracked| tracked.generation == generation);
        if let Some((_, tracked)) = removed {
            if matches!(tracked.slot, Slot::Active(_)) {
                let _ = self.inner.updates.send(CallUpdate::Ended {
                    peer_id: peer_id.to_string(),
                });
            }
            return true;
        }
        false
    }

    fn activate(
        &self,
        peer_id: &str,
        generation: u64,
        call: Arc<dyn MediaCall>,
        outbound: bool,
        remote_stream: Option<MediaStream>,
    ) {
        let installed = match self.inner.calls.get_mut(peer_id) {
            Some(mut tracked) if tracked.generation == generation => {
                tracked.slot = Slot::Active(ActiveCall {
                    call: call.clone(),
                    remote_stream,
                    outbound,
                });
                true
            }
            _ => false,
        };
        if !installed {
            // Hung up or superseded while connecting.
            call.close();
            return;
        }

        let manager = self.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            loop {
                match call.next_event().await {
                    CallEvent::RemoteStream(stream) => {
                        let attached = match manager.inner.calls.get_mut(&peer_id) {
                            Some(mut tracked) if tracked.generation == generation => {
                                if let Slot::Active(active) = &mut tracked.slot {
                                    active.remote_stream = Some(stream);
                                }
                                true
                            }
                            _ => false,
                        };
                        if attached {
                            info!(%peer_id, "Remote stream attached");
                            let _ = manager.inner.updates.send(CallUpdate::Connected {
                                peer_id: peer_id.clone(),
                            });
                        }
                    }
                    CallEvent::Closed => {
                        debug!(%peer_id, "Call closed");
                        manager.release(&peer_id, generation);
                        break;
                    }
                    CallEvent::Failed(e) => {
                        warn!(%peer_id, %e, "Call failed, peer may be retried");
                        call.close();
                        manager.release(&peer_id, generation);
                        break;
                    }
                }
            }
        });
    }
}
