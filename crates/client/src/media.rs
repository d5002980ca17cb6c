use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CallError, MediaError};

// ============================================
// Local media
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// One capture track. Clones share the live flag, so stopping any clone
/// releases the device for all of them.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    live: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Audio)
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }

    /// True while any track is still capturing.
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: Self = Self {
        audio: true,
        video: true,
    };
    pub const AUDIO_ONLY: Self = Self {
        audio: true,
        video: false,
    };
    pub const VIDEO_ONLY: Self = Self {
        audio: false,
        video: true,
    };
}

/// Camera and microphone access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError>;
}

/// Tries audio+video, then audio-only, then video-only. When every attempt
/// fails the first error is returned, since it names the primary device.
pub async fn acquire_with_fallback(
    devices: &dyn MediaDevices,
) -> Result<(MediaStream, MediaConstraints), MediaError> {
    let mut first_error = None;
    for constraints in [
        MediaConstraints::AUDIO_VIDEO,
        MediaConstraints::AUDIO_ONLY,
        MediaConstraints::VIDEO_ONLY,
    ] {
        match devices.get_user_media(constraints).await {
            Ok(stream) => {
                if constraints != MediaConstraints::AUDIO_VIDEO {
                    info!(?constraints, "Joining with degraded media");
                }
                return Ok((stream, constraints));
            }
            Err(e) => {
                warn!(?constraints, %e, "Media acquisition failed");
                first_error.get_or_insert(e);
            }
        }
    }
    Err(first_error.unwrap_or_else(|| MediaError::NotFound("media device".to_string())))
}

// ============================================
// Peer connections
// ============================================

/// Sent along with an outbound call so the callee can label the tile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMetadata {
    pub user_name: String,
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    RemoteStream(MediaStream),
    Closed,
    Failed(CallError),
}

/// The WebRTC signaling library's per-process peer.
#[async_trait]
pub trait PeerEndpoint: Send + Sync + 'static {
    /// Resolves once the library has assigned this process its peer id.
    async fn open(&self) -> Result<String, CallError>;

    async fn call(
        &self,
        remote_peer_id: &str,
        local_stream: MediaStream,
        metadata: CallMetadata,
    ) -> Result<Arc<dyn MediaCall>, CallError>;

    /// Next inbound call, or `None` once the endpoint is destroyed.
    async fn next_incoming(&self) -> Option<Box<dyn IncomingCall>>;

    async fn destroy(&self);
}

/// A live pairwise media connection.
#[async_trait]
pub trait MediaCall: Send + Sync {
    fn remote_peer_id(&self) -> &str;

    /// Waits for the next lifecycle event. Returns `Closed` forever after close.
    async fn next_event(&self) -> CallEvent;

    fn close(&self);
}

#[async_trait]
pub trait IncomingCall: Send {
    fn remote_peer_id(&self) -> &str;

    fn metadata(&self) -> &CallMetadata;

    async fn answer(self: Box<Self>, local_stream: MediaStream) -> Result<Arc<dyn MediaCall>, CallError>;

    fn reject(self: Box<Self>);
}
