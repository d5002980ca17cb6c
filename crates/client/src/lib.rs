pub mod calls;
pub mod discovery;
pub mod error;
pub mod loopback;
pub mod media;
pub mod session;
pub mod transport;
pub mod views;

pub use calls::{CallManager, CallUpdate, DialOutcome};
pub use discovery::{DiscoveryAgent, DiscoveryConfig, DiscoveryState};
pub use error::{CallError, MediaError, SessionError, TransportError};
pub use session::{MeetingSession, SessionConfig};
pub use transport::{HttpTransport, LocalTransport, SignalingTransport};
