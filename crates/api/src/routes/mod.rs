pub mod peer_discovery;
pub mod signal;
