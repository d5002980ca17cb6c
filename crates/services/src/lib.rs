pub mod clock;
pub mod directory;
pub mod model;
pub mod room_registry;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use directory::{Admission, AllowListDirectory, MeetingDirectory, OpenDirectory};
pub use room_registry::RoomRegistry;
pub use store::{RetentionPolicy, SignalStore, StoreError, StoreResult};
