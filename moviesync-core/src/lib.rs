//! # moviesync-core: Synchronized group playback over a local network
//!
//! One device coordinates; the others join it as members. Starts are
//! scheduled against an absolute coordinator timestamp, and every member
//! translates that timestamp through its own smoothed clock offset.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   line JSON / TCP    ┌────────────────────┐
//! │ MemberSession  │ ◄──────────────────► │ CoordinatorSession │
//! │ (per device)   │  CONNECT, SYNC_TIME, │ (one per group)    │
//! └───────┬────────┘  PLAY_COMMAND, ...   └─────────┬──────────┘
//!         │                                         │
//!         ▼                                         ▼
//! ┌────────────────┐                      ┌────────────────────┐
//! │ OffsetEstimator│                      │ MemberRegistry     │
//! │ (+ OffsetStore)│                      │ compute_target     │
//! └────────────────┘                      └────────────────────┘
//!         │                                         │
//!         └──────────► SessionEvent::PlayScheduled ◄┘
//!                      (local playback collaborator)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Message set and newline-framed JSON codec
//! - [`clock`]: Wall clocks and the smoothed offset estimator
//! - [`storage`]: Persistence of the offset record
//! - [`broadcast`]: Target-time rule, member registry, fan-out
//! - [`coordinator`]: Accept loop and per-member handlers
//! - [`member`]: Join, time sync and the receive loop
//! - [`session`]: Collaborator facade, events and errors
//! - [`addr`]: Local address discovery

pub mod addr;
pub mod broadcast;
pub mod clock;
pub mod coordinator;
pub mod member;
pub mod protocol;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use addr::{local_ipv4, with_default_port};
pub use broadcast::{compute_target, BroadcastStats, MemberRegistry, BOUNDARY_MS, MIN_MARGIN_MS};
pub use clock::{ManualClock, OffsetEstimator, SystemClock, WallClock};
pub use coordinator::{BroadcastReport, CoordinatorConfig, CoordinatorSession, CoordinatorState};
pub use member::{MemberConfig, MemberSession, MemberState};
pub use protocol::{Message, MessageKind, MessageReader, ProtocolError, DEFAULT_PORT};
pub use session::{event_channel, GroupSession, Role, SessionError, SessionEvent};
pub use storage::{FileOffsetStore, MemoryOffsetStore, OffsetRecord, OffsetStore, StoreError};
