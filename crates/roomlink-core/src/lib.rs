//! RoomLink core: a single-room session manager over LiveKit.
//!
//! Pure Rust crate with no platform dependencies.
//! Consumed by game-engine host plugins via UniFFI bindings.

pub mod audio;
pub mod errors;
pub mod events;
pub mod lifecycle;
pub mod livekit_transport;
pub mod session;
pub mod settings;
pub mod transport;

pub use audio::{AudioPipeline, AudioPlayoutBuffer};
pub use errors::BridgeError;
pub use events::{BridgeEventListener, OutboundEvent, TrackInfo, TrackKind};
pub use lifecycle::{CallingThread, HostLifecycle, LifecycleReporter, LifecycleState, MainThread};
pub use livekit_transport::{ConnectOptions, LiveKitConnector, LiveKitTransport};
pub use session::{SessionManager, SessionState};
pub use settings::{Settings, SettingsStore};
pub use transport::{NoVideo, RoomConnector, RoomSignal, RoomTransport, VideoRenderer};
