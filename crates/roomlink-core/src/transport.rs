//! Seam between the session manager and the real-time room SDK.
//!
//! The session manager only talks to a [`RoomTransport`]: one connection
//! object per session, exposing a single ordered event stream, the local
//! publish switches and a participant registry looked up by identity.
//! [`crate::livekit_transport`] implements it on top of LiveKit.

use std::future::Future;

use tokio::sync::mpsc;

use crate::errors::BridgeError;
use crate::events::TrackInfo;

/// Room events as seen by the session, normalized from the SDK's event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomSignal {
    Connected,
    /// The connect call failed. Always the last signal of a join attempt.
    ConnectFailed(String),
    Reconnecting,
    Reconnected,
    Disconnected { reason: String },
    ParticipantConnected(String),
    ParticipantDisconnected(String),
    TrackSubscribed(TrackInfo),
    ActiveSpeakersChanged(Vec<String>),
    /// An SDK event kind the bridge does not translate (named for logging).
    Unrecognized(String),
}

/// Allocates the connection object for a session.
pub trait RoomConnector: Send + Sync + 'static {
    type Transport: RoomTransport;

    fn create(&self, url: &str) -> Self::Transport;
}

/// One room connection. Owned by a session for its whole lifetime and reused
/// across join/leave cycles.
pub trait RoomTransport: Send + Sync + 'static {
    /// Attaches the event consumer. A new subscription replaces the previous
    /// one. Must be called before [`RoomTransport::connect`] so that
    /// `Connected`/`ConnectFailed` are never missed.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<RoomSignal>;

    /// Connects with an access token. A failure is also reported as
    /// [`RoomSignal::ConnectFailed`] on the subscribed stream.
    fn connect(&self, token: &str) -> impl Future<Output = Result<(), BridgeError>> + Send;

    /// Closes the connection. Idempotent.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    fn set_microphone_enabled(
        &self,
        enabled: bool,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send;

    fn set_camera_enabled(
        &self,
        enabled: bool,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send;

    /// Local playback of remote audio.
    fn set_speaker_enabled(&self, enabled: bool);

    /// Sets the enabled flag of every track publication of a remote
    /// participant. Returns the number of publications touched, or `None`
    /// when no participant has that identity.
    fn set_participant_tracks_enabled(&self, identity: &str, enabled: bool) -> Option<usize>;

    /// Current speakers in the order the SDK ranks them.
    fn active_speakers(&self) -> Vec<String>;
}

/// Receives subscribed video tracks for display.
pub trait VideoRenderer: Send + Sync {
    fn attach_video(&self, track: &TrackInfo);
}

/// Renderer used when the host attaches no video surface.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVideo;

impl VideoRenderer for NoVideo {
    fn attach_video(&self, track: &TrackInfo) {
        tracing::debug!("no video surface for track {}", track.sid);
    }
}
