use std::sync::{Arc, PoisonError, RwLock};

/// Channel carrying the connection-level tags (`connected`, `disconnected`, ...).
pub const EVENT_CHANNEL: &str = "event";
pub const PARTICIPANT_CONNECTED_CHANNEL: &str = "participant_connected";
pub const PARTICIPANT_DISCONNECTED_CHANNEL: &str = "participant_disconnected";

/// Notifications emitted by the session manager to host listeners.
///
/// Every variant is delivered on one outbound channel (see [`OutboundEvent::channel`])
/// with a string payload, which is what game scripts bind their signals to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Connected,
    Disconnected,
    ConnectionError { reason: String },
    Reconnecting,
    Reconnected,
    TrackSubscribed(TrackInfo),
    ParticipantConnected(String),    // participant identity
    ParticipantDisconnected(String), // participant identity
}

impl OutboundEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            Self::ParticipantConnected(_) => PARTICIPANT_CONNECTED_CHANNEL,
            Self::ParticipantDisconnected(_) => PARTICIPANT_DISCONNECTED_CHANNEL,
            _ => EVENT_CHANNEL,
        }
    }

    /// The tag for `event` channel notifications, the identity otherwise.
    pub fn payload(&self) -> &str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::ConnectionError { .. } => "connection_error",
            Self::Reconnecting => "reconnecting",
            Self::Reconnected => "reconnected",
            Self::TrackSubscribed(_) => "TrackSubscribed",
            Self::ParticipantConnected(identity) | Self::ParticipantDisconnected(identity) => {
                identity
            }
        }
    }

    /// Extra context not carried by the payload: the failure reason or the track SID.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::ConnectionError { reason } => Some(reason),
            Self::TrackSubscribed(info) => Some(&info.sid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub sid: String,
    pub participant_identity: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
///
/// `on_event` must not call `leave_room`, `init` or `on_destroy` on the
/// same thread; hand such commands off to the host's command thread.
pub trait BridgeEventListener: Send + Sync {
    fn on_event(&self, event: OutboundEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn BridgeEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn BridgeEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn emit(&self, event: OutboundEvent) {
        tracing::debug!("emit {}:{}", event.channel(), event.payload());
        // Snapshot so a listener may register another listener from its callback.
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}
