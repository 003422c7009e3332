//! UniFFI bindings for roomlink-core.
//!
//! Provides a RoomLinkClient object that wraps the SessionManager and the
//! settings store into a single FFI-safe interface. Host plugins (a Kotlin
//! game-engine plugin on Android) forward their script-facing commands here
//! and re-emit `OutboundSignal`s as script signals.

use std::sync::Arc;
use std::time::Duration;

use roomlink_core::{
    AudioPipeline, LiveKitConnector, OutboundEvent, SessionManager, SettingsStore,
    LifecycleState as CoreLifecycleState, SessionState as CoreSessionState,
};

uniffi::include_scaffolding!("roomlink");

// ── Android WebRTC initialization ────────────────────────────────────
//
// Must be called from Kotlin AFTER System.loadLibrary, before join_room().
// webrtc::InitAndroid needs a valid JNI class loader context, which is
// NOT available inside JNI_OnLoad.

#[cfg(target_os = "android")]
#[unsafe(no_mangle)]
pub extern "C" fn Java_io_roomlink_RoomLink_nativeInitWebrtc(
    env: *mut std::ffi::c_void,
    _class: *mut std::ffi::c_void,
) {
    roomlink_log("ROOMLINK FFI: nativeInitWebrtc called");
    let Ok(env) = (unsafe { jni::JNIEnv::from_raw(env as *mut jni::sys::JNIEnv) }) else {
        roomlink_log("ROOMLINK FFI: nativeInitWebrtc got an invalid JNIEnv");
        return;
    };
    let Ok(jvm) = env.get_java_vm() else {
        roomlink_log("ROOMLINK FFI: nativeInitWebrtc could not get the JavaVM");
        return;
    };

    libwebrtc::android::initialize_android(&jvm);

    // Prevent Drop from calling DestroyJavaVM
    std::mem::forget(jvm);
    roomlink_log("ROOMLINK FFI: WebRTC initialized");
}

// ── Platform log helper ──────────────────────────────────────────────

/// Write a message to logcat on Android, syslog on iOS, or stderr elsewhere.
///
/// Used before the tracing subscriber exists and around panics.
fn roomlink_log(msg: &str) {
    #[cfg(target_os = "android")]
    {
        use std::ffi::CString;
        unsafe extern "C" {
            fn __android_log_write(prio: i32, tag: *const std::ffi::c_char, text: *const std::ffi::c_char) -> i32;
        }
        let tag = c"ROOMLINK_FFI";
        if let Ok(text) = CString::new(msg) {
            unsafe { __android_log_write(4 /* INFO */, tag.as_ptr(), text.as_ptr()); }
        }
    }
    #[cfg(target_os = "ios")]
    {
        use std::ffi::CString;
        unsafe extern "C" {
            fn syslog(priority: i32, message: *const std::ffi::c_char, ...);
        }
        if let Ok(text) = CString::new(msg) {
            unsafe { syslog(6 /* LOG_INFO */, c"%s".as_ptr(), text.as_ptr()); }
        }
    }
    #[cfg(not(any(target_os = "android", target_os = "ios")))]
    eprintln!("{msg}");
}

// ── Namespace functions ──────────────────────────────────────────────

/// Initialize tracing/logging. Call once from the host before using RoomLinkClient.
fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("roomlink_core=debug,roomlink_ffi=debug"));
        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .try_init();
        if installed.is_err() {
            roomlink_log("ROOMLINK FFI: a tracing subscriber is already installed");
        }
    });
}

// ── FFI-safe type conversions ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining,
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
}

impl From<CoreSessionState> for SessionState {
    fn from(s: CoreSessionState) -> Self {
        match s {
            CoreSessionState::Idle => Self::Idle,
            CoreSessionState::Joining => Self::Joining,
            CoreSessionState::Connected => Self::Connected,
            CoreSessionState::Reconnecting => Self::Reconnecting,
            CoreSessionState::Disconnected => Self::Disconnected,
            CoreSessionState::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Started,
    Resumed,
    Destroyed,
}

impl From<CoreLifecycleState> for LifecycleState {
    fn from(s: CoreLifecycleState) -> Self {
        match s {
            CoreLifecycleState::Created => Self::Created,
            CoreLifecycleState::Started => Self::Started,
            CoreLifecycleState::Resumed => Self::Resumed,
            CoreLifecycleState::Destroyed => Self::Destroyed,
        }
    }
}

/// A notification flattened to what a script signal carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSignal {
    pub channel: String,
    pub payload: String,
    pub detail: Option<String>,
}

impl From<OutboundEvent> for OutboundSignal {
    fn from(e: OutboundEvent) -> Self {
        Self {
            channel: e.channel().to_string(),
            payload: e.payload().to_string(),
            detail: e.detail().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub last_server_url: Option<String>,
    pub auto_subscribe: bool,
    pub adaptive_stream: bool,
    pub dynacast: bool,
}

impl From<roomlink_core::Settings> for Settings {
    fn from(s: roomlink_core::Settings) -> Self {
        Self {
            last_server_url: s.last_server_url,
            auto_subscribe: s.auto_subscribe,
            adaptive_stream: s.adaptive_stream,
            dynacast: s.dynacast,
        }
    }
}

// ── Error conversion ──────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("Not initialized: call init first")]
    NotInitialized,
    #[error("Invalid URL: {msg}")]
    InvalidUrl { msg: String },
    #[error("Host lifecycle destroyed")]
    HostDestroyed,
    #[error("Connection error: {msg}")]
    Connection { msg: String },
    #[error("Room error: {msg}")]
    Room { msg: String },
    #[error("Panic: {msg}")]
    Panic { msg: String },
}

impl From<roomlink_core::BridgeError> for BridgeError {
    fn from(e: roomlink_core::BridgeError) -> Self {
        tracing::error!("BridgeError: {e}");
        match e {
            roomlink_core::BridgeError::NotInitialized => Self::NotInitialized,
            roomlink_core::BridgeError::InvalidUrl(msg) => Self::InvalidUrl { msg },
            roomlink_core::BridgeError::HostDestroyed => Self::HostDestroyed,
            roomlink_core::BridgeError::Connection(msg) => Self::Connection { msg },
            roomlink_core::BridgeError::Room(msg) => Self::Room { msg },
        }
    }
}

/// Run a core call, keeping panics from crossing the FFI boundary.
fn guarded<T>(
    op: &str,
    call: impl FnOnce() -> Result<T, roomlink_core::BridgeError>,
) -> Result<T, BridgeError> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(call)) {
        Ok(result) => result.map_err(BridgeError::from),
        Err(panic_info) => {
            let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            roomlink_log(&format!("ROOMLINK FFI: {op}() PANIC caught: {msg}"));
            Err(BridgeError::Panic { msg: format!("panic in {op}: {msg}") })
        }
    }
}

// ── Callback interface ────────────────────────────────────────────────

pub trait RoomLinkListener: Send + Sync {
    fn on_signal(&self, signal: OutboundSignal);
}

// ── Bridge listener: core listener → FFI callback ─────────────────────

struct BridgeListener {
    ffi_listener: Arc<dyn RoomLinkListener>,
}

impl roomlink_core::BridgeEventListener for BridgeListener {
    fn on_event(&self, event: OutboundEvent) {
        self.ffi_listener.on_signal(event.into());
    }
}

// ── RoomLinkClient: main FFI object ───────────────────────────────────

/// How long dropping the client waits for the room to close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct RoomLinkClient {
    manager: SessionManager<LiveKitConnector>,
    settings: Arc<SettingsStore>,
    audio: Arc<AudioPipeline>,
    rt: tokio::runtime::Runtime,
}

impl RoomLinkClient {
    pub fn new(data_dir: String) -> Result<Self, BridgeError> {
        roomlink_log("ROOMLINK FFI: RoomLinkClient::new() called");
        let rt = tokio::runtime::Runtime::new().map_err(|e| BridgeError::Room {
            msg: format!("failed to create tokio runtime: {e}"),
        })?;
        let settings = Arc::new(SettingsStore::new(&data_dir));
        let audio = Arc::new(AudioPipeline::new());
        let connector = LiveKitConnector::new(settings.clone(), audio.clone());
        let manager = SessionManager::new(connector, rt.handle().clone());
        Ok(Self {
            manager,
            settings,
            audio,
            rt,
        })
    }

    pub fn init(&self, url: String) -> Result<(), BridgeError> {
        guarded("init", || self.manager.init(&url))?;
        self.settings.set_last_server_url(Some(url.trim().to_string()));
        Ok(())
    }

    pub fn set_mic_enabled(&self, enabled: bool) -> Result<(), BridgeError> {
        guarded("set_mic_enabled", || self.manager.set_mic_enabled(enabled))
    }

    pub fn set_speaker_enabled(&self, enabled: bool) -> Result<(), BridgeError> {
        guarded("set_speaker_enabled", || self.manager.set_speaker_enabled(enabled))
    }

    pub fn set_camera_enabled(&self, enabled: bool) -> Result<(), BridgeError> {
        guarded("set_camera_enabled", || self.manager.set_camera_enabled(enabled))
    }

    pub fn join_room(&self, token: String) -> Result<(), BridgeError> {
        // The token is a bearer credential: log its length only.
        tracing::info!("join_room (token: {} bytes)", token.len());
        guarded("join_room", || self.manager.join_room(&token))
    }

    pub fn leave_room(&self) -> Result<(), BridgeError> {
        guarded("leave_room", || self.manager.leave_room())
    }

    pub fn mute_participant(&self, identity: String) -> Result<(), BridgeError> {
        guarded("mute_participant", || self.manager.mute_participant(&identity))
    }

    pub fn unmute_participant(&self, identity: String) -> Result<(), BridgeError> {
        guarded("unmute_participant", || self.manager.unmute_participant(&identity))
    }

    pub fn active_speakers(&self) -> Result<Vec<String>, BridgeError> {
        guarded("active_speakers", || self.manager.active_speakers())
    }

    pub fn session_state(&self) -> Result<SessionState, BridgeError> {
        guarded("session_state", || self.manager.session_state()).map(SessionState::from)
    }

    pub fn is_mic_enabled(&self) -> Result<bool, BridgeError> {
        guarded("is_mic_enabled", || self.manager.is_mic_enabled())
    }

    pub fn is_camera_enabled(&self) -> Result<bool, BridgeError> {
        guarded("is_camera_enabled", || self.manager.is_camera_enabled())
    }

    pub fn is_speaker_enabled(&self) -> Result<bool, BridgeError> {
        guarded("is_speaker_enabled", || self.manager.is_speaker_enabled())
    }

    pub fn add_listener(&self, listener: Box<dyn RoomLinkListener>) {
        let bridge = Arc::new(BridgeListener {
            ffi_listener: Arc::from(listener),
        });
        self.manager.add_listener(bridge);
    }

    /// Feed interleaved microphone PCM from the platform capture thread.
    /// Returns false while no microphone track is published.
    pub fn push_microphone_frame(
        &self,
        samples: Vec<i16>,
        sample_rate: u32,
        channels: u32,
    ) -> Result<bool, BridgeError> {
        guarded("push_microphone_frame", || {
            self.rt
                .block_on(self.audio.capture(&samples, sample_rate, channels))
        })
    }

    /// Up to `capacity` samples of decoded remote audio for the platform
    /// output. Empty when nothing is buffered.
    pub fn pull_speaker_audio(&self, capacity: u32) -> Vec<i16> {
        self.audio.pull_playout(capacity as usize)
    }

    // Lifecycle calls are expected on the host's UI thread.

    pub fn on_start(&self) -> Result<(), BridgeError> {
        guarded("on_start", || {
            self.manager.on_start();
            Ok(())
        })
    }

    pub fn on_resume(&self) -> Result<(), BridgeError> {
        guarded("on_resume", || {
            self.manager.on_resume();
            Ok(())
        })
    }

    pub fn on_pause(&self) -> Result<(), BridgeError> {
        guarded("on_pause", || {
            self.manager.on_pause();
            Ok(())
        })
    }

    pub fn on_stop(&self) -> Result<(), BridgeError> {
        guarded("on_stop", || {
            self.manager.on_stop();
            Ok(())
        })
    }

    pub fn on_destroy(&self) -> Result<(), BridgeError> {
        guarded("on_destroy", || {
            self.manager.on_destroy();
            Ok(())
        })
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.manager.lifecycle().state().into()
    }

    pub fn get_settings(&self) -> Settings {
        self.settings.get().into()
    }

    pub fn set_auto_subscribe(&self, enabled: bool) {
        self.settings.set_auto_subscribe(enabled);
    }

    pub fn set_adaptive_stream(&self, enabled: bool) {
        self.settings.set_adaptive_stream(enabled);
    }

    pub fn set_dynacast(&self, enabled: bool) {
        self.settings.set_dynacast(enabled);
    }
}

impl Drop for RoomLinkClient {
    fn drop(&mut self) {
        let Some(closing) = self.manager.close() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            tracing::warn!("RoomLinkClient dropped on a runtime thread, not waiting for the room to close");
            return;
        }
        let closed = self
            .rt
            .block_on(async { tokio::time::timeout(CLOSE_TIMEOUT, closing).await });
        if closed.is_err() {
            tracing::warn!("room did not close within {CLOSE_TIMEOUT:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomlink_core::{TrackInfo, TrackKind};
    use std::sync::Mutex;

    fn client() -> (RoomLinkClient, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let client = RoomLinkClient::new(dir.path().to_str().unwrap().to_string()).unwrap();
        (client, dir)
    }

    #[test]
    fn commands_before_init_fail_fast() {
        let (client, _dir) = client();
        assert_eq!(client.join_room("token".into()), Err(BridgeError::NotInitialized));
        assert_eq!(client.set_mic_enabled(true), Err(BridgeError::NotInitialized));
        assert_eq!(client.active_speakers(), Err(BridgeError::NotInitialized));
        assert_eq!(client.leave_room(), Err(BridgeError::NotInitialized));
    }

    #[test]
    fn init_records_server_url() {
        let (client, dir) = client();
        client.init("wss://rtc.example.com".into()).unwrap();
        assert_eq!(client.session_state(), Ok(SessionState::Idle));
        assert_eq!(client.active_speakers(), Ok(vec![]));
        assert_eq!(client.mute_participant("alice".into()), Ok(()));
        assert_eq!(client.leave_room(), Ok(()));

        let reloaded = SettingsStore::new(dir.path().to_str().unwrap());
        assert_eq!(reloaded.get().last_server_url.as_deref(), Some("wss://rtc.example.com"));
    }

    #[test]
    fn invalid_url_is_reported() {
        let (client, _dir) = client();
        assert!(matches!(
            client.init("mailto:someone".into()),
            Err(BridgeError::InvalidUrl { .. })
        ));
        assert_eq!(client.get_settings().last_server_url, None);
    }

    #[test]
    fn lifecycle_is_mirrored() {
        let (client, _dir) = client();
        assert_eq!(client.lifecycle_state(), LifecycleState::Created);
        assert_eq!(client.on_start(), Ok(()));
        assert_eq!(client.on_resume(), Ok(()));
        assert_eq!(client.lifecycle_state(), LifecycleState::Resumed);
        assert_eq!(client.on_pause(), Ok(()));
        assert_eq!(client.on_stop(), Ok(()));
        assert_eq!(client.lifecycle_state(), LifecycleState::Created);
        assert_eq!(client.on_destroy(), Ok(()));
        assert_eq!(client.lifecycle_state(), LifecycleState::Destroyed);

        client.init("wss://rtc.example.com".into()).unwrap();
        assert_eq!(client.join_room("token".into()), Err(BridgeError::HostDestroyed));
    }

    #[test]
    fn audio_endpoints_are_idle_before_a_microphone_is_published() {
        let (client, _dir) = client();
        client.init("wss://rtc.example.com".into()).unwrap();
        assert_eq!(client.push_microphone_frame(vec![0; 480], 48_000, 1), Ok(false));
        assert!(matches!(
            client.push_microphone_frame(vec![0; 480], 48_000, 0),
            Err(BridgeError::Room { .. })
        ));
        assert!(client.pull_speaker_audio(960).is_empty());
    }

    #[test]
    fn dropping_an_initialized_client_closes_its_session() {
        let (client, _dir) = client();
        client.init("wss://rtc.example.com".into()).unwrap();
        client.set_mic_enabled(false).unwrap();
        drop(client);
    }

    #[test]
    fn settings_setters_persist() {
        let (client, _dir) = client();
        client.set_dynacast(true);
        client.set_auto_subscribe(false);
        let s = client.get_settings();
        assert!(s.dynacast);
        assert!(!s.auto_subscribe);
    }

    #[test]
    fn outbound_events_flatten_to_signals() {
        let signal = OutboundSignal::from(OutboundEvent::ParticipantConnected("alice".into()));
        assert_eq!(signal.channel, "participant_connected");
        assert_eq!(signal.payload, "alice");

        let signal = OutboundSignal::from(OutboundEvent::ConnectionError { reason: "timeout".into() });
        assert_eq!(signal.channel, "event");
        assert_eq!(signal.payload, "connection_error");
        assert_eq!(signal.detail.as_deref(), Some("timeout"));

        let signal = OutboundSignal::from(OutboundEvent::TrackSubscribed(TrackInfo {
            sid: "TR_9".into(),
            participant_identity: "bob".into(),
            kind: TrackKind::Audio,
        }));
        assert_eq!(signal.payload, "TrackSubscribed");
        assert_eq!(signal.detail.as_deref(), Some("TR_9"));
    }

    struct Collect(Arc<Mutex<Vec<OutboundSignal>>>);

    impl RoomLinkListener for Collect {
        fn on_signal(&self, signal: OutboundSignal) {
            self.0.lock().unwrap().push(signal);
        }
    }

    #[test]
    fn bridge_listener_forwards_to_ffi_callback() {
        use roomlink_core::BridgeEventListener;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let bridge = BridgeListener {
            ffi_listener: Arc::new(Collect(seen.clone())),
        };
        bridge.on_event(OutboundEvent::Reconnected);
        assert_eq!(seen.lock().unwrap()[0].payload, "reconnected");
    }

    #[test]
    fn panics_become_errors() {
        let result: Result<(), BridgeError> = guarded("boom", || panic!("kaboom"));
        assert_eq!(
            result,
            Err(BridgeError::Panic { msg: "panic in boom: kaboom".into() })
        );
    }

    #[test]
    fn core_errors_convert() {
        assert_eq!(
            BridgeError::from(roomlink_core::BridgeError::Connection("refused".into())),
            BridgeError::Connection { msg: "refused".into() }
        );
    }
}
