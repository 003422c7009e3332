use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::errors::BridgeError;
use crate::events::{BridgeEventListener, EventEmitter, OutboundEvent, TrackKind};
use crate::lifecycle::{CallingThread, HostLifecycle, LifecycleReporter, LifecycleState, MainThread};
use crate::transport::{NoVideo, RoomConnector, RoomSignal, RoomTransport, VideoRenderer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initialized, not in a room.
    Idle,
    Joining,
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
}

impl SessionState {
    /// Joining or in a room: leaving has something to disconnect.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Joining | Self::Connected | Self::Reconnecting)
    }
}

/// Local publish/playback switches to push to the transport, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaUpdate {
    Microphone(bool),
    Camera(bool),
    Speaker(bool),
}

/// State shared between the command thread and the session's event loop.
#[derive(Debug)]
struct Shared {
    state: SessionState,
    mic_enabled: bool,
    camera_enabled: bool,
    speaker_enabled: bool,
    /// Bumped on every join and leave; an event loop only applies signals
    /// while the generation it was started with is current.
    generation: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Background tasks of one join. Dropping cancels them.
struct TaskGroup {
    cancel_tx: watch::Sender<bool>,
    media_tx: mpsc::UnboundedSender<MediaUpdate>,
    handles: Vec<JoinHandle<()>>,
}

impl TaskGroup {
    /// Cancel every task and hand back their handles so the caller can wait
    /// for them to stop.
    fn shutdown(mut self) -> Vec<JoinHandle<()>> {
        let _ = self.cancel_tx.send(true);
        let handles = std::mem::take(&mut self.handles);
        for handle in &handles {
            handle.abort();
        }
        handles
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        let _ = self.cancel_tx.send(true);
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

/// Close the connection once the join's tasks have stopped, so a connect
/// that completes mid-cancel cannot leave a room attached behind it.
async fn teardown<T: RoomTransport>(handles: Vec<JoinHandle<()>>, transport: Arc<T>) {
    for handle in handles {
        let _ = handle.await;
    }
    transport.disconnect().await;
}

struct Session<T> {
    url: String,
    transport: Arc<T>,
    shared: Arc<Mutex<Shared>>,
    /// Held by whoever is notifying listeners for this session. Leave takes
    /// it before its `disconnected`, so an event loop notification already
    /// past its generation check lands first.
    emit_gate: Arc<Mutex<()>>,
    tasks: Option<TaskGroup>,
}

impl<T> Session<T> {
    fn new(url: String, transport: T) -> Self {
        Self {
            url,
            transport: Arc::new(transport),
            shared: Arc::new(Mutex::new(Shared {
                state: SessionState::Idle,
                mic_enabled: false,
                camera_enabled: false,
                speaker_enabled: true,
                generation: 0,
            })),
            emit_gate: Arc::new(Mutex::new(())),
            tasks: None,
        }
    }

    /// Forward a media switch while in a room. Before that it stays buffered
    /// in the shared flags.
    fn push_media(&self, update: MediaUpdate) {
        if let Some(tasks) = &self.tasks {
            let _ = tasks.media_tx.send(update);
        }
    }
}

/// Owns the single room session and its command surface.
///
/// Commands are called from the host's command thread and never block:
/// they mutate state and hand asynchronous work to the session's task
/// group on the runtime. Notifications reach listeners from runtime threads.
pub struct SessionManager<C: RoomConnector> {
    connector: C,
    runtime: Handle,
    emitter: EventEmitter,
    lifecycle: HostLifecycle,
    main_thread: Arc<dyn MainThread>,
    renderer: Arc<dyn VideoRenderer>,
    session: Mutex<Option<Session<C::Transport>>>,
}

impl<C: RoomConnector> SessionManager<C> {
    pub fn new(connector: C, runtime: Handle) -> Self {
        Self {
            connector,
            runtime,
            emitter: EventEmitter::new(),
            lifecycle: HostLifecycle::new(),
            main_thread: Arc::new(CallingThread),
            renderer: Arc::new(NoVideo),
            session: Mutex::new(None),
        }
    }

    pub fn with_main_thread(mut self, main_thread: Arc<dyn MainThread>) -> Self {
        self.main_thread = main_thread;
        self
    }

    pub fn with_video_renderer(mut self, renderer: Arc<dyn VideoRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn add_listener(&self, listener: Arc<dyn BridgeEventListener>) {
        self.emitter.add_listener(listener);
    }

    pub fn lifecycle(&self) -> &HostLifecycle {
        &self.lifecycle
    }

    /// Set the server URL and allocate the connection, replacing any
    /// existing session.
    pub fn init(&self, url: &str) -> Result<(), BridgeError> {
        let url = validate_server_url(url)?;
        let session = Session::new(url.clone(), self.connector.create(&url));
        let previous = lock(&self.session).replace(session);
        if let Some(previous) = previous {
            tracing::info!("replacing session for {}", previous.url);
            let _ = self.release(previous);
        }
        tracing::info!("session initialized for {url}");
        Ok(())
    }

    pub fn set_mic_enabled(&self, enabled: bool) -> Result<(), BridgeError> {
        self.set_media(MediaUpdate::Microphone(enabled))
    }

    pub fn set_camera_enabled(&self, enabled: bool) -> Result<(), BridgeError> {
        self.set_media(MediaUpdate::Camera(enabled))
    }

    pub fn set_speaker_enabled(&self, enabled: bool) -> Result<(), BridgeError> {
        self.set_media(MediaUpdate::Speaker(enabled))
    }

    fn set_media(&self, update: MediaUpdate) -> Result<(), BridgeError> {
        let guard = lock(&self.session);
        let session = guard.as_ref().ok_or(BridgeError::NotInitialized)?;
        let connected = {
            let mut shared = lock(&session.shared);
            match update {
                MediaUpdate::Microphone(enabled) => shared.mic_enabled = enabled,
                MediaUpdate::Camera(enabled) => shared.camera_enabled = enabled,
                MediaUpdate::Speaker(enabled) => shared.speaker_enabled = enabled,
            }
            shared.state == SessionState::Connected
        };
        tracing::debug!("{update:?} (connected: {connected})");
        if connected {
            session.push_media(update);
        }
        Ok(())
    }

    /// Start joining the room. Returns once the connect is under way; the
    /// outcome arrives as a `connected` or `connection_error` notification.
    pub fn join_room(&self, token: &str) -> Result<(), BridgeError> {
        let mut guard = lock(&self.session);
        let session = guard.as_mut().ok_or(BridgeError::NotInitialized)?;
        if self.lifecycle.is_destroyed() {
            return Err(BridgeError::HostDestroyed);
        }

        let generation = {
            let mut shared = lock(&session.shared);
            if shared.state.is_active() {
                tracing::warn!("join_room ignored: session is {:?}", shared.state);
                return Ok(());
            }
            shared.state = SessionState::Joining;
            shared.generation += 1;
            shared.generation
        };
        tracing::info!("joining room at {}", session.url);

        // Replace a finished join's tasks (after Disconnected or Failed).
        session.tasks = None;

        // Subscribe before the connect task exists so no early signal is lost.
        let events = session.transport.subscribe();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (media_tx, media_rx) = mpsc::unbounded_channel();

        let event_loop = EventLoop {
            generation,
            shared: session.shared.clone(),
            emit_gate: session.emit_gate.clone(),
            emitter: self.emitter.clone(),
            renderer: self.renderer.clone(),
            media_tx: media_tx.clone(),
        };
        let event_task = self.runtime.spawn(event_loop.run(
            events,
            cancel_rx,
            self.lifecycle.subscribe(),
        ));
        let connect_task = self.runtime.spawn(connect_and_sync(
            session.transport.clone(),
            token.to_string(),
            media_rx,
        ));

        session.tasks = Some(TaskGroup {
            cancel_tx,
            media_tx,
            handles: vec![event_task, connect_task],
        });
        Ok(())
    }

    /// Leave the room and return to `Idle`. Calling it again is a no-op.
    pub fn leave_room(&self) -> Result<(), BridgeError> {
        let mut guard = lock(&self.session);
        let session = guard.as_mut().ok_or(BridgeError::NotInitialized)?;

        let previous = {
            let mut shared = lock(&session.shared);
            let previous = shared.state;
            shared.state = SessionState::Idle;
            shared.generation += 1;
            previous
        };
        let Some(tasks) = session.tasks.take() else {
            tracing::debug!("leave_room: not in a room");
            return Ok(());
        };

        tracing::info!("disconnecting from {}", session.url);
        let handles = tasks.shutdown();
        let transport = session.transport.clone();
        let emit_gate = session.emit_gate.clone();
        drop(guard);

        self.runtime.spawn(teardown(handles, transport));
        let _emitting = lock(&emit_gate);
        if previous.is_active() {
            self.emitter.emit(OutboundEvent::Disconnected);
        }
        Ok(())
    }

    pub fn mute_participant(&self, identity: &str) -> Result<(), BridgeError> {
        self.set_participant_enabled(identity, false)
    }

    pub fn unmute_participant(&self, identity: &str) -> Result<(), BridgeError> {
        self.set_participant_enabled(identity, true)
    }

    fn set_participant_enabled(&self, identity: &str, enabled: bool) -> Result<(), BridgeError> {
        let transport = self.transport()?;
        match transport.set_participant_tracks_enabled(identity, enabled) {
            Some(count) => {
                tracing::info!("{count} track(s) of {identity} set enabled={enabled}")
            }
            None => tracing::debug!("participant {identity} not found"),
        }
        Ok(())
    }

    /// Identities of the current speakers, in the connection's ranking.
    pub fn active_speakers(&self) -> Result<Vec<String>, BridgeError> {
        Ok(self.transport()?.active_speakers())
    }

    pub fn session_state(&self) -> Result<SessionState, BridgeError> {
        self.read_shared(|s| s.state)
    }

    pub fn is_mic_enabled(&self) -> Result<bool, BridgeError> {
        self.read_shared(|s| s.mic_enabled)
    }

    pub fn is_camera_enabled(&self) -> Result<bool, BridgeError> {
        self.read_shared(|s| s.camera_enabled)
    }

    pub fn is_speaker_enabled(&self) -> Result<bool, BridgeError> {
        self.read_shared(|s| s.speaker_enabled)
    }

    pub fn on_start(&self) {
        self.report_on_main(LifecycleState::Started);
    }

    pub fn on_resume(&self) {
        self.report_on_main(LifecycleState::Resumed);
    }

    pub fn on_pause(&self) {
        self.report_on_main(LifecycleState::Started);
    }

    pub fn on_stop(&self) {
        self.report_on_main(LifecycleState::Created);
    }

    /// Host teardown: ends the lifecycle and releases the session without
    /// further notifications.
    pub fn on_destroy(&self) {
        self.report_on_main(LifecycleState::Destroyed);
        let session = lock(&self.session).take();
        if let Some(session) = session {
            tracing::info!("host destroyed, releasing session for {}", session.url);
            let _ = self.release(session);
        }
    }

    fn report_on_main(&self, state: LifecycleState) {
        let lifecycle = self.lifecycle.clone();
        self.main_thread.run_on_main(Box::new(move || {
            let was_active = lifecycle.is_active();
            lifecycle.report_lifecycle_state(state);
            match (was_active, lifecycle.is_active()) {
                (true, false) => tracing::info!("host moved to background"),
                (false, true) => tracing::info!("host moved to foreground"),
                _ => {}
            }
        }));
    }

    /// Drop the session and disconnect it in the background. Returns once no
    /// notification of it can still be delivered.
    fn release(&self, mut session: Session<C::Transport>) -> JoinHandle<()> {
        lock(&session.shared).generation += 1;
        let handles = session
            .tasks
            .take()
            .map(TaskGroup::shutdown)
            .unwrap_or_default();
        drop(lock(&session.emit_gate));
        self.runtime.spawn(teardown(handles, session.transport))
    }

    /// Release the session for good, e.g. when the owner is shutting down.
    /// The returned task finishes once the connection is closed.
    pub fn close(&self) -> Option<JoinHandle<()>> {
        let session = lock(&self.session).take()?;
        tracing::info!("closing session for {}", session.url);
        Some(self.release(session))
    }

    fn transport(&self) -> Result<Arc<C::Transport>, BridgeError> {
        lock(&self.session)
            .as_ref()
            .map(|s| s.transport.clone())
            .ok_or(BridgeError::NotInitialized)
    }

    fn read_shared<R>(&self, read: impl FnOnce(&Shared) -> R) -> Result<R, BridgeError> {
        let guard = lock(&self.session);
        let session = guard.as_ref().ok_or(BridgeError::NotInitialized)?;
        let shared = lock(&session.shared);
        Ok(read(&shared))
    }
}

impl<C: RoomConnector> Drop for SessionManager<C> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Accepts `ws`, `wss`, `http` and `https` URLs with a host.
fn validate_server_url(url: &str) -> Result<String, BridgeError> {
    let parsed = url::Url::parse(url.trim()).map_err(|e| BridgeError::InvalidUrl(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" | "http" | "https" if parsed.host_str().is_some() => Ok(url.trim().to_string()),
        scheme => Err(BridgeError::InvalidUrl(format!(
            "{url}: unsupported scheme {scheme:?} or missing host"
        ))),
    }
}

/// Outcome of one room signal applied to the session state.
#[derive(Debug, PartialEq, Eq)]
struct Step {
    next: SessionState,
    event: Option<OutboundEvent>,
    /// Apply the join-time publish policy: microphone on, camera off.
    publish_defaults: bool,
    /// Push the current media switches again after a reconnect.
    resync_media: bool,
    /// The signal ends this join's event stream.
    finished: bool,
}

fn step(state: SessionState, signal: RoomSignal) -> Step {
    let mut step = Step {
        next: state,
        event: None,
        publish_defaults: false,
        resync_media: false,
        finished: false,
    };
    match signal {
        RoomSignal::Connected => {
            step.publish_defaults = state == SessionState::Joining;
            step.next = SessionState::Connected;
            step.event = Some(OutboundEvent::Connected);
        }
        RoomSignal::ConnectFailed(reason) => {
            tracing::warn!("connection failed: {reason}");
            step.next = SessionState::Failed;
            step.event = Some(OutboundEvent::ConnectionError { reason });
            step.finished = true;
        }
        RoomSignal::Reconnecting => {
            if state == SessionState::Connected {
                step.next = SessionState::Reconnecting;
            }
            step.event = Some(OutboundEvent::Reconnecting);
        }
        RoomSignal::Reconnected => {
            if state == SessionState::Reconnecting {
                step.next = SessionState::Connected;
                step.resync_media = true;
            }
            step.event = Some(OutboundEvent::Reconnected);
        }
        RoomSignal::Disconnected { reason } => {
            tracing::info!("room disconnected: {reason}");
            step.next = match state {
                SessionState::Reconnecting => SessionState::Failed,
                _ => SessionState::Disconnected,
            };
            step.event = Some(OutboundEvent::Disconnected);
            step.finished = true;
        }
        RoomSignal::ParticipantConnected(identity) => {
            step.event = Some(OutboundEvent::ParticipantConnected(identity));
        }
        RoomSignal::ParticipantDisconnected(identity) => {
            step.event = Some(OutboundEvent::ParticipantDisconnected(identity));
        }
        RoomSignal::TrackSubscribed(info) => {
            step.event = Some(OutboundEvent::TrackSubscribed(info));
        }
        RoomSignal::ActiveSpeakersChanged(speakers) => {
            tracing::debug!("active speakers: {speakers:?}");
        }
        RoomSignal::Unrecognized(kind) => {
            tracing::debug!("unhandled room event: {kind}");
        }
    }
    step
}

struct EventLoop {
    generation: u64,
    shared: Arc<Mutex<Shared>>,
    emit_gate: Arc<Mutex<()>>,
    emitter: EventEmitter,
    renderer: Arc<dyn VideoRenderer>,
    media_tx: mpsc::UnboundedSender<MediaUpdate>,
}

impl EventLoop {
    async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<RoomSignal>,
        mut cancel_rx: watch::Receiver<bool>,
        mut lifecycle_rx: watch::Receiver<LifecycleState>,
    ) {
        loop {
            let signal = tokio::select! {
                biased;
                _ = cancel_rx.changed() => break,
                _ = host_destroyed(&mut lifecycle_rx) => break,
                signal = events.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };
            if !self.dispatch(signal) {
                break;
            }
        }
        tracing::info!("room event loop ended");
    }

    /// Apply one signal; returns false once the loop should stop.
    fn dispatch(&self, signal: RoomSignal) -> bool {
        let _emitting = lock(&self.emit_gate);
        let (step, media) = {
            let mut shared = lock(&self.shared);
            if shared.generation != self.generation {
                return false;
            }
            let step = step(shared.state, signal);
            shared.state = step.next;
            if step.publish_defaults {
                shared.mic_enabled = true;
                shared.camera_enabled = false;
            }
            let media = (step.publish_defaults || step.resync_media).then(|| {
                [
                    MediaUpdate::Microphone(shared.mic_enabled),
                    MediaUpdate::Camera(shared.camera_enabled),
                    MediaUpdate::Speaker(shared.speaker_enabled),
                ]
            });
            (step, media)
        };

        for update in media.into_iter().flatten() {
            let _ = self.media_tx.send(update);
        }
        if let Some(OutboundEvent::TrackSubscribed(info)) = &step.event {
            if info.kind == TrackKind::Video {
                self.renderer.attach_video(info);
            }
        }
        if let Some(event) = step.event {
            self.emitter.emit(event);
        }
        !step.finished
    }
}

/// Resolves once the host lifecycle reaches `Destroyed` (or its owner is gone).
async fn host_destroyed(lifecycle_rx: &mut watch::Receiver<LifecycleState>) {
    let _ = lifecycle_rx
        .wait_for(|s| *s == LifecycleState::Destroyed)
        .await;
}

/// Connect, then push local media switches to the transport in order.
async fn connect_and_sync<T: RoomTransport>(
    transport: Arc<T>,
    token: String,
    mut media_rx: mpsc::UnboundedReceiver<MediaUpdate>,
) {
    if let Err(e) = transport.connect(&token).await {
        tracing::warn!("join failed: {e}");
        return;
    }
    while let Some(update) = media_rx.recv().await {
        let result = match update {
            MediaUpdate::Microphone(enabled) => transport.set_microphone_enabled(enabled).await,
            MediaUpdate::Camera(enabled) => transport.set_camera_enabled(enabled).await,
            MediaUpdate::Speaker(enabled) => {
                transport.set_speaker_enabled(enabled);
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!("failed to apply {update:?}: {e}");
        }
    }
}
