use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use livekit::options::TrackPublishOptions;
use livekit::prelude::{Room, RoomEvent, RoomOptions};
use livekit::track::{
    LocalAudioTrack, LocalTrack, RemoteAudioTrack, RemoteTrack, TrackKind as LkTrackKind,
    TrackSource as LkTrackSource,
};
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::audio_stream::native::NativeAudioStream;
use livekit::webrtc::prelude::{AudioSourceOptions, RtcAudioSource};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::AudioPipeline;
use crate::errors::BridgeError;
use crate::events::{TrackInfo, TrackKind};
use crate::settings::{Settings, SettingsStore};
use crate::transport::{RoomConnector, RoomSignal, RoomTransport};

/// Microphone source options matching the platform capture pipeline.
const AUDIO_SAMPLE_RATE: u32 = 48_000;
const AUDIO_CHANNELS: u32 = 1;
const AUDIO_QUEUE_SIZE_MS: u32 = 100;

/// LiveKit room options applied on every connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub auto_subscribe: bool,
    pub adaptive_stream: bool,
    pub dynacast: bool,
}

impl From<&Settings> for ConnectOptions {
    fn from(s: &Settings) -> Self {
        Self {
            auto_subscribe: s.auto_subscribe,
            adaptive_stream: s.adaptive_stream,
            dynacast: s.dynacast,
        }
    }
}

impl ConnectOptions {
    fn room_options(&self) -> RoomOptions {
        let mut options = RoomOptions::default();
        options.auto_subscribe = self.auto_subscribe;
        options.adaptive_stream = self.adaptive_stream;
        options.dynacast = self.dynacast;
        options
    }
}

/// Creates [`LiveKitTransport`]s. Room options are read from the settings
/// store at allocation time, so changes apply from the next `init`.
pub struct LiveKitConnector {
    settings: Arc<SettingsStore>,
    audio: Arc<AudioPipeline>,
}

impl LiveKitConnector {
    pub fn new(settings: Arc<SettingsStore>, audio: Arc<AudioPipeline>) -> Self {
        Self { settings, audio }
    }
}

impl RoomConnector for LiveKitConnector {
    type Transport = LiveKitTransport;

    fn create(&self, url: &str) -> LiveKitTransport {
        LiveKitTransport::new(
            url.to_string(),
            ConnectOptions::from(&self.settings.get()),
            self.audio.clone(),
        )
    }
}

/// A LiveKit room connection.
///
/// `livekit::Room` only exists once connected, so the transport holds it in
/// an `Option` and recreates it on every connect.
pub struct LiveKitTransport {
    url: String,
    options: ConnectOptions,
    room: Mutex<Option<Arc<Room>>>,
    subscriber: Mutex<Option<mpsc::UnboundedSender<RoomSignal>>>,
    active_speakers: Arc<Mutex<Vec<String>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    audio: Arc<AudioPipeline>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LiveKitTransport {
    pub fn new(url: String, options: ConnectOptions, audio: Arc<AudioPipeline>) -> Self {
        Self {
            url,
            options,
            room: Mutex::new(None),
            subscriber: Mutex::new(None),
            active_speakers: Arc::new(Mutex::new(Vec::new())),
            pump: Mutex::new(None),
            audio,
        }
    }

    fn room(&self) -> Result<Arc<Room>, BridgeError> {
        lock(&self.room)
            .clone()
            .ok_or_else(|| BridgeError::Room("not connected".into()))
    }

    fn notify(&self, signal: RoomSignal) {
        if let Some(tx) = lock(&self.subscriber).as_ref() {
            let _ = tx.send(signal);
        }
    }

    /// Publish a microphone track fed by a native audio source.
    async fn publish_microphone(&self, room: &Room) -> Result<(), BridgeError> {
        let source = NativeAudioSource::new(
            AudioSourceOptions {
                echo_cancellation: true,
                noise_suppression: true,
                auto_gain_control: true,
            },
            AUDIO_SAMPLE_RATE,
            AUDIO_CHANNELS,
            AUDIO_QUEUE_SIZE_MS,
        );

        let track = LocalAudioTrack::create_audio_track(
            "microphone",
            RtcAudioSource::Native(source.clone()),
        );

        room.local_participant()
            .publish_track(
                LocalTrack::Audio(track),
                TrackPublishOptions {
                    source: LkTrackSource::Microphone,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BridgeError::Room(format!("publish audio: {e}")))?;

        self.audio.set_capture_source(Some(source));
        tracing::info!("microphone track published");
        Ok(())
    }

    /// Mute or unmute the first local publication from `source`.
    /// Returns false when nothing is published from that source.
    fn set_local_muted(room: &Room, source: LkTrackSource, muted: bool) -> bool {
        let local = room.local_participant();
        let Some(publication) = local
            .track_publications()
            .into_values()
            .find(|p| p.source() == source)
        else {
            return false;
        };
        if muted {
            publication.mute();
        } else {
            publication.unmute();
        }
        true
    }
}

impl RoomTransport for LiveKitTransport {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<RoomSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.subscriber) = Some(tx);
        rx
    }

    async fn connect(&self, token: &str) -> Result<(), BridgeError> {
        tracing::info!("connecting to {}", self.url);

        let (room, events) = match Room::connect(&self.url, token, self.options.room_options()).await {
            Ok(connected) => connected,
            Err(e) => {
                let reason = e.to_string();
                tracing::error!("connect to {} failed: {reason}", self.url);
                self.notify(RoomSignal::ConnectFailed(reason.clone()));
                return Err(BridgeError::Connection(reason));
            }
        };

        *lock(&self.room) = Some(Arc::new(room));
        self.notify(RoomSignal::Connected);

        let subscriber = lock(&self.subscriber).clone();
        let speakers = self.active_speakers.clone();
        let playout = RemotePlayout::new(self.audio.clone());
        let pump = tokio::spawn(pump_events(events, subscriber, speakers, playout));
        if let Some(previous) = lock(&self.pump).replace(pump) {
            previous.abort();
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        let room = lock(&self.room).take();
        if let Some(room) = room {
            tracing::info!("closing room connection to {}", self.url);
            if let Err(e) = room.close().await {
                tracing::warn!("error closing room: {e}");
            }
        }
        lock(&self.active_speakers).clear();
        self.audio.reset();
    }

    async fn set_microphone_enabled(&self, enabled: bool) -> Result<(), BridgeError> {
        let room = self.room()?;
        if !Self::set_local_muted(&room, LkTrackSource::Microphone, !enabled) && enabled {
            self.publish_microphone(&room).await?;
        }
        tracing::info!("microphone enabled: {enabled}");
        Ok(())
    }

    async fn set_camera_enabled(&self, enabled: bool) -> Result<(), BridgeError> {
        let room = self.room()?;
        if !Self::set_local_muted(&room, LkTrackSource::Camera, !enabled) && enabled {
            // Camera frames come from a platform capture pipeline this bridge doesn't own.
            tracing::warn!("camera enable requested but no camera track is published");
        }
        tracing::info!("camera enabled: {enabled}");
        Ok(())
    }

    fn set_speaker_enabled(&self, enabled: bool) {
        // Remembered for audio tracks subscribed later.
        self.audio.set_speaker_enabled(enabled);
        let Ok(room) = self.room() else {
            return;
        };
        for participant in room.remote_participants().values() {
            for publication in participant.track_publications().values() {
                if let Some(RemoteTrack::Audio(track)) = publication.track() {
                    track.rtc_track().set_enabled(enabled);
                }
            }
        }
        tracing::info!("speaker enabled: {enabled}");
    }

    fn set_participant_tracks_enabled(&self, identity: &str, enabled: bool) -> Option<usize> {
        let room = self.room().ok()?;
        let participants = room.remote_participants();
        let participant = participants
            .values()
            .find(|p| p.identity().to_string() == identity)?;

        let publications = participant.track_publications();
        for publication in publications.values() {
            publication.set_enabled(enabled);
        }
        Some(publications.len())
    }

    fn active_speakers(&self) -> Vec<String> {
        lock(&self.active_speakers).clone()
    }
}

/// Decodes each subscribed remote audio track into the playout buffer.
/// Dropping it stops every stream.
struct RemotePlayout {
    audio: Arc<AudioPipeline>,
    streams: HashMap<String, JoinHandle<()>>,
}

impl RemotePlayout {
    fn new(audio: Arc<AudioPipeline>) -> Self {
        Self {
            audio,
            streams: HashMap::new(),
        }
    }

    fn start(&mut self, track: &RemoteAudioTrack) {
        let rtc_track = track.rtc_track();
        rtc_track.set_enabled(self.audio.speaker_enabled());

        let sid = track.sid().to_string();
        let mut stream = NativeAudioStream::new(rtc_track, 48_000, 1);
        let audio = self.audio.clone();
        let task_sid = sid.clone();
        let handle = tokio::spawn(async move {
            tracing::debug!("audio playout started for track {task_sid}");
            while let Some(frame) = stream.next().await {
                audio.play(&frame.data);
            }
            tracing::debug!("audio playout ended for track {task_sid}");
        });
        if let Some(previous) = self.streams.insert(sid, handle) {
            previous.abort();
        }
    }

    fn stop(&mut self, sid: &str) {
        if let Some(handle) = self.streams.remove(sid) {
            handle.abort();
        }
    }
}

impl Drop for RemotePlayout {
    fn drop(&mut self) {
        for (_, handle) in self.streams.drain() {
            handle.abort();
        }
    }
}

/// Forward LiveKit room events to the subscriber until the room closes.
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<RoomEvent>,
    subscriber: Option<mpsc::UnboundedSender<RoomSignal>>,
    active_speakers: Arc<Mutex<Vec<String>>>,
    mut playout: RemotePlayout,
) {
    while let Some(event) = events.recv().await {
        match &event {
            RoomEvent::ActiveSpeakersChanged { speakers } => {
                *lock(&active_speakers) =
                    speakers.iter().map(|p| p.identity().to_string()).collect();
            }
            RoomEvent::TrackSubscribed { track: RemoteTrack::Audio(track), .. } => {
                playout.start(track);
            }
            RoomEvent::TrackUnsubscribed { track, .. } => {
                playout.stop(&track.sid().to_string());
            }
            _ => {}
        }

        let Some(signal) = translate(event) else {
            continue;
        };
        if let Some(tx) = &subscriber {
            if tx.send(signal).is_err() {
                tracing::debug!("room event subscriber gone");
            }
        }
    }
    tracing::info!("room event pump ended");
}

/// Map a LiveKit event to a room signal.
///
/// `Connected` is skipped: the transport reports it itself once the room is
/// stored, so the session never sees it twice.
fn translate(event: RoomEvent) -> Option<RoomSignal> {
    let signal = match event {
        RoomEvent::Connected { .. } => return None,
        RoomEvent::Reconnecting => RoomSignal::Reconnecting,
        RoomEvent::Reconnected => RoomSignal::Reconnected,
        RoomEvent::Disconnected { reason } => RoomSignal::Disconnected {
            reason: format!("{reason:?}"),
        },
        RoomEvent::ParticipantConnected(participant) => {
            RoomSignal::ParticipantConnected(participant.identity().to_string())
        }
        RoomEvent::ParticipantDisconnected(participant) => {
            RoomSignal::ParticipantDisconnected(participant.identity().to_string())
        }
        RoomEvent::TrackSubscribed { track, publication, participant } => {
            let kind = match publication.kind() {
                LkTrackKind::Audio => TrackKind::Audio,
                LkTrackKind::Video => TrackKind::Video,
            };
            RoomSignal::TrackSubscribed(TrackInfo {
                sid: track.sid().to_string(),
                participant_identity: participant.identity().to_string(),
                kind,
            })
        }
        RoomEvent::ActiveSpeakersChanged { speakers } => RoomSignal::ActiveSpeakersChanged(
            speakers.iter().map(|p| p.identity().to_string()).collect(),
        ),
        other => RoomSignal::Unrecognized(event_name(&other)),
    };
    Some(signal)
}

/// Variant name of an event, from its Debug form.
fn event_name(event: &RoomEvent) -> String {
    format!("{event:?}")
        .split(|c: char| !c.is_alphanumeric())
        .next()
        .unwrap_or_default()
        .to_string()
}
