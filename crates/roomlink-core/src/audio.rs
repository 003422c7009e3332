use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::prelude::AudioFrame;

use crate::errors::BridgeError;

/// Two seconds of 48kHz mono.
const PLAYOUT_CAPACITY: usize = 48_000 * 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded FIFO of decoded remote PCM. When full, the oldest samples are
/// dropped.
pub struct AudioPlayoutBuffer {
    buffer: Mutex<VecDeque<i16>>,
    max_samples: usize,
}

impl AudioPlayoutBuffer {
    pub fn new() -> Self {
        Self::with_capacity(PLAYOUT_CAPACITY)
    }

    fn with_capacity(max_samples: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(max_samples)),
            max_samples,
        }
    }

    pub fn push_samples(&self, samples: &[i16]) {
        let mut buf = lock(&self.buffer);
        buf.extend(samples.iter().copied());
        let overflow = buf.len().saturating_sub(self.max_samples);
        if overflow > 0 {
            buf.drain(..overflow);
        }
    }

    /// Fill `out` from the front of the buffer, zeroing what is left.
    /// Returns the number of real samples written.
    pub fn pull_samples(&self, out: &mut [i16]) -> usize {
        let mut buf = lock(&self.buffer);
        let available = buf.len().min(out.len());
        for (slot, sample) in out.iter_mut().zip(buf.drain(..available)) {
            *slot = sample;
        }
        out[available..].fill(0);
        available
    }

    pub fn clear(&self) {
        lock(&self.buffer).clear();
    }
}

impl Default for AudioPlayoutBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Audio endpoints the host drives: microphone frames in, remote audio out.
///
/// Shared by every transport a connector creates, so the host keeps one
/// handle across re-inits. The capture source exists only while a
/// microphone track is published.
pub struct AudioPipeline {
    source: Mutex<Option<NativeAudioSource>>,
    playout: AudioPlayoutBuffer,
    speaker_enabled: AtomicBool,
}

impl AudioPipeline {
    pub fn new() -> Self {
        Self {
            source: Mutex::new(None),
            playout: AudioPlayoutBuffer::new(),
            speaker_enabled: AtomicBool::new(true),
        }
    }

    pub(crate) fn set_capture_source(&self, source: Option<NativeAudioSource>) {
        *lock(&self.source) = source;
    }

    pub fn is_capturing(&self) -> bool {
        lock(&self.source).is_some()
    }

    /// Feed interleaved PCM from the platform microphone into the published
    /// track. Returns `Ok(false)` when no microphone track is published.
    pub async fn capture(
        &self,
        samples: &[i16],
        sample_rate: u32,
        channels: u32,
    ) -> Result<bool, BridgeError> {
        if channels == 0 || sample_rate == 0 {
            return Err(BridgeError::Room(format!(
                "invalid audio frame: {sample_rate} Hz, {channels} channel(s)"
            )));
        }
        let Some(source) = lock(&self.source).clone() else {
            return Ok(false);
        };
        let frame = AudioFrame {
            data: samples.into(),
            sample_rate,
            num_channels: channels,
            samples_per_channel: samples.len() as u32 / channels,
        };
        source
            .capture_frame(&frame)
            .await
            .map_err(|e| BridgeError::Room(format!("capture frame: {e:?}")))?;
        Ok(true)
    }

    pub fn speaker_enabled(&self) -> bool {
        self.speaker_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_speaker_enabled(&self, enabled: bool) {
        self.speaker_enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.playout.clear();
        }
    }

    /// Queue decoded remote audio, dropped while the speaker is off.
    pub(crate) fn play(&self, samples: &[i16]) {
        if self.speaker_enabled() {
            self.playout.push_samples(samples);
        }
    }

    /// Up to `capacity` samples of remote audio for the platform output.
    pub fn pull_playout(&self, capacity: usize) -> Vec<i16> {
        let mut out = vec![0; capacity];
        let pulled = self.playout.pull_samples(&mut out);
        out.truncate(pulled);
        out
    }

    /// Drop buffered audio and the capture source when a connection ends.
    pub(crate) fn reset(&self) {
        self.set_capture_source(None);
        self.playout.clear();
    }
}

impl Default for AudioPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_drains_in_order_and_pads_with_silence() {
        let buf = AudioPlayoutBuffer::new();
        buf.push_samples(&[100, 200, 300, 400, 500]);

        let mut out = vec![0i16; 3];
        assert_eq!(buf.pull_samples(&mut out), 3);
        assert_eq!(out, vec![100, 200, 300]);

        let mut out = vec![7i16; 5];
        assert_eq!(buf.pull_samples(&mut out), 2);
        assert_eq!(out, vec![400, 500, 0, 0, 0]);
    }

    #[test]
    fn full_buffer_drops_oldest_samples() {
        let buf = AudioPlayoutBuffer::with_capacity(4);
        buf.push_samples(&[1, 2, 3, 4]);
        buf.push_samples(&[5, 6]);

        let mut out = vec![0i16; 6];
        assert_eq!(buf.pull_samples(&mut out), 4);
        assert_eq!(out, vec![3, 4, 5, 6, 0, 0]);
    }

    #[test]
    fn muted_speaker_discards_remote_audio() {
        let audio = AudioPipeline::new();
        audio.play(&[1, 2]);
        audio.set_speaker_enabled(false);
        assert!(audio.pull_playout(8).is_empty());

        audio.play(&[3, 4]);
        assert!(audio.pull_playout(8).is_empty());

        audio.set_speaker_enabled(true);
        audio.play(&[5, 6, 7]);
        assert_eq!(audio.pull_playout(2), vec![5, 6]);
        assert_eq!(audio.pull_playout(8), vec![7]);
    }

    #[test]
    fn reset_clears_pending_playout() {
        let audio = AudioPipeline::new();
        audio.play(&[1, 2, 3]);
        audio.reset();
        assert!(audio.pull_playout(3).is_empty());
        assert!(!audio.is_capturing());
    }

    #[tokio::test]
    async fn capture_without_published_microphone_is_skipped() {
        let audio = AudioPipeline::new();
        assert_eq!(audio.capture(&[0; 480], 48_000, 1).await, Ok(false));
    }

    #[tokio::test]
    async fn capture_rejects_malformed_frames() {
        let audio = AudioPipeline::new();
        assert!(matches!(
            audio.capture(&[0; 480], 48_000, 0).await,
            Err(BridgeError::Room(_))
        ));
        assert!(matches!(
            audio.capture(&[0; 480], 0, 1).await,
            Err(BridgeError::Room(_))
        ));
    }
}
