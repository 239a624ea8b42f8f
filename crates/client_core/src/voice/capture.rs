use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::MediaError;

pub const DEFAULT_VOICE_MIME: &str = "audio/webm";
/// Holds shorter than this are treated as accidental taps and discarded.
pub const MIN_VOICE_NOTE: Duration = Duration::from_millis(300);

/// Platform audio recorder. Encoded data arrives out of band through
/// [`VoiceRecorder::push_chunk`].
pub trait CaptureDevice: Send {
    fn start(&mut self) -> Result<(), MediaError>;
    /// Asks the encoder to hand over whatever it still buffers.
    fn request_data(&mut self);
    fn stop(&mut self);

    fn mime_type(&self) -> &str {
        DEFAULT_VOICE_MIME
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Stopping,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceClip {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub duration: Duration,
}

impl VoiceClip {
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn file_name(&self, unix_ms: i64) -> String {
        format!("voice-note-{unix_ms}.webm")
    }
}

/// Press-and-hold recorder.
///
/// `press` starts capture, `release` freezes the duration and asks the device
/// to flush, `finish` stops the device once the flushed chunk has been pushed
/// and yields the clip. `cancel` discards everything until `finish` runs.
pub struct VoiceRecorder<D: CaptureDevice> {
    device: D,
    state: RecorderState,
    chunks: Vec<Vec<u8>>,
    started_at: Option<Instant>,
    duration: Duration,
}

impl<D: CaptureDevice> VoiceRecorder<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            state: RecorderState::Idle,
            chunks: Vec::new(),
            started_at: None,
            duration: Duration::ZERO,
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn press(&mut self, now: Instant) -> Result<(), MediaError> {
        match self.state {
            RecorderState::Recording | RecorderState::Stopping => {
                return Err(MediaError::AlreadyRecording)
            }
            RecorderState::Idle | RecorderState::Cancelled => {}
        }
        self.device.start()?;
        self.chunks.clear();
        self.started_at = Some(now);
        self.duration = Duration::ZERO;
        self.state = RecorderState::Recording;
        debug!("voice: recording started");
        Ok(())
    }

    /// Accepts encoded data while recording or flushing; anything else is
    /// a late chunk from a discarded session.
    pub fn push_chunk(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        if matches!(
            self.state,
            RecorderState::Recording | RecorderState::Stopping
        ) {
            self.chunks.push(chunk);
        }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        match (self.state, self.started_at) {
            (RecorderState::Recording, Some(started)) => now.saturating_duration_since(started),
            (RecorderState::Stopping, _) => self.duration,
            _ => Duration::ZERO,
        }
    }

    pub fn release(&mut self, now: Instant) -> Result<(), MediaError> {
        if self.state != RecorderState::Recording {
            return Err(MediaError::NotRecording);
        }
        self.duration = self
            .started_at
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default();
        self.state = RecorderState::Stopping;
        self.device.request_data();
        Ok(())
    }

    pub fn finish(&mut self) -> Result<VoiceClip, MediaError> {
        if self.state != RecorderState::Stopping {
            return Err(MediaError::NotRecording);
        }
        self.device.stop();
        self.state = RecorderState::Idle;
        self.started_at = None;
        let chunks = std::mem::take(&mut self.chunks);

        if self.duration < MIN_VOICE_NOTE {
            debug!(duration_ms = self.duration.as_millis() as u64, "voice: discarded short recording");
            return Err(MediaError::TooShort(self.duration));
        }
        if chunks.is_empty() {
            return Err(MediaError::Empty);
        }
        Ok(VoiceClip {
            bytes: chunks.concat(),
            mime_type: self.device.mime_type().to_string(),
            duration: self.duration,
        })
    }

    /// Returns `false` when there was nothing to cancel.
    pub fn cancel(&mut self) -> bool {
        if !matches!(
            self.state,
            RecorderState::Recording | RecorderState::Stopping
        ) {
            return false;
        }
        self.device.stop();
        self.chunks.clear();
        self.started_at = None;
        self.duration = Duration::ZERO;
        self.state = RecorderState::Cancelled;
        debug!("voice: recording cancelled");
        true
    }
}

#[cfg(test)]
#[path = "tests/capture_tests.rs"]
mod tests;
