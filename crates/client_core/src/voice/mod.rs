//! Voice notes: press-and-hold capture and single-clip playback.

pub mod capture;
pub mod playback;

pub use capture::{CaptureDevice, RecorderState, VoiceClip, VoiceRecorder, MIN_VOICE_NOTE};
pub use playback::{format_time, AudioOutput, ClipId, ControlIcon, PlaybackManager};
