use std::collections::HashMap;

use tracing::debug;

use crate::error::MediaError;

/// One playable clip as exposed by the platform audio stack. Times are in
/// seconds and may be NaN or infinite until metadata has loaded.
pub trait AudioOutput: Send {
    fn play(&mut self) -> Result<(), MediaError>;
    fn pause(&mut self);
    fn seek(&mut self, seconds: f64);
    fn current_time(&self) -> f64;
    fn duration(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClipId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlIcon {
    Play,
    Pause,
}

struct Clip {
    output: Box<dyn AudioOutput>,
    icon: ControlIcon,
}

/// Owner of the single "currently playing" slot for the whole chat view.
///
/// Clips are registered once; `acquire` evicts whichever clip holds the slot
/// (pause, rewind, icon back to Play) before starting the new one.
#[derive(Default)]
pub struct PlaybackManager {
    clips: HashMap<ClipId, Clip>,
    playing: Option<ClipId>,
    next_id: u64,
}

impl PlaybackManager {
    pub fn register(&mut self, output: Box<dyn AudioOutput>) -> ClipId {
        self.next_id += 1;
        let id = ClipId(self.next_id);
        self.clips.insert(
            id,
            Clip {
                output,
                icon: ControlIcon::Play,
            },
        );
        id
    }

    pub fn unregister(&mut self, id: ClipId) {
        self.release(id);
        self.clips.remove(&id);
    }

    pub fn playing(&self) -> Option<ClipId> {
        self.playing
    }

    pub fn icon(&self, id: ClipId) -> Option<ControlIcon> {
        self.clips.get(&id).map(|clip| clip.icon)
    }

    /// Starts `id`. A rejected play leaves the slot empty and is not an error.
    pub fn acquire(&mut self, id: ClipId) -> bool {
        if !self.clips.contains_key(&id) {
            return false;
        }
        if self.playing == Some(id) {
            return true;
        }
        if let Some(previous) = self.playing.take() {
            if let Some(clip) = self.clips.get_mut(&previous) {
                clip.output.pause();
                clip.output.seek(0.0);
                clip.icon = ControlIcon::Play;
            }
        }

        let Some(clip) = self.clips.get_mut(&id) else {
            return false;
        };
        match clip.output.play() {
            Ok(()) => {
                clip.icon = ControlIcon::Pause;
                self.playing = Some(id);
                true
            }
            Err(err) => {
                debug!(%err, "voice: playback rejected");
                clip.icon = ControlIcon::Play;
                false
            }
        }
    }

    /// Pauses `id` if it holds the slot.
    pub fn release(&mut self, id: ClipId) {
        if self.playing != Some(id) {
            return;
        }
        self.playing = None;
        if let Some(clip) = self.clips.get_mut(&id) {
            clip.output.pause();
            clip.icon = ControlIcon::Play;
        }
    }

    pub fn toggle(&mut self, id: ClipId) -> bool {
        if self.playing == Some(id) {
            self.release(id);
            false
        } else {
            self.acquire(id)
        }
    }

    pub fn on_ended(&mut self, id: ClipId) {
        if self.playing == Some(id) {
            self.playing = None;
        }
        if let Some(clip) = self.clips.get_mut(&id) {
            clip.output.seek(0.0);
            clip.icon = ControlIcon::Play;
        }
    }

    /// Seeks to `percent` of the clip. Skipped while the duration is unknown.
    pub fn seek_percent(&mut self, id: ClipId, percent: f64) -> bool {
        let Some(clip) = self.clips.get_mut(&id) else {
            return false;
        };
        let duration = clip.output.duration();
        if !duration.is_finite() || duration <= 0.0 || !percent.is_finite() {
            return false;
        }
        clip.output.seek(duration * percent.clamp(0.0, 100.0) / 100.0);
        true
    }

    /// Slider position in percent, or `None` while times are not usable.
    pub fn progress(&self, id: ClipId) -> Option<f64> {
        let clip = self.clips.get(&id)?;
        let duration = clip.output.duration();
        let current = clip.output.current_time();
        if !duration.is_finite() || duration <= 0.0 || !current.is_finite() {
            return None;
        }
        Some((current / duration * 100.0).clamp(0.0, 100.0))
    }

    /// `(current, total)` labels; each is `None` while its value is unusable.
    pub fn time_labels(&self, id: ClipId) -> Option<(Option<String>, Option<String>)> {
        let clip = self.clips.get(&id)?;
        Some((
            format_time(clip.output.current_time()),
            format_time(clip.output.duration()),
        ))
    }
}

/// `m:ss`, or `None` for NaN, infinite or negative input.
pub fn format_time(seconds: f64) -> Option<String> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let total = seconds.floor() as u64;
    Some(format!("{}:{:02}", total / 60, total % 60))
}

#[cfg(test)]
#[path = "tests/playback_tests.rs"]
mod tests;
