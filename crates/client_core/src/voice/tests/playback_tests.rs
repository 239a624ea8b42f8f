use std::sync::{Arc, Mutex};

use super::*;

#[derive(Debug, Default)]
struct FakeState {
    playing: bool,
    position: f64,
    duration: f64,
    reject_play: bool,
}

#[derive(Clone)]
struct FakeOutput(Arc<Mutex<FakeState>>);

impl FakeOutput {
    fn with_duration(duration: f64) -> Self {
        Self(Arc::new(Mutex::new(FakeState {
            duration,
            ..FakeState::default()
        })))
    }

    fn is_playing(&self) -> bool {
        self.0.lock().expect("lock").playing
    }

    fn position(&self) -> f64 {
        self.0.lock().expect("lock").position
    }
}

impl AudioOutput for FakeOutput {
    fn play(&mut self) -> Result<(), MediaError> {
        let mut state = self.0.lock().expect("lock");
        if state.reject_play {
            return Err(MediaError::PlaybackRejected("autoplay blocked".into()));
        }
        state.playing = true;
        Ok(())
    }

    fn pause(&mut self) {
        self.0.lock().expect("lock").playing = false;
    }

    fn seek(&mut self, seconds: f64) {
        self.0.lock().expect("lock").position = seconds;
    }

    fn current_time(&self) -> f64 {
        self.0.lock().expect("lock").position
    }

    fn duration(&self) -> f64 {
        self.0.lock().expect("lock").duration
    }
}

#[test]
fn starting_a_clip_evicts_the_previous_one() {
    let mut manager = PlaybackManager::default();
    let first = FakeOutput::with_duration(10.0);
    let second = FakeOutput::with_duration(20.0);
    let first_id = manager.register(Box::new(first.clone()));
    let second_id = manager.register(Box::new(second.clone()));

    assert!(manager.acquire(first_id));
    manager.seek_percent(first_id, 50.0);
    assert_eq!(manager.icon(first_id), Some(ControlIcon::Pause));

    assert!(manager.acquire(second_id));
    assert!(!first.is_playing());
    assert_eq!(first.position(), 0.0);
    assert_eq!(manager.icon(first_id), Some(ControlIcon::Play));
    assert!(second.is_playing());
    assert_eq!(manager.playing(), Some(second_id));
}

#[test]
fn at_most_one_clip_plays_across_many_toggles() {
    let mut manager = PlaybackManager::default();
    let outputs: Vec<FakeOutput> = (0..4).map(|_| FakeOutput::with_duration(5.0)).collect();
    let ids: Vec<ClipId> = outputs
        .iter()
        .map(|output| manager.register(Box::new(output.clone())))
        .collect();

    for step in [0usize, 2, 1, 1, 3, 0, 2] {
        manager.toggle(ids[step]);
        let playing = outputs.iter().filter(|output| output.is_playing()).count();
        assert!(playing <= 1, "{playing} clips playing after toggling {step}");
    }
}

#[test]
fn rejected_play_is_swallowed() {
    let mut manager = PlaybackManager::default();
    let blocked = FakeOutput::with_duration(3.0);
    blocked.0.lock().expect("lock").reject_play = true;
    let id = manager.register(Box::new(blocked.clone()));

    assert!(!manager.acquire(id));
    assert_eq!(manager.playing(), None);
    assert_eq!(manager.icon(id), Some(ControlIcon::Play));
}

#[test]
fn ended_clip_rewinds_and_frees_slot() {
    let mut manager = PlaybackManager::default();
    let output = FakeOutput::with_duration(8.0);
    let id = manager.register(Box::new(output.clone()));
    manager.acquire(id);
    manager.seek_percent(id, 100.0);
    manager.on_ended(id);
    assert_eq!(manager.playing(), None);
    assert_eq!(output.position(), 0.0);
    assert_eq!(manager.icon(id), Some(ControlIcon::Play));
}

#[test]
fn seek_and_progress_skip_unknown_duration() {
    let mut manager = PlaybackManager::default();
    let loading = FakeOutput::with_duration(f64::NAN);
    let id = manager.register(Box::new(loading.clone()));
    assert!(!manager.seek_percent(id, 40.0));
    assert_eq!(manager.progress(id), None);
    assert_eq!(manager.time_labels(id), Some((Some("0:00".to_string()), None)));

    loading.0.lock().expect("lock").duration = 200.0;
    assert!(manager.seek_percent(id, 25.0));
    assert_eq!(loading.position(), 50.0);
    assert_eq!(manager.progress(id), Some(25.0));
}

#[test]
fn unregistering_the_playing_clip_frees_slot() {
    let mut manager = PlaybackManager::default();
    let output = FakeOutput::with_duration(8.0);
    let id = manager.register(Box::new(output.clone()));
    manager.acquire(id);
    manager.unregister(id);
    assert_eq!(manager.playing(), None);
    assert!(!output.is_playing());
    assert_eq!(manager.icon(id), None);
}

#[test]
fn format_time_guards_against_garbage() {
    assert_eq!(format_time(0.0).as_deref(), Some("0:00"));
    assert_eq!(format_time(3.7).as_deref(), Some("0:03"));
    assert_eq!(format_time(125.2).as_deref(), Some("2:05"));
    assert_eq!(format_time(f64::NAN), None);
    assert_eq!(format_time(f64::INFINITY), None);
    assert_eq!(format_time(-1.0), None);
}
