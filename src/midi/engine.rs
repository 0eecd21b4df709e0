//! Engine handle: owns the player guard and the audio thread.
//!
//! The audio thread loops `tick()` + input polling under the single player
//! mutex; the UI thread calls everything else on this handle. The guard is
//! released around every slow step (file opens, length scans, cache
//! persists) so a multi-second scan never freezes the audio loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::PlayerError;
use crate::storage::cache::LengthCache;
use crate::storage::reader::{BlockReader, FileReader};
use crate::storage::settings::{GlobalSettings, TrackSettings};

use super::input::InputRouter;
use super::output::MidiOut;
use super::parser::MidiFileParser;
use super::player::{Player, PlayerState, PlayerStatus, DEFAULT_TEMPO_PERCENT};

/// Audio-loop cadence: tight while playing, relaxed while idle.
const ACTIVE_TICK: Duration = Duration::from_millis(1);
const IDLE_TICK: Duration = Duration::from_millis(50);

/// Wait after stop before tearing a file down, so an in-flight sysex
/// burst finishes transmitting.
const LOAD_SETTLE: Duration = Duration::from_millis(100);

/// Playback engine handle. Create one, keep it alive for the life of the
/// process; dropping it stops the audio thread.
pub struct PlayerEngine {
    player: Arc<Mutex<Player>>,
    router: Arc<InputRouter>,
    cache: Mutex<LengthCache>,
    should_stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PlayerEngine {
    /// Spawn the audio thread around `out`. The length cache persists at
    /// `cache_path`.
    pub fn new(out: Arc<dyn MidiOut>, cache_path: impl Into<PathBuf>) -> Self {
        let player = Arc::new(Mutex::new(Player::new(Arc::clone(&out))));
        let router = Arc::new(InputRouter::new(out));
        let should_stop = Arc::new(AtomicBool::new(false));

        let thread_player = Arc::clone(&player);
        let thread_router = Arc::clone(&router);
        let thread_stop = Arc::clone(&should_stop);
        let thread = thread::spawn(move || {
            audio_thread(thread_player, thread_router, thread_stop);
        });

        Self {
            player,
            router,
            cache: Mutex::new(LengthCache::new(cache_path)),
            should_stop,
            thread: Some(thread),
        }
    }

    /// The shared player guard, for UI code that needs compound mutations
    /// under one lock.
    pub fn player(&self) -> Arc<Mutex<Player>> {
        Arc::clone(&self.player)
    }

    /// The input router (mode switches, byte queue handle).
    pub fn router(&self) -> Arc<InputRouter> {
        Arc::clone(&self.router)
    }

    // ------------------------------------------------------------------
    // File lifecycle (UI thread)
    // ------------------------------------------------------------------

    /// Full load flow: tear down the old file, open and scan the new one,
    /// resolve its length through the cache and apply its settings record.
    pub fn load_path(&self, path: &Path) -> Result<(), PlayerError> {
        log::info!("loading {}", path.display());

        // Stop without rewinding; the file is going away anyway.
        self.player.lock().stop(false);
        // Let any in-flight event finish on the wire before the reset.
        thread::sleep(LOAD_SETTLE);
        {
            let mut player = self.player.lock();
            player.reset_midi_device();
            player.unload_file();
        }

        // All file I/O happens with the guard released.
        let reader = FileReader::open(path)?;
        let mtime = reader.mtime();

        {
            let mut player = self.player.lock();
            player.load_file(Box::new(reader))?;
            player.scan_initial_tempo()?;
        }

        let name = basename(path);
        let cached = self.cache.lock().lookup(&name, mtime);
        let (length_ticks, sysex_count) = match cached {
            Some(hit) => hit,
            None => {
                // Scan with a scratch parser on a second reader so the
                // guard stays free; large files take seconds here.
                let mut scratch = MidiFileParser::new();
                scratch.open(Box::new(FileReader::open(path)?))?;
                scratch.calculate_length()?;
                let result = (scratch.length_ticks(), scratch.sysex_count());
                if result.0 > 0 {
                    self.cache.lock().insert(&name, mtime, result.0, result.1);
                }
                result
            }
        };

        let settings = TrackSettings::load(&TrackSettings::path_for(path));
        {
            let mut player = self.player.lock();
            player.set_cached_length(length_ticks, sysex_count);
            player.reset_channel_defaults();
            player.set_tempo_percent(DEFAULT_TEMPO_PERCENT);
            match &settings {
                Some(settings) if settings.use_target_bpm => {
                    player.apply_track_settings(settings);
                    player.set_target_bpm(settings.target_bpm);
                }
                Some(settings) => {
                    player.apply_track_settings(settings);
                    // No saved target: show the file's own BPM.
                    player.sync_target_bpm();
                }
                None => {
                    player.sync_target_bpm();
                }
            }
            player.send_overrides();
        }
        Ok(())
    }

    /// Load and immediately start playback.
    pub fn load_and_play(&self, path: &Path) -> Result<(), PlayerError> {
        self.load_path(path)?;
        self.player.lock().play();
        Ok(())
    }

    /// Tear down the current file.
    pub fn unload(&self) {
        self.player.lock().stop(false);
        thread::sleep(LOAD_SETTLE);
        let mut player = self.player.lock();
        player.reset_midi_device();
        player.unload_file();
    }

    /// Persist the current overrides as the file's settings record.
    pub fn save_track_settings(&self, midi_path: &Path) -> std::io::Result<()> {
        let settings = self.player.lock().track_settings();
        settings.save(&TrackSettings::path_for(midi_path))
    }

    /// Apply a global settings record to the router and player.
    pub fn apply_global_settings(&self, settings: &GlobalSettings) {
        self.router.set_keyboard_channel(settings.keyboard_channel);
        self.router.set_keyboard_velocity(settings.keyboard_velocity);
        // Order matters: setting one mode clears the other.
        self.router.set_keyboard(settings.midi_keyboard);
        self.router.set_thru(settings.midi_thru);
        self.player.lock().set_clock_enabled(settings.midi_clock);
    }

    /// Snapshot the current router and clock configuration.
    pub fn global_settings(&self) -> GlobalSettings {
        use super::input::InputMode;
        let mode = self.router.mode();
        GlobalSettings {
            midi_thru: mode == InputMode::Thru,
            midi_keyboard: mode == InputMode::Keyboard,
            keyboard_channel: self.router.keyboard_channel(),
            keyboard_velocity: self.router.keyboard_velocity(),
            midi_clock: self.player.lock().clock_enabled(),
        }
    }

    // ------------------------------------------------------------------
    // Transport forwarding (UI thread)
    // ------------------------------------------------------------------

    pub fn play(&self) {
        self.player.lock().play();
    }

    pub fn pause(&self) {
        self.player.lock().pause();
    }

    pub fn stop(&self) {
        self.player.lock().stop(true);
    }

    pub fn fast_forward(&self, ms: u32) {
        self.player.lock().fast_forward(ms);
    }

    pub fn rewind(&self, ms: u32) {
        self.player.lock().rewind(ms);
    }

    pub fn seek(&self, ms: u32) {
        self.player.lock().seek(ms);
    }

    pub fn status(&self) -> PlayerStatus {
        self.player.lock().status()
    }
}

impl Drop for PlayerEngine {
    fn drop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn audio_thread(
    player: Arc<Mutex<Player>>,
    router: Arc<InputRouter>,
    should_stop: Arc<AtomicBool>,
) {
    log::debug!("audio thread started");
    loop {
        if should_stop.load(Ordering::SeqCst) {
            break;
        }

        let playing = {
            let mut player = player.lock();
            player.tick();
            player.state() == PlayerState::Playing
        };

        router.poll();

        thread::sleep(if playing { ACTIVE_TICK } else { IDLE_TICK });
    }
    // Leave nothing hanging on the way out.
    player.lock().silence_all();
    log::debug!("audio thread stopped");
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
