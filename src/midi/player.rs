//! Player core: transport, tick scheduler and the event emission pipeline.
//!
//! One `Player` owns the parser, the per-channel overrides and all timing
//! state. The audio thread drives it through [`Player::tick`]; the UI
//! thread mutates it under the shared guard. Every mutation is visible to
//! the next `tick()` call.
//!
//! Timing works in integer microseconds: `micros_per_tick` is derived from
//! the file tempo, the division and the user tempo percent, and the wall
//! clock reference advances by whole ticks only, so the fractional
//! remainder carries over and playback does not drift.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::PlayerError;
use crate::storage::reader::BlockReader;
use crate::storage::settings::TrackSettings;

use super::events::{
    EventKind, MidiEvent, CC_ALL_NOTES_OFF, CC_ALL_SOUND_OFF, CC_PAN, CC_VOLUME,
    CHANNEL_PRESSURE, CONTROL_CHANGE, META_TEMPO, NOTE_OFF, NOTE_ON, PITCH_BEND, POLY_PRESSURE,
    PROGRAM_CHANGE,
};
use super::output::{MidiOut, RealtimeMessage};
use super::parser::{FileHeader, MidiFileParser};

/// Tempo percent is stored in tenths: 1000 = 100.0%.
pub const MIN_TEMPO_PERCENT: u16 = 500;
pub const MAX_TEMPO_PERCENT: u16 = 2000;
pub const DEFAULT_TEMPO_PERCENT: u16 = 1000;

/// Target BPM is stored in hundredths: 12000 = 120.00 BPM.
pub const MIN_TARGET_BPM: u32 = 4_000;
pub const MAX_TARGET_BPM: u32 = 30_000;
pub const DEFAULT_TARGET_BPM: u32 = 12_000;

/// Global velocity scale: 50 = file velocities unchanged, 100 = doubled.
pub const DEFAULT_VELOCITY_SCALE: u8 = 50;
pub const MIN_VELOCITY_SCALE: u8 = 1;
pub const MAX_VELOCITY_SCALE: u8 = 100;

/// Cooperative yield budget for one `tick()` call; keeps the guard from
/// starving the UI thread when a burst of events (large sysex) is due.
const TICK_BUDGET_MICROS: u64 = 15_000;

/// Hard cap on events consumed by one seek, against corrupt files.
const SEEK_EVENT_CAP: u32 = 50_000;

/// Pause after silence-all so the bytes clear the serial link.
const SETTLE: Duration = Duration::from_millis(10);

/// Transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    Stopped,
    Playing,
    Paused,
}

/// Per-channel user overrides. `None`/0 means "follow the MIDI file".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ChannelOverride {
    /// Fixed program; file program changes on this channel are dropped.
    pub program: Option<u8>,
    /// Fixed CC7 volume; file volume changes are dropped.
    pub volume: Option<u8>,
    /// Fixed CC10 pan; file pan changes are dropped.
    pub pan: Option<u8>,
    /// Semitone offset applied to notes, -24..=24.
    pub transpose: i8,
    /// Per-channel velocity percent (1..=200); 0 inherits the global scale.
    pub velocity_pct: u8,
    /// Redirect output to this channel (0-based); lookups stay on the
    /// original channel.
    pub route_to: Option<u8>,
}

/// Snapshot handed to the UI each refresh.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlayerStatus {
    pub state: PlayerState,
    /// Position in milliseconds, wall-clock smoothed while playing.
    pub position_ms: u32,
    /// Total file length in milliseconds at the current tempo.
    pub total_ms: u32,
    /// Effective BPM after tempo percent.
    pub bpm: u16,
    /// Tempo percent in tenths.
    pub tempo_percent: u16,
    /// True when the last file ended on its own.
    pub reached_end: bool,
    /// Last playback error, cleared on the next load.
    pub error: Option<String>,
    /// Header of the loaded file, if any.
    pub file: Option<FileHeader>,
}

/// The playback core. Wrap it in the engine's mutex; never share it bare.
pub struct Player {
    out: Arc<dyn MidiOut>,
    parser: MidiFileParser,
    state: PlayerState,

    // Timing
    ticks_elapsed: u32,
    last_tick_wall: u64,
    micros_per_tick: u64,
    tempo_percent: u16,
    epoch: Instant,

    // Channel control
    mutes: u16,
    solos: u16,
    velocity_scale: u8,
    overrides: [ChannelOverride; 16],

    // Event pipeline
    buffered: Option<MidiEvent>,
    reached_end: bool,
    sysex_enabled: bool,

    // MIDI clock
    clock_enabled: bool,
    last_clock: u64,

    // Tempo retargeting
    file_bpm_hundredths: u32,
    target_bpm: u32,
    use_target_bpm: bool,

    last_error: Option<String>,
}

impl Player {
    pub fn new(out: Arc<dyn MidiOut>) -> Self {
        Self {
            out,
            parser: MidiFileParser::new(),
            state: PlayerState::Stopped,
            ticks_elapsed: 0,
            last_tick_wall: 0,
            micros_per_tick: 0,
            tempo_percent: DEFAULT_TEMPO_PERCENT,
            epoch: Instant::now(),
            mutes: 0,
            solos: 0,
            velocity_scale: DEFAULT_VELOCITY_SCALE,
            overrides: [ChannelOverride::default(); 16],
            buffered: None,
            reached_end: false,
            sysex_enabled: true,
            clock_enabled: false,
            last_clock: 0,
            file_bpm_hundredths: 0,
            target_bpm: DEFAULT_TARGET_BPM,
            use_target_bpm: false,
            last_error: None,
        }
    }

    // ------------------------------------------------------------------
    // File lifecycle
    // ------------------------------------------------------------------

    /// Load a new file. Any previous file is stopped and replaced.
    pub fn load_file(&mut self, reader: Box<dyn BlockReader + Send>) -> Result<(), PlayerError> {
        self.stop(false);
        self.ticks_elapsed = 0;
        self.reached_end = false;
        self.last_error = None;
        self.micros_per_tick = 0;
        self.file_bpm_hundredths = 0;
        self.parser.open(reader)?;
        self.buffered = self.parser.read_next_event();
        let header = self.parser.header();
        log::info!(
            "loaded MIDI file: format {}, {} tracks, division {}",
            header.format,
            header.track_count,
            header.division
        );
        Ok(())
    }

    /// Drop the current file without rewinding first (skips wasted I/O).
    pub fn unload_file(&mut self) {
        self.stop(false);
        self.parser.close();
        self.buffered = None;
        self.micros_per_tick = 0;
        self.ticks_elapsed = 0;
    }

    /// Find the file's starting tempo and derive the base BPM used by
    /// target-BPM retargeting. Call once right after [`Self::load_file`].
    pub fn scan_initial_tempo(&mut self) -> Result<(), PlayerError> {
        self.parser.scan_for_initial_tempo()?;
        self.buffered = self.parser.read_next_event();
        // Base BPM goes through a whole-BPM truncation before the
        // hundredths scaling; retargeting math depends on this exact
        // rounding.
        let tempo = self.parser.header().tempo.max(1) as u64;
        let bpm = 60_000_000u64 / tempo;
        self.file_bpm_hundredths = (bpm * 100) as u32;
        self.recalc_micros_per_tick();
        Ok(())
    }

    /// Walk the whole file for its length in ticks and sysex count.
    pub fn calculate_length(&mut self) -> Result<(), PlayerError> {
        self.parser.calculate_length()?;
        self.buffered = self.parser.read_next_event();
        Ok(())
    }

    /// Install a cached length scan result instead of re-scanning.
    pub fn set_cached_length(&mut self, length_ticks: u32, sysex_count: u16) {
        self.parser.set_length_ticks(length_ticks);
        self.parser.set_sysex_count(sysex_count);
    }

    pub fn has_file(&self) -> bool {
        self.parser.is_open()
    }

    pub fn header(&self) -> Option<&FileHeader> {
        if self.parser.is_open() {
            Some(self.parser.header())
        } else {
            None
        }
    }

    pub fn sysex_count(&self) -> u16 {
        self.parser.sysex_count()
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn reached_end(&self) -> bool {
        self.reached_end
    }

    pub fn play(&mut self) {
        if self.state == PlayerState::Playing {
            return;
        }
        if !self.parser.is_open() {
            log::debug!("play ignored: no file loaded");
            return;
        }
        self.reached_end = false;

        // Clear anything still sounding from a previous run.
        self.silence_all();
        thread::sleep(SETTLE);

        let from_start = self.state == PlayerState::Stopped && self.ticks_elapsed == 0;
        if from_start {
            if let Err(e) = self.parser.reset() {
                log::warn!("parser reset failed: {}", e);
                self.last_error = Some(e.to_string());
                self.state = PlayerState::Stopped;
                return;
            }
            self.buffered = self.parser.read_next_event();
        }

        self.state = PlayerState::Playing;
        let now = self.clock_micros();
        self.last_tick_wall = now;
        self.last_clock = now;

        if self.clock_enabled {
            self.out.realtime(if from_start {
                RealtimeMessage::Start
            } else {
                RealtimeMessage::Continue
            });
        }
        log::info!("playback started (from_start: {})", from_start);
    }

    pub fn pause(&mut self) {
        if self.state != PlayerState::Playing {
            return;
        }
        self.state = PlayerState::Paused;
        if self.clock_enabled {
            self.out.realtime(RealtimeMessage::Stop);
        }
        self.silence_all();
        thread::sleep(SETTLE);
        // ticks_elapsed is preserved for resume.
    }

    /// Stop playback. With `reset` the parser rewinds and the position
    /// returns to zero; without it the position is left alone (used before
    /// unloading to skip pointless I/O).
    pub fn stop(&mut self, reset: bool) {
        if self.state == PlayerState::Stopped {
            return;
        }
        self.state = PlayerState::Stopped;
        if self.clock_enabled {
            self.out.realtime(RealtimeMessage::Stop);
        }
        self.silence_all();
        thread::sleep(SETTLE);

        if reset {
            match self.parser.reset() {
                Ok(()) => {
                    self.ticks_elapsed = 0;
                    self.buffered = self.parser.read_next_event();
                }
                Err(e) => {
                    // Keep the position; the card may be gone.
                    log::warn!("parser reset failed during stop: {}", e);
                    self.last_error = Some(e.to_string());
                }
            }
        }
    }

    /// CC 123 on every channel; the fast way to kill hanging notes.
    pub fn silence_all(&self) {
        self.out.all_notes_off();
    }

    /// Full device reset (sound off, notes off, controllers) between songs.
    pub fn reset_midi_device(&self) {
        self.out.reset_device();
        thread::sleep(SETTLE);
    }

    // ------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------

    /// Advance playback to "now". Call this in a tight loop from the audio
    /// thread; it never blocks longer than the internal 15 ms drain budget.
    pub fn tick(&mut self) {
        let now = self.clock_micros();
        self.advance(now);
    }

    /// Like [`Self::tick`] but with an explicit clock, for hosts that run
    /// their own tick source (and for deterministic tests).
    pub fn tick_at(&mut self, now_micros: u64) {
        self.advance(now_micros);
    }

    /// Microseconds on the player's internal clock.
    pub fn clock_micros(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn advance(&mut self, now: u64) {
        if self.state != PlayerState::Playing {
            return;
        }
        if self.buffered.is_none() {
            // Natural end of file.
            self.reached_end = true;
            log::info!("reached end of file");
            self.stop(true);
            return;
        }
        // Tempo not derived yet for this file.
        if self.micros_per_tick == 0 {
            return;
        }

        if self.clock_enabled {
            self.emit_clock(now);
        }

        let elapsed = now.saturating_sub(self.last_tick_wall);
        let ticks_passed = elapsed / self.micros_per_tick;
        if ticks_passed == 0 {
            return;
        }
        self.ticks_elapsed = self
            .ticks_elapsed
            .saturating_add(ticks_passed.min(u32::MAX as u64) as u32);
        // Advance by whole ticks only; the remainder stays in the clock.
        self.last_tick_wall = self
            .last_tick_wall
            .saturating_add(ticks_passed * self.micros_per_tick);

        let drain_start = Instant::now();
        loop {
            let due = matches!(
                self.buffered.as_ref(),
                Some(event) if event.abs_tick <= self.ticks_elapsed
            );
            if !due {
                break;
            }
            if self.state != PlayerState::Playing {
                return;
            }
            if drain_start.elapsed().as_micros() as u64 > TICK_BUDGET_MICROS {
                // Out of budget; yield the guard and continue next call.
                break;
            }
            let Some(event) = self.buffered.take() else {
                break;
            };
            self.send_event(&event);
            self.buffered = self.parser.read_next_event();
            if self.buffered.is_none() {
                break;
            }
        }
        self.parser.update_length_from_playback(self.ticks_elapsed);

        if self.parser.take_io_error() {
            log::warn!("storage failure during playback, stopping");
            self.last_error = Some("storage read failed during playback".to_string());
            self.stop(false);
        }
    }

    /// At most one Clock byte per call; missed intervals don't accumulate.
    fn emit_clock(&mut self, now: u64) {
        let bpm = self.current_bpm().max(1) as u64;
        let micros_per_clock = (60_000_000 / bpm) / 24;
        if now.saturating_sub(self.last_clock) >= micros_per_clock {
            self.out.realtime(RealtimeMessage::Clock);
            self.last_clock = now;
        }
    }

    fn recalc_micros_per_tick(&mut self) {
        let division = self.parser.header().division as u64;
        if division == 0 {
            self.micros_per_tick = 0;
            return;
        }
        let tempo = self.parser.header().tempo as u64;
        self.micros_per_tick = (tempo * 1000) / (self.tempo_percent as u64 * division);
    }

    // ------------------------------------------------------------------
    // Emission pipeline
    // ------------------------------------------------------------------

    /// True when note traffic on `channel` (0-based, pre-routing) must be
    /// dropped: explicitly muted, or outside the active solo set.
    fn note_gated(&self, channel: usize) -> bool {
        if self.mutes & (1 << channel) != 0 {
            return true;
        }
        self.solos != 0 && self.solos & (1 << channel) == 0
    }

    fn transposed(&self, channel: usize, note: u8) -> u8 {
        (note as i16 + self.overrides[channel].transpose as i16).clamp(0, 127) as u8
    }

    fn scaled_velocity(&self, channel: usize, velocity: u8) -> u8 {
        // 50 = identity: v * 50 * 2 / 100 = v. The exact integer formula
        // matters for odd velocities; don't "simplify" it.
        let mut scaled = (velocity as u16 * self.velocity_scale as u16 * 2) / 100;
        let per_channel = self.overrides[channel].velocity_pct;
        if per_channel != 0 {
            scaled = (scaled * per_channel as u16) / 100;
        }
        scaled.clamp(1, 127) as u8
    }

    fn send_event(&mut self, event: &MidiEvent) {
        // Tempo metas retune the scheduler; no meta ever hits the wire.
        if event.kind == EventKind::Meta {
            if event.data1 == META_TEMPO {
                self.recalc_micros_per_tick();
            }
            return;
        }

        if event.kind == EventKind::SysEx {
            if self.sysex_enabled && !event.payload.is_empty() {
                self.out.sysex(&event.payload);
            }
            return;
        }

        // Corrupt files can claim any channel; drop out-of-range early.
        if event.channel >= 16 {
            return;
        }
        let orig = event.channel as usize;

        // Routing changes the wire channel; every override lookup below
        // stays keyed by the original channel.
        let channel = match self.overrides[orig].route_to {
            Some(route) => route + 1,
            None => event.channel + 1,
        };

        match event.status {
            NOTE_OFF => {
                if self.note_gated(orig) {
                    return;
                }
                self.out.note_off(channel, self.transposed(orig, event.data1), event.data2);
            }
            NOTE_ON => {
                if self.note_gated(orig) {
                    return;
                }
                if event.data2 == 0 {
                    // NoteOn velocity 0 is a NoteOff.
                    self.out.note_off(channel, self.transposed(orig, event.data1), 0);
                } else {
                    let velocity = self.scaled_velocity(orig, event.data2);
                    self.out.note_on(channel, self.transposed(orig, event.data1), velocity);
                }
            }
            POLY_PRESSURE => {
                self.out.poly_pressure(channel, event.data1, event.data2);
            }
            CONTROL_CHANGE => {
                if event.data1 == CC_VOLUME && self.overrides[orig].volume.is_some() {
                    // User volume wins over the file's.
                    return;
                }
                if event.data1 == CC_PAN && self.overrides[orig].pan.is_some() {
                    return;
                }
                self.out.control_change(channel, event.data1, event.data2);
            }
            PROGRAM_CHANGE => {
                if self.overrides[orig].program.is_some() {
                    return;
                }
                self.out.program_change(channel, event.data1);
            }
            CHANNEL_PRESSURE => {
                self.out.channel_pressure(channel, event.data1);
            }
            PITCH_BEND => {
                let bend = (((event.data2 as u16) << 7) | event.data1 as u16) as i16 - 8192;
                self.out.pitch_bend(channel, bend);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Seeking
    // ------------------------------------------------------------------

    /// Skip forward by `ms` of musical time without sounding the skipped
    /// events.
    pub fn fast_forward(&mut self, ms: u32) {
        let was_playing = self.state == PlayerState::Playing;
        if was_playing {
            self.pause();
        }
        self.silence_all();

        let mut target = self.ticks_elapsed.saturating_add(self.ms_to_ticks(ms));
        let max = self.parser.length_ticks();
        if max > 0 && target > max {
            target = max;
        }
        self.drain_to(target);
        self.ticks_elapsed = target;
        self.last_tick_wall = self.clock_micros();

        self.silence_all();
        if was_playing {
            self.play();
        }
    }

    /// Skip backward by `ms`: restart the parser and advance silently.
    pub fn rewind(&mut self, ms: u32) {
        let was_playing = self.state == PlayerState::Playing;
        if was_playing {
            self.pause();
        }
        self.silence_all();

        let target = self.ticks_elapsed.saturating_sub(self.ms_to_ticks(ms));
        if let Err(e) = self.parser.reset() {
            log::warn!("parser reset failed during rewind: {}", e);
            self.last_error = Some(e.to_string());
            return;
        }
        self.ticks_elapsed = 0;
        self.buffered = self.parser.read_next_event();
        if target > 0 {
            self.drain_to(target);
            self.ticks_elapsed = target;
        }
        self.last_tick_wall = self.clock_micros();

        self.silence_all();
        if was_playing {
            self.play();
        }
    }

    /// Jump to an absolute position.
    pub fn seek(&mut self, ms: u32) {
        self.silence_all();
        if let Err(e) = self.parser.reset() {
            log::warn!("parser reset failed during seek: {}", e);
            self.last_error = Some(e.to_string());
            return;
        }
        self.ticks_elapsed = 0;
        self.buffered = self.parser.read_next_event();
        self.fast_forward(ms);
    }

    /// Read and discard events up to `target` ticks. Sysex payloads are
    /// freed as their events drop.
    fn drain_to(&mut self, target: u32) {
        let mut processed = 0u32;
        loop {
            let due = matches!(
                self.buffered.as_ref(),
                Some(event) if event.abs_tick <= target
            );
            if !due || processed >= SEEK_EVENT_CAP {
                break;
            }
            self.buffered = self.parser.read_next_event();
            processed += 1;
            if processed % 100 == 0 {
                // Let the other core breathe during long seeks.
                thread::yield_now();
            }
        }
        if processed >= SEEK_EVENT_CAP {
            log::warn!("seek hit the {}-event cap, file may be corrupt", SEEK_EVENT_CAP);
        }
    }

    // ------------------------------------------------------------------
    // Tempo control
    // ------------------------------------------------------------------

    /// Set playback speed in tenths of a percent (500..=2000).
    pub fn set_tempo_percent(&mut self, tenths: u16) {
        self.tempo_percent = tenths.clamp(MIN_TEMPO_PERCENT, MAX_TEMPO_PERCENT);
        self.recalc_micros_per_tick();
    }

    pub fn tempo_percent(&self) -> u16 {
        self.tempo_percent
    }

    /// Retarget playback to an absolute BPM (hundredths). The percent is
    /// derived from the file's base BPM captured at load time.
    pub fn set_target_bpm(&mut self, bpm_hundredths: u32) {
        let bpm = bpm_hundredths.clamp(MIN_TARGET_BPM, MAX_TARGET_BPM);
        self.target_bpm = bpm;
        self.use_target_bpm = true;
        if self.file_bpm_hundredths == 0 {
            // No file loaded yet; applied on the next load.
            return;
        }
        let percent = (bpm as u64 * 1000) / self.file_bpm_hundredths as u64;
        let percent = percent.clamp(MIN_TEMPO_PERCENT as u64, MAX_TEMPO_PERCENT as u64) as u16;
        self.tempo_percent = percent;
        self.recalc_micros_per_tick();
    }

    /// Align the displayed target BPM with the file's own tempo without
    /// engaging retargeting. Called at load when no saved target applies,
    /// so the BPM screen starts from what the file actually plays at.
    pub fn sync_target_bpm(&mut self) {
        if self.file_bpm_hundredths == 0 {
            return;
        }
        self.target_bpm = self
            .file_bpm_hundredths
            .clamp(MIN_TARGET_BPM, MAX_TARGET_BPM);
        self.use_target_bpm = false;
    }

    pub fn target_bpm(&self) -> u32 {
        self.target_bpm
    }

    pub fn use_target_bpm(&self) -> bool {
        self.use_target_bpm
    }

    /// BPM of the file's base tempo at 100 percent, in hundredths.
    pub fn file_bpm_hundredths(&self) -> u32 {
        self.file_bpm_hundredths
    }

    /// Effective BPM after the tempo percent.
    pub fn current_bpm(&self) -> u16 {
        let tempo = self.parser.header().tempo as u64;
        let effective = (tempo * 1000) / self.tempo_percent.max(1) as u64;
        if effective == 0 {
            return 120;
        }
        (60_000_000 / effective).min(u16::MAX as u64) as u16
    }

    // ------------------------------------------------------------------
    // Channel control
    // ------------------------------------------------------------------

    pub fn mute_channel(&mut self, channel: u8) {
        if channel >= 16 {
            return;
        }
        self.mutes |= 1 << channel;
        // Kill anything already sounding there.
        self.out.control_change(channel + 1, CC_ALL_NOTES_OFF, 0);
    }

    pub fn unmute_channel(&mut self, channel: u8) {
        if channel >= 16 {
            return;
        }
        self.mutes &= !(1 << channel);
    }

    pub fn toggle_mute(&mut self, channel: u8) {
        if self.is_muted(channel) {
            self.unmute_channel(channel);
        } else {
            self.mute_channel(channel);
        }
    }

    pub fn is_muted(&self, channel: u8) -> bool {
        channel < 16 && self.mutes & (1 << channel) != 0
    }

    pub fn mutes(&self) -> u16 {
        self.mutes
    }

    pub fn set_mutes(&mut self, mask: u16) {
        for ch in 0..16 {
            if mask & (1 << ch) != 0 {
                self.mute_channel(ch);
            } else {
                self.unmute_channel(ch);
            }
        }
    }

    pub fn solos(&self) -> u16 {
        self.solos
    }

    pub fn set_solos(&mut self, mask: u16) {
        self.solos = mask;
    }

    pub fn toggle_solo(&mut self, channel: u8) {
        if channel < 16 {
            self.solos ^= 1 << channel;
        }
    }

    pub fn set_velocity_scale(&mut self, scale: u8) {
        self.velocity_scale = scale.clamp(MIN_VELOCITY_SCALE, MAX_VELOCITY_SCALE);
    }

    pub fn velocity_scale(&self) -> u8 {
        self.velocity_scale
    }

    pub fn override_for(&self, channel: u8) -> ChannelOverride {
        if channel < 16 {
            self.overrides[channel as usize]
        } else {
            ChannelOverride::default()
        }
    }

    pub fn set_channel_program(&mut self, channel: u8, program: Option<u8>) {
        if channel < 16 {
            self.overrides[channel as usize].program = program.filter(|p| *p <= 127);
        }
    }

    pub fn set_channel_volume(&mut self, channel: u8, volume: Option<u8>) {
        if channel < 16 {
            self.overrides[channel as usize].volume = volume.filter(|v| *v <= 127);
        }
    }

    pub fn set_channel_pan(&mut self, channel: u8, pan: Option<u8>) {
        if channel < 16 {
            self.overrides[channel as usize].pan = pan.filter(|p| *p <= 127);
        }
    }

    pub fn set_channel_transpose(&mut self, channel: u8, semitones: i8) {
        if channel < 16 {
            self.overrides[channel as usize].transpose = semitones.clamp(-24, 24);
        }
    }

    pub fn set_channel_velocity(&mut self, channel: u8, percent: u8) {
        if channel < 16 {
            self.overrides[channel as usize].velocity_pct = percent.min(200);
        }
    }

    pub fn set_channel_routing(&mut self, channel: u8, route_to: Option<u8>) {
        if channel < 16 {
            self.overrides[channel as usize].route_to = route_to.filter(|r| *r <= 15);
        }
    }

    pub fn set_sysex_enabled(&mut self, enabled: bool) {
        self.sysex_enabled = enabled;
    }

    pub fn sysex_enabled(&self) -> bool {
        self.sysex_enabled
    }

    pub fn set_clock_enabled(&mut self, enabled: bool) {
        self.clock_enabled = enabled;
    }

    pub fn clock_enabled(&self) -> bool {
        self.clock_enabled
    }

    /// Restore every channel override, the global velocity scale and the
    /// sysex filter to defaults, with an All Sound Off per channel.
    pub fn reset_channel_defaults(&mut self) {
        for ch in 0..16u8 {
            self.overrides[ch as usize] = ChannelOverride::default();
            self.out.control_change(ch + 1, CC_ALL_SOUND_OFF, 0);
        }
        self.mutes = 0;
        self.solos = 0;
        self.velocity_scale = DEFAULT_VELOCITY_SCALE;
        self.sysex_enabled = true;
        self.use_target_bpm = false;
    }

    /// Apply a per-file settings record (see the storage module).
    pub fn apply_track_settings(&mut self, settings: &TrackSettings) {
        self.set_mutes(settings.mutes);
        self.solos = settings.solos;
        for ch in 0..16 {
            self.overrides[ch] = ChannelOverride {
                program: settings.programs[ch],
                volume: settings.volumes[ch],
                pan: settings.pans[ch],
                transpose: settings.transpose[ch].clamp(-24, 24),
                velocity_pct: settings.velocity[ch].min(200),
                route_to: settings.routing[ch].filter(|r| *r <= 15),
            };
        }
        self.set_velocity_scale(settings.velocity_scale);
        self.sysex_enabled = settings.sysex_enabled;
        self.target_bpm = settings.target_bpm.clamp(MIN_TARGET_BPM, MAX_TARGET_BPM);
        self.use_target_bpm = settings.use_target_bpm;
    }

    /// Export the current overrides as a settings record.
    pub fn track_settings(&self) -> TrackSettings {
        TrackSettings {
            mutes: self.mutes,
            solos: self.solos,
            programs: std::array::from_fn(|ch| self.overrides[ch].program),
            volumes: std::array::from_fn(|ch| self.overrides[ch].volume),
            pans: std::array::from_fn(|ch| self.overrides[ch].pan),
            transpose: std::array::from_fn(|ch| self.overrides[ch].transpose),
            velocity: std::array::from_fn(|ch| self.overrides[ch].velocity_pct),
            routing: std::array::from_fn(|ch| self.overrides[ch].route_to),
            velocity_scale: self.velocity_scale,
            target_bpm: self.target_bpm,
            use_target_bpm: self.use_target_bpm,
            sysex_enabled: self.sysex_enabled,
        }
    }

    /// Push overridden programs, volumes and pans to the device once, so
    /// the user's settings sound before the first file event.
    pub fn send_overrides(&self) {
        for ch in 0..16u8 {
            let ov = &self.overrides[ch as usize];
            if let Some(program) = ov.program {
                self.out.program_change(ch + 1, program);
            }
            if let Some(volume) = ov.volume {
                self.out.control_change(ch + 1, CC_VOLUME, volume);
            }
            if let Some(pan) = ov.pan {
                self.out.control_change(ch + 1, CC_PAN, pan);
            }
        }
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn ticks_elapsed(&self) -> u32 {
        self.ticks_elapsed
    }

    pub fn ticks_to_ms(&self, ticks: u32) -> u32 {
        if self.micros_per_tick == 0 {
            return 0;
        }
        ((ticks as u64 * self.micros_per_tick) / 1000) as u32
    }

    pub fn ms_to_ticks(&self, ms: u32) -> u32 {
        if self.micros_per_tick == 0 {
            return 0;
        }
        ((ms as u64 * 1000) / self.micros_per_tick) as u32
    }

    /// Position in ms; wall-clock smoothed between ticks while playing.
    pub fn position_ms(&self) -> u32 {
        let base = self.ticks_to_ms(self.ticks_elapsed);
        if self.state != PlayerState::Playing {
            return base;
        }
        let fractional = self.clock_micros().saturating_sub(self.last_tick_wall) / 1000;
        base.saturating_add(fractional as u32)
    }

    pub fn total_ms(&self) -> u32 {
        self.ticks_to_ms(self.parser.length_ticks())
    }

    pub fn status(&self) -> PlayerStatus {
        PlayerStatus {
            state: self.state,
            position_ms: self.position_ms(),
            total_ms: self.total_ms(),
            bpm: self.current_bpm(),
            tempo_percent: self.tempo_percent,
            reached_end: self.reached_end,
            error: self.last_error.clone(),
            file: self.header().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::output::{CaptureSink, OutMessage};
    use crate::storage::reader::MemReader;

    /// Minimal type-0 file: header then one track (EOT appended).
    fn smf(division: u16, track: &[u8]) -> Vec<u8> {
        let mut body = track.to_vec();
        body.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);
        let mut file = Vec::new();
        file.extend_from_slice(b"MThd");
        file.extend_from_slice(&6u32.to_be_bytes());
        file.extend_from_slice(&0u16.to_be_bytes());
        file.extend_from_slice(&1u16.to_be_bytes());
        file.extend_from_slice(&division.to_be_bytes());
        file.extend_from_slice(b"MTrk");
        file.extend_from_slice(&(body.len() as u32).to_be_bytes());
        file.extend_from_slice(&body);
        file
    }

    fn player_with(track: &[u8]) -> (Player, Arc<CaptureSink>) {
        let sink = Arc::new(CaptureSink::new());
        let mut player = Player::new(sink.clone());
        player
            .load_file(Box::new(MemReader::new(smf(96, track))))
            .unwrap();
        player.scan_initial_tempo().unwrap();
        (player, sink)
    }

    /// Play, then clear the transport chatter so assertions only see the
    /// file's own events.
    fn play_clean(player: &mut Player, sink: &CaptureSink) -> u64 {
        player.play();
        sink.take();
        player.clock_micros()
    }

    fn note_ons(messages: &[OutMessage]) -> Vec<(u8, u8, u8)> {
        messages
            .iter()
            .filter_map(|m| match m {
                OutMessage::NoteOn { channel, note, velocity } => Some((*channel, *note, *velocity)),
                _ => None,
            })
            .collect()
    }

    const NOTE: &[u8] = &[0x00, 0x90, 0x3C, 0x64, 0x60, 0x80, 0x3C, 0x40];

    #[test]
    fn test_default_tempo_timing() {
        let (mut player, sink) = player_with(NOTE);
        // 500,000 us/quarter at division 96 -> 5208 us/tick.
        let t0 = play_clean(&mut player, &sink);
        player.tick_at(t0 + 10_000);
        let ons = note_ons(&sink.take());
        assert_eq!(ons, vec![(1, 60, 100)]);

        // NoteOff at tick 96 ~ 500 ms.
        player.tick_at(t0 + 490_000);
        assert!(note_ons(&sink.messages()).is_empty());
        assert!(sink.take().is_empty());
        player.tick_at(t0 + 505_000);
        let messages = sink.take();
        assert_eq!(
            messages,
            vec![OutMessage::NoteOff { channel: 1, note: 60, velocity: 64 }]
        );
    }

    #[test]
    fn test_tempo_change_stretches_time() {
        // Set tempo meta to 1,000,000 us/quarter, then a note 96 ticks in.
        let (mut player, sink) = player_with(&[
            0x00, 0xFF, 0x51, 0x03, 0x0F, 0x42, 0x40, 0x60, 0x90, 0x3C, 0x64, 0x60, 0x80, 0x3C,
            0x40,
        ]);
        let t0 = play_clean(&mut player, &sink);
        // Before 1 s nothing sounds.
        player.tick_at(t0 + 980_000);
        assert!(note_ons(&sink.take()).is_empty());
        // NoteOn lands at ~1 s, NoteOff at ~2 s.
        player.tick_at(t0 + 1_005_000);
        assert_eq!(note_ons(&sink.take()), vec![(1, 60, 100)]);
        player.tick_at(t0 + 1_990_000);
        assert!(sink.take().is_empty());
        player.tick_at(t0 + 2_005_000);
        assert_eq!(sink.take().len(), 1);
    }

    #[test]
    fn test_tempo_percent_scales_micros_per_tick() {
        let (mut player, _sink) = player_with(NOTE);
        player.set_tempo_percent(1000);
        let base = player.micros_per_tick;
        player.set_tempo_percent(2000);
        let doubled = player.micros_per_tick;
        // 200% speed -> half the microseconds per tick (+- rounding).
        assert!(base / doubled == 2 || (base + 1) / doubled == 2);
    }

    #[test]
    fn test_mute_gates_notes_only() {
        let (mut player, sink) = player_with(&[
            0x00, 0x90, 0x3C, 0x64, // note on ch0
            0x00, 0xB0, 0x5B, 0x30, // CC 91 on ch0
        ]);
        player.mute_channel(0);
        let t0 = play_clean(&mut player, &sink);
        player.tick_at(t0 + 10_000);
        let messages = sink.take();
        assert!(note_ons(&messages).is_empty());
        // Non-note traffic still passes on the muted channel.
        assert!(messages
            .iter()
            .any(|m| matches!(m, OutMessage::ControlChange { channel: 1, cc: 0x5B, .. })));
    }

    #[test]
    fn test_solo_gates_other_channels() {
        let (mut player, sink) = player_with(&[
            0x00, 0x90, 0x3C, 0x64, // ch0
            0x00, 0x91, 0x40, 0x64, // ch1
        ]);
        player.toggle_solo(1);
        let t0 = play_clean(&mut player, &sink);
        player.tick_at(t0 + 10_000);
        assert_eq!(note_ons(&sink.take()), vec![(2, 64, 100)]);
    }

    #[test]
    fn test_transpose_clamps_to_range() {
        let (mut player, sink) = player_with(&[0x00, 0x90, 0x6E, 0x64]); // note 110
        player.set_channel_transpose(0, 24);
        let t0 = play_clean(&mut player, &sink);
        player.tick_at(t0 + 10_000);
        assert_eq!(note_ons(&sink.take()), vec![(1, 127, 100)]);
    }

    #[test]
    fn test_velocity_identity_at_50() {
        let (mut player, _) = player_with(NOTE);
        assert_eq!(player.scaled_velocity(0, 100), 100);
        assert_eq!(player.scaled_velocity(0, 1), 1);
        assert_eq!(player.scaled_velocity(0, 127), 127);
        // Odd velocity keeps the exact integer formula: 99*50*2/100 = 99.
        assert_eq!(player.scaled_velocity(0, 99), 99);
    }

    #[test]
    fn test_velocity_saturates_at_100() {
        let (mut player, _) = player_with(NOTE);
        player.set_velocity_scale(100);
        assert_eq!(player.scaled_velocity(0, 64), 127);
        assert_eq!(player.scaled_velocity(0, 100), 127);
    }

    #[test]
    fn test_per_channel_velocity_stacks() {
        let (mut player, _) = player_with(NOTE);
        player.set_channel_velocity(0, 50);
        assert_eq!(player.scaled_velocity(0, 100), 50);
        player.set_channel_velocity(0, 0); // inherit global only
        assert_eq!(player.scaled_velocity(0, 100), 100);
    }

    #[test]
    fn test_program_override_drops_file_changes() {
        let (mut player, sink) = player_with(&[0x00, 0xC0, 0x05]);
        player.set_channel_program(0, Some(20));
        let t0 = play_clean(&mut player, &sink);
        player.tick_at(t0 + 10_000);
        assert!(sink
            .take()
            .iter()
            .all(|m| !matches!(m, OutMessage::ProgramChange { .. })));
    }

    #[test]
    fn test_volume_and_pan_overrides_drop_ccs() {
        let (mut player, sink) = player_with(&[
            0x00, 0xB0, 0x07, 0x40, // volume
            0x00, 0xB0, 0x0A, 0x40, // pan
            0x00, 0xB0, 0x01, 0x40, // mod wheel passes
        ]);
        player.set_channel_volume(0, Some(90));
        player.set_channel_pan(0, Some(64));
        let t0 = play_clean(&mut player, &sink);
        player.tick_at(t0 + 10_000);
        let ccs: Vec<u8> = sink
            .take()
            .iter()
            .filter_map(|m| match m {
                OutMessage::ControlChange { cc, .. } => Some(*cc),
                _ => None,
            })
            .collect();
        assert_eq!(ccs, vec![0x01]);
    }

    #[test]
    fn test_routing_keeps_override_lookups_on_original_channel() {
        let (mut player, sink) = player_with(&[0x00, 0x90, 0x3C, 0x64]);
        player.set_channel_routing(0, Some(4));
        player.set_channel_transpose(0, 12);
        // Transpose configured on channel 4 must NOT apply.
        player.set_channel_transpose(4, -12);
        let t0 = play_clean(&mut player, &sink);
        player.tick_at(t0 + 10_000);
        // Output lands on wire channel 5 with channel 0's transpose.
        assert_eq!(note_ons(&sink.take()), vec![(5, 72, 100)]);
    }

    #[test]
    fn test_sysex_filter() {
        let track: &[u8] = &[0x00, 0xF0, 0x03, 0x7E, 0x01, 0xF7];
        let (mut player, sink) = player_with(track);
        player.set_sysex_enabled(false);
        let t0 = play_clean(&mut player, &sink);
        player.tick_at(t0 + 10_000);
        assert!(sink.take().iter().all(|m| !matches!(m, OutMessage::SysEx(_))));

        let (mut player, sink) = player_with(track);
        let t0 = play_clean(&mut player, &sink);
        player.tick_at(t0 + 10_000);
        assert!(sink.take().iter().any(|m| matches!(m, OutMessage::SysEx(_))));
    }

    #[test]
    fn test_pitch_bend_recentered() {
        let (mut player, sink) = player_with(&[0x00, 0xE0, 0x00, 0x40]); // center
        let t0 = play_clean(&mut player, &sink);
        player.tick_at(t0 + 10_000);
        assert!(sink
            .take()
            .iter()
            .any(|m| matches!(m, OutMessage::PitchBend { channel: 1, bend: 0 })));
    }

    #[test]
    fn test_eof_sets_reached_end_and_stops() {
        let (mut player, sink) = player_with(NOTE);
        let t0 = play_clean(&mut player, &sink);
        player.tick_at(t0 + 600_000); // past the note off
        player.tick_at(t0 + 700_000); // drained -> EOF
        assert_eq!(player.state(), PlayerState::Stopped);
        assert!(player.reached_end());
        // EOF stop rewinds to the beginning.
        assert_eq!(player.ticks_elapsed(), 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut player, sink) = player_with(NOTE);
        player.play();
        player.stop(true);
        sink.take();
        let status_one = player.status();
        player.stop(true);
        assert!(sink.take().is_empty());
        let status_two = player.status();
        assert_eq!(status_one.state, status_two.state);
        assert_eq!(status_one.position_ms, status_two.position_ms);
    }

    #[test]
    fn test_pause_preserves_position() {
        let (mut player, sink) = player_with(NOTE);
        let t0 = play_clean(&mut player, &sink);
        player.tick_at(t0 + 200_000);
        player.pause();
        let position = player.ticks_elapsed();
        assert!(position > 0);
        assert_eq!(player.state(), PlayerState::Paused);
        player.play();
        assert_eq!(player.ticks_elapsed(), position);
    }

    #[test]
    fn test_clock_transport_messages() {
        let (mut player, sink) = player_with(NOTE);
        player.set_clock_enabled(true);
        player.play();
        assert!(sink
            .take()
            .iter()
            .any(|m| matches!(m, OutMessage::Realtime(RealtimeMessage::Start))));
        player.pause();
        assert!(sink
            .take()
            .iter()
            .any(|m| matches!(m, OutMessage::Realtime(RealtimeMessage::Stop))));
        player.play();
        assert!(sink
            .take()
            .iter()
            .any(|m| matches!(m, OutMessage::Realtime(RealtimeMessage::Continue))));
    }

    #[test]
    fn test_clock_emits_at_most_one_per_tick() {
        let (mut player, sink) = player_with(NOTE);
        player.set_clock_enabled(true);
        let t0 = play_clean(&mut player, &sink);
        // A whole second late: still only one clock byte.
        player.tick_at(t0 + 1_000_000);
        let clocks = sink
            .take()
            .iter()
            .filter(|m| matches!(m, OutMessage::Realtime(RealtimeMessage::Clock)))
            .count();
        assert!(clocks <= 1);
    }

    #[test]
    fn test_fast_forward_advances_silently() {
        let (mut player, sink) = player_with(NOTE);
        let t0 = play_clean(&mut player, &sink);
        player.tick_at(t0 + 10_000);
        sink.take();
        player.fast_forward(400);
        // The skipped events were discarded, not played.
        assert!(note_ons(&sink.take()).is_empty());
        assert_eq!(player.state(), PlayerState::Playing);
        // ~400 ms of musical time, minus one tick of integer rounding.
        assert!(player.ticks_to_ms(player.ticks_elapsed()) >= 390);
    }

    #[test]
    fn test_target_bpm_sets_percent_from_file_base() {
        let (mut player, _) = player_with(NOTE);
        // File base is 120 BPM; target 60 BPM -> 50.0%.
        player.set_target_bpm(6_000);
        assert_eq!(player.tempo_percent(), 500);
        // Target 240 BPM -> 200.0%.
        player.set_target_bpm(24_000);
        assert_eq!(player.tempo_percent(), 2000);
    }

    #[test]
    fn test_file_bpm_truncates_to_whole_bpm() {
        // 498,961 us/quarter is 120.249... BPM; the base goes through a
        // whole-BPM truncation before the hundredths scaling.
        let (mut player, _) = player_with(&[0x00, 0xFF, 0x51, 0x03, 0x07, 0x9D, 0x11]);
        assert_eq!(player.file_bpm_hundredths(), 12_000);
        // Retargeting to that same 120 BPM is then a 100.0% no-op.
        player.set_target_bpm(12_000);
        assert_eq!(player.tempo_percent(), 1000);
    }

    #[test]
    fn test_sync_target_bpm_shows_file_tempo() {
        let (mut player, _) = player_with(NOTE);
        player.set_target_bpm(20_000);
        assert!(player.use_target_bpm());
        player.sync_target_bpm();
        assert_eq!(player.target_bpm(), 12_000);
        assert!(!player.use_target_bpm());
    }

    #[test]
    fn test_mute_sends_immediate_notes_off() {
        let (mut player, sink) = player_with(NOTE);
        sink.take();
        player.mute_channel(3);
        assert_eq!(
            sink.take(),
            vec![OutMessage::ControlChange { channel: 4, cc: 123, value: 0 }]
        );
    }

    #[test]
    fn test_send_overrides_pushes_only_set_values() {
        let (mut player, sink) = player_with(NOTE);
        player.set_channel_program(1, Some(40));
        player.set_channel_volume(2, Some(100));
        sink.take();
        player.send_overrides();
        assert_eq!(
            sink.take(),
            vec![
                OutMessage::ProgramChange { channel: 2, program: 40 },
                OutMessage::ControlChange { channel: 3, cc: 7, value: 100 },
            ]
        );
    }

    #[test]
    fn test_settings_round_trip_through_player() {
        let (mut player, _) = player_with(NOTE);
        player.mute_channel(2);
        player.set_solos(0b1000);
        player.set_channel_program(0, Some(17));
        player.set_channel_transpose(5, -7);
        player.set_channel_routing(9, Some(3));
        player.set_velocity_scale(80);
        let settings = player.track_settings();

        let (mut other, _) = player_with(NOTE);
        other.apply_track_settings(&settings);
        assert_eq!(other.track_settings(), settings);
        assert!(other.is_muted(2));
        assert_eq!(other.solos(), 0b1000);
    }
}
