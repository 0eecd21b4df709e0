//! Per-channel activity/peak table for the visualizer.
//!
//! Updated from the emission path on every note, read by the UI at its
//! refresh rate. The table is built from atomics so an update is a handful
//! of single-word stores; it deliberately does not share the player guard,
//! which can be held across SD reads.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::events::CC_EXPRESSION;
use super::output::{MidiOut, RealtimeMessage};

/// Visualizer bars max out too easily at raw velocity; scale to 70%.
const VELOCITY_DISPLAY_PCT: u16 = 70;

/// One row of the visualizer table, as read by the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ChannelLevel {
    /// Expression-modulated velocity of the latest note (0 when idle).
    pub activity: u8,
    /// Held peak value.
    pub peak: u8,
    /// Milliseconds timestamp of the peak, for hold/decay animation.
    pub peak_ms: u32,
}

/// Lock-free activity/peak table for 16 channels.
pub struct ChannelActivity {
    velocity: [AtomicU8; 16],
    expression: [AtomicU8; 16],
    activity: [AtomicU8; 16],
    peak: [AtomicU8; 16],
    peak_ms: [AtomicU32; 16],
    epoch: Instant,
}

impl Default for ChannelActivity {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelActivity {
    pub fn new() -> Self {
        Self {
            velocity: std::array::from_fn(|_| AtomicU8::new(0)),
            expression: std::array::from_fn(|_| AtomicU8::new(127)),
            activity: std::array::from_fn(|_| AtomicU8::new(0)),
            peak: std::array::from_fn(|_| AtomicU8::new(0)),
            peak_ms: std::array::from_fn(|_| AtomicU32::new(0)),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Record a sounding note on `channel` (0-based).
    pub fn note_on(&self, channel: u8, velocity: u8) {
        if channel >= 16 {
            return;
        }
        let ch = channel as usize;
        let scaled = ((velocity as u16 * VELOCITY_DISPLAY_PCT) / 100) as u8;
        self.velocity[ch].store(scaled, Ordering::Relaxed);
        let expression = self.expression[ch].load(Ordering::Relaxed);
        let expressed = ((scaled as u16 * expression as u16) / 127) as u8;
        self.activity[ch].store(expressed, Ordering::Relaxed);
        if expressed > self.peak[ch].load(Ordering::Relaxed) {
            self.peak[ch].store(expressed, Ordering::Relaxed);
            self.peak_ms[ch].store(self.now_ms(), Ordering::Relaxed);
        }
    }

    /// Clear activity for `channel`; the peak is left for hold/decay.
    pub fn note_off(&self, channel: u8) {
        if channel >= 16 {
            return;
        }
        let ch = channel as usize;
        self.velocity[ch].store(0, Ordering::Relaxed);
        self.activity[ch].store(0, Ordering::Relaxed);
    }

    /// Expression (CC 11) modulates the displayed bar height.
    pub fn control_change(&self, channel: u8, cc: u8, value: u8) {
        if channel >= 16 || cc != CC_EXPRESSION {
            return;
        }
        let ch = channel as usize;
        self.expression[ch].store(value, Ordering::Relaxed);
        let velocity = self.velocity[ch].load(Ordering::Relaxed);
        if velocity > 0 {
            let expressed = ((velocity as u16 * value as u16) / 127) as u8;
            self.activity[ch].store(expressed, Ordering::Relaxed);
        }
    }

    /// Drop all state, e.g. when a new song starts.
    pub fn reset(&self) {
        for ch in 0..16 {
            self.velocity[ch].store(0, Ordering::Relaxed);
            self.expression[ch].store(127, Ordering::Relaxed);
            self.activity[ch].store(0, Ordering::Relaxed);
            self.peak[ch].store(0, Ordering::Relaxed);
            self.peak_ms[ch].store(0, Ordering::Relaxed);
        }
    }

    /// Read one channel's current level.
    pub fn level(&self, channel: u8) -> ChannelLevel {
        if channel >= 16 {
            return ChannelLevel::default();
        }
        let ch = channel as usize;
        ChannelLevel {
            activity: self.activity[ch].load(Ordering::Relaxed),
            peak: self.peak[ch].load(Ordering::Relaxed),
            peak_ms: self.peak_ms[ch].load(Ordering::Relaxed),
        }
    }

    /// Snapshot all 16 channels.
    pub fn snapshot(&self) -> [ChannelLevel; 16] {
        std::array::from_fn(|ch| self.level(ch as u8))
    }
}

/// Sink decorator that feeds the activity table from outgoing traffic.
///
/// Wrap the real sink with this and hand the same [`ChannelActivity`] to
/// the UI; both the player and the input router then light the visualizer
/// without knowing it exists.
pub struct MonitoredSink<S> {
    inner: S,
    activity: Arc<ChannelActivity>,
}

impl<S: MidiOut> MonitoredSink<S> {
    pub fn new(inner: S, activity: Arc<ChannelActivity>) -> Self {
        Self { inner, activity }
    }

    pub fn activity(&self) -> Arc<ChannelActivity> {
        Arc::clone(&self.activity)
    }
}

impl<S: MidiOut> MidiOut for MonitoredSink<S> {
    fn note_on(&self, channel: u8, note: u8, velocity: u8) {
        self.inner.note_on(channel, note, velocity);
        if (1..=16).contains(&channel) && note <= 127 && velocity > 0 && velocity <= 127 {
            self.activity.note_on(channel - 1, velocity);
        } else if velocity == 0 {
            self.activity.note_off(channel.wrapping_sub(1));
        }
    }

    fn note_off(&self, channel: u8, note: u8, velocity: u8) {
        self.inner.note_off(channel, note, velocity);
        if (1..=16).contains(&channel) {
            self.activity.note_off(channel - 1);
        }
    }

    fn control_change(&self, channel: u8, cc: u8, value: u8) {
        self.inner.control_change(channel, cc, value);
        if (1..=16).contains(&channel) && cc <= 127 && value <= 127 {
            self.activity.control_change(channel - 1, cc, value);
        }
    }

    fn program_change(&self, channel: u8, program: u8) {
        self.inner.program_change(channel, program);
    }

    fn pitch_bend(&self, channel: u8, bend: i16) {
        self.inner.pitch_bend(channel, bend);
    }

    fn channel_pressure(&self, channel: u8, pressure: u8) {
        self.inner.channel_pressure(channel, pressure);
    }

    fn poly_pressure(&self, channel: u8, note: u8, pressure: u8) {
        self.inner.poly_pressure(channel, note, pressure);
    }

    fn sysex(&self, data: &[u8]) {
        self.inner.sysex(data);
    }

    fn realtime(&self, message: RealtimeMessage) {
        self.inner.realtime(message);
    }
}
