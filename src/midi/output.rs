//! Byte sinks for outgoing MIDI.
//!
//! [`MidiOut`] is the write-only contract the player and input router emit
//! through. Channels are 1-based at this boundary (matching the wire), and
//! out-of-range arguments are dropped here so upstream code never has to
//! re-validate. [`StreamSink`] frames messages onto any `io::Write` (a
//! 31,250-baud serial port handle in the hardware build); [`CaptureSink`]
//! records structured messages for tests and embedders.

use std::io::Write;

use parking_lot::Mutex;

use super::events::{CC_ALL_NOTES_OFF, CC_ALL_SOUND_OFF, CC_RESET_CONTROLLERS};

/// System-realtime messages (single status byte, may interleave anywhere).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeMessage {
    Clock,
    Start,
    Continue,
    Stop,
}

impl RealtimeMessage {
    /// The wire byte for this message.
    pub fn byte(self) -> u8 {
        match self {
            RealtimeMessage::Clock => 0xF8,
            RealtimeMessage::Start => 0xFA,
            RealtimeMessage::Continue => 0xFB,
            RealtimeMessage::Stop => 0xFC,
        }
    }
}

/// Build a status byte from a voice nibble and a 1-based channel.
///
/// Returns `None` for channels outside 1-16, which callers treat as
/// "drop the message".
fn voice_status(nibble: u8, channel: u8) -> Option<u8> {
    if (1..=16).contains(&channel) {
        Some(nibble | (channel - 1))
    } else {
        None
    }
}

/// Write-only MIDI byte sink.
///
/// Implementations must serialize whole messages: bytes of one message are
/// never interleaved with bytes of another.
pub trait MidiOut: Send + Sync {
    fn note_on(&self, channel: u8, note: u8, velocity: u8);
    fn note_off(&self, channel: u8, note: u8, velocity: u8);
    fn control_change(&self, channel: u8, cc: u8, value: u8);
    fn program_change(&self, channel: u8, program: u8);
    /// `bend` is the signed 14-bit value, -8192..=8191 (0 = center).
    fn pitch_bend(&self, channel: u8, bend: i16);
    fn channel_pressure(&self, channel: u8, pressure: u8);
    fn poly_pressure(&self, channel: u8, note: u8, pressure: u8);
    /// Transmit a payload framed as `F0 .. F7`.
    fn sysex(&self, data: &[u8]);
    fn realtime(&self, message: RealtimeMessage);

    /// CC 123 (All Notes Off) on every channel.
    fn all_notes_off(&self) {
        for ch in 1..=16 {
            self.control_change(ch, CC_ALL_NOTES_OFF, 0);
        }
    }

    /// Heavy-handed reset: All Sound Off, All Notes Off and an explicit
    /// NoteOff for every note on every channel.
    fn panic(&self) {
        for ch in 1..=16 {
            self.control_change(ch, CC_ALL_SOUND_OFF, 0);
            self.control_change(ch, CC_ALL_NOTES_OFF, 0);
            for note in 0..=127 {
                self.note_off(ch, note, 0);
            }
        }
    }

    /// All Sound Off + All Notes Off + Reset All Controllers on every
    /// channel; used between songs.
    fn reset_device(&self) {
        for ch in 1..=16 {
            self.control_change(ch, CC_ALL_SOUND_OFF, 0);
            self.control_change(ch, CC_ALL_NOTES_OFF, 0);
            self.control_change(ch, CC_RESET_CONTROLLERS, 0);
        }
    }
}

/// Sink that frames MIDI messages onto an `io::Write`.
///
/// The writer is guarded by a mutex so one message is always written as a
/// contiguous burst. Write failures are logged and the message dropped;
/// a serial link has no useful retry story mid-stream.
pub struct StreamSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> StreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer: Mutex::new(writer) }
    }

    /// Consume the sink and hand the writer back.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn send(&self, bytes: &[u8]) {
        let mut writer = self.writer.lock();
        if let Err(e) = writer.write_all(bytes) {
            log::warn!("MIDI write failed ({} bytes): {}", bytes.len(), e);
        }
    }
}

impl<W: Write + Send> MidiOut for StreamSink<W> {
    fn note_on(&self, channel: u8, note: u8, velocity: u8) {
        if note > 127 || velocity > 127 {
            return;
        }
        if let Some(status) = voice_status(super::events::NOTE_ON, channel) {
            self.send(&[status, note, velocity]);
        }
    }

    fn note_off(&self, channel: u8, note: u8, velocity: u8) {
        if note > 127 || velocity > 127 {
            return;
        }
        if let Some(status) = voice_status(super::events::NOTE_OFF, channel) {
            self.send(&[status, note, velocity]);
        }
    }

    fn control_change(&self, channel: u8, cc: u8, value: u8) {
        if cc > 127 || value > 127 {
            return;
        }
        if let Some(status) = voice_status(super::events::CONTROL_CHANGE, channel) {
            self.send(&[status, cc, value]);
        }
    }

    fn program_change(&self, channel: u8, program: u8) {
        if program > 127 {
            return;
        }
        if let Some(status) = voice_status(super::events::PROGRAM_CHANGE, channel) {
            self.send(&[status, program]);
        }
    }

    fn pitch_bend(&self, channel: u8, bend: i16) {
        let value = (bend.clamp(-8192, 8191) + 8192) as u16;
        if let Some(status) = voice_status(super::events::PITCH_BEND, channel) {
            self.send(&[status, (value & 0x7F) as u8, (value >> 7) as u8]);
        }
    }

    fn channel_pressure(&self, channel: u8, pressure: u8) {
        if pressure > 127 {
            return;
        }
        if let Some(status) = voice_status(super::events::CHANNEL_PRESSURE, channel) {
            self.send(&[status, pressure]);
        }
    }

    fn poly_pressure(&self, channel: u8, note: u8, pressure: u8) {
        if note > 127 || pressure > 127 {
            return;
        }
        if let Some(status) = voice_status(super::events::POLY_PRESSURE, channel) {
            self.send(&[status, note, pressure]);
        }
    }

    fn sysex(&self, data: &[u8]) {
        // Frame in one burst so nothing interleaves mid-message.
        let mut framed = Vec::with_capacity(data.len() + 2);
        framed.push(super::events::SYSEX_START);
        framed.extend_from_slice(data);
        framed.push(super::events::SYSEX_ESCAPE);
        self.send(&framed);
    }

    fn realtime(&self, message: RealtimeMessage) {
        self.send(&[message.byte()]);
    }
}

/// A structured message captured by [`CaptureSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
    ControlChange { channel: u8, cc: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    PitchBend { channel: u8, bend: i16 },
    ChannelPressure { channel: u8, pressure: u8 },
    PolyPressure { channel: u8, note: u8, pressure: u8 },
    SysEx(Vec<u8>),
    Realtime(RealtimeMessage),
}

/// Sink that records every message, for tests and software consumers.
#[derive(Default)]
pub struct CaptureSink {
    messages: Mutex<Vec<OutMessage>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything captured so far.
    pub fn take(&self) -> Vec<OutMessage> {
        std::mem::take(&mut *self.messages.lock())
    }

    /// Copy of everything captured so far.
    pub fn messages(&self) -> Vec<OutMessage> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    fn push(&self, message: OutMessage) {
        self.messages.lock().push(message);
    }
}

impl MidiOut for CaptureSink {
    fn note_on(&self, channel: u8, note: u8, velocity: u8) {
        if !(1..=16).contains(&channel) || note > 127 || velocity > 127 {
            return;
        }
        self.push(OutMessage::NoteOn { channel, note, velocity });
    }

    fn note_off(&self, channel: u8, note: u8, velocity: u8) {
        if !(1..=16).contains(&channel) || note > 127 || velocity > 127 {
            return;
        }
        self.push(OutMessage::NoteOff { channel, note, velocity });
    }

    fn control_change(&self, channel: u8, cc: u8, value: u8) {
        if !(1..=16).contains(&channel) || cc > 127 || value > 127 {
            return;
        }
        self.push(OutMessage::ControlChange { channel, cc, value });
    }

    fn program_change(&self, channel: u8, program: u8) {
        if !(1..=16).contains(&channel) || program > 127 {
            return;
        }
        self.push(OutMessage::ProgramChange { channel, program });
    }

    fn pitch_bend(&self, channel: u8, bend: i16) {
        if !(1..=16).contains(&channel) {
            return;
        }
        self.push(OutMessage::PitchBend { channel, bend: bend.clamp(-8192, 8191) });
    }

    fn channel_pressure(&self, channel: u8, pressure: u8) {
        if !(1..=16).contains(&channel) || pressure > 127 {
            return;
        }
        self.push(OutMessage::ChannelPressure { channel, pressure });
    }

    fn poly_pressure(&self, channel: u8, note: u8, pressure: u8) {
        if !(1..=16).contains(&channel) || note > 127 || pressure > 127 {
            return;
        }
        self.push(OutMessage::PolyPressure { channel, note, pressure });
    }

    fn sysex(&self, data: &[u8]) {
        self.push(OutMessage::SysEx(data.to_vec()));
    }

    fn realtime(&self, message: RealtimeMessage) {
        self.push(OutMessage::Realtime(message));
    }
}

/// Sink backed by an OS MIDI output port via `midir`.
#[cfg(feature = "midir-out")]
pub struct DeviceSink {
    connection: Mutex<midir::MidiOutputConnection>,
}

#[cfg(feature = "midir-out")]
impl DeviceSink {
    /// Connect to the output port at `port_index`.
    pub fn connect(port_index: usize) -> Result<Self, String> {
        let out = midir::MidiOutput::new("smfplay-out")
            .map_err(|e| format!("failed to create MIDI output: {}", e))?;
        let ports = out.ports();
        let port = ports
            .get(port_index)
            .ok_or_else(|| format!("output port index {} not found", port_index))?;
        let name = out
            .port_name(port)
            .unwrap_or_else(|_| format!("Port {}", port_index));
        log::info!("connecting MIDI output to: {}", name);
        let connection = out
            .connect(port, "smfplay-port")
            .map_err(|e| format!("failed to connect MIDI output: {}", e))?;
        Ok(Self { connection: Mutex::new(connection) })
    }

    fn send(&self, bytes: &[u8]) {
        if let Err(e) = self.connection.lock().send(bytes) {
            log::warn!("MIDI device send failed: {}", e);
        }
    }
}

#[cfg(feature = "midir-out")]
impl MidiOut for DeviceSink {
    fn note_on(&self, channel: u8, note: u8, velocity: u8) {
        if note > 127 || velocity > 127 {
            return;
        }
        if let Some(status) = voice_status(super::events::NOTE_ON, channel) {
            self.send(&[status, note, velocity]);
        }
    }

    fn note_off(&self, channel: u8, note: u8, velocity: u8) {
        if note > 127 || velocity > 127 {
            return;
        }
        if let Some(status) = voice_status(super::events::NOTE_OFF, channel) {
            self.send(&[status, note, velocity]);
        }
    }

    fn control_change(&self, channel: u8, cc: u8, value: u8) {
        if cc > 127 || value > 127 {
            return;
        }
        if let Some(status) = voice_status(super::events::CONTROL_CHANGE, channel) {
            self.send(&[status, cc, value]);
        }
    }

    fn program_change(&self, channel: u8, program: u8) {
        if program > 127 {
            return;
        }
        if let Some(status) = voice_status(super::events::PROGRAM_CHANGE, channel) {
            self.send(&[status, program]);
        }
    }

    fn pitch_bend(&self, channel: u8, bend: i16) {
        let value = (bend.clamp(-8192, 8191) + 8192) as u16;
        if let Some(status) = voice_status(super::events::PITCH_BEND, channel) {
            self.send(&[status, (value & 0x7F) as u8, (value >> 7) as u8]);
        }
    }

    fn channel_pressure(&self, channel: u8, pressure: u8) {
        if pressure > 127 {
            return;
        }
        if let Some(status) = voice_status(super::events::CHANNEL_PRESSURE, channel) {
            self.send(&[status, pressure]);
        }
    }

    fn poly_pressure(&self, channel: u8, note: u8, pressure: u8) {
        if note > 127 || pressure > 127 {
            return;
        }
        if let Some(status) = voice_status(super::events::POLY_PRESSURE, channel) {
            self.send(&[status, note, pressure]);
        }
    }

    fn sysex(&self, data: &[u8]) {
        let mut framed = Vec::with_capacity(data.len() + 2);
        framed.push(super::events::SYSEX_START);
        framed.extend_from_slice(data);
        framed.push(super::events::SYSEX_ESCAPE);
        self.send(&framed);
    }

    fn realtime(&self, message: RealtimeMessage) {
        self.send(&[message.byte()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_sink_frames_messages() {
        let sink = StreamSink::new(Vec::new());
        sink.note_on(1, 60, 100);
        sink.program_change(2, 5);
        sink.pitch_bend(1, 0);
        sink.realtime(RealtimeMessage::Clock);
        let bytes = sink.into_inner();
        assert_eq!(
            bytes,
            vec![0x90, 60, 100, 0xC1, 5, 0xE0, 0x00, 0x40, 0xF8]
        );
    }

    #[test]
    fn test_stream_sink_drops_invalid() {
        let sink = StreamSink::new(Vec::new());
        sink.note_on(0, 60, 100);
        sink.note_on(17, 60, 100);
        sink.note_on(1, 128, 100);
        sink.control_change(1, 200, 0);
        assert!(sink.into_inner().is_empty());
    }

    #[test]
    fn test_sysex_framing() {
        let sink = StreamSink::new(Vec::new());
        sink.sysex(&[0x7E, 0x7F, 0x09, 0x01]);
        assert_eq!(sink.into_inner(), vec![0xF0, 0x7E, 0x7F, 0x09, 0x01, 0xF7]);
    }

    #[test]
    fn test_all_notes_off_covers_every_channel() {
        let sink = CaptureSink::new();
        sink.all_notes_off();
        let messages = sink.take();
        assert_eq!(messages.len(), 16);
        for (i, message) in messages.iter().enumerate() {
            assert_eq!(
                *message,
                OutMessage::ControlChange { channel: i as u8 + 1, cc: 123, value: 0 }
            );
        }
    }

    #[test]
    fn test_panic_sends_explicit_note_offs() {
        let sink = CaptureSink::new();
        sink.panic();
        // 16 channels x (2 CCs + 128 note offs)
        assert_eq!(sink.len(), 16 * 130);
    }
}
