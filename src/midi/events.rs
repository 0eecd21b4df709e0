//! MIDI event model shared by the parser and the player.
//!
//! Channel-voice events carry their data inline; SysEx and meta events own
//! their payload, so cloning an event deep-copies it and dropping an event
//! frees it.

/// Channel-voice status nibbles (high nibble of the status byte).
pub const NOTE_OFF: u8 = 0x80;
pub const NOTE_ON: u8 = 0x90;
pub const POLY_PRESSURE: u8 = 0xA0;
pub const CONTROL_CHANGE: u8 = 0xB0;
pub const PROGRAM_CHANGE: u8 = 0xC0;
pub const CHANNEL_PRESSURE: u8 = 0xD0;
pub const PITCH_BEND: u8 = 0xE0;

/// System-exclusive status bytes.
pub const SYSEX_START: u8 = 0xF0;
pub const SYSEX_ESCAPE: u8 = 0xF7;

/// Meta-event marker status (never transmitted).
pub const META_EVENT: u8 = 0xFF;

/// Meta-event types the player cares about.
pub const META_TRACK_NAME: u8 = 0x03;
pub const META_END_OF_TRACK: u8 = 0x2F;
pub const META_TEMPO: u8 = 0x51;
pub const META_TIME_SIGNATURE: u8 = 0x58;

/// Controller numbers with special handling.
pub const CC_VOLUME: u8 = 7;
pub const CC_PAN: u8 = 10;
pub const CC_EXPRESSION: u8 = 11;
pub const CC_ALL_SOUND_OFF: u8 = 120;
pub const CC_RESET_CONTROLLERS: u8 = 121;
pub const CC_ALL_NOTES_OFF: u8 = 123;

/// What kind of event a [`MidiEvent`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Note/controller/program/bend/pressure traffic on one channel.
    ChannelVoice,
    /// An in-file meta event (tempo, time signature, end of track, ...).
    Meta,
    /// A system-exclusive message with an owned payload.
    SysEx,
}

/// One scheduled atom read from a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiEvent {
    /// Delta ticks since the previous event on the same track.
    pub delta: u32,
    /// Absolute tick position within the file.
    pub abs_tick: u32,
    /// Event classification.
    pub kind: EventKind,
    /// Masked status: high nibble for channel voice, `0xFF` for meta,
    /// `0xF0`/`0xF7` for sysex.
    pub status: u8,
    /// Channel (0-15), meaningful only for channel-voice events.
    pub channel: u8,
    /// First data byte; for meta events, the meta type.
    pub data1: u8,
    /// Second data byte (unused for program change / channel pressure).
    pub data2: u8,
    /// Owned payload for sysex events.
    pub payload: Vec<u8>,
    /// Index of the track this event came from.
    pub track: u8,
}

impl Default for MidiEvent {
    fn default() -> Self {
        Self {
            delta: 0,
            abs_tick: 0,
            kind: EventKind::ChannelVoice,
            status: 0,
            channel: 0,
            data1: 0,
            data2: 0,
            payload: Vec::new(),
            track: 0,
        }
    }
}

impl MidiEvent {
    /// True for a tempo meta event (the only meta the scheduler consumes).
    pub fn is_tempo_meta(&self) -> bool {
        self.kind == EventKind::Meta && self.data1 == META_TEMPO
    }
}

/// Number of data bytes that follow a channel-voice status.
pub fn voice_data_len(status_nibble: u8) -> u8 {
    match status_nibble {
        PROGRAM_CHANGE | CHANNEL_PRESSURE => 1,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_data_len() {
        assert_eq!(voice_data_len(NOTE_ON), 2);
        assert_eq!(voice_data_len(NOTE_OFF), 2);
        assert_eq!(voice_data_len(CONTROL_CHANGE), 2);
        assert_eq!(voice_data_len(PITCH_BEND), 2);
        assert_eq!(voice_data_len(PROGRAM_CHANGE), 1);
        assert_eq!(voice_data_len(CHANNEL_PRESSURE), 1);
    }

    #[test]
    fn test_clone_deep_copies_payload() {
        let mut event = MidiEvent {
            kind: EventKind::SysEx,
            status: SYSEX_START,
            payload: vec![0x7E, 0x7F, 0x09, 0x01],
            ..Default::default()
        };
        let copy = event.clone();
        event.payload.clear();
        assert_eq!(copy.payload, vec![0x7E, 0x7F, 0x09, 0x01]);
    }
}
