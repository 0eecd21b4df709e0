//! Streaming Standard MIDI File parser.
//!
//! Each track gets its own cursor with a 512-byte read window, so playback
//! interleaves N tracks with bounded memory and without a seek per byte.
//! Events are parsed lazily: one event per track is buffered ahead, and
//! [`MidiFileParser::read_next_event`] merges the buffers into a single
//! tick-ordered stream.
//!
//! Corrupt input never escapes as an error mid-stream: a truncated chunk,
//! an over-long varint or an unknown status simply ends that track and the
//! remaining tracks play on. Only `open`/`reset` and the whole-file scans
//! are fallible.

use crate::error::PlayerError;
use crate::storage::reader::{read_exact, BlockReader};

use super::events::{
    voice_data_len, EventKind, MidiEvent, META_END_OF_TRACK, META_EVENT, META_TEMPO,
    META_TIME_SIGNATURE, META_TRACK_NAME, SYSEX_ESCAPE, SYSEX_START,
};

/// Hard limit on simultaneously parsed tracks; files declaring more are
/// clipped, matching the 16 output channels.
pub const MAX_TRACKS: usize = 16;

/// Per-track read window size in bytes.
const TRACK_WINDOW: usize = 512;

/// Default tempo when a file carries no tempo meta (120 BPM).
pub const DEFAULT_TEMPO: u32 = 500_000;

/// Accepted tempo meta range in microseconds per quarter note
/// (600 BPM down to 6 BPM); values outside keep the previous tempo.
const TEMPO_MIN: u32 = 100_000;
const TEMPO_MAX: u32 = 10_000_000;

/// Length-scan corruption guard: no sane file has a single delta this big.
const MAX_SCAN_DELTA: u32 = 500_000;

/// Initial-tempo scan looks at this many events of track 0 at most.
const TEMPO_SCAN_EVENTS: usize = 100;

/// Parsed `MThd` fields plus live tempo/time-signature state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FileHeader {
    /// SMF format, 0 or 1.
    pub format: u16,
    /// Number of tracks actually parsed (clipped at [`MAX_TRACKS`]).
    pub track_count: u16,
    /// Ticks per quarter note (PPQN), always positive.
    pub division: u16,
    /// Current microseconds per quarter note, updated by tempo metas.
    pub tempo: u32,
    /// Time-signature numerator.
    pub numerator: u8,
    /// Time-signature denominator (already decoded from the power field).
    pub denominator: u8,
    /// Last track name seen, truncated to 63 bytes.
    pub track_name: String,
}

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            format: 0,
            track_count: 0,
            division: 0,
            tempo: DEFAULT_TEMPO,
            numerator: 4,
            denominator: 4,
            track_name: String::new(),
        }
    }
}

/// Read state for one `MTrk` chunk.
struct TrackCursor {
    /// Absolute file offset of the first event byte.
    start: u32,
    /// Chunk length in bytes.
    len: u32,
    /// Track-relative offset of the next unread byte.
    pos: u32,
    /// Absolute tick reached so far on this track.
    tick: u32,
    /// Last channel-voice status; 0 when meta/sysex cleared it.
    running_status: u8,
    ended: bool,
    /// Next event, parsed ahead for the merge.
    buffered: Option<MidiEvent>,
    window: [u8; TRACK_WINDOW],
    window_pos: u16,
    window_len: u16,
    io_failed: bool,
}

impl TrackCursor {
    fn new(start: u32, len: u32) -> Self {
        Self {
            start,
            len,
            pos: 0,
            tick: 0,
            running_status: 0,
            ended: false,
            buffered: None,
            window: [0; TRACK_WINDOW],
            window_pos: 0,
            window_len: 0,
            io_failed: false,
        }
    }

    /// Reset the cursor to the start of its chunk.
    fn rewind(&mut self) {
        self.pos = 0;
        self.tick = 0;
        self.running_status = 0;
        self.ended = false;
        self.buffered = None;
        self.window_pos = 0;
        self.window_len = 0;
    }

    /// Refill the window from `pos`. Returns false at end of track or on
    /// I/O failure (which also latches `io_failed`).
    fn fill_window(&mut self, reader: &mut dyn BlockReader) -> bool {
        let remaining = self.len.saturating_sub(self.pos);
        if remaining == 0 {
            self.window_len = 0;
            return false;
        }
        if let Err(e) = reader.seek(self.start + self.pos) {
            log::warn!("track seek failed at offset {}: {}", self.start + self.pos, e);
            self.io_failed = true;
            self.window_len = 0;
            return false;
        }
        let want = remaining.min(TRACK_WINDOW as u32) as usize;
        match reader.read(&mut self.window[..want]) {
            Ok(0) => {
                self.window_len = 0;
                false
            }
            Ok(n) => {
                self.window_len = n as u16;
                self.window_pos = 0;
                true
            }
            Err(e) => {
                log::warn!("track read failed: {}", e);
                self.io_failed = true;
                self.window_len = 0;
                false
            }
        }
    }

    /// Read one byte through the window; returns 0 past the end.
    fn read_byte(&mut self, reader: &mut dyn BlockReader) -> u8 {
        if self.window_pos >= self.window_len {
            if !self.fill_window(reader) {
                return 0;
            }
        }
        let byte = self.window[self.window_pos as usize];
        self.window_pos += 1;
        self.pos += 1;
        byte
    }

    /// Undo the last `read_byte`. If the window is already at its head the
    /// window is invalidated so the next read refills from `pos`.
    fn put_back(&mut self) {
        if self.pos == 0 {
            return;
        }
        self.pos -= 1;
        if self.window_pos > 0 {
            self.window_pos -= 1;
        } else {
            self.window_len = 0;
        }
    }

    /// Read a variable-length quantity, bounded at 4 bytes. `None` means
    /// the encoding is corrupt and the track should be abandoned.
    fn read_vlq(&mut self, reader: &mut dyn BlockReader) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..4 {
            let byte = self.read_byte(reader);
            value = (value << 7) | (byte & 0x7F) as u32;
            if byte & 0x80 == 0 {
                return Some(value);
            }
        }
        None
    }

    /// Read the next event's status byte, resolving running status.
    /// `None` means end of data or no status available to reuse.
    fn read_status(&mut self, reader: &mut dyn BlockReader) -> Option<u8> {
        let byte = self.read_byte(reader);
        if byte >= 0x80 {
            if byte < 0xF0 {
                self.running_status = byte;
            }
            return Some(byte);
        }
        if byte == 0 && self.window_len == 0 {
            // Failed read, not a data byte.
            return None;
        }
        if self.running_status < 0x80 {
            return None;
        }
        self.put_back();
        Some(self.running_status)
    }

    /// Skip `count` bytes without materializing them.
    fn skip(&mut self, reader: &mut dyn BlockReader, count: u32) {
        for _ in 0..count {
            if self.pos >= self.len {
                return;
            }
            self.read_byte(reader);
        }
    }
}

/// Multi-track SMF parser over a [`BlockReader`].
pub struct MidiFileParser {
    reader: Option<Box<dyn BlockReader + Send>>,
    header: FileHeader,
    tracks: Vec<TrackCursor>,
    all_ended: bool,
    length_ticks: u32,
    sysex_count: u16,
}

impl Default for MidiFileParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MidiFileParser {
    pub fn new() -> Self {
        Self {
            reader: None,
            header: FileHeader::default(),
            tracks: Vec::new(),
            all_ended: false,
            length_ticks: 0,
            sysex_count: 0,
        }
    }

    /// Open a file: validate the header, locate every track chunk and
    /// pre-read each track's first event.
    pub fn open(&mut self, mut reader: Box<dyn BlockReader + Send>) -> Result<(), PlayerError> {
        self.close();

        reader.seek(0)?;
        let mut head = [0u8; 14];
        read_exact(&mut *reader, &mut head)?;
        if &head[0..4] != b"MThd" {
            return Err(PlayerError::BadHeader);
        }
        let declared = u32::from_be_bytes([head[4], head[5], head[6], head[7]]);
        if declared != 6 {
            return Err(PlayerError::BadHeader);
        }
        let format = u16::from_be_bytes([head[8], head[9]]);
        if format > 1 {
            return Err(PlayerError::UnsupportedFormat(format));
        }
        let mut track_count = u16::from_be_bytes([head[10], head[11]]);
        let division = u16::from_be_bytes([head[12], head[13]]);
        // SMPTE division (high bit) and zero are both rejected; the
        // scheduler only speaks PPQN.
        if division == 0 || division & 0x8000 != 0 {
            return Err(PlayerError::BadHeader);
        }
        if track_count as usize > MAX_TRACKS {
            log::debug!("clipping {} declared tracks to {}", track_count, MAX_TRACKS);
            track_count = MAX_TRACKS as u16;
        }

        self.header.format = format;
        self.header.track_count = track_count;
        self.header.division = division;

        // Walk the MTrk chunk headers.
        let mut offset = 14u32;
        let mut tracks = Vec::with_capacity(track_count as usize);
        for _ in 0..track_count {
            reader.seek(offset)?;
            let mut chunk = [0u8; 8];
            read_exact(&mut *reader, &mut chunk)?;
            if &chunk[0..4] != b"MTrk" {
                return Err(PlayerError::BadHeader);
            }
            let len = u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            let start = offset + 8;
            tracks.push(TrackCursor::new(start, len));
            offset = start.saturating_add(len);
        }

        self.reader = Some(reader);
        self.tracks = tracks;
        self.all_ended = false;
        self.prebuffer();
        if self.take_io_error() {
            self.close();
            return Err(PlayerError::io("read failed while buffering first events"));
        }
        Ok(())
    }

    /// Drop the reader and all track state.
    pub fn close(&mut self) {
        self.reader = None;
        self.tracks.clear();
        self.header = FileHeader::default();
        self.all_ended = false;
        self.length_ticks = 0;
        self.sysex_count = 0;
    }

    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// True once every track has ended and the merge is drained.
    pub fn is_end(&self) -> bool {
        self.all_ended
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Total file length in ticks, if known (scanned or cached).
    pub fn length_ticks(&self) -> u32 {
        self.length_ticks
    }

    pub fn set_length_ticks(&mut self, ticks: u32) {
        self.length_ticks = ticks;
    }

    /// Number of sysex messages found by the length scan.
    pub fn sysex_count(&self) -> u16 {
        self.sysex_count
    }

    pub fn set_sysex_count(&mut self, count: u16) {
        self.sysex_count = count;
    }

    /// Extend the known length when playback runs past the scanned value.
    pub fn update_length_from_playback(&mut self, ticks: u32) {
        if ticks > self.length_ticks {
            self.length_ticks = ticks;
        }
    }

    /// Highest tick any track has reached so far.
    pub fn max_track_tick(&self) -> u32 {
        self.tracks.iter().map(|t| t.tick).max().unwrap_or(0)
    }

    /// Latched I/O failure from any track cursor; clears on read.
    pub fn take_io_error(&mut self) -> bool {
        let mut failed = false;
        for track in &mut self.tracks {
            if track.io_failed {
                failed = true;
                track.io_failed = false;
            }
        }
        failed
    }

    /// Return the earliest buffered event across all live tracks, ties
    /// broken by lowest track index, and re-buffer that track.
    pub fn read_next_event(&mut self) -> Option<MidiEvent> {
        if self.all_ended {
            return None;
        }
        let mut earliest: Option<usize> = None;
        let mut earliest_tick = u32::MAX;
        for (i, track) in self.tracks.iter().enumerate() {
            if track.ended {
                continue;
            }
            if let Some(event) = &track.buffered {
                if event.abs_tick < earliest_tick {
                    earliest_tick = event.abs_tick;
                    earliest = Some(i);
                }
            }
        }
        let Some(i) = earliest else {
            self.all_ended = true;
            return None;
        };
        let next = self.read_track_event(i);
        std::mem::replace(&mut self.tracks[i].buffered, next)
    }

    /// Rewind every cursor, restore default tempo/time signature and
    /// re-buffer first events. Fails only on I/O.
    pub fn reset(&mut self) -> Result<(), PlayerError> {
        let Some(reader) = self.reader.as_deref_mut() else {
            return Err(PlayerError::NoFile);
        };
        // Probe the device before trusting the rewind.
        reader.seek(0)?;
        self.header.tempo = DEFAULT_TEMPO;
        self.header.numerator = 4;
        self.header.denominator = 4;
        self.restore_tracks()
    }

    /// Scan the head of track 0 (bounded) for the first valid tempo meta,
    /// then restore every cursor to pristine state. A restore failure is
    /// fatal and surfaces as `Err`.
    pub fn scan_for_initial_tempo(&mut self) -> Result<(), PlayerError> {
        if self.reader.is_none() {
            return Err(PlayerError::NoFile);
        }
        if self.tracks.is_empty() {
            return Ok(());
        }

        let mut found = false;
        {
            let Some(reader) = self.reader.as_deref_mut() else {
                return Err(PlayerError::NoFile);
            };
            let track = &mut self.tracks[0];
            track.rewind();

            for _ in 0..TEMPO_SCAN_EVENTS {
                if track.pos >= track.len || track.ended {
                    break;
                }
                let Some(_delta) = track.read_vlq(reader) else {
                    break;
                };
                let Some(status) = track.read_status(reader) else {
                    break;
                };
                match status {
                    META_EVENT => {
                        let meta = track.read_byte(reader);
                        let Some(len) = track.read_vlq(reader) else {
                            break;
                        };
                        track.running_status = 0;
                        if meta == META_END_OF_TRACK {
                            break;
                        }
                        if meta == META_TEMPO && len == 3 {
                            let tempo = ((track.read_byte(reader) as u32) << 16)
                                | ((track.read_byte(reader) as u32) << 8)
                                | track.read_byte(reader) as u32;
                            if (TEMPO_MIN..=TEMPO_MAX).contains(&tempo) {
                                self.header.tempo = tempo;
                                found = true;
                                break;
                            }
                        } else {
                            track.skip(reader, len);
                        }
                    }
                    SYSEX_START | SYSEX_ESCAPE => {
                        track.running_status = 0;
                        let Some(len) = track.read_vlq(reader) else {
                            break;
                        };
                        track.skip(reader, len);
                    }
                    _ => {
                        track.skip(reader, voice_data_len(status & 0xF0) as u32);
                    }
                }
            }
        }

        if !found {
            self.header.tempo = DEFAULT_TEMPO;
        }
        self.restore_tracks()
    }

    /// Walk every track to completion without materializing payloads,
    /// recording the maximum tick and the sysex count, then restore all
    /// cursors.
    pub fn calculate_length(&mut self) -> Result<(), PlayerError> {
        if self.reader.is_none() {
            return Err(PlayerError::NoFile);
        }
        self.length_ticks = 0;
        self.sysex_count = 0;

        for i in 0..self.tracks.len() {
            let Some(reader) = self.reader.as_deref_mut() else {
                return Err(PlayerError::NoFile);
            };
            let track = &mut self.tracks[i];
            track.rewind();
            let mut abs_tick = 0u32;

            while !track.ended {
                if track.pos >= track.len {
                    break;
                }
                let Some(delta) = track.read_vlq(reader) else {
                    break;
                };
                if delta > MAX_SCAN_DELTA {
                    log::debug!("track {} has delta {} ticks, treating as corrupt", i, delta);
                    break;
                }
                abs_tick = abs_tick.saturating_add(delta);
                let Some(status) = track.read_status(reader) else {
                    break;
                };
                match status {
                    META_EVENT => {
                        let meta = track.read_byte(reader);
                        let Some(len) = track.read_vlq(reader) else {
                            break;
                        };
                        track.running_status = 0;
                        if meta == META_END_OF_TRACK {
                            break;
                        }
                        track.skip(reader, len);
                    }
                    SYSEX_START | SYSEX_ESCAPE => {
                        track.running_status = 0;
                        self.sysex_count = self.sysex_count.saturating_add(1);
                        let Some(len) = track.read_vlq(reader) else {
                            break;
                        };
                        track.skip(reader, len);
                    }
                    _ => {
                        track.skip(reader, voice_data_len(status & 0xF0) as u32);
                    }
                }
            }

            if abs_tick > self.length_ticks {
                self.length_ticks = abs_tick;
            }
        }

        self.restore_tracks()
    }

    /// Rewind all cursors and re-buffer first events.
    fn restore_tracks(&mut self) -> Result<(), PlayerError> {
        for track in &mut self.tracks {
            track.rewind();
        }
        self.all_ended = false;
        self.prebuffer();
        if self.take_io_error() {
            return Err(PlayerError::io("read failed while restoring track cursors"));
        }
        Ok(())
    }

    fn prebuffer(&mut self) {
        for i in 0..self.tracks.len() {
            let event = self.read_track_event(i);
            self.tracks[i].buffered = event;
        }
    }

    /// Parse one event from track `idx`. `None` ends the track (EOT,
    /// truncation, corruption or I/O failure).
    fn read_track_event(&mut self, idx: usize) -> Option<MidiEvent> {
        let reader = self.reader.as_deref_mut()?;
        let track = &mut self.tracks[idx];

        loop {
            if track.ended {
                return None;
            }
            if track.pos >= track.len {
                track.ended = true;
                return None;
            }

            let Some(delta) = track.read_vlq(reader) else {
                track.ended = true;
                return None;
            };
            track.tick = track.tick.saturating_add(delta);

            let Some(status) = track.read_status(reader) else {
                track.ended = true;
                return None;
            };

            match status {
                META_EVENT => {
                    let meta = track.read_byte(reader);
                    let Some(len) = track.read_vlq(reader) else {
                        track.ended = true;
                        return None;
                    };
                    track.running_status = 0;
                    match meta {
                        META_TEMPO => {
                            if len == 3 {
                                let tempo = ((track.read_byte(reader) as u32) << 16)
                                    | ((track.read_byte(reader) as u32) << 8)
                                    | track.read_byte(reader) as u32;
                                if (TEMPO_MIN..=TEMPO_MAX).contains(&tempo) {
                                    self.header.tempo = tempo;
                                } else {
                                    log::debug!("ignoring out-of-range tempo {} us/quarter", tempo);
                                }
                            } else {
                                track.skip(reader, len);
                            }
                        }
                        META_TIME_SIGNATURE => {
                            if len == 4 {
                                self.header.numerator = track.read_byte(reader);
                                let power = track.read_byte(reader) as u32;
                                if let Some(den) = 1u8.checked_shl(power) {
                                    self.header.denominator = den;
                                }
                                track.read_byte(reader); // clocks per metronome click
                                track.read_byte(reader); // 32nds per quarter
                            } else {
                                track.skip(reader, len);
                            }
                        }
                        META_TRACK_NAME => {
                            if len < 64 {
                                let mut name = [0u8; 64];
                                for slot in name.iter_mut().take(len as usize) {
                                    *slot = track.read_byte(reader);
                                }
                                self.header.track_name =
                                    String::from_utf8_lossy(&name[..len as usize]).into_owned();
                            } else {
                                track.skip(reader, len);
                            }
                        }
                        META_END_OF_TRACK => {
                            track.ended = true;
                            return None;
                        }
                        _ => {
                            track.skip(reader, len);
                        }
                    }
                    return Some(MidiEvent {
                        delta,
                        abs_tick: track.tick,
                        kind: EventKind::Meta,
                        status: META_EVENT,
                        channel: 0,
                        data1: meta,
                        data2: 0,
                        payload: Vec::new(),
                        track: idx as u8,
                    });
                }
                SYSEX_START | SYSEX_ESCAPE => {
                    track.running_status = 0;
                    let Some(len) = track.read_vlq(reader) else {
                        track.ended = true;
                        return None;
                    };
                    let mut payload = Vec::new();
                    if payload.try_reserve_exact(len as usize).is_err() {
                        log::warn!("dropping {}-byte sysex, allocation failed", len);
                        track.skip(reader, len);
                        continue;
                    }
                    for _ in 0..len {
                        if track.pos >= track.len {
                            break;
                        }
                        payload.push(track.read_byte(reader));
                    }
                    return Some(MidiEvent {
                        delta,
                        abs_tick: track.tick,
                        kind: EventKind::SysEx,
                        status,
                        channel: 0,
                        data1: 0,
                        data2: 0,
                        payload,
                        track: idx as u8,
                    });
                }
                _ => {
                    let kind = status & 0xF0;
                    let channel = status & 0x0F;
                    if track.len.saturating_sub(track.pos) < voice_data_len(kind) as u32 {
                        // Data bytes chopped off: truncated chunk.
                        track.ended = true;
                        return None;
                    }
                    let data1 = track.read_byte(reader);
                    let data2 = if voice_data_len(kind) == 2 {
                        track.read_byte(reader)
                    } else {
                        0
                    };
                    return Some(MidiEvent {
                        delta,
                        abs_tick: track.tick,
                        kind: EventKind::ChannelVoice,
                        status: kind,
                        channel,
                        data1,
                        data2,
                        payload: Vec::new(),
                        track: idx as u8,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::reader::MemReader;

    /// Build a type-0 file around the given track bytes (EOT not included).
    pub(crate) fn type0(division: u16, track: &[u8]) -> Vec<u8> {
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

    /// Build a type-1 file from raw track bodies (each without EOT).
    pub(crate) fn type1(division: u16, tracks: &[&[u8]]) -> Vec<u8> {
        let mut file = Vec::new();
        file.extend_from_slice(b"MThd");
        file.extend_from_slice(&6u32.to_be_bytes());
        file.extend_from_slice(&1u16.to_be_bytes());
        file.extend_from_slice(&(tracks.len() as u16).to_be_bytes());
        file.extend_from_slice(&division.to_be_bytes());
        for track in tracks {
            let mut body = track.to_vec();
            body.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);
            file.extend_from_slice(b"MTrk");
            file.extend_from_slice(&(body.len() as u32).to_be_bytes());
            file.extend_from_slice(&body);
        }
        file
    }

    const NOTE_ON_STATUS: u8 = 0x90;

    fn open(data: Vec<u8>) -> MidiFileParser {
        let mut parser = MidiFileParser::new();
        parser.open(Box::new(MemReader::new(data))).unwrap();
        parser
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let mut parser = MidiFileParser::new();
        let err = parser
            .open(Box::new(MemReader::new(b"RIFF0000".to_vec())))
            .unwrap_err();
        assert!(matches!(err, PlayerError::BadHeader | PlayerError::Io(_)));
    }

    #[test]
    fn test_open_rejects_format_2() {
        let mut file = type0(96, &[]);
        file[9] = 2; // format
        let mut parser = MidiFileParser::new();
        assert!(matches!(
            parser.open(Box::new(MemReader::new(file))),
            Err(PlayerError::UnsupportedFormat(2))
        ));
    }

    #[test]
    fn test_open_rejects_zero_and_smpte_division() {
        let mut file = type0(96, &[]);
        file[12] = 0;
        file[13] = 0;
        let mut parser = MidiFileParser::new();
        assert!(matches!(
            parser.open(Box::new(MemReader::new(file))),
            Err(PlayerError::BadHeader)
        ));

        let mut file = type0(96, &[]);
        file[12] = 0xE7; // SMPTE -25 fps
        let mut parser = MidiFileParser::new();
        assert!(matches!(
            parser.open(Box::new(MemReader::new(file))),
            Err(PlayerError::BadHeader)
        ));
    }

    #[test]
    fn test_single_track_events_in_order() {
        let mut parser = open(type0(
            96,
            &[
                0x00, 0x90, 0x3C, 0x64, // NoteOn ch0
                0x60, 0x80, 0x3C, 0x40, // NoteOff after 96 ticks
            ],
        ));
        let on = parser.read_next_event().unwrap();
        assert_eq!(on.status, NOTE_ON_STATUS);
        assert_eq!(on.abs_tick, 0);
        assert_eq!((on.data1, on.data2), (0x3C, 0x64));
        let off = parser.read_next_event().unwrap();
        assert_eq!(off.status, 0x80);
        assert_eq!(off.abs_tick, 96);
        assert!(parser.read_next_event().is_none());
        assert!(parser.is_end());
    }

    #[test]
    fn test_running_status() {
        let mut parser = open(type0(
            96,
            &[
                0x00, 0x90, 0x3C, 0x64, // NoteOn
                0x10, 0x3C, 0x00, // running status: NoteOn vel 0
            ],
        ));
        let first = parser.read_next_event().unwrap();
        assert_eq!(first.status, NOTE_ON_STATUS);
        let second = parser.read_next_event().unwrap();
        assert_eq!(second.status, NOTE_ON_STATUS);
        assert_eq!(second.channel, 0);
        assert_eq!(second.abs_tick, 16);
        assert_eq!(second.data2, 0);
    }

    #[test]
    fn test_running_status_not_honored_after_meta() {
        // NoteOn, then a meta event, then a data byte that would need
        // running status: the track must end rather than misparse.
        let mut parser = open(type0(
            96,
            &[
                0x00, 0x90, 0x3C, 0x64,
                0x00, 0xFF, 0x06, 0x01, 0x41, // marker meta "A"
                0x00, 0x3C, 0x00, // stale running status
            ],
        ));
        assert!(parser.read_next_event().is_some()); // note on
        assert!(parser.read_next_event().is_some()); // meta
        assert!(parser.read_next_event().is_none());
    }

    #[test]
    fn test_tempo_meta_updates_header_in_range_only() {
        let mut parser = open(type0(
            96,
            &[
                0x00, 0xFF, 0x51, 0x03, 0x0F, 0x42, 0x40, // 1,000,000 us/quarter
                0x00, 0xFF, 0x51, 0x03, 0x00, 0x00, 0x01, // 1 us/quarter: invalid
            ],
        ));
        let tempo = parser.read_next_event().unwrap();
        assert!(tempo.is_tempo_meta());
        assert_eq!(parser.header().tempo, 1_000_000);
        parser.read_next_event().unwrap();
        assert_eq!(parser.header().tempo, 1_000_000);
    }

    #[test]
    fn test_time_signature_meta() {
        let mut parser = open(type0(96, &[0x00, 0xFF, 0x58, 0x04, 0x03, 0x03, 0x18, 0x08]));
        parser.read_next_event().unwrap();
        assert_eq!(parser.header().numerator, 3);
        assert_eq!(parser.header().denominator, 8);
    }

    #[test]
    fn test_track_name_meta() {
        let mut parser = open(type0(96, &[0x00, 0xFF, 0x03, 0x05, b'I', b'n', b't', b'r', b'o']));
        parser.read_next_event().unwrap();
        assert_eq!(parser.header().track_name, "Intro");
    }

    #[test]
    fn test_sysex_payload_owned() {
        let mut parser = open(type0(96, &[0x00, 0xF0, 0x04, 0x7E, 0x7F, 0x09, 0x01]));
        let event = parser.read_next_event().unwrap();
        assert_eq!(event.kind, EventKind::SysEx);
        assert_eq!(event.payload, vec![0x7E, 0x7F, 0x09, 0x01]);
    }

    #[test]
    fn test_two_track_merge_orders_by_tick_then_track() {
        // Track 0: events at ticks 0 and 100; track 1: event at tick 0.
        let file = type1(
            96,
            &[
                &[0x00, 0x90, 0x3C, 0x64, 0x64, 0x80, 0x3C, 0x40],
                &[0x00, 0x91, 0x40, 0x64],
            ],
        );
        let mut parser = open(file);
        let first = parser.read_next_event().unwrap();
        assert_eq!((first.track, first.channel), (0, 0)); // tie at tick 0 -> track 0
        let second = parser.read_next_event().unwrap();
        assert_eq!((second.track, second.channel), (1, 1));
        let third = parser.read_next_event().unwrap();
        assert_eq!((third.track, third.abs_tick), (0, 100));
        assert!(parser.read_next_event().is_none());
    }

    #[test]
    fn test_abs_tick_non_decreasing() {
        let file = type1(
            96,
            &[
                &[0x00, 0x90, 0x3C, 0x64, 0x30, 0x80, 0x3C, 0x40, 0x30, 0x90, 0x3E, 0x64],
                &[0x20, 0x91, 0x40, 0x64, 0x20, 0x81, 0x40, 0x40],
            ],
        );
        let mut parser = open(file);
        let mut last = 0;
        while let Some(event) = parser.read_next_event() {
            assert!(event.abs_tick >= last);
            last = event.abs_tick;
        }
    }

    #[test]
    fn test_truncated_track_ends_quietly() {
        let mut file = type0(96, &[0x00, 0x90, 0x3C, 0x64, 0x60, 0x80, 0x3C, 0x40]);
        // Chop the EOT marker and half the second event.
        file.truncate(file.len() - 6);
        // Fix the declared chunk length to cover the truncation.
        let body_len = (file.len() - 22) as u32;
        file[18..22].copy_from_slice(&body_len.to_be_bytes());
        let mut parser = open(file);
        assert!(parser.read_next_event().is_some());
        assert!(parser.read_next_event().is_none());
    }

    #[test]
    fn test_overlong_vlq_terminates_track() {
        let mut parser = open(type0(96, &[0xFF, 0xFF, 0xFF, 0xFF, 0x90, 0x3C, 0x64]));
        assert!(parser.read_next_event().is_none());
    }

    #[test]
    fn test_reset_restores_defaults_and_rebuffers() {
        let mut parser = open(type0(
            96,
            &[0x00, 0xFF, 0x51, 0x03, 0x0F, 0x42, 0x40, 0x00, 0x90, 0x3C, 0x64],
        ));
        while parser.read_next_event().is_some() {}
        assert!(parser.is_end());
        parser.reset().unwrap();
        assert!(!parser.is_end());
        assert_eq!(parser.header().tempo, DEFAULT_TEMPO);
        let first = parser.read_next_event().unwrap();
        assert!(first.is_tempo_meta());
        assert_eq!(parser.header().tempo, 1_000_000);
    }

    #[test]
    fn test_scan_for_initial_tempo_restores_cursors() {
        let mut parser = open(type0(
            96,
            &[
                0x00, 0x90, 0x3C, 0x64,
                0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20, // 500,000 -> valid
            ],
        ));
        parser.scan_for_initial_tempo().unwrap();
        assert_eq!(parser.header().tempo, 500_000);
        // Cursors restored: full stream still available.
        let first = parser.read_next_event().unwrap();
        assert_eq!(first.abs_tick, 0);
        assert_eq!(first.status, NOTE_ON_STATUS);
    }

    #[test]
    fn test_scan_finds_tempo_on_track_zero_only() {
        let file = type1(
            96,
            &[
                &[0x00, 0x90, 0x3C, 0x64],
                &[0x00, 0xFF, 0x51, 0x03, 0x0F, 0x42, 0x40],
            ],
        );
        let mut parser = open(file);
        parser.scan_for_initial_tempo().unwrap();
        assert_eq!(parser.header().tempo, DEFAULT_TEMPO);
    }

    #[test]
    fn test_calculate_length_counts_sysex_and_restores() {
        let file = type1(
            96,
            &[
                &[0x00, 0x90, 0x3C, 0x64, 0x81, 0x40, 0x80, 0x3C, 0x40], // off at tick 192
                &[0x00, 0xF0, 0x02, 0x01, 0x02, 0x60, 0x91, 0x40, 0x64], // sysex + on at 96
            ],
        );
        let mut parser = open(file);
        parser.calculate_length().unwrap();
        assert_eq!(parser.length_ticks(), 192);
        assert_eq!(parser.sysex_count(), 1);
        // Stream intact after the scan.
        let mut count = 0;
        while parser.read_next_event().is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn test_calculate_length_matches_streamed_final_tick() {
        let file = type0(
            96,
            &[
                0x00, 0x90, 0x3C, 0x64,
                0x81, 0x40, 0x80, 0x3C, 0x40, // 192 ticks
                0x60, 0x90, 0x3E, 0x64, // 288 ticks
                0x60, 0x80, 0x3E, 0x40, // 384 ticks
            ],
        );
        let mut parser = open(file);
        parser.calculate_length().unwrap();
        let length = parser.length_ticks();
        parser.reset().unwrap();
        let mut last = 0;
        while let Some(event) = parser.read_next_event() {
            last = event.abs_tick;
        }
        assert_eq!(last, length);
    }

    #[test]
    fn test_window_putback_across_refill_boundary() {
        // Enough running-status note pairs to span several 512-byte
        // windows; every second event relies on put_back.
        let mut body = vec![0x00, 0x90, 0x3C, 0x64];
        for _ in 0..400 {
            body.extend_from_slice(&[0x01, 0x3C, 0x00]); // running status off
            body.extend_from_slice(&[0x01, 0x3C, 0x40]); // running status on
        }
        let mut parser = open(type0(96, &body));
        let mut count = 0;
        let mut last = 0;
        while let Some(event) = parser.read_next_event() {
            assert!(event.abs_tick >= last);
            last = event.abs_tick;
            count += 1;
        }
        assert_eq!(count, 801);
    }

    #[test]
    fn test_declared_track_count_clipped() {
        let mut file = Vec::new();
        file.extend_from_slice(b"MThd");
        file.extend_from_slice(&6u32.to_be_bytes());
        file.extend_from_slice(&1u16.to_be_bytes());
        file.extend_from_slice(&40u16.to_be_bytes()); // absurd count
        file.extend_from_slice(&96u16.to_be_bytes());
        for _ in 0..MAX_TRACKS {
            file.extend_from_slice(b"MTrk");
            file.extend_from_slice(&4u32.to_be_bytes());
            file.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);
        }
        let parser = open(file);
        assert_eq!(parser.header().track_count, MAX_TRACKS as u16);
    }
}
