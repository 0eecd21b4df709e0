//! MIDI input routing: Off, Thru and Keyboard modes.
//!
//! Incoming serial bytes land in a lock-free ring buffer (pushed from the
//! UART interrupt / reader thread) and are drained by the audio thread via
//! [`InputRouter::poll`]. A small wire decoder reassembles messages,
//! honoring running status; the router then forwards them according to the
//! active mode.

use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};

use super::events::{
    voice_data_len, CHANNEL_PRESSURE, CONTROL_CHANGE, NOTE_OFF, NOTE_ON, PITCH_BEND,
    POLY_PRESSURE, PROGRAM_CHANGE, SYSEX_ESCAPE, SYSEX_START,
};
use super::output::{MidiOut, RealtimeMessage};

/// Default capacity of the incoming byte queue.
pub const INPUT_QUEUE_CAPACITY: usize = 1024;

/// Thread-safe byte queue between the serial receiver and the router.
///
/// Producer side pushes raw bytes as they arrive; the consumer side is
/// drained from the audio thread with `try_lock` so it never blocks.
pub struct MidiInputQueue {
    producer: Mutex<ringbuf::HeapProd<u8>>,
    consumer: Mutex<ringbuf::HeapCons<u8>>,
    capacity: usize,
}

impl MidiInputQueue {
    pub fn new(capacity: usize) -> Self {
        let rb = HeapRb::new(capacity);
        let (producer, consumer) = rb.split();
        Self {
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            capacity,
        }
    }

    /// Push one received byte. Returns false if it was dropped (queue full
    /// or producer busy) - better to drop than to block a receive path.
    pub fn push(&self, byte: u8) -> bool {
        if let Some(mut producer) = self.producer.try_lock() {
            if producer.try_push(byte).is_ok() {
                return true;
            }
            log::debug!("MIDI input queue full (capacity {}), byte dropped", self.capacity);
        }
        false
    }

    /// Push a whole received message.
    pub fn push_slice(&self, bytes: &[u8]) -> usize {
        let mut pushed = 0;
        for &byte in bytes {
            if !self.push(byte) {
                break;
            }
            pushed += 1;
        }
        pushed
    }

    /// Pop one byte without blocking.
    pub fn pop(&self) -> Option<u8> {
        self.consumer.try_lock()?.try_pop()
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.try_lock().map(|c| c.is_empty()).unwrap_or(true)
    }
}

/// Input handling mode. Thru and Keyboard are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    Off,
    Thru,
    Keyboard,
}

/// A complete message assembled from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireMessage {
    Voice { status: u8, data1: u8, data2: u8 },
    Realtime(u8),
}

/// Byte-stream decoder with wire running status.
#[derive(Default)]
struct WireDecoder {
    status: u8,
    data: [u8; 2],
    have: u8,
    in_sysex: bool,
}

impl WireDecoder {
    fn feed(&mut self, byte: u8) -> Option<WireMessage> {
        if byte >= 0xF8 {
            // Realtime may interleave anywhere, even inside sysex.
            return Some(WireMessage::Realtime(byte));
        }
        if byte >= 0x80 {
            match byte {
                SYSEX_START => {
                    self.in_sysex = true;
                    self.status = 0;
                }
                SYSEX_ESCAPE => {
                    self.in_sysex = false;
                }
                _ if byte >= 0xF0 => {
                    // Other system-common messages cancel running status.
                    self.status = 0;
                }
                _ => {
                    self.status = byte;
                    self.have = 0;
                }
            }
            return None;
        }
        if self.in_sysex {
            // Incoming sysex is not bridged.
            return None;
        }
        if self.status == 0 {
            // Stray data byte with no status to attach to.
            return None;
        }
        self.data[self.have as usize] = byte;
        self.have += 1;
        let needed = voice_data_len(self.status & 0xF0);
        if self.have < needed {
            return None;
        }
        self.have = 0; // running status stays armed
        Some(WireMessage::Voice {
            status: self.status,
            data1: self.data[0],
            data2: if needed == 2 { self.data[1] } else { 0 },
        })
    }
}

struct RouterState {
    mode: InputMode,
    /// Keyboard output channel, 1..=16.
    keyboard_channel: u8,
    /// Keyboard velocity percent, 1..=100 (50 = unchanged).
    keyboard_velocity: u8,
    decoder: WireDecoder,
}

/// Bridges the input byte queue to the byte sink.
pub struct InputRouter {
    queue: Arc<MidiInputQueue>,
    out: Arc<dyn MidiOut>,
    state: Mutex<RouterState>,
}

impl InputRouter {
    pub fn new(out: Arc<dyn MidiOut>) -> Self {
        Self {
            queue: Arc::new(MidiInputQueue::new(INPUT_QUEUE_CAPACITY)),
            out,
            state: Mutex::new(RouterState {
                mode: InputMode::Off,
                keyboard_channel: 1,
                keyboard_velocity: 50,
                decoder: WireDecoder::default(),
            }),
        }
    }

    /// Handle to the byte queue for the serial receive path.
    pub fn queue(&self) -> Arc<MidiInputQueue> {
        Arc::clone(&self.queue)
    }

    pub fn mode(&self) -> InputMode {
        self.state.lock().mode
    }

    /// Enable/disable Thru; enabling it turns Keyboard off.
    pub fn set_thru(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.mode = if enabled {
            InputMode::Thru
        } else if state.mode == InputMode::Thru {
            InputMode::Off
        } else {
            state.mode
        };
    }

    /// Enable/disable Keyboard; enabling it turns Thru off.
    pub fn set_keyboard(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.mode = if enabled {
            InputMode::Keyboard
        } else if state.mode == InputMode::Keyboard {
            InputMode::Off
        } else {
            state.mode
        };
    }

    pub fn set_keyboard_channel(&self, channel: u8) {
        self.state.lock().keyboard_channel = channel.clamp(1, 16);
    }

    pub fn set_keyboard_velocity(&self, percent: u8) {
        self.state.lock().keyboard_velocity = percent.clamp(1, 100);
    }

    pub fn keyboard_channel(&self) -> u8 {
        self.state.lock().keyboard_channel
    }

    pub fn keyboard_velocity(&self) -> u8 {
        self.state.lock().keyboard_velocity
    }

    /// Drain queued bytes and forward decoded messages. Called from the
    /// audio thread; uses `try_lock` so it can never wedge that loop.
    pub fn poll(&self) {
        let Some(mut state) = self.state.try_lock() else {
            return;
        };
        while let Some(byte) = self.queue.pop() {
            if let Some(message) = state.decoder.feed(byte) {
                self.route(&state, message);
            }
        }
    }

    fn route(&self, state: &RouterState, message: WireMessage) {
        match state.mode {
            InputMode::Off => {}
            InputMode::Thru => self.route_thru(message),
            InputMode::Keyboard => self.route_keyboard(state, message),
        }
    }

    fn route_thru(&self, message: WireMessage) {
        match message {
            WireMessage::Realtime(byte) => {
                if let Some(rt) = realtime_from_byte(byte) {
                    self.out.realtime(rt);
                }
            }
            WireMessage::Voice { status, data1, data2 } => {
                let channel = (status & 0x0F) + 1;
                self.forward(status & 0xF0, channel, data1, data2);
            }
        }
    }

    fn route_keyboard(&self, state: &RouterState, message: WireMessage) {
        let WireMessage::Voice { status, data1, data2 } = message else {
            return;
        };
        let channel = state.keyboard_channel;
        match status & 0xF0 {
            NOTE_ON => {
                // keyboard_velocity is 1-100 with 50 = unchanged.
                let scaled =
                    ((data2 as u16 * state.keyboard_velocity as u16) / 50).min(127) as u8;
                self.out.note_on(channel, data1, scaled);
            }
            kind => self.forward(kind, channel, data1, data2),
        }
    }

    fn forward(&self, kind: u8, channel: u8, data1: u8, data2: u8) {
        match kind {
            NOTE_ON => self.out.note_on(channel, data1, data2),
            NOTE_OFF => self.out.note_off(channel, data1, data2),
            CONTROL_CHANGE => self.out.control_change(channel, data1, data2),
            PROGRAM_CHANGE => self.out.program_change(channel, data1),
            PITCH_BEND => {
                let bend = (((data2 as u16) << 7) | data1 as u16) as i16 - 8192;
                self.out.pitch_bend(channel, bend);
            }
            CHANNEL_PRESSURE => self.out.channel_pressure(channel, data1),
            POLY_PRESSURE => self.out.poly_pressure(channel, data1, data2),
            _ => {}
        }
    }
}

fn realtime_from_byte(byte: u8) -> Option<RealtimeMessage> {
    match byte {
        0xF8 => Some(RealtimeMessage::Clock),
        0xFA => Some(RealtimeMessage::Start),
        0xFB => Some(RealtimeMessage::Continue),
        0xFC => Some(RealtimeMessage::Stop),
        _ => None,
    }
}
