//! MIDI playback: event model, SMF parsing, scheduling, routing, sinks.

pub mod activity;
pub mod engine;
pub mod events;
pub mod input;
pub mod output;
pub mod parser;
pub mod player;
pub mod tap;

pub use activity::{ChannelActivity, ChannelLevel, MonitoredSink};
pub use engine::PlayerEngine;
pub use events::{EventKind, MidiEvent};
pub use input::{InputMode, InputRouter, MidiInputQueue};
pub use output::{CaptureSink, MidiOut, OutMessage, RealtimeMessage, StreamSink};
pub use parser::{FileHeader, MidiFileParser};
pub use player::{ChannelOverride, Player, PlayerState, PlayerStatus};
pub use tap::TapTempo;

#[cfg(feature = "midir-out")]
pub use output::DeviceSink;
