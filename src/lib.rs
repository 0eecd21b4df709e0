//! Standard MIDI File playback core.
//!
//! The engine a standalone hardware MIDI player is built around: a
//! streaming multi-track SMF parser with bounded per-track buffering, a
//! tick-to-wall-clock scheduler with inline tempo changes, per-channel
//! overrides (mute, solo, transpose, routing, velocity and controller
//! overrides), a persistent file-length cache, and input routing for a
//! MIDI-in port. Output goes through the [`midi::MidiOut`] byte sink; a
//! serial port, an OS MIDI port (`midir-out` feature) or an in-memory
//! capture can sit behind it.
//!
//! Typical embedding:
//!
//! ```no_run
//! use std::sync::Arc;
//! use smfplay::midi::{PlayerEngine, StreamSink};
//!
//! # fn main() -> Result<(), smfplay::PlayerError> {
//! // Any io::Write works as the wire; here a serial port handle.
//! let port = std::fs::OpenOptions::new().write(true).open("/dev/ttyS0")?;
//! let engine = PlayerEngine::new(Arc::new(StreamSink::new(port)), ".cache/lengths");
//! engine.load_and_play(std::path::Path::new("/MIDI/song.mid"))?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod midi;
pub mod storage;

pub use error::PlayerError;
