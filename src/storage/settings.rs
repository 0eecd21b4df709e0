//! Plain-text settings records.
//!
//! Two key=value formats, both human-editable on the card:
//! per-file override records (`[MIDI_SETTINGS_V1]`, stored next to the MIDI
//! files in a `config/` directory) and the one global record
//! (`[GLOBAL_SETTINGS_V1]`). The field encodings are fixed contracts - the
//! sentinel values (128/255 = "follow the file") match what every deployed
//! device already wrote - so these are parsed by hand, not with serde.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::midi::player::{
    DEFAULT_TARGET_BPM, DEFAULT_VELOCITY_SCALE, MAX_TARGET_BPM, MAX_VELOCITY_SCALE,
    MIN_TARGET_BPM, MIN_VELOCITY_SCALE,
};

pub const TRACK_SETTINGS_HEADER: &str = "[MIDI_SETTINGS_V1]";
pub const GLOBAL_SETTINGS_HEADER: &str = "[GLOBAL_SETTINGS_V1]";

/// On-disk sentinels for "no override".
const PROGRAM_USE_FILE: u8 = 128;
const VOLUME_USE_FILE: u8 = 255;
const PAN_USE_FILE: u8 = 255;
const ROUTE_USE_FILE: u8 = 255;

/// Per-file channel overrides and playback options.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TrackSettings {
    /// Mute bitmask, one bit per channel.
    pub mutes: u16,
    /// Solo bitmask.
    pub solos: u16,
    pub programs: [Option<u8>; 16],
    pub volumes: [Option<u8>; 16],
    pub pans: [Option<u8>; 16],
    /// Semitones, -24..=24.
    pub transpose: [i8; 16],
    /// Per-channel velocity percent, 0 = inherit global.
    pub velocity: [u8; 16],
    pub routing: [Option<u8>; 16],
    /// Global velocity scale, 1..=100.
    pub velocity_scale: u8,
    /// Target BPM in hundredths.
    pub target_bpm: u32,
    pub use_target_bpm: bool,
    pub sysex_enabled: bool,
}

impl Default for TrackSettings {
    fn default() -> Self {
        Self {
            mutes: 0,
            solos: 0,
            programs: [None; 16],
            volumes: [None; 16],
            pans: [None; 16],
            transpose: [0; 16],
            velocity: [0; 16],
            routing: [None; 16],
            velocity_scale: DEFAULT_VELOCITY_SCALE,
            target_bpm: DEFAULT_TARGET_BPM,
            use_target_bpm: false,
            sysex_enabled: true,
        }
    }
}

impl TrackSettings {
    /// Settings path for a MIDI file: `<dir>/config/<stem>.cfg`.
    pub fn path_for(midi_path: &Path) -> PathBuf {
        let dir = midi_path.parent().unwrap_or_else(|| Path::new(""));
        let stem = midi_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        dir.join("config").join(format!("{}.cfg", stem))
    }

    /// Parse a record. Unknown keys are ignored for forward compatibility.
    pub fn parse(text: &str) -> Self {
        let mut settings = Self::default();
        for line in text.lines() {
            let line = line.trim_end();
            if let Some(value) = line.strip_prefix("MUTES=") {
                settings.mutes = value.trim().parse().unwrap_or(0);
            } else if let Some(value) = line.strip_prefix("SOLOS=") {
                settings.solos = value.trim().parse().unwrap_or(0);
            } else if let Some(value) = line.strip_prefix("PROGRAMS=") {
                settings.programs = parse_optional_list(value, PROGRAM_USE_FILE, 127);
            } else if let Some(value) = line.strip_prefix("VOLUMES=") {
                settings.volumes = parse_optional_list(value, VOLUME_USE_FILE, 127);
            } else if let Some(value) = line.strip_prefix("PAN=") {
                settings.pans = parse_optional_list(value, PAN_USE_FILE, 127);
            } else if let Some(value) = line.strip_prefix("TRANSPOSE=") {
                for (slot, field) in settings.transpose.iter_mut().zip(value.split(',')) {
                    *slot = field.trim().parse::<i8>().unwrap_or(0).clamp(-24, 24);
                }
            } else if let Some(value) = line.strip_prefix("ROUTING=") {
                settings.routing = parse_optional_list(value, ROUTE_USE_FILE, 15);
            } else if let Some(value) = line.strip_prefix("CH_VELOCITY=") {
                for (slot, field) in settings.velocity.iter_mut().zip(value.split(',')) {
                    *slot = field.trim().parse::<u8>().unwrap_or(0).min(200);
                }
            } else if let Some(value) = line.strip_prefix("VELOCITY_SCALE=") {
                settings.velocity_scale = value
                    .trim()
                    .parse::<u8>()
                    .unwrap_or(DEFAULT_VELOCITY_SCALE)
                    .clamp(MIN_VELOCITY_SCALE, MAX_VELOCITY_SCALE);
            } else if let Some(value) = line.strip_prefix("TARGET_BPM=") {
                settings.target_bpm = value
                    .trim()
                    .parse::<u32>()
                    .unwrap_or(DEFAULT_TARGET_BPM)
                    .clamp(MIN_TARGET_BPM, MAX_TARGET_BPM);
            } else if let Some(value) = line.strip_prefix("USE_TARGET_BPM=") {
                settings.use_target_bpm = value.trim() != "0";
            } else if let Some(value) = line.strip_prefix("SYSEX_ENABLED=") {
                settings.sysex_enabled = value.trim() != "0";
            }
        }
        settings
    }

    /// Serialize to the on-disk record format.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str(TRACK_SETTINGS_HEADER);
        out.push('\n');
        out.push_str(&format!("MUTES={}\n", self.mutes));
        out.push_str(&format!(
            "PROGRAMS={}\n",
            join_optional(&self.programs, PROGRAM_USE_FILE)
        ));
        out.push_str(&format!(
            "VOLUMES={}\n",
            join_optional(&self.volumes, VOLUME_USE_FILE)
        ));
        out.push_str(&format!("PAN={}\n", join_optional(&self.pans, PAN_USE_FILE)));
        out.push_str(&format!(
            "TRANSPOSE={}\n",
            self.transpose.map(|v| v.to_string()).join(",")
        ));
        out.push_str(&format!(
            "ROUTING={}\n",
            join_optional(&self.routing, ROUTE_USE_FILE)
        ));
        out.push_str(&format!(
            "CH_VELOCITY={}\n",
            self.velocity.map(|v| v.to_string()).join(",")
        ));
        out.push_str(&format!("VELOCITY_SCALE={}\n", self.velocity_scale));
        out.push_str(&format!("TARGET_BPM={}\n", self.target_bpm));
        out.push_str(&format!("USE_TARGET_BPM={}\n", u8::from(self.use_target_bpm)));
        out.push_str(&format!("SOLOS={}\n", self.solos));
        out.push_str(&format!("SYSEX_ENABLED={}\n", u8::from(self.sysex_enabled)));
        out
    }

    /// Load from disk; `None` when no record exists (fresh file).
    pub fn load(path: &Path) -> Option<Self> {
        let text = fs::read_to_string(path).ok()?;
        Some(Self::parse(&text))
    }

    /// Persist to disk, creating the config directory if needed.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.serialize())
    }
}

/// Global (per-device) settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct GlobalSettings {
    pub midi_thru: bool,
    pub midi_keyboard: bool,
    /// Keyboard output channel, 1..=16.
    pub keyboard_channel: u8,
    /// Keyboard velocity percent, 1..=100.
    pub keyboard_velocity: u8,
    pub midi_clock: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            midi_thru: false,
            midi_keyboard: false,
            keyboard_channel: 1,
            keyboard_velocity: 50,
            midi_clock: false,
        }
    }
}

impl GlobalSettings {
    pub fn parse(text: &str) -> Self {
        let mut settings = Self::default();
        for line in text.lines() {
            let line = line.trim_end();
            if let Some(value) = line.strip_prefix("MIDI_THRU=") {
                settings.midi_thru = value.trim() != "0";
            } else if let Some(value) = line.strip_prefix("MIDI_KEYBOARD=") {
                settings.midi_keyboard = value.trim() != "0";
            } else if let Some(value) = line.strip_prefix("MIDI_KEYBOARD_CH=") {
                settings.keyboard_channel = value.trim().parse::<u8>().unwrap_or(1).clamp(1, 16);
            } else if let Some(value) = line.strip_prefix("MIDI_KEYBOARD_VEL=") {
                settings.keyboard_velocity = value.trim().parse::<u8>().unwrap_or(50).clamp(1, 100);
            } else if let Some(value) = line.strip_prefix("MIDI_CLOCK=") {
                settings.midi_clock = value.trim() != "0";
            }
        }
        // Thru and Keyboard are exclusive; Thru wins if a hand-edited file
        // claims both.
        if settings.midi_thru && settings.midi_keyboard {
            settings.midi_keyboard = false;
        }
        settings
    }

    pub fn serialize(&self) -> String {
        format!(
            "{}\nMIDI_THRU={}\nMIDI_KEYBOARD={}\nMIDI_KEYBOARD_CH={}\nMIDI_KEYBOARD_VEL={}\nMIDI_CLOCK={}\n",
            GLOBAL_SETTINGS_HEADER,
            u8::from(self.midi_thru),
            u8::from(self.midi_keyboard),
            self.keyboard_channel,
            self.keyboard_velocity,
            u8::from(self.midi_clock),
        )
    }

    pub fn load(path: &Path) -> Option<Self> {
        let text = fs::read_to_string(path).ok()?;
        Some(Self::parse(&text))
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.serialize())
    }
}

/// Parse 16 comma-separated values where `sentinel` means None and valid
/// values are 0..=`max`.
fn parse_optional_list(value: &str, sentinel: u8, max: u8) -> [Option<u8>; 16] {
    let mut out = [None; 16];
    for (slot, field) in out.iter_mut().zip(value.split(',')) {
        let parsed = field.trim().parse::<u8>().unwrap_or(sentinel);
        *slot = if parsed <= max { Some(parsed) } else { None };
    }
    out
}

fn join_optional(values: &[Option<u8>; 16], sentinel: u8) -> String {
    values
        .map(|v| v.unwrap_or(sentinel).to_string())
        .join(",")
}
