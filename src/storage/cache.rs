//! Persistent file-length cache.
//!
//! Scanning a large SMF for its total tick length costs seconds on slow
//! storage, so the result is cached keyed by `(basename, mtime)`. The
//! cache is a small CSV file with a version sentinel on the first line; a
//! version mismatch (or a pre-version file) throws the whole cache away
//! rather than trusting stale math.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Maximum number of entries; the oldest is evicted first (FIFO).
pub const CACHE_CAPACITY: usize = 500;

/// Bump when the record format or the length calculation changes.
pub const CACHE_VERSION: u32 = 3;

/// Longest stored basename, matching the on-device filename field.
const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheEntry {
    name: String,
    mtime: u32,
    length_ticks: u32,
    sysex_count: u16,
}

/// In-memory cache with write-through persistence.
pub struct LengthCache {
    path: PathBuf,
    entries: Vec<CacheEntry>,
    loaded: bool,
}

impl LengthCache {
    /// A cache persisted at `path`. Nothing is read until first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
            loaded: false,
        }
    }

    /// Look up `(name, mtime)`. A name match with a different mtime means
    /// the file changed; the stale entry is treated as absent.
    pub fn lookup(&mut self, name: &str, mtime: u32) -> Option<(u32, u16)> {
        self.ensure_loaded();
        let name = truncate_name(name);
        let entry = self.entries.iter().find(|e| e.name == name)?;
        if entry.mtime != mtime {
            return None;
        }
        Some((entry.length_ticks, entry.sysex_count))
    }

    /// Insert or update an entry and persist immediately.
    pub fn insert(&mut self, name: &str, mtime: u32, length_ticks: u32, sysex_count: u16) {
        self.ensure_loaded();
        let name = truncate_name(name);

        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.mtime = mtime;
            entry.length_ticks = length_ticks;
            entry.sysex_count = sysex_count;
        } else {
            if self.entries.len() >= CACHE_CAPACITY {
                self.entries.remove(0);
            }
            self.entries.push(CacheEntry {
                name: name.to_string(),
                mtime,
                length_ticks,
                sysex_count,
            });
        }
        self.save();
    }

    /// Number of cached entries.
    pub fn len(&mut self) -> usize {
        self.ensure_loaded();
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    fn ensure_loaded(&mut self) {
        if self.loaded {
            return;
        }
        self.loaded = true;
        self.entries.clear();

        let Ok(text) = fs::read_to_string(&self.path) else {
            return; // cache doesn't exist yet
        };
        let mut lines = text.lines();

        // First record must be the version sentinel.
        let discard = match lines.next() {
            Some(line) => match line.strip_prefix("VERSION,") {
                Some(version) => version.trim().parse::<u32>().ok() != Some(CACHE_VERSION),
                None => true,
            },
            None => false,
        };
        if discard {
            log::info!("length cache version mismatch, discarding {}", self.path.display());
            let _ = fs::remove_file(&self.path);
            return;
        }

        for line in lines {
            let mut fields = line.split(',');
            let (Some(name), Some(mtime), Some(length), Some(sysex)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let (Ok(mtime), Ok(length), Ok(sysex)) = (
                mtime.trim().parse::<u32>(),
                length.trim().parse::<u32>(),
                sysex.trim().parse::<u16>(),
            ) else {
                continue;
            };
            if name.is_empty() || self.entries.len() >= CACHE_CAPACITY {
                continue;
            }
            self.entries.push(CacheEntry {
                name: truncate_name(name).to_string(),
                mtime,
                length_ticks: length,
                sysex_count: sysex,
            });
        }
        log::debug!("loaded {} length cache entries", self.entries.len());
    }

    fn save(&self) {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = fs::create_dir_all(parent);
            }
        }
        let result = fs::File::create(&self.path).and_then(|mut file| {
            writeln!(file, "VERSION,{}", CACHE_VERSION)?;
            for entry in &self.entries {
                writeln!(
                    file,
                    "{},{},{},{}",
                    entry.name, entry.mtime, entry.length_ticks, entry.sysex_count
                )?;
            }
            Ok(())
        });
        if let Err(e) = result {
            log::warn!("failed to persist length cache to {}: {}", self.path.display(), e);
        }
    }
}

/// Clip a name to the stored field width without splitting a character.
fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}
