//! Release version parsing and the on-disk version markers.

use crate::storage::{self, Storage};

pub const VERSION_FILE: &str = ".version";

/// Marker value reported when nothing is installed yet.
pub const UNKNOWN_VERSION: &str = "0.0";

/// Three-component version; ordering is the tuple ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(pub u64, pub u64, pub u64);

impl Version {
    pub fn components(&self) -> [u64; 3] {
        [self.0, self.1, self.2]
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// Parses `v1.2.3`-style tags. Anything malformed is `0.0.0`.
pub fn parse(s: &str) -> Version {
    let trimmed = s.trim().trim_start_matches(['v', 'V']);
    let mut parts = [0u64; 3];
    for (i, part) in trimmed.split('.').enumerate() {
        match part.parse::<u64>() {
            // extra components do not take part in ordering
            Ok(n) if i < 3 => parts[i] = n,
            Ok(_) => {}
            Err(_) => return Version::default(),
        }
    }
    Version(parts[0], parts[1], parts[2])
}

/// True iff `latest` is strictly newer than `current`.
pub fn compare(current: &str, latest: &str) -> bool {
    parse(latest) > parse(current)
}

/// Reads `<dir>/.version`, falling back to `"0.0"`.
pub fn read(storage: &dyn Storage, dir: &str) -> String {
    match storage::read_to_string(storage, &storage::join(dir, VERSION_FILE)) {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            if !e.is_not_found() {
                log::warn!("version: unreadable marker in '{}': {}", dir, e);
            }
            UNKNOWN_VERSION.to_string()
        }
    }
}

/// Overwrites `<dir>/.version`, creating `dir` if needed.
pub fn write(
    storage: &dyn Storage,
    dir: &str,
    version: &str,
) -> Result<(), crate::error::StorageError> {
    storage::mkdirs(storage, dir)?;
    storage::write_string(storage, &storage::join(dir, VERSION_FILE), version.trim())
}
