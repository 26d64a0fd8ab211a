use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// Identity id = "<nick>.<fingerprint>"
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct IdentityId(pub String);

impl IdentityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn nick(&self) -> &str {
        self.0.split_once('.').map(|(nick, _)| nick).unwrap_or(&self.0)
    }

    pub fn fingerprint(&self) -> &str {
        self.0.split_once('.').map(|(_, fp)| fp).unwrap_or("")
    }

    /// Short, path-safe digest used to name per-identity directories.
    pub fn digest(&self) -> String {
        hex::encode(&blake3::hash(self.0.as_bytes()).as_bytes()[..12])
    }

    pub fn short(&self) -> String {
        let fp: String = self.fingerprint().chars().take(8).collect();
        format!("{}.{fp}", self.nick())
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct GroupName(pub String);

impl GroupName {
    pub fn new(name: &str) -> Option<Self> {
        Self::is_valid(name).then(|| Self(name.to_string()))
    }

    pub fn is_valid(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 64
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GroupName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one content version of a file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct BodyId(pub u64);

impl BodyId {
    pub fn new() -> Self {
        Self(next_snowflake())
    }

    pub fn to_key(&self) -> String {
        format!("{:020}", self.0)
    }
}

impl Default for BodyId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    pub fn new() -> Self {
        Self(next_snowflake())
    }

    // zero-padded so lexical order in a replica listing is numeric order
    pub fn to_key(&self) -> String {
        format!("{:020}", self.0)
    }

    pub fn from_key(key: &str) -> Option<Self> {
        key.parse().ok().map(Self)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static LAST_SNOWFLAKE: AtomicU64 = AtomicU64::new(0);

/// Time-ordered id: microseconds since the epoch shifted left by 8 bits, made
/// strictly increasing within the process.
pub fn next_snowflake() -> u64 {
    let now = (chrono::Utc::now().timestamp_micros().max(0) as u64) << 8;
    let mut last = LAST_SNOWFLAKE.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST_SNOWFLAKE.compare_exchange_weak(
            last,
            candidate,
            Ordering::SeqCst,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}
