//! Invite links.
//!
//! An invite is a URL whose path is exactly `/a/<safeLocator>/<groupOrRole>/<target>`
//! where `<target>` is the base64url-encoded connection URL of the safe.
//! Parsing never fails loudly: anything malformed is simply "no invite".

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::constants::INVITE_MARKER;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invite {
    pub locator: String,
    pub group: String,
    pub url: String,
}

impl Invite {
    pub fn new(locator: impl Into<String>, group: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            group: group.into(),
            url: url.into(),
        }
    }

    /// Build a link under `base` (e.g. `https://example.org`).
    pub fn to_link(&self, base: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            base.trim_end_matches('/'),
            INVITE_MARKER,
            self.locator,
            self.group,
            URL_SAFE_NO_PAD.encode(self.url.as_bytes())
        )
    }

    /// Parse an invite link, `None` when it is not one.
    pub fn parse(link: &str) -> Option<Self> {
        let path = link_path(link.trim())?;
        let parts: Vec<&str> = path.split('/').collect();
        // leading '/' yields an empty first segment
        if parts.len() != 5 || !parts[0].is_empty() || parts[1] != INVITE_MARKER {
            return None;
        }
        if parts[2].is_empty() || parts[3].is_empty() {
            return None;
        }

        let target = parts[4].trim_end_matches('=');
        let decoded = URL_SAFE_NO_PAD
            .decode(target)
            .or_else(|_| URL_SAFE.decode(parts[4]))
            .ok()?;
        let url = String::from_utf8(decoded).ok()?;

        Some(Self::new(parts[2], parts[3], url))
    }

    /// Positional form `[locator, group, url]`.
    pub fn into_parts(self) -> [String; 3] {
        [self.locator, self.group, self.url]
    }
}

// Path component of an absolute URL, without query or fragment.
fn link_path(link: &str) -> Option<&str> {
    let (_, rest) = link.split_once("://")?;
    let start = rest.find('/')?;
    let path = &rest[start..];
    let end = path.find(|c: char| c == '?' || c == '#').unwrap_or(path.len());
    Some(&path[..end])
}
