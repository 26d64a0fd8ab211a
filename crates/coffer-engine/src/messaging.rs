//! Messaging view of a safe.
//!
//! Direct messages live under `comm/direct/<recipient>/<sender>/<msgId>`
//! (identity digests) sealed with the pairwise key of the two parties.
//! Broadcasts live under `comm/groups/<group>/<msgId>` sealed with the
//! group's newest key. Attachments sit next to their message as
//! `<msgId>.data`. Every identity keeps one read position per stream in its
//! catalog; `receive` returns what lies past those positions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coffer_shared::crypto::{self, SymmetricKey};
use coffer_shared::identity::{verify_signature, PublicKeys};
use coffer_shared::protocol::{MessageBody, MessageEnvelope, Wire};
use coffer_shared::{GroupName, IdentityId, MessageId};

use crate::error::{EngineError, Result};
use crate::safe::Safe;

const DIRECT: &str = "comm/direct";
const GROUPS: &str = "comm/groups";
const PAIRWISE_LABEL: &[u8] = b"coffer-comm";
const DIRECT_STREAM_PREFIX: &str = "direct/";

/// What a message carries. Exactly one form must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Payload {
    pub text: Option<String>,
    #[serde(with = "crate::b64::option")]
    pub data: Option<Vec<u8>>,
    /// Local file sent as an attachment.
    pub file: Option<PathBuf>,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Some(data.into()),
            ..Default::default()
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(path.into()),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        let forms = [self.text.is_some(), self.data.is_some(), self.file.is_some()];
        if forms.iter().filter(|set| **set).count() != 1 {
            return Err(EngineError::malformed("a message carries exactly one of text, data or file"));
        }
        Ok(())
    }
}

/// A delivered message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender: IdentityId,
    /// Recipient identity id, or the group name of a broadcast.
    pub recipient: String,
    /// Set for broadcasts.
    pub group: Option<GroupName>,
    pub text: Option<String>,
    #[serde(with = "crate::b64::option", default)]
    pub data: Option<Vec<u8>>,
    /// Name of the attached file, fetched with `download`.
    pub file_name: Option<String>,
    pub has_attachment: bool,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
}

pub struct CommView {
    safe: Arc<Safe>,
    closed: AtomicBool,
}

impl CommView {
    pub fn new(safe: Arc<Safe>) -> Self {
        Self {
            safe,
            closed: AtomicBool::new(false),
        }
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(url = %self.safe.url(), "messaging view closed");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Aborted);
        }
        self.safe.ensure_open()
    }

    // -- sending ------------------------------------------------------------

    /// Send a message to one identity.
    pub fn send(&self, to: &IdentityId, payload: &Payload) -> Result<MessageId> {
        self.ensure_open()?;
        payload.validate()?;
        PublicKeys::from_id(to)?;
        let me = self.safe.identity().id().clone();
        if self.safe.is_cursed(&me, None)? {
            return Err(EngineError::denied(format!("{} is cursed in {}", me.short(), self.safe.url())));
        }

        let key = self.safe.identity().pairwise_key(to, PAIRWISE_LABEL)?;
        let id = MessageId::new();
        let path = direct_path(to, &me, id);
        self.post(&path, id, to.as_str(), 0, &key, payload)?;
        self.safe.catalog().remember(to)?;

        tracing::debug!(url = %self.safe.url(), to = %to.short(), id = %id, "message sent");
        Ok(id)
    }

    /// Post a message to every current member of `group`.
    pub fn broadcast(&self, group: &str, payload: &Payload) -> Result<MessageId> {
        self.ensure_open()?;
        payload.validate()?;
        let group = GroupName::new(group)
            .ok_or_else(|| EngineError::malformed(format!("invalid group name '{group}'")))?;
        self.safe.check_member(&group)?;
        let me = self.safe.identity().id().clone();
        if self.safe.is_cursed(&me, Some(&group))? {
            return Err(EngineError::denied(format!("{} is cursed in group {group}", me.short())));
        }

        let (key_version, key) = self.safe.newest_key(&group)?;
        let id = MessageId::new();
        let path = group_path(&group, id);
        self.post(&path, id, group.as_str(), key_version, &key, payload)?;

        tracing::debug!(url = %self.safe.url(), %group, id = %id, "message broadcast");
        Ok(id)
    }

    fn post(
        &self,
        path: &str,
        id: MessageId,
        recipient: &str,
        key_version: u32,
        key: &SymmetricKey,
        payload: &Payload,
    ) -> Result<()> {
        let mut body = MessageBody {
            text: payload.text.clone(),
            data: payload.data.clone(),
            file_name: None,
        };

        // the attachment lands before the message that announces it
        if let Some(file) = &payload.file {
            let content = std::fs::read(file)?;
            let limit = self.safe.engine_config().max_file_size;
            if content.len() as u64 > limit {
                return Err(EngineError::malformed(format!(
                    "attachment of {} bytes exceeds the {limit} byte limit",
                    content.len()
                )));
            }
            body.file_name = Some(
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "attachment".to_string()),
            );
            self.safe
                .replica()
                .write(&attachment_path(path), &crypto::encrypt(key, &content)?)?;
        }

        let identity = self.safe.identity();
        let mut envelope = MessageEnvelope {
            id,
            sender: identity.id().clone(),
            recipient: recipient.to_string(),
            key_version,
            created_at: Utc::now(),
            body: crypto::encrypt(key, &body.to_bytes()?)?,
            has_attachment: payload.file.is_some(),
            signature: Vec::new(),
        };
        envelope.signature = identity.sign(&envelope.signing_bytes())?;
        self.safe.replica().write(path, &envelope.to_bytes()?)?;
        Ok(())
    }

    // -- receiving ----------------------------------------------------------

    /// Messages past the caller's read positions, oldest first. A filter
    /// containing `.` names a sender: their direct messages plus their
    /// broadcasts to the caller's groups. Any other non-empty filter names
    /// a group.
    ///
    /// With a sender filter a group stream is consumed only up to the first
    /// message of someone else, which stays unread for a later `receive`.
    pub fn receive(&self, filter: &str) -> Result<Vec<Message>> {
        self.ensure_open()?;
        let filter = filter.trim();
        let me = self.safe.identity().id().clone();
        let url = self.safe.url().to_string();

        let positions: HashMap<String, u64> = self
            .safe
            .catalog()
            .db()?
            .list_read_positions(&url, &me)?
            .into_iter()
            .collect();

        let mut messages = Vec::new();
        let mut advanced: HashMap<String, u64> = HashMap::new();

        // sender digests of direct streams, and groups, to scan
        let mut from = None;
        let (direct_dirs, groups): (Vec<String>, Vec<GroupName>) = if filter.is_empty() {
            (self.inbox(&me)?, self.safe.memberships()?)
        } else if filter.contains('.') {
            let sender = IdentityId::from(filter);
            let dirs = vec![sender.digest()];
            from = Some(sender);
            (dirs, self.safe.memberships()?)
        } else {
            let group = GroupName::new(filter)
                .ok_or_else(|| EngineError::malformed(format!("invalid filter '{filter}'")))?;
            self.safe.check_member(&group)?;
            (Vec::new(), vec![group])
        };

        for sender_digest in direct_dirs {
            self.ensure_open()?;
            let stream = direct_stream(&sender_digest);
            let position = positions.get(&stream).copied().unwrap_or(0);
            let dir = format!("{DIRECT}/{}/{sender_digest}", me.digest());
            let last = self.collect(&dir, position, None, &mut messages, |envelope| {
                if envelope.sender.digest() != sender_digest || envelope.recipient != me.as_str() {
                    return Err(EngineError::malformed("message filed under the wrong stream"));
                }
                Ok((None, self.safe.identity().pairwise_key(&envelope.sender, PAIRWISE_LABEL)?))
            })?;
            if last > position {
                advanced.insert(stream, last);
            }
        }

        for group in groups {
            self.ensure_open()?;
            let stream = group.as_str().to_string();
            let position = positions.get(&stream).copied().unwrap_or(0);
            let dir = format!("{GROUPS}/{group}");
            let last = self.collect(&dir, position, from.as_ref(), &mut messages, |envelope| {
                if envelope.recipient != group.as_str() {
                    return Err(EngineError::malformed("message filed under the wrong group"));
                }
                Ok((Some(group.clone()), self.safe.key(&group, envelope.key_version)?))
            })?;
            if last > position {
                advanced.insert(stream, last);
            }
        }

        {
            let db = self.safe.catalog().db()?;
            for (stream, position) in &advanced {
                db.set_read_position(&url, &me, stream, *position)?;
            }
        }
        for sender in messages.iter().map(|m| &m.sender) {
            self.safe.catalog().remember(sender)?;
        }

        messages.sort_by_key(|m| m.id);
        if !messages.is_empty() {
            tracing::debug!(url = %url, count = messages.len(), "messages received");
        }
        Ok(messages)
    }

    // Sender digests with a direct stream to `me`.
    fn inbox(&self, me: &IdentityId) -> Result<Vec<String>> {
        Ok(self
            .safe
            .replica()
            .list(&format!("{DIRECT}/{}", me.digest()))?
            .into_iter()
            .filter(|e| e.is_dir)
            .map(|e| e.name)
            .collect())
    }

    // Decode every message in `dir` newer than `position` into `out` and
    // return the highest id consumed. Entries that fail to verify or decrypt
    // are skipped. With `from` set, stop before the first message that is
    // not theirs.
    fn collect(
        &self,
        dir: &str,
        position: u64,
        from: Option<&IdentityId>,
        out: &mut Vec<Message>,
        key_for: impl Fn(&MessageEnvelope) -> Result<(Option<GroupName>, SymmetricKey)>,
    ) -> Result<u64> {
        let mut last = position;
        for entry in self.safe.replica().list(dir)? {
            if entry.is_dir {
                continue;
            }
            let Some(id) = MessageId::from_key(&entry.name) else {
                continue;
            };
            if id.0 <= position {
                continue;
            }

            let raw = match self.safe.replica().read(&format!("{dir}/{}", entry.name)) {
                Ok(raw) => raw,
                Err(coffer_store::ReplicaError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let opened = self.open_envelope(&raw, id, &key_for);
            if let Some(sender) = from {
                if !matches!(&opened, Ok(message) if &message.sender == sender) {
                    break;
                }
            }
            last = last.max(id.0);
            match opened {
                Ok(message) => out.push(message),
                Err(e) => tracing::warn!(dir, id = %id, error = %e, "skipping unreadable message"),
            }
        }
        Ok(last)
    }

    fn open_envelope(
        &self,
        raw: &[u8],
        id: MessageId,
        key_for: &impl Fn(&MessageEnvelope) -> Result<(Option<GroupName>, SymmetricKey)>,
    ) -> Result<Message> {
        let envelope = MessageEnvelope::from_bytes(raw)?;
        if envelope.id != id {
            return Err(EngineError::malformed("message id does not match its name"));
        }
        verify_signature(&envelope.sender, &envelope.signing_bytes(), &envelope.signature)
            .map_err(|_| EngineError::malformed("bad message signature"))?;
        let (group, key) = key_for(&envelope)?;
        let body = MessageBody::from_bytes(&crypto::decrypt(&key, &envelope.body)?)?;

        Ok(Message {
            id: envelope.id,
            sender: envelope.sender,
            recipient: envelope.recipient,
            group,
            text: body.text,
            data: body.data,
            file_name: body.file_name,
            has_attachment: envelope.has_attachment,
            key_version: envelope.key_version,
            created_at: envelope.created_at,
        })
    }

    /// Write the attachment of `message` to `dest`. Returns its size.
    pub fn download(&self, message: &Message, dest: &Path) -> Result<u64> {
        self.ensure_open()?;
        if !message.has_attachment {
            return Err(EngineError::not_found(format!("attachment of message {}", message.id)));
        }
        let identity = self.safe.identity();
        let (path, key) = match &message.group {
            Some(group) => (group_path(group, message.id), self.safe.key(group, message.key_version)?),
            None => {
                let recipient = IdentityId(message.recipient.clone());
                let peer = if identity.id() == &message.sender {
                    &recipient
                } else if identity.id() == &recipient {
                    &message.sender
                } else {
                    return Err(EngineError::denied("message between other members"));
                };
                (
                    direct_path(&recipient, &message.sender, message.id),
                    identity.pairwise_key(peer, PAIRWISE_LABEL)?,
                )
            }
        };

        let sealed = self.safe.replica().read(&attachment_path(&path))?;
        let content = crypto::decrypt(&key, &sealed)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, &content)?;

        tracing::debug!(id = %message.id, dest = %dest.display(), bytes = content.len(), "attachment downloaded");
        Ok(content.len() as u64)
    }

    /// Make `receive` deliver `stream` again from `id` on. `stream` is a
    /// sender id, the caller's own id (every direct stream) or a group the
    /// caller belongs to.
    pub fn rewind(&self, stream: &str, id: MessageId) -> Result<()> {
        self.ensure_open()?;
        let stream = stream.trim();
        let me = self.safe.identity().id().clone();

        let keys: Vec<String> = if stream.contains('.') {
            let inbox = self.inbox(&me)?;
            let sender = IdentityId::from(stream);
            if sender == me {
                inbox.iter().map(|digest| direct_stream(digest)).collect()
            } else {
                let digest = sender.digest();
                if !inbox.contains(&digest) {
                    return Err(EngineError::not_found(format!("messages from {}", sender.short())));
                }
                vec![direct_stream(&digest)]
            }
        } else {
            let group = GroupName::new(stream)
                .ok_or_else(|| EngineError::malformed(format!("invalid stream '{stream}'")))?;
            if !self.safe.memberships()?.contains(&group) {
                return Err(EngineError::not_found(format!("group {group} for {}", me.short())));
            }
            vec![group.0]
        };

        let db = self.safe.catalog().db()?;
        for key in &keys {
            db.set_read_position(self.safe.url(), &me, key, id.0.saturating_sub(1))?;
        }
        tracing::debug!(stream, id = %id, streams = keys.len(), "stream rewound");
        Ok(())
    }
}

fn direct_path(recipient: &IdentityId, sender: &IdentityId, id: MessageId) -> String {
    format!("{DIRECT}/{}/{}/{}", recipient.digest(), sender.digest(), id.to_key())
}

fn group_path(group: &GroupName, id: MessageId) -> String {
    format!("{GROUPS}/{group}/{}", id.to_key())
}

fn attachment_path(path: &str) -> String {
    format!("{path}.data")
}

fn direct_stream(sender_digest: &str) -> String {
    format!("{DIRECT_STREAM_PREFIX}{sender_digest}")
}
