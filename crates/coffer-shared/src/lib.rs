//! # coffer-shared
//!
//! Types shared by every coffer crate: identities, symmetric crypto, invite
//! links, id newtypes and the envelopes written to safe replicas.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod invite;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, IdentityError, ProtocolError};
pub use identity::{Identity, IdentityRecord};
pub use invite::Invite;
pub use types::{BodyId, GroupName, IdentityId, MessageId};
