/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 / Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// X25519 / Ed25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Group that holds administrative rights over a safe
pub const ADMIN_GROUP: &str = "admin";

/// Default encryption domain for filesystem writes
pub const USERS_GROUP: &str = "users";

/// Files smaller than this are deflated when `zip` is requested (64 MiB)
pub const DEFAULT_ZIP_THRESHOLD: u64 = 64 * 1024 * 1024;

/// Maximum size of a single file body (256 MiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 256 * 1024 * 1024;

/// Marker segment of invite link paths
pub const INVITE_MARKER: &str = "a";

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_PAIRWISE_KEY: &str = "coffer-pairwise-key-v1";
pub const KDF_CONTEXT_SEAL_KEY: &str = "coffer-group-seal-v1";
pub const KDF_CONTEXT_CATALOG_KEY: &str = "coffer-catalog-key-v1";
pub const KDF_CONTEXT_GROUP_CHAIN: &str = "coffer-group-chain-v1";
