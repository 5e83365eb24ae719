//! Storage key constants.

/// Keychain entry names used by the chat store
pub struct StorageKeys;

impl StorageKeys {
    /// Active database encryption key (base64)
    pub const DATABASE_KEY: &'static str = "database_key";

    /// RFC 3339 time the active key was created or last rotated
    pub const DATABASE_KEY_ROTATED_AT: &'static str = "database_key_rotated_at";

    /// Prefix for keys retired by rotation, suffixed with the key hash
    pub const RETIRED_KEY_PREFIX: &'static str = "database_key.retired.";

    /// Entry name for a retired key.
    pub fn retired_key(key_hash: &str) -> String {
        format!("{}{}", Self::RETIRED_KEY_PREFIX, key_hash)
    }
}
