//! Object storage seam used by the migration.
//!
//! The orchestrator only needs to write bytes under a key and to know the public
//! URL an object will be served from; `gcs` provides the Google Cloud Storage
//! implementation.

pub mod gcs;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Prefix under which migrated event icons are stored.
pub const ICON_PATH_PREFIX: &str = "events/icons";

/// Deterministic destination key for a row's icon: `events/icons/<id>.<ext>`.
pub fn icon_object_key(id: i64, ext: &str) -> String {
    format!("{ICON_PATH_PREFIX}/{id}.{ext}")
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `bytes` under `key`, replacing any object already stored there.
    async fn write_object(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<()>;

    /// Public URL the object stored under `key` is served from.
    fn public_url(&self, key: &str) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn icon_keys_are_deterministic() {
        assert_eq!(icon_object_key(42, "png"), "events/icons/42.png");
        assert_eq!(icon_object_key(7, "jpg"), "events/icons/7.jpg");
        assert_eq!(icon_object_key(42, "png"), icon_object_key(42, "png"));
    }
}
