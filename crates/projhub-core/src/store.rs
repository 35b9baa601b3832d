use crate::error::ProjectError;

/// Key-value access to the metadata store for collaborators outside the
/// registry (credential providers keep their records here).
///
/// Each call runs in its own atomic transaction.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ProjectError>;

    /// Upsert `value`, returning the previous value if the key existed.
    fn set(&self, key: &str, value: &[u8]) -> Result<Option<Vec<u8>>, ProjectError>;

    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> Result<bool, ProjectError>;
}
