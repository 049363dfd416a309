use std::collections::HashMap;
use std::path::Path;

use crate::error::{QueueError, Result};
use crate::view::normalize_key;

/// Rank given to any region missing from the table.
pub const UNRANKED_PRIORITY: u32 = u32::MAX;

/// Static region → priority table. Lower ranks are served first.
///
/// The table is read once at startup from a JSON object such as
/// `{"north": 1, "south": 2}`. Keys are matched trimmed and case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct PriorityResolver {
    ranks: HashMap<String, u32>,
}

impl PriorityResolver {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, u32)>,
        K: AsRef<str>,
    {
        Self {
            ranks: pairs
                .into_iter()
                .map(|(k, v)| (normalize_key(k.as_ref()), v))
                .collect(),
        }
    }

    /// Load the table, failing on unreadable or malformed artifacts.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await?;
        let parsed: HashMap<String, u32> = serde_json::from_slice(&raw).map_err(|e| {
            QueueError::PriorityTable(format!("{}: {}", path.display(), e))
        })?;
        Ok(Self::from_pairs(parsed))
    }

    /// Load the table, degrading to an empty one on any failure.
    pub async fn load_or_empty(path: &Path) -> Self {
        match Self::load(path).await {
            Ok(resolver) => {
                tracing::info!(path = %path.display(), entries = resolver.len(), "Priority table loaded");
                resolver
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Priority table unavailable, every item gets the unranked priority"
                );
                Self::empty()
            }
        }
    }

    pub fn resolve(&self, region: &str) -> u32 {
        self.ranks
            .get(&normalize_key(region))
            .copied()
            .unwrap_or(UNRANKED_PRIORITY)
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolves_known_regions_case_insensitively() {
        let resolver = PriorityResolver::from_pairs([("North", 1), ("south ", 2)]);
        assert_eq!(resolver.resolve("north"), 1);
        assert_eq!(resolver.resolve(" NORTH "), 1);
        assert_eq!(resolver.resolve("South"), 2);
    }

    #[test]
    fn unknown_region_gets_sentinel() {
        let resolver = PriorityResolver::from_pairs([("north", 1)]);
        assert_eq!(resolver.resolve("west"), UNRANKED_PRIORITY);
        assert_eq!(PriorityResolver::empty().resolve("north"), UNRANKED_PRIORITY);
    }

    #[tokio::test]
    async fn loads_json_artifact() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"north": 1, "East": 4}}"#).unwrap();

        let resolver = PriorityResolver::load(file.path()).await.unwrap();
        assert_eq!(resolver.len(), 2);
        assert_eq!(resolver.resolve("east"), 4);
    }

    #[tokio::test]
    async fn malformed_artifact_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = PriorityResolver::load(file.path()).await.unwrap_err();
        assert!(matches!(err, QueueError::PriorityTable(_)));
    }

    #[tokio::test]
    async fn missing_artifact_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PriorityResolver::load_or_empty(&dir.path().join("missing.json")).await;
        assert!(resolver.is_empty());
        assert_eq!(resolver.resolve("north"), UNRANKED_PRIORITY);
    }
}
