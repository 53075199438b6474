use async_trait::async_trait;

use crate::error::Result;

/// Identifies one project. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectKey {
    pub user_id: String,
    pub project_id: String,
}

impl ProjectKey {
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: project_id.into(),
        }
    }
}

impl std::fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.project_id)
    }
}

/// A project confirmed to have both a preview artifact and a metadata
/// artifact. Only a `QualificationSource` constructs these, and only after
/// both artifacts were actually observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifyingProject {
    pub key: ProjectKey,
    /// Prefix holding the project's preview JPEGs.
    pub preview_prefix: String,
    /// Exact key of the project's metadata artifact.
    pub metadata_key: String,
}

impl QualifyingProject {
    /// Build a qualifying project with the canonical artifact locations.
    pub fn new(key: ProjectKey) -> Self {
        let preview_prefix = format!("{}/{}/preview.v1/", key.user_id, key.project_id);
        let metadata_key = format!(
            "{}/{}/{}.v3.gz",
            key.user_id, key.project_id, key.project_id
        );
        Self {
            key,
            preview_prefix,
            metadata_key,
        }
    }
}

/// A source of qualifying projects.
///
/// Two implementations exist: the inventory scanner (bulk CSV listings) and
/// the marker scanner (time-partitioned marker objects). Which one runs is a
/// configuration choice.
#[async_trait]
pub trait QualificationSource: Send + Sync {
    async fn scan(&self) -> Result<Vec<QualifyingProject>>;
}

/// Whether a path segment looks like the 36-character UUID form used for
/// user and project ids.
pub fn uuid_shaped(segment: &str) -> bool {
    segment.len() == 36
        && segment
            .bytes()
            .all(|b| matches!(b, b'a'..=b'f' | b'0'..=b'9' | b'-'))
}
