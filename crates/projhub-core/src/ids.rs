use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProjectError;

static PROJECT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]*$").expect("valid project name regex"));

static BUCKET_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$").expect("valid bucket name regex")
});

/// Number of random hex characters appended to the project name.
const RANDOM_SUFFIX_LEN: usize = 16;

/// Returns true if `name` is a valid project name.
pub fn is_valid_project_name(name: &str) -> bool {
    PROJECT_NAME.is_match(name)
}

/// Returns true if `name` is a valid project-relative bucket name:
/// lowercase letters, digits and inner hyphens, at most 63 characters.
pub fn is_valid_bucket_name(name: &str) -> bool {
    BUCKET_NAME.is_match(name)
}

/// Identifier of a project: `<name>-<16 random hex chars>`.
///
/// Used as the metadata key suffix and as the on-disk directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    /// Derive a fresh id from a (validated) project name.
    pub fn random(name: &str) -> Result<Self, ProjectError> {
        if !is_valid_project_name(name) {
            return Err(ProjectError::InvalidProjectName(name.to_string()));
        }
        let suffix = Uuid::new_v4().simple().to_string();
        Ok(Self(format!("{}-{}", name, &suffix[..RANDOM_SUFFIX_LEN])))
    }

    /// Parse an id previously produced by [`ProjectId::random`].
    pub fn parse(s: &str) -> Result<Self, ProjectError> {
        let invalid = || ProjectError::InvalidInput(format!("malformed project id: {:?}", s));

        let (name, suffix) = s.rsplit_once('-').ok_or_else(invalid)?;
        let suffix_ok = suffix.len() == RANDOM_SUFFIX_LEN
            && suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
        if !suffix_ok || !is_valid_project_name(name) {
            return Err(invalid());
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id in a form accepted as an object-storage bucket name prefix
    /// (lowercase letters, digits and hyphens).
    pub fn bucket_safe(&self) -> String {
        self.0
            .chars()
            .map(|c| match c {
                '_' => '-',
                c => c.to_ascii_lowercase(),
            })
            .collect()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProjectId {
    type Err = ProjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Stable identifier of a project member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub String);

impl MemberId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_name_grammar() {
        for name in ["a", "blog", "My_App-2", "x-y_z9"] {
            assert!(is_valid_project_name(name), "{name} should be valid");
        }
        for name in ["", "1app", "-app", "_app", "app name", "app.js", "äpp", "app/x"] {
            assert!(!is_valid_project_name(name), "{name} should be invalid");
        }
    }

    #[test]
    fn test_bucket_name_grammar() {
        let longest = "x".repeat(63);
        let too_long = "x".repeat(64);
        for name in ["files", "secrets", "a", "db-2", longest.as_str()] {
            assert!(is_valid_bucket_name(name), "{name} should be valid");
        }
        for name in ["", "Files", "a/b", "..", "-files", "files-", "my_files", too_long.as_str()] {
            assert!(!is_valid_bucket_name(name), "{name} should be invalid");
        }
    }

    #[test]
    fn test_random_ids_are_distinct_and_parseable() {
        let a = ProjectId::random("blog").unwrap();
        let b = ProjectId::random("blog").unwrap();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("blog-"));
        assert_eq!(ProjectId::parse(a.as_str()).unwrap(), a);
    }

    #[test]
    fn test_random_rejects_invalid_name() {
        let err = ProjectId::random("9lives").unwrap_err();
        assert_eq!(err, ProjectError::InvalidProjectName("9lives".into()));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ProjectId::parse("blog").is_err());
        assert!(ProjectId::parse("blog-1234").is_err());
        assert!(ProjectId::parse("blog-0123456789ABCDEF").is_err());
        assert!(ProjectId::parse("1blog-0123456789abcdef").is_err());
        assert!(ProjectId::parse("my-blog-0123456789abcdef").is_ok());
    }

    #[test]
    fn test_bucket_safe() {
        let id = ProjectId::parse("My_Blog-0123456789abcdef").unwrap();
        assert_eq!(id.bucket_safe(), "my-blog-0123456789abcdef");
    }
}
