use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DevSideConfig;
use crate::error::ProjectError;
use crate::ids::ProjectId;
use crate::store::KeyValueStore;

/// Cloud providers able to issue credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Cloudflare,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Cloudflare => "cloudflare",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cloudflare" => Ok(ProviderKind::Cloudflare),
            other => Err(ProjectError::NoProviderBound(other.to_string())),
        }
    }
}

/// S3-compatible credentials scoped to a single bucket.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSet {
    pub access_key: String,
    pub secret_key: String,
    pub s3_endpoint: String,
    pub bucket_name: String,
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("s3_endpoint", &self.s3_endpoint)
            .field("bucket_name", &self.bucket_name)
            .finish()
    }
}

/// Time-bounded Cloudflare token allowed to create bucket-scoped tokens.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudflareTempTokens {
    pub token_id: String,
    pub additional_tokens_api_token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for CloudflareTempTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudflareTempTokens")
            .field("token_id", &self.token_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl CloudflareTempTokens {
    /// Tokens within five minutes of expiry count as expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at - Duration::minutes(5)
    }
}

/// Project-scoped temporary tokens, one entry per provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TempTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloudflare: Option<CloudflareTempTokens>,
}

/// Provider-side bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketHandle {
    pub provider: ProviderKind,
    pub name: String,
}

/// Issues and manages scoped cloud credentials for one project.
///
/// Implementations own the durability of what they issue.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Fetch the project's temp tokens, creating or rotating them when
    /// absent or near expiry.
    async fn get_up_to_date_temp_tokens(
        &self,
        project_id: &ProjectId,
    ) -> Result<TempTokens, ProjectError>;

    /// Get-or-create credentials for `bucket_name`. Repeated calls for the same
    /// `(bucket_name, project_id)` return identical values.
    async fn get_create_s3_credentials_for_single_bucket(
        &self,
        bucket_name: &str,
        project_id: &ProjectId,
    ) -> Result<CredentialSet, ProjectError>;

    /// Look up a bucket without creating it.
    async fn get_bucket(
        &self,
        bucket_name: &str,
        project_id: &ProjectId,
    ) -> Result<Option<BucketHandle>, ProjectError>;

    async fn get_create_bucket(
        &self,
        bucket_name: &str,
        project_id: &ProjectId,
    ) -> Result<BucketHandle, ProjectError>;

    /// Delete a bucket and its content. An already deleted bucket is not an error.
    async fn delete_bucket(&self, bucket: &BucketHandle) -> Result<(), ProjectError>;
}

/// Builds the providers a project binds when it is opened.
pub trait ProviderFactory: Send + Sync {
    /// Returns `Ok(None)` when this factory does not handle `kind`.
    fn create(
        &self,
        kind: ProviderKind,
        project_id: &ProjectId,
        config: &DevSideConfig,
        temp_tokens: Option<&TempTokens>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Option<Arc<dyn CredentialProvider>>, ProjectError>;
}
