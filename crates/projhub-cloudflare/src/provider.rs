//! Cloudflare implementation of `CredentialProvider`.
//!
//! Bucket credentials are R2 S3 credentials derived from a bucket-scoped
//! account token: the access key is the token id and the secret key is the
//! hex SHA-256 of the token value. A record of every issued token is kept in
//! the registry's key-value store so repeated requests return the same set.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use projhub_core::{
    BucketHandle, CredentialProvider, CredentialSet, KeyValueStore, ProjectError, ProjectId,
    ProviderKind, TempTokens,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use crate::api::{CloudflareApi, TokenScope};
use crate::s3;
use crate::tokens::TempTokenManager;

/// Permissions of a bucket-scoped S3 token.
pub const S3_TOKEN_PERMISSIONS: &[&str] = &["Workers R2 Storage Bucket Item Write"];

/// Key of the credential record of a project bucket.
pub fn credentials_key(project_id: &ProjectId, bucket: &str) -> String {
    format!("/credentials/cloudflare/{}/{}", project_id, bucket)
}

/// Name of the R2 bucket backing `bucket` of a project.
pub fn bucket_name(project_id: &ProjectId, bucket: &str) -> String {
    format!("{}-{}", project_id.bucket_safe(), bucket)
}

fn s3_token_name(project_id: &ProjectId, bucket: &str) -> String {
    format!("{}-{}-s3", project_id, bucket)
}

/// S3 secret key of an R2 token.
pub fn s3_secret_key(token_value: &str) -> String {
    hex::encode(Sha256::digest(token_value.as_bytes()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialRecord {
    token_id: String,
    secret_key: String,
    bucket_name: String,
    created_at: DateTime<Utc>,
}

pub struct CloudflareProvider {
    project_id: ProjectId,
    api: Arc<CloudflareApi>,
    tokens: TempTokenManager,
    s3_endpoint: String,
    store: Arc<dyn KeyValueStore>,
    /// One lock per credential record.
    bucket_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl CloudflareProvider {
    pub fn new(
        project_id: ProjectId,
        api: Arc<CloudflareApi>,
        high_perms_token: String,
        s3_endpoint: String,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let tokens = TempTokenManager::new(api.clone(), high_perms_token);
        Self {
            project_id,
            api,
            tokens,
            s3_endpoint,
            store,
            bucket_locks: DashMap::new(),
        }
    }

    /// Reuse temp tokens obtained by an earlier process.
    pub fn with_temp_tokens(self, temp_tokens: Option<&TempTokens>) -> Self {
        if let Some(tokens) = temp_tokens.and_then(|t| t.cloudflare.as_ref()) {
            self.tokens.seed(&self.project_id, tokens.clone());
        }
        self
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub fn s3_endpoint(&self) -> &str {
        &self.s3_endpoint
    }

    fn bucket_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.bucket_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .value()
            .clone()
    }

    async fn temp_token(&self, project_id: &ProjectId) -> Result<String, ProjectError> {
        Ok(self
            .tokens
            .get_up_to_date(project_id)
            .await?
            .additional_tokens_api_token)
    }

    fn load_record(&self, key: &str) -> Result<Option<CredentialRecord>, ProjectError> {
        match self.store.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_record(&self, key: &str, record: &CredentialRecord) -> Result<(), ProjectError> {
        self.store.set(key, &serde_json::to_vec(record)?)?;
        Ok(())
    }

    fn credential_set(&self, record: CredentialRecord) -> CredentialSet {
        CredentialSet {
            access_key: record.token_id,
            secret_key: record.secret_key,
            s3_endpoint: self.s3_endpoint.clone(),
            bucket_name: record.bucket_name,
        }
    }

    async fn get_create_bucket_named(
        &self,
        token: &str,
        name: &str,
    ) -> Result<BucketHandle, ProjectError> {
        if self.api.get_bucket(token, name).await?.is_none() {
            self.api.create_bucket(token, name).await?;
            info!("Created bucket {}", name);
        }
        Ok(BucketHandle {
            provider: ProviderKind::Cloudflare,
            name: name.to_string(),
        })
    }

    /// Delete every account token of the project, including the temp token.
    ///
    /// Uses the high-permission token. Returns the number of deleted tokens.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete_high_perms_tokens(
        &self,
        project_id: &ProjectId,
    ) -> Result<usize, ProjectError> {
        let token = self.tokens.high_perms_token();
        let prefix = format!("{}-", project_id);

        let mut deleted = 0;
        for remote in self.api.list_tokens(token).await? {
            if !remote.name.starts_with(&prefix) {
                continue;
            }
            if self.api.delete_token(token, &remote.id).await? {
                debug!("Deleted token {} ({})", remote.name, remote.id);
                deleted += 1;
            }
        }
        self.tokens.forget(project_id);

        info!("Deleted {} tokens of project {}", deleted, project_id);
        Ok(deleted)
    }
}

#[async_trait]
impl CredentialProvider for CloudflareProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloudflare
    }

    async fn get_up_to_date_temp_tokens(
        &self,
        project_id: &ProjectId,
    ) -> Result<TempTokens, ProjectError> {
        let tokens = self.tokens.get_up_to_date(project_id).await?;
        Ok(TempTokens {
            cloudflare: Some(tokens),
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_create_s3_credentials_for_single_bucket(
        &self,
        bucket: &str,
        project_id: &ProjectId,
    ) -> Result<CredentialSet, ProjectError> {
        let key = credentials_key(project_id, bucket);
        let lock = self.bucket_lock(&key);
        let _guard = lock.lock().await;

        let token = self.temp_token(project_id).await?;
        let bucket_handle = self
            .get_create_bucket_named(&token, &bucket_name(project_id, bucket))
            .await?;

        let token_name = s3_token_name(project_id, bucket);
        let remote = self
            .api
            .list_tokens(&token)
            .await?
            .into_iter()
            .find(|t| t.name == token_name);
        let record = self.load_record(&key)?;

        let (token_id, token_value) = match (record, remote) {
            (Some(record), Some(remote)) if record.token_id == remote.id => {
                debug!("Reusing S3 credentials {} of {}", record.token_id, key);
                return Ok(self.credential_set(record));
            }
            (_, Some(remote)) => {
                // The secret cannot be recovered without a local record.
                warn!("Token {} has no matching local record, rolling it", token_name);
                let value = self.api.roll_token(&token, &remote.id).await?;
                (remote.id, value)
            }
            (record, None) => {
                if let Some(record) = record {
                    warn!(
                        "Token {} of {} no longer exists, creating a new one",
                        record.token_id, key
                    );
                }
                let created = self
                    .api
                    .create_token(
                        &token,
                        &token_name,
                        S3_TOKEN_PERMISSIONS,
                        &TokenScope::Bucket(bucket_handle.name.clone()),
                        None,
                    )
                    .await?;
                let value = created.value.ok_or_else(|| {
                    ProjectError::Provider(format!("token {} was created without a value", token_name))
                })?;
                (created.id, value)
            }
        };
        self.api.verify_token(&token_value).await?;

        let record = CredentialRecord {
            token_id,
            secret_key: s3_secret_key(&token_value),
            bucket_name: bucket_handle.name,
            created_at: Utc::now(),
        };
        self.save_record(&key, &record)?;
        info!("Issued S3 credentials {} for {}", record.token_id, key);
        Ok(self.credential_set(record))
    }

    async fn get_bucket(
        &self,
        bucket: &str,
        project_id: &ProjectId,
    ) -> Result<Option<BucketHandle>, ProjectError> {
        let token = self.temp_token(project_id).await?;
        let name = bucket_name(project_id, bucket);
        Ok(self
            .api
            .get_bucket(&token, &name)
            .await?
            .map(|b| BucketHandle {
                provider: ProviderKind::Cloudflare,
                name: b.name,
            }))
    }

    async fn get_create_bucket(
        &self,
        bucket: &str,
        project_id: &ProjectId,
    ) -> Result<BucketHandle, ProjectError> {
        let token = self.temp_token(project_id).await?;
        self.get_create_bucket_named(&token, &bucket_name(project_id, bucket))
            .await
    }

    /// Empty the bucket through the S3 API, then delete it.
    #[instrument(skip(self), level = "debug")]
    async fn delete_bucket(&self, bucket: &BucketHandle) -> Result<(), ProjectError> {
        let temp = self.tokens.get_up_to_date(&self.project_id).await?;
        let token = temp.additional_tokens_api_token.as_str();

        if self.api.get_bucket(token, &bucket.name).await?.is_none() {
            debug!("Bucket {} does not exist", bucket.name);
            return Ok(());
        }

        let client = s3::r2_client(&self.s3_endpoint, &temp.token_id, &s3_secret_key(token));
        let removed = s3::empty_bucket(&client, &bucket.name).await?;
        if !self.api.delete_bucket(token, &bucket.name).await? {
            debug!("Bucket {} was deleted concurrently", bucket.name);
        }
        info!("Deleted bucket {} ({} objects removed)", bucket.name, removed);
        Ok(())
    }
}
