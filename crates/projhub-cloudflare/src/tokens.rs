//! Per-project temporary token manager with automatic refresh.
//!
//! Each project gets one account token named `<project id>-temp`, created with
//! the high-permission token. The temp token is cached in memory and replaced
//! when it gets within five minutes of expiry.

use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use projhub_core::{CloudflareTempTokens, ProjectError, ProjectId};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::api::{CloudflareApi, TokenScope};

/// Permissions of a project's temp token.
pub const TEMP_TOKEN_PERMISSIONS: &[&str] = &["Workers R2 Storage Write", "Account API Tokens Write"];

const TEMP_TOKEN_LIFETIME_HOURS: i64 = 24;

pub fn temp_token_name(project_id: &ProjectId) -> String {
    format!("{}-temp", project_id)
}

pub struct TempTokenManager {
    api: Arc<CloudflareApi>,
    high_perms_token: String,
    cache: DashMap<ProjectId, CloudflareTempTokens>,
    /// Serializes refreshes so a project never gets two fresh tokens.
    refresh_lock: AsyncMutex<()>,
}

impl TempTokenManager {
    pub fn new(api: Arc<CloudflareApi>, high_perms_token: String) -> Self {
        Self {
            api,
            high_perms_token,
            cache: DashMap::new(),
            refresh_lock: AsyncMutex::new(()),
        }
    }

    pub fn high_perms_token(&self) -> &str {
        &self.high_perms_token
    }

    /// Start from tokens obtained earlier, unless they are already expired.
    pub fn seed(&self, project_id: &ProjectId, tokens: CloudflareTempTokens) {
        if tokens.is_expired() {
            debug!("Ignoring expired temp token of project {}", project_id);
            return;
        }
        self.cache.insert(project_id.clone(), tokens);
    }

    fn cached(&self, project_id: &ProjectId) -> Option<CloudflareTempTokens> {
        self.cache
            .get(project_id)
            .filter(|cached| !cached.is_expired())
            .map(|cached| cached.value().clone())
    }

    /// Get a valid temp token for a project, creating a new one if necessary.
    pub async fn get_up_to_date(
        &self,
        project_id: &ProjectId,
    ) -> Result<CloudflareTempTokens, ProjectError> {
        if let Some(cached) = self.cached(project_id) {
            debug!("Temp token cache hit for project {}", project_id);
            return Ok(cached);
        }

        let _refresh = self.refresh_lock.lock().await;
        if let Some(cached) = self.cached(project_id) {
            return Ok(cached);
        }

        let name = temp_token_name(project_id);
        for stale in self
            .api
            .list_tokens(&self.high_perms_token)
            .await?
            .into_iter()
            .filter(|t| t.name == name)
        {
            debug!("Deleting previous temp token {} of project {}", stale.id, project_id);
            self.api.delete_token(&self.high_perms_token, &stale.id).await?;
        }

        let expires_at = Utc::now() + Duration::hours(TEMP_TOKEN_LIFETIME_HOURS);
        let created = self
            .api
            .create_token(
                &self.high_perms_token,
                &name,
                TEMP_TOKEN_PERMISSIONS,
                &TokenScope::Account,
                Some(expires_at),
            )
            .await?;
        let value = created.value.ok_or_else(|| {
            ProjectError::Provider(format!("temp token {} was created without a value", name))
        })?;
        self.api.verify_token(&value).await?;

        let tokens = CloudflareTempTokens {
            token_id: created.id,
            additional_tokens_api_token: value,
            expires_at,
        };
        self.cache.insert(project_id.clone(), tokens.clone());
        info!(
            "Created temp token {} for project {} (expires {})",
            tokens.token_id, project_id, expires_at
        );
        Ok(tokens)
    }

    pub fn forget(&self, project_id: &ProjectId) {
        self.cache.remove(project_id);
    }
}
