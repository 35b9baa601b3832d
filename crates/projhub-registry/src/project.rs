//! In-memory handle to one open project.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use projhub_core::{
    is_valid_bucket_name, BucketHandle, CallerContext, CreationParams, CredentialProvider, CredentialSet,
    DevSideConfig, LocalSecret, Member, MemberId, ProjectData, ProjectError, ProjectFilesystem,
    ProjectId, ProviderKind, SecretsStorage, TempTokens,
};
use tracing::{debug, info, instrument, warn};

use crate::fs::HostFs;
use crate::lock::{ShareableLock, ShareableLockGuard};
use crate::registry::persist;
use crate::store::MetadataStore;

/// Name, relative to the project, of the provider-side secrets bucket.
pub const SECRETS_BUCKET: &str = "secrets";

/// Parameters of [`crate::Registry::open_project`].
#[derive(Debug, Clone, Default)]
pub struct OpenProjectParams {
    pub dev_side_config: DevSideConfig,
    pub temp_tokens: Option<TempTokens>,
    /// Maximum size of the project filesystem in bytes, 0 for unbounded.
    pub max_filesystem_size: u64,
    pub expose_web_servers: bool,
}

/// Everything a project is built from.
pub(crate) struct ProjectParts {
    pub id: ProjectId,
    pub data: ProjectData,
    pub fs: Arc<dyn ProjectFilesystem>,
    pub config: DevSideConfig,
    pub temp_tokens: Option<TempTokens>,
    pub expose_web_servers: bool,
    pub providers: HashMap<ProviderKind, Arc<dyn CredentialProvider>>,
    pub host: HostFs,
    pub store: Option<Arc<MetadataStore>>,
}

/// An open project.
///
/// A project starts unshared: the call path that built it uses it without
/// locking. After [`Project::share`] every operation that reads mutable state
/// or reaches a provider runs under the project's shareable lock.
pub struct Project {
    id: ProjectId,
    data: RwLock<ProjectData>,
    fs: Arc<dyn ProjectFilesystem>,
    config: DevSideConfig,
    temp_tokens: RwLock<Option<TempTokens>>,
    expose_web_servers: bool,
    providers: HashMap<ProviderKind, Arc<dyn CredentialProvider>>,
    lock: ShareableLock,
    dev_databases_dir: OnceLock<PathBuf>,
    host: HostFs,
    /// `None` for projects not backed by a registry.
    store: Option<Arc<MetadataStore>>,
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("id", &self.id)
            .field("shared", &self.lock.is_shared())
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Project {
    pub(crate) fn from_parts(parts: ProjectParts) -> Self {
        Self {
            id: parts.id,
            data: RwLock::new(parts.data),
            fs: parts.fs,
            config: parts.config,
            temp_tokens: RwLock::new(parts.temp_tokens),
            expose_web_servers: parts.expose_web_servers,
            providers: parts.providers,
            lock: ShareableLock::new(),
            dev_databases_dir: OnceLock::new(),
            host: parts.host,
            store: parts.store,
        }
    }

    /// A project that is not backed by a registry. Its mutations fail with
    /// `PersistenceNotAvailable`.
    pub fn detached(
        id: ProjectId,
        data: ProjectData,
        fs: Arc<dyn ProjectFilesystem>,
        host_root: impl Into<PathBuf>,
    ) -> Self {
        Self::from_parts(ProjectParts {
            id,
            data,
            fs,
            config: DevSideConfig::default(),
            temp_tokens: None,
            expose_web_servers: false,
            providers: HashMap::new(),
            host: HostFs::new(host_root),
            store: None,
        })
    }

    pub fn id(&self) -> &ProjectId {
        &self.id
    }

    pub fn creation_params(&self) -> CreationParams {
        self.read_data().creation_params.clone()
    }

    pub fn live_filesystem(&self) -> Arc<dyn ProjectFilesystem> {
        self.fs.clone()
    }

    pub fn configuration(&self) -> &DevSideConfig {
        &self.config
    }

    pub fn exposes_web_servers(&self) -> bool {
        self.expose_web_servers
    }

    /// Snapshot of the persisted record.
    pub fn data(&self) -> ProjectData {
        self.read_data().clone()
    }

    pub fn temp_tokens(&self) -> Option<TempTokens> {
        self.temp_tokens
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Hand the project out to concurrent callers.
    pub fn share(&self) {
        self.lock.share();
    }

    pub fn is_shared(&self) -> bool {
        self.lock.is_shared()
    }

    pub async fn lock(&self, ctx: &CallerContext) -> Result<ShareableLockGuard<'_>, ProjectError> {
        self.lock.lock(ctx).await
    }

    fn read_data(&self) -> RwLockReadGuard<'_, ProjectData> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_data(&self) -> RwLockWriteGuard<'_, ProjectData> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Host directory holding the project's development databases, created on first use.
    pub async fn dev_databases_dir_on_os_fs(&self) -> Result<PathBuf, ProjectError> {
        if let Some(dir) = self.dev_databases_dir.get() {
            return Ok(dir.clone());
        }

        // Concurrent first calls may all get here; creation is idempotent
        // and the first value stored wins.
        let dir = self.host.dev_databases_dir(&self.id);
        self.host.mkdir_all(&dir).await?;
        Ok(self.dev_databases_dir.get_or_init(|| dir).clone())
    }

    // =========================================================================
    // Members
    // =========================================================================

    pub async fn get_member_by_id(&self, ctx: &CallerContext, id: &MemberId) -> Option<Member> {
        let _guard = self.lock.lock_uncancellable(ctx).await;
        self.read_data().members.iter().find(|m| &m.id == id).cloned()
    }

    pub async fn get_member_by_name(&self, ctx: &CallerContext, name: &str) -> Option<Member> {
        let _guard = self.lock.lock_uncancellable(ctx).await;
        self.read_data()
            .members
            .iter()
            .find(|m| m.name == name)
            .cloned()
    }

    /// Add a member with a fresh id. Names are unique within a project.
    #[instrument(skip(self, ctx), level = "debug", fields(project = %self.id))]
    pub async fn add_member(&self, ctx: &CallerContext, name: &str) -> Result<Member, ProjectError> {
        let _guard = self.lock.lock(ctx).await?;

        if self.read_data().members.iter().any(|m| m.name == name) {
            return Err(ProjectError::InvalidInput(format!(
                "member {} already exists in project {}",
                name, self.id
            )));
        }
        let member = Member {
            id: MemberId::random(),
            name: name.to_string(),
        };
        let added = member.clone();
        self.mutate_and_persist(move |data| data.members.push(added))?;
        info!("Added member {} to project {}", name, self.id);
        Ok(member)
    }

    // =========================================================================
    // Local secrets
    // =========================================================================

    pub async fn list_secrets(&self, ctx: &CallerContext) -> Result<Vec<String>, ProjectError> {
        let _guard = self.lock.lock(ctx).await?;
        Ok(self.read_data().secrets.keys().cloned().collect())
    }

    #[instrument(skip(self, ctx, value), level = "debug", fields(project = %self.id))]
    pub async fn upsert_secret(
        &self,
        ctx: &CallerContext,
        name: &str,
        value: &str,
    ) -> Result<(), ProjectError> {
        if name.is_empty() {
            return Err(ProjectError::InvalidInput("secret name is empty".to_string()));
        }
        let _guard = self.lock.lock(ctx).await?;

        let secret = LocalSecret {
            value: value.to_string(),
            created_at: Utc::now(),
        };
        let name = name.to_string();
        self.mutate_and_persist(move |data| {
            data.secrets.insert(name, secret);
        })
    }

    /// Returns whether the secret existed.
    pub async fn delete_secret(&self, ctx: &CallerContext, name: &str) -> Result<bool, ProjectError> {
        let _guard = self.lock.lock(ctx).await?;

        if !self.read_data().secrets.contains_key(name) {
            return Ok(false);
        }
        self.mutate_and_persist(|data| {
            data.secrets.remove(name);
        })?;
        Ok(true)
    }

    /// Apply `mutate` to a copy of the record, persist it, then publish it.
    /// On failure the in-memory record is left untouched.
    fn mutate_and_persist(
        &self,
        mutate: impl FnOnce(&mut ProjectData),
    ) -> Result<(), ProjectError> {
        let store = self
            .store
            .as_ref()
            .ok_or(ProjectError::PersistenceNotAvailable)?;

        let mut updated = self.read_data().clone();
        mutate(&mut updated);
        persist(store, &self.id, &updated)?;
        *self.write_data() = updated;
        Ok(())
    }

    // =========================================================================
    // Cloud credentials
    // =========================================================================

    /// Whether a provider named `provider_name` is bound to the project.
    pub fn can_provide_s3_credentials(&self, provider_name: &str) -> bool {
        provider_name
            .parse::<ProviderKind>()
            .map(|kind| self.providers.contains_key(&kind))
            .unwrap_or(false)
    }

    fn provider(&self, provider_name: &str) -> Result<&Arc<dyn CredentialProvider>, ProjectError> {
        let kind: ProviderKind = provider_name.parse()?;
        self.providers
            .get(&kind)
            .ok_or_else(|| ProjectError::NoProviderBound(kind.to_string()))
    }

    /// Provider used for the secrets bucket.
    fn secrets_provider(&self) -> Result<&Arc<dyn CredentialProvider>, ProjectError> {
        self.provider(ProviderKind::Cloudflare.as_str())
    }

    /// Run `fut`, giving up with `Cancelled` if `ctx` is cancelled first.
    async fn until_cancelled<T>(
        ctx: &CallerContext,
        fut: impl Future<Output = Result<T, ProjectError>>,
    ) -> Result<T, ProjectError> {
        tokio::select! {
            result = fut => result,
            _ = ctx.cancelled() => Err(ProjectError::Cancelled),
        }
    }

    /// Get-or-create S3 credentials for `bucket` from the provider named `provider_name`.
    ///
    /// `InvalidInput` rejects a malformed bucket name, `NoProviderBound` means no
    /// credentials can be provided and `CredentialRequest` means the provider
    /// failed to issue them.
    #[instrument(skip(self, ctx), level = "debug", fields(project = %self.id))]
    pub async fn get_s3_credentials_for_bucket(
        &self,
        ctx: &CallerContext,
        bucket: &str,
        provider_name: &str,
    ) -> Result<CredentialSet, ProjectError> {
        if !is_valid_bucket_name(bucket) {
            return Err(ProjectError::InvalidInput(format!(
                "invalid bucket name {:?} for project {}",
                bucket, self.id
            )));
        }
        let _guard = self.lock.lock(ctx).await?;
        let provider = self.provider(provider_name).map_err(|e| match e {
            ProjectError::NoProviderBound(kind) => ProjectError::NoProviderBound(format!(
                "{} (project {}, bucket {})",
                kind, self.id, bucket
            )),
            other => other,
        })?;

        Self::until_cancelled(
            ctx,
            provider.get_create_s3_credentials_for_single_bucket(bucket, &self.id),
        )
        .await
        .map_err(|e| match e {
            ProjectError::Cancelled => e,
            other => ProjectError::CredentialRequest(format!(
                "project {}, bucket {}: {}",
                self.id, bucket, other
            )),
        })
    }

    /// Refresh the project's temp tokens through the provider named `provider_name`.
    pub async fn get_up_to_date_temp_tokens(
        &self,
        ctx: &CallerContext,
        provider_name: &str,
    ) -> Result<TempTokens, ProjectError> {
        let _guard = self.lock.lock(ctx).await?;
        let provider = self.provider(provider_name)?;

        let tokens = Self::until_cancelled(ctx, provider.get_up_to_date_temp_tokens(&self.id))
            .await?;
        *self.temp_tokens.write().unwrap_or_else(|e| e.into_inner()) = Some(tokens.clone());
        Ok(tokens)
    }

    /// Get-or-create the provider-side secrets bucket.
    ///
    /// Fails with `SecretStorageAlreadySet` when secrets are stored locally.
    pub async fn get_create_secrets_bucket(
        &self,
        ctx: &CallerContext,
    ) -> Result<BucketHandle, ProjectError> {
        let _guard = self.lock.lock(ctx).await?;
        if self.config.secrets_storage == SecretsStorage::Local {
            return Err(ProjectError::SecretStorageAlreadySet);
        }
        let provider = self.secrets_provider()?;
        Self::until_cancelled(ctx, provider.get_create_bucket(SECRETS_BUCKET, &self.id)).await
    }

    async fn resolve_secrets_bucket(
        &self,
        ctx: &CallerContext,
    ) -> Result<Option<(BucketHandle, &Arc<dyn CredentialProvider>)>, ProjectError> {
        if self.config.secrets_storage == SecretsStorage::Local {
            return Err(ProjectError::SecretStorageAlreadySet);
        }
        let provider = match self.secrets_provider() {
            Ok(provider) => provider,
            // Without a provider no bucket can ever have been created.
            Err(ProjectError::NoProviderBound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let bucket =
            Self::until_cancelled(ctx, provider.get_bucket(SECRETS_BUCKET, &self.id)).await?;
        Ok(bucket.map(|b| (b, provider)))
    }

    /// Delete the provider-side secrets bucket. Succeeds when there is none.
    #[instrument(skip(self, ctx), level = "debug", fields(project = %self.id))]
    pub async fn delete_secrets_bucket(&self, ctx: &CallerContext) -> Result<(), ProjectError> {
        let _guard = self.lock.lock(ctx).await?;

        match self.resolve_secrets_bucket(ctx).await {
            Ok(Some((bucket, provider))) => {
                Self::until_cancelled(ctx, provider.delete_bucket(&bucket)).await?;
                info!("Deleted secrets bucket {} of project {}", bucket.name, self.id);
                Ok(())
            }
            Ok(None) => {
                debug!("Project {} has no secrets bucket", self.id);
                Ok(())
            }
            Err(e) if e.is_benign() => {
                debug!("Project {} keeps its secrets locally: {}", self.id, e);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to resolve secrets bucket of project {}: {}", self.id, e);
                Err(e)
            }
        }
    }
}
