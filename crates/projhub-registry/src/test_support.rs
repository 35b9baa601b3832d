//! In-process credential provider used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use projhub_core::{
    BucketHandle, CloudflareDevConfig, CloudflareTempTokens, CredentialProvider, CredentialSet,
    DevSideConfig, KeyValueStore, ProjectError, ProjectId, ProviderFactory, ProviderKind,
    SecretsStorage, TempTokens,
};

#[derive(Default)]
pub struct FakeProvider {
    pub buckets: Mutex<HashSet<String>>,
    pub credentials: Mutex<HashMap<String, CredentialSet>>,
    pub credential_creations: AtomicUsize,
    pub deleted_buckets: Mutex<Vec<String>>,
    pub fail_with: Mutex<Option<ProjectError>>,
    pub delay: Option<Duration>,
}

impl FakeProvider {
    fn bucket_name(bucket: &str, project_id: &ProjectId) -> String {
        format!("{}-{}", project_id.bucket_safe(), bucket)
    }

    fn check_failure(&self) -> Result<(), ProjectError> {
        match self.fail_with.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CredentialProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloudflare
    }

    async fn get_up_to_date_temp_tokens(
        &self,
        project_id: &ProjectId,
    ) -> Result<TempTokens, ProjectError> {
        self.check_failure()?;
        Ok(TempTokens {
            cloudflare: Some(CloudflareTempTokens {
                token_id: format!("{}-temp", project_id),
                additional_tokens_api_token: "temp-token".into(),
                expires_at: Utc::now() + chrono::Duration::hours(24),
            }),
        })
    }

    async fn get_create_s3_credentials_for_single_bucket(
        &self,
        bucket_name: &str,
        project_id: &ProjectId,
    ) -> Result<CredentialSet, ProjectError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.check_failure()?;

        let name = Self::bucket_name(bucket_name, project_id);
        self.buckets.lock().unwrap().insert(name.clone());
        let mut credentials = self.credentials.lock().unwrap();
        let set = credentials.entry(name.clone()).or_insert_with(|| {
            let n = self.credential_creations.fetch_add(1, Ordering::SeqCst);
            CredentialSet {
                access_key: format!("ak-{}", n),
                secret_key: format!("sk-{}", n),
                s3_endpoint: "https://fake.example".into(),
                bucket_name: name,
            }
        });
        Ok(set.clone())
    }

    async fn get_bucket(
        &self,
        bucket_name: &str,
        project_id: &ProjectId,
    ) -> Result<Option<BucketHandle>, ProjectError> {
        self.check_failure()?;
        let name = Self::bucket_name(bucket_name, project_id);
        Ok(self
            .buckets
            .lock()
            .unwrap()
            .contains(&name)
            .then_some(BucketHandle {
                provider: ProviderKind::Cloudflare,
                name,
            }))
    }

    async fn get_create_bucket(
        &self,
        bucket_name: &str,
        project_id: &ProjectId,
    ) -> Result<BucketHandle, ProjectError> {
        self.check_failure()?;
        let name = Self::bucket_name(bucket_name, project_id);
        self.buckets.lock().unwrap().insert(name.clone());
        Ok(BucketHandle {
            provider: ProviderKind::Cloudflare,
            name,
        })
    }

    async fn delete_bucket(&self, bucket: &BucketHandle) -> Result<(), ProjectError> {
        self.check_failure()?;
        self.buckets.lock().unwrap().remove(&bucket.name);
        self.deleted_buckets.lock().unwrap().push(bucket.name.clone());
        Ok(())
    }
}

/// Blocks provider construction for one project until released.
pub struct FactoryGate {
    project_id: ProjectId,
    release: Mutex<Receiver<()>>,
    pub entered: AtomicBool,
}

impl FactoryGate {
    pub fn new(project_id: ProjectId) -> (Arc<Self>, Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let gate = Arc::new(Self {
            project_id,
            release: Mutex::new(rx),
            entered: AtomicBool::new(false),
        });
        (gate, tx)
    }

    fn pass(&self, project_id: &ProjectId) {
        if *project_id == self.project_id {
            self.entered.store(true, Ordering::SeqCst);
            let _ = self.release.lock().unwrap().recv();
        }
    }
}

/// Hands out one shared `FakeProvider` and counts constructions.
#[derive(Default)]
pub struct FakeFactory {
    pub provider: Arc<FakeProvider>,
    pub constructions: AtomicUsize,
    pub fail: bool,
    pub gate: Option<Arc<FactoryGate>>,
}

impl ProviderFactory for FakeFactory {
    fn create(
        &self,
        kind: ProviderKind,
        project_id: &ProjectId,
        _config: &DevSideConfig,
        _temp_tokens: Option<&TempTokens>,
        _store: Arc<dyn KeyValueStore>,
    ) -> Result<Option<Arc<dyn CredentialProvider>>, ProjectError> {
        if kind != ProviderKind::Cloudflare {
            return Ok(None);
        }
        if self.fail {
            return Err(ProjectError::InvalidInput("bad account id".into()));
        }
        if let Some(gate) = &self.gate {
            gate.pass(project_id);
        }
        self.constructions.fetch_add(1, Ordering::SeqCst);
        Ok(Some(self.provider.clone()))
    }
}

pub fn cloudflare_config(secrets_storage: SecretsStorage) -> DevSideConfig {
    DevSideConfig {
        cloudflare: Some(CloudflareDevConfig {
            account_id: "account".into(),
            additional_tokens_api_token: "high-perms".into(),
            api_base_url: None,
            s3_endpoint: None,
        }),
        secrets_storage,
    }
}


/// Expected contents of the `web-app-min` template files.
pub const WEB_APP_MIN_MAIN: &[u8] =
    b"const (\n    HOST = https://localhost:8080\n)\n\nmanifest {\n    permissions: {\n        provide: HOST\n        read: {\n            %/...\n        }\n    }\n}\n\nserver = http.Server!(HOST, {\n    routing: {\n        static: /static/\n        dynamic: /routes/\n    }\n})\n";
pub const WEB_APP_MIN_BASE_CSS: &[u8] =
    b":root {\n    --font-family: system-ui, sans-serif;\n}\n\nbody {\n    margin: 0;\n    font-family: var(--font-family);\n}\n";
pub const WEB_APP_MIN_INDEX_JS: &[u8] =
    b"document.addEventListener('DOMContentLoaded', () => {\n    document.body.dataset.ready = 'true'\n})\n";
