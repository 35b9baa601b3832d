//! Registry of projects: persisted metadata plus the open-project cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use projhub_core::{
    CreationParams, CredentialProvider, KeyValueStore, ProjectData, ProjectError,
    ProjectFilesystem, ProjectId, ProviderFactory, ProviderKind,
};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::{debug, info, instrument, warn};

use crate::fs::HostFs;
use crate::project::{OpenProjectParams, Project, ProjectParts};
use crate::store::MetadataStore;
use crate::templates::{self, TUTORIAL_FILE_PATH};

const PROJECT_KEY_PREFIX: &str = "/projects/";

/// Key of a project's record in the metadata store.
pub fn project_key(id: &ProjectId) -> String {
    format!("{}{}", PROJECT_KEY_PREFIX, id)
}

/// Upsert the record of project `id` in a single write transaction.
pub(crate) fn persist(
    store: &MetadataStore,
    id: &ProjectId,
    data: &ProjectData,
) -> Result<(), ProjectError> {
    let json = data.to_json()?;
    store.update(|tx| tx.set(&project_key(id), &json).map(|_| ()))?;
    debug!("Persisted project {} ({} bytes)", id, json.len());
    Ok(())
}

/// Prefix the message of a storage or filesystem error with the failed step.
fn step_context<'a>(
    id: &'a ProjectId,
    step: &'static str,
) -> impl FnOnce(ProjectError) -> ProjectError + 'a {
    move |e| match e {
        ProjectError::Filesystem(msg) => {
            ProjectError::Filesystem(format!("project {}: {}: {}", id, step, msg))
        }
        ProjectError::Store(msg) => {
            ProjectError::Store(format!("project {}: {}: {}", id, step, msg))
        }
        other => other,
    }
}

type OpenSlot = OnceCell<Arc<Project>>;

/// Owns the metadata store and the projects currently open in this process.
///
/// At most one [`Project`] instance exists per id while it is open.
pub struct Registry {
    host: HostFs,
    store: Arc<MetadataStore>,
    /// One slot per id, filled by the first successful open.
    open_projects: AsyncMutex<HashMap<ProjectId, Arc<OpenSlot>>>,
    provider_factories: Vec<Arc<dyn ProviderFactory>>,
}

impl Registry {
    /// Open the registry rooted at `root_dir`, creating its metadata store if absent.
    ///
    /// No project is loaded.
    pub fn open(root_dir: impl Into<PathBuf>) -> Result<Self, ProjectError> {
        let root_dir = root_dir.into();
        let store = MetadataStore::open(&root_dir)?;
        info!("Opened project registry at {}", root_dir.display());

        Ok(Self {
            host: HostFs::new(root_dir),
            store: Arc::new(store),
            open_projects: AsyncMutex::new(HashMap::new()),
            provider_factories: Vec::new(),
        })
    }

    /// Register a factory used to bind credential providers when projects are opened.
    pub fn with_provider_factory(mut self, factory: Arc<dyn ProviderFactory>) -> Self {
        self.provider_factories.push(factory);
        self
    }

    pub fn root_dir(&self) -> &Path {
        self.host.root()
    }

    pub fn metadata_store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// Create a project and return its new id.
    ///
    /// The metadata record is written before the project directory and
    /// filesystem are set up; a failure in a later step leaves the record in
    /// place. Retrying creates a project with a different id.
    #[instrument(skip(self), level = "debug")]
    pub async fn create_project(&self, params: CreationParams) -> Result<ProjectId, ProjectError> {
        let id = ProjectId::random(&params.name)?;
        if !params.template.is_empty()
            && !templates::template_names().contains(&params.template.as_str())
        {
            return Err(ProjectError::InvalidInput(format!(
                "unknown template: {}",
                params.template
            )));
        }

        self.host
            .mkdir_all(self.host.root())
            .await
            .map_err(step_context(&id, "create registry root"))?;

        persist(&self.store, &id, &ProjectData::new(params.clone()))
            .map_err(step_context(&id, "write metadata"))?;

        let result = self.set_up_project_dirs(&id, &params).await;
        if let Err(e) = &result {
            warn!(
                "Project {} creation failed after its metadata was written: {}",
                id, e
            );
        }
        result?;

        info!("Created project {} (template: {:?})", id, params.template);
        Ok(id)
    }

    async fn set_up_project_dirs(
        &self,
        id: &ProjectId,
        params: &CreationParams,
    ) -> Result<(), ProjectError> {
        self.host
            .mkdir_all(&self.host.project_dir(id))
            .await
            .map_err(step_context(id, "create project directory"))?;

        let fs = self
            .host
            .open_project_fs(id, 0)
            .await
            .map_err(step_context(id, "open project filesystem"))?;
        if !params.template.is_empty() {
            templates::write_template(&params.template, fs.as_ref())
                .await
                .map_err(step_context(id, "write template"))?;
        }
        if params.add_tut_file {
            fs.write_file(TUTORIAL_FILE_PATH, b"")
                .await
                .map_err(step_context(id, "write tutorial file"))?;
        }
        fs.close().await?;

        self.host
            .mkdir_all(&self.host.dev_databases_dir(id))
            .await
            .map_err(step_context(id, "create dev databases directory"))
    }

    /// Open a project, or return the already open instance.
    ///
    /// The registry lock only guards the lookup of the id's slot. Loading
    /// happens outside of it, and concurrent first opens of the same id wait
    /// on that slot so that a single instance gets built.
    #[instrument(skip(self, params), level = "debug")]
    pub async fn open_project(
        &self,
        id: &ProjectId,
        params: OpenProjectParams,
    ) -> Result<Arc<Project>, ProjectError> {
        let slot = self
            .open_projects
            .lock()
            .await
            .entry(id.clone())
            .or_default()
            .clone();
        if let Some(project) = slot.get() {
            debug!("Project {} is already open", id);
            return Ok(project.clone());
        }

        let result = slot
            .get_or_try_init(|| async {
                let project = Arc::new(self.load_project(id, params).await?);
                project.share();
                project.dev_databases_dir_on_os_fs().await?;
                info!("Opened project {}", id);
                Ok::<_, ProjectError>(project)
            })
            .await
            .cloned();

        if result.is_err() {
            self.discard_slot(id, &slot).await;
        }
        result
    }

    /// Drop the empty slot of a failed open unless another caller still waits on it.
    async fn discard_slot(&self, id: &ProjectId, slot: &Arc<OpenSlot>) {
        let mut open_projects = self.open_projects.lock().await;
        let unused = open_projects.get(id).is_some_and(|current| {
            Arc::ptr_eq(current, slot) && !current.initialized() && Arc::strong_count(current) == 2
        });
        if unused {
            open_projects.remove(id);
        }
    }

    async fn load_project(
        &self,
        id: &ProjectId,
        params: OpenProjectParams,
    ) -> Result<Project, ProjectError> {
        let key = project_key(id);
        let bytes = self
            .store
            .view(|tx| tx.get(&key))?
            .ok_or_else(|| ProjectError::ProjectNotFound(id.to_string()))?;
        let data = ProjectData::from_json(&bytes).map_err(|e| {
            ProjectError::Serialization(format!("record of project {}: {}", id, e))
        })?;

        let fs = self
            .host
            .open_project_fs(id, params.max_filesystem_size)
            .await
            .map_err(step_context(id, "open project filesystem"))?;

        let providers = self.bind_providers(id, &params)?;

        Ok(Project::from_parts(ProjectParts {
            id: id.clone(),
            data,
            fs,
            config: params.dev_side_config,
            temp_tokens: params.temp_tokens,
            expose_web_servers: params.expose_web_servers,
            providers,
            host: self.host.clone(),
            store: Some(self.store.clone()),
        }))
    }

    fn bind_providers(
        &self,
        id: &ProjectId,
        params: &OpenProjectParams,
    ) -> Result<HashMap<ProviderKind, Arc<dyn CredentialProvider>>, ProjectError> {
        let mut providers = HashMap::new();
        for kind in params.dev_side_config.requested_providers() {
            let mut bound = None;
            for factory in &self.provider_factories {
                let store: Arc<dyn KeyValueStore> = self.store.clone();
                let created = factory
                    .create(
                        kind,
                        id,
                        &params.dev_side_config,
                        params.temp_tokens.as_ref(),
                        store,
                    )
                    .map_err(|e| {
                        ProjectError::Provider(format!(
                            "failed to bind {} provider to project {}: {}",
                            kind, id, e
                        ))
                    })?;
                if created.is_some() {
                    bound = created;
                    break;
                }
            }

            let provider = bound.ok_or_else(|| {
                ProjectError::Provider(format!(
                    "failed to bind {} provider to project {}: no factory registered",
                    kind, id
                ))
            })?;
            debug!("Bound {} provider to project {}", kind, id);
            providers.insert(kind, provider);
        }
        Ok(providers)
    }

    /// Ids of every project with a metadata record.
    pub fn list_project_ids(&self) -> Result<Vec<ProjectId>, ProjectError> {
        let keys = self.store.view(|tx| tx.keys_with_prefix(PROJECT_KEY_PREFIX))?;
        let mut ids = Vec::with_capacity(keys.len());
        for key in keys {
            match ProjectId::parse(&key[PROJECT_KEY_PREFIX.len()..]) {
                Ok(id) => ids.push(id),
                Err(e) => warn!("Skipping metadata record {}: {}", key, e),
            }
        }
        Ok(ids)
    }

    pub async fn is_open(&self, id: &ProjectId) -> bool {
        self.open_projects
            .lock()
            .await
            .get(id)
            .is_some_and(|slot| slot.initialized())
    }

    pub async fn open_project_count(&self) -> usize {
        self.open_projects
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Close the metadata store. Open projects are left as they are.
    pub fn close(&self) -> Result<(), ProjectError> {
        self.store.close()?;
        info!("Closed project registry at {}", self.host.root().display());
        Ok(())
    }
}
