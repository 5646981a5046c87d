use crate::config::ConfigError;
use async_trait::async_trait;
use relaycore::{RelayError, RoleAssignment, WorkerConfig, WorkerSource};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Cached view over a [`WorkerSource`].
///
/// Snapshots are taken on first use and kept until [`invalidate`] is
/// called, so every step of a submission resolves against the same data.
///
/// [`invalidate`]: WorkerDirectory::invalidate
pub struct WorkerDirectory {
    source: Arc<dyn WorkerSource>,
    configs: RwLock<Option<Arc<Vec<WorkerConfig>>>>,
    assignments: RwLock<HashMap<String, Arc<Vec<RoleAssignment>>>>,
}

impl WorkerDirectory {
    pub fn new(source: Arc<dyn WorkerSource>) -> Self {
        Self {
            source,
            configs: RwLock::new(None),
            assignments: RwLock::new(HashMap::new()),
        }
    }

    /// All global worker configs, in registry order.
    pub async fn configs(&self) -> Result<Arc<Vec<WorkerConfig>>, RelayError> {
        if let Some(configs) = self.configs.read().await.as_ref() {
            return Ok(Arc::clone(configs));
        }

        let mut slot = self.configs.write().await;
        if let Some(configs) = slot.as_ref() {
            return Ok(Arc::clone(configs));
        }
        let loaded = Arc::new(self.source.get_all_configs().await?);
        tracing::debug!(workers = loaded.len(), "loaded worker registry snapshot");
        *slot = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    pub async fn config(&self, id: &str) -> Result<Option<WorkerConfig>, RelayError> {
        let configs = self.configs().await?;
        if let Some(config) = configs.iter().find(|c| c.id == id) {
            return Ok(Some(config.clone()));
        }
        self.source.get_config(id).await
    }

    pub async fn project_assignments(
        &self,
        project_id: &str,
    ) -> Result<Arc<Vec<RoleAssignment>>, RelayError> {
        if let Some(cached) = self.assignments.read().await.get(project_id) {
            return Ok(Arc::clone(cached));
        }

        let loaded = Arc::new(self.source.get_project_role_assignments(project_id).await?);
        self.assignments
            .write()
            .await
            .insert(project_id.to_string(), Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Drop every cached snapshot.
    pub async fn invalidate(&self) {
        *self.configs.write().await = None;
        self.assignments.write().await.clear();
        tracing::debug!("worker directory invalidated");
    }

    pub async fn invalidate_project(&self, project_id: &str) {
        self.assignments.write().await.remove(project_id);
    }
}

/// Layout of a workers file.
///
/// ```toml
/// [[workers]]
/// id = "writer-1"
/// role = "writer"
/// model = "gpt-4o"
///
/// [[projects]]
/// id = "acme"
/// assignments = [{ role = "writer", worker_config_id = "writer-1" }]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkersFile {
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub projects: Vec<ProjectAssignments>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectAssignments {
    pub id: String,
    #[serde(default)]
    pub assignments: Vec<RoleAssignment>,
}

/// In-memory worker registry, optionally loaded from a TOML file.
#[derive(Default)]
pub struct StaticWorkerSource {
    data: RwLock<WorkersFile>,
}

impl StaticWorkerSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_workers(workers: Vec<WorkerConfig>) -> Self {
        Self {
            data: RwLock::new(WorkersFile {
                workers,
                projects: Vec::new(),
            }),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        let data: WorkersFile = toml::from_str(raw)?;
        Ok(Self {
            data: RwLock::new(data),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Add or replace a worker.
    pub async fn upsert_worker(&self, worker: WorkerConfig) {
        let mut data = self.data.write().await;
        match data.workers.iter_mut().find(|w| w.id == worker.id) {
            Some(existing) => *existing = worker,
            None => data.workers.push(worker),
        }
    }

    pub async fn assign(&self, project_id: &str, assignment: RoleAssignment) {
        let mut data = self.data.write().await;
        match data.projects.iter_mut().find(|p| p.id == project_id) {
            Some(project) => {
                project
                    .assignments
                    .retain(|a| !a.role.eq_ignore_ascii_case(&assignment.role));
                project.assignments.push(assignment);
            }
            None => data.projects.push(ProjectAssignments {
                id: project_id.to_string(),
                assignments: vec![assignment],
            }),
        }
    }

    /// Remove a project's assignment for `role`. Returns whether one existed.
    pub async fn unassign(&self, project_id: &str, role: &str) -> bool {
        let mut data = self.data.write().await;
        let Some(project) = data.projects.iter_mut().find(|p| p.id == project_id) else {
            return false;
        };
        let before = project.assignments.len();
        project
            .assignments
            .retain(|a| !a.role.eq_ignore_ascii_case(role));
        project.assignments.len() != before
    }
}

#[async_trait]
impl WorkerSource for StaticWorkerSource {
    async fn get_config(&self, id: &str) -> Result<Option<WorkerConfig>, RelayError> {
        Ok(self
            .data
            .read()
            .await
            .workers
            .iter()
            .find(|w| w.id == id)
            .cloned())
    }

    async fn get_all_configs(&self) -> Result<Vec<WorkerConfig>, RelayError> {
        Ok(self.data.read().await.workers.clone())
    }

    async fn get_project_role_assignments(
        &self,
        project_id: &str,
    ) -> Result<Vec<RoleAssignment>, RelayError> {
        Ok(self
            .data
            .read()
            .await
            .projects
            .iter()
            .find(|p| p.id == project_id)
            .map(|p| p.assignments.clone())
            .unwrap_or_default())
    }
}
