use crate::directory::WorkerDirectory;
use relaycore::{
    RelayError, ResolutionScope, ResolvedWorker, StepId, ValidationError, ValidationErrors,
    WorkerRef, WorkflowDefinition, WorkflowStep,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps step worker references onto concrete worker configs.
///
/// A project's role assignments take precedence over the global registry;
/// anything the project does not cover falls through to the global lookup.
pub struct AgentResolver {
    directory: Arc<WorkerDirectory>,
}

impl AgentResolver {
    pub fn new(directory: Arc<WorkerDirectory>) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &Arc<WorkerDirectory> {
        &self.directory
    }

    pub async fn resolve(
        &self,
        step: &WorkflowStep,
        project_id: Option<&str>,
    ) -> Result<ResolvedWorker, RelayError> {
        let reference = match (&step.worker_id, &step.role) {
            (None, None) => {
                return Err(ValidationError::MissingWorkerReference {
                    step_id: step.id.clone(),
                }
                .into())
            }
            (Some(_), Some(_)) => {
                return Err(ValidationError::ConflictingWorkerReference {
                    step_id: step.id.clone(),
                }
                .into())
            }
            (Some(id), None) => WorkerRef::Id(id.clone()),
            (None, Some(role)) => WorkerRef::Role(role.clone()),
        };

        if let Some(project_id) = project_id {
            if let Some(worker) = self.resolve_in_project(&reference, project_id).await? {
                tracing::debug!(
                    step_id = %step.id,
                    worker_id = worker.worker_id(),
                    project_id,
                    "resolved {} through project assignment",
                    reference
                );
                return Ok(worker);
            }
        }

        let config = match &reference {
            WorkerRef::Id(id) => self.directory.config(id).await?,
            WorkerRef::Role(role) => self
                .directory
                .configs()
                .await?
                .iter()
                .find(|c| c.has_role(role))
                .cloned(),
        };

        match config {
            Some(config) => {
                tracing::debug!(step_id = %step.id, worker_id = %config.id, "resolved {} globally", reference);
                Ok(ResolvedWorker {
                    config: Arc::new(config),
                    scope: ResolutionScope::Global,
                })
            }
            None => Err(ValidationError::UnresolvedWorkerReference {
                step_id: step.id.clone(),
                reference: reference.to_string(),
            }
            .into()),
        }
    }

    async fn resolve_in_project(
        &self,
        reference: &WorkerRef,
        project_id: &str,
    ) -> Result<Option<ResolvedWorker>, RelayError> {
        let assignments = self.directory.project_assignments(project_id).await?;
        let assignment = assignments.iter().find(|a| match reference {
            WorkerRef::Role(role) => a.role.eq_ignore_ascii_case(role),
            WorkerRef::Id(id) => a.worker_config_id == *id,
        });

        let Some(assignment) = assignment else {
            return Ok(None);
        };

        match self.directory.config(&assignment.worker_config_id).await? {
            Some(config) => Ok(Some(ResolvedWorker {
                config: Arc::new(config),
                scope: ResolutionScope::Project,
            })),
            None => {
                tracing::warn!(
                    project_id,
                    role = %assignment.role,
                    worker_id = %assignment.worker_config_id,
                    "project assignment points at an unknown worker"
                );
                Ok(None)
            }
        }
    }

    /// Resolve every step of a definition. All reference problems are
    /// collected and returned together as [`RelayError::Validation`].
    pub async fn resolve_all(
        &self,
        definition: &WorkflowDefinition,
        project_id: Option<&str>,
    ) -> Result<HashMap<StepId, ResolvedWorker>, RelayError> {
        let mut workers = HashMap::new();
        let mut errors = ValidationErrors::default();

        for step in &definition.steps {
            match self.resolve(step, project_id).await {
                Ok(worker) => {
                    workers.insert(step.id.clone(), worker);
                }
                Err(RelayError::Validation(step_errors)) => errors.extend(step_errors),
                Err(other) => return Err(other),
            }
        }

        if errors.is_empty() {
            Ok(workers)
        } else {
            Err(errors.into())
        }
    }
}
