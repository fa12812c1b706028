//! Agent lifecycle orchestrator.
//!
//! Runs named workflows (create, start, stop, delete, archive, restore) as
//! ordered step sequences over the capability ports, under a per-agent
//! single-flight lock, emitting progress events at every step boundary and
//! writing exactly one audit entry per invocation regardless of outcome.
//!
//! Validation and lock acquisition happen in [`Orchestrator::submit`] before
//! anything is spawned: bad input and lock contention are rejected without
//! side effects. Accepted workflows run in a detached task — a caller that
//! stops listening to the progress stream never cancels in-flight backend
//! steps, because aborting mid-step can leave the sandbox in an
//! unrecoverable partial state.

mod workflows;
#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use roost_common::{AgentSnapshot, AgentStatus, PlatformKind, ProgressEvent, WorkflowKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::application::ports::{
    AgentStore, AuditLedger, ComputeBackend, CredentialStore, ObjectStoreBackend, TemplateStore,
};
use crate::application::services::locks::{AgentGuard, LockTable};
use crate::application::services::progress::ProgressEmitter;
use crate::application::services::scoping::CredentialScopingService;
use crate::domain::{
    AgentRecord, AuditEntry, AuditOutcome, CredentialRecord, OrchestratorError, TemplateRecord,
    validate_agent_name,
};

/// Tunables shared by every workflow execution.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Deadline for one backend-touching step.
    pub step_timeout: Duration,
    /// Deadline for the long polling steps (bootstrap wait, health probe).
    pub probe_timeout: Duration,
    /// Progress channel capacity per workflow.
    pub event_buffer: usize,
    /// Size class used when a create request does not name one.
    pub default_size: String,
    /// Port the agent's service process listens on inside the VM.
    pub service_port: u16,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(900),
            event_buffer: 256,
            default_size: "small".to_owned(),
            service_port: 18789,
        }
    }
}

/// Authenticated invoker of a workflow.
#[derive(Debug, Clone)]
pub struct Caller {
    pub owner_id: String,
    pub origin_addr: Option<String>,
}

/// Parameters for the create workflow.
#[derive(Debug, Clone)]
pub struct CreateAgent {
    pub name: String,
    pub platform: PlatformKind,
    pub size: Option<String>,
    pub template_id: Option<String>,
    pub credential_ids: Vec<String>,
}

/// One workflow invocation.
#[derive(Debug, Clone)]
pub enum WorkflowRequest {
    Create(CreateAgent),
    Start {
        agent_id: String,
    },
    Stop {
        agent_id: String,
    },
    Delete {
        agent_id: String,
    },
    Archive {
        agent_id: String,
        name: Option<String>,
    },
    Restore {
        template_id: String,
        agent_id: Option<String>,
    },
}

impl WorkflowRequest {
    #[must_use]
    pub fn kind(&self) -> WorkflowKind {
        match self {
            Self::Create(_) => WorkflowKind::Create,
            Self::Start { .. } => WorkflowKind::Start,
            Self::Stop { .. } => WorkflowKind::Stop,
            Self::Delete { .. } => WorkflowKind::Delete,
            Self::Archive { .. } => WorkflowKind::Archive,
            Self::Restore { .. } => WorkflowKind::Restore,
        }
    }

    fn target_agent_id(&self) -> Option<&str> {
        match self {
            Self::Create(_) => None,
            Self::Start { agent_id }
            | Self::Stop { agent_id }
            | Self::Delete { agent_id }
            | Self::Archive { agent_id, .. } => Some(agent_id),
            Self::Restore { agent_id, .. } => agent_id.as_deref(),
        }
    }
}

/// Handle to an accepted workflow execution.
///
/// `events` is this execution's ordered progress sequence; dropping it does
/// not cancel anything. `done` resolves with the terminal result.
#[derive(Debug)]
pub struct WorkflowHandle {
    pub agent_id: String,
    pub workflow: WorkflowKind,
    pub events: mpsc::Receiver<ProgressEvent>,
    pub done: JoinHandle<Result<AgentSnapshot, OrchestratorError>>,
}

/// Validated, locked work ready to execute.
pub(super) struct Prepared {
    guard: AgentGuard,
    job: Job,
}

pub(super) enum Job {
    Provision {
        agent: AgentRecord,
        template: Option<TemplateRecord>,
        grants: Vec<CredentialRecord>,
        /// Set for restore-over-existing: tear the old sandbox down first.
        teardown_first: bool,
    },
    Start {
        agent: AgentRecord,
    },
    Stop {
        agent: AgentRecord,
    },
    Delete {
        agent: AgentRecord,
    },
    Archive {
        agent: AgentRecord,
        name: Option<String>,
    },
}

impl Job {
    fn agent_id(&self) -> &str {
        match self {
            Self::Provision { agent, .. }
            | Self::Start { agent }
            | Self::Stop { agent }
            | Self::Delete { agent }
            | Self::Archive { agent, .. } => &agent.id,
        }
    }
}

/// The orchestration engine. Holds only port trait objects — vendor
/// backends are swappable without touching anything here.
pub struct Orchestrator {
    pub(super) compute: Arc<dyn ComputeBackend>,
    pub(super) objects: Arc<dyn ObjectStoreBackend>,
    pub(super) scoping: CredentialScopingService,
    pub(super) agents: Arc<dyn AgentStore>,
    pub(super) templates: Arc<dyn TemplateStore>,
    pub(super) credentials: Arc<dyn CredentialStore>,
    pub(super) audit: Arc<dyn AuditLedger>,
    locks: LockTable,
    pub(super) settings: OrchestratorSettings,
}

impl Orchestrator {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        compute: Arc<dyn ComputeBackend>,
        objects: Arc<dyn ObjectStoreBackend>,
        scoping: CredentialScopingService,
        agents: Arc<dyn AgentStore>,
        templates: Arc<dyn TemplateStore>,
        credentials: Arc<dyn CredentialStore>,
        audit: Arc<dyn AuditLedger>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            compute,
            objects,
            scoping,
            agents,
            templates,
            credentials,
            audit,
            locks: LockTable::new(),
            settings,
        }
    }

    /// Validate, lock, and launch a workflow.
    ///
    /// On acceptance the workflow runs in a detached task and the returned
    /// handle exposes its progress stream and terminal result. On rejection
    /// (bad input, unknown target, lock contention) nothing has run, no
    /// resource was touched, and the rejection itself is audited.
    ///
    /// # Errors
    ///
    /// `Validation`/`NotFound` for bad input, `Conflict` when another
    /// workflow holds the agent's lock, `Store` when the state store fails.
    pub async fn submit(
        self: &Arc<Self>,
        caller: Caller,
        request: WorkflowRequest,
    ) -> Result<WorkflowHandle, OrchestratorError> {
        let kind = request.kind();
        let target = request.target_agent_id().map(str::to_owned);
        match self.prepare(&caller, request).await {
            Ok(prepared) => Ok(self.launch(caller, kind, prepared)),
            Err(err) => {
                let outcome = AuditOutcome::Failure {
                    kind: err.kind(),
                    message: err.to_string(),
                };
                self.append_audit(&caller, kind, target.as_deref(), &outcome, serde_json::Map::new())
                    .await;
                Err(err)
            }
        }
    }

    /// Resolve the target, check preconditions, and take the agent's lock.
    async fn prepare(
        &self,
        caller: &Caller,
        request: WorkflowRequest,
    ) -> Result<Prepared, OrchestratorError> {
        match request {
            WorkflowRequest::Create(params) => self.prepare_create(caller, params).await,
            WorkflowRequest::Start { agent_id } => {
                let (guard, agent) = self.lock_and_load(caller, &agent_id).await?;
                agent.require_status(AgentStatus::Stopped, "started")?;
                Ok(Prepared {
                    guard,
                    job: Job::Start { agent },
                })
            }
            WorkflowRequest::Stop { agent_id } => {
                let (guard, agent) = self.lock_and_load(caller, &agent_id).await?;
                agent.require_status(AgentStatus::Running, "stopped")?;
                Ok(Prepared {
                    guard,
                    job: Job::Stop { agent },
                })
            }
            WorkflowRequest::Delete { agent_id } => {
                let (guard, agent) = self.lock_and_load(caller, &agent_id).await?;
                if agent.status == AgentStatus::Deleted {
                    return Err(OrchestratorError::Validation(
                        "agent is already deleted".into(),
                    ));
                }
                Ok(Prepared {
                    guard,
                    job: Job::Delete { agent },
                })
            }
            WorkflowRequest::Archive { agent_id, name } => {
                let (guard, agent) = self.lock_and_load(caller, &agent_id).await?;
                agent.require_status(AgentStatus::Running, "archived")?;
                if let Some(n) = &name {
                    validate_agent_name(n)?;
                }
                Ok(Prepared {
                    guard,
                    job: Job::Archive { agent, name },
                })
            }
            WorkflowRequest::Restore {
                template_id,
                agent_id,
            } => self.prepare_restore(caller, &template_id, agent_id).await,
        }
    }

    async fn prepare_create(
        &self,
        caller: &Caller,
        params: CreateAgent,
    ) -> Result<Prepared, OrchestratorError> {
        validate_agent_name(&params.name)?;

        let template = match &params.template_id {
            Some(id) => Some(self.load_template(caller, id).await?),
            None => None,
        };
        let grants = self.load_credentials(caller, &params.credential_ids).await?;

        let agent = self.new_agent_record(caller, &params, template.as_ref());
        let guard = self
            .locks
            .try_acquire(&agent.id)
            .ok_or(OrchestratorError::Conflict)?;

        self.agents
            .insert_agent(&agent)
            .await
            .map_err(|e| OrchestratorError::store(&e))?;
        for credential in &grants {
            self.credentials
                .grant(&agent.id, &credential.id)
                .await
                .map_err(|e| OrchestratorError::store(&e))?;
        }

        Ok(Prepared {
            guard,
            job: Job::Provision {
                agent,
                template,
                grants,
                teardown_first: false,
            },
        })
    }

    async fn prepare_restore(
        &self,
        caller: &Caller,
        template_id: &str,
        agent_id: Option<String>,
    ) -> Result<Prepared, OrchestratorError> {
        let template = self.load_template(caller, template_id).await?;

        if let Some(agent_id) = agent_id {
            // Reuse the existing agent's identity: tear down, then rebuild.
            let (guard, mut agent) = self.lock_and_load(caller, &agent_id).await?;
            if agent.status == AgentStatus::Deleted {
                return Err(OrchestratorError::Validation(
                    "agent is already deleted".into(),
                ));
            }
            agent.platform = template.platform;
            agent.template_id = Some(template.id.clone());
            if let Some(size) = &template.snapshot.size {
                agent.size = size.clone();
            }
            Ok(Prepared {
                guard,
                job: Job::Provision {
                    agent,
                    template: Some(template),
                    grants: Vec::new(),
                    teardown_first: true,
                },
            })
        } else {
            let params = CreateAgent {
                name: template.name.clone(),
                platform: template.platform,
                size: template.snapshot.size.clone(),
                template_id: Some(template.id.clone()),
                credential_ids: Vec::new(),
            };
            let agent = self.new_agent_record(caller, &params, Some(&template));
            let guard = self
                .locks
                .try_acquire(&agent.id)
                .ok_or(OrchestratorError::Conflict)?;
            self.agents
                .insert_agent(&agent)
                .await
                .map_err(|e| OrchestratorError::store(&e))?;
            Ok(Prepared {
                guard,
                job: Job::Provision {
                    agent,
                    template: Some(template),
                    grants: Vec::new(),
                    teardown_first: false,
                },
            })
        }
    }

    fn new_agent_record(
        &self,
        caller: &Caller,
        params: &CreateAgent,
        template: Option<&TemplateRecord>,
    ) -> AgentRecord {
        let now = Utc::now();
        AgentRecord {
            id: Uuid::new_v4().to_string(),
            owner_id: caller.owner_id.clone(),
            name: params.name.clone(),
            size: params
                .size
                .clone()
                .unwrap_or_else(|| self.settings.default_size.clone()),
            status: AgentStatus::Creating,
            instance_id: None,
            internal_addr: None,
            bucket_id: None,
            scoped_secret_ref: None,
            current_task: None,
            platform: params.platform,
            platform_version: template.and_then(|t| t.snapshot.platform_version.clone()),
            template_id: params.template_id.clone(),
            service_port: self.settings.service_port,
            created_at: now,
            updated_at: now,
        }
    }

    /// Take the agent's lock, then load the row. Lock first so a concurrent
    /// workflow cannot change the status between load and execution.
    async fn lock_and_load(
        &self,
        caller: &Caller,
        agent_id: &str,
    ) -> Result<(AgentGuard, AgentRecord), OrchestratorError> {
        let guard = self
            .locks
            .try_acquire(agent_id)
            .ok_or(OrchestratorError::Conflict)?;
        let agent = self
            .agents
            .get_agent(&caller.owner_id, agent_id)
            .await
            .map_err(|e| OrchestratorError::store(&e))?
            .ok_or(OrchestratorError::NotFound("agent"))?;
        Ok((guard, agent))
    }

    async fn load_template(
        &self,
        caller: &Caller,
        template_id: &str,
    ) -> Result<TemplateRecord, OrchestratorError> {
        self.templates
            .get_template(&caller.owner_id, template_id)
            .await
            .map_err(|e| OrchestratorError::store(&e))?
            .ok_or(OrchestratorError::NotFound("template"))
    }

    async fn load_credentials(
        &self,
        caller: &Caller,
        credential_ids: &[String],
    ) -> Result<Vec<CredentialRecord>, OrchestratorError> {
        let mut grants = Vec::with_capacity(credential_ids.len());
        for id in credential_ids {
            let credential = self
                .credentials
                .get_credential(&caller.owner_id, id)
                .await
                .map_err(|e| OrchestratorError::store(&e))?
                .ok_or_else(|| {
                    OrchestratorError::Validation(format!("credential '{id}' not found"))
                })?;
            grants.push(credential);
        }
        Ok(grants)
    }

    fn launch(self: &Arc<Self>, caller: Caller, kind: WorkflowKind, prepared: Prepared) -> WorkflowHandle {
        let (emitter, events) = ProgressEmitter::channel(self.settings.event_buffer);
        let agent_id = prepared.job.agent_id().to_owned();
        let this = Arc::clone(self);
        let done = tokio::spawn(async move { this.execute(caller, kind, prepared, emitter).await });
        WorkflowHandle {
            agent_id,
            workflow: kind,
            events,
            done,
        }
    }

    /// Run a prepared workflow to its terminal state.
    ///
    /// Exactly one terminal progress event is emitted and exactly one audit
    /// entry appended, whatever happens inside. A transient lifecycle status
    /// is always resolved (to `error` on failure) before the lock drops.
    async fn execute(
        self: Arc<Self>,
        caller: Caller,
        kind: WorkflowKind,
        prepared: Prepared,
        emitter: ProgressEmitter,
    ) -> Result<AgentSnapshot, OrchestratorError> {
        let Prepared { guard, job } = prepared;
        let agent_id = job.agent_id().to_owned();
        let mut detail = serde_json::Map::new();

        tracing::info!(workflow = %kind, agent_id = %agent_id, "workflow started");
        let result = self.run_job(&caller, job, &emitter, &mut detail).await;

        if result.is_err() {
            self.settle_transient_status(&caller, &agent_id).await;
        }
        match &result {
            Ok(snapshot) => {
                tracing::info!(workflow = %kind, agent_id = %agent_id, "workflow completed");
                emitter.complete(snapshot.clone());
            }
            Err(err) => {
                tracing::warn!(workflow = %kind, agent_id = %agent_id, error = %err, "workflow failed");
                emitter.error(err.kind(), err.to_string());
            }
        }

        let outcome = match &result {
            Ok(_) => AuditOutcome::Success,
            Err(err) => AuditOutcome::Failure {
                kind: err.kind(),
                message: err.to_string(),
            },
        };
        self.append_audit(&caller, kind, Some(&agent_id), &outcome, detail)
            .await;

        drop(guard);
        result
    }

    async fn run_job(
        &self,
        caller: &Caller,
        job: Job,
        emitter: &ProgressEmitter,
        detail: &mut serde_json::Map<String, serde_json::Value>,
    ) -> Result<AgentSnapshot, OrchestratorError> {
        match job {
            Job::Provision {
                mut agent,
                template,
                grants,
                teardown_first,
            } => {
                if teardown_first {
                    self.run_delete(&mut agent, emitter, detail).await?;
                    agent.status = AgentStatus::Creating;
                    self.save(&mut agent).await?;
                }
                self.run_provision(caller, &mut agent, template.as_ref(), &grants, emitter, detail)
                    .await?;
                Ok(agent.snapshot())
            }
            Job::Start { mut agent } => {
                self.run_start(&mut agent, emitter).await?;
                Ok(agent.snapshot())
            }
            Job::Stop { mut agent } => {
                self.run_stop(&mut agent, emitter).await?;
                Ok(agent.snapshot())
            }
            Job::Delete { mut agent } => {
                self.run_delete(&mut agent, emitter, detail).await?;
                Ok(agent.snapshot())
            }
            Job::Archive { agent, name } => {
                let template = self.run_archive(&agent, name, emitter).await?;
                detail.insert("template_id".into(), template.id.clone().into());
                detail.insert("template_name".into(), template.name.clone().into());
                Ok(agent.snapshot())
            }
        }
    }

    /// Safety net: never leave a transient status behind after a failure.
    async fn settle_transient_status(&self, caller: &Caller, agent_id: &str) {
        match self.agents.get_agent(&caller.owner_id, agent_id).await {
            Ok(Some(mut agent)) if agent.status.is_transient() => {
                agent.status = AgentStatus::Error;
                agent.updated_at = Utc::now();
                if let Err(err) = self.agents.update_agent(&agent).await {
                    tracing::error!(
                        agent_id,
                        error = %format!("{err:#}"),
                        "failed to settle transient status to error"
                    );
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(
                    agent_id,
                    error = %format!("{err:#}"),
                    "failed to load agent while settling status"
                );
            }
        }
    }

    /// Persist the record with a fresh `updated_at`.
    pub(super) async fn save(&self, agent: &mut AgentRecord) -> Result<(), OrchestratorError> {
        agent.updated_at = Utc::now();
        self.agents
            .update_agent(agent)
            .await
            .map_err(|e| OrchestratorError::store(&e))
    }

    /// Run one step: open a span, race the future against `deadline`, close
    /// the span, and normalize the outcome.
    pub(super) async fn step<T, F>(
        &self,
        emitter: &ProgressEmitter,
        name: &str,
        deadline: Duration,
        fut: F,
    ) -> Result<T, OrchestratorError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let span = emitter.span_start(name);
        let outcome = tokio::time::timeout(deadline, fut).await;
        emitter.span_end(span);
        match outcome {
            Err(_) => Err(OrchestratorError::Timeout {
                step: name.to_owned(),
                seconds: deadline.as_secs(),
            }),
            Ok(Err(err)) => Err(OrchestratorError::Backend {
                step: name.to_owned(),
                message: format!("{err:#}"),
            }),
            Ok(Ok(value)) => Ok(value),
        }
    }

    async fn append_audit(
        &self,
        caller: &Caller,
        kind: WorkflowKind,
        target_id: Option<&str>,
        outcome: &AuditOutcome,
        detail: serde_json::Map<String, serde_json::Value>,
    ) {
        let entry = AuditEntry::for_action(
            Uuid::new_v4().to_string(),
            &caller.owner_id,
            kind.action(),
            "agent",
            target_id,
            outcome,
            detail,
            caller.origin_addr.clone(),
        );
        if let Err(err) = self.audit.append(&entry).await {
            tracing::error!(
                action = kind.action(),
                error = %format!("{err:#}"),
                "failed to append audit entry"
            );
        }
    }
}
