//! Workflow step sequences.
//!
//! Steps inside one workflow run strictly sequentially; every backend call
//! sits behind [`Orchestrator::step`] and therefore carries its own deadline
//! and progress span. Teardown-ish steps tolerate "already deleted" so that
//! failed workflows can be retried by a fresh invocation.

use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use roost_common::AgentStatus;
use secrecy::ExposeSecret;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::{Caller, Orchestrator};
use crate::application::ports::{InstanceSpec, InstanceState};
use crate::application::services::progress::ProgressEmitter;
use crate::domain::{
    AgentRecord, ConfigSnapshot, CredentialRecord, OrchestratorError, TemplateRecord, platform,
};

/// Interval between polls while waiting on the bootstrap sentinel or the
/// service health endpoint.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

impl Orchestrator {
    // ── create / restore ─────────────────────────────────────────────────────

    /// Provision a sandbox for `agent` from scratch: instance, bucket,
    /// scoped credentials, platform bootstrap, optional template config,
    /// secret injection, service start. On any failure the already-created
    /// resources are compensated (best-effort, reported) and the agent lands
    /// in `error`.
    pub(super) async fn run_provision(
        &self,
        caller: &Caller,
        agent: &mut AgentRecord,
        template: Option<&TemplateRecord>,
        grants: &[CredentialRecord],
        emitter: &ProgressEmitter,
        detail: &mut Map<String, Value>,
    ) -> Result<(), OrchestratorError> {
        detail.insert("name".into(), agent.name.clone().into());
        detail.insert("platform".into(), agent.platform.as_str().into());
        detail.insert("size".into(), agent.size.clone().into());
        if let Some(t) = template {
            detail.insert("template_id".into(), t.id.clone().into());
        }

        if let Err(err) = self
            .provision_steps(caller, agent, template, grants, emitter)
            .await
        {
            self.compensate_provision(agent, emitter, detail).await;
            agent.status = AgentStatus::Error;
            if let Err(save_err) = self.save(agent).await {
                tracing::error!(
                    agent_id = %agent.id,
                    error = %save_err,
                    "failed to persist error status after compensation"
                );
            }
            return Err(err);
        }

        agent.status = AgentStatus::Running;
        self.save(agent).await?;
        Ok(())
    }

    async fn provision_steps(
        &self,
        caller: &Caller,
        agent: &mut AgentRecord,
        template: Option<&TemplateRecord>,
        grants: &[CredentialRecord],
        emitter: &ProgressEmitter,
    ) -> Result<(), OrchestratorError> {
        let step_timeout = self.settings.step_timeout;

        // Provision the compute instance, with the platform bootstrap script
        // as first-boot user data.
        let spec = InstanceSpec {
            name: instance_name(&agent.id),
            size: agent.size.clone(),
            image: "default".to_owned(),
            owner_id: caller.owner_id.clone(),
            agent_id: agent.id.clone(),
            user_data: Some(platform::setup_script(agent.platform).to_owned()),
            labels: std::collections::HashMap::new(),
        };
        let instance = self
            .step(emitter, "provision instance", step_timeout, async {
                self.compute.create_instance(&spec).await
            })
            .await?;
        agent.instance_id = Some(instance.instance_id.clone());
        agent.internal_addr = instance.internal_addr.clone();
        self.save(agent).await?;
        let instance_id = instance.instance_id;

        // Provision the data-exchange bucket.
        let bucket_name = format!("agent-{}", short_id(&agent.id));
        let owner_id = caller.owner_id.clone();
        let bucket_id = self
            .step(emitter, "provision bucket", step_timeout, async {
                self.objects.create_bucket(&owner_id, &bucket_name).await
            })
            .await?;
        agent.bucket_id = Some(bucket_id.clone());
        self.save(agent).await?;

        // Mint bucket-scoped credentials, keep a copy in the secret backend
        // for teardown bookkeeping, and place them on the instance.
        let scoped_secret_name = format!("agent-{}-bucket", short_id(&agent.id));
        let scoped_ref = self
            .step(emitter, "issue bucket credentials", step_timeout, async {
                let scoped = self.scoping.mint_bucket_credentials(&bucket_id).await?;
                let secret_ref = self
                    .scoping
                    .store(
                        &caller.owner_id,
                        &scoped_secret_name,
                        secrecy::SecretString::from(scoped.credentials_json.clone()),
                    )
                    .await
                    .context("storing scoped credential copy")?;
                self.compute
                    .upload_file(
                        &instance_id,
                        platform::BUCKET_CREDENTIALS_PATH,
                        scoped.credentials_json.as_bytes(),
                    )
                    .await
                    .context("writing bucket credentials to instance")?;
                Ok(secret_ref)
            })
            .await?;
        agent.scoped_secret_ref = Some(scoped_ref);
        self.save(agent).await?;

        // Wait for the first-boot bootstrap to finish.
        let probe = platform::setup_probe_command();
        self.step(
            emitter,
            "bootstrap platform",
            self.settings.probe_timeout,
            async {
                loop {
                    let out = self.compute.run_command(&instance_id, &probe).await?;
                    if out.success() {
                        return Ok(());
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            },
        )
        .await?;

        let configure = emitter.span_start("configure agent");
        let configure_result = self
            .configure_steps(agent, template, grants, &instance_id, emitter)
            .await;
        emitter.span_end(configure);
        configure_result?;

        // Start the service process and pick up the instance address.
        let start_cmd = platform::start_command(agent.platform, agent.service_port);
        let status = self
            .step(emitter, "start service", step_timeout, async {
                let out = self.compute.run_command(&instance_id, &start_cmd).await?;
                anyhow::ensure!(
                    out.success(),
                    "service start exited with {}: {}",
                    out.exit_code,
                    out.stderr
                );
                self.compute.get_status(&instance_id).await
            })
            .await?;
        if status.internal_addr.is_some() {
            agent.internal_addr = status.internal_addr;
        }
        Ok(())
    }

    /// Nested configuration spans: template config, then secret injection.
    async fn configure_steps(
        &self,
        agent: &mut AgentRecord,
        template: Option<&TemplateRecord>,
        grants: &[CredentialRecord],
        instance_id: &str,
        emitter: &ProgressEmitter,
    ) -> Result<(), OrchestratorError> {
        let step_timeout = self.settings.step_timeout;

        if let Some(template) = template {
            if let Some(config) = &template.snapshot.config {
                let path = platform::config_path(agent.platform);
                self.step(emitter, "apply template", step_timeout, async {
                    self.compute
                        .upload_file(instance_id, path, config.as_bytes())
                        .await
                })
                .await?;
                emitter.log(format!("applied template '{}'", template.name));
            }
            if agent.platform_version.is_none() {
                agent.platform_version = template.snapshot.platform_version.clone();
            }
        }

        if !grants.is_empty() {
            self.step(emitter, "inject credentials", step_timeout, async {
                for credential in grants {
                    let path =
                        format!("{}/{}", platform::SECRETS_DIR, secret_file_name(&credential.name));
                    let secret = self
                        .scoping
                        .reveal(&credential.secret_ref)
                        .await
                        .with_context(|| {
                            format!("retrieving secret for credential '{}'", credential.name)
                        })?;
                    self.compute
                        .upload_file(instance_id, &path, secret.expose_secret().as_bytes())
                        .await
                        .with_context(|| {
                            format!("injecting credential '{}'", credential.name)
                        })?;
                    // One-time injection: the plaintext dies here.
                    drop(secret);
                    emitter.log(format!("injected credential '{}'", credential.name));
                }
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    /// Best-effort teardown of whatever provisioning already created.
    /// Failures are reported in the audit detail, never swallowed.
    async fn compensate_provision(
        &self,
        agent: &mut AgentRecord,
        emitter: &ProgressEmitter,
        detail: &mut Map<String, Value>,
    ) {
        let span = emitter.span_start("compensate");
        let mut results = Map::new();

        if let Some(instance_id) = agent.instance_id.clone() {
            match tokio::time::timeout(
                self.settings.step_timeout,
                self.compute.delete_instance(&instance_id),
            )
            .await
            {
                Ok(Ok(())) => {
                    agent.instance_id = None;
                    results.insert("instance".into(), json!("deleted"));
                }
                outcome => {
                    let message = flatten_teardown_error(&outcome);
                    emitter.log(format!("instance teardown failed: {message}"));
                    results.insert("instance".into(), json!(format!("delete failed: {message}")));
                }
            }
        }
        if let Some(bucket_id) = agent.bucket_id.clone() {
            match tokio::time::timeout(
                self.settings.step_timeout,
                self.objects.delete_bucket(&bucket_id),
            )
            .await
            {
                Ok(Ok(())) => {
                    agent.bucket_id = None;
                    results.insert("bucket".into(), json!("deleted"));
                }
                outcome => {
                    let message = flatten_teardown_error(&outcome);
                    emitter.log(format!("bucket teardown failed: {message}"));
                    results.insert("bucket".into(), json!(format!("delete failed: {message}")));
                }
            }
        }
        if let Some(secret_ref) = agent.scoped_secret_ref.clone() {
            match tokio::time::timeout(
                self.settings.step_timeout,
                self.scoping.discard(&secret_ref),
            )
            .await
            {
                Ok(Ok(())) => {
                    agent.scoped_secret_ref = None;
                    results.insert("scoped_secret".into(), json!("deleted"));
                }
                outcome => {
                    let message = flatten_teardown_error(&outcome);
                    emitter.log(format!("scoped secret teardown failed: {message}"));
                    results.insert(
                        "scoped_secret".into(),
                        json!(format!("delete failed: {message}")),
                    );
                }
            }
        }

        emitter.span_end(span);
        detail.insert("compensation".into(), Value::Object(results));
    }

    // ── start / stop ─────────────────────────────────────────────────────────

    /// Start a stopped agent: backend start, then health probe. A probe
    /// timeout leaves the agent in `error` — never back in `stopped`,
    /// because the true instance state is unknown at that point.
    pub(super) async fn run_start(
        &self,
        agent: &mut AgentRecord,
        emitter: &ProgressEmitter,
    ) -> Result<(), OrchestratorError> {
        let instance_id = agent
            .instance_id
            .clone()
            .ok_or_else(|| OrchestratorError::Validation("agent has no compute instance".into()))?;

        agent.status = AgentStatus::Starting;
        self.save(agent).await?;

        self.step(emitter, "start instance", self.settings.step_timeout, async {
            self.compute.start_instance(&instance_id).await
        })
        .await?;

        let health_cmd = platform::health_command(agent.service_port);
        let status = self
            .step(emitter, "health probe", self.settings.probe_timeout, async {
                loop {
                    let instance = self.compute.get_status(&instance_id).await?;
                    if instance.state == InstanceState::Running {
                        let out = self.compute.run_command(&instance_id, &health_cmd).await?;
                        if out.success() {
                            return Ok(instance);
                        }
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            })
            .await?;

        if status.internal_addr.is_some() {
            agent.internal_addr = status.internal_addr;
        }
        agent.status = AgentStatus::Running;
        self.save(agent).await?;
        Ok(())
    }

    /// Stop a running agent: ask the in-VM service to shut down (advisory),
    /// then stop the instance.
    pub(super) async fn run_stop(
        &self,
        agent: &mut AgentRecord,
        emitter: &ProgressEmitter,
    ) -> Result<(), OrchestratorError> {
        let instance_id = agent
            .instance_id
            .clone()
            .ok_or_else(|| OrchestratorError::Validation("agent has no compute instance".into()))?;

        agent.status = AgentStatus::Stopping;
        self.save(agent).await?;

        // Advisory shutdown signal: a dead service must not block the stop.
        let span = emitter.span_start("signal service shutdown");
        let signal = tokio::time::timeout(
            self.settings.step_timeout,
            self.compute
                .run_command(&instance_id, platform::stop_command(agent.platform)),
        )
        .await;
        emitter.span_end(span);
        match signal {
            Ok(Ok(out)) if out.success() => {}
            Ok(Ok(out)) => emitter.log(format!(
                "service shutdown signal exited with {}, stopping instance anyway",
                out.exit_code
            )),
            Ok(Err(err)) => emitter.log(format!(
                "service shutdown signal failed ({err:#}), stopping instance anyway"
            )),
            Err(_) => emitter.log(
                "service shutdown signal timed out, stopping instance anyway".to_owned(),
            ),
        }

        self.step(emitter, "stop instance", self.settings.step_timeout, async {
            self.compute.stop_instance(&instance_id).await
        })
        .await?;

        agent.status = AgentStatus::Stopped;
        self.save(agent).await?;
        Ok(())
    }

    // ── delete ───────────────────────────────────────────────────────────────

    /// Tear down all three resources. Every teardown is attempted even when
    /// an earlier one fails; each backend treats "already deleted" as
    /// success, and successfully removed resources are unlinked from the
    /// record so a retry only re-attempts what actually failed.
    pub(super) async fn run_delete(
        &self,
        agent: &mut AgentRecord,
        emitter: &ProgressEmitter,
        detail: &mut Map<String, Value>,
    ) -> Result<(), OrchestratorError> {
        agent.status = AgentStatus::Deleting;
        self.save(agent).await?;

        let mut results = Map::new();
        let mut failed: Vec<&'static str> = Vec::new();

        if let Some(bucket_id) = agent.bucket_id.clone() {
            let outcome = self
                .step(emitter, "delete bucket", self.settings.step_timeout, async {
                    self.objects.delete_bucket(&bucket_id).await
                })
                .await;
            match outcome {
                Ok(()) => {
                    agent.bucket_id = None;
                    results.insert("bucket".into(), json!("deleted"));
                }
                Err(err) => {
                    failed.push("bucket");
                    results.insert("bucket".into(), json!(format!("delete failed: {err}")));
                }
            }
        } else {
            results.insert("bucket".into(), json!("skipped (already removed)"));
        }

        if let Some(secret_ref) = agent.scoped_secret_ref.clone() {
            let outcome = self
                .step(
                    emitter,
                    "delete scoped secrets",
                    self.settings.step_timeout,
                    async { self.scoping.discard(&secret_ref).await },
                )
                .await;
            match outcome {
                Ok(()) => {
                    agent.scoped_secret_ref = None;
                    results.insert("scoped_secret".into(), json!("deleted"));
                }
                Err(err) => {
                    failed.push("scoped_secret");
                    results.insert(
                        "scoped_secret".into(),
                        json!(format!("delete failed: {err}")),
                    );
                }
            }
        } else {
            results.insert("scoped_secret".into(), json!("skipped (already removed)"));
        }

        if let Some(instance_id) = agent.instance_id.clone() {
            let outcome = self
                .step(
                    emitter,
                    "delete instance",
                    self.settings.step_timeout,
                    async { self.compute.delete_instance(&instance_id).await },
                )
                .await;
            match outcome {
                Ok(()) => {
                    agent.instance_id = None;
                    results.insert("instance".into(), json!("deleted"));
                }
                Err(err) => {
                    failed.push("instance");
                    results.insert("instance".into(), json!(format!("delete failed: {err}")));
                }
            }
        } else {
            results.insert("instance".into(), json!("skipped (already removed)"));
        }

        detail.insert("teardown".into(), Value::Object(results));

        if failed.is_empty() {
            self.credentials
                .clear_grants_for_agent(&agent.id)
                .await
                .map_err(|e| OrchestratorError::store(&e))?;
            agent.status = AgentStatus::Deleted;
            self.save(agent).await?;
            Ok(())
        } else {
            agent.status = AgentStatus::Error;
            self.save(agent).await?;
            Err(OrchestratorError::Partial {
                detail: failed.join(", "),
            })
        }
    }

    // ── archive ──────────────────────────────────────────────────────────────

    /// Capture the agent's current platform config into a new template.
    /// The agent's lifecycle status is untouched.
    pub(super) async fn run_archive(
        &self,
        agent: &AgentRecord,
        name: Option<String>,
        emitter: &ProgressEmitter,
    ) -> Result<TemplateRecord, OrchestratorError> {
        let instance_id = agent
            .instance_id
            .clone()
            .ok_or_else(|| OrchestratorError::Validation("agent has no compute instance".into()))?;
        let config_path = platform::config_path(agent.platform);

        let config = self
            .step(
                emitter,
                "read instance config",
                self.settings.step_timeout,
                async {
                    let bytes = self.compute.download_file(&instance_id, config_path).await?;
                    Ok(String::from_utf8_lossy(&bytes).into_owned())
                },
            )
            .await?;

        let template = TemplateRecord {
            id: Uuid::new_v4().to_string(),
            owner_id: agent.owner_id.clone(),
            name: name.unwrap_or_else(|| {
                format!("{} - {}", agent.name, Utc::now().format("%Y-%m-%d %H:%M"))
            }),
            platform: agent.platform,
            setup_script_ref: None,
            snapshot: ConfigSnapshot {
                size: Some(agent.size.clone()),
                platform_version: agent.platform_version.clone(),
                config: Some(config),
            },
            starred: false,
            source_agent_id: Some(agent.id.clone()),
            description: None,
            created_at: Utc::now(),
        };

        let span = emitter.span_start("create template");
        let insert = self.templates.insert_template(&template).await;
        emitter.span_end(span);
        insert.map_err(|e| OrchestratorError::store(&e))?;

        emitter.log(format!("template '{}' created", template.name));
        Ok(template)
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn instance_name(agent_id: &str) -> String {
    format!("roost-agent-{}", short_id(agent_id))
}

fn short_id(agent_id: &str) -> &str {
    agent_id.get(..8).unwrap_or(agent_id)
}

/// Filesystem-safe name for an injected credential file.
fn secret_file_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// One-line message for a `timeout(..)`-wrapped teardown result.
fn flatten_teardown_error(outcome: &Result<anyhow::Result<()>, tokio::time::error::Elapsed>) -> String {
    match outcome {
        Ok(Ok(())) => "ok".to_owned(),
        Ok(Err(err)) => format!("{err:#}"),
        Err(_) => "deadline exceeded".to_owned(),
    }
}
