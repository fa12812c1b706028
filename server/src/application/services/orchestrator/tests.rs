//! Orchestrator workflow tests: fake capability backends over an in-memory
//! state store, exercising the full submit → execute → audit path.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use roost_common::{AgentSnapshot, AgentStatus, ErrorKind, PlatformKind, ProgressEvent};
use secrecy::SecretString;
use tokio::sync::Semaphore;

use super::*;
use crate::application::ports::{
    AgentStore, AuditLedger, CommandOutput, ComputeBackend, CredentialStore, Instance,
    InstanceSpec, InstanceState, ObjectMeta, ObjectStoreBackend, ScopedCredentials, SecretBackend,
    SecretMetadata, TemplateStore,
};
use crate::application::services::scoping::CredentialScopingService;
use crate::domain::{CredentialKind, OrchestratorError};
use crate::domain::platform::BUCKET_CREDENTIALS_PATH;
use crate::infra::store::SqliteStore;

// ── Fake backends ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeCompute {
    instances: Mutex<HashMap<String, InstanceState>>,
    calls: AtomicUsize,
    fail_create: AtomicBool,
    fail_delete: AtomicBool,
    unhealthy: AtomicBool,
    hold_create: Mutex<Option<Arc<Semaphore>>>,
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeCompute {
    fn upload_paths(&self) -> Vec<String> {
        self.uploads.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }
}

#[async_trait]
impl ComputeBackend for FakeCompute {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.hold_create.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("QUOTA_EXCEEDED: CPUS quota exceeded in zone us-central1-a");
        }
        let instance_id = format!("i-{}", spec.agent_id.get(..8).unwrap_or(&spec.agent_id));
        self.instances
            .lock()
            .unwrap()
            .insert(instance_id.clone(), InstanceState::Running);
        Ok(Instance {
            instance_id,
            state: InstanceState::Running,
            internal_addr: Some("10.0.0.9".into()),
            external_addr: None,
        })
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            anyhow::bail!("instance delete failed: vendor returned 502");
        }
        // Absent instances count as already deleted.
        self.instances.lock().unwrap().remove(instance_id);
        self.deleted.lock().unwrap().push(instance_id.to_owned());
        Ok(())
    }

    async fn start_instance(&self, instance_id: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut instances = self.instances.lock().unwrap();
        match instances.get_mut(instance_id) {
            Some(state) => {
                *state = InstanceState::Running;
                Ok(())
            }
            None => anyhow::bail!("instance {instance_id} not found"),
        }
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut instances = self.instances.lock().unwrap();
        match instances.get_mut(instance_id) {
            Some(state) => {
                *state = InstanceState::Stopped;
                Ok(())
            }
            None => anyhow::bail!("instance {instance_id} not found"),
        }
    }

    async fn get_status(&self, instance_id: &str) -> Result<Instance> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self
            .instances
            .lock()
            .unwrap()
            .get(instance_id)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("instance {instance_id} not found"))?;
        Ok(Instance {
            instance_id: instance_id.to_owned(),
            state,
            internal_addr: Some("10.0.0.9".into()),
            external_addr: None,
        })
    }

    async fn run_command(&self, _instance_id: &str, command: &str) -> Result<CommandOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let exit_code = if command.contains("/health") && self.unhealthy.load(Ordering::SeqCst) {
            7
        } else {
            0
        };
        Ok(CommandOutput {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn upload_file(
        &self,
        _instance_id: &str,
        remote_path: &str,
        contents: &[u8],
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.uploads
            .lock()
            .unwrap()
            .push((remote_path.to_owned(), contents.to_vec()));
        Ok(())
    }

    async fn download_file(&self, _instance_id: &str, _remote_path: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(br#"{"model":"claude-sonnet"}"#.to_vec())
    }
}

#[derive(Default)]
struct FakeObjects {
    buckets: Mutex<Vec<String>>,
    fail_create: AtomicBool,
    fail_delete: AtomicBool,
    deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl ObjectStoreBackend for FakeObjects {
    async fn create_bucket(&self, _owner_id: &str, name: &str) -> Result<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("bucket quota exhausted for project");
        }
        let bucket_id = format!("b-{name}");
        self.buckets.lock().unwrap().push(bucket_id.clone());
        Ok(bucket_id)
    }

    async fn delete_bucket(&self, bucket_id: &str) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            anyhow::bail!("bucket delete failed: vendor returned 500");
        }
        self.buckets.lock().unwrap().retain(|b| b != bucket_id);
        self.deleted.lock().unwrap().push(bucket_id.to_owned());
        Ok(())
    }

    async fn list_objects(&self, _: &str, _: &str) -> Result<Vec<ObjectMeta>> {
        Ok(Vec::new())
    }

    async fn put_object(&self, _: &str, _: &str, _: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn get_object(&self, _: &str, _: &str) -> Result<Vec<u8>> {
        anyhow::bail!("not expected")
    }

    async fn issue_scoped_credentials(
        &self,
        bucket_id: &str,
        ttl: Duration,
    ) -> Result<ScopedCredentials> {
        Ok(ScopedCredentials {
            bucket_id: bucket_id.to_owned(),
            credentials_json: format!("{{\"bucket\":\"{bucket_id}\",\"token\":\"scoped-token\"}}"),
            expires_at: Utc::now() + chrono::Duration::from_std(ttl)?,
        })
    }
}

#[derive(Default)]
struct FakeSecrets {
    entries: Mutex<HashMap<String, String>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeSecrets {
    fn seed(&self, secret_ref: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(secret_ref.to_owned(), value.to_owned());
    }
}

#[async_trait]
impl SecretBackend for FakeSecrets {
    async fn store_secret(
        &self,
        owner_id: &str,
        name: &str,
        value: SecretString,
    ) -> Result<String> {
        use secrecy::ExposeSecret;
        let secret_ref = format!("secrets/{owner_id}/{name}");
        self.entries
            .lock()
            .unwrap()
            .insert(secret_ref.clone(), value.expose_secret().to_owned());
        Ok(secret_ref)
    }

    async fn get_secret(&self, secret_ref: &str) -> Result<SecretString> {
        self.entries
            .lock()
            .unwrap()
            .get(secret_ref)
            .map(|v| SecretString::from(v.clone()))
            .ok_or_else(|| anyhow::anyhow!("secret {secret_ref} not found"))
    }

    async fn delete_secret(&self, secret_ref: &str) -> Result<()> {
        // Absent secrets count as already deleted.
        self.entries.lock().unwrap().remove(secret_ref);
        self.deleted.lock().unwrap().push(secret_ref.to_owned());
        Ok(())
    }

    async fn list_secrets(&self, _: &str) -> Result<Vec<SecretMetadata>> {
        Ok(Vec::new())
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    orchestrator: Arc<Orchestrator>,
    compute: Arc<FakeCompute>,
    objects: Arc<FakeObjects>,
    secrets: Arc<FakeSecrets>,
    store: SqliteStore,
}

fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        step_timeout: Duration::from_secs(5),
        probe_timeout: Duration::from_secs(5),
        event_buffer: 64,
        default_size: "small".to_owned(),
        service_port: 18789,
    }
}

fn harness() -> Harness {
    harness_with(fast_settings())
}

fn harness_with(settings: OrchestratorSettings) -> Harness {
    let compute = Arc::new(FakeCompute::default());
    let objects = Arc::new(FakeObjects::default());
    let secrets = Arc::new(FakeSecrets::default());
    let store = SqliteStore::open_in_memory().expect("in-memory store");
    let scoping = CredentialScopingService::new(
        objects.clone(),
        secrets.clone(),
        Duration::from_secs(3600),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        compute.clone(),
        objects.clone(),
        scoping,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        settings,
    ));
    Harness {
        orchestrator,
        compute,
        objects,
        secrets,
        store,
    }
}

fn caller() -> Caller {
    Caller {
        owner_id: "u1".into(),
        origin_addr: Some("127.0.0.1".into()),
    }
}

fn create_request(name: &str) -> WorkflowRequest {
    WorkflowRequest::Create(CreateAgent {
        name: name.into(),
        platform: PlatformKind::Openhands,
        size: None,
        template_id: None,
        credential_ids: Vec::new(),
    })
}

/// Drain the progress stream and await the terminal result.
async fn run_to_end(
    handle: WorkflowHandle,
) -> (Vec<ProgressEvent>, Result<AgentSnapshot, OrchestratorError>) {
    let WorkflowHandle {
        mut events, done, ..
    } = handle;
    let mut collected = Vec::new();
    while let Some(event) = events.recv().await {
        collected.push(event);
    }
    let result = done.await.expect("workflow task panicked");
    (collected, result)
}

fn terminal_count(events: &[ProgressEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

async fn create_running_agent(h: &Harness) -> AgentSnapshot {
    let handle = h
        .orchestrator
        .submit(caller(), create_request("worker"))
        .await
        .expect("create accepted");
    let (_, result) = run_to_end(handle).await;
    result.expect("create succeeds")
}

// ── Scenario A: successful create ────────────────────────────────────────────

#[tokio::test]
async fn create_provisions_everything_and_lands_running() {
    let h = harness();
    let handle = h
        .orchestrator
        .submit(caller(), create_request("research assistant"))
        .await
        .expect("accepted");
    let agent_id = handle.agent_id.clone();
    let (events, result) = run_to_end(handle).await;

    let snapshot = result.expect("create succeeds");
    assert_eq!(snapshot.status, AgentStatus::Running);
    assert!(snapshot.instance_id.is_some());
    assert!(snapshot.bucket_id.is_some());
    assert_eq!(snapshot.internal_addr.as_deref(), Some("10.0.0.9"));

    // Exactly one terminal event, and it is `complete`.
    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(
        events.last().expect("events"),
        ProgressEvent::Complete { .. }
    ));
    assert!(matches!(
        &events[0],
        ProgressEvent::SpanStart { name, depth: 0 } if name == "provision instance"
    ));

    // Scoped bucket credentials were placed on the instance.
    assert!(h.compute.upload_paths().iter().any(|p| p == BUCKET_CREDENTIALS_PATH));

    // Exactly one audit entry, success outcome.
    let entries = h.store.list_entries("u1", 50).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, "agent.create");
    assert_eq!(entries[0].target_id.as_deref(), Some(agent_id.as_str()));
    assert_eq!(entries[0].detail["outcome"], "success");

    // The stored row matches the snapshot and keeps the scoped secret ref.
    let record = h.store.get_agent("u1", &agent_id).await.unwrap().expect("row");
    assert_eq!(record.status, AgentStatus::Running);
    assert!(record.scoped_secret_ref.is_some());
}

#[tokio::test]
async fn create_injects_credentials_without_leaking_plaintext() {
    let h = harness();
    h.store
        .insert_credential(&crate::domain::CredentialRecord {
            id: "c1".into(),
            owner_id: "u1".into(),
            name: "Anthropic API Key".into(),
            kind: CredentialKind::Llm,
            description: None,
            secret_ref: "secrets/u1/anthropic".into(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    h.secrets.seed("secrets/u1/anthropic", "sk-test-123");

    let handle = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Create(CreateAgent {
                name: "keyed agent".into(),
                platform: PlatformKind::Openhands,
                size: None,
                template_id: None,
                credential_ids: vec!["c1".into()],
            }),
        )
        .await
        .expect("accepted");
    let (events, result) = run_to_end(handle).await;
    result.expect("create succeeds");

    // The secret reached the instance...
    let uploads = h.compute.uploads.lock().unwrap().clone();
    let injected = uploads
        .iter()
        .find(|(path, _)| path == "/etc/roost/secrets/anthropic-api-key")
        .expect("credential file uploaded");
    assert_eq!(injected.1, b"sk-test-123");

    // ...but never the progress stream or the audit trail.
    for event in &events {
        let json = serde_json::to_string(event).unwrap();
        assert!(!json.contains("sk-test-123"), "plaintext in event: {json}");
    }
    for entry in h.store.list_entries("u1", 50).await.unwrap() {
        let json = serde_json::to_string(&entry.detail).unwrap();
        assert!(!json.contains("sk-test-123"), "plaintext in audit: {json}");
    }
}

// ── Scenario B: bucket failure triggers compensation ─────────────────────────

#[tokio::test]
async fn create_compensates_instance_when_bucket_provisioning_fails() {
    let h = harness();
    h.objects.fail_create.store(true, Ordering::SeqCst);

    let handle = h
        .orchestrator
        .submit(caller(), create_request("doomed"))
        .await
        .expect("accepted");
    let agent_id = handle.agent_id.clone();
    let (events, result) = run_to_end(handle).await;

    let err = result.expect_err("bucket failure must fail the workflow");
    assert_eq!(err.kind(), ErrorKind::BackendError);
    assert!(err.to_string().contains("bucket quota exhausted"));

    // The already-provisioned instance was torn back down.
    assert_eq!(h.compute.deleted.lock().unwrap().len(), 1);

    // Terminal error event, exactly one.
    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(
        events.last().expect("events"),
        ProgressEvent::Error { kind: ErrorKind::BackendError, .. }
    ));

    // Agent is visible in `error`, not silently deleted.
    let record = h.store.get_agent("u1", &agent_id).await.unwrap().expect("row");
    assert_eq!(record.status, AgentStatus::Error);

    // One audit entry carrying the vendor text and the compensation result.
    let entries = h.store.list_entries("u1", 50).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].detail["outcome"], "failure");
    assert_eq!(entries[0].detail["error_kind"], "backend_error");
    assert!(
        entries[0].detail["error"]
            .as_str()
            .unwrap()
            .contains("bucket quota exhausted")
    );
    assert_eq!(entries[0].detail["compensation"]["instance"], "deleted");
}

// ── Scenario C: precondition violations make no backend calls ────────────────

#[tokio::test]
async fn start_on_running_agent_is_rejected_without_side_effects() {
    let h = harness();
    let snapshot = create_running_agent(&h).await;
    let calls_before = h.compute.calls.load(Ordering::SeqCst);

    let err = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Start {
                agent_id: snapshot.id.clone(),
            },
        )
        .await
        .expect_err("start on running agent must be rejected");
    assert!(matches!(err, OrchestratorError::Validation(_)));
    assert!(err.to_string().contains("'running'"));

    assert_eq!(
        h.compute.calls.load(Ordering::SeqCst),
        calls_before,
        "no backend calls on validation failure"
    );
    let record = h.store.get_agent("u1", &snapshot.id).await.unwrap().expect("row");
    assert_eq!(record.status, AgentStatus::Running);

    // The rejection itself is audited: create + rejected start.
    let entries = h.store.list_entries("u1", 50).await.unwrap();
    assert_eq!(entries.len(), 2);
    let rejected = entries.iter().find(|e| e.action == "agent.start").unwrap();
    assert_eq!(rejected.detail["error_kind"], "validation_error");
}

#[tokio::test]
async fn create_with_bad_input_has_no_side_effects() {
    let h = harness();
    let err = h
        .orchestrator
        .submit(caller(), create_request(""))
        .await
        .expect_err("empty name rejected");
    assert!(matches!(err, OrchestratorError::Validation(_)));
    assert_eq!(h.compute.calls.load(Ordering::SeqCst), 0);
    assert!(h.store.list_agents("u1").await.unwrap().is_empty());
    assert_eq!(h.store.list_entries("u1", 50).await.unwrap().len(), 1);
}

#[tokio::test]
async fn create_with_unknown_template_is_rejected() {
    let h = harness();
    let err = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Create(CreateAgent {
                name: "templated".into(),
                platform: PlatformKind::Goose,
                size: None,
                template_id: Some("missing".into()),
                credential_ids: Vec::new(),
            }),
        )
        .await
        .expect_err("unknown template rejected");
    assert!(matches!(err, OrchestratorError::NotFound("template")));
    assert_eq!(h.compute.calls.load(Ordering::SeqCst), 0);
}

// ── Single-flight ────────────────────────────────────────────────────────────

#[tokio::test]
async fn second_workflow_for_same_agent_conflicts_and_leaves_first_untouched() {
    let h = harness();
    let gate = Arc::new(Semaphore::new(0));
    *h.compute.hold_create.lock().unwrap() = Some(gate.clone());

    let handle = h
        .orchestrator
        .submit(caller(), create_request("contended"))
        .await
        .expect("accepted");
    let agent_id = handle.agent_id.clone();

    // While create is parked inside its first backend step, a second
    // workflow for the same agent must fail fast with conflict.
    let err = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Delete {
                agent_id: agent_id.clone(),
            },
        )
        .await
        .expect_err("lock is held");
    assert!(matches!(err, OrchestratorError::Conflict));

    gate.add_permits(1);
    let (_, result) = run_to_end(handle).await;
    let snapshot = result.expect("first workflow unaffected by the conflict");
    assert_eq!(snapshot.status, AgentStatus::Running);

    // Both invocations audited: the success and the conflict rejection.
    let entries = h.store.list_entries("u1", 50).await.unwrap();
    assert_eq!(entries.len(), 2);
    let conflict = entries.iter().find(|e| e.action == "agent.delete").unwrap();
    assert_eq!(conflict.detail["error_kind"], "conflict");
}

#[tokio::test]
async fn workflows_for_distinct_agents_run_in_parallel() {
    let h = harness();
    let gate = Arc::new(Semaphore::new(0));
    *h.compute.hold_create.lock().unwrap() = Some(gate.clone());

    let first = h
        .orchestrator
        .submit(caller(), create_request("one"))
        .await
        .expect("accepted");
    // A different agent is not blocked by the parked workflow.
    let second = h
        .orchestrator
        .submit(caller(), create_request("two"))
        .await
        .expect("distinct agent accepted while first is in flight");

    gate.add_permits(2);
    let (_, r1) = run_to_end(first).await;
    let (_, r2) = run_to_end(second).await;
    assert!(r1.is_ok() && r2.is_ok());
}

// ── Scenario D: partial delete, idempotent retry ─────────────────────────────

#[tokio::test]
async fn delete_retries_only_the_failed_resource() {
    let h = harness();
    let snapshot = create_running_agent(&h).await;
    h.compute.fail_delete.store(true, Ordering::SeqCst);

    // First delete: bucket and secrets go, instance teardown fails.
    let handle = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Delete {
                agent_id: snapshot.id.clone(),
            },
        )
        .await
        .expect("accepted");
    let (events, result) = run_to_end(handle).await;
    let err = result.expect_err("instance teardown fails");
    assert_eq!(err.kind(), ErrorKind::PartialFailure);
    assert!(err.to_string().contains("instance"));
    assert_eq!(terminal_count(&events), 1);

    let record = h.store.get_agent("u1", &snapshot.id).await.unwrap().expect("row");
    assert_eq!(record.status, AgentStatus::Error);
    assert!(record.bucket_id.is_none(), "bucket teardown succeeded");
    assert!(record.instance_id.is_some(), "instance still tracked");

    let entries = h.store.list_entries("u1", 50).await.unwrap();
    let failed = entries.iter().find(|e| e.action == "agent.delete").unwrap();
    assert_eq!(failed.detail["teardown"]["bucket"], "deleted");
    assert!(
        failed.detail["teardown"]["instance"]
            .as_str()
            .unwrap()
            .contains("delete failed")
    );

    // Retry: only the instance is re-attempted, and the agent reaches
    // `deleted`.
    h.compute.fail_delete.store(false, Ordering::SeqCst);
    let handle = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Delete {
                agent_id: snapshot.id.clone(),
            },
        )
        .await
        .expect("accepted");
    let (_, result) = run_to_end(handle).await;
    assert_eq!(result.expect("retry succeeds").status, AgentStatus::Deleted);

    let entries = h.store.list_entries("u1", 50).await.unwrap();
    let retry = entries
        .iter()
        .find(|e| e.action == "agent.delete" && e.detail["outcome"] == "success")
        .unwrap();
    assert_eq!(retry.detail["teardown"]["bucket"], "skipped (already removed)");
    assert_eq!(retry.detail["teardown"]["instance"], "deleted");

    // Grants are gone and the row is tombstoned, not listed.
    assert!(h.store.list_agents("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_on_deleted_agent_is_a_validation_error_without_teardown_audit() {
    let h = harness();
    let snapshot = create_running_agent(&h).await;

    let handle = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Delete {
                agent_id: snapshot.id.clone(),
            },
        )
        .await
        .expect("accepted");
    let (_, result) = run_to_end(handle).await;
    result.expect("delete succeeds");

    let err = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Delete {
                agent_id: snapshot.id.clone(),
            },
        )
        .await
        .expect_err("second delete rejected");
    assert!(matches!(err, OrchestratorError::Validation(_)));

    // The rejection entry exists but records no teardown that didn't occur.
    let entries = h.store.list_entries("u1", 50).await.unwrap();
    assert_eq!(entries.len(), 3);
    let rejection = entries
        .iter()
        .find(|e| e.action == "agent.delete" && e.detail["outcome"] == "failure")
        .unwrap();
    assert!(rejection.detail.get("teardown").is_none());
}

// ── stop / start ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_then_start_round_trip() {
    let h = harness();
    let snapshot = create_running_agent(&h).await;

    let handle = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Stop {
                agent_id: snapshot.id.clone(),
            },
        )
        .await
        .expect("accepted");
    let (_, result) = run_to_end(handle).await;
    assert_eq!(result.expect("stop succeeds").status, AgentStatus::Stopped);

    let handle = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Start {
                agent_id: snapshot.id.clone(),
            },
        )
        .await
        .expect("accepted");
    let (events, result) = run_to_end(handle).await;
    assert_eq!(result.expect("start succeeds").status, AgentStatus::Running);
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::SpanStart { name, .. } if name == "health probe"
    )));
}

#[tokio::test]
async fn health_probe_timeout_leaves_error_not_stopped() {
    let h = harness_with(OrchestratorSettings {
        probe_timeout: Duration::from_millis(200),
        ..fast_settings()
    });
    let snapshot = create_running_agent(&h).await;

    let handle = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Stop {
                agent_id: snapshot.id.clone(),
            },
        )
        .await
        .expect("accepted");
    run_to_end(handle).await.1.expect("stop succeeds");

    h.compute.unhealthy.store(true, Ordering::SeqCst);
    let handle = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Start {
                agent_id: snapshot.id.clone(),
            },
        )
        .await
        .expect("accepted");
    let (_, result) = run_to_end(handle).await;
    let err = result.expect_err("probe must time out");
    assert_eq!(err.kind(), ErrorKind::Timeout);

    // Conservative choice: the true state is unknown, so `error`, never
    // back to `stopped`.
    let record = h.store.get_agent("u1", &snapshot.id).await.unwrap().expect("row");
    assert_eq!(record.status, AgentStatus::Error);

    let entries = h.store.list_entries("u1", 50).await.unwrap();
    let failed = entries.iter().find(|e| e.action == "agent.start").unwrap();
    assert_eq!(failed.detail["error_kind"], "timeout");
}

// ── archive / restore ────────────────────────────────────────────────────────

#[tokio::test]
async fn archive_snapshots_config_without_touching_status() {
    let h = harness();
    let snapshot = create_running_agent(&h).await;

    let handle = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Archive {
                agent_id: snapshot.id.clone(),
                name: Some("golden image".into()),
            },
        )
        .await
        .expect("accepted");
    let (_, result) = run_to_end(handle).await;
    assert_eq!(result.expect("archive succeeds").status, AgentStatus::Running);

    let templates = h.store.list_templates("u1").await.unwrap();
    assert_eq!(templates.len(), 1);
    assert_eq!(templates[0].name, "golden image");
    assert_eq!(templates[0].source_agent_id.as_deref(), Some(snapshot.id.as_str()));
    assert_eq!(
        templates[0].snapshot.config.as_deref(),
        Some(r#"{"model":"claude-sonnet"}"#)
    );
    assert_eq!(templates[0].snapshot.size.as_deref(), Some("small"));
}

#[tokio::test]
async fn restore_reuses_the_agent_identity() {
    let h = harness();
    let snapshot = create_running_agent(&h).await;

    let handle = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Archive {
                agent_id: snapshot.id.clone(),
                name: Some("baseline".into()),
            },
        )
        .await
        .expect("accepted");
    run_to_end(handle).await.1.expect("archive succeeds");
    let template_id = h.store.list_templates("u1").await.unwrap()[0].id.clone();

    let handle = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Restore {
                template_id: template_id.clone(),
                agent_id: Some(snapshot.id.clone()),
            },
        )
        .await
        .expect("accepted");
    let (events, result) = run_to_end(handle).await;
    let restored = result.expect("restore succeeds");

    assert_eq!(restored.id, snapshot.id, "identity reused");
    assert_eq!(restored.status, AgentStatus::Running);
    assert_eq!(restored.template_id.as_deref(), Some(template_id.as_str()));

    // Old sandbox torn down, template config applied to the new one.
    assert!(!h.compute.deleted.lock().unwrap().is_empty());
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::SpanStart { name, .. } if name == "apply template"
    )));

    // One audit entry for the whole restore invocation.
    let entries = h.store.list_entries("u1", 50).await.unwrap();
    assert_eq!(
        entries.iter().filter(|e| e.action == "agent.restore").count(),
        1
    );
}

#[tokio::test]
async fn restore_without_agent_founds_a_new_one() {
    let h = harness();
    let snapshot = create_running_agent(&h).await;
    let handle = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Archive {
                agent_id: snapshot.id.clone(),
                name: None,
            },
        )
        .await
        .expect("accepted");
    run_to_end(handle).await.1.expect("archive succeeds");
    let template = &h.store.list_templates("u1").await.unwrap()[0];

    let handle = h
        .orchestrator
        .submit(
            caller(),
            WorkflowRequest::Restore {
                template_id: template.id.clone(),
                agent_id: None,
            },
        )
        .await
        .expect("accepted");
    let (_, result) = run_to_end(handle).await;
    let restored = result.expect("restore succeeds");
    assert_ne!(restored.id, snapshot.id);
    assert_eq!(restored.name, template.name);
    assert_eq!(h.store.list_agents("u1").await.unwrap().len(), 2);
}
