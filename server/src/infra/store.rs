//! Sqlite-backed implementation of the store ports.
//!
//! A single connection behind a mutex, driven through
//! `tokio::task::spawn_blocking` so the async runtime never blocks on disk.
//! Audit immutability is enforced in the schema itself: `BEFORE UPDATE` /
//! `BEFORE DELETE` triggers on `audit_log` raise, so even a buggy caller
//! holding the raw connection cannot rewrite history.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roost_common::{AgentStatus, PlatformKind};
use rusqlite::{Connection, OptionalExtension, params};

use crate::application::ports::{AgentStore, AuditLedger, CredentialStore, TemplateStore};
use crate::domain::{
    AgentRecord, AuditEntry, ConfigSnapshot, CredentialKind, CredentialRecord, TemplateRecord,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS agents (
  id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  name TEXT NOT NULL,
  size TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN (
    'creating','running','stopping','stopped','starting','deleting','deleted','error'
  )),
  instance_id TEXT,
  internal_addr TEXT,
  bucket_id TEXT,
  scoped_secret_ref TEXT,
  current_task TEXT,
  platform TEXT NOT NULL,
  platform_version TEXT,
  template_id TEXT,
  service_port INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agents_owner ON agents(owner_id, created_at DESC);

CREATE TABLE IF NOT EXISTS templates (
  id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  name TEXT NOT NULL,
  platform TEXT NOT NULL,
  setup_script_ref TEXT,
  snapshot_json TEXT NOT NULL DEFAULT '{}',
  starred INTEGER NOT NULL DEFAULT 0 CHECK (starred IN (0, 1)),
  source_agent_id TEXT,
  description TEXT,
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_templates_owner ON templates(owner_id, created_at DESC);

CREATE TABLE IF NOT EXISTS credentials (
  id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  name TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('llm', 'cloud', 'utility')),
  description TEXT,
  secret_ref TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS credential_grants (
  agent_id TEXT NOT NULL,
  credential_id TEXT NOT NULL REFERENCES credentials(id),
  granted_at TEXT NOT NULL,
  PRIMARY KEY (agent_id, credential_id)
);

CREATE TABLE IF NOT EXISTS audit_log (
  id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  action TEXT NOT NULL,
  target_type TEXT,
  target_id TEXT,
  detail_json TEXT NOT NULL DEFAULT '{}',
  origin_addr TEXT,
  at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_owner ON audit_log(owner_id, at DESC);

CREATE TRIGGER IF NOT EXISTS trg_audit_log_no_update
BEFORE UPDATE ON audit_log
BEGIN
  SELECT RAISE(FAIL, 'audit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_audit_log_no_delete
BEFORE DELETE ON audit_log
BEGIN
  SELECT RAISE(FAIL, 'audit_log is append-only');
END;
";

/// Store handle shared by all port consumers.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests and ephemeral deployments.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema fails to apply.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().context("opening in-memory database")?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enabling foreign keys")?;
        conn.execute_batch(SCHEMA).context("applying schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = match conn.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&guard)
        })
        .await
        .context("store task panicked")?
    }
}

// ── Row mapping ───────────────────────────────────────────────────────────────

fn parse_time(raw: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp in column {column}"))
}

fn parse_status(raw: &str) -> Result<AgentStatus> {
    AgentStatus::parse(raw).ok_or_else(|| anyhow!("unknown agent status '{raw}' in store"))
}

fn parse_platform(raw: &str) -> Result<PlatformKind> {
    PlatformKind::parse(raw).ok_or_else(|| anyhow!("unknown platform '{raw}' in store"))
}

fn agent_from_row(row: &rusqlite::Row<'_>) -> Result<AgentRecord> {
    Ok(AgentRecord {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        name: row.get("name")?,
        size: row.get("size")?,
        status: parse_status(&row.get::<_, String>("status")?)?,
        instance_id: row.get("instance_id")?,
        internal_addr: row.get("internal_addr")?,
        bucket_id: row.get("bucket_id")?,
        scoped_secret_ref: row.get("scoped_secret_ref")?,
        current_task: row.get("current_task")?,
        platform: parse_platform(&row.get::<_, String>("platform")?)?,
        platform_version: row.get("platform_version")?,
        template_id: row.get("template_id")?,
        service_port: row.get("service_port")?,
        created_at: parse_time(&row.get::<_, String>("created_at")?, "created_at")?,
        updated_at: parse_time(&row.get::<_, String>("updated_at")?, "updated_at")?,
    })
}

fn template_from_row(row: &rusqlite::Row<'_>) -> Result<TemplateRecord> {
    let snapshot: ConfigSnapshot =
        serde_json::from_str(&row.get::<_, String>("snapshot_json")?)
            .context("invalid template snapshot document")?;
    Ok(TemplateRecord {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        name: row.get("name")?,
        platform: parse_platform(&row.get::<_, String>("platform")?)?,
        setup_script_ref: row.get("setup_script_ref")?,
        snapshot,
        starred: row.get("starred")?,
        source_agent_id: row.get("source_agent_id")?,
        description: row.get("description")?,
        created_at: parse_time(&row.get::<_, String>("created_at")?, "created_at")?,
    })
}

fn credential_from_row(row: &rusqlite::Row<'_>) -> Result<CredentialRecord> {
    Ok(CredentialRecord {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        name: row.get("name")?,
        kind: CredentialKind::parse(&row.get::<_, String>("kind")?)
            .map_err(|e| anyhow!(e.to_string()))?,
        description: row.get("description")?,
        secret_ref: row.get("secret_ref")?,
        created_at: parse_time(&row.get::<_, String>("created_at")?, "created_at")?,
    })
}

fn audit_from_row(row: &rusqlite::Row<'_>) -> Result<AuditEntry> {
    let detail: serde_json::Value = serde_json::from_str(&row.get::<_, String>("detail_json")?)
        .context("invalid audit detail document")?;
    Ok(AuditEntry {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        action: row.get("action")?,
        target_type: row.get("target_type")?,
        target_id: row.get("target_id")?,
        detail,
        origin_addr: row.get("origin_addr")?,
        at: parse_time(&row.get::<_, String>("at")?, "at")?,
    })
}

// ── AgentStore ────────────────────────────────────────────────────────────────

#[async_trait]
impl AgentStore for SqliteStore {
    async fn insert_agent(&self, agent: &AgentRecord) -> Result<()> {
        let a = agent.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO agents (id, owner_id, name, size, status, instance_id,
                   internal_addr, bucket_id, scoped_secret_ref, current_task, platform,
                   platform_version, template_id, service_port, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    a.id,
                    a.owner_id,
                    a.name,
                    a.size,
                    a.status.as_str(),
                    a.instance_id,
                    a.internal_addr,
                    a.bucket_id,
                    a.scoped_secret_ref,
                    a.current_task,
                    a.platform.as_str(),
                    a.platform_version,
                    a.template_id,
                    a.service_port,
                    a.created_at.to_rfc3339(),
                    a.updated_at.to_rfc3339(),
                ],
            )
            .context("inserting agent")?;
            Ok(())
        })
        .await
    }

    async fn get_agent(&self, owner_id: &str, agent_id: &str) -> Result<Option<AgentRecord>> {
        let (owner_id, agent_id) = (owner_id.to_owned(), agent_id.to_owned());
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM agents WHERE id = ?1 AND owner_id = ?2",
                params![agent_id, owner_id],
                |row| Ok(agent_from_row(row)),
            )
            .optional()
            .context("loading agent")?
            .transpose()
        })
        .await
    }

    async fn list_agents(&self, owner_id: &str) -> Result<Vec<AgentRecord>> {
        let owner_id = owner_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM agents
                 WHERE owner_id = ?1 AND status != 'deleted'
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![owner_id], |row| Ok(agent_from_row(row)))?;
            let mut agents = Vec::new();
            for row in rows {
                agents.push(row.context("reading agent row")??);
            }
            Ok(agents)
        })
        .await
    }

    async fn update_agent(&self, agent: &AgentRecord) -> Result<()> {
        let a = agent.clone();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE agents SET name = ?2, size = ?3, status = ?4, instance_id = ?5,
                       internal_addr = ?6, bucket_id = ?7, scoped_secret_ref = ?8,
                       current_task = ?9, platform = ?10, platform_version = ?11,
                       template_id = ?12, updated_at = ?13
                     WHERE id = ?1",
                    params![
                        a.id,
                        a.name,
                        a.size,
                        a.status.as_str(),
                        a.instance_id,
                        a.internal_addr,
                        a.bucket_id,
                        a.scoped_secret_ref,
                        a.current_task,
                        a.platform.as_str(),
                        a.platform_version,
                        a.template_id,
                        a.updated_at.to_rfc3339(),
                    ],
                )
                .context("updating agent")?;
            anyhow::ensure!(changed == 1, "agent {} vanished during update", a.id);
            Ok(())
        })
        .await
    }
}

// ── TemplateStore ─────────────────────────────────────────────────────────────

#[async_trait]
impl TemplateStore for SqliteStore {
    async fn insert_template(&self, template: &TemplateRecord) -> Result<()> {
        let t = template.clone();
        let snapshot_json =
            serde_json::to_string(&t.snapshot).context("serializing template snapshot")?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO templates (id, owner_id, name, platform, setup_script_ref,
                   snapshot_json, starred, source_agent_id, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    t.id,
                    t.owner_id,
                    t.name,
                    t.platform.as_str(),
                    t.setup_script_ref,
                    snapshot_json,
                    t.starred,
                    t.source_agent_id,
                    t.description,
                    t.created_at.to_rfc3339(),
                ],
            )
            .context("inserting template")?;
            Ok(())
        })
        .await
    }

    async fn get_template(
        &self,
        owner_id: &str,
        template_id: &str,
    ) -> Result<Option<TemplateRecord>> {
        let (owner_id, template_id) = (owner_id.to_owned(), template_id.to_owned());
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM templates WHERE id = ?1 AND owner_id = ?2",
                params![template_id, owner_id],
                |row| Ok(template_from_row(row)),
            )
            .optional()
            .context("loading template")?
            .transpose()
        })
        .await
    }

    async fn list_templates(&self, owner_id: &str) -> Result<Vec<TemplateRecord>> {
        let owner_id = owner_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM templates WHERE owner_id = ?1
                 ORDER BY starred DESC, created_at DESC",
            )?;
            let rows = stmt.query_map(params![owner_id], |row| Ok(template_from_row(row)))?;
            let mut templates = Vec::new();
            for row in rows {
                templates.push(row.context("reading template row")??);
            }
            Ok(templates)
        })
        .await
    }

    async fn update_template(&self, template: &TemplateRecord) -> Result<()> {
        let t = template.clone();
        let snapshot_json =
            serde_json::to_string(&t.snapshot).context("serializing template snapshot")?;
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE templates SET name = ?2, starred = ?3, description = ?4,
                       snapshot_json = ?5
                     WHERE id = ?1",
                    params![t.id, t.name, t.starred, t.description, snapshot_json],
                )
                .context("updating template")?;
            anyhow::ensure!(changed == 1, "template {} vanished during update", t.id);
            Ok(())
        })
        .await
    }

    async fn delete_template(&self, owner_id: &str, template_id: &str) -> Result<bool> {
        let (owner_id, template_id) = (owner_id.to_owned(), template_id.to_owned());
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "DELETE FROM templates WHERE id = ?1 AND owner_id = ?2",
                    params![template_id, owner_id],
                )
                .context("deleting template")?;
            Ok(changed == 1)
        })
        .await
    }
}

// ── CredentialStore ───────────────────────────────────────────────────────────

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn insert_credential(&self, credential: &CredentialRecord) -> Result<()> {
        let c = credential.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO credentials (id, owner_id, name, kind, description,
                   secret_ref, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    c.id,
                    c.owner_id,
                    c.name,
                    c.kind.as_str(),
                    c.description,
                    c.secret_ref,
                    c.created_at.to_rfc3339(),
                ],
            )
            .context("inserting credential")?;
            Ok(())
        })
        .await
    }

    async fn get_credential(
        &self,
        owner_id: &str,
        credential_id: &str,
    ) -> Result<Option<CredentialRecord>> {
        let (owner_id, credential_id) = (owner_id.to_owned(), credential_id.to_owned());
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM credentials WHERE id = ?1 AND owner_id = ?2",
                params![credential_id, owner_id],
                |row| Ok(credential_from_row(row)),
            )
            .optional()
            .context("loading credential")?
            .transpose()
        })
        .await
    }

    async fn list_credentials(&self, owner_id: &str) -> Result<Vec<CredentialRecord>> {
        let owner_id = owner_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM credentials WHERE owner_id = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![owner_id], |row| Ok(credential_from_row(row)))?;
            let mut credentials = Vec::new();
            for row in rows {
                credentials.push(row.context("reading credential row")??);
            }
            Ok(credentials)
        })
        .await
    }

    async fn delete_credential(&self, owner_id: &str, credential_id: &str) -> Result<bool> {
        let (owner_id, credential_id) = (owner_id.to_owned(), credential_id.to_owned());
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM credential_grants WHERE credential_id = ?1",
                params![credential_id],
            )
            .context("clearing credential grants")?;
            let changed = conn
                .execute(
                    "DELETE FROM credentials WHERE id = ?1 AND owner_id = ?2",
                    params![credential_id, owner_id],
                )
                .context("deleting credential")?;
            Ok(changed == 1)
        })
        .await
    }

    async fn grant(&self, agent_id: &str, credential_id: &str) -> Result<()> {
        let (agent_id, credential_id) = (agent_id.to_owned(), credential_id.to_owned());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO credential_grants (agent_id, credential_id, granted_at)
                 VALUES (?1, ?2, ?3)",
                params![agent_id, credential_id, Utc::now().to_rfc3339()],
            )
            .context("granting credential")?;
            Ok(())
        })
        .await
    }

    async fn grants_for_agent(&self, agent_id: &str) -> Result<Vec<CredentialRecord>> {
        let agent_id = agent_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT c.* FROM credentials c
                 JOIN credential_grants g ON g.credential_id = c.id
                 WHERE g.agent_id = ?1
                 ORDER BY g.granted_at",
            )?;
            let rows = stmt.query_map(params![agent_id], |row| Ok(credential_from_row(row)))?;
            let mut credentials = Vec::new();
            for row in rows {
                credentials.push(row.context("reading grant row")??);
            }
            Ok(credentials)
        })
        .await
    }

    async fn clear_grants_for_agent(&self, agent_id: &str) -> Result<()> {
        let agent_id = agent_id.to_owned();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM credential_grants WHERE agent_id = ?1",
                params![agent_id],
            )
            .context("clearing agent grants")?;
            Ok(())
        })
        .await
    }
}

// ── AuditLedger ───────────────────────────────────────────────────────────────

#[async_trait]
impl AuditLedger for SqliteStore {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let e = entry.clone();
        let detail_json = serde_json::to_string(&e.detail).context("serializing audit detail")?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO audit_log (id, owner_id, action, target_type, target_id,
                   detail_json, origin_addr, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    e.id,
                    e.owner_id,
                    e.action,
                    e.target_type,
                    e.target_id,
                    detail_json,
                    e.origin_addr,
                    e.at.to_rfc3339(),
                ],
            )
            .context("appending audit entry")?;
            Ok(())
        })
        .await
    }

    async fn list_entries(&self, owner_id: &str, limit: u32) -> Result<Vec<AuditEntry>> {
        let owner_id = owner_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM audit_log WHERE owner_id = ?1 ORDER BY at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![owner_id, limit], |row| Ok(audit_from_row(row)))?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.context("reading audit row")??);
            }
            Ok(entries)
        })
        .await
    }
}
