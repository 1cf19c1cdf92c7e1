//! Durable catalog of projects, threads, and conversation entries.
//!
//! The orchestrator consumes the [`ThreadStore`] contract; [`SqliteStore`]
//! is the default implementation. "Not found" must stay distinguishable
//! from other storage failures: the reclamation scan and resolve-or-create
//! logic key off it.

use anyhow::Context as _;
use rusqlite::{params, Connection, OptionalExtension as _};
use std::path::PathBuf;
use std::sync::Mutex;

use gantry_domain::time::now_unix_millis;
use gantry_domain::{ConversationEntry, EntryRole, Project, Thread, ThreadStatus};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreError {
    NotFound,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "record not found"),
        }
    }
}

impl std::error::Error for StoreError {}

/// True when `err` carries the distinguishable "not found" condition.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::NotFound))
}

/// CRUD-plus-status operations the orchestrator relies on.
pub trait ThreadStore: Send + Sync {
    fn create_thread(
        &self,
        project_id: i64,
        title: &str,
        model: &str,
        sandbox_mode: &str,
        reasoning_level: &str,
    ) -> anyhow::Result<Thread>;
    fn get_thread(&self, id: i64) -> anyhow::Result<Thread>;
    fn list_threads_by_project(&self, project_id: i64) -> anyhow::Result<Vec<Thread>>;
    fn update_thread_status(
        &self,
        id: i64,
        status: ThreadStatus,
        last_message_at_unix_ms: Option<i64>,
    ) -> anyhow::Result<()>;
    fn touch_thread_activity(&self, id: i64, at_unix_ms: i64) -> anyhow::Result<()>;
    fn update_thread_title(&self, id: i64, title: &str) -> anyhow::Result<()>;
    fn update_thread_options(
        &self,
        id: i64,
        model: &str,
        sandbox_mode: &str,
        reasoning_level: &str,
    ) -> anyhow::Result<()>;
    /// First write wins; returns false when an external id was already set.
    fn set_thread_external_id(&self, id: i64, external_id: &str) -> anyhow::Result<bool>;
    fn set_thread_branch(&self, id: i64, branch_name: &str) -> anyhow::Result<()>;
    fn set_thread_worktree_path(&self, id: i64, path: &str) -> anyhow::Result<()>;
    fn set_thread_conversation_path(&self, id: i64, path: &str) -> anyhow::Result<()>;
    fn set_thread_pr_url(&self, id: i64, url: &str) -> anyhow::Result<()>;
    fn delete_thread(&self, id: i64) -> anyhow::Result<()>;

    fn create_entry(
        &self,
        thread_id: i64,
        role: EntryRole,
        entry_type: &str,
        payload: Option<serde_json::Value>,
        created_at_unix_ms: Option<i64>,
    ) -> anyhow::Result<ConversationEntry>;
    fn list_entries(&self, thread_id: i64) -> anyhow::Result<Vec<ConversationEntry>>;

    fn upsert_project(&self, path: &str, display_name: Option<&str>) -> anyhow::Result<Project>;
    fn get_project_by_id(&self, id: i64) -> anyhow::Result<Project>;
    fn get_project_by_path(&self, path: &str) -> anyhow::Result<Project>;
    fn list_projects(&self) -> anyhow::Result<Vec<Project>>;
}

const MIGRATIONS: &[(u32, &str)] = &[(
    1,
    "
    CREATE TABLE projects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        display_name TEXT,
        created_at_unix_ms INTEGER NOT NULL,
        updated_at_unix_ms INTEGER NOT NULL
    );

    CREATE TABLE threads (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        external_id TEXT,
        conversation_path TEXT,
        worktree_path TEXT,
        branch_name TEXT,
        pr_url TEXT,
        title TEXT NOT NULL,
        model TEXT NOT NULL DEFAULT '',
        sandbox_mode TEXT NOT NULL DEFAULT '',
        reasoning_level TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'active',
        created_at_unix_ms INTEGER NOT NULL,
        updated_at_unix_ms INTEGER NOT NULL,
        last_message_at_unix_ms INTEGER
    );
    CREATE INDEX idx_threads_project ON threads(project_id, updated_at_unix_ms);

    CREATE TABLE thread_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        entry_type TEXT NOT NULL,
        payload TEXT,
        created_at_unix_ms INTEGER NOT NULL,
        updated_at_unix_ms INTEGER NOT NULL
    );
    CREATE INDEX idx_thread_entries_thread ON thread_entries(thread_id, created_at_unix_ms, id);
    ",
)];

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        configure_connection(&conn)?;
        apply_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("store lock poisoned"))?;
        f(&conn)
    }
}

fn configure_connection(conn: &Connection) -> anyhow::Result<()> {
    // journal_mode reports the resulting mode, so read it back instead of
    // using a plain update.
    let _mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .context("enable WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("enable foreign keys")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set busy timeout")?;
    Ok(())
}

fn apply_migrations(conn: &mut Connection) -> anyhow::Result<()> {
    let current: u32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .context("read schema version")?;
    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let tx = conn.transaction().context("begin migration")?;
        tx.execute_batch(sql)
            .with_context(|| format!("apply migration {version}"))?;
        tx.pragma_update(None, "user_version", version)
            .with_context(|| format!("bump schema version to {version}"))?;
        tx.commit().context("commit migration")?;
    }
    Ok(())
}

fn thread_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thread> {
    let status_raw: String = row.get("status")?;
    Ok(Thread {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        external_id: row.get("external_id")?,
        conversation_path: row.get("conversation_path")?,
        worktree_path: row.get("worktree_path")?,
        branch_name: row.get("branch_name")?,
        pr_url: row.get("pr_url")?,
        title: row.get("title")?,
        model: row.get("model")?,
        sandbox_mode: row.get("sandbox_mode")?,
        reasoning_level: row.get("reasoning_level")?,
        status: ThreadStatus::parse(&status_raw).unwrap_or(ThreadStatus::Active),
        created_at_unix_ms: row.get("created_at_unix_ms")?,
        updated_at_unix_ms: row.get("updated_at_unix_ms")?,
        last_message_at_unix_ms: row.get("last_message_at_unix_ms")?,
    })
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationEntry> {
    let role_raw: String = row.get("role")?;
    let payload_raw: Option<String> = row.get("payload")?;
    Ok(ConversationEntry {
        id: row.get("id")?,
        thread_id: row.get("thread_id")?,
        role: EntryRole::parse(&role_raw).unwrap_or(EntryRole::System),
        entry_type: row.get("entry_type")?,
        payload: payload_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at_unix_ms: row.get("created_at_unix_ms")?,
        updated_at_unix_ms: row.get("updated_at_unix_ms")?,
    })
}

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get("id")?,
        path: row.get("path")?,
        display_name: row.get("display_name")?,
        created_at_unix_ms: row.get("created_at_unix_ms")?,
        updated_at_unix_ms: row.get("updated_at_unix_ms")?,
    })
}

const THREAD_COLUMNS: &str = "id, project_id, external_id, conversation_path, worktree_path, \
                              branch_name, pr_url, title, model, sandbox_mode, reasoning_level, \
                              status, created_at_unix_ms, updated_at_unix_ms, last_message_at_unix_ms";

impl ThreadStore for SqliteStore {
    fn create_thread(
        &self,
        project_id: i64,
        title: &str,
        model: &str,
        sandbox_mode: &str,
        reasoning_level: &str,
    ) -> anyhow::Result<Thread> {
        let id = self.with_conn(|conn| {
            let now = now_unix_millis();
            conn.execute(
                "INSERT INTO threads (project_id, title, model, sandbox_mode, reasoning_level, \
                 created_at_unix_ms, updated_at_unix_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![project_id, title, model, sandbox_mode, reasoning_level, now],
            )
            .context("insert thread")?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get_thread(id)
    }

    fn get_thread(&self, id: i64) -> anyhow::Result<Thread> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?1"),
                params![id],
                thread_from_row,
            )
            .optional()
            .context("select thread")?
            .ok_or_else(|| {
                anyhow::Error::new(StoreError::NotFound).context(format!("thread {id} not found"))
            })
        })
    }

    fn list_threads_by_project(&self, project_id: i64) -> anyhow::Result<Vec<Thread>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {THREAD_COLUMNS} FROM threads WHERE project_id = ?1 \
                     ORDER BY COALESCE(last_message_at_unix_ms, updated_at_unix_ms) DESC, id DESC"
                ))
                .context("prepare thread list")?;
            let rows = stmt
                .query_map(params![project_id], thread_from_row)
                .context("query threads")?;
            rows.collect::<Result<Vec<_>, _>>().context("scan threads")
        })
    }

    fn update_thread_status(
        &self,
        id: i64,
        status: ThreadStatus,
        last_message_at_unix_ms: Option<i64>,
    ) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE threads SET status = ?1, \
                 last_message_at_unix_ms = COALESCE(?2, last_message_at_unix_ms), \
                 updated_at_unix_ms = ?3 WHERE id = ?4",
                params![status.as_str(), last_message_at_unix_ms, now_unix_millis(), id],
            )
            .context("update thread status")?;
            Ok(())
        })
    }

    fn touch_thread_activity(&self, id: i64, at_unix_ms: i64) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE threads SET last_message_at_unix_ms = ?1, updated_at_unix_ms = ?2 \
                 WHERE id = ?3",
                params![at_unix_ms, now_unix_millis(), id],
            )
            .context("touch thread activity")?;
            Ok(())
        })
    }

    fn update_thread_title(&self, id: i64, title: &str) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE threads SET title = ?1, updated_at_unix_ms = ?2 WHERE id = ?3",
                    params![title, now_unix_millis(), id],
                )
                .context("update thread title")?;
            if changed == 0 {
                return Err(anyhow::Error::new(StoreError::NotFound)
                    .context(format!("thread {id} not found")));
            }
            Ok(())
        })
    }

    fn update_thread_options(
        &self,
        id: i64,
        model: &str,
        sandbox_mode: &str,
        reasoning_level: &str,
    ) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE threads SET model = ?1, sandbox_mode = ?2, reasoning_level = ?3, \
                 updated_at_unix_ms = ?4 WHERE id = ?5",
                params![model, sandbox_mode, reasoning_level, now_unix_millis(), id],
            )
            .context("update thread options")?;
            Ok(())
        })
    }

    fn set_thread_external_id(&self, id: i64, external_id: &str) -> anyhow::Result<bool> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE threads SET external_id = ?1, updated_at_unix_ms = ?2 \
                     WHERE id = ?3 AND external_id IS NULL",
                    params![external_id, now_unix_millis(), id],
                )
                .context("set thread external id")?;
            Ok(changed > 0)
        })
    }

    fn set_thread_branch(&self, id: i64, branch_name: &str) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE threads SET branch_name = ?1, updated_at_unix_ms = ?2 WHERE id = ?3",
                params![branch_name, now_unix_millis(), id],
            )
            .context("set thread branch")?;
            Ok(())
        })
    }

    fn set_thread_worktree_path(&self, id: i64, path: &str) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE threads SET worktree_path = ?1, updated_at_unix_ms = ?2 WHERE id = ?3",
                params![null_if_empty(path), now_unix_millis(), id],
            )
            .context("set thread worktree path")?;
            Ok(())
        })
    }

    fn set_thread_conversation_path(&self, id: i64, path: &str) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE threads SET conversation_path = ?1, updated_at_unix_ms = ?2 WHERE id = ?3",
                params![null_if_empty(path), now_unix_millis(), id],
            )
            .context("set thread conversation path")?;
            Ok(())
        })
    }

    fn set_thread_pr_url(&self, id: i64, url: &str) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE threads SET pr_url = ?1, updated_at_unix_ms = ?2 WHERE id = ?3",
                params![null_if_empty(url), now_unix_millis(), id],
            )
            .context("set thread pr url")?;
            Ok(())
        })
    }

    fn delete_thread(&self, id: i64) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            let deleted = conn
                .execute("DELETE FROM threads WHERE id = ?1", params![id])
                .context("delete thread")?;
            if deleted == 0 {
                return Err(anyhow::Error::new(StoreError::NotFound)
                    .context(format!("thread {id} not found")));
            }
            Ok(())
        })
    }

    fn create_entry(
        &self,
        thread_id: i64,
        role: EntryRole,
        entry_type: &str,
        payload: Option<serde_json::Value>,
        created_at_unix_ms: Option<i64>,
    ) -> anyhow::Result<ConversationEntry> {
        let id = self.with_conn(|conn| {
            let at = created_at_unix_ms.unwrap_or_else(now_unix_millis);
            let payload_raw = payload.as_ref().map(serde_json::Value::to_string);
            conn.execute(
                "INSERT INTO thread_entries (thread_id, role, entry_type, payload, \
                 created_at_unix_ms, updated_at_unix_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![thread_id, role.as_str(), entry_type, payload_raw, at],
            )
            .context("insert conversation entry")?;
            Ok(conn.last_insert_rowid())
        })?;
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, thread_id, role, entry_type, payload, created_at_unix_ms, \
                 updated_at_unix_ms FROM thread_entries WHERE id = ?1",
                params![id],
                entry_from_row,
            )
            .context("select conversation entry")
        })
    }

    fn list_entries(&self, thread_id: i64) -> anyhow::Result<Vec<ConversationEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, thread_id, role, entry_type, payload, created_at_unix_ms, \
                     updated_at_unix_ms FROM thread_entries WHERE thread_id = ?1 \
                     ORDER BY created_at_unix_ms ASC, id ASC",
                )
                .context("prepare entry list")?;
            let rows = stmt
                .query_map(params![thread_id], entry_from_row)
                .context("query entries")?;
            rows.collect::<Result<Vec<_>, _>>().context("scan entries")
        })
    }

    fn upsert_project(&self, path: &str, display_name: Option<&str>) -> anyhow::Result<Project> {
        self.with_conn(|conn| {
            let now = now_unix_millis();
            conn.execute(
                "INSERT INTO projects (path, display_name, created_at_unix_ms, updated_at_unix_ms) \
                 VALUES (?1, ?2, ?3, ?3) \
                 ON CONFLICT(path) DO UPDATE SET \
                 display_name = COALESCE(excluded.display_name, projects.display_name), \
                 updated_at_unix_ms = excluded.updated_at_unix_ms",
                params![path, display_name, now],
            )
            .context("upsert project")?;
            Ok(())
        })?;
        self.get_project_by_path(path)
    }

    fn get_project_by_id(&self, id: i64) -> anyhow::Result<Project> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, path, display_name, created_at_unix_ms, updated_at_unix_ms \
                 FROM projects WHERE id = ?1",
                params![id],
                project_from_row,
            )
            .optional()
            .context("select project")?
            .ok_or_else(|| {
                anyhow::Error::new(StoreError::NotFound).context(format!("project {id} not found"))
            })
        })
    }

    fn get_project_by_path(&self, path: &str) -> anyhow::Result<Project> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, path, display_name, created_at_unix_ms, updated_at_unix_ms \
                 FROM projects WHERE path = ?1",
                params![path],
                project_from_row,
            )
            .optional()
            .context("select project by path")?
            .ok_or_else(|| {
                anyhow::Error::new(StoreError::NotFound)
                    .context(format!("project not found: {path}"))
            })
        })
    }

    fn list_projects(&self) -> anyhow::Result<Vec<Project>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, path, display_name, created_at_unix_ms, updated_at_unix_ms \
                     FROM projects ORDER BY updated_at_unix_ms DESC, id DESC",
                )
                .context("prepare project list")?;
            let rows = stmt
                .query_map([], project_from_row)
                .context("query projects")?;
            rows.collect::<Result<Vec<_>, _>>().context("scan projects")
        })
    }
}

fn null_if_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(tmp.path().join("gantry.db")).expect("open store");
        (tmp, store)
    }

    fn seed_thread(store: &SqliteStore) -> Thread {
        let project = store.upsert_project("/tmp/proj", None).expect("project");
        store
            .create_thread(project.id, "Fix auth", "gpt-5.1-codex", "workspace-write", "medium")
            .expect("thread")
    }

    #[test]
    fn create_and_get_thread_round_trip() {
        let (_tmp, store) = open_store();
        let thread = seed_thread(&store);
        assert_eq!(thread.status, ThreadStatus::Active);
        assert_eq!(thread.title, "Fix auth");
        let loaded = store.get_thread(thread.id).expect("get");
        assert_eq!(loaded, thread);
    }

    #[test]
    fn missing_thread_is_a_distinguishable_not_found() {
        let (_tmp, store) = open_store();
        let err = store.get_thread(999).expect_err("missing thread");
        assert!(is_not_found(&err));
        let err = store.delete_thread(999).expect_err("missing delete");
        assert!(is_not_found(&err));
    }

    #[test]
    fn external_id_is_first_write_wins() {
        let (_tmp, store) = open_store();
        let thread = seed_thread(&store);
        assert!(store.set_thread_external_id(thread.id, "thr_abc").expect("first set"));
        assert!(!store.set_thread_external_id(thread.id, "thr_other").expect("second set"));
        let loaded = store.get_thread(thread.id).expect("get");
        assert_eq!(loaded.external_id.as_deref(), Some("thr_abc"));
    }

    #[test]
    fn entries_list_in_creation_order_and_cascade_on_delete() {
        let (_tmp, store) = open_store();
        let thread = seed_thread(&store);
        for (i, kind) in ["user_message", "agent_message", "system_message"].iter().enumerate() {
            store
                .create_entry(
                    thread.id,
                    EntryRole::Agent,
                    kind,
                    Some(serde_json::json!({"seq": i})),
                    Some(1_000 + i as i64),
                )
                .expect("entry");
        }
        let entries = store.list_entries(thread.id).expect("list");
        assert_eq!(entries.len(), 3);
        assert!(entries.windows(2).all(|w| w[0].created_at_unix_ms <= w[1].created_at_unix_ms));

        store.delete_thread(thread.id).expect("delete");
        assert!(store.list_entries(thread.id).expect("list after delete").is_empty());
    }

    #[test]
    fn status_update_keeps_existing_last_message_when_none_given() {
        let (_tmp, store) = open_store();
        let thread = seed_thread(&store);
        store.touch_thread_activity(thread.id, 42).expect("touch");
        store
            .update_thread_status(thread.id, ThreadStatus::Completed, None)
            .expect("status");
        let loaded = store.get_thread(thread.id).expect("get");
        assert_eq!(loaded.status, ThreadStatus::Completed);
        assert_eq!(loaded.last_message_at_unix_ms, Some(42));
    }

    #[test]
    fn list_threads_orders_by_recent_activity() {
        let (_tmp, store) = open_store();
        let project = store.upsert_project("/tmp/proj", None).expect("project");
        let a = store
            .create_thread(project.id, "a", "", "", "")
            .expect("thread a");
        let b = store
            .create_thread(project.id, "b", "", "", "")
            .expect("thread b");
        store.touch_thread_activity(a.id, now_unix_millis() + 60_000).expect("touch");
        let threads = store.list_threads_by_project(project.id).expect("list");
        assert_eq!(threads[0].id, a.id);
        assert_eq!(threads[1].id, b.id);
    }
}
