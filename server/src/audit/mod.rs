//! Audit persistence — session and command history in SQLite.
//!
//! [`AuditStore`] is the single write path for audit records. The session
//! lifecycle manager inserts a session row when the remote shell opens and
//! finalizes it exactly once on close; command rows are written as commands
//! are detected and updated once when their capture window closes. The
//! admin-reporting layer reads the same tables through the REST routes.
//!
//! All writes happen off the interactive path; callers log and swallow
//! errors rather than letting a failed audit write disturb a live session.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::classify::CommandCategory;

/// Session lifecycle status as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Disconnected,
    Timeout,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disconnected => "disconnected",
            Self::Timeout => "timeout",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "disconnected" => Some(Self::Disconnected),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

/// One remote-shell session, from shell-open to finalize.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub host: String,
    pub port: u16,
    pub login: String,
    pub display_name: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    /// Set by finalize; absent while the session is open.
    pub closed_at: Option<DateTime<Utc>>,
    /// Whole seconds, `closed_at − created_at`. Present iff `closed_at` is.
    pub duration_secs: Option<i64>,
}

/// One audited command within a session.
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub host: String,
    pub command: String,
    pub output: String,
    pub category: CommandCategory,
    pub dangerous: bool,
    pub executed_at: DateTime<Utc>,
    /// Best-effort: capture-window close minus submission, in milliseconds.
    pub duration_ms: Option<i64>,
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(format!("bad timestamp {raw:?}: {e}").into()))
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let closed_at: Option<String> = row.try_get("closed_at")?;
    Ok(SessionRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        user_name: row.try_get("user_name")?,
        host: row.try_get("host")?,
        port: row.try_get::<i64, _>("port")? as u16,
        login: row.try_get("login")?,
        display_name: row.try_get("display_name")?,
        status: SessionStatus::from_str_opt(&status)
            .ok_or_else(|| sqlx::Error::Decode(format!("bad status {status:?}").into()))?,
        created_at: parse_ts(&created_at)?,
        closed_at: closed_at.as_deref().map(parse_ts).transpose()?,
        duration_secs: row.try_get("duration_secs")?,
    })
}

fn command_from_row(row: &SqliteRow) -> Result<CommandRecord, sqlx::Error> {
    let category: String = row.try_get("category")?;
    let executed_at: String = row.try_get("executed_at")?;
    Ok(CommandRecord {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        host: row.try_get("host")?,
        command: row.try_get("command")?,
        output: row.try_get("output")?,
        category: CommandCategory::from_str_opt(&category)
            .ok_or_else(|| sqlx::Error::Decode(format!("bad category {category:?}").into()))?,
        dangerous: row.try_get::<i64, _>("dangerous")? != 0,
        executed_at: parse_ts(&executed_at)?,
        duration_ms: row.try_get("duration_ms")?,
    })
}

/// SQLite-backed audit store. Cloneable — clones share the pool.
#[derive(Clone)]
pub struct AuditStore {
    pool: SqlitePool,
}

impl AuditStore {
    /// Open (or create) the audit database at the given path.
    pub async fn from_path(db_path: &std::path::Path) -> Result<Self, sqlx::Error> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| sqlx::Error::Io(std::io::Error::other(e)))?;
            }
        }
        let url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        // WAL for read/write concurrency with the reporting layer
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("Audit store ready at {}", db_path.display());
        Ok(store)
    }

    /// In-memory store (for tests).
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        debug!("In-memory audit store ready");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id            TEXT PRIMARY KEY,
                user_id       TEXT NOT NULL,
                user_name     TEXT NOT NULL,
                host          TEXT NOT NULL,
                port          INTEGER NOT NULL,
                login         TEXT NOT NULL,
                display_name  TEXT NOT NULL,
                status        TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                closed_at     TEXT,
                duration_secs INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_host ON sessions(host, created_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS commands (
                id          TEXT PRIMARY KEY,
                session_id  TEXT NOT NULL REFERENCES sessions(id),
                user_id     TEXT NOT NULL,
                host        TEXT NOT NULL,
                command     TEXT NOT NULL,
                output      TEXT NOT NULL DEFAULT '',
                category    TEXT NOT NULL,
                dangerous   INTEGER NOT NULL,
                executed_at TEXT NOT NULL,
                duration_ms INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_commands_session
             ON commands(session_id, executed_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a freshly opened session (status `active`, no closing fields).
    pub async fn insert_session(&self, record: &SessionRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO sessions
             (id, user_id, user_name, host, port, login, display_name, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.user_name)
        .bind(&record.host)
        .bind(i64::from(record.port))
        .bind(&record.login)
        .bind(&record.display_name)
        .bind(record.status.as_str())
        .bind(ts(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close a session: set closing timestamp, duration, and final status.
    ///
    /// Only updates rows that are still open (`closed_at IS NULL`), so a
    /// second finalize for the same id changes nothing. Returns whether a
    /// row was actually closed by this call.
    pub async fn finalize_session(
        &self,
        session_id: &str,
        closed_at: DateTime<Utc>,
        duration_secs: i64,
        status: SessionStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE sessions
             SET closed_at = ?, duration_secs = ?, status = ?
             WHERE id = ? AND closed_at IS NULL",
        )
        .bind(ts(closed_at))
        .bind(duration_secs)
        .bind(status.as_str())
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Insert a detected command with its classification.
    pub async fn insert_command(&self, record: &CommandRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO commands
             (id, session_id, user_id, host, command, output, category, dangerous, executed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(&record.user_id)
        .bind(&record.host)
        .bind(&record.command)
        .bind(&record.output)
        .bind(record.category.as_str())
        .bind(i64::from(record.dangerous))
        .bind(ts(record.executed_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attach the captured output to a command once its window closes.
    /// The record is immutable afterwards.
    pub async fn attach_output(
        &self,
        command_id: &str,
        output: &str,
        duration_ms: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE commands SET output = ?, duration_ms = ? WHERE id = ?")
            .bind(output)
            .bind(duration_ms)
            .bind(command_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Sessions, newest first, optionally filtered by target host.
    pub async fn sessions_by_host(
        &self,
        host: Option<&str>,
    ) -> Result<Vec<SessionRecord>, sqlx::Error> {
        let rows = match host {
            Some(h) => {
                sqlx::query(
                    "SELECT * FROM sessions WHERE host = ? ORDER BY created_at DESC",
                )
                .bind(h)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM sessions ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(session_from_row).collect()
    }

    /// A session plus its commands in execution order, or `None` if unknown.
    pub async fn session_detail(
        &self,
        session_id: &str,
    ) -> Result<Option<(SessionRecord, Vec<CommandRecord>)>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let session = session_from_row(&row)?;

        let commands = sqlx::query(
            "SELECT * FROM commands WHERE session_id = ? ORDER BY executed_at, id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(command_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Some((session, commands)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(id: &str, host: &str, created_at: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            user_id: "u1".to_string(),
            user_name: "alice".to_string(),
            host: host.to_string(),
            port: 22,
            login: "root".to_string(),
            display_name: "web-01".to_string(),
            status: SessionStatus::Active,
            created_at,
            closed_at: None,
            duration_secs: None,
        }
    }

    fn command(id: &str, session_id: &str, text: &str, at: DateTime<Utc>) -> CommandRecord {
        CommandRecord {
            id: id.to_string(),
            session_id: session_id.to_string(),
            user_id: "u1".to_string(),
            host: "10.0.0.1".to_string(),
            command: text.to_string(),
            output: String::new(),
            category: crate::classify::categorize(text),
            dangerous: crate::classify::is_dangerous(text),
            executed_at: at,
            duration_ms: None,
        }
    }

    #[tokio::test]
    async fn open_session_has_no_closing_fields() {
        let store = AuditStore::in_memory().await.unwrap();
        store
            .insert_session(&session("s1", "10.0.0.1", Utc::now()))
            .await
            .unwrap();

        let (record, _) = store.session_detail("s1").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Active);
        assert!(record.closed_at.is_none());
        assert!(record.duration_secs.is_none());
    }

    #[tokio::test]
    async fn finalize_sets_duration_from_timestamps() {
        let store = AuditStore::in_memory().await.unwrap();
        let created = Utc::now();
        store
            .insert_session(&session("s1", "10.0.0.1", created))
            .await
            .unwrap();

        let closed = created + Duration::seconds(42);
        let applied = store
            .finalize_session("s1", closed, 42, SessionStatus::Disconnected)
            .await
            .unwrap();
        assert!(applied);

        let (record, _) = store.session_detail("s1").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Disconnected);
        assert_eq!(record.duration_secs, Some(42));
        let delta = record.closed_at.unwrap() - record.created_at;
        assert_eq!(delta.num_seconds(), 42);
    }

    #[tokio::test]
    async fn second_finalize_is_a_no_op() {
        let store = AuditStore::in_memory().await.unwrap();
        let created = Utc::now();
        store
            .insert_session(&session("s1", "10.0.0.1", created))
            .await
            .unwrap();

        let first = store
            .finalize_session("s1", created + Duration::seconds(5), 5, SessionStatus::Disconnected)
            .await
            .unwrap();
        let second = store
            .finalize_session("s1", created + Duration::seconds(99), 99, SessionStatus::Timeout)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);

        let (record, _) = store.session_detail("s1").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Disconnected);
        assert_eq!(record.duration_secs, Some(5));
    }

    #[tokio::test]
    async fn commands_come_back_in_execution_order() {
        let store = AuditStore::in_memory().await.unwrap();
        let created = Utc::now();
        store
            .insert_session(&session("s1", "10.0.0.1", created))
            .await
            .unwrap();

        store
            .insert_command(&command("c1", "s1", "ls -la", created))
            .await
            .unwrap();
        store
            .insert_command(&command("c2", "s1", "rm -rf /", created + Duration::seconds(1)))
            .await
            .unwrap();

        let (_, commands) = store.session_detail("s1").await.unwrap().unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].command, "ls -la");
        assert_eq!(commands[0].category, CommandCategory::System);
        assert!(!commands[0].dangerous);
        assert_eq!(commands[1].command, "rm -rf /");
        assert!(commands[1].dangerous);
    }

    #[tokio::test]
    async fn attach_output_updates_once() {
        let store = AuditStore::in_memory().await.unwrap();
        store
            .insert_session(&session("s1", "10.0.0.1", Utc::now()))
            .await
            .unwrap();
        store
            .insert_command(&command("c1", "s1", "pwd", Utc::now()))
            .await
            .unwrap();

        store.attach_output("c1", "/root\n", 120).await.unwrap();

        let (_, commands) = store.session_detail("s1").await.unwrap().unwrap();
        assert_eq!(commands[0].output, "/root\n");
        assert_eq!(commands[0].duration_ms, Some(120));
    }

    #[tokio::test]
    async fn host_filter_narrows_listing() {
        let store = AuditStore::in_memory().await.unwrap();
        store
            .insert_session(&session("s1", "10.0.0.1", Utc::now()))
            .await
            .unwrap();
        store
            .insert_session(&session("s2", "10.0.0.2", Utc::now()))
            .await
            .unwrap();

        let all = store.sessions_by_host(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = store.sessions_by_host(Some("10.0.0.2")).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "s2");
    }

    #[tokio::test]
    async fn unknown_session_detail_is_none() {
        let store = AuditStore::in_memory().await.unwrap();
        assert!(store.session_detail("nope").await.unwrap().is_none());
    }
}
