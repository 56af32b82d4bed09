use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ConversationId, MessageId};
use super::notify::{ChangeFeed, ChangeHub};
use super::types::{LogSnapshot, MessagePatch, MessageRecord, MessageRole, NewMessage};
use super::{BoxFuture, ConversationLog, unix_timestamp_millis};

/// Conversation log persisted in a sqlite database.
///
/// Change feeds only fire for writes made through this handle; writers in other processes
/// are picked up by the watcher's polling.
#[derive(Debug)]
pub struct SqliteLog {
    pool: SqlitePool,
    changes: ChangeHub,
}

impl SqliteLog {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single connection keeps `:memory:` databases alive and serializes writers.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "opened sqlite conversation log");
        Ok(Self {
            pool,
            changes: ChangeHub::default(),
        })
    }

    async fn append_inner(
        &self,
        conversation_id: &ConversationId,
        inputs: Vec<NewMessage>,
    ) -> StorageResult<Vec<MessageRecord>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "message-append-begin",
        })?;

        let cursor = sqlx::query_as::<_, CursorRow>(
            "SELECT COALESCE(MAX(seq), 0) AS seq, COALESCE(MAX(revision), 0) AS revision, COALESCE(MAX(created_at), 0) AS created_at FROM messages WHERE user_id = ? AND document_id = ?",
        )
        .bind(conversation_id.user_id())
        .bind(conversation_id.document_id())
        .fetch_one(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-append-cursor",
        })?;

        let created_at = u64_to_i64(unix_timestamp_millis(), "message-append-created-at")?
            .max(cursor.created_at);
        let mut seq = cursor.seq;
        let mut revision = cursor.revision;
        let mut records = Vec::with_capacity(inputs.len());

        for input in inputs {
            let message_id = MessageId::new_v7();
            seq += 1;
            revision += 1;

            sqlx::query(
                "INSERT INTO messages (id, user_id, document_id, seq, role, text, pending, failed, created_at, revision) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
            )
            .bind(message_id.to_string())
            .bind(conversation_id.user_id())
            .bind(conversation_id.document_id())
            .bind(seq)
            .bind(input.role.as_str())
            .bind(input.text.clone())
            .bind(input.pending)
            .bind(created_at)
            .bind(revision)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-insert",
            })?;

            records.push(MessageRecord {
                id: message_id,
                seq: i64_to_u64(seq, "message-append-seq")?,
                role: input.role,
                text: input.text,
                created_at_unix_millis: i64_to_u64(created_at, "message-append-created-at")?,
                pending: input.pending,
                failed: false,
                revision: i64_to_u64(revision, "message-append-revision")?,
            });
        }

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "message-append-commit",
        })?;

        if let Some(last) = records.last() {
            self.changes.publish(conversation_id, last.revision);
        }
        Ok(records)
    }

    async fn update_inner(
        &self,
        conversation_id: &ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> StorageResult<MessageRecord> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "message-update-begin",
        })?;

        let revision = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(revision), 0) + 1 FROM messages WHERE user_id = ? AND document_id = ?",
        )
        .bind(conversation_id.user_id())
        .bind(conversation_id.document_id())
        .fetch_one(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-update-next-revision",
        })?;

        let update_result = sqlx::query(
            "UPDATE messages SET text = COALESCE(?, text), pending = COALESCE(?, pending), failed = COALESCE(?, failed), revision = ? WHERE user_id = ? AND document_id = ? AND id = ?",
        )
        .bind(patch.text)
        .bind(patch.pending)
        .bind(patch.failed)
        .bind(revision)
        .bind(conversation_id.user_id())
        .bind(conversation_id.document_id())
        .bind(message_id.to_string())
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-update-apply",
        })?;

        if update_result.rows_affected() == 0 {
            return NotFoundSnafu {
                stage: "message-update-missing",
                entity: "message",
                id: message_id.to_string(),
            }
            .fail();
        }

        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT id, seq, role, text, pending, failed, created_at, revision FROM messages WHERE user_id = ? AND document_id = ? AND id = ?",
        )
        .bind(conversation_id.user_id())
        .bind(conversation_id.document_id())
        .bind(message_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-update-load",
        })?
        .context(NotFoundSnafu {
            stage: "message-update-load-missing",
            entity: "message",
            id: message_id.to_string(),
        })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "message-update-commit",
        })?;

        let record = message_row_to_record(row)?;
        self.changes.publish(conversation_id, record.revision);
        Ok(record)
    }

    async fn snapshot_inner(&self, conversation_id: &ConversationId) -> StorageResult<LogSnapshot> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "message-snapshot-begin",
        })?;

        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, seq, role, text, pending, failed, created_at, revision FROM messages WHERE user_id = ? AND document_id = ? ORDER BY created_at ASC, seq ASC",
        )
        .bind(conversation_id.user_id())
        .bind(conversation_id.document_id())
        .fetch_all(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-snapshot-query",
        })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "message-snapshot-commit",
        })?;

        let messages = rows
            .into_iter()
            .map(message_row_to_record)
            .collect::<StorageResult<Vec<_>>>()?;
        let revision = messages
            .iter()
            .map(|record| record.revision)
            .max()
            .unwrap_or(0);

        Ok(LogSnapshot {
            conversation_id: conversation_id.clone(),
            revision,
            messages,
        })
    }
}

impl ConversationLog for SqliteLog {
    fn append<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut records = self.append_inner(conversation_id, vec![input]).await?;
            records.pop().context(InvariantViolationSnafu {
                stage: "sqlite-append-single",
                details: "append produced no record".to_string(),
            })
        })
    }

    fn append_many<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        inputs: Vec<NewMessage>,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(self.append_inner(conversation_id, inputs))
    }

    fn update<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(self.update_inner(conversation_id, message_id, patch))
    }

    fn snapshot<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<LogSnapshot>> {
        Box::pin(self.snapshot_inner(conversation_id))
    }

    fn watch(&self, conversation_id: &ConversationId) -> StorageResult<ChangeFeed> {
        Ok(self.changes.subscribe(conversation_id))
    }
}

#[derive(Debug, FromRow)]
struct CursorRow {
    seq: i64,
    revision: i64,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    seq: i64,
    role: String,
    text: String,
    pending: bool,
    failed: bool,
    created_at: i64,
    revision: i64,
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        role: role_from_sql(&row.role)?,
        text: row.text,
        created_at_unix_millis: i64_to_u64(row.created_at, "message-row-created-at")?,
        pending: row.pending,
        failed: row.failed,
        revision: i64_to_u64(row.revision, "message-row-revision")?,
    })
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
