//! SQLite 会话存储
//!
//! 使用 SQLite 持久化会话与消息，服务重启后可按 thread_id 继续对话。
//! (thread_id, sequence) 为主键，追加在事务内完成；数据库错误统一映射为可重试的 StoreUnavailable。

#![cfg(feature = "async-sqlite")]

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::core::OrchestrationError;
use crate::memory::thread_store::{ThreadLocks, ThreadStore, TurnLease};
use crate::memory::{new_thread_id, Message, MessageDraft, Role, Thread, ThreadSnapshot};

fn unavailable(e: sqlx::Error) -> OrchestrationError {
    tracing::error!("Thread store error: {}", e);
    OrchestrationError::StoreUnavailable(e.to_string())
}

/// 持久化会话存储
pub struct SqliteThreadStore {
    pool: SqlitePool,
    locks: ThreadLocks,
}

impl SqliteThreadStore {
    /// 打开（或创建）数据库文件并建表
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self {
            pool,
            locks: ThreadLocks::new(),
        };
        store.init_tables().await?;

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM threads")
            .fetch_one(&store.pool)
            .await?
            .get("n");
        if count > 0 {
            tracing::info!("Restored {} threads from database", count);
        }
        Ok(store)
    }

    /// 初始化数据库表
    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS threads (
                id TEXT PRIMARY KEY,
                active INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                thread_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                origin TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (thread_id, sequence),
                FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn exists(&self, thread_id: &str) -> Result<bool, OrchestrationError> {
        let row = sqlx::query("SELECT 1 FROM threads WHERE id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(row.is_some())
    }

    /// 按 sequence 顺序加载会话消息
    async fn load_messages(
        conn: &mut SqliteConnection,
        thread_id: &str,
    ) -> Result<Vec<Message>, OrchestrationError> {
        let rows = sqlx::query(
            "SELECT sequence, role, content, origin FROM messages
             WHERE thread_id = ? ORDER BY sequence ASC",
        )
        .bind(thread_id)
        .fetch_all(conn)
        .await
        .map_err(unavailable)?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let role_str: String = row.get("role");
            let role = Role::parse(&role_str).ok_or_else(|| {
                OrchestrationError::StoreUnavailable(format!("corrupt role '{}'", role_str))
            })?;
            let sequence: i64 = row.get("sequence");
            messages.push(Message {
                role,
                content: row.get("content"),
                origin: row.get("origin"),
                sequence: sequence as u64,
            });
        }
        Ok(messages)
    }
}

#[async_trait]
impl ThreadStore for SqliteThreadStore {
    async fn create(&self) -> Result<Thread, OrchestrationError> {
        let now = chrono::Utc::now().to_rfc3339();
        loop {
            let id = new_thread_id();
            let result = sqlx::query(
                "INSERT OR IGNORE INTO threads (id, active, created_at, updated_at) VALUES (?, 1, ?, ?)",
            )
            .bind(&id)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
            if result.rows_affected() == 1 {
                return Ok(Thread::new(id));
            }
        }
    }

    async fn get(&self, thread_id: &str) -> Result<Thread, OrchestrationError> {
        // 会话行与消息在同一个读事务中读取，得到一致的时间点视图
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let row = sqlx::query("SELECT active FROM threads WHERE id = ?")
            .bind(thread_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| OrchestrationError::NotFound(thread_id.to_string()))?;
        let active: i64 = row.get("active");
        let messages = Self::load_messages(&mut tx, thread_id).await?;
        tx.commit().await.map_err(unavailable)?;
        Ok(Thread {
            id: thread_id.to_string(),
            messages,
            active: active != 0,
        })
    }

    async fn lease(&self, thread_id: &str) -> Result<TurnLease, OrchestrationError> {
        if !self.exists(thread_id).await? {
            return Err(OrchestrationError::NotFound(thread_id.to_string()));
        }
        self.locks.try_acquire(thread_id)
    }

    async fn append(
        &self,
        lease: &TurnLease,
        draft: MessageDraft,
    ) -> Result<Message, OrchestrationError> {
        draft.validate().map_err(OrchestrationError::InvalidState)?;
        let thread_id = lease.thread_id();
        let now = chrono::Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let touched = sqlx::query("UPDATE threads SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(thread_id)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        if touched.rows_affected() == 0 {
            return Err(OrchestrationError::NotFound(thread_id.to_string()));
        }
        let next: i64 = sqlx::query(
            "SELECT COALESCE(MAX(sequence) + 1, 0) AS next FROM messages WHERE thread_id = ?",
        )
        .bind(thread_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(unavailable)?
        .get("next");

        sqlx::query(
            "INSERT INTO messages (thread_id, sequence, role, content, origin, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(thread_id)
        .bind(next)
        .bind(draft.role.as_str())
        .bind(&draft.content)
        .bind(&draft.origin)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;
        tx.commit().await.map_err(unavailable)?;

        tracing::debug!(thread_id = %thread_id, sequence = next, "message persisted");
        Ok(draft.into_message(next as u64))
    }

    async fn set_active(&self, lease: &TurnLease, active: bool) -> Result<(), OrchestrationError> {
        let result = sqlx::query("UPDATE threads SET active = ?, updated_at = ? WHERE id = ?")
            .bind(active as i64)
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(lease.thread_id())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        if result.rows_affected() == 0 {
            return Err(OrchestrationError::NotFound(lease.thread_id().to_string()));
        }
        Ok(())
    }

    async fn checkpoint(&self, thread_id: &str) -> Result<ThreadSnapshot, OrchestrationError> {
        Ok(self.get(thread_id).await?.snapshot())
    }
}
