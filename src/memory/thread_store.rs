//! 会话存储抽象层
//!
//! ThreadStore 定义统一的会话接口（create / get / lease / append / set_active / checkpoint），
//! 支持内存与 SQLite 两种实现。
//!
//! 同一会话同一时刻只允许一个轮次：调用方先 `lease` 取得 TurnLease，所有写操作都必须出示租约；
//! 第二个 `lease` 立即失败为 Conflict。租约被 drop（包括持有它的 future 被取消）即释放。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::OrchestrationError;
use crate::memory::{new_thread_id, Message, MessageDraft, Thread, ThreadId, ThreadSnapshot};

/// 会话写租约：持有期间其他轮次无法写入该会话
#[derive(Debug)]
pub struct TurnLease {
    thread_id: ThreadId,
    held: Arc<StdMutex<HashSet<ThreadId>>>,
}

impl TurnLease {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

impl Drop for TurnLease {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.thread_id);
    }
}

/// 当前被租用的会话 ID 集合；租约释放时移除对应条目
#[derive(Debug, Default)]
pub struct ThreadLocks {
    held: Arc<StdMutex<HashSet<ThreadId>>>,
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试获取租约；已被占用时立即返回 Conflict，不等待
    pub fn try_acquire(&self, thread_id: &str) -> Result<TurnLease, OrchestrationError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(thread_id.to_string()) {
            return Err(OrchestrationError::Conflict(thread_id.to_string()));
        }
        Ok(TurnLease {
            thread_id: thread_id.to_string(),
            held: Arc::clone(&self.held),
        })
    }

    #[cfg(test)]
    fn held(&self) -> usize {
        self.held.lock().map(|h| h.len()).unwrap_or(0)
    }
}

/// 会话存储接口
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// 创建一个新的空会话（active = true）
    async fn create(&self) -> Result<Thread, OrchestrationError>;

    /// 读取已有会话；不存在时返回 NotFound，从不自动创建
    async fn get(&self, thread_id: &str) -> Result<Thread, OrchestrationError>;

    /// 获取会话写租约
    async fn lease(&self, thread_id: &str) -> Result<TurnLease, OrchestrationError>;

    /// 原子追加一条消息，返回带 sequence 的消息
    async fn append(
        &self,
        lease: &TurnLease,
        draft: MessageDraft,
    ) -> Result<Message, OrchestrationError>;

    /// 设置会话的 active 标记
    async fn set_active(&self, lease: &TurnLease, active: bool) -> Result<(), OrchestrationError>;

    /// 当前时刻的只读快照
    async fn checkpoint(&self, thread_id: &str) -> Result<ThreadSnapshot, OrchestrationError>;
}

/// 内存会话存储
#[derive(Debug, Default)]
pub struct InMemoryThreadStore {
    threads: RwLock<HashMap<ThreadId, Thread>>,
    locks: ThreadLocks,
}

impl InMemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前会话数
    pub async fn len(&self) -> usize {
        self.threads.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.threads.read().await.is_empty()
    }
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn create(&self) -> Result<Thread, OrchestrationError> {
        let mut threads = self.threads.write().await;
        let mut id = new_thread_id();
        while threads.contains_key(&id) {
            id = new_thread_id();
        }
        let thread = Thread::new(id.clone());
        threads.insert(id, thread.clone());
        tracing::debug!(thread_id = %thread.id, "thread created");
        Ok(thread)
    }

    async fn get(&self, thread_id: &str) -> Result<Thread, OrchestrationError> {
        self.threads
            .read()
            .await
            .get(thread_id)
            .cloned()
            .ok_or_else(|| OrchestrationError::NotFound(thread_id.to_string()))
    }

    async fn lease(&self, thread_id: &str) -> Result<TurnLease, OrchestrationError> {
        if !self.threads.read().await.contains_key(thread_id) {
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
        let mut threads = self.threads.write().await;
        let thread = threads
            .get_mut(lease.thread_id())
            .ok_or_else(|| OrchestrationError::NotFound(lease.thread_id().to_string()))?;
        let msg = thread.push(draft);
        tracing::debug!(
            thread_id = %lease.thread_id(),
            sequence = msg.sequence,
            role = %msg.role,
            "message appended"
        );
        Ok(msg)
    }

    async fn set_active(&self, lease: &TurnLease, active: bool) -> Result<(), OrchestrationError> {
        let mut threads = self.threads.write().await;
        let thread = threads
            .get_mut(lease.thread_id())
            .ok_or_else(|| OrchestrationError::NotFound(lease.thread_id().to_string()))?;
        thread.active = active;
        Ok(())
    }

    async fn checkpoint(&self, thread_id: &str) -> Result<ThreadSnapshot, OrchestrationError> {
        self.threads
            .read()
            .await
            .get(thread_id)
            .map(Thread::snapshot)
            .ok_or_else(|| OrchestrationError::NotFound(thread_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InMemoryThreadStore::new();
        let t = store.create().await.unwrap();
        assert!(t.active);
        assert!(t.messages.is_empty());
        assert_eq!(store.get(&t.id).await.unwrap().id, t.id);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found_and_never_creates() {
        let store = InMemoryThreadStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert_eq!(err, OrchestrationError::NotFound("nope".to_string()));
        assert!(store.is_empty().await);
        assert!(matches!(
            store.lease("nope").await,
            Err(OrchestrationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_append_assigns_sequence() {
        let store = InMemoryThreadStore::new();
        let t = store.create().await.unwrap();
        let lease = store.lease(&t.id).await.unwrap();
        let a = store.append(&lease, MessageDraft::user("hi")).await.unwrap();
        let b = store
            .append(&lease, MessageDraft::handler_result("knowledge_handler", "ok"))
            .await
            .unwrap();
        assert_eq!((a.sequence, b.sequence), (0, 1));
        let snap = store.checkpoint(&t.id).await.unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.messages()[1].role, Role::HandlerResult);
    }

    #[tokio::test]
    async fn test_append_rejects_handler_result_without_origin() {
        let store = InMemoryThreadStore::new();
        let t = store.create().await.unwrap();
        let lease = store.lease(&t.id).await.unwrap();
        let mut draft = MessageDraft::handler_result("x", "ok");
        draft.origin = None;
        let err = store.append(&lease, draft).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidState(_)));
        assert!(store.get(&t.id).await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_second_lease_conflicts_until_released() {
        let store = InMemoryThreadStore::new();
        let t = store.create().await.unwrap();
        let lease = store.lease(&t.id).await.unwrap();
        assert_eq!(
            store.lease(&t.id).await.unwrap_err(),
            OrchestrationError::Conflict(t.id.clone())
        );
        drop(lease);
        assert!(store.lease(&t.id).await.is_ok());
    }

    #[test]
    fn test_released_leases_leave_no_entries() {
        let locks = ThreadLocks::new();
        for i in 0..100 {
            let lease = locks.try_acquire(&format!("t{}", i)).unwrap();
            assert_eq!(locks.held(), 1);
            drop(lease);
        }
        assert_eq!(locks.held(), 0);

        let a = locks.try_acquire("a").unwrap();
        assert!(locks.try_acquire("a").is_err());
        assert_eq!(locks.held(), 1);
        drop(a);
        assert_eq!(locks.held(), 0);
    }

    #[tokio::test]
    async fn test_leases_on_distinct_threads_are_independent() {
        let store = InMemoryThreadStore::new();
        let a = store.create().await.unwrap();
        let b = store.create().await.unwrap();
        let _la = store.lease(&a.id).await.unwrap();
        assert!(store.lease(&b.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_checkpoint_is_immutable_view() {
        let store = InMemoryThreadStore::new();
        let t = store.create().await.unwrap();
        let lease = store.lease(&t.id).await.unwrap();
        store.append(&lease, MessageDraft::user("one")).await.unwrap();
        let snap = store.checkpoint(&t.id).await.unwrap();
        store.append(&lease, MessageDraft::user("two")).await.unwrap();
        store.set_active(&lease, false).await.unwrap();
        assert_eq!(snap.len(), 1);
        assert!(snap.active);
        assert!(!store.get(&t.id).await.unwrap().active);
    }
}
