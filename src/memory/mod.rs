//! 记忆层：会话数据模型、会话存储（内存 / SQLite）

pub mod conversation;
#[cfg(feature = "async-sqlite")]
pub mod sqlite_store;
pub mod thread_store;

pub use conversation::{
    new_thread_id, Message, MessageDraft, Role, Thread, ThreadId, ThreadSnapshot,
    ROUTE_MARKER_PREFIX,
};
#[cfg(feature = "async-sqlite")]
pub use sqlite_store::SqliteThreadStore;
pub use thread_store::{InMemoryThreadStore, ThreadLocks, ThreadStore, TurnLease};
