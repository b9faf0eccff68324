pub mod expire;
pub mod keys;
pub mod reply;
pub mod segment;
pub mod session;

pub use expire::{expire_after_now, expire_before_now, expire_key_if_needed, RETRY_CNT};
pub use segment::{LockMode, LockedDb, SegmentMgr};
pub use session::{ServerEntry, Session, SessionCtx};
