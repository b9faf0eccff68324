pub mod lsm;
pub mod record;
pub mod store;
pub mod txn;

pub use record::{seek_prefix, RecordKey, RecordType, RecordValue};
pub use store::{BackupInfo, KVStore};
pub use txn::{Cursor, Transaction};
