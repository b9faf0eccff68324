pub mod config;
pub mod error;
pub mod types;

pub use error::{ErrorKind, ShrikeError, ShrikeResult};
pub use types::{now_millis, TxnId};
