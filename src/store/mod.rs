//! Persistence: job records and session records.

pub mod file;
pub mod sessions;
pub mod traits;

pub use file::FileJobStore;
pub use sessions::{Round, Session, SessionStore};
pub use traits::JobStore;
