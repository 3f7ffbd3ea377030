//! The connected-projects registry.
//!
//! - [`record`]: typed rows, PID sets, session ids and the line encoding
//! - [`store`]: the in-memory [`Registry`] and its file-backed [`RegistryStore`]

pub mod record;
pub mod store;

pub use record::{
    now_timestamp, CorruptLine, LegacyRecord, PidSet, RecordStatus, RegistryRecord, SessionId,
};
pub use store::{Registry, RegistryStore, COLUMN_HEADER, DEFAULT_HEADER};
