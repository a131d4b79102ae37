//! Database layer for ecosync

mod change_log;
mod conflict_repository;
mod connection;
mod cursor_repository;
mod device_repository;
mod migrations;
mod receipt_repository;
mod record_repository;

pub use change_log::{ChangeLogRepository, SqliteChangeLog};
pub use conflict_repository::{ConflictRepository, SqliteConflictRepository};
pub use connection::Database;
pub use cursor_repository::{CursorRepository, SqliteCursorRepository};
pub use device_repository::{DeviceRepository, SqliteDeviceRepository};
pub use receipt_repository::{ReceiptRepository, SqliteReceiptRepository};
pub use record_repository::{RecordRepository, SqliteRecordRepository};
