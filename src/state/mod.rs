//! Transaction record persistence
//!
//! Handles:
//! - The transaction record model and address normalization
//! - The record store contract with in-memory and PostgreSQL backends
//! - Bounded retention of history

mod manager;
mod record;
mod store;

pub use manager::PgRecordStore;
pub use record::{
    normalize_address, NetworkRef, SlotKey, TransactionRecord, TransferInfo, TxStatus,
};
pub use store::{
    MemoryRecordStore, NonceFilter, RecordFilter, RecordStore, RecordUpdate, StatusCounts,
};
