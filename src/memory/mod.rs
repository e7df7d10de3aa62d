//! # In-Memory Content Storage
//!
//! Backing structures of the volatile repository.
//!
//! ```text
//! EntryTable<K>
//! ├── RwLock<HashMap<K, Arc<AtomicEntry<K>>>>
//! │     └── AtomicEntry { key, value: Arc<RwLock<Vec<u8>>>, owners, len }
//! └── Arc<ContentBudget>   (max_bytes / max_count, shared with every entry)
//! ```
//!
//! - [`entry_table`]: the keyed table, its entries and the `EntryBorrow`
//!   ownership guard
//! - [`budget`]: lock-free byte and entry accounting with hard limits
//!
//! The table is generic over its key type. The volatile repository keys it by
//! claim identifier (`String`); tests and other callers may use any
//! `Eq + Hash + Clone` key.

mod budget;
mod entry_table;

pub use budget::{BudgetStats, ContentBudget};
pub use entry_table::{
    AtomicEntry, EntryBorrow, EntryTable, Removal, ValueReadGuard, ValueWriteGuard,
};
