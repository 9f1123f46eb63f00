mod error;
mod filter;
mod memory_store;
mod models;
mod schema;
mod store;
mod trait_def;

pub use error::{CatalogError, CatalogResult};
pub use filter::{
    CatalogFilter, DateColumn, DateRange, Filterable, FlagColumn, Page, PageRequest, Predicate,
    SqlParam, SqlPredicate, TextColumn, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
pub use memory_store::MemoryCatalogStore;
pub use models::*;
pub use schema::CATALOG_VERSIONED_SCHEMAS;
pub use store::SqliteCatalogStore;
pub use trait_def::{in_transaction, CatalogStore, CatalogTransaction, TransactionWork};
