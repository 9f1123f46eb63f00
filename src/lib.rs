pub mod catalog_service;
pub mod catalog_store;
pub mod change_events;
pub mod config;
pub mod sqlite_persistence;
