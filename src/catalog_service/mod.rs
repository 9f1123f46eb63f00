mod merge;
mod service;
mod validation;

pub use service::{CatalogService, Clock};
