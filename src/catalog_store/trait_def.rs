//! CatalogStore trait definition.
//!
//! Reads go straight to the store. Every write happens inside
//! [`CatalogStore::run_in_transaction`], where entity rows and their outbox events
//! commit or roll back together.

use super::error::{CatalogError, CatalogResult};
use super::filter::{Page, PageRequest, Predicate};
use super::models::{Datasource, DatasourceField, Template, TemplateField};
use crate::change_events::NewChangeEvent;
use chrono::NaiveDate;
use uuid::Uuid;

/// Unit of work run by [`CatalogStore::run_in_transaction`].
pub type TransactionWork<'a> =
    &'a mut dyn FnMut(&mut dyn CatalogTransaction) -> CatalogResult<()>;

/// Trait for catalog storage backends.
pub trait CatalogStore: Send + Sync {
    // =========================================================================
    // Reads
    // =========================================================================

    fn get_datasource(&self, id: Uuid) -> CatalogResult<Option<Datasource>>;

    /// Datasources matching `predicate` in insertion order.
    fn list_datasources(
        &self,
        predicate: &Predicate,
        page: PageRequest,
    ) -> CatalogResult<Page<Datasource>>;

    /// Datasources whose `nombre` is exactly `nombre`.
    fn find_datasources_by_nombre(&self, nombre: &str) -> CatalogResult<Vec<Datasource>>;

    fn get_template(&self, id: Uuid) -> CatalogResult<Option<Template>>;

    fn list_templates(
        &self,
        predicate: &Predicate,
        page: PageRequest,
    ) -> CatalogResult<Page<Template>>;

    fn find_templates_by_nombre(&self, nombre: &str) -> CatalogResult<Vec<Template>>;

    // =========================================================================
    // Writes
    // =========================================================================

    /// Run `work` atomically. Any error returned by `work` rolls back every write it
    /// made, outbox events included.
    fn run_in_transaction(&self, work: TransactionWork<'_>) -> CatalogResult<()>;
}

/// Write access inside one catalog transaction.
///
/// Parent updates only touch the parent row; fields are managed through the field
/// methods. Versioned updates fail with `CatalogError::Conflict` when the stored
/// version is not `expected_version`.
pub trait CatalogTransaction {
    fn get_datasource(&mut self, id: Uuid) -> CatalogResult<Option<Datasource>>;

    /// Insert a datasource together with its `campos`, in order.
    fn insert_datasource(&mut self, datasource: &Datasource) -> CatalogResult<()>;

    fn update_datasource(
        &mut self,
        datasource: &Datasource,
        expected_version: u64,
    ) -> CatalogResult<()>;

    /// Set the modification date without changing the version.
    fn touch_datasource(&mut self, id: Uuid, date: NaiveDate) -> CatalogResult<()>;

    /// Delete a datasource and all of its fields. Returns the number of fields removed.
    fn delete_datasource(&mut self, id: Uuid) -> CatalogResult<usize>;

    /// Append a field after the parent's existing fields.
    fn insert_datasource_field(
        &mut self,
        datasource_id: Uuid,
        field: &DatasourceField,
    ) -> CatalogResult<()>;

    fn update_datasource_field(
        &mut self,
        datasource_id: Uuid,
        field: &DatasourceField,
        expected_version: u64,
    ) -> CatalogResult<()>;

    fn delete_datasource_field(&mut self, datasource_id: Uuid, field_id: Uuid)
        -> CatalogResult<()>;

    fn get_template(&mut self, id: Uuid) -> CatalogResult<Option<Template>>;

    fn insert_template(&mut self, template: &Template) -> CatalogResult<()>;

    fn update_template(&mut self, template: &Template, expected_version: u64)
        -> CatalogResult<()>;

    fn touch_template(&mut self, id: Uuid, date: NaiveDate) -> CatalogResult<()>;

    fn delete_template(&mut self, id: Uuid) -> CatalogResult<usize>;

    fn insert_template_field(
        &mut self,
        template_id: Uuid,
        field: &TemplateField,
    ) -> CatalogResult<()>;

    fn update_template_field(
        &mut self,
        template_id: Uuid,
        field: &TemplateField,
        expected_version: u64,
    ) -> CatalogResult<()>;

    fn delete_template_field(&mut self, template_id: Uuid, field_id: Uuid) -> CatalogResult<()>;

    /// Write a change event to the outbox as part of this transaction.
    fn enqueue_event(&mut self, event: &NewChangeEvent) -> CatalogResult<()>;
}

/// Run `f` in a transaction on `store` and return its output.
pub fn in_transaction<T, F>(store: &dyn CatalogStore, f: F) -> CatalogResult<T>
where
    F: FnOnce(&mut dyn CatalogTransaction) -> CatalogResult<T>,
{
    let mut f = Some(f);
    let mut output = None;
    store.run_in_transaction(&mut |tx: &mut dyn CatalogTransaction| {
        // A backend may only invoke the work once per call.
        let f = f.take().ok_or_else(|| {
            CatalogError::Store(anyhow::anyhow!("Transaction work invoked twice"))
        })?;
        output = Some(f(tx)?);
        Ok(())
    })?;
    output.ok_or_else(|| {
        CatalogError::Store(anyhow::anyhow!("Transaction committed without output"))
    })
}
