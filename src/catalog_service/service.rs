//! Catalog mutation service.
//!
//! Sole writer of the catalog. Each mutation validates its payload, writes the
//! entity and its change event in one store transaction, and wakes the outbox
//! publisher once the transaction has committed.

use super::merge::{
    merge_datasource, merge_datasource_field, merge_template, merge_template_field,
};
use super::validation::*;
use crate::catalog_store::{
    in_transaction, CatalogError, CatalogFilter, CatalogResult, CatalogStore, Datasource,
    DatasourceField, DatasourceFieldPatch, DatasourcePatch, EntityType, NewDatasource,
    NewDatasourceField, NewTemplate, NewTemplateField, Page, PageRequest, Template, TemplateField,
    TemplateFieldPatch, TemplatePatch,
};
use crate::change_events::NewChangeEvent;
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

/// Source of "today" for creation and modification dates.
pub type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

fn utc_today() -> NaiveDate {
    Utc::now().date_naive()
}

fn check_expected_version(
    entity_type: EntityType,
    id: Uuid,
    expected: Option<u64>,
    actual: u64,
) -> CatalogResult<()> {
    match expected {
        Some(expected) if expected != actual => Err(CatalogError::Conflict {
            entity_type,
            id,
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

pub struct CatalogService {
    store: Arc<dyn CatalogStore>,
    wakeup: Arc<Notify>,
    clock: Clock,
}

impl CatalogService {
    /// # Arguments
    /// * `store` - Backing catalog store
    /// * `wakeup` - Notified after every committed mutation (shared with the publisher)
    pub fn new(store: Arc<dyn CatalogStore>, wakeup: Arc<Notify>) -> Self {
        Self {
            store,
            wakeup,
            clock: Arc::new(utc_today),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn today(&self) -> NaiveDate {
        (self.clock)()
    }

    fn committed(&self) {
        self.wakeup.notify_one();
    }

    // =========================================================================
    // Datasources
    // =========================================================================

    pub fn get_datasource(&self, id: Uuid) -> CatalogResult<Option<Datasource>> {
        self.store.get_datasource(id)
    }

    pub fn list_datasources(
        &self,
        filter: &CatalogFilter,
        page: PageRequest,
    ) -> CatalogResult<Page<Datasource>> {
        self.store.list_datasources(&filter.predicate(), page)
    }

    pub fn find_datasources_by_nombre(&self, nombre: &str) -> CatalogResult<Vec<Datasource>> {
        self.store.find_datasources_by_nombre(nombre)
    }

    pub fn create_datasource(&self, new: NewDatasource) -> CatalogResult<Datasource> {
        let today = self.today();
        validate_new_datasource(&new, today)?;

        let datasource = Datasource {
            id: Uuid::new_v4(),
            nombre: new.nombre,
            autor: new.autor,
            activo: new.activo,
            json: new.json,
            blockly: new.blockly,
            config: new.config,
            config_blockly: new.config_blockly,
            mapping: new.mapping,
            fecha_creacion: new.fecha_creacion.unwrap_or(today),
            fecha_modificacion: today,
            version: 1,
            campos: new
                .campos
                .into_iter()
                .map(|field| DatasourceField {
                    id: Uuid::new_v4(),
                    nombre: field.nombre,
                    tipo: field.tipo,
                    validaciones: field.validaciones,
                    version: 1,
                })
                .collect(),
        };

        in_transaction(self.store.as_ref(), |tx| {
            tx.insert_datasource(&datasource)?;
            tx.enqueue_event(&NewChangeEvent::created(
                EntityType::Datasource,
                datasource.id,
                datasource.id,
            ))
        })?;
        self.committed();

        info!(
            "Created datasource {} '{}' with {} fields",
            datasource.id,
            datasource.nombre,
            datasource.campos.len()
        );
        Ok(datasource)
    }

    pub fn update_datasource(
        &self,
        id: Uuid,
        patch: DatasourcePatch,
    ) -> CatalogResult<Datasource> {
        validate_datasource_patch(&patch)?;
        let today = self.today();

        let (updated, changed) = in_transaction(self.store.as_ref(), |tx| {
            let current = tx
                .get_datasource(id)?
                .ok_or_else(|| CatalogError::not_found(EntityType::Datasource, id))?;
            check_expected_version(
                EntityType::Datasource,
                id,
                patch.expected_version,
                current.version,
            )?;

            let (merged, changed) = merge_datasource(&current, &patch, today);
            tx.update_datasource(&merged, current.version)?;
            tx.enqueue_event(&NewChangeEvent::updated(
                EntityType::Datasource,
                id,
                id,
                merged.version,
                changed.clone(),
            ))?;
            Ok((merged, changed))
        })?;
        self.committed();

        info!(
            "Updated datasource {} to v{} (changed: {:?})",
            id, updated.version, changed
        );
        Ok(updated)
    }

    /// Delete a datasource and all of its fields.
    pub fn delete_datasource(&self, id: Uuid) -> CatalogResult<()> {
        let removed_fields = in_transaction(self.store.as_ref(), |tx| {
            let current = tx
                .get_datasource(id)?
                .ok_or_else(|| CatalogError::not_found(EntityType::Datasource, id))?;
            let removed = tx.delete_datasource(id)?;
            tx.enqueue_event(&NewChangeEvent::deleted(
                EntityType::Datasource,
                id,
                id,
                current.version + 1,
            ))?;
            Ok(removed)
        })?;
        self.committed();

        info!(
            "Deleted datasource {} and {} of its fields",
            id, removed_fields
        );
        Ok(())
    }

    pub fn add_datasource_field(
        &self,
        datasource_id: Uuid,
        new: NewDatasourceField,
    ) -> CatalogResult<DatasourceField> {
        validate_new_datasource_field(&new)?;
        let today = self.today();
        let field = DatasourceField {
            id: Uuid::new_v4(),
            nombre: new.nombre,
            tipo: new.tipo,
            validaciones: new.validaciones,
            version: 1,
        };

        in_transaction(self.store.as_ref(), |tx| {
            let parent = tx
                .get_datasource(datasource_id)?
                .ok_or_else(|| CatalogError::not_found(EntityType::Datasource, datasource_id))?;
            tx.insert_datasource_field(datasource_id, &field)?;
            tx.touch_datasource(datasource_id, today.max(parent.fecha_creacion))?;
            tx.enqueue_event(&NewChangeEvent::created(
                EntityType::DatasourceField,
                field.id,
                datasource_id,
            ))
        })?;
        self.committed();

        debug!(
            "Added field {} '{}' to datasource {}",
            field.id, field.nombre, datasource_id
        );
        Ok(field)
    }

    pub fn update_datasource_field(
        &self,
        datasource_id: Uuid,
        field_id: Uuid,
        patch: DatasourceFieldPatch,
    ) -> CatalogResult<DatasourceField> {
        validate_datasource_field_patch(&patch)?;
        let today = self.today();

        let updated = in_transaction(self.store.as_ref(), |tx| {
            let parent = tx
                .get_datasource(datasource_id)?
                .ok_or_else(|| CatalogError::not_found(EntityType::Datasource, datasource_id))?;
            let current = parent
                .campos
                .into_iter()
                .find(|field| field.id == field_id)
                .ok_or_else(|| CatalogError::not_found(EntityType::DatasourceField, field_id))?;
            check_expected_version(
                EntityType::DatasourceField,
                field_id,
                patch.expected_version,
                current.version,
            )?;

            let (merged, changed) = merge_datasource_field(&current, &patch);
            tx.update_datasource_field(datasource_id, &merged, current.version)?;
            tx.touch_datasource(datasource_id, today.max(parent.fecha_creacion))?;
            tx.enqueue_event(&NewChangeEvent::updated(
                EntityType::DatasourceField,
                field_id,
                datasource_id,
                merged.version,
                changed,
            ))?;
            Ok(merged)
        })?;
        self.committed();

        debug!(
            "Updated field {} of datasource {} to v{}",
            field_id, datasource_id, updated.version
        );
        Ok(updated)
    }

    pub fn delete_datasource_field(
        &self,
        datasource_id: Uuid,
        field_id: Uuid,
    ) -> CatalogResult<()> {
        let today = self.today();

        in_transaction(self.store.as_ref(), |tx| {
            let parent = tx
                .get_datasource(datasource_id)?
                .ok_or_else(|| CatalogError::not_found(EntityType::Datasource, datasource_id))?;
            let current = parent
                .campos
                .iter()
                .find(|field| field.id == field_id)
                .ok_or_else(|| CatalogError::not_found(EntityType::DatasourceField, field_id))?;

            tx.delete_datasource_field(datasource_id, field_id)?;
            tx.touch_datasource(datasource_id, today.max(parent.fecha_creacion))?;
            tx.enqueue_event(&NewChangeEvent::deleted(
                EntityType::DatasourceField,
                field_id,
                datasource_id,
                current.version + 1,
            ))
        })?;
        self.committed();

        debug!("Deleted field {} of datasource {}", field_id, datasource_id);
        Ok(())
    }

    // =========================================================================
    // Templates
    // =========================================================================

    pub fn get_template(&self, id: Uuid) -> CatalogResult<Option<Template>> {
        self.store.get_template(id)
    }

    pub fn list_templates(
        &self,
        filter: &CatalogFilter,
        page: PageRequest,
    ) -> CatalogResult<Page<Template>> {
        self.store.list_templates(&filter.predicate(), page)
    }

    pub fn find_templates_by_nombre(&self, nombre: &str) -> CatalogResult<Vec<Template>> {
        self.store.find_templates_by_nombre(nombre)
    }

    pub fn create_template(&self, new: NewTemplate) -> CatalogResult<Template> {
        let today = self.today();
        validate_new_template(&new, today)?;

        let template = Template {
            id: Uuid::new_v4(),
            nombre: new.nombre,
            file_repo: new.file_repo,
            destino: new.destino,
            json: new.json,
            blockly: new.blockly,
            autor: new.autor,
            activo: new.activo,
            fecha_creacion: new.fecha_creacion.unwrap_or(today),
            fecha_modificacion: today,
            version: 1,
            campos: new
                .campos
                .into_iter()
                .map(|field| TemplateField {
                    id: Uuid::new_v4(),
                    nombre: field.nombre,
                    tipo: field.tipo,
                    valor_default: field.valor_default,
                    version: 1,
                })
                .collect(),
        };

        in_transaction(self.store.as_ref(), |tx| {
            tx.insert_template(&template)?;
            tx.enqueue_event(&NewChangeEvent::created(
                EntityType::Template,
                template.id,
                template.id,
            ))
        })?;
        self.committed();

        info!(
            "Created template {} '{}' with {} fields",
            template.id,
            template.nombre,
            template.campos.len()
        );
        Ok(template)
    }

    pub fn update_template(&self, id: Uuid, patch: TemplatePatch) -> CatalogResult<Template> {
        validate_template_patch(&patch)?;
        let today = self.today();

        let (updated, changed) = in_transaction(self.store.as_ref(), |tx| {
            let current = tx
                .get_template(id)?
                .ok_or_else(|| CatalogError::not_found(EntityType::Template, id))?;
            check_expected_version(
                EntityType::Template,
                id,
                patch.expected_version,
                current.version,
            )?;

            let (merged, changed) = merge_template(&current, &patch, today);
            tx.update_template(&merged, current.version)?;
            tx.enqueue_event(&NewChangeEvent::updated(
                EntityType::Template,
                id,
                id,
                merged.version,
                changed.clone(),
            ))?;
            Ok((merged, changed))
        })?;
        self.committed();

        info!(
            "Updated template {} to v{} (changed: {:?})",
            id, updated.version, changed
        );
        Ok(updated)
    }

    /// Delete a template and all of its fields.
    pub fn delete_template(&self, id: Uuid) -> CatalogResult<()> {
        let removed_fields = in_transaction(self.store.as_ref(), |tx| {
            let current = tx
                .get_template(id)?
                .ok_or_else(|| CatalogError::not_found(EntityType::Template, id))?;
            let removed = tx.delete_template(id)?;
            tx.enqueue_event(&NewChangeEvent::deleted(
                EntityType::Template,
                id,
                id,
                current.version + 1,
            ))?;
            Ok(removed)
        })?;
        self.committed();

        info!("Deleted template {} and {} of its fields", id, removed_fields);
        Ok(())
    }

    pub fn add_template_field(
        &self,
        template_id: Uuid,
        new: NewTemplateField,
    ) -> CatalogResult<TemplateField> {
        validate_new_template_field(&new)?;
        let today = self.today();
        let field = TemplateField {
            id: Uuid::new_v4(),
            nombre: new.nombre,
            tipo: new.tipo,
            valor_default: new.valor_default,
            version: 1,
        };

        in_transaction(self.store.as_ref(), |tx| {
            let parent = tx
                .get_template(template_id)?
                .ok_or_else(|| CatalogError::not_found(EntityType::Template, template_id))?;
            tx.insert_template_field(template_id, &field)?;
            tx.touch_template(template_id, today.max(parent.fecha_creacion))?;
            tx.enqueue_event(&NewChangeEvent::created(
                EntityType::TemplateField,
                field.id,
                template_id,
            ))
        })?;
        self.committed();

        debug!(
            "Added field {} '{}' to template {}",
            field.id, field.nombre, template_id
        );
        Ok(field)
    }

    pub fn update_template_field(
        &self,
        template_id: Uuid,
        field_id: Uuid,
        patch: TemplateFieldPatch,
    ) -> CatalogResult<TemplateField> {
        validate_template_field_patch(&patch)?;
        let today = self.today();

        let updated = in_transaction(self.store.as_ref(), |tx| {
            let parent = tx
                .get_template(template_id)?
                .ok_or_else(|| CatalogError::not_found(EntityType::Template, template_id))?;
            let current = parent
                .campos
                .into_iter()
                .find(|field| field.id == field_id)
                .ok_or_else(|| CatalogError::not_found(EntityType::TemplateField, field_id))?;
            check_expected_version(
                EntityType::TemplateField,
                field_id,
                patch.expected_version,
                current.version,
            )?;

            let (merged, changed) = merge_template_field(&current, &patch);
            tx.update_template_field(template_id, &merged, current.version)?;
            tx.touch_template(template_id, today.max(parent.fecha_creacion))?;
            tx.enqueue_event(&NewChangeEvent::updated(
                EntityType::TemplateField,
                field_id,
                template_id,
                merged.version,
                changed,
            ))?;
            Ok(merged)
        })?;
        self.committed();

        debug!(
            "Updated field {} of template {} to v{}",
            field_id, template_id, updated.version
        );
        Ok(updated)
    }

    pub fn delete_template_field(&self, template_id: Uuid, field_id: Uuid) -> CatalogResult<()> {
        let today = self.today();

        in_transaction(self.store.as_ref(), |tx| {
            let parent = tx
                .get_template(template_id)?
                .ok_or_else(|| CatalogError::not_found(EntityType::Template, template_id))?;
            let current = parent
                .campos
                .iter()
                .find(|field| field.id == field_id)
                .ok_or_else(|| CatalogError::not_found(EntityType::TemplateField, field_id))?;

            tx.delete_template_field(template_id, field_id)?;
            tx.touch_template(template_id, today.max(parent.fecha_creacion))?;
            tx.enqueue_event(&NewChangeEvent::deleted(
                EntityType::TemplateField,
                field_id,
                template_id,
                current.version + 1,
            ))
        })?;
        self.committed();

        debug!("Deleted field {} of template {}", field_id, template_id);
        Ok(())
    }
}
