//! In-memory catalog store used by tests and throwaway runs.
//!
//! A transaction works on a copy of the whole state, which replaces the live state
//! only when the work succeeds. The state lock is held for the duration of the
//! transaction, so writers are serialized the same way `BEGIN IMMEDIATE` does.

use super::error::{CatalogError, CatalogResult};
use super::filter::{Page, PageRequest, Predicate};
use super::models::{Datasource, DatasourceField, EntityType, Template, TemplateField};
use super::trait_def::{CatalogStore, CatalogTransaction, TransactionWork};
use crate::change_events::{
    unix_millis_now, NewChangeEvent, OutboxCounts, OutboxRecord, OutboxStatus, OutboxStore,
    RequeueOutcome,
};
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Clone, Debug, Default)]
struct MemoryState {
    /// Insertion order is listing order.
    datasources: Vec<Datasource>,
    templates: Vec<Template>,
    outbox: Vec<OutboxRecord>,
    last_seq: i64,
}

#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<MemoryState>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CatalogResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| CatalogError::Store(anyhow::anyhow!("Memory catalog lock poisoned")))
    }

    fn with_record<F>(&self, seq: i64, update: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut OutboxRecord),
    {
        let mut state = self.lock()?;
        if let Some(record) = state.outbox.iter_mut().find(|r| r.seq == seq) {
            update(record);
        }
        Ok(())
    }
}

fn check_version(
    entity_type: EntityType,
    id: Uuid,
    expected: u64,
    actual: u64,
) -> CatalogResult<()> {
    if expected != actual {
        return Err(CatalogError::Conflict {
            entity_type,
            id,
            expected,
            actual,
        });
    }
    Ok(())
}

impl CatalogStore for MemoryCatalogStore {
    fn get_datasource(&self, id: Uuid) -> CatalogResult<Option<Datasource>> {
        Ok(self.lock()?.datasources.iter().find(|d| d.id == id).cloned())
    }

    fn list_datasources(
        &self,
        predicate: &Predicate,
        page: PageRequest,
    ) -> CatalogResult<Page<Datasource>> {
        let state = self.lock()?;
        let matches = state
            .datasources
            .iter()
            .filter(|d| predicate.matches(*d))
            .cloned()
            .collect();
        Ok(Page::from_matches(matches, page))
    }

    fn find_datasources_by_nombre(&self, nombre: &str) -> CatalogResult<Vec<Datasource>> {
        Ok(self
            .lock()?
            .datasources
            .iter()
            .filter(|d| d.nombre == nombre)
            .cloned()
            .collect())
    }

    fn get_template(&self, id: Uuid) -> CatalogResult<Option<Template>> {
        Ok(self.lock()?.templates.iter().find(|t| t.id == id).cloned())
    }

    fn list_templates(
        &self,
        predicate: &Predicate,
        page: PageRequest,
    ) -> CatalogResult<Page<Template>> {
        let state = self.lock()?;
        let matches = state
            .templates
            .iter()
            .filter(|t| predicate.matches(*t))
            .cloned()
            .collect();
        Ok(Page::from_matches(matches, page))
    }

    fn find_templates_by_nombre(&self, nombre: &str) -> CatalogResult<Vec<Template>> {
        Ok(self
            .lock()?
            .templates
            .iter()
            .filter(|t| t.nombre == nombre)
            .cloned()
            .collect())
    }

    fn run_in_transaction(&self, work: TransactionWork<'_>) -> CatalogResult<()> {
        let mut state = self.lock()?;
        let mut working = state.clone();
        work(&mut MemoryTransaction {
            state: &mut working,
        })?;
        *state = working;
        Ok(())
    }
}

struct MemoryTransaction<'a> {
    state: &'a mut MemoryState,
}

impl MemoryTransaction<'_> {
    fn datasource_mut(&mut self, id: Uuid) -> CatalogResult<&mut Datasource> {
        self.state
            .datasources
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| CatalogError::not_found(EntityType::Datasource, id))
    }

    fn template_mut(&mut self, id: Uuid) -> CatalogResult<&mut Template> {
        self.state
            .templates
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| CatalogError::not_found(EntityType::Template, id))
    }

    fn ensure_unique_id(&self, id: Uuid) -> CatalogResult<()> {
        let taken = self.state.datasources.iter().any(|d| {
            d.id == id || d.campos.iter().any(|f| f.id == id)
        }) || self
            .state
            .templates
            .iter()
            .any(|t| t.id == id || t.campos.iter().any(|f| f.id == id));
        if taken {
            return Err(CatalogError::Store(anyhow::anyhow!(
                "Duplicate catalog id {}",
                id
            )));
        }
        Ok(())
    }
}

impl CatalogTransaction for MemoryTransaction<'_> {
    fn get_datasource(&mut self, id: Uuid) -> CatalogResult<Option<Datasource>> {
        Ok(self.state.datasources.iter().find(|d| d.id == id).cloned())
    }

    fn insert_datasource(&mut self, datasource: &Datasource) -> CatalogResult<()> {
        self.ensure_unique_id(datasource.id)?;
        for field in &datasource.campos {
            self.ensure_unique_id(field.id)?;
        }
        self.state.datasources.push(datasource.clone());
        Ok(())
    }

    fn update_datasource(
        &mut self,
        datasource: &Datasource,
        expected_version: u64,
    ) -> CatalogResult<()> {
        let stored = self.datasource_mut(datasource.id)?;
        check_version(
            EntityType::Datasource,
            datasource.id,
            expected_version,
            stored.version,
        )?;
        let campos = std::mem::take(&mut stored.campos);
        let fecha_creacion = stored.fecha_creacion;
        *stored = Datasource {
            campos,
            fecha_creacion,
            ..datasource.clone()
        };
        Ok(())
    }

    fn touch_datasource(&mut self, id: Uuid, date: NaiveDate) -> CatalogResult<()> {
        self.datasource_mut(id)?.fecha_modificacion = date;
        Ok(())
    }

    fn delete_datasource(&mut self, id: Uuid) -> CatalogResult<usize> {
        let index = self
            .state
            .datasources
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| CatalogError::not_found(EntityType::Datasource, id))?;
        Ok(self.state.datasources.remove(index).campos.len())
    }

    fn insert_datasource_field(
        &mut self,
        datasource_id: Uuid,
        field: &DatasourceField,
    ) -> CatalogResult<()> {
        self.datasource_mut(datasource_id)?;
        self.ensure_unique_id(field.id)?;
        self.datasource_mut(datasource_id)?.campos.push(field.clone());
        Ok(())
    }

    fn update_datasource_field(
        &mut self,
        datasource_id: Uuid,
        field: &DatasourceField,
        expected_version: u64,
    ) -> CatalogResult<()> {
        let parent = self.datasource_mut(datasource_id).map_err(|_| {
            CatalogError::not_found(EntityType::DatasourceField, field.id)
        })?;
        let stored = parent
            .campos
            .iter_mut()
            .find(|f| f.id == field.id)
            .ok_or_else(|| CatalogError::not_found(EntityType::DatasourceField, field.id))?;
        check_version(
            EntityType::DatasourceField,
            field.id,
            expected_version,
            stored.version,
        )?;
        *stored = field.clone();
        Ok(())
    }

    fn delete_datasource_field(
        &mut self,
        datasource_id: Uuid,
        field_id: Uuid,
    ) -> CatalogResult<()> {
        let not_found = || CatalogError::not_found(EntityType::DatasourceField, field_id);
        let parent = self.datasource_mut(datasource_id).map_err(|_| not_found())?;
        let index = parent
            .campos
            .iter()
            .position(|f| f.id == field_id)
            .ok_or_else(not_found)?;
        parent.campos.remove(index);
        Ok(())
    }

    fn get_template(&mut self, id: Uuid) -> CatalogResult<Option<Template>> {
        Ok(self.state.templates.iter().find(|t| t.id == id).cloned())
    }

    fn insert_template(&mut self, template: &Template) -> CatalogResult<()> {
        self.ensure_unique_id(template.id)?;
        for field in &template.campos {
            self.ensure_unique_id(field.id)?;
        }
        self.state.templates.push(template.clone());
        Ok(())
    }

    fn update_template(&mut self, template: &Template, expected_version: u64) -> CatalogResult<()> {
        let stored = self.template_mut(template.id)?;
        check_version(
            EntityType::Template,
            template.id,
            expected_version,
            stored.version,
        )?;
        let campos = std::mem::take(&mut stored.campos);
        let fecha_creacion = stored.fecha_creacion;
        *stored = Template {
            campos,
            fecha_creacion,
            ..template.clone()
        };
        Ok(())
    }

    fn touch_template(&mut self, id: Uuid, date: NaiveDate) -> CatalogResult<()> {
        self.template_mut(id)?.fecha_modificacion = date;
        Ok(())
    }

    fn delete_template(&mut self, id: Uuid) -> CatalogResult<usize> {
        let index = self
            .state
            .templates
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| CatalogError::not_found(EntityType::Template, id))?;
        Ok(self.state.templates.remove(index).campos.len())
    }

    fn insert_template_field(
        &mut self,
        template_id: Uuid,
        field: &TemplateField,
    ) -> CatalogResult<()> {
        self.template_mut(template_id)?;
        self.ensure_unique_id(field.id)?;
        self.template_mut(template_id)?.campos.push(field.clone());
        Ok(())
    }

    fn update_template_field(
        &mut self,
        template_id: Uuid,
        field: &TemplateField,
        expected_version: u64,
    ) -> CatalogResult<()> {
        let parent = self
            .template_mut(template_id)
            .map_err(|_| CatalogError::not_found(EntityType::TemplateField, field.id))?;
        let stored = parent
            .campos
            .iter_mut()
            .find(|f| f.id == field.id)
            .ok_or_else(|| CatalogError::not_found(EntityType::TemplateField, field.id))?;
        check_version(
            EntityType::TemplateField,
            field.id,
            expected_version,
            stored.version,
        )?;
        *stored = field.clone();
        Ok(())
    }

    fn delete_template_field(&mut self, template_id: Uuid, field_id: Uuid) -> CatalogResult<()> {
        let not_found = || CatalogError::not_found(EntityType::TemplateField, field_id);
        let parent = self.template_mut(template_id).map_err(|_| not_found())?;
        let index = parent
            .campos
            .iter()
            .position(|f| f.id == field_id)
            .ok_or_else(not_found)?;
        parent.campos.remove(index);
        Ok(())
    }

    fn enqueue_event(&mut self, event: &NewChangeEvent) -> CatalogResult<()> {
        let record =
            OutboxRecord::from_new_event(self.state.last_seq + 1, event, unix_millis_now())?;
        self.state.last_seq = record.seq;
        self.state.outbox.push(record);
        Ok(())
    }
}

impl OutboxStore for MemoryCatalogStore {
    fn fetch_due(&self, now_ms: i64, limit: usize) -> anyhow::Result<Vec<OutboxRecord>> {
        let state = self.lock()?;
        let mut seen_partitions = HashSet::new();
        let mut due = Vec::new();
        for record in state.outbox.iter().filter(|r| r.status.is_undelivered()) {
            if due.len() >= limit {
                break;
            }
            // Only the first undelivered row of a partition is its head.
            if !seen_partitions.insert(record.partition_key.as_str()) {
                continue;
            }
            if record.next_attempt_at <= now_ms {
                due.push(record.clone());
            }
        }
        Ok(due)
    }

    fn mark_published(&self, seq: i64, now_ms: i64) -> anyhow::Result<()> {
        self.with_record(seq, |record| {
            record.status = OutboxStatus::Published;
            record.published_at = Some(now_ms);
            record.last_error = None;
        })
    }

    fn mark_retry(
        &self,
        seq: i64,
        attempts: u32,
        next_attempt_at: i64,
        error: &str,
        parked: bool,
    ) -> anyhow::Result<()> {
        self.with_record(seq, |record| {
            record.status = if parked {
                OutboxStatus::Parked
            } else {
                OutboxStatus::Pending
            };
            record.attempts = attempts;
            record.next_attempt_at = next_attempt_at;
            record.last_error = Some(error.to_string());
        })
    }

    fn mark_dead_letter(&self, seq: i64, attempts: u32, error: &str) -> anyhow::Result<()> {
        self.with_record(seq, |record| {
            record.status = OutboxStatus::DeadLetter;
            record.attempts = attempts;
            record.last_error = Some(error.to_string());
        })
    }

    fn list_dead_letters(&self, limit: usize) -> anyhow::Result<Vec<OutboxRecord>> {
        let state = self.lock()?;
        Ok(state
            .outbox
            .iter()
            .filter(|r| r.status == OutboxStatus::DeadLetter)
            .take(limit)
            .cloned()
            .collect())
    }

    fn requeue_dead_letter(&self, seq: i64, now_ms: i64) -> anyhow::Result<RequeueOutcome> {
        let mut state = self.lock()?;
        let Some(index) = state
            .outbox
            .iter()
            .position(|r| r.seq == seq && r.status == OutboxStatus::DeadLetter)
        else {
            return Ok(RequeueOutcome::NotDeadLetter);
        };

        let partition_key = &state.outbox[index].partition_key;
        let published_seq = state
            .outbox
            .iter()
            .filter(|r| {
                r.partition_key == *partition_key
                    && r.seq > seq
                    && r.status == OutboxStatus::Published
            })
            .map(|r| r.seq)
            .max();
        if let Some(published_seq) = published_seq {
            return Ok(RequeueOutcome::Superseded { published_seq });
        }

        let record = &mut state.outbox[index];
        record.status = OutboxStatus::Pending;
        record.attempts = 0;
        record.next_attempt_at = now_ms;
        Ok(RequeueOutcome::Requeued)
    }

    fn status_counts(&self) -> anyhow::Result<OutboxCounts> {
        let state = self.lock()?;
        let mut counts = OutboxCounts::default();
        for record in &state.outbox {
            counts.add(record.status, 1);
        }
        Ok(counts)
    }

    fn prune_published_before(&self, cutoff_ms: i64) -> anyhow::Result<usize> {
        let mut state = self.lock()?;
        let mut first_dead_letter: HashMap<String, i64> = HashMap::new();
        for record in state.outbox.iter().filter(|r| r.status == OutboxStatus::DeadLetter) {
            first_dead_letter
                .entry(record.partition_key.clone())
                .or_insert(record.seq);
        }

        let before = state.outbox.len();
        state.outbox.retain(|r| {
            let expired = r.status == OutboxStatus::Published
                && r.published_at.is_some_and(|at| at < cutoff_ms);
            let follows_dead_letter = first_dead_letter
                .get(&r.partition_key)
                .is_some_and(|&dead_seq| dead_seq < r.seq);
            !expired || follows_dead_letter
        });
        Ok(before - state.outbox.len())
    }

    fn partition_events(&self, partition_key: &str) -> anyhow::Result<Vec<OutboxRecord>> {
        let state = self.lock()?;
        Ok(state
            .outbox
            .iter()
            .filter(|r| r.partition_key == partition_key)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog_store::trait_def::in_transaction;
    use crate::catalog_store::FieldType;

    fn make_datasource(nombre: &str) -> Datasource {
        let today = NaiveDate::from_ymd_opt(2021, 3, 4).unwrap();
        Datasource {
            id: Uuid::new_v4(),
            nombre: nombre.to_string(),
            autor: "rlh".to_string(),
            activo: false,
            json: None,
            blockly: None,
            config: None,
            config_blockly: None,
            mapping: None,
            fecha_creacion: today,
            fecha_modificacion: today,
            version: 1,
            campos: vec![DatasourceField {
                id: Uuid::new_v4(),
                nombre: "rfc".to_string(),
                tipo: FieldType::Texto,
                validaciones: None,
                version: 1,
            }],
        }
    }

    #[test]
    fn test_failed_transaction_leaves_state_untouched() {
        let store = MemoryCatalogStore::new();
        let datasource = make_datasource("Clientes");

        let result: CatalogResult<()> = in_transaction(&store, |tx| {
            tx.insert_datasource(&datasource)?;
            tx.enqueue_event(&NewChangeEvent::created(
                EntityType::Datasource,
                datasource.id,
                datasource.id,
            ))?;
            Err(CatalogError::validation("boom"))
        });

        assert!(result.is_err());
        assert!(store.get_datasource(datasource.id).unwrap().is_none());
        assert_eq!(store.status_counts().unwrap(), OutboxCounts::default());
    }

    #[test]
    fn test_update_keeps_fields_and_creation_date() {
        let store = MemoryCatalogStore::new();
        let datasource = make_datasource("Clientes");
        in_transaction(&store, |tx| tx.insert_datasource(&datasource)).unwrap();

        let mut updated = datasource.clone();
        updated.campos.clear();
        updated.fecha_creacion = NaiveDate::from_ymd_opt(1999, 1, 1).unwrap();
        updated.nombre = "Clientes 2".to_string();
        updated.version = 2;
        in_transaction(&store, |tx| tx.update_datasource(&updated, 1)).unwrap();

        let loaded = store.get_datasource(datasource.id).unwrap().unwrap();
        assert_eq!(loaded.nombre, "Clientes 2");
        assert_eq!(loaded.campos, datasource.campos);
        assert_eq!(loaded.fecha_creacion, datasource.fecha_creacion);

        let err = in_transaction(&store, |tx| tx.update_datasource(&updated, 1)).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_fetch_due_skips_blocked_partition() {
        let store = MemoryCatalogStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        in_transaction(&store, |tx| {
            tx.enqueue_event(&NewChangeEvent::created(EntityType::Template, a, a))?;
            tx.enqueue_event(&NewChangeEvent::deleted(EntityType::Template, a, a, 2))?;
            tx.enqueue_event(&NewChangeEvent::created(EntityType::Template, b, b))
        })
        .unwrap();

        let now = unix_millis_now();
        store.mark_retry(1, 1, now + 10_000, "timeout", false).unwrap();

        let due = store.fetch_due(now, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].seq, 3);
    }

    #[test]
    fn test_requeue_refuses_dead_letter_followed_by_published_event() {
        let store = MemoryCatalogStore::new();
        let a = Uuid::new_v4();
        in_transaction(&store, |tx| {
            tx.enqueue_event(&NewChangeEvent::created(EntityType::Template, a, a))?;
            tx.enqueue_event(&NewChangeEvent::deleted(EntityType::Template, a, a, 2))
        })
        .unwrap();

        store.mark_dead_letter(1, 1, "rejected").unwrap();
        store.mark_published(2, 1_000).unwrap();

        let now = unix_millis_now();
        assert_eq!(
            store.requeue_dead_letter(1, now).unwrap(),
            RequeueOutcome::Superseded { published_seq: 2 }
        );
        assert_eq!(store.prune_published_before(2_000).unwrap(), 0);
        assert_eq!(
            store.requeue_dead_letter(2, now).unwrap(),
            RequeueOutcome::NotDeadLetter
        );
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let store = MemoryCatalogStore::new();
        let datasource = make_datasource("Clientes");
        in_transaction(&store, |tx| tx.insert_datasource(&datasource)).unwrap();
        assert!(in_transaction(&store, |tx| tx.insert_datasource(&datasource)).is_err());
    }
}
