//! Partial-update merging.
//!
//! A patch only overwrites the fields it carries. Each merge returns the camelCase
//! names of the fields whose value actually changed; those names end up in the
//! `changedFields` of the UPDATED event.

use crate::catalog_store::{
    Datasource, DatasourceField, DatasourceFieldPatch, DatasourcePatch, Template, TemplateField,
    TemplateFieldPatch, TemplatePatch,
};
use chrono::NaiveDate;

struct ChangeTracker {
    changed: Vec<String>,
}

impl ChangeTracker {
    fn new() -> Self {
        Self {
            changed: Vec::new(),
        }
    }

    fn set<T: PartialEq + Clone>(&mut self, name: &str, target: &mut T, value: &Option<T>) {
        if let Some(value) = value {
            if target != value {
                *target = value.clone();
                self.changed.push(name.to_string());
            }
        }
    }

    /// Like `set`, for optional fields. An empty string clears the field.
    fn set_blob(&mut self, name: &str, target: &mut Option<String>, value: &Option<String>) {
        if let Some(value) = value {
            let value = if value.is_empty() {
                None
            } else {
                Some(value.clone())
            };
            if *target != value {
                *target = value;
                self.changed.push(name.to_string());
            }
        }
    }

    fn set_optional<T: PartialEq + Clone>(
        &mut self,
        name: &str,
        target: &mut Option<T>,
        value: &Option<T>,
    ) {
        if value.is_some() && target != value {
            *target = value.clone();
            self.changed.push(name.to_string());
        }
    }

    fn finish(self) -> Vec<String> {
        self.changed
    }
}

pub fn merge_datasource(
    current: &Datasource,
    patch: &DatasourcePatch,
    today: NaiveDate,
) -> (Datasource, Vec<String>) {
    let mut merged = current.clone();
    let mut tracker = ChangeTracker::new();

    tracker.set("nombre", &mut merged.nombre, &patch.nombre);
    tracker.set("autor", &mut merged.autor, &patch.autor);
    tracker.set("activo", &mut merged.activo, &patch.activo);
    tracker.set_blob("json", &mut merged.json, &patch.json);
    tracker.set_blob("blockly", &mut merged.blockly, &patch.blockly);
    tracker.set_blob("config", &mut merged.config, &patch.config);
    tracker.set_blob("configBlockly", &mut merged.config_blockly, &patch.config_blockly);
    tracker.set_blob("mapping", &mut merged.mapping, &patch.mapping);
    // A modification never predates the creation date.
    tracker.set(
        "fechaModificacion",
        &mut merged.fecha_modificacion,
        &Some(today.max(current.fecha_creacion)),
    );

    merged.version = current.version + 1;
    (merged, tracker.finish())
}

pub fn merge_template(
    current: &Template,
    patch: &TemplatePatch,
    today: NaiveDate,
) -> (Template, Vec<String>) {
    let mut merged = current.clone();
    let mut tracker = ChangeTracker::new();

    tracker.set("nombre", &mut merged.nombre, &patch.nombre);
    tracker.set("fileRepo", &mut merged.file_repo, &patch.file_repo);
    tracker.set_optional("destino", &mut merged.destino, &patch.destino);
    tracker.set_blob("json", &mut merged.json, &patch.json);
    tracker.set_blob("blockly", &mut merged.blockly, &patch.blockly);
    tracker.set("autor", &mut merged.autor, &patch.autor);
    tracker.set("activo", &mut merged.activo, &patch.activo);
    tracker.set(
        "fechaModificacion",
        &mut merged.fecha_modificacion,
        &Some(today.max(current.fecha_creacion)),
    );

    merged.version = current.version + 1;
    (merged, tracker.finish())
}

pub fn merge_datasource_field(
    current: &DatasourceField,
    patch: &DatasourceFieldPatch,
) -> (DatasourceField, Vec<String>) {
    let mut merged = current.clone();
    let mut tracker = ChangeTracker::new();

    tracker.set("nombre", &mut merged.nombre, &patch.nombre);
    tracker.set("tipo", &mut merged.tipo, &patch.tipo);
    tracker.set_blob("validaciones", &mut merged.validaciones, &patch.validaciones);

    merged.version = current.version + 1;
    (merged, tracker.finish())
}

pub fn merge_template_field(
    current: &TemplateField,
    patch: &TemplateFieldPatch,
) -> (TemplateField, Vec<String>) {
    let mut merged = current.clone();
    let mut tracker = ChangeTracker::new();

    tracker.set("nombre", &mut merged.nombre, &patch.nombre);
    tracker.set("tipo", &mut merged.tipo, &patch.tipo);
    tracker.set_blob("valorDefault", &mut merged.valor_default, &patch.valor_default);

    merged.version = current.version + 1;
    (merged, tracker.finish())
}
