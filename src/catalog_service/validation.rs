//! Payload validation for catalog mutations.
//!
//! Every check runs before the transaction opens, so a rejected payload never
//! writes anything.

use crate::catalog_store::{
    CatalogError, CatalogResult, DatasourceFieldPatch, DatasourcePatch, NewDatasource,
    NewDatasourceField, NewTemplate, NewTemplateField, TemplateFieldPatch, TemplatePatch,
};
use chrono::NaiveDate;

fn require_text(field: &'static str, value: &str) -> CatalogResult<()> {
    if value.trim().is_empty() {
        return Err(CatalogError::validation(format!(
            "Field '{}' is required but was empty",
            field
        )));
    }
    Ok(())
}

fn require_present_text(field: &'static str, value: &Option<String>) -> CatalogResult<()> {
    match value {
        Some(value) => require_text(field, value),
        None => Ok(()),
    }
}

fn require_not_future(
    field: &'static str,
    date: Option<NaiveDate>,
    today: NaiveDate,
) -> CatalogResult<()> {
    match date {
        Some(date) if date > today => Err(CatalogError::validation(format!(
            "Field '{}' cannot be in the future, got {}",
            field, date
        ))),
        _ => Ok(()),
    }
}

pub fn validate_new_datasource(new: &NewDatasource, today: NaiveDate) -> CatalogResult<()> {
    require_text("nombre", &new.nombre)?;
    require_text("autor", &new.autor)?;
    require_not_future("fechaCreacion", new.fecha_creacion, today)?;
    for field in &new.campos {
        validate_new_datasource_field(field)?;
    }
    Ok(())
}

pub fn validate_new_datasource_field(new: &NewDatasourceField) -> CatalogResult<()> {
    require_text("campos.nombre", &new.nombre)
}

pub fn validate_datasource_patch(patch: &DatasourcePatch) -> CatalogResult<()> {
    require_present_text("nombre", &patch.nombre)?;
    require_present_text("autor", &patch.autor)
}

pub fn validate_datasource_field_patch(patch: &DatasourceFieldPatch) -> CatalogResult<()> {
    require_present_text("nombre", &patch.nombre)
}

pub fn validate_new_template(new: &NewTemplate, today: NaiveDate) -> CatalogResult<()> {
    require_text("nombre", &new.nombre)?;
    require_text("autor", &new.autor)?;
    require_not_future("fechaCreacion", new.fecha_creacion, today)?;
    for field in &new.campos {
        validate_new_template_field(field)?;
    }
    Ok(())
}

pub fn validate_new_template_field(new: &NewTemplateField) -> CatalogResult<()> {
    require_text("campos.nombre", &new.nombre)
}

pub fn validate_template_patch(patch: &TemplatePatch) -> CatalogResult<()> {
    require_present_text("nombre", &patch.nombre)?;
    require_present_text("autor", &patch.autor)
}

pub fn validate_template_field_patch(patch: &TemplateFieldPatch) -> CatalogResult<()> {
    require_present_text("nombre", &patch.nombre)
}
