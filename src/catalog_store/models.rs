//! Catalog entities, their child fields, and the payloads used to create and patch them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Enumerations
// =============================================================================

/// Kind of catalog entity, as named on the change-event envelope.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Datasource,
    Template,
    DatasourceField,
    TemplateField,
}

impl EntityType {
    pub fn to_db_str(&self) -> &'static str {
        match self {
            EntityType::Datasource => "DATASOURCE",
            EntityType::Template => "TEMPLATE",
            EntityType::DatasourceField => "DATASOURCE_FIELD",
            EntityType::TemplateField => "TEMPLATE_FIELD",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "DATASOURCE" => Some(EntityType::Datasource),
            "TEMPLATE" => Some(EntityType::Template),
            "DATASOURCE_FIELD" => Some(EntityType::DatasourceField),
            "TEMPLATE_FIELD" => Some(EntityType::TemplateField),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_db_str())
    }
}

/// Data type of a datasource or template field.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FieldType {
    Texto,
    Entero,
    Real,
    Fecha,
    #[serde(rename = "ERROR")]
    Error,
}

impl FieldType {
    pub fn to_db_str(&self) -> &'static str {
        match self {
            FieldType::Texto => "Texto",
            FieldType::Entero => "Entero",
            FieldType::Real => "Real",
            FieldType::Fecha => "Fecha",
            FieldType::Error => "ERROR",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "Texto" => Some(FieldType::Texto),
            "Entero" => Some(FieldType::Entero),
            "Real" => Some(FieldType::Real),
            "Fecha" => Some(FieldType::Fecha),
            "ERROR" => Some(FieldType::Error),
            _ => None,
        }
    }
}

/// Delivery channel of a template.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Destino {
    Email,
    Reporte,
    #[serde(rename = "SMS")]
    Sms,
    Web,
    Otro,
    NoDefinido,
}

impl Destino {
    pub fn to_db_str(&self) -> &'static str {
        match self {
            Destino::Email => "Email",
            Destino::Reporte => "Reporte",
            Destino::Sms => "SMS",
            Destino::Web => "Web",
            Destino::Otro => "Otro",
            Destino::NoDefinido => "NoDefinido",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "Email" => Some(Destino::Email),
            "Reporte" => Some(Destino::Reporte),
            "SMS" => Some(Destino::Sms),
            "Web" => Some(Destino::Web),
            "Otro" => Some(Destino::Otro),
            "NoDefinido" => Some(Destino::NoDefinido),
            _ => None,
        }
    }
}

// =============================================================================
// Entities
// =============================================================================

/// A data source definition used by templates and by the ingestor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datasource {
    pub id: Uuid,
    pub nombre: String,
    pub autor: String,
    pub activo: bool,
    pub json: Option<String>,
    pub blockly: Option<String>,
    pub config: Option<String>,
    pub config_blockly: Option<String>,
    pub mapping: Option<String>,
    pub fecha_creacion: NaiveDate,
    pub fecha_modificacion: NaiveDate,
    /// Row version, bumped on every committed update.
    pub version: u64,
    pub campos: Vec<DatasourceField>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceField {
    pub id: Uuid,
    pub nombre: String,
    pub tipo: FieldType,
    pub validaciones: Option<String>,
    pub version: u64,
}

/// A document template. The template body itself lives in the file repository.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: Uuid,
    pub nombre: String,
    pub file_repo: String,
    pub destino: Option<Destino>,
    pub json: Option<String>,
    pub blockly: Option<String>,
    pub autor: String,
    pub activo: bool,
    pub fecha_creacion: NaiveDate,
    pub fecha_modificacion: NaiveDate,
    pub version: u64,
    pub campos: Vec<TemplateField>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateField {
    pub id: Uuid,
    pub nombre: String,
    pub tipo: FieldType,
    pub valor_default: Option<String>,
    pub version: u64,
}

// =============================================================================
// Create payloads
// =============================================================================

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDatasource {
    pub nombre: String,
    pub autor: String,
    #[serde(default)]
    pub activo: bool,
    pub json: Option<String>,
    pub blockly: Option<String>,
    pub config: Option<String>,
    pub config_blockly: Option<String>,
    pub mapping: Option<String>,
    pub fecha_creacion: Option<NaiveDate>,
    #[serde(default)]
    pub campos: Vec<NewDatasourceField>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDatasourceField {
    pub nombre: String,
    pub tipo: FieldType,
    pub validaciones: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTemplate {
    pub nombre: String,
    #[serde(default)]
    pub file_repo: String,
    pub destino: Option<Destino>,
    pub json: Option<String>,
    pub blockly: Option<String>,
    pub autor: String,
    #[serde(default)]
    pub activo: bool,
    pub fecha_creacion: Option<NaiveDate>,
    #[serde(default)]
    pub campos: Vec<NewTemplateField>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTemplateField {
    pub nombre: String,
    pub tipo: FieldType,
    pub valor_default: Option<String>,
}

// =============================================================================
// Partial-update payloads
//
// `None` means "keep the current value". There is no way to send an explicit
// null; optional text blobs are cleared by sending an empty string.
// =============================================================================

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatasourcePatch {
    /// When present, the update fails with a conflict unless it matches the stored version.
    pub expected_version: Option<u64>,
    pub nombre: Option<String>,
    pub autor: Option<String>,
    pub activo: Option<bool>,
    pub json: Option<String>,
    pub blockly: Option<String>,
    pub config: Option<String>,
    pub config_blockly: Option<String>,
    pub mapping: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatasourceFieldPatch {
    pub expected_version: Option<u64>,
    pub nombre: Option<String>,
    pub tipo: Option<FieldType>,
    pub validaciones: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TemplatePatch {
    pub expected_version: Option<u64>,
    pub nombre: Option<String>,
    pub file_repo: Option<String>,
    pub destino: Option<Destino>,
    pub json: Option<String>,
    pub blockly: Option<String>,
    pub autor: Option<String>,
    pub activo: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TemplateFieldPatch {
    pub expected_version: Option<u64>,
    pub nombre: Option<String>,
    pub tipo: Option<FieldType>,
    pub valor_default: Option<String>,
}
