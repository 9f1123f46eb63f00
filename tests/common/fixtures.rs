//! Payload builders and a seeded catalog for end-to-end tests

use super::constants::*;
use chrono::NaiveDate;
use param_catalog_server::catalog_service::CatalogService;
use param_catalog_server::catalog_store::{
    Datasource, Destino, FieldType, NewDatasource, NewDatasourceField, NewTemplate,
    NewTemplateField, Template,
};

pub fn datasource_payload(nombre: &str) -> NewDatasource {
    NewDatasource {
        nombre: nombre.to_string(),
        autor: AUTHOR_1.to_string(),
        activo: true,
        json: Some(r#"{"source":"crm"}"#.to_string()),
        config: Some("timeout=30".to_string()),
        campos: vec![
            NewDatasourceField {
                nombre: "rfc".to_string(),
                tipo: FieldType::Texto,
                validaciones: Some("^[A-Z]{4}".to_string()),
            },
            NewDatasourceField {
                nombre: "saldo".to_string(),
                tipo: FieldType::Real,
                validaciones: None,
            },
        ],
        ..Default::default()
    }
}

pub fn template_payload(nombre: &str) -> NewTemplate {
    NewTemplate {
        nombre: nombre.to_string(),
        file_repo: format!("plantillas/{}.docx", nombre.to_lowercase()),
        destino: Some(Destino::Email),
        autor: AUTHOR_2.to_string(),
        campos: vec![NewTemplateField {
            nombre: "saludo".to_string(),
            tipo: FieldType::Texto,
            valor_default: Some("Estimado cliente".to_string()),
        }],
        ..Default::default()
    }
}

/// Datasources created on `fecha_creacion`, one per `(nombre, fecha)` pair.
pub fn seed_datasources(
    service: &CatalogService,
    entries: &[(&str, NaiveDate)],
) -> Vec<Datasource> {
    entries
        .iter()
        .map(|(nombre, fecha)| {
            service
                .create_datasource(NewDatasource {
                    fecha_creacion: Some(*fecha),
                    ..datasource_payload(nombre)
                })
                .unwrap()
        })
        .collect()
}

pub fn seed_templates(service: &CatalogService, entries: &[(&str, NaiveDate)]) -> Vec<Template> {
    entries
        .iter()
        .map(|(nombre, fecha)| {
            service
                .create_template(NewTemplate {
                    fecha_creacion: Some(*fecha),
                    ..template_payload(nombre)
                })
                .unwrap()
        })
        .collect()
}
