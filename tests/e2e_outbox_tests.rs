//! End-to-end tests for change event delivery
//!
//! Mutations go through the catalog service into the SQLite outbox; the publisher
//! drains it into a recording bus.

mod common;

use common::{datasource_payload, template_payload, TestCatalog};
use param_catalog_server::catalog_store::{
    DatasourceFieldPatch, DatasourcePatch, EntityType, FieldType, NewDatasourceField,
    TemplatePatch,
};
use param_catalog_server::change_events::{
    prune_published, unix_millis_now, ChangeOperation, OutboxPublisher, OutboxStatus, OutboxStore,
    PublishError, RequeueOutcome,
};
use param_catalog_server::config::PublisherSettings;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn transient(message: &str) -> PublishError {
    PublishError::Transient(message.to_string())
}

#[tokio::test]
async fn test_every_mutation_delivered_once_in_version_order() {
    let catalog = TestCatalog::new();
    let ds = catalog
        .service
        .create_datasource(datasource_payload("Clientes"))
        .unwrap();
    for i in 0..3 {
        catalog
            .service
            .update_datasource(
                ds.id,
                DatasourcePatch {
                    nombre: Some(format!("Clientes v{}", i + 2)),
                    ..Default::default()
                },
            )
            .unwrap();
    }
    catalog.service.delete_datasource(ds.id).unwrap();

    let counts = catalog.drain_until_idle().await;
    assert_eq!(counts.published, 5);
    assert_eq!(counts.dead_letter, 0);

    let delivered = catalog.bus.delivered_for(ds.id);
    let versions: Vec<_> = delivered.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    assert_eq!(delivered[0].operation, ChangeOperation::Created);
    assert_eq!(delivered[4].operation, ChangeOperation::Deleted);
}

#[tokio::test]
async fn test_field_events_share_the_parent_partition() {
    let catalog = TestCatalog::new();
    let ds = catalog
        .service
        .create_datasource(datasource_payload("Clientes"))
        .unwrap();
    let field = catalog
        .service
        .add_datasource_field(
            ds.id,
            NewDatasourceField {
                nombre: "correo".to_string(),
                tipo: FieldType::Texto,
                validaciones: None,
            },
        )
        .unwrap();
    catalog
        .service
        .update_datasource_field(
            ds.id,
            field.id,
            DatasourceFieldPatch {
                validaciones: Some("@".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    // A transient failure on the head holds back the whole partition
    catalog.bus.fail_next(transient("bus restarting"));
    catalog.drain_until_idle().await;

    let partition = ds.id.to_string();
    let delivered: Vec<_> = catalog
        .bus
        .delivered()
        .into_iter()
        .filter(|(key, _)| *key == partition)
        .map(|(_, envelope)| (envelope.entity_type, envelope.operation))
        .collect();
    assert_eq!(
        delivered,
        vec![
            (EntityType::Datasource, ChangeOperation::Created),
            (EntityType::DatasourceField, ChangeOperation::Created),
            (EntityType::DatasourceField, ChangeOperation::Updated),
        ]
    );
}

#[tokio::test]
async fn test_transient_failure_is_retried_then_delivered() {
    let catalog = TestCatalog::new();
    let template = catalog
        .service
        .create_template(template_payload("Aviso"))
        .unwrap();

    catalog.bus.fail_next(transient("connection reset"));
    catalog.bus.fail_next(transient("503 Service Unavailable"));

    let first = catalog.publisher.drain_round().await.unwrap();
    assert_eq!(first.retrying, 1);
    let records = catalog
        .store
        .partition_events(&template.id.to_string())
        .unwrap();
    let record = &records[0];
    assert_eq!(record.status, OutboxStatus::Pending);
    assert_eq!(record.attempts, 1);
    assert_eq!(
        record.last_error.as_deref(),
        Some("Transient publish failure: connection reset")
    );

    let counts = catalog.drain_until_idle().await;
    assert_eq!(counts.published, 1);
    assert_eq!(catalog.bus.attempts(), 3);
    assert_eq!(catalog.bus.delivered_for(template.id).len(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_park_then_redeliver() {
    let catalog = TestCatalog::with_settings(PublisherSettings {
        max_retries: 1,
        ..TestCatalog::fast_settings()
    });
    let template = catalog
        .service
        .create_template(template_payload("Aviso"))
        .unwrap();

    catalog.bus.fail_next(transient("down"));
    catalog.bus.fail_next(transient("still down"));

    catalog.publisher.drain_round().await.unwrap();
    let stats = catalog.publisher.drain_round().await.unwrap();
    assert_eq!(stats.parked, 1);
    assert_eq!(catalog.counts().parked, 1);

    catalog.drain_until_idle().await;
    assert_eq!(catalog.bus.delivered_for(template.id).len(), 1);
}

#[tokio::test]
async fn test_permanent_failure_dead_letters_without_blocking_others() {
    let catalog = TestCatalog::new();
    let rejected = catalog
        .service
        .create_datasource(datasource_payload("Malformado"))
        .unwrap();
    let healthy = catalog
        .service
        .create_datasource(datasource_payload("Clientes"))
        .unwrap();
    catalog.bus.reject_entity(rejected.id);

    let counts = catalog.drain_until_idle().await;
    assert_eq!(counts.dead_letter, 1);
    assert_eq!(counts.published, 1);
    assert_eq!(catalog.bus.delivered_for(healthy.id).len(), 1);

    let dead = catalog.store.list_dead_letters(10).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].entity_id, rejected.id.to_string());
    assert!(dead[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("rejected"));

    // Later events of the entity are not held back by the dead letter
    catalog
        .service
        .update_datasource(
            rejected.id,
            DatasourcePatch {
                nombre: Some("Corregido".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    let attempts_before = catalog.bus.attempts();
    catalog.drain_until_idle().await;
    assert_eq!(catalog.bus.attempts(), attempts_before + 1);
    assert_eq!(catalog.counts().dead_letter, 2);
}

#[tokio::test]
async fn test_requeued_dead_letter_is_redelivered() {
    let catalog = TestCatalog::new();
    let template = catalog
        .service
        .create_template(template_payload("Aviso"))
        .unwrap();
    catalog
        .bus
        .fail_next(PublishError::Permanent("422 Unprocessable Entity".to_string()));
    catalog.drain_until_idle().await;

    let seq = catalog.store.list_dead_letters(10).unwrap()[0].seq;
    assert_eq!(
        catalog
            .store
            .requeue_dead_letter(seq, unix_millis_now())
            .unwrap(),
        RequeueOutcome::Requeued
    );
    assert_eq!(
        catalog
            .store
            .requeue_dead_letter(seq, unix_millis_now())
            .unwrap(),
        RequeueOutcome::NotDeadLetter
    );

    let counts = catalog.drain_until_idle().await;
    assert_eq!(counts.published, 1);
    assert_eq!(counts.dead_letter, 0);
    assert_eq!(catalog.bus.delivered_for(template.id).len(), 1);
}

#[tokio::test]
async fn test_superseded_dead_letter_is_not_redelivered_out_of_order() {
    let catalog = TestCatalog::new();
    let template = catalog
        .service
        .create_template(template_payload("Aviso"))
        .unwrap();
    catalog
        .bus
        .fail_next(PublishError::Permanent("422 Unprocessable Entity".to_string()));
    catalog.drain_until_idle().await;
    let seq = catalog.store.list_dead_letters(10).unwrap()[0].seq;

    catalog
        .service
        .update_template(
            template.id,
            TemplatePatch {
                activo: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
    catalog.drain_until_idle().await;

    let outcome = catalog
        .store
        .requeue_dead_letter(seq, unix_millis_now())
        .unwrap();
    assert!(matches!(outcome, RequeueOutcome::Superseded { .. }));
    catalog.drain_until_idle().await;

    let versions: Vec<_> = catalog
        .bus
        .delivered_for(template.id)
        .iter()
        .map(|e| e.version)
        .collect();
    assert_eq!(versions, vec![2]);
    assert_eq!(catalog.counts().dead_letter, 1);
}

#[tokio::test]
async fn test_dead_letter_requeued_before_later_delivery_keeps_order() {
    let catalog = TestCatalog::new();
    let template = catalog
        .service
        .create_template(template_payload("Aviso"))
        .unwrap();
    catalog
        .bus
        .fail_next(PublishError::Permanent("422 Unprocessable Entity".to_string()));
    catalog.publisher.drain_round().await.unwrap();
    let seq = catalog.store.list_dead_letters(10).unwrap()[0].seq;

    // The update is committed but not delivered yet
    catalog
        .service
        .update_template(
            template.id,
            TemplatePatch {
                activo: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(
        catalog
            .store
            .requeue_dead_letter(seq, unix_millis_now())
            .unwrap(),
        RequeueOutcome::Requeued
    );
    catalog.drain_until_idle().await;

    let versions: Vec<_> = catalog
        .bus
        .delivered_for(template.id)
        .iter()
        .map(|e| e.version)
        .collect();
    assert_eq!(versions, vec![1, 2]);
}

#[tokio::test]
async fn test_running_publisher_is_woken_by_commits() {
    let mut settings = TestCatalog::fast_settings();
    // Long poll interval: delivery within the deadline requires the wakeup
    settings.poll_interval_ms = 60_000;
    let catalog = TestCatalog::with_settings(settings.clone());

    let shutdown = CancellationToken::new();
    let publisher = OutboxPublisher::new(
        catalog.store.clone(),
        catalog.bus.clone(),
        &settings,
        catalog.wakeup.clone(),
    );
    let handle = publisher.spawn(shutdown.clone());

    // Let the first empty round finish so the worker is waiting
    tokio::time::sleep(Duration::from_millis(50)).await;
    let template = catalog
        .service
        .create_template(template_payload("Aviso"))
        .unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !catalog.bus.delivered_for(template.id).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(delivered.is_ok(), "Publisher was not woken up");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_prune_removes_only_old_published_events() {
    let catalog = TestCatalog::new();
    let template = catalog
        .service
        .create_template(template_payload("Aviso"))
        .unwrap();
    catalog.drain_until_idle().await;
    catalog
        .service
        .update_template(
            template.id,
            TemplatePatch {
                activo: Some(true),
                ..Default::default()
            },
        )
        .unwrap();

    // Nothing is older than a day yet
    assert_eq!(
        prune_published(catalog.store.as_ref(), 1, unix_millis_now()).unwrap(),
        0
    );

    // Two days later, only the published row goes
    let later = unix_millis_now() + 2 * 24 * 60 * 60 * 1000;
    assert_eq!(
        prune_published(catalog.store.as_ref(), 1, later).unwrap(),
        1
    );
    let counts = catalog.counts();
    assert_eq!(counts.published, 0);
    assert_eq!(counts.pending, 1);
}
