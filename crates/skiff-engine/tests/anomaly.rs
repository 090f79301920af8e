//! Anomaly reconciliation service tests.

use tempfile::TempDir;

use skiff_core::anomaly::{
    AnomalyArchive, AnomalyFind, AnomalySeverity, AnomalyType, AnomalyUpsert, RowStatus,
};
use skiff_core::config::StoreConfig;
use skiff_core::error::SkiffError;
use skiff_engine::{AnomalyService, MetadataStore};

async fn open_service(dir: &TempDir) -> (MetadataStore, AnomalyService) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = StoreConfig {
        path: dir
            .path()
            .join("metadata.db")
            .to_str()
            .unwrap()
            .to_string(),
        ..Default::default()
    };
    let store = MetadataStore::from_config(&config).await.unwrap();
    let service = AnomalyService::new(store.pool().clone());
    (store, service)
}

fn upsert(database: Option<&str>, anomaly_type: AnomalyType, payload: &str) -> AnomalyUpsert {
    AnomalyUpsert {
        creator: "reconciler".to_string(),
        instance: "prod-1".to_string(),
        database: database.map(str::to_string),
        anomaly_type,
        payload: payload.to_string(),
    }
}

#[tokio::test]
async fn store_bootstrap_and_health_check() {
    let dir = TempDir::new().unwrap();
    let (store, _) = open_service(&dir).await;
    store.health_check().await.unwrap();
    store.close().await;
}

#[tokio::test]
async fn repeated_upsert_patches_in_place() {
    let dir = TempDir::new().unwrap();
    let (_store, service) = open_service(&dir).await;

    let first = service
        .upsert_active(&upsert(
            Some("shop"),
            AnomalyType::DatabaseSchemaDrift,
            r#"{"expect":"v1"}"#,
        ))
        .await
        .unwrap();
    let second = service
        .upsert_active(&upsert(
            Some("shop"),
            AnomalyType::DatabaseSchemaDrift,
            r#"{"expect":"v2"}"#,
        ))
        .await
        .unwrap();

    assert_eq!(first.id, second.id, "repeated detection must keep its id");
    assert_eq!(second.payload, r#"{"expect":"v2"}"#);
    assert_eq!(second.row_status, RowStatus::Normal);

    let all = service.find(&AnomalyFind::default()).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn instance_and_database_scopes_are_distinct() {
    let dir = TempDir::new().unwrap();
    let (_store, service) = open_service(&dir).await;

    let instance_scoped = service
        .upsert_active(&upsert(None, AnomalyType::InstanceMigrationSchema, "{}"))
        .await
        .unwrap();
    let database_scoped = service
        .upsert_active(&upsert(
            Some("shop"),
            AnomalyType::InstanceMigrationSchema,
            "{}",
        ))
        .await
        .unwrap();
    assert_ne!(instance_scoped.id, database_scoped.id);

    // instance_only matches NULL-database rows exclusively.
    let found = service
        .find(&AnomalyFind {
            instance: Some("prod-1".to_string()),
            instance_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, instance_scoped.id);
    assert_eq!(found[0].database, None);
}

#[tokio::test]
async fn database_filter_applies_without_an_instance_filter() {
    let dir = TempDir::new().unwrap();
    let (_store, service) = open_service(&dir).await;

    service
        .upsert_active(&upsert(Some("shop"), AnomalyType::DatabaseSchemaDrift, "{}"))
        .await
        .unwrap();
    service
        .upsert_active(&upsert(
            Some("billing"),
            AnomalyType::DatabaseSchemaDrift,
            "{}",
        ))
        .await
        .unwrap();

    // instance_only only narrows an instance filter; with no instance set
    // the database filter must still take effect.
    let found = service
        .find(&AnomalyFind {
            database: Some("shop".to_string()),
            instance_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].database.as_deref(), Some("shop"));
}

#[tokio::test]
async fn severity_is_derived_on_every_record() {
    let dir = TempDir::new().unwrap();
    let (_store, service) = open_service(&dir).await;

    let critical = service
        .upsert_active(&upsert(None, AnomalyType::InstanceConnection, "{}"))
        .await
        .unwrap();
    assert_eq!(critical.severity, AnomalySeverity::Critical);

    let high = service
        .upsert_active(&upsert(
            Some("shop"),
            AnomalyType::DatabaseSchemaDrift,
            "{}",
        ))
        .await
        .unwrap();
    assert_eq!(high.severity, AnomalySeverity::High);

    let medium = service
        .upsert_active(&upsert(None, AnomalyType::InstanceMigrationSchema, "{}"))
        .await
        .unwrap();
    assert_eq!(medium.severity, AnomalySeverity::Medium);
}

#[tokio::test]
async fn duplicate_active_rows_surface_as_conflict() {
    let dir = TempDir::new().unwrap();
    let (store, service) = open_service(&dir).await;

    // Two NORMAL rows for the same triple, inserted behind the service's back.
    for _ in 0..2 {
        sqlx::query(
            "INSERT INTO skiff_anomaly (row_status, creator, created_ts, updater, \
             updated_ts, instance, database_name, type, payload) \
             VALUES ('NORMAL', 'x', 0, 'x', 0, 'prod-1', 'shop', 'DATABASE_SCHEMA_DRIFT', '{}')",
        )
        .execute(store.pool())
        .await
        .unwrap();
    }

    let err = service
        .upsert_active(&upsert(
            Some("shop"),
            AnomalyType::DatabaseSchemaDrift,
            "{}",
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SkiffError::Conflict(_)));
}

#[tokio::test]
async fn archive_requires_exactly_one_scope() {
    let dir = TempDir::new().unwrap();
    let (_store, service) = open_service(&dir).await;

    let both = AnomalyArchive {
        updater: "reconciler".to_string(),
        instance: Some("prod-1".to_string()),
        database: Some("shop".to_string()),
        anomaly_type: AnomalyType::DatabaseConnection,
    };
    assert!(matches!(
        service.archive(&both).await,
        Err(SkiffError::Internal(_))
    ));

    let neither = AnomalyArchive {
        updater: "reconciler".to_string(),
        instance: None,
        database: None,
        anomaly_type: AnomalyType::DatabaseConnection,
    };
    assert!(matches!(
        service.archive(&neither).await,
        Err(SkiffError::Internal(_))
    ));
}

#[tokio::test]
async fn archive_resolves_active_rows() {
    let dir = TempDir::new().unwrap();
    let (_store, service) = open_service(&dir).await;

    let record = service
        .upsert_active(&upsert(
            Some("shop"),
            AnomalyType::DatabaseBackupMissing,
            "{}",
        ))
        .await
        .unwrap();

    service
        .archive(&AnomalyArchive {
            updater: "operator".to_string(),
            instance: None,
            database: Some("shop".to_string()),
            anomaly_type: AnomalyType::DatabaseBackupMissing,
        })
        .await
        .unwrap();

    let active = service
        .find(&AnomalyFind {
            row_status: Some(RowStatus::Normal),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(active.is_empty());

    let archived = service
        .find(&AnomalyFind {
            row_status: Some(RowStatus::Archived),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].id, record.id);
    assert_eq!(archived[0].updater, "operator");
}

#[tokio::test]
async fn archive_without_matching_rows_is_not_found() {
    let dir = TempDir::new().unwrap();
    let (_store, service) = open_service(&dir).await;

    let err = service
        .archive(&AnomalyArchive {
            updater: "operator".to_string(),
            instance: Some("prod-1".to_string()),
            database: None,
            anomaly_type: AnomalyType::InstanceConnection,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SkiffError::NotFound(_)));
}

#[tokio::test]
async fn upsert_after_archive_opens_a_new_anomaly() {
    let dir = TempDir::new().unwrap();
    let (_store, service) = open_service(&dir).await;

    let first = service
        .upsert_active(&upsert(
            Some("shop"),
            AnomalyType::DatabaseConnection,
            "{}",
        ))
        .await
        .unwrap();
    service
        .archive(&AnomalyArchive {
            updater: "operator".to_string(),
            instance: None,
            database: Some("shop".to_string()),
            anomaly_type: AnomalyType::DatabaseConnection,
        })
        .await
        .unwrap();

    let reopened = service
        .upsert_active(&upsert(
            Some("shop"),
            AnomalyType::DatabaseConnection,
            "{}",
        ))
        .await
        .unwrap();
    assert_ne!(first.id, reopened.id, "archived rows are history, not slots");

    // Both generations are visible when no row_status filter is given.
    let all = service
        .find(&AnomalyFind {
            database: Some("shop".to_string()),
            anomaly_type: Some(AnomalyType::DatabaseConnection),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
}
