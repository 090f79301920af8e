//! Anomaly reconciliation.
//!
//! Out-of-band problem conditions (connectivity, drift) are tracked as
//! deduplicated active rows: at most one NORMAL row may exist per
//! (instance, database, type) triple. Rows are never deleted; resolution
//! archives them in place.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use skiff_core::anomaly::{
    AnomalyArchive, AnomalyFind, AnomalyRecord, AnomalySeverity, AnomalyType, AnomalyUpsert,
    RowStatus,
};
use skiff_core::error::{Result, SkiffError};

const ANOMALY_COLUMNS: &str = "id, row_status, creator, created_ts, updater, updated_ts, \
     instance, database_name, type, payload";

/// Service for managing anomalies over the metadata store.
pub struct AnomalyService {
    pool: SqlitePool,
}

impl AnomalyService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Update the existing active anomaly matching (instance, database,
    /// type), or create a new one. Patching preserves the original id so
    /// operators never see id gaps from repeated reports; the updated
    /// timestamp is refreshed even when the payload is unchanged.
    ///
    /// The find-then-create-or-patch sequence runs in one transaction so two
    /// concurrent reporters cannot both observe zero matches.
    pub async fn upsert_active(&self, upsert: &AnomalyUpsert) -> Result<AnomalyRecord> {
        let mut tx = self.pool.begin().await?;

        let find = AnomalyFind {
            row_status: Some(RowStatus::Normal),
            instance: Some(upsert.instance.clone()),
            database: upsert.database.clone(),
            anomaly_type: Some(upsert.anomaly_type),
            instance_only: upsert.database.is_none(),
        };
        let matches = find_anomalies(&mut tx, &find).await?;

        let record = match matches.len() {
            0 => create_anomaly(&mut tx, upsert).await?,
            1 => {
                patch_anomaly(&mut tx, matches[0].id, &upsert.creator, &upsert.payload).await?
            }
            n => {
                return Err(SkiffError::Conflict(format!(
                    "found {} active anomalies for instance {:?}, database {:?}, type {}, expect at most 1",
                    n, upsert.instance, upsert.database, upsert.anomaly_type
                )));
            }
        };

        tx.commit().await?;
        debug!(
            id = record.id,
            instance = %record.instance,
            anomaly_type = %record.anomaly_type,
            "upserted active anomaly"
        );
        Ok(record)
    }

    /// List anomalies matching the filter.
    pub async fn find(&self, find: &AnomalyFind) -> Result<Vec<AnomalyRecord>> {
        let mut conn = self.pool.acquire().await?;
        find_anomalies(&mut conn, find).await
    }

    /// Archive active anomalies of one type, scoped to either an instance or
    /// a database — exactly one of the two. Fails `NotFound` when nothing
    /// matched.
    pub async fn archive(&self, archive: &AnomalyArchive) -> Result<()> {
        let now = Utc::now().timestamp();
        let result = match (&archive.instance, &archive.database) {
            (Some(_), Some(_)) => {
                return Err(SkiffError::Internal(
                    "cannot archive anomaly: specify either instance or database, not both"
                        .to_string(),
                ));
            }
            (None, None) => {
                return Err(SkiffError::Internal(
                    "cannot archive anomaly: specify either instance or database".to_string(),
                ));
            }
            (Some(instance), None) => {
                sqlx::query(
                    "UPDATE skiff_anomaly SET row_status = 'ARCHIVED', updater = ?, updated_ts = ? \
                     WHERE instance = ? AND database_name IS NULL AND type = ? \
                     AND row_status = 'NORMAL'",
                )
                .bind(&archive.updater)
                .bind(now)
                .bind(instance)
                .bind(archive.anomaly_type.as_str())
                .execute(&self.pool)
                .await?
            }
            (None, Some(database)) => {
                sqlx::query(
                    "UPDATE skiff_anomaly SET row_status = 'ARCHIVED', updater = ?, updated_ts = ? \
                     WHERE database_name = ? AND type = ? AND row_status = 'NORMAL'",
                )
                .bind(&archive.updater)
                .bind(now)
                .bind(database)
                .bind(archive.anomaly_type.as_str())
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(SkiffError::NotFound(format!(
                "no active anomaly of type {} for instance {:?} / database {:?}",
                archive.anomaly_type, archive.instance, archive.database
            )));
        }
        Ok(())
    }
}

async fn find_anomalies(
    conn: &mut SqliteConnection,
    find: &AnomalyFind,
) -> Result<Vec<AnomalyRecord>> {
    let mut sql = format!("SELECT {} FROM skiff_anomaly WHERE 1 = 1", ANOMALY_COLUMNS);
    if find.row_status.is_some() {
        sql.push_str(" AND row_status = ?");
    }
    if find.instance.is_some() {
        sql.push_str(" AND instance = ?");
        if find.instance_only {
            sql.push_str(" AND database_name IS NULL");
        }
    }
    // instance_only narrows an instance filter to its NULL-database rows;
    // without an instance filter it has nothing to narrow, so the database
    // filter still applies.
    let apply_database =
        find.database.is_some() && (find.instance.is_none() || !find.instance_only);
    if apply_database {
        sql.push_str(" AND database_name = ?");
    }
    if find.anomaly_type.is_some() {
        sql.push_str(" AND type = ?");
    }
    sql.push_str(" ORDER BY id ASC");

    let mut query = sqlx::query(&sql);
    if let Some(status) = find.row_status {
        query = query.bind(status.as_str());
    }
    if let Some(instance) = &find.instance {
        query = query.bind(instance);
    }
    if apply_database {
        if let Some(database) = &find.database {
            query = query.bind(database);
        }
    }
    if let Some(anomaly_type) = find.anomaly_type {
        query = query.bind(anomaly_type.as_str());
    }

    let rows = query.fetch_all(&mut *conn).await?;
    rows.iter().map(anomaly_from_row).collect()
}

async fn create_anomaly(
    conn: &mut SqliteConnection,
    upsert: &AnomalyUpsert,
) -> Result<AnomalyRecord> {
    let now = Utc::now().timestamp();
    // Deliberately no ON CONFLICT upsert: it would burn autoincrement ids
    // and leave operator-visible gaps.
    let row = sqlx::query(&format!(
        "INSERT INTO skiff_anomaly (\
            row_status, creator, created_ts, updater, updated_ts, instance, \
            database_name, type, payload\
        ) VALUES ('NORMAL', ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {}",
        ANOMALY_COLUMNS
    ))
    .bind(&upsert.creator)
    .bind(now)
    .bind(&upsert.creator)
    .bind(now)
    .bind(&upsert.instance)
    .bind(upsert.database.as_deref())
    .bind(upsert.anomaly_type.as_str())
    .bind(&upsert.payload)
    .fetch_one(&mut *conn)
    .await?;
    anomaly_from_row(&row)
}

async fn patch_anomaly(
    conn: &mut SqliteConnection,
    id: i64,
    updater: &str,
    payload: &str,
) -> Result<AnomalyRecord> {
    let row = sqlx::query(&format!(
        "UPDATE skiff_anomaly SET updater = ?, updated_ts = ?, payload = ? \
         WHERE id = ? RETURNING {}",
        ANOMALY_COLUMNS
    ))
    .bind(updater)
    .bind(Utc::now().timestamp())
    .bind(payload)
    .bind(id)
    .fetch_one(&mut *conn)
    .await?;
    anomaly_from_row(&row)
}

fn anomaly_from_row(row: &SqliteRow) -> Result<AnomalyRecord> {
    let anomaly_type = AnomalyType::parse(&row.try_get::<String, _>("type")?)?;
    Ok(AnomalyRecord {
        id: row.try_get("id")?,
        row_status: RowStatus::parse(&row.try_get::<String, _>("row_status")?)?,
        creator: row.try_get("creator")?,
        created_ts: row.try_get("created_ts")?,
        updater: row.try_get("updater")?,
        updated_ts: row.try_get("updated_ts")?,
        instance: row.try_get("instance")?,
        database: row.try_get("database_name")?,
        anomaly_type,
        payload: row.try_get("payload")?,
        severity: AnomalySeverity::from_type(anomaly_type),
    })
}
