//! Migration execution state machine.
//!
//! One attempt moves through validate → record PENDING → execute →
//! finalize. Validation failures abort before any history row exists;
//! once the PENDING row is in, the attempt always resolves it to DONE or
//! FAILED before returning.

use std::time::Instant;

use tracing::{debug, info, warn};

use skiff_core::error::{Result, SkiffError};
use skiff_core::migration::MigrationInfo;

use crate::driver::{parse_create_database, Driver, HistoryTxn};

/// Result of a successfully applied migration.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    /// Id of the history row recording this attempt.
    pub history_id: i64,
    /// Sequence assigned within the namespace.
    pub sequence: i64,
    /// Wall-clock execution duration in nanoseconds.
    pub duration_ns: i64,
    /// Schema snapshot captured after execution.
    pub schema: String,
}

/// Orchestrates migration attempts against one driver handle.
///
/// Migrations against the same namespace are serialized by the history
/// transaction; independent namespaces may be driven concurrently through
/// separate driver handles.
pub struct MigrationExecutor<'a> {
    driver: &'a mut dyn Driver,
}

impl<'a> MigrationExecutor<'a> {
    pub fn new(driver: &'a mut dyn Driver) -> Self {
        Self { driver }
    }

    /// Apply one migration. Retrying after a failure is a new attempt and
    /// receives a new sequence.
    pub async fn execute(
        &mut self,
        info: &MigrationInfo,
        statement: &str,
    ) -> Result<MigrationOutcome> {
        // Reject a malformed create-database instruction before any state
        // mutation.
        let create_target = parse_create_database(statement)?;

        self.driver.setup_history_if_needed().await?;

        let prev_schema = self.dump_schema(&info.namespace).await?;
        let (history_id, sequence) = self.record_pending(info, statement, &prev_schema).await?;
        debug!(
            history_id,
            sequence,
            namespace = %info.namespace,
            "recorded pending migration"
        );

        let started = Instant::now();
        let execution = match create_target {
            Some(database) => self.driver.create_database(database).await,
            None => self.driver.execute(statement, true).await,
        };
        let duration_ns = started.elapsed().as_nanos() as i64;

        let err = match execution {
            Ok(()) => match self.dump_schema(&info.namespace).await {
                Ok(schema) => {
                    let mut txn = self.driver.begin_history_txn().await?;
                    txn.mark_done(history_id, duration_ns, &schema).await?;
                    txn.commit().await?;
                    info!(
                        namespace = %info.namespace,
                        version = %info.version,
                        sequence,
                        duration_ns,
                        "migration applied"
                    );
                    return Ok(MigrationOutcome {
                        history_id,
                        sequence,
                        duration_ns,
                        schema,
                    });
                }
                // The statement committed but the post-snapshot is lost.
                // The row resolves FAILED rather than DONE: a DONE row
                // whose schema column still holds the pre-snapshot would
                // poison later drift comparisons.
                Err(err) => err,
            },
            Err(err) => SkiffError::ExecutionFailed {
                namespace: info.namespace.clone(),
                statement: statement.to_string(),
                message: err.to_string(),
            },
        };

        if let Err(update_err) = self.finalize_failed(history_id, duration_ns).await {
            warn!(
                history_id,
                error = %update_err,
                "failed to mark migration history as failed"
            );
        }
        Err(err)
    }

    /// Sequence resolution, invariant checks, and the PENDING insert run in
    /// one history transaction so concurrent attempts on the same namespace
    /// cannot race on sequence assignment.
    async fn record_pending(
        &mut self,
        info: &MigrationInfo,
        statement: &str,
        prev_schema: &str,
    ) -> Result<(i64, i64)> {
        let mut txn = self.driver.begin_history_txn().await?;
        match validate_and_insert(txn.as_mut(), info, statement, prev_schema).await {
            Ok(outcome) => {
                txn.commit().await?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(error = %rollback_err, "failed to roll back history transaction");
                }
                Err(err)
            }
        }
    }

    async fn finalize_failed(&mut self, history_id: i64, duration_ns: i64) -> Result<()> {
        let mut txn = self.driver.begin_history_txn().await?;
        txn.mark_failed(history_id, duration_ns).await?;
        txn.commit().await
    }

    /// Capture the current schema of a namespace. A namespace that does not
    /// exist yet (a create-database migration) has no schema to capture.
    async fn dump_schema(&mut self, namespace: &str) -> Result<String> {
        let mut buf = Vec::new();
        match self.driver.dump(namespace, &mut buf, true).await {
            Ok(()) => String::from_utf8(buf)
                .map_err(|e| SkiffError::Internal(format!("schema dump is not utf-8: {}", e))),
            Err(SkiffError::NotFound(_)) => Ok(String::new()),
            Err(err) => Err(err),
        }
    }
}

async fn validate_and_insert(
    txn: &mut dyn HistoryTxn,
    info: &MigrationInfo,
    statement: &str,
    prev_schema: &str,
) -> Result<(i64, i64)> {
    // Baseline and branch rows seed or fork history, so the policy never
    // applies to them.
    let require_baseline = info.require_baseline && !info.migration_type.exempt_from_ordering();

    if require_baseline && !txn.has_baseline(&info.namespace).await? {
        return Err(SkiffError::BaselineMissing {
            namespace: info.namespace.clone(),
        });
    }

    let sequence = txn.next_sequence(&info.namespace, require_baseline).await?;

    if txn
        .has_version(&info.namespace, info.engine, &info.version)
        .await?
    {
        return Err(SkiffError::AlreadyApplied {
            namespace: info.namespace.clone(),
            engine: info.engine.to_string(),
            version: info.version.clone(),
        });
    }

    if !info.migration_type.exempt_from_ordering() {
        if let Some(min_recorded) = txn
            .min_version_after(&info.namespace, info.engine, &info.version)
            .await?
        {
            return Err(SkiffError::OutOfOrder {
                namespace: info.namespace.clone(),
                version: info.version.clone(),
                min_recorded,
            });
        }
    }

    let id = txn.insert_pending(sequence, prev_schema, info, statement).await?;
    Ok((id, sequence))
}
