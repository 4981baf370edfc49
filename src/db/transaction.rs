//! Transaction control on the master connection.
//!
//! A database handle is either IDLE or ACTIVE. BEGIN, COMMIT and ROLLBACK run
//! as plain statements on the master, and the ACTIVE flag is cleared exactly
//! once per transaction however it ends. Losing the master connection ends
//! the transaction on the server, so the flag is cleared without a ROLLBACK.

use crate::db::driver::Connector;
use crate::db::pool::{Database, Route};
use crate::error::{DbError, DbResult};
use crate::models::TransactionState;
use std::future::Future;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

const BEGIN_SQL: &str = "START TRANSACTION";
const COMMIT_SQL: &str = "COMMIT";
const ROLLBACK_SQL: &str = "ROLLBACK";

impl<C: Connector> Database<C> {
    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    pub fn transaction_state(&self) -> TransactionState {
        if self.in_transaction() {
            TransactionState::Active
        } else {
            TransactionState::Idle
        }
    }

    /// Start a transaction on the master.
    ///
    /// With strict transactions a second `begin` fails with
    /// [`DbError::TransactionAlreadyActive`]; otherwise it is a no-op and the
    /// running transaction continues.
    pub async fn begin(&self) -> DbResult<()> {
        if self
            .in_transaction
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            if self.options.strict_transactions {
                return Err(DbError::transaction_already_active(&self.name));
            }
            warn!(database = %self.name, "begin() while a transaction is active, ignored");
            return Ok(());
        }

        if let Err(e) = self.run_control(BEGIN_SQL).await {
            self.in_transaction.store(false, Ordering::SeqCst);
            return Err(e);
        }

        debug!(database = %self.name, "Transaction started");
        Ok(())
    }

    /// Commit the active transaction.
    ///
    /// The handle returns to IDLE even when COMMIT fails, since the server
    /// ends the transaction either way.
    pub async fn commit(&self) -> DbResult<()> {
        if !self.in_transaction() {
            return Err(DbError::transaction("No active transaction to commit", &self.name));
        }

        let result = self.run_control(COMMIT_SQL).await;
        self.in_transaction.store(false, Ordering::SeqCst);
        result?;

        debug!(database = %self.name, "Transaction committed");
        Ok(())
    }

    /// Roll back the active transaction. Does nothing when IDLE.
    pub async fn rollback(&self) -> DbResult<()> {
        if !self.in_transaction.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.run_control(ROLLBACK_SQL).await?;
        info!(database = %self.name, "Transaction rolled back");
        Ok(())
    }

    /// Run `f` inside a transaction, committing on `Ok` and rolling back on `Err`.
    pub async fn transaction<'a, F, Fut, T>(&'a self, f: F) -> DbResult<T>
    where
        F: FnOnce(&'a Self) -> Fut,
        Fut: Future<Output = DbResult<T>> + 'a,
    {
        self.begin().await?;
        match f(self).await {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(
                        database = %self.name,
                        error = %rollback_err,
                        "Rollback after failed transaction body failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Roll back after a failed statement. Errors are logged, not returned.
    ///
    /// Must not be called while the master slot is held.
    pub(crate) async fn rollback_after_failure(&self) {
        if !self.in_transaction() {
            return;
        }
        match self.rollback().await {
            Ok(()) => warn!(database = %self.name, "Statement failed, transaction rolled back"),
            Err(e) => warn!(
                database = %self.name,
                error = %e,
                "Statement failed and the rollback failed too"
            ),
        }
    }

    /// Clear the ACTIVE flag after the master connection was lost.
    ///
    /// The server discards the transaction with the session, and the
    /// replacement connection has nothing to roll back.
    pub(crate) fn abandon_transaction(&self) {
        if self.in_transaction.swap(false, Ordering::SeqCst) {
            warn!(
                database = %self.name,
                "Master connection lost, transaction abandoned"
            );
        }
    }

    async fn run_control(&self, sql: &str) -> DbResult<()> {
        let mut conn = self.resolve(Route::Master).await?;
        conn.execute(sql, &[]).await.map_err(|e| {
            DbError::transaction(format!("{} failed: {}", sql, e), &self.name)
        })?;
        Ok(())
    }
}
