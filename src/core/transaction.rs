//! Transaction scope with rollback on drop
//!
//! [`TransactionScope`] owns the transaction for one runner invocation and makes sure it
//! ends in exactly one of commit or rollback, even if the surrounding future is dropped.

use super::connection::DbTransaction;
use super::error::{DatabaseError, Result};
use super::isolation::IsolationLevel;
use tracing::{debug, error, warn};

/// Owns a transaction until it is committed or rolled back
///
/// If the scope is dropped while the transaction is still pending (for example because
/// the future driving the runner was cancelled), a rollback is scheduled on the current
/// tokio runtime.
///
/// # Example
///
/// ```ignore
/// let mut scope = TransactionScope::new(connection.begin_transaction(level, &cancel).await?);
/// match body(&mut *command).await {
///     Ok(value) => { scope.commit().await?; Ok(value) }
///     Err(e) => { scope.rollback().await?; Err(e) }
/// }
/// ```
pub struct TransactionScope {
    transaction: Option<Box<dyn DbTransaction>>,
    level: IsolationLevel,
    committed: bool,
    rolled_back: bool,
}

impl TransactionScope {
    /// Take ownership of a freshly begun transaction
    pub fn new(transaction: Box<dyn DbTransaction>) -> Self {
        Self {
            level: transaction.isolation_level(),
            transaction: Some(transaction),
            committed: false,
            rolled_back: false,
        }
    }

    /// The isolation level of the owned transaction
    pub fn isolation_level(&self) -> IsolationLevel {
        self.level
    }

    /// Commit the transaction
    ///
    /// A failed commit leaves the scope pending so it can still be rolled back.
    ///
    /// # Errors
    ///
    /// Returns an error if the scope already finished or the driver fails to commit
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_pending("commit")?;
        self.transaction
            .as_mut()
            .ok_or_else(released)?
            .commit()
            .await?;
        self.committed = true;
        debug!(target: "executor::txn", level = %self.level, "Transaction committed");
        Ok(())
    }

    /// Roll back the transaction
    ///
    /// The scope counts as rolled back once this is called, whether or not the driver
    /// reports success.
    ///
    /// # Errors
    ///
    /// Returns an error if the scope already finished or the driver fails to roll back
    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_pending("rollback")?;
        self.rolled_back = true;
        self.transaction
            .as_mut()
            .ok_or_else(released)?
            .rollback()
            .await?;
        debug!(target: "executor::txn", level = %self.level, "Transaction rolled back");
        Ok(())
    }

    /// Release the transaction without committing or rolling back
    ///
    /// Used when the connection is already gone and a rollback could not reach the
    /// server. No rollback is scheduled on drop afterwards.
    pub fn discard(&mut self) {
        if self.transaction.take().is_some() {
            debug!(target: "executor::txn", level = %self.level, "Transaction discarded");
        }
    }

    /// Check if the transaction has been committed
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Check if the transaction has been rolled back
    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back
    }

    fn ensure_pending(&self, action: &str) -> Result<()> {
        if self.committed {
            return Err(DatabaseError::transaction(format!(
                "Cannot {} a committed transaction",
                action
            )));
        }
        if self.rolled_back {
            return Err(DatabaseError::transaction(format!(
                "Cannot {} a rolled back transaction",
                action
            )));
        }
        Ok(())
    }
}

fn released() -> DatabaseError {
    DatabaseError::transaction("Transaction already released")
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.committed || self.rolled_back {
            return;
        }
        let Some(mut transaction) = self.transaction.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    target: "executor::txn",
                    level = %self.level,
                    "Transaction scope dropped while pending; scheduling rollback"
                );
                handle.spawn(async move {
                    if let Err(e) = transaction.rollback().await {
                        error!(
                            target: "executor::txn",
                            error = %e,
                            "Rollback of abandoned transaction failed"
                        );
                    }
                });
            }
            Err(_) => {
                warn!(
                    target: "executor::txn",
                    "Transaction scope dropped outside a tokio runtime; \
                     the database will roll back when the connection closes"
                );
            }
        }
    }
}
