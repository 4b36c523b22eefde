use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::StorageError;

/// Bounded retry with a fixed delay for SQLite busy/locked conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            backoff,
        }
    }

    /// Run `op`, retrying only while it fails with a busy/locked error
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) => {
                    if attempt >= max_attempts {
                        warn!(operation, attempts = attempt, error = %e, "store still busy, giving up");
                        return Err(StorageError::Busy {
                            operation,
                            attempts: attempt,
                        });
                    }
                    debug!(operation, attempt, backoff_ms = self.backoff.as_millis() as u64, "store busy, retrying");
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(StorageError::Database(e)),
            }
        }
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and their extended codes
pub fn is_busy(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            let code_busy = db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| matches!(c & 0xff, 5 | 6))
                .unwrap_or(false);
            code_busy || {
                let msg = db.message();
                msg.contains("database is locked") || msg.contains("database table is locked")
            }
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Primary key or unique constraint violation
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            db.is_unique_violation()
                || matches!(db.code().as_deref(), Some("1555") | Some("2067"))
        }
        _ => false,
    }
}
