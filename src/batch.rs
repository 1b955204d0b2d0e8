/*!
Job-batch state machine.

Sharding rule for submissions plus the per-shard completion protocol:
sum-guarded counter increments, the terminal transition, and the
notification trigger. Only the worker whose increment makes
`completed + failed == total` writes the terminal state.
*/

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::{BatchCounters, Database};
use crate::error::Result;
use crate::metrics;
use crate::model::BatchStatus;
use crate::notifier::{NotificationKind, Notifier};

/// Shard size for a submission of `total` prompts: small jobs run as a
/// single shard, mid-size jobs split by 5, large jobs by 10.
pub fn shard_size(total: usize) -> usize {
    if total < 5 {
        total.max(1)
    } else if total <= 10 {
        5
    } else {
        10
    }
}

/// Number of shards for a submission of `total` prompts.
pub fn shard_count(total: usize) -> usize {
    if total == 0 {
        return 0;
    }
    total.div_ceil(shard_size(total))
}

/// How one shard ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardOutcome {
    Completed,
    Failed,
}

/// Identity of a shard plus what the notifier needs.
#[derive(Debug, Clone)]
pub struct ShardContext {
    pub job_batch_id: Uuid,
    pub batch_number: i32,
    pub total_batches: i32,
    pub prompt_count: usize,
    pub email: Option<String>,
}

/// Terminal status once all shards are accounted for.
pub fn terminal_status(counters: BatchCounters) -> BatchStatus {
    if counters.failed == 0 {
        BatchStatus::Completed
    } else if counters.completed == 0 {
        BatchStatus::Failed
    } else {
        BatchStatus::CompletedWithErrors
    }
}

/// Record one shard's completion.
///
/// Re-deliveries are safe: if the counters already cover every shard the
/// increment is skipped, so replaying a completion message n times
/// leaves the same `(completed, failed, status, completed_at)` as one
/// delivery.
pub async fn finalize_shard(
    db: &Database,
    notifier: &Notifier,
    ctx: &ShardContext,
    outcome: ShardOutcome,
    reason: Option<&str>,
) -> Result<()> {
    let before = db.batch_counters(ctx.job_batch_id).await?;
    if before.is_complete() {
        warn!(
            job_batch_id = %ctx.job_batch_id,
            batch_number = ctx.batch_number,
            "batch counters already complete, skipping increment"
        );
        return Ok(());
    }

    let after = match outcome {
        ShardOutcome::Completed => {
            metrics::global().shards_completed.inc();
            db.increment_completed(ctx.job_batch_id).await?
        }
        ShardOutcome::Failed => {
            metrics::global().shards_failed.inc();
            db.increment_failed(ctx.job_batch_id).await?
        }
    };

    info!(
        job_batch_id = %ctx.job_batch_id,
        batch_number = ctx.batch_number,
        completed = after.completed,
        failed = after.failed,
        total = after.total,
        "shard finalized"
    );

    if after.completed + after.failed == after.total {
        let status = terminal_status(after);
        db.finalize_batch(ctx.job_batch_id, status, reason).await?;
        info!(job_batch_id = %ctx.job_batch_id, ?status, "batch reached terminal status");
    }

    notify_shard(db, notifier, ctx, outcome, reason).await;
    Ok(())
}

/// Exactly one notification per shard completion. The sum-guard above
/// already bounds this to one call per (job batch, shard); `succeeded`
/// is additionally gated on a fulfilled row existing, which keeps
/// callback retries from mailing twice.
async fn notify_shard(
    db: &Database,
    notifier: &Notifier,
    ctx: &ShardContext,
    outcome: ShardOutcome,
    reason: Option<&str>,
) {
    let Some(email) = ctx.email.as_deref() else {
        return;
    };

    let vars = json!({
        "job_batch_id": ctx.job_batch_id.to_string(),
        "batch_number": ctx.batch_number + 1,
        "total_batches": ctx.total_batches,
        "prompt_count": ctx.prompt_count,
        "reason": reason.unwrap_or_default(),
    });

    let kind = match outcome {
        ShardOutcome::Completed => {
            match db
                .any_fulfilled_in_shard(ctx.job_batch_id, ctx.batch_number)
                .await
            {
                Ok(true) => NotificationKind::Succeeded,
                Ok(false) => {
                    warn!(
                        job_batch_id = %ctx.job_batch_id,
                        batch_number = ctx.batch_number,
                        "no fulfilled rows for completed shard, skipping success email"
                    );
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "fulfilled-row check failed, skipping success email");
                    return;
                }
            }
        }
        ShardOutcome::Failed => NotificationKind::Failed,
    };

    if let Err(e) = notifier.send(kind, email, vars).await {
        warn!(error = %e, ?kind, "shard notification failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_size_boundaries() {
        assert_eq!(shard_size(1), 1);
        assert_eq!(shard_size(4), 4);
        assert_eq!(shard_size(5), 5);
        assert_eq!(shard_size(10), 5);
        assert_eq!(shard_size(11), 10);
        assert_eq!(shard_size(20), 10);
    }

    #[test]
    fn shard_count_boundaries() {
        assert_eq!(shard_count(1), 1);
        assert_eq!(shard_count(4), 1);
        assert_eq!(shard_count(5), 1);
        assert_eq!(shard_count(10), 2);
        assert_eq!(shard_count(11), 2);
        assert_eq!(shard_count(20), 2);
    }

    #[test]
    fn batch_numbers_follow_shard_size() {
        // 11 prompts split {10, 1}
        let size = shard_size(11);
        let numbers: Vec<usize> = (0..11).map(|i| i / size).collect();
        assert_eq!(numbers.iter().filter(|&&b| b == 0).count(), 10);
        assert_eq!(numbers.iter().filter(|&&b| b == 1).count(), 1);
    }

    #[test]
    fn terminal_status_rules() {
        let c = |completed, failed, total| BatchCounters {
            completed,
            failed,
            total,
        };
        assert_eq!(terminal_status(c(3, 0, 3)), BatchStatus::Completed);
        assert_eq!(terminal_status(c(0, 3, 3)), BatchStatus::Failed);
        assert_eq!(
            terminal_status(c(2, 1, 3)),
            BatchStatus::CompletedWithErrors
        );
    }
}
