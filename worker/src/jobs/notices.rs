// Overdue-notices job - loads the overdue accounts, hands them to the
// notification pipeline, persists its per-invoice/account effects, then
// replays any deferred notice work items that have come due.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use tracing::info;
use uuid::Uuid;

use crate::notify::{NotificationPipeline, NoticeThresholds, OverdueAccount};
use crate::queue::{WorkKind, WorkQueue};

use super::scheduler::{JobReport, JobResult};
use super::WorkerContext;

#[derive(Debug, FromRow)]
struct OverdueRow {
    account_id: Uuid,
    invoice_id: Uuid,
    name: String,
    email: Option<String>,
    phone: Option<String>,
    radius_username: String,
    suspended: bool,
    invoice_number: String,
    amount_due: Decimal,
    currency: String,
    due_date: NaiveDate,
    days_overdue: i32,
    last_notice_days: Option<i32>,
}

impl From<OverdueRow> for OverdueAccount {
    fn from(row: OverdueRow) -> Self {
        OverdueAccount {
            account_id: row.account_id,
            invoice_id: row.invoice_id,
            name: row.name,
            email: row.email,
            phone: row.phone,
            radius_username: row.radius_username,
            suspended: row.suspended,
            invoice_number: row.invoice_number,
            amount_due: row.amount_due,
            currency: row.currency,
            due_date: row.due_date,
            days_overdue: row.days_overdue,
            last_notice_days: row.last_notice_days,
        }
    }
}

pub fn build_pipeline(ctx: &WorkerContext) -> NotificationPipeline {
    NotificationPipeline::new(
        ctx.queue.clone(),
        ctx.email.clone(),
        ctx.sms.clone(),
        ctx.radius.clone(),
        ctx.renderer.clone(),
        NoticeThresholds {
            reminder_days: ctx.config.policy.reminder_days.clone(),
            disconnect_after_days: ctx.config.policy.disconnect_after_days,
        },
        ctx.config.policy.attachment_policy,
        ctx.config.policy.max_attempts,
    )
}

pub async fn run(ctx: &WorkerContext) -> JobResult<JobReport> {
    let today = Utc::now().date_naive();

    // One row per account: its oldest unpaid invoice decides the overdue age.
    let rows: Vec<OverdueRow> = sqlx::query_as(
        r#"
        SELECT DISTINCT ON (a.id)
            a.id AS account_id, a.name, a.email, a.phone, a.radius_username,
            (a.status = 'suspended') AS suspended,
            i.id AS invoice_id, i.invoice_number, i.total_amount AS amount_due,
            i.currency, i.due_date,
            ($1::date - i.due_date) AS days_overdue,
            i.last_notice_days
        FROM invoices i
        JOIN accounts a ON i.account_id = a.id
        WHERE i.status IN ('sent', 'overdue')
            AND i.due_date < $1
            AND a.status <> 'closed'
        ORDER BY a.id, i.due_date ASC
        "#,
    )
    .bind(today)
    .fetch_all(&ctx.db)
    .await?;

    let accounts: Vec<OverdueAccount> = rows.into_iter().map(OverdueAccount::from).collect();

    let pipeline = build_pipeline(ctx);
    let notice_report = pipeline.run(accounts).await;

    info!(
        accounts = notice_report.accounts_processed,
        sms = notice_report.sms_sent,
        emails = notice_report.emails_sent,
        queued = notice_report.retries_enqueued,
        disconnected = notice_report.disconnected.len(),
        "Notice batch dispatched"
    );

    for (invoice_id, days_overdue) in &notice_report.notified {
        sqlx::query(
            r#"
            UPDATE invoices
            SET last_notice_days = $2, last_notice_date = $3, status = 'overdue', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(invoice_id)
        .bind(days_overdue)
        .bind(today)
        .execute(&ctx.db)
        .await?;
    }

    for account_id in &notice_report.disconnected {
        sqlx::query("UPDATE accounts SET status = 'suspended', updated_at = NOW() WHERE id = $1")
            .bind(account_id)
            .execute(&ctx.db)
            .await?;
    }

    let mut report = JobReport {
        items_processed: notice_report.accounts_processed,
        errors: notice_report.errors,
    };

    replay_deferred(ctx, &pipeline, &mut report).await?;

    Ok(report)
}

/// Deferred notices (render failed under the Defer policy) come back through
/// the retry queue as kind=notice items and re-run the full compose step.
async fn replay_deferred(
    ctx: &WorkerContext,
    pipeline: &NotificationPipeline,
    report: &mut JobReport,
) -> JobResult<()> {
    let items = ctx
        .queue
        .claim_batch(WorkKind::Notice, ctx.config.policy.notice_batch_size)
        .await?;

    for item in items {
        let outcome = pipeline.run_deferred(&item.payload).await;
        report.items_processed += 1;
        ctx.queue.report_result(item.id, outcome).await?;
    }

    Ok(())
}
