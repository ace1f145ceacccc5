// Work-item dispatch job - shared body for the email, email-retry, sms, and
// payment cycles. Claims a due batch, fans it out to the gateway with bounded
// concurrency, and reports each item's outcome back to the queue.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::info;

use uplink_shared::{Account, Invoice};

use crate::gateways::{DispatchReceipt, Gateway, GatewayError};
use crate::queue::{ItemOutcome, PaymentPayload, WorkItem, WorkKind, WorkQueue};

use super::scheduler::{JobError, JobReport, JobResult};
use super::WorkerContext;

pub async fn run(
    ctx: &WorkerContext,
    kind: WorkKind,
    gateway: &Arc<dyn Gateway>,
    limit: i64,
    retry_cycle: bool,
) -> JobResult<JobReport> {
    let items = if retry_cycle {
        ctx.queue.claim_retry_batch(kind, limit).await?
    } else {
        ctx.queue.claim_batch(kind, limit).await?
    };

    let mut report = JobReport::default();
    if items.is_empty() {
        return Ok(report);
    }

    info!(
        kind = kind.as_str(),
        claimed = items.len(),
        retry_cycle,
        worker = %ctx.worker_id,
        "Dispatching claimed work items"
    );

    let results: Vec<(WorkItem, Result<DispatchReceipt, GatewayError>)> =
        stream::iter(items.into_iter().map(|item| {
            let gateway = gateway.clone();
            async move {
                let result = gateway.send(item.id, &item.payload).await;
                (item, result)
            }
        }))
        .buffer_unordered(ctx.config.policy.gateway_concurrency)
        .collect()
        .await;

    for (item, result) in results {
        report.items_processed += 1;

        let outcome = match result {
            Ok(_) => ItemOutcome::Succeeded,
            Err(e) if e.is_transient() => {
                report.errors.push(format!("item {}: {}", item.id, e));
                ItemOutcome::TransientFailure(e.to_string())
            }
            Err(e) => {
                report.errors.push(format!("item {}: {}", item.id, e));
                ItemOutcome::PermanentFailure(e.to_string())
            }
        };

        let settled = kind == WorkKind::Payment && matches!(outcome, ItemOutcome::Succeeded);
        ctx.queue.report_result(item.id, outcome).await?;

        // The charge went through at the provider; a settlement failure here
        // must not flip the item, only surface in the report.
        if settled {
            if let Err(e) = settle_payment(ctx, &item.payload).await {
                report
                    .errors
                    .push(format!("settlement for item {}: {}", item.id, e));
            }
        }
    }

    Ok(report)
}

/// Marks the charged invoice paid and, once nothing unpaid remains on a
/// suspended account, re-authorizes the subscriber's RADIUS session.
async fn settle_payment(ctx: &WorkerContext, payload: &serde_json::Value) -> JobResult<()> {
    let charge: PaymentPayload = serde_json::from_value(payload.clone())
        .map_err(|e| JobError::Execution(format!("invalid payment payload: {}", e)))?;

    let invoice: Option<Invoice> = sqlx::query_as(
        r#"
        UPDATE invoices
        SET status = 'paid', updated_at = NOW()
        WHERE id = $1 AND status <> 'paid'
        RETURNING id, account_id, invoice_number, issue_date, due_date, status,
                  total_amount, currency, last_notice_days, last_notice_date,
                  created_at, updated_at
        "#,
    )
    .bind(charge.invoice_id)
    .fetch_optional(&ctx.db)
    .await?;

    // Already paid (or gone): nothing left to settle.
    let Some(invoice) = invoice else {
        return Ok(());
    };

    info!(
        invoice = %invoice.invoice_number,
        account = %invoice.account_id,
        "Invoice settled by charge"
    );

    let account: Option<Account> = sqlx::query_as(
        r#"
        SELECT id, name, email, phone, radius_username, status, autopay,
               created_at, updated_at
        FROM accounts WHERE id = $1
        "#,
    )
    .bind(invoice.account_id)
    .fetch_optional(&ctx.db)
    .await?;

    let Some(account) = account else {
        return Ok(());
    };

    let unpaid: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM invoices WHERE account_id = $1 AND status IN ('sent', 'overdue')",
    )
    .bind(account.id)
    .fetch_one(&ctx.db)
    .await?;

    if !reconnect_due(&account.status, unpaid) {
        return Ok(());
    }

    ctx.radius
        .authorize(&account.radius_username)
        .await
        .map_err(|e| {
            JobError::Execution(format!(
                "reauthorize failed for {}: {}",
                account.radius_username, e
            ))
        })?;

    sqlx::query("UPDATE accounts SET status = 'active', updated_at = NOW() WHERE id = $1")
        .bind(account.id)
        .execute(&ctx.db)
        .await?;

    info!(
        account = %account.id,
        username = %account.radius_username,
        "Subscriber reconnected after settlement"
    );

    Ok(())
}

/// A settled charge reconnects a subscriber only when the account is
/// suspended and no unpaid invoice remains.
fn reconnect_due(account_status: &str, unpaid_invoices: i64) -> bool {
    account_status == "suspended" && unpaid_invoices == 0
}
