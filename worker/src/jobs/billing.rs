// Billing generation job - invoices for subscriptions due today
//
// For every active subscription whose next billing date has arrived: create
// the invoice, advance the cycle, queue the invoice email, and queue an
// autopay charge where the account opted in. Per-subscription failures are
// isolated; the run completes and reports them.

use chrono::{Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use tracing::info;
use uuid::Uuid;

use crate::queue::{EmailPayload, PaymentPayload, WorkKind, WorkQueue};

use super::scheduler::{JobError, JobReport, JobResult};
use super::WorkerContext;

const DUE_IN_DAYS: i64 = 14;

#[derive(Debug, FromRow)]
struct DueSubscription {
    subscription_id: Uuid,
    account_id: Uuid,
    account_name: String,
    email: Option<String>,
    autopay: bool,
    plan_name: String,
    amount: Decimal,
    currency: String,
    next_billing_date: NaiveDate,
}

pub async fn run(ctx: &WorkerContext) -> JobResult<JobReport> {
    let today = Utc::now().date_naive();
    let mut report = JobReport::default();

    // Failure to load the batch aborts this run; the next tick retries.
    let due: Vec<DueSubscription> = sqlx::query_as(
        r#"
        SELECT s.id AS subscription_id, s.next_billing_date,
               a.id AS account_id, a.name AS account_name, a.email, a.autopay,
               p.name AS plan_name, p.monthly_price AS amount, p.currency
        FROM subscriptions s
        JOIN accounts a ON s.account_id = a.id
        JOIN service_plans p ON s.plan_id = p.id
        WHERE s.active = true
            AND a.status <> 'closed'
            AND s.next_billing_date <= $1
        ORDER BY s.next_billing_date ASC
        "#,
    )
    .bind(today)
    .fetch_all(&ctx.db)
    .await?;

    for subscription in due {
        match bill_subscription(ctx, &subscription, today).await {
            Ok(()) => report.items_processed += 1,
            Err(e) => report.errors.push(format!(
                "billing failed for account {}: {}",
                subscription.account_id, e
            )),
        }
    }

    Ok(report)
}

async fn bill_subscription(
    ctx: &WorkerContext,
    subscription: &DueSubscription,
    today: NaiveDate,
) -> JobResult<()> {
    let invoice_id = Uuid::new_v4();
    let invoice_number = next_invoice_number(&ctx.db).await?;
    let due_date = today + chrono::Duration::days(DUE_IN_DAYS);

    sqlx::query(
        r#"
        INSERT INTO invoices
        (id, account_id, invoice_number, issue_date, due_date, status,
         total_amount, currency, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, 'sent', $6, $7, NOW(), NOW())
        "#,
    )
    .bind(invoice_id)
    .bind(subscription.account_id)
    .bind(&invoice_number)
    .bind(today)
    .bind(due_date)
    .bind(subscription.amount)
    .bind(&subscription.currency)
    .execute(&ctx.db)
    .await?;

    sqlx::query(
        "UPDATE subscriptions SET next_billing_date = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(subscription.subscription_id)
    .bind(next_monthly_date(subscription.next_billing_date))
    .execute(&ctx.db)
    .await?;

    info!(
        invoice = %invoice_number,
        account = %subscription.account_id,
        amount = %subscription.amount,
        "Invoice generated"
    );

    if let Some(email) = &subscription.email {
        let payload = serde_json::to_value(invoice_email(
            email,
            subscription,
            &invoice_number,
            due_date,
        ))
        .map_err(|e| JobError::Execution(e.to_string()))?;

        ctx.queue
            .enqueue(WorkKind::Email, payload, ctx.config.policy.max_attempts)
            .await?;
    }

    if subscription.autopay {
        let payload = serde_json::to_value(PaymentPayload {
            invoice_id,
            account_id: subscription.account_id,
            amount: subscription.amount,
            currency: subscription.currency.clone(),
        })
        .map_err(|e| JobError::Execution(e.to_string()))?;

        ctx.queue
            .enqueue(WorkKind::Payment, payload, ctx.config.policy.max_attempts)
            .await?;
    }

    Ok(())
}

async fn next_invoice_number(pool: &PgPool) -> Result<String, sqlx::Error> {
    let next: Option<i32> = sqlx::query_scalar(
        r#"SELECT COALESCE(MAX(CAST(SUBSTRING(invoice_number FROM '^INV-(\d+)$') AS INTEGER)), 0) + 1
           FROM invoices WHERE invoice_number ~ '^INV-\d+$'"#,
    )
    .fetch_one(pool)
    .await?;

    Ok(format!("INV-{:06}", next.unwrap_or(1)))
}

/// Same day next month, clamped to 28 so February never skips a cycle.
fn next_monthly_date(current: NaiveDate) -> NaiveDate {
    let (year, month) = if current.month() == 12 {
        (current.year() + 1, 1)
    } else {
        (current.year(), current.month() + 1)
    };

    NaiveDate::from_ymd_opt(year, month, current.day().min(28))
        .unwrap_or(current + chrono::Duration::days(30))
}

fn invoice_email(
    to: &str,
    subscription: &DueSubscription,
    invoice_number: &str,
    due_date: NaiveDate,
) -> EmailPayload {
    let subject = format!(
        "Invoice {} - {} - {} {}",
        invoice_number, subscription.plan_name, subscription.amount, subscription.currency
    );

    let html_body = format!(
        r#"<html><body style="font-family: sans-serif;">
        <h2>Invoice {}</h2>
        <p>Dear {},</p>
        <p>Your {} service has been billed <strong>{} {}</strong> for the coming period.</p>
        <p>Payment is due by <strong>{}</strong>.</p>
        <p>Thank you for choosing Uplink.</p>
        </body></html>"#,
        invoice_number,
        subscription.account_name,
        subscription.plan_name,
        subscription.amount,
        subscription.currency,
        due_date.format("%B %d, %Y"),
    );

    let text_body = format!(
        "Invoice {}: {} {} for {} service, due {}.",
        invoice_number,
        subscription.amount,
        subscription.currency,
        subscription.plan_name,
        due_date.format("%B %d, %Y"),
    );

    EmailPayload {
        to: to.to_string(),
        to_name: Some(subscription.account_name.clone()),
        subject,
        html_body,
        text_body: Some(text_body),
        attachment: None,
    }
}
