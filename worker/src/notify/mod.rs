// Notification Pipeline - overdue and disconnection notices
//
// For each eligible account the pipeline composes a notice, renders the PDF
// attachment when a renderer is available, and dispatches SMS and email as
// decoupled parallel attempts. One account's failure never stops the batch:
// transient channel failures turn into retry-queue items, data errors are
// logged permanent, and a failed disconnect leaves the account to be
// re-evaluated on the next daily run.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use uplink_shared::NoticeKind;

use crate::config::AttachmentPolicy;
use crate::gateways::{DocumentRenderer, Gateway, GatewayError, NoticeDocument, RadiusControl};
use crate::queue::{EmailAttachment, EmailPayload, ItemOutcome, SmsPayload, WorkKind, WorkQueue};

/// One overdue account as the notice job loads it: the oldest unpaid invoice
/// plus the contact columns the channels need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverdueAccount {
    pub account_id: Uuid,
    pub invoice_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub radius_username: String,
    pub suspended: bool,
    pub invoice_number: String,
    pub amount_due: Decimal,
    pub currency: String,
    pub due_date: NaiveDate,
    pub days_overdue: i32,
    pub last_notice_days: Option<i32>,
}

/// Overdue-day thresholds, injected from config.
#[derive(Debug, Clone)]
pub struct NoticeThresholds {
    pub reminder_days: Vec<i32>,
    pub disconnect_after_days: i32,
}

/// The one canonical threshold resolver. Reminders fire on exact-day matches
/// and are deduplicated against the last notice already sent for the invoice;
/// the disconnection notice fires at or past the cutoff for accounts not yet
/// suspended.
pub fn resolve_notice(
    days_overdue: i32,
    last_notice_days: Option<i32>,
    suspended: bool,
    thresholds: &NoticeThresholds,
) -> Option<NoticeKind> {
    if days_overdue >= thresholds.disconnect_after_days {
        if suspended {
            return None;
        }
        return Some(NoticeKind::Disconnection);
    }

    if thresholds.reminder_days.contains(&days_overdue) && last_notice_days != Some(days_overdue) {
        return Some(NoticeKind::Reminder);
    }

    None
}

/// Payload of a kind=notice work item: a deferred notice re-ran later with
/// the same compose+render+send steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticePayload {
    pub account: OverdueAccount,
    pub kind: NoticeKind,
}

#[derive(Debug, Default)]
pub struct NoticeReport {
    pub accounts_processed: i32,
    pub sms_sent: i32,
    pub emails_sent: i32,
    pub retries_enqueued: i32,
    /// Invoice ids whose notice was dispatched (or queued), with the day
    /// offset to persist for dedup.
    pub notified: Vec<(Uuid, i32)>,
    /// Accounts whose RADIUS session was disconnected this run.
    pub disconnected: Vec<Uuid>,
    pub errors: Vec<String>,
}

enum ChannelResult {
    Sent,
    Queued,
    Skipped(Option<String>),
}

pub struct NotificationPipeline {
    queue: Arc<dyn WorkQueue>,
    email: Arc<dyn Gateway>,
    sms: Arc<dyn Gateway>,
    radius: Arc<dyn RadiusControl>,
    renderer: Arc<dyn DocumentRenderer>,
    thresholds: NoticeThresholds,
    attachment_policy: AttachmentPolicy,
    max_attempts: i32,
}

impl NotificationPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        email: Arc<dyn Gateway>,
        sms: Arc<dyn Gateway>,
        radius: Arc<dyn RadiusControl>,
        renderer: Arc<dyn DocumentRenderer>,
        thresholds: NoticeThresholds,
        attachment_policy: AttachmentPolicy,
        max_attempts: i32,
    ) -> Self {
        Self {
            queue,
            email,
            sms,
            radius,
            renderer,
            thresholds,
            attachment_policy,
            max_attempts,
        }
    }

    /// Runs the batch. Always completes; per-account failures land in the
    /// report, never in an early return.
    pub async fn run(&self, accounts: Vec<OverdueAccount>) -> NoticeReport {
        let mut report = NoticeReport::default();

        for account in accounts {
            let Some(kind) = resolve_notice(
                account.days_overdue,
                account.last_notice_days,
                account.suspended,
                &self.thresholds,
            ) else {
                continue;
            };

            report.accounts_processed += 1;
            self.process_account(&account, kind, &mut report).await;
        }

        report
    }

    async fn process_account(
        &self,
        account: &OverdueAccount,
        kind: NoticeKind,
        report: &mut NoticeReport,
    ) {
        let content = compose_notice(account, kind);

        // The PDF only matters when there is an email to attach it to.
        let mut attachment = None;
        let mut email_deferred = false;
        if account.email.is_some() {
            match self.renderer.render_notice(&notice_document(account, kind)).await {
                Ok(doc) => {
                    attachment = Some(EmailAttachment {
                        filename: doc.filename,
                        content: BASE64.encode(&doc.content),
                    });
                }
                Err(e) => match self.attachment_policy {
                    AttachmentPolicy::Skip => {
                        warn!(
                            account = %account.account_id,
                            error = %e,
                            "Notice render failed; sending email without attachment"
                        );
                        report
                            .errors
                            .push(format!("render failed for {}: {}", account.invoice_number, e));
                    }
                    AttachmentPolicy::Defer => {
                        match self.defer_notice(account, kind).await {
                            Ok(()) => report.retries_enqueued += 1,
                            Err(err) => report.errors.push(err),
                        }
                        email_deferred = true;
                    }
                },
            }
        }

        let sms_payload = account.phone.as_ref().map(|phone| {
            serde_json::to_value(SmsPayload {
                to: phone.clone(),
                message: content.sms_text.clone(),
            })
            .unwrap_or_default()
        });
        let email_payload = if email_deferred {
            None
        } else {
            account.email.as_ref().map(|email| {
                serde_json::to_value(EmailPayload {
                    to: email.clone(),
                    to_name: Some(account.name.clone()),
                    subject: content.subject.clone(),
                    html_body: content.html_body.clone(),
                    text_body: Some(content.text_body.clone()),
                    attachment: attachment.clone(),
                })
                .unwrap_or_default()
            })
        };

        // Channels are decoupled attempts: an SMS failure must not delay or
        // block the email for the same account.
        let (sms_result, email_result) = tokio::join!(
            self.dispatch_channel(&self.sms, WorkKind::Sms, sms_payload, account, "phone"),
            self.dispatch_channel(&self.email, WorkKind::Email, email_payload, account, "email"),
        );

        for (channel, result) in [("sms", sms_result), ("email", email_result)] {
            match result {
                ChannelResult::Sent => match channel {
                    "sms" => report.sms_sent += 1,
                    _ => report.emails_sent += 1,
                },
                ChannelResult::Queued => report.retries_enqueued += 1,
                ChannelResult::Skipped(Some(error)) => report.errors.push(error),
                ChannelResult::Skipped(None) => {}
            }
        }

        report.notified.push((account.invoice_id, account.days_overdue));

        if kind == NoticeKind::Disconnection {
            match self.radius.disconnect(&account.radius_username).await {
                Ok(()) => {
                    info!(
                        account = %account.account_id,
                        username = %account.radius_username,
                        "Subscriber disconnected for non-payment"
                    );
                    report.disconnected.push(account.account_id);
                }
                Err(e) => {
                    // Not queued: the account stays unsuspended and the next
                    // daily run picks it up again.
                    report.errors.push(format!(
                        "disconnect failed for {}: {}",
                        account.radius_username, e
                    ));
                }
            }
        }
    }

    async fn dispatch_channel(
        &self,
        gateway: &Arc<dyn Gateway>,
        kind: WorkKind,
        payload: Option<serde_json::Value>,
        account: &OverdueAccount,
        contact_field: &str,
    ) -> ChannelResult {
        let Some(payload) = payload else {
            if (contact_field == "phone" && account.phone.is_none())
                || (contact_field == "email" && account.email.is_none())
            {
                // Missing contact data is structural; retrying will not grow
                // the account a phone number.
                warn!(
                    account = %account.account_id,
                    channel = kind.as_str(),
                    "Account has no {}; notice channel skipped", contact_field
                );
                return ChannelResult::Skipped(Some(format!(
                    "account {} has no {}",
                    account.account_id, contact_field
                )));
            }
            return ChannelResult::Skipped(None);
        };

        match gateway.send(Uuid::new_v4(), &payload).await {
            Ok(_) => ChannelResult::Sent,
            Err(e) if e.is_transient() => {
                match self.queue.enqueue(kind, payload, self.max_attempts).await {
                    Ok(id) => {
                        info!(
                            account = %account.account_id,
                            channel = kind.as_str(),
                            item = %id,
                            error = %e,
                            "Channel dispatch failed; queued for retry"
                        );
                        ChannelResult::Queued
                    }
                    Err(queue_err) => ChannelResult::Skipped(Some(format!(
                        "could not queue {} retry for {}: {}",
                        kind.as_str(),
                        account.account_id,
                        queue_err
                    ))),
                }
            }
            Err(e) => ChannelResult::Skipped(Some(format!(
                "{} notice for {} failed permanently: {}",
                kind.as_str(),
                account.account_id,
                e
            ))),
        }
    }

    async fn defer_notice(&self, account: &OverdueAccount, kind: NoticeKind) -> Result<(), String> {
        let payload = serde_json::to_value(NoticePayload {
            account: account.clone(),
            kind,
        })
        .map_err(|e| format!("could not encode deferred notice: {}", e))?;

        self.queue
            .enqueue(WorkKind::Notice, payload, self.max_attempts)
            .await
            .map(|id| {
                info!(
                    account = %account.account_id,
                    item = %id,
                    "Notice deferred pending document render"
                );
            })
            .map_err(|e| format!("could not defer notice for {}: {}", account.account_id, e))
    }

    /// Re-runs a deferred notice work item: compose, render, send the email.
    pub async fn run_deferred(&self, payload: &serde_json::Value) -> ItemOutcome {
        let notice: NoticePayload = match serde_json::from_value(payload.clone()) {
            Ok(n) => n,
            Err(e) => return ItemOutcome::PermanentFailure(format!("invalid notice payload: {}", e)),
        };

        let Some(email) = notice.account.email.clone() else {
            return ItemOutcome::PermanentFailure(format!(
                "account {} has no email",
                notice.account.account_id
            ));
        };

        let attachment = match self
            .renderer
            .render_notice(&notice_document(&notice.account, notice.kind))
            .await
        {
            Ok(doc) => Some(EmailAttachment {
                filename: doc.filename,
                content: BASE64.encode(&doc.content),
            }),
            Err(e) if e.is_transient() => {
                return ItemOutcome::TransientFailure(format!("render failed: {}", e));
            }
            Err(e) => return ItemOutcome::PermanentFailure(format!("render failed: {}", e)),
        };

        let content = compose_notice(&notice.account, notice.kind);
        let email_payload = match serde_json::to_value(EmailPayload {
            to: email,
            to_name: Some(notice.account.name.clone()),
            subject: content.subject,
            html_body: content.html_body,
            text_body: Some(content.text_body),
            attachment,
        }) {
            Ok(v) => v,
            Err(e) => return ItemOutcome::PermanentFailure(e.to_string()),
        };

        match self.email.send(Uuid::new_v4(), &email_payload).await {
            Ok(_) => ItemOutcome::Succeeded,
            Err(e) if e.is_transient() => ItemOutcome::TransientFailure(e.to_string()),
            Err(e) => ItemOutcome::PermanentFailure(e.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NoticeContent {
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub sms_text: String,
}

fn notice_document(account: &OverdueAccount, kind: NoticeKind) -> NoticeDocument {
    NoticeDocument {
        account_name: account.name.clone(),
        invoice_number: account.invoice_number.clone(),
        amount_due: format!("{} {}", account.amount_due, account.currency),
        due_date: account.due_date.format("%B %d, %Y").to_string(),
        days_overdue: account.days_overdue,
        notice_kind: kind.as_str().to_string(),
    }
}

pub fn compose_notice(account: &OverdueAccount, kind: NoticeKind) -> NoticeContent {
    match kind {
        NoticeKind::Reminder => {
            let subject = format!(
                "Payment reminder: invoice {} is {} days overdue",
                account.invoice_number, account.days_overdue
            );
            let text_body = format!(
                "Dear {},\n\nInvoice {} for {} {} was due on {} and is now {} days overdue.\n\
                 Please arrange payment to keep your connection active.\n\nUplink Billing",
                account.name,
                account.invoice_number,
                account.amount_due,
                account.currency,
                account.due_date.format("%B %d, %Y"),
                account.days_overdue,
            );
            let html_body = format!(
                r#"<html><body style="font-family: sans-serif;">
                <h2>Payment Reminder</h2>
                <p>Dear {},</p>
                <p>Invoice <strong>{}</strong> for <strong>{} {}</strong> was due on {} and is now
                {} days overdue. Please arrange payment to keep your connection active.</p>
                <p>Uplink Billing</p>
                </body></html>"#,
                account.name,
                account.invoice_number,
                account.amount_due,
                account.currency,
                account.due_date.format("%B %d, %Y"),
                account.days_overdue,
            );
            let sms_text = format!(
                "Uplink: invoice {} ({} {}) is {} days overdue. Please pay to avoid disconnection.",
                account.invoice_number, account.amount_due, account.currency, account.days_overdue,
            );
            NoticeContent {
                subject,
                html_body,
                text_body,
                sms_text,
            }
        }
        NoticeKind::Disconnection => {
            let subject = format!(
                "Service disconnection: invoice {} unpaid for {} days",
                account.invoice_number, account.days_overdue
            );
            let text_body = format!(
                "Dear {},\n\nInvoice {} for {} {} has been unpaid for {} days, and your service\n\
                 is being suspended. Settle the balance to be reconnected.\n\nUplink Billing",
                account.name,
                account.invoice_number,
                account.amount_due,
                account.currency,
                account.days_overdue,
            );
            let html_body = format!(
                r#"<html><body style="font-family: sans-serif;">
                <h2 style="color: #dc2626;">Service Disconnection Notice</h2>
                <p>Dear {},</p>
                <p>Invoice <strong>{}</strong> for <strong>{} {}</strong> has been unpaid for
                {} days, and your service is being suspended. Settle the balance to be
                reconnected.</p>
                <p>Uplink Billing</p>
                </body></html>"#,
                account.name,
                account.invoice_number,
                account.amount_due,
                account.currency,
                account.days_overdue,
            );
            let sms_text = format!(
                "Uplink: your service is being suspended over unpaid invoice {} ({} {}). Settle to reconnect.",
                account.invoice_number, account.amount_due, account.currency,
            );
            NoticeContent {
                subject,
                html_body,
                text_body,
                sms_text,
            }
        }
    }
}
