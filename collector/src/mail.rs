//! Commitment lifecycle mail.
//!
//! Templates render at enqueue time from a typed context (strict undefined:
//! a template referencing a field that does not exist is an error, not an
//! empty string). Delivery drains the queue through the external
//! mail-dispatch service; failures reschedule with backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use shared::config::{ClusterConfig, MailTemplate};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::reconcile::PgTransaction;
use crate::scheduler::{retry_due, Job, JobKind};

#[derive(Error, Debug)]
pub enum MailError {
    #[error("template rendering failed: {0}")]
    Render(String),
    #[error("mail dispatch failed: {0}")]
    Dispatch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitmentMailEvent {
    Confirmed,
    Expired,
}

/// Typed template context for one commitment lifecycle notification.
#[derive(Debug, Clone, Serialize)]
pub struct MailContext {
    pub project: ProjectMailInfo,
    pub commitments: Vec<CommitmentMailInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectMailInfo {
    pub name: String,
    pub domain_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitmentMailInfo {
    pub uuid: Uuid,
    pub service: String,
    pub resource: String,
    pub az: String,
    pub amount: u64,
    pub duration: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Render subject and body from one template pair.
pub fn render(template: &MailTemplate, context: &MailContext) -> Result<(String, String), MailError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("subject", &template.subject)
        .map_err(|e| MailError::Render(e.to_string()))?;
    env.add_template("body", &template.body)
        .map_err(|e| MailError::Render(e.to_string()))?;

    let subject = env
        .get_template("subject")
        .and_then(|t| t.render(context))
        .map_err(|e| MailError::Render(e.to_string()))?;
    let body = env
        .get_template("body")
        .and_then(|t| t.render(context))
        .map_err(|e| MailError::Render(e.to_string()))?;
    Ok((subject, body))
}

/// Render and enqueue a notification for one project. No-op when mail is not
/// configured.
pub async fn enqueue_commitment_mail(
    tx: &mut PgTransaction<'_>,
    config: &Arc<ClusterConfig>,
    project_id: i64,
    event: CommitmentMailEvent,
    commitments: &[CommitmentMailInfo],
) -> anyhow::Result<()> {
    let Some(mail_config) = &config.mail_notifications else {
        return Ok(());
    };
    let template = match event {
        CommitmentMailEvent::Confirmed => &mail_config.templates.confirmed_commitments,
        CommitmentMailEvent::Expired => &mail_config.templates.expired_commitments,
    };

    let row = sqlx::query("SELECT name, domain_name FROM projects WHERE id = $1")
        .bind(project_id)
        .fetch_one(&mut **tx)
        .await?;
    let context = MailContext {
        project: ProjectMailInfo {
            name: row.try_get("name")?,
            domain_name: row.try_get("domain_name")?,
        },
        commitments: commitments.to_vec(),
    };

    let (subject, body) = match render(template, &context) {
        Ok(rendered) => rendered,
        Err(e) => {
            // a broken template must not block the commitment pipeline
            error!(error = %e, "mail template rendering failed, dropping notification");
            return Ok(());
        }
    };

    sqlx::query(
        r#"
        INSERT INTO mail_notifications (project_id, subject, body, next_submission_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(project_id)
    .bind(subject)
    .bind(body)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// External mail-dispatch service; only this contract crosses the boundary.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(
        &self,
        project_uuid: Uuid,
        subject: &str,
        body: &str,
    ) -> Result<(), MailError>;
}

pub struct HttpMailSender {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpMailSender {
    pub fn new(endpoint: String) -> Self {
        let client = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        HttpMailSender {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[derive(Serialize)]
struct MailDispatchRequest<'a> {
    project_id: Uuid,
    subject: &'a str,
    mime_type: &'a str,
    mail_text: &'a str,
}

#[async_trait]
impl MailSender for HttpMailSender {
    async fn send(
        &self,
        project_uuid: Uuid,
        subject: &str,
        body: &str,
    ) -> Result<(), MailError> {
        let url = format!("{}/v1/send-email", self.endpoint);
        let request = MailDispatchRequest {
            project_id: project_uuid,
            subject,
            mime_type: "text/html",
            mail_text: body,
        };
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| MailError::Dispatch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MailError::Dispatch(format!(
                "HTTP {}: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )));
        }
        Ok(())
    }
}

/// Drains due rows from `mail_notifications`.
pub struct MailDeliveryJob {
    pool: PgPool,
    sender: Arc<dyn MailSender>,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl MailDeliveryJob {
    pub fn new(pool: PgPool, sender: Arc<dyn MailSender>) -> Self {
        MailDeliveryJob {
            pool,
            sender,
            retry_base: Duration::from_secs(60),
            retry_max: Duration::from_secs(60 * 60),
        }
    }
}

#[async_trait]
impl Job for MailDeliveryJob {
    fn kind(&self) -> JobKind {
        JobKind::MailDelivery
    }

    async fn poll_once(&self) -> anyhow::Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT m.id, m.subject, m.body, m.failed_submissions, p.uuid AS project_uuid
            FROM mail_notifications m
            JOIN projects p ON p.id = m.project_id
            WHERE m.next_submission_at <= $1
            ORDER BY m.next_submission_at
            LIMIT 1
            FOR UPDATE OF m SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let id: i64 = row.try_get("id")?;
        let subject: String = row.try_get("subject")?;
        let body: String = row.try_get("body")?;
        let failed_submissions: i32 = row.try_get("failed_submissions")?;
        let project_uuid: Uuid = row.try_get("project_uuid")?;

        match self.sender.send(project_uuid, &subject, &body).await {
            Ok(()) => {
                sqlx::query("DELETE FROM mail_notifications WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                metrics::MAIL_SUBMISSIONS.with_label_values(&["success"]).inc();
                info!(project = %project_uuid, "mail submitted");
                Ok(true)
            }
            Err(e) => {
                let failed_submissions = failed_submissions.saturating_add(1);
                warn!(
                    project = %project_uuid,
                    error = %e,
                    failed_submissions,
                    "mail submission failed"
                );
                metrics::MAIL_SUBMISSIONS.with_label_values(&["failure"]).inc();
                sqlx::query(
                    r#"
                    UPDATE mail_notifications
                    SET failed_submissions = $2, next_submission_at = $3
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(failed_submissions)
                .bind(retry_due(now, self.retry_base, self.retry_max, failed_submissions))
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> MailContext {
        MailContext {
            project: ProjectMailInfo {
                name: "tenant-a".to_string(),
                domain_name: "domain-a".to_string(),
            },
            commitments: vec![CommitmentMailInfo {
                uuid: Uuid::from_u128(1),
                service: "compute".to_string(),
                resource: "cores".to_string(),
                az: "az-one".to_string(),
                amount: 20,
                duration: "1 year".to_string(),
                expires_at: None,
            }],
        }
    }

    #[test]
    fn test_render_substitutes_context() {
        let template = MailTemplate {
            subject: "Commitments confirmed for {{ project.name }}".to_string(),
            body: "{% for c in commitments %}{{ c.amount }} {{ c.resource }}{% endfor %}"
                .to_string(),
        };
        let (subject, body) = render(&template, &context()).unwrap();
        assert_eq!(subject, "Commitments confirmed for tenant-a");
        assert_eq!(body, "20 cores");
    }

    #[test]
    fn test_render_rejects_unknown_fields() {
        let template = MailTemplate {
            subject: "{{ project.no_such_field }}".to_string(),
            body: "body".to_string(),
        };
        assert!(matches!(
            render(&template, &context()),
            Err(MailError::Render(_))
        ));
    }

    #[test]
    fn test_render_rejects_broken_syntax() {
        let template = MailTemplate {
            subject: "{% for".to_string(),
            body: "body".to_string(),
        };
        assert!(render(&template, &context()).is_err());
    }
}
