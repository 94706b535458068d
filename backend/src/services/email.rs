use crate::config::SmtpConfig;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Failed to build message: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("SMTP error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutgoingEmail {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub from_email: Option<String>,
}

impl OutgoingEmail {
    /// Bodies that look like markup are sent as HTML.
    pub fn is_html(&self) -> bool {
        let trimmed = self.body.trim_start();
        trimmed.starts_with('<') && trimmed.contains("</")
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError>;
}

#[derive(Debug, Clone)]
pub struct EmailService {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
}

impl EmailService {
    pub fn new(smtp_config: &SmtpConfig) -> Self {
        let creds = Credentials::new(
            smtp_config.username.clone(),
            smtp_config.password.clone(),
        );

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
            .port(smtp_config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        EmailService {
            transport,
            from_email: smtp_config.from_email.clone(),
            from_name: smtp_config.from_name.clone(),
        }
    }

    fn build_message(&self, email: &OutgoingEmail) -> Result<Message, MailError> {
        let from = match &email.from_email {
            Some(address) => address.parse::<Mailbox>()?,
            None => Mailbox::new(Some(self.from_name.clone()), self.from_email.parse()?),
        };

        let mut builder = Message::builder().from(from).subject(email.subject.clone());
        for recipient in &email.to {
            builder = builder.to(recipient.parse::<Mailbox>()?);
        }

        let content_type = if email.is_html() {
            ContentType::TEXT_HTML
        } else {
            ContentType::TEXT_PLAIN
        };

        Ok(builder.header(content_type).body(email.body.clone())?)
    }
}

#[async_trait]
impl Mailer for EmailService {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError> {
        let message = self.build_message(&email)?;

        match self.transport.send(message).await {
            Ok(_) => {
                info!("Email sent successfully to {}", email.to.join(", "));
                Ok(())
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", email.to.join(", "), e);
                Err(MailError::Transport(e))
            }
        }
    }
}

/// Mailer used when SMTP is not configured; records the message in the log only.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError> {
        info!(
            "SMTP not configured, skipping email to {}: {}",
            email.to.join(", "),
            email.subject
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp() -> SmtpConfig {
        SmtpConfig {
            host: "localhost".to_string(),
            port: 2525,
            username: "user".to_string(),
            password: "secret".to_string(),
            from_email: "automation@example.com".to_string(),
            from_name: "Compass Automation".to_string(),
            use_tls: false,
        }
    }

    #[tokio::test]
    async fn test_build_message_with_default_sender() {
        let service = EmailService::new(&smtp());
        let email = OutgoingEmail {
            to: vec!["owner@example.com".to_string(), "manager@example.com".to_string()],
            subject: "Lead assigned".to_string(),
            body: "<p>New lead</p>".to_string(),
            from_email: None,
        };
        assert!(email.is_html());
        assert!(service.build_message(&email).is_ok());
    }

    #[tokio::test]
    async fn test_build_message_rejects_bad_recipient() {
        let service = EmailService::new(&smtp());
        let email = OutgoingEmail {
            to: vec!["not-an-address".to_string()],
            subject: "x".to_string(),
            body: "y".to_string(),
            from_email: None,
        };
        assert!(matches!(service.build_message(&email), Err(MailError::Address(_))));
    }
}
