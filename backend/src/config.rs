use std::env;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::services::webhook::DEFAULT_SIGNATURE_HEADER;

#[derive(Debug, Clone)]
pub struct Config {
    /// Absent means the in-memory store
    pub database_url: Option<String>,
    pub server_addr: String,
    pub smtp: SmtpConfig,
    pub webhook_timeout_secs: u64,
    pub webhook_signature_header: String,
    /// Default sender for workflow emails
    pub mail_from: String,
}

/// SMTP configuration for sending emails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
    pub from_name: String,
    pub use_tls: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let mail_from = env::var("MAIL_FROM")
            .unwrap_or_else(|_| "automation@compass.local".to_string());

        Ok(Config {
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            server_addr: env::var("SERVER_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            smtp: SmtpConfig {
                host: env::var("SMTP_HOST").unwrap_or_default(),
                port: env::var("SMTP_PORT")
                    .unwrap_or_else(|_| "2525".to_string())
                    .parse()
                    .unwrap_or(2525),
                username: env::var("SMTP_USERNAME").unwrap_or_default(),
                password: env::var("SMTP_PASSWORD").unwrap_or_default(),
                from_email: env::var("SMTP_FROM_EMAIL").unwrap_or_else(|_| mail_from.clone()),
                from_name: env::var("SMTP_FROM_NAME")
                    .unwrap_or_else(|_| "Compass Automation".to_string()),
                use_tls: env::var("SMTP_USE_TLS")
                    .unwrap_or_else(|_| "true".to_string())
                    .parse()
                    .unwrap_or(true),
            },
            webhook_timeout_secs: env::var("WEBHOOK_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            webhook_signature_header: env::var("WEBHOOK_SIGNATURE_HEADER")
                .unwrap_or_else(|_| DEFAULT_SIGNATURE_HEADER.to_string()),
            mail_from,
        })
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

impl SmtpConfig {
    /// Check if SMTP is properly configured
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && !self.username.is_empty() && !self.password.is_empty()
    }
}
