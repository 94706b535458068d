pub mod email;
pub mod entities;
pub mod webhook;

pub use email::{EmailService, LogMailer, Mailer, MailError, OutgoingEmail};
pub use entities::{Entity, EntityError, EntityStore, InMemoryEntityStore, NewCase, NewTask, PgEntityStore};
pub use webhook::{WebhookClient, WebhookError, WebhookRequest, WebhookResponse};
