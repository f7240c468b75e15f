//! Mail rendering and delivery.
//!
//! [`render`] turns stored articles into [`OutgoingMail`]; a [`MailTransport`]
//! hands it to the outside world. [`SmtpMailer`] is the production transport.

pub mod render;
mod smtp;

use serde::Deserialize;
use std::future::Future;
use thiserror::Error;

pub use render::{article_mail, digest_mail};
pub use smtp::SmtpMailer;

/// Body format of outgoing mail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    #[default]
    #[serde(alias = "text")]
    Plain,
    Html,
}

/// A rendered message addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub format: BodyFormat,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("SMTP is not configured: set smtp.host in config.toml")]
    NotConfigured,

    #[error("Failed to build message: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Sends one rendered message. One call is one attempt.
pub trait MailTransport {
    fn send(&self, mail: &OutgoingMail) -> impl Future<Output = Result<(), MailError>> + Send;
}

/// Check that `address` is a syntactically valid mailbox address.
pub fn validate_address(address: &str) -> Result<lettre::Address, MailError> {
    address
        .trim()
        .parse::<lettre::Address>()
        .map_err(|e| MailError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}
