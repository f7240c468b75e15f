use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

use super::{validate_address, BodyFormat, MailError, MailTransport, OutgoingMail};
use crate::config::{SmtpConfig, SMTP_PASSWORD_ENV};

/// [`MailTransport`] over SMTP using `lettre`.
///
/// Connection security follows the config: implicit TLS when `ssl`,
/// STARTTLS when `starttls`, plaintext otherwise.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Build a mailer from the `[smtp]` table.
    ///
    /// `FEEDMAILER_SMTP_PASSWORD` takes precedence over `smtp.password`.
    ///
    /// # Errors
    ///
    /// `MailError::NotConfigured` without a host, `MailError::InvalidAddress`
    /// when neither `from` nor `user` is a usable sender address.
    pub fn new(config: &SmtpConfig, sender_name: &str) -> Result<Self, MailError> {
        let host = config
            .host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(MailError::NotConfigured)?;

        let sender = config
            .from
            .as_deref()
            .or(config.user.as_deref())
            .unwrap_or_default();
        let from = Mailbox::new(Some(sender_name.to_string()), validate_address(sender)?);

        let mut builder = if config.ssl {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)?
        } else if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        builder = builder
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));

        if config.auth {
            let password = std::env::var(SMTP_PASSWORD_ENV)
                .ok()
                .map(SecretString::from)
                .or_else(|| config.password.clone())
                .unwrap_or_default();
            let user = config.user.clone().unwrap_or_default();
            // lettre takes the password by value
            builder = builder.credentials(Credentials::new(
                user,
                password.expose_secret().to_string(),
            ));
        }

        tracing::debug!(
            host = %host,
            port = config.port,
            ssl = config.ssl,
            starttls = config.starttls,
            auth = config.auth,
            "SMTP transport configured"
        );

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    fn build_message(&self, mail: &OutgoingMail) -> Result<Message, MailError> {
        let to = Mailbox::new(None, validate_address(&mail.to)?);
        let content_type = match mail.format {
            BodyFormat::Plain => ContentType::TEXT_PLAIN,
            BodyFormat::Html => ContentType::TEXT_HTML,
        };
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(mail.subject.clone())
            .header(content_type)
            .body(mail.body.clone())?;
        Ok(message)
    }
}

impl MailTransport for SmtpMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let message = self.build_message(mail)?;
        self.transport.send(message).await?;
        tracing::debug!(to = %mail.to, subject = %mail.subject, "Mail sent");
        Ok(())
    }
}
