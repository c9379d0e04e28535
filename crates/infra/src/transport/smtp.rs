use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::instrument;

use courier_core::EmailPayload;

use super::{MailTransport, TransportError};
use crate::config::SmtpSettings;

/// SMTP transport built on lettre's pooled async client.
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl core::fmt::Debug for SmtpTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmtpTransport")
            .field("from", &self.from.to_string())
            .finish_non_exhaustive()
    }
}

impl SmtpTransport {
    /// Port 465 or `secure` uses implicit TLS; anything else upgrades with
    /// STARTTLS when the server offers it.
    pub fn from_settings(settings: &SmtpSettings) -> Result<Self, TransportError> {
        let tls_parameters = TlsParameters::new(settings.host.clone())
            .map_err(|e| TransportError::Smtp(e.to_string()))?;
        let tls = if settings.secure || settings.port == 465 {
            Tls::Wrapper(tls_parameters)
        } else {
            Tls::Opportunistic(tls_parameters)
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(settings.host.as_str())
            .port(settings.port)
            .tls(tls);
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let address = settings
            .username
            .clone()
            .unwrap_or_else(|| format!("no-reply@{}", settings.host));
        let from = Mailbox::new(
            Some(settings.from_name.clone()),
            address
                .parse()
                .map_err(|e| TransportError::InvalidAddress(format!("{address}: {e}")))?,
        );

        Ok(Self {
            mailer: builder.build(),
            from,
        })
    }

    /// Check that the server accepts connections and credentials.
    pub async fn verify(&self) -> Result<bool, TransportError> {
        self.mailer
            .test_connection()
            .await
            .map_err(|e| TransportError::Smtp(e.to_string()))
    }

    fn build_message(&self, email: &EmailPayload) -> Result<Message, TransportError> {
        let to: Mailbox = email
            .recipient
            .parse()
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {e}", email.recipient)))?;

        let builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone());

        let message = match (&email.html, &email.text) {
            (Some(html), Some(text)) => {
                builder.multipart(MultiPart::alternative_plain_html(text.clone(), html.clone()))
            }
            (Some(html), None) => builder
                .header(lettre::message::header::ContentType::TEXT_HTML)
                .body(html.clone()),
            (None, Some(text)) => builder
                .header(lettre::message::header::ContentType::TEXT_PLAIN)
                .body(text.clone()),
            (None, None) => return Err(TransportError::Build("message has no body".into())),
        };

        message.map_err(|e| TransportError::Build(e.to_string()))
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    #[instrument(skip(self, email), fields(recipient = %email.recipient), err)]
    async fn send(&self, email: &EmailPayload) -> Result<(), TransportError> {
        let message = self.build_message(email)?;
        let response = self
            .mailer
            .send(message)
            .await
            .map_err(|e| {
                if e.is_permanent() {
                    TransportError::Rejected(e.to_string())
                } else {
                    TransportError::Smtp(e.to_string())
                }
            })?;

        tracing::debug!(code = %response.code(), "smtp accepted message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SmtpSettings {
        SmtpSettings {
            host: "smtp.example.com".into(),
            port: 587,
            secure: false,
            username: Some("mailer@example.com".into()),
            password: Some("pw".into()),
            from_name: "Courier".into(),
        }
    }

    #[tokio::test]
    async fn builds_multipart_when_both_bodies_are_present() {
        let transport = SmtpTransport::from_settings(&settings()).unwrap();
        let payload = EmailPayload::new(
            "ada@example.com",
            "Hi",
            Some("<p>hello</p>".into()),
            Some("hello".into()),
        )
        .unwrap();

        let raw = String::from_utf8(transport.build_message(&payload).unwrap().formatted()).unwrap();
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("mailer@example.com"));
    }

    #[tokio::test]
    async fn malformed_recipient_is_an_address_error() {
        let transport = SmtpTransport::from_settings(&settings()).unwrap();
        let payload = EmailPayload::new("not an address", "Hi", None, Some("x".into())).unwrap();

        assert!(matches!(
            transport.build_message(&payload),
            Err(TransportError::InvalidAddress(_))
        ));
    }
}
