//! Email channel: SMTP delivery of notifications to `mailto:` endpoints.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::DeliveryChannel;
use crate::settings::SmtpSettings;
use crate::types::{ChannelConfig, DeliveryOutcome};

pub struct EmailChannel {
    smtp: Option<SmtpSettings>,
}

impl EmailChannel {
    pub fn new(smtp: Option<SmtpSettings>) -> Self {
        Self { smtp }
    }

    fn build_message(
        &self,
        from: &str,
        to: &str,
        subscription_id: &str,
        payload: &[u8],
        content_type: &str,
    ) -> Result<Message, String> {
        let subject = format!("Subscription notification: {subscription_id}");
        let builder = Message::builder()
            .from(from.parse().map_err(|e| format!("invalid from address: {e}"))?)
            .to(to.parse().map_err(|e| format!("invalid to address: {e}"))?)
            .subject(subject);

        // `text/plain;attach=<mime>` requests the serialized bundle as an
        // attachment with a short text body; otherwise the payload is the
        // body itself.
        let attach_type = content_type
            .split(';')
            .filter_map(|p| p.trim().strip_prefix("attach="))
            .next();

        match attach_type {
            Some(mime) => {
                let attachment_type = ContentType::parse(mime)
                    .map_err(|e| format!("invalid attachment content type '{mime}': {e}"))?;
                builder
                    .multipart(
                        MultiPart::mixed()
                            .singlepart(SinglePart::plain(format!(
                                "Notification for subscription {subscription_id}; see attachment."
                            )))
                            .singlepart(
                                Attachment::new("notification.json".to_string())
                                    .body(payload.to_vec(), attachment_type),
                            ),
                    )
                    .map_err(|e| e.to_string())
            }
            None => builder
                .header(ContentType::TEXT_PLAIN)
                .body(String::from_utf8_lossy(payload).into_owned())
                .map_err(|e| e.to_string()),
        }
    }
}

#[async_trait]
impl DeliveryChannel for EmailChannel {
    fn code(&self) -> &'static str {
        "email"
    }

    async fn deliver(
        &self,
        subscription_id: &str,
        channel: &ChannelConfig,
        payload: &[u8],
        content_type: &str,
    ) -> DeliveryOutcome {
        let Some(smtp) = &self.smtp else {
            return DeliveryOutcome::Fatal("email delivery not configured".into());
        };

        let Some(endpoint) = channel.endpoint.as_deref() else {
            return DeliveryOutcome::Fatal("email channel has no endpoint".into());
        };
        let Some(address) = endpoint.strip_prefix("mailto:") else {
            return DeliveryOutcome::Fatal(format!(
                "email endpoint '{endpoint}' is not a mailto: URI"
            ));
        };

        let message = match self.build_message(
            &smtp.from_address,
            address,
            subscription_id,
            payload,
            content_type,
        ) {
            Ok(message) => message,
            Err(e) => return DeliveryOutcome::Fatal(e),
        };

        let mut transport_builder =
            match AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host) {
                Ok(builder) => builder.port(smtp.port),
                Err(e) => return DeliveryOutcome::Fatal(e.to_string()),
            };

        if let (Some(username), Some(password)) = (&smtp.username, &smtp.password) {
            transport_builder = transport_builder
                .credentials(Credentials::new(username.clone(), password.clone()));
        }

        let transport = transport_builder.build();

        match transport.send(message).await {
            Ok(_) => {
                tracing::debug!(subscription_id, to = address, "Email notification sent");
                DeliveryOutcome::ok()
            }
            Err(e) if e.is_permanent() => {
                tracing::warn!(subscription_id, to = address, error = %e, "Email rejected");
                DeliveryOutcome::Fatal(e.to_string())
            }
            Err(e) => {
                tracing::warn!(subscription_id, to = address, error = %e, "Email send failed");
                DeliveryOutcome::Retryable(e.to_string())
            }
        }
    }
}
