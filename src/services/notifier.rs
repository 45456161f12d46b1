use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::path::Path;

const ATTACHMENT_NAME: &str = "classification_results.json";

/// Delivers classification results to the requester.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn notify(
        &self,
        recipient: &str,
        attachment_path: &Path,
        ticket_id: &str,
    ) -> Result<(), NotifyError>;
}

/// Sends result emails through an unauthenticated SMTP relay (e.g. MailHog).
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl SmtpNotifier {
    pub fn new(host: &str, port: u16, sender: &str) -> Result<Self, NotifyError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .build();
        Ok(Self {
            transport,
            sender: sender.parse()?,
        })
    }
}

#[async_trait]
impl NotificationSender for SmtpNotifier {
    async fn notify(
        &self,
        recipient: &str,
        attachment_path: &Path,
        ticket_id: &str,
    ) -> Result<(), NotifyError> {
        let attachment = tokio::fs::read(attachment_path).await?;
        let message = build_message(&self.sender, recipient, ticket_id, attachment)?;

        self.transport.send(message).await?;
        tracing::info!(recipient, ticket_id, "Email sent");
        Ok(())
    }
}

/// Result email: short plain-text body plus the JSON result as an attachment.
pub fn build_message(
    sender: &Mailbox,
    recipient: &str,
    ticket_id: &str,
    attachment: Vec<u8>,
) -> Result<Message, NotifyError> {
    let body = format!(
        "Please find the classification results attached.\n\nTicket Number: {ticket_id}"
    );
    let content_type = ContentType::parse("application/octet-stream")
        .map_err(|e| NotifyError::ContentType(e.to_string()))?;

    let message = Message::builder()
        .from(sender.clone())
        .to(recipient.parse()?)
        .subject(format!("Classification Results - Ticket #{ticket_id}"))
        .multipart(
            MultiPart::mixed()
                .singlepart(SinglePart::plain(body))
                .singlepart(Attachment::new(ATTACHMENT_NAME.to_string()).body(attachment, content_type)),
        )?;
    Ok(message)
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Invalid email address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Failed to build email: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("Invalid content type: {0}")]
    ContentType(String),

    #[error("Failed to read attachment: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}
