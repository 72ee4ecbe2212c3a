use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    sync::{Arc, Mutex},
    time::Duration,
};

use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use strum::Display;
use thiserror::Error;

/// Named failure classes reported by a delivery integration.
///
/// Categories carry a fixed disposition independent of any status code:
/// payload and recipient defects cannot be fixed by retrying, while a
/// provider-side rate limit always can.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    MalformedSender,
    MalformedRecipient,
    MissingField,
    InvalidParameter,
    /// The provider refused the message itself (e.g. a permanent SMTP
    /// rejection).
    Rejected,
    RateLimited,
}

impl ErrorCategory {
    pub const fn is_permanent(&self) -> bool {
        !matches!(self, Self::RateLimited)
    }
}

/// A failed delivery attempt, in the neutral vocabulary the classifier
/// understands.
///
/// `code` follows HTTP-provider conventions (429 = rate limited, other 4xx
/// = request rejected, 5xx = provider fault). Integrations whose native
/// codes mean something else (SMTP inverts the 4xx/5xx split) express the
/// failure through `category` instead and leave `code` empty.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DeliveryError {
    pub code: Option<u16>,
    pub category: Option<ErrorCategory>,
    pub message: String,
}

impl DeliveryError {
    /// An error with no status information; assumed transient.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            code: None,
            category: None,
            message: message.into(),
        }
    }

    /// An error carrying a provider status code.
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            category: None,
            message: message.into(),
        }
    }

    /// An error carrying a named category.
    pub fn category(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            code: None,
            category: Some(category),
            message: message.into(),
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        Self::transient(format!("delivery timed out after {}s", after.as_secs()))
    }
}

/// Outcome of a single send: the provider's message id, when it returns one.
pub type SendResult = Result<Option<String>, DeliveryError>;

/// A message captured by the mock transport.
#[derive(Debug, Clone)]
pub struct CapturedMessage {
    pub destination: String,
    pub subject: String,
    pub text_body: String,
}

/// Mock transport that captures sent messages for testing.
///
/// Outcomes can be scripted per send; with nothing scripted every send
/// succeeds with a fixed provider message id.
#[derive(Clone, Default)]
pub struct MockTransport {
    messages: Arc<Mutex<Vec<CapturedMessage>>>,
    outcomes: Arc<Mutex<VecDeque<SendResult>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome for an upcoming send; outcomes are consumed in
    /// FIFO order.
    pub fn push_outcome(&self, outcome: SendResult) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Queue a failure for the next send.
    pub fn fail_next(&self, error: DeliveryError) {
        self.push_outcome(Err(error));
    }

    /// Get all captured messages
    pub fn messages(&self) -> Vec<CapturedMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Clear all captured messages
    pub fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }

    fn send(&self, message: CapturedMessage) -> SendResult {
        self.messages.lock().unwrap().push(message);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Some("mock-message-id".to_string())))
    }
}

/// Delivery client that is either a real SMTP transport or a mock.
///
/// The mock variant captures messages in memory and supports scripted
/// failures, so delivery paths can be exercised without a mail server.
#[derive(Clone)]
pub enum Mailer {
    /// Real SMTP transport for production use
    Smtp {
        transport: AsyncSmtpTransport<Tokio1Executor>,
        sender: Mailbox,
    },
    /// Mock transport that captures messages for testing
    Mock(MockTransport),
}

impl Debug for Mailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Smtp { .. } => f.debug_tuple("Mailer::Smtp").finish(),
            Self::Mock(_) => f.debug_tuple("Mailer::Mock").finish(),
        }
    }
}

impl Mailer {
    /// Create a new mock mailer for testing
    pub fn mock() -> Self {
        Self::Mock(MockTransport::new())
    }

    /// Create a new SMTP mailer for production
    pub fn smtp(transport: AsyncSmtpTransport<Tokio1Executor>, sender: Mailbox) -> Self {
        Self::Smtp { transport, sender }
    }

    /// Attempt to transmit one message.
    ///
    /// Returns the provider's message id when one is reported. Failures are
    /// mapped into the [`DeliveryError`] vocabulary; the caller decides
    /// whether to retry.
    pub async fn send(
        &self,
        destination: &str,
        subject: &str,
        text_body: &str,
        html_body: Option<&str>,
    ) -> SendResult {
        match self {
            Self::Smtp { transport, sender } => {
                let email =
                    build_email(sender.clone(), destination, subject, text_body, html_body)?;
                match transport.send(email).await {
                    Ok(response) => Ok(response.first_line().map(ToOwned::to_owned)),
                    Err(e) => Err(map_smtp_error(&e)),
                }
            }
            Self::Mock(mock) => mock.send(CapturedMessage {
                destination: destination.to_string(),
                subject: subject.to_string(),
                text_body: text_body.to_string(),
            }),
        }
    }

    /// Get captured messages (only available for mock mailer)
    pub fn messages(&self) -> Option<Vec<CapturedMessage>> {
        match self {
            Self::Mock(mock) => Some(mock.messages()),
            Self::Smtp { .. } => None,
        }
    }

    /// Clear captured messages (only available for mock mailer)
    pub fn clear_messages(&self) {
        if let Self::Mock(mock) = self {
            mock.clear();
        }
    }
}

fn build_email(
    sender: Mailbox,
    destination: &str,
    subject: &str,
    text_body: &str,
    html_body: Option<&str>,
) -> Result<Message, DeliveryError> {
    let recipient: Mailbox = destination.parse().map_err(|e| {
        DeliveryError::category(
            ErrorCategory::MalformedRecipient,
            format!("invalid recipient address: {e}"),
        )
    })?;

    let builder = Message::builder()
        .from(sender)
        .to(recipient)
        .subject(subject);

    let email = match html_body {
        Some(html) => builder.multipart(
            MultiPart::alternative()
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_PLAIN)
                        .body(text_body.to_string()),
                )
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_HTML)
                        .body(html.to_string()),
                ),
        ),
        None => builder
            .header(ContentType::TEXT_PLAIN)
            .body(text_body.to_string()),
    };

    email.map_err(|e| {
        DeliveryError::category(
            ErrorCategory::MissingField,
            format!("failed to build email: {e}"),
        )
    })
}

/// SMTP reply codes invert the HTTP 4xx/5xx convention (4yz transient,
/// 5yz permanent), so permanence is expressed through a category rather
/// than by forwarding the raw code.
fn map_smtp_error(error: &lettre::transport::smtp::Error) -> DeliveryError {
    if error.is_permanent() {
        DeliveryError::category(
            ErrorCategory::Rejected,
            format!("rejected by SMTP server: {error}"),
        )
    } else {
        DeliveryError::transient(format!("SMTP delivery failed: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_captures_sent_messages() {
        let mailer = Mailer::mock();

        let result = mailer
            .send("alex@example.com", "Task assigned", "You have a task", None)
            .await;

        assert_eq!(result, Ok(Some("mock-message-id".to_string())));
        let messages = mailer.messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].destination, "alex@example.com");
        assert_eq!(messages[0].subject, "Task assigned");
    }

    #[tokio::test]
    async fn scripted_outcomes_are_consumed_in_order() {
        let transport = MockTransport::new();
        transport.fail_next(DeliveryError::status(500, "provider down"));
        transport.push_outcome(Ok(Some("id-2".to_string())));
        let mailer = Mailer::Mock(transport);

        let first = mailer.send("a@example.com", "s", "b", None).await;
        let second = mailer.send("a@example.com", "s", "b", None).await;
        let third = mailer.send("a@example.com", "s", "b", None).await;

        assert_eq!(first.unwrap_err().code, Some(500));
        assert_eq!(second, Ok(Some("id-2".to_string())));
        // Back to the default outcome once the script is exhausted
        assert_eq!(third, Ok(Some("mock-message-id".to_string())));
    }

    #[test]
    fn rate_limited_is_the_only_retryable_category() {
        assert!(!ErrorCategory::RateLimited.is_permanent());
        for category in [
            ErrorCategory::MalformedSender,
            ErrorCategory::MalformedRecipient,
            ErrorCategory::MissingField,
            ErrorCategory::InvalidParameter,
            ErrorCategory::Rejected,
        ] {
            assert!(category.is_permanent(), "{category} should be permanent");
        }
    }
}
