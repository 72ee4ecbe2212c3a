use crate::mailer::DeliveryError;

/// Status code providers use to signal a rate limit; retrying later helps,
/// unlike the rest of the 4xx range.
pub const RATE_LIMIT_STATUS: u16 = 429;

/// What to do with a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient failure; schedule another attempt with backoff.
    Retry,
    /// The request itself is defective or rejected; retrying cannot help.
    Fail,
}

/// The single decision point between `mark_retry` and `mark_failed`.
///
/// A named category always wins, since the integration knows more about
/// the failure than a bare status code does. Codes follow HTTP-provider
/// conventions; anything without status information is assumed transient.
#[must_use]
pub fn classify(error: &DeliveryError) -> Disposition {
    if let Some(category) = error.category {
        return if category.is_permanent() {
            Disposition::Fail
        } else {
            Disposition::Retry
        };
    }

    match error.code {
        None => Disposition::Retry,
        Some(RATE_LIMIT_STATUS) => Disposition::Retry,
        Some(code) if (400..500).contains(&code) => Disposition::Fail,
        Some(_) => Disposition::Retry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::ErrorCategory;

    #[test]
    fn missing_status_is_assumed_transient() {
        let error = DeliveryError::transient("connection reset by peer");
        assert_eq!(classify(&error), Disposition::Retry);
    }

    #[test]
    fn client_errors_are_permanent_except_rate_limits() {
        assert_eq!(
            classify(&DeliveryError::status(400, "bad request")),
            Disposition::Fail
        );
        assert_eq!(
            classify(&DeliveryError::status(404, "unknown route")),
            Disposition::Fail
        );
        assert_eq!(
            classify(&DeliveryError::status(429, "too many requests")),
            Disposition::Retry
        );
    }

    #[test]
    fn server_errors_are_retryable() {
        assert_eq!(
            classify(&DeliveryError::status(500, "internal error")),
            Disposition::Retry
        );
        assert_eq!(
            classify(&DeliveryError::status(503, "overloaded")),
            Disposition::Retry
        );
    }

    #[test]
    fn validation_categories_override_the_status_code() {
        let mut error = DeliveryError::status(500, "invalid sender field");
        error.category = Some(ErrorCategory::MalformedSender);
        assert_eq!(classify(&error), Disposition::Fail);

        let rejected = DeliveryError::category(ErrorCategory::Rejected, "mailbox does not exist");
        assert_eq!(classify(&rejected), Disposition::Fail);

        let rate_limited = DeliveryError::category(ErrorCategory::RateLimited, "slow down");
        assert_eq!(classify(&rate_limited), Disposition::Retry);
    }
}
