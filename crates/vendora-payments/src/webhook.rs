use serde::Deserialize;
use vendora_core::{CommerceError, CommerceResult};

use crate::signature::verify_webhook_body;

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    event: String,
    order_id: String,
    payment: WebhookPaymentRef,
}

#[derive(Debug, Deserialize)]
struct WebhookPaymentRef {
    id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    Captured {
        provider_order_ref: String,
        payment_id: String,
    },
    Failed {
        provider_order_ref: String,
        payment_id: String,
    },
}

/// Verify the signature over the raw body, then parse. Unknown event names are
/// a validation error so the provider's retry loop stops redelivering them.
pub fn parse_webhook(secret: &str, body: &[u8], signature: &str) -> CommerceResult<WebhookEvent> {
    verify_webhook_body(secret, body, signature)?;

    let payload: WebhookPayload = serde_json::from_slice(body)
        .map_err(|err| CommerceError::Validation(format!("malformed webhook body: {err}")))?;

    match payload.event.as_str() {
        "payment.captured" => Ok(WebhookEvent::Captured {
            provider_order_ref: payload.order_id,
            payment_id: payload.payment.id,
        }),
        "payment.failed" => Ok(WebhookEvent::Failed {
            provider_order_ref: payload.order_id,
            payment_id: payload.payment.id,
        }),
        other => Err(CommerceError::Validation(format!(
            "unsupported webhook event: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::sign_confirmation;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use vendora_core::ErrorKind;

    const SECRET: &str = "test-webhook-secret";

    fn sign_body(body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn captured_event_parses() {
        let body = br#"{"event":"payment.captured","order_id":"ord_9","payment":{"id":"pay_3"}}"#;
        let event = parse_webhook(SECRET, body, &sign_body(body)).unwrap();
        assert_eq!(
            event,
            WebhookEvent::Captured {
                provider_order_ref: "ord_9".into(),
                payment_id: "pay_3".into(),
            }
        );
    }

    #[test]
    fn failed_event_parses() {
        let body = br#"{"event":"payment.failed","order_id":"ord_9","payment":{"id":"pay_3"}}"#;
        let event = parse_webhook(SECRET, body, &sign_body(body)).unwrap();
        assert!(matches!(event, WebhookEvent::Failed { .. }));
    }

    #[test]
    fn signature_is_checked_before_parsing() {
        // Body is not even valid JSON; a bad signature must win.
        let err = parse_webhook(SECRET, b"not json", "00").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
    }

    #[test]
    fn unknown_event_is_validation_error() {
        let body = br#"{"event":"payment.authorized","order_id":"o","payment":{"id":"p"}}"#;
        let err = parse_webhook(SECRET, body, &sign_body(body)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn confirmation_signature_is_not_a_webhook_signature() {
        let body = br#"{"event":"payment.captured","order_id":"ord_9","payment":{"id":"pay_3"}}"#;
        let wrong = sign_confirmation(SECRET, "ord_9", "pay_3").unwrap();
        assert!(parse_webhook(SECRET, body, &wrong).is_err());
    }
}
