use anyhow::anyhow;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use vendora_core::{CommerceError, CommerceResult};

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &str) -> CommerceResult<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| CommerceError::Internal(anyhow!("hmac init: {err}")))
}

/// Signature over `providerOrderRef|paymentId`, hex-encoded.
pub fn sign_confirmation(
    secret: &str,
    provider_order_ref: &str,
    payment_id: &str,
) -> CommerceResult<String> {
    let mut mac = mac(secret)?;
    mac.update(provider_order_ref.as_bytes());
    mac.update(b"|");
    mac.update(payment_id.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification; runs before any state is read so a forged
/// request learns nothing about order existence.
pub fn verify_confirmation(
    secret: &str,
    provider_order_ref: &str,
    payment_id: &str,
    signature: &str,
) -> CommerceResult<()> {
    let presented = hex::decode(signature)
        .map_err(|_| CommerceError::Security("malformed signature".into()))?;

    let mut mac = mac(secret)?;
    mac.update(provider_order_ref.as_bytes());
    mac.update(b"|");
    mac.update(payment_id.as_bytes());
    mac.verify_slice(&presented)
        .map_err(|_| CommerceError::Security("signature mismatch".into()))
}

/// Webhook signatures cover the raw request body, before any parsing.
pub fn verify_webhook_body(secret: &str, body: &[u8], signature: &str) -> CommerceResult<()> {
    let presented = hex::decode(signature)
        .map_err(|_| CommerceError::Security("malformed signature".into()))?;

    let mut mac = mac(secret)?;
    mac.update(body);
    mac.verify_slice(&presented)
        .map_err(|_| CommerceError::Security("signature mismatch".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vendora_core::ErrorKind;

    const SECRET: &str = "test-webhook-secret";

    #[test]
    fn sign_and_verify_round_trip() {
        let signature = sign_confirmation(SECRET, "ord_123", "pay_456").unwrap();
        verify_confirmation(SECRET, "ord_123", "pay_456", &signature).unwrap();
    }

    #[test]
    fn tampered_payment_id_is_rejected() {
        let signature = sign_confirmation(SECRET, "ord_123", "pay_456").unwrap();
        let err = verify_confirmation(SECRET, "ord_123", "pay_457", &signature).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let signature = sign_confirmation("other-secret", "ord_123", "pay_456").unwrap();
        assert!(verify_confirmation(SECRET, "ord_123", "pay_456", &signature).is_err());
    }

    #[test]
    fn garbage_signature_is_security_error_not_panic() {
        let err = verify_confirmation(SECRET, "ord_123", "pay_456", "not-hex!").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);
    }

    #[test]
    fn webhook_body_verification_covers_raw_bytes() {
        let body = br#"{"event":"payment.captured","order_id":"ord_1","payment":{"id":"pay_1"}}"#;
        let signature = {
            let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
            mac.update(body);
            hex::encode(mac.finalize().into_bytes())
        };
        verify_webhook_body(SECRET, body, &signature).unwrap();

        let mut tampered = body.to_vec();
        tampered[30] ^= 1;
        assert!(verify_webhook_body(SECRET, &tampered, &signature).is_err());
    }
}
