pub mod confirm;
pub mod gateway;
pub mod signature;
pub mod webhook;

pub use confirm::{ConfirmOutcome, ConfirmationProtocol};
pub use gateway::{HttpGateway, PaymentGateway, StaticGateway};
pub use signature::{sign_confirmation, verify_confirmation, verify_webhook_body};
pub use webhook::{WebhookEvent, parse_webhook};
