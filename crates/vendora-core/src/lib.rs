pub mod error;
pub mod models;
pub mod status;

pub use error::{CommerceError, CommerceResult, ErrorKind};
pub use models::{PaymentStatus, SettlementStatus, UserRole};
pub use status::{OrderStatus, is_valid_transition, validate_transition};
