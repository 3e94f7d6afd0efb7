use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CommerceError, CommerceResult};
use crate::models::UserRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Pending,
    PendingPayment,
    Confirmed,
    Paid,
    Packed,
    Shipped,
    Delivered,
    OutForInspection,
    ReturnRequested,
    ReturnPickedUp,
    QcInProgress,
    Returned,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Pending => "PENDING",
            OrderStatus::PendingPayment => "PENDING_PAYMENT",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Paid => "PAID",
            OrderStatus::Packed => "PACKED",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::OutForInspection => "OUT_FOR_INSPECTION",
            OrderStatus::ReturnRequested => "RETURN_REQUESTED",
            OrderStatus::ReturnPickedUp => "RETURN_PICKED_UP",
            OrderStatus::QcInProgress => "QC_IN_PROGRESS",
            OrderStatus::Returned => "RETURNED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> CommerceResult<Self> {
        let status = match value.trim().to_ascii_uppercase().as_str() {
            "CREATED" => OrderStatus::Created,
            "PENDING" => OrderStatus::Pending,
            "PENDING_PAYMENT" => OrderStatus::PendingPayment,
            "CONFIRMED" => OrderStatus::Confirmed,
            "PAID" => OrderStatus::Paid,
            "PACKED" => OrderStatus::Packed,
            "SHIPPED" => OrderStatus::Shipped,
            "DELIVERED" => OrderStatus::Delivered,
            "OUT_FOR_INSPECTION" => OrderStatus::OutForInspection,
            "RETURN_REQUESTED" => OrderStatus::ReturnRequested,
            "RETURN_PICKED_UP" => OrderStatus::ReturnPickedUp,
            "QC_IN_PROGRESS" => OrderStatus::QcInProgress,
            "RETURNED" => OrderStatus::Returned,
            "CANCELLED" => OrderStatus::Cancelled,
            other => {
                return Err(CommerceError::Validation(format!(
                    "unknown order status: {other}"
                )));
            }
        };
        Ok(status)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Returned | OrderStatus::Cancelled)
    }

    /// Statuses the confirmation protocol may move into `Confirmed`.
    pub const PRE_PAYMENT: [OrderStatus; 3] = [
        OrderStatus::Created,
        OrderStatus::Pending,
        OrderStatus::PendingPayment,
    ];

    /// Storage forms of `PRE_PAYMENT`, for `status = ANY($n)` binds.
    pub fn pre_payment_strings() -> Vec<String> {
        Self::PRE_PAYMENT
            .iter()
            .map(|status| status.as_str().to_string())
            .collect()
    }

    /// Money has been captured for the order in any of these statuses.
    pub fn is_paid_equivalent(&self) -> bool {
        matches!(
            self,
            OrderStatus::Confirmed
                | OrderStatus::Paid
                | OrderStatus::Packed
                | OrderStatus::Shipped
                | OrderStatus::Delivered
                | OrderStatus::OutForInspection
                | OrderStatus::ReturnRequested
                | OrderStatus::ReturnPickedUp
                | OrderStatus::QcInProgress
                | OrderStatus::Returned
        )
    }

    fn forward_edges(&self) -> &'static [OrderStatus] {
        match self {
            OrderStatus::Created => &[OrderStatus::Pending],
            OrderStatus::Pending => &[OrderStatus::PendingPayment],
            OrderStatus::PendingPayment => &[OrderStatus::Confirmed],
            OrderStatus::Confirmed => &[OrderStatus::Paid],
            OrderStatus::Paid => &[OrderStatus::Packed],
            OrderStatus::Packed => &[OrderStatus::Shipped],
            OrderStatus::Shipped => &[OrderStatus::Delivered, OrderStatus::OutForInspection],
            OrderStatus::OutForInspection => &[OrderStatus::Delivered, OrderStatus::Returned],
            OrderStatus::Delivered => &[OrderStatus::ReturnRequested],
            OrderStatus::ReturnRequested => &[OrderStatus::ReturnPickedUp],
            OrderStatus::ReturnPickedUp => &[OrderStatus::QcInProgress],
            OrderStatus::QcInProgress => &[OrderStatus::Returned],
            OrderStatus::Returned | OrderStatus::Cancelled => &[],
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Same-state is always valid (idempotent no-op); Cancelled is reachable from
/// every non-terminal state; everything else follows the static table.
pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
    if from == to {
        return true;
    }
    if to == OrderStatus::Cancelled {
        return !from.is_terminal();
    }
    from.forward_edges().contains(&to)
}

/// Rejects illegal transitions unless an admin override is in effect. Every
/// illegal attempt, allowed or not, is logged with actor, role, and both
/// statuses. The override flag is caller-supplied; non-admin roles cannot use
/// it regardless of what the caller passes.
pub fn validate_transition(
    from: OrderStatus,
    to: OrderStatus,
    actor: &str,
    role: UserRole,
    allow_admin_override: bool,
) -> CommerceResult<()> {
    if is_valid_transition(from, to) {
        return Ok(());
    }

    let override_honored = allow_admin_override && role.is_admin();
    warn!(
        actor,
        role = role.as_str(),
        from = from.as_str(),
        to = to.as_str(),
        override_honored,
        "illegal order transition attempted"
    );

    if override_honored {
        return Ok(());
    }
    Err(CommerceError::IllegalTransition { from, to })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OrderStatus; 14] = [
        OrderStatus::Created,
        OrderStatus::Pending,
        OrderStatus::PendingPayment,
        OrderStatus::Confirmed,
        OrderStatus::Paid,
        OrderStatus::Packed,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::OutForInspection,
        OrderStatus::ReturnRequested,
        OrderStatus::ReturnPickedUp,
        OrderStatus::QcInProgress,
        OrderStatus::Returned,
        OrderStatus::Cancelled,
    ];

    #[test]
    fn same_state_is_always_valid() {
        for status in ALL {
            assert!(is_valid_transition(status, status));
        }
    }

    #[test]
    fn happy_path_is_fully_connected() {
        let path = [
            OrderStatus::Created,
            OrderStatus::Pending,
            OrderStatus::PendingPayment,
            OrderStatus::Confirmed,
            OrderStatus::Paid,
            OrderStatus::Packed,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
        ];
        for pair in path.windows(2) {
            assert!(is_valid_transition(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn cancel_reachable_from_every_non_terminal_state() {
        for status in ALL {
            let expected = !status.is_terminal();
            assert_eq!(
                is_valid_transition(status, OrderStatus::Cancelled),
                expected,
                "{status} -> CANCELLED"
            );
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for status in ALL {
            assert!(!is_valid_transition(OrderStatus::Returned, status) || status == OrderStatus::Returned);
            assert!(!is_valid_transition(OrderStatus::Cancelled, status) || status == OrderStatus::Cancelled);
        }
    }

    #[test]
    fn return_flow_is_ordered() {
        assert!(is_valid_transition(
            OrderStatus::Delivered,
            OrderStatus::ReturnRequested
        ));
        assert!(is_valid_transition(
            OrderStatus::ReturnRequested,
            OrderStatus::ReturnPickedUp
        ));
        assert!(is_valid_transition(
            OrderStatus::ReturnPickedUp,
            OrderStatus::QcInProgress
        ));
        assert!(is_valid_transition(
            OrderStatus::QcInProgress,
            OrderStatus::Returned
        ));
        // No skipping QC.
        assert!(!is_valid_transition(
            OrderStatus::ReturnPickedUp,
            OrderStatus::Returned
        ));
    }

    #[test]
    fn inspection_can_resolve_either_way() {
        assert!(is_valid_transition(
            OrderStatus::Shipped,
            OrderStatus::OutForInspection
        ));
        assert!(is_valid_transition(
            OrderStatus::OutForInspection,
            OrderStatus::Delivered
        ));
        assert!(is_valid_transition(
            OrderStatus::OutForInspection,
            OrderStatus::Returned
        ));
    }

    #[test]
    fn backwards_jumps_are_rejected() {
        assert!(!is_valid_transition(OrderStatus::Paid, OrderStatus::Pending));
        assert!(!is_valid_transition(
            OrderStatus::Delivered,
            OrderStatus::Shipped
        ));
        assert!(!is_valid_transition(
            OrderStatus::Created,
            OrderStatus::Confirmed
        ));
    }

    #[test]
    fn validate_honors_admin_override_only_for_admins() {
        let err = validate_transition(
            OrderStatus::Delivered,
            OrderStatus::Paid,
            "support-1",
            UserRole::Customer,
            true,
        );
        assert!(matches!(
            err,
            Err(CommerceError::IllegalTransition { .. })
        ));

        validate_transition(
            OrderStatus::Delivered,
            OrderStatus::Paid,
            "admin-1",
            UserRole::Admin,
            true,
        )
        .expect("admin override should permit the transition");

        let err = validate_transition(
            OrderStatus::Delivered,
            OrderStatus::Paid,
            "admin-1",
            UserRole::Admin,
            false,
        );
        assert!(err.is_err());
    }

    #[test]
    fn pre_payment_storage_forms_track_the_const() {
        let strings = OrderStatus::pre_payment_strings();
        assert_eq!(strings.len(), OrderStatus::PRE_PAYMENT.len());
        for status in OrderStatus::PRE_PAYMENT {
            assert!(strings.contains(&status.as_str().to_string()));
            assert!(!status.is_paid_equivalent());
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn round_trips_through_storage_form() {
        for status in ALL {
            assert_eq!(OrderStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(OrderStatus::parse("SHRODINGER").is_err());
    }
}
