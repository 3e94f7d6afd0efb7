pub mod reservation;
pub mod stock;
pub mod sweep;

pub use reservation::{ReservationLedger, counter_key};
pub use stock::{available_stock, deduct, restore};
pub use sweep::run_reservation_sweep;
