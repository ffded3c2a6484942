//! All-or-nothing position management over a collateralized money market.
//!
//! [`PositionManager`] drives the supply, redeem, enter-and-borrow and repay
//! flows against the collaborators in [`mmpos_protocol::Collaborators`],
//! recording completed steps in a compensation [`Journal`] so that a failed
//! operation leaves no partial effects behind.

pub mod error;
pub mod journal;
pub mod manager;

pub use error::{PositionError, PositionResult};
pub use journal::{Compensation, Journal};
pub use manager::{BorrowReceipt, PositionManager};
