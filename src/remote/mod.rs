//! Everything that talks to the outside world over HTTPS.

pub mod checkout;
pub mod client;
pub mod outcome;
pub mod types;

pub use checkout::{CheckoutClient, CheckoutRequest};
pub use client::{Filter, FilterOp, ResourceClient};
pub use outcome::RemoteOutcome;
