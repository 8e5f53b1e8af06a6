//! Swap deputy - unattended relay of hashed-timelock swaps between Binance Chain and Kava
//!
//! The deputy watches each origin chain for swaps addressed to it, mirrors them
//! on the destination chain out of its own custody, relays the secret revealed
//! by the counterpart's claim back to the origin, and refunds both legs when
//! the counterpart never claims.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod relay;
pub mod retry;
pub mod service;
pub mod store;

pub use error::{DeputyError, DeputyResult};
pub use service::DeputyService;
