//! Wallet status reads: [`StatusReader`] in front of a short-lived
//! [`StatusCache`].

pub mod cache;
pub mod reader;

pub use cache::{CacheEntry, StatusCache};
pub use reader::{OnchainFields, ReadOptions, StatusReader};
