//! Client for the external results service.
//!
//! This module provides:
//! - A global minimum-spacing gate for outbound calls
//! - An audience-keyed token cache with expiry-aware refresh
//! - The batched map-records client behind the `RecordsProvider` seam

pub mod auth;
pub mod client;
pub mod rate_limit;

pub use auth::{Audience, NadeoCredentials, TokenCache};
pub use client::{FetchedRecord, NadeoClient, RecordsProvider};
pub use rate_limit::CallGate;
