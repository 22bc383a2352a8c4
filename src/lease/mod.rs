//! Remote daemon leasing.

mod client;

pub use client::{LeaseClient, LeaseConfig, LeaseDetails};
