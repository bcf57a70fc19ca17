pub mod client;

pub use client::{BackfillProvider, BackfillRequest, DeltaClient};
