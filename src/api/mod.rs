//! Backend API access: client, request pipeline, and error types.

pub mod client;
pub mod error;

pub use client::{ApiClient, Payload};
pub use error::ApiError;
