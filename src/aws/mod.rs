//! AWS plumbing: sessions, the API seams and the SDK transport.
//!
//! - [`session`] - The [`Session`](session::Session) handle and shared config loading
//! - [`api`] - `ApiError` and the `Transport`/`Connector` seams
//! - [`sdk`] - Service Quotas and CloudWatch calls through the AWS SDK

pub mod api;
pub mod sdk;
pub mod session;
