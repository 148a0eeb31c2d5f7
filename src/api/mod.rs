//! Backend access: envelope handling, failure classification and the
//! notification endpoints.

mod caller;
mod client;
mod envelope;
mod error;
mod notifications;
pub mod types;

pub use caller::{ErrorReporter, RemoteCaller, TracingReporter, DEFAULT_TIMEOUT};
pub use client::ApiClient;
pub use envelope::{Envelope, ErrorBody};
pub use error::{ApiError, ErrorClass};
pub use notifications::NotificationBackend;

#[cfg(test)]
pub(crate) use caller::testing;
