//! Client-side data synchronization for the dashboard backend.
//!
//! - [`cache`]: keyed query cache with stale-while-revalidate reads
//! - [`mutation`]: optimistic writes with rollback, and batched writes
//! - [`notifications`]: the notification list and unread count on top of both
//! - [`realtime`]: the shared push connection feeding notifications in

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod logging;
pub mod mutation;
pub mod notifications;
pub mod realtime;
pub mod retry;

pub use api::{ApiError, ErrorClass};
pub use cache::{CacheKey, QueryCache};
pub use config::Config;
