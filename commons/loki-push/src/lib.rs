//! Client for the Loki HTTP push API.
//!
//! Only the JSON flavour of `/loki/api/v1/push` is spoken here, together with
//! the `/ready` endpoint used as a liveness probe. Batching, retries and
//! backoff are left to callers.

mod client;
mod error;
mod payload;

pub use client::{LokiClient, PUSH_PATH, READY_PATH};
pub use error::PushError;
pub use payload::{PushEntry, PushStream};
