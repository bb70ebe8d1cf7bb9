//! Client for the Otakus Nexus HTTP API.
//!
//! Requests carry the stored bearer token, survive a single token refresh on
//! 401, honour `Retry-After` on 429, and are queued while offline.

mod client;
mod connectivity;
mod transport;
mod types;

pub use client::{ApiClient, ClientSettings, AUTH_TOKEN_KEY, REFRESH_TOKEN_KEY};
pub use connectivity::{Connectivity, HttpConnectivity, ManualConnectivity};
pub use transport::{HttpTransport, RequestSender};
pub use types::{ApiEvent, ApiRequest, ApiResponse, ClientStats, HttpMethod};
