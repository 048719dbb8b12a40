//! Transports over the hub HTTPS REST API
//!
//! Every request carries a freshly generated SAS token. The REST surface
//! does not offer every capability, unsupported operations fail with
//! [`TransportError::Unsupported`].

mod device;
mod sas;
mod service;

pub use device::HttpDeviceTransport;
pub use sas::{TOKEN_TTL, expiry_from_now, generate_sas_token};
pub use service::HttpServiceClient;

use std::time::Duration;

use reqwest::{Response, StatusCode};
use url::Url;

use crate::error::TransportError;

/// Maximum time to wait for a single request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Time to wait before the next poll when a receive finds nothing
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
struct Endpoint {
    base: Url,
    host_name: String,
    api_version: &'static str,
}

impl Endpoint {
    fn new(base: Url, host_name: &str, api_version: &'static str) -> Self {
        Self {
            base,
            host_name: host_name.to_owned(),
            api_version,
        }
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        let mut url = self.base.join(path)?;
        url.query_pairs_mut()
            .append_pair("api-version", self.api_version);
        Ok(url)
    }
}

fn default_base_url(host_name: &str) -> Result<Url, TransportError> {
    Ok(Url::parse(&format!("https://{host_name}"))?)
}

fn client() -> Result<reqwest::Client, TransportError> {
    Ok(reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

/// Map non-success responses to a transport error
async fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Unauthorized,
        StatusCode::NOT_FOUND => TransportError::NotFound(body),
        StatusCode::PRECONDITION_FAILED => TransportError::PreconditionFailed,
        _ => TransportError::Status(status.as_u16(), body),
    })
}

/// Read the lock token of a received message, the hub sends it quoted in
/// the ETag header
fn lock_token(response: &Response) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim_matches('"').to_owned())
}
