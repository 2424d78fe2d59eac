use std::time::Duration;

use reqwest::redirect;

use crate::config::EdgeConfig;

/// The `User-Agent` the edge node identifies itself with towards the origin.
pub const USER_AGENT: &str = concat!("mediacdn/", env!("CARGO_PKG_VERSION"));

/// Timeouts for requests to the origin.
#[derive(Copy, Clone, Debug)]
pub struct OriginTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one request, including reading the complete body.
    pub max_download: Duration,
}

impl OriginTimeouts {
    pub fn from_config(config: &EdgeConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for OriginTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            max_download: Duration::from_secs(60),
        }
    }
}

/// Creates a [`reqwest::Client`] for talking to the origin.
///
/// Both the connect phase and every complete request are bounded by `timeouts`.
pub fn create_client(timeouts: &OriginTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .user_agent(USER_AGENT)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(redirect::Policy::limited(10))
        .build()
}
