use std::{ops::Deref, time::Duration};

use fake_user_agent::get_chrome_rua;
use reqwest::{Client, ClientBuilder};

use crate::BdownResult;

/// Slow mobile networks need a long connect/read window.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Cloneable HTTP handle passed explicitly to every component that talks to
/// the network.
#[derive(Clone, Debug)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> BdownResult<Self> {
        let client = builder.build()?;
        Ok(Self { client })
    }

    /// Builder preloaded with a browser user agent and [DEFAULT_TIMEOUT].
    pub fn builder() -> ClientBuilder {
        Client::builder()
            .user_agent(get_chrome_rua())
            .connect_timeout(DEFAULT_TIMEOUT)
            .read_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> BdownResult<Self> {
        Self::new(
            Self::builder()
                .connect_timeout(timeout)
                .read_timeout(timeout),
        )
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        match Self::new(Self::builder()) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("Failed to build configured HTTP client, using defaults: {e}");
                Self {
                    client: Client::new(),
                }
            }
        }
    }
}

impl From<Client> for HttpClient {
    fn from(client: Client) -> Self {
        Self { client }
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
