use std::time::Duration;

use reqwest::{blocking::Client, header};
use url::Url;

use crate::{config::FlagFormat, Error, Result};

use super::{extract_flag, FlagReader};

/// Reads a flag document over HTTP, e.g. a raw file from a Git host.
#[derive(Debug, Clone)]
pub struct HttpReader {
    client: Client,
    url: Url,
    token: Option<String>,
    format: FlagFormat,
}

impl HttpReader {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(url: &str, token: Option<String>, format: FlagFormat) -> Result<HttpReader> {
        let url = Url::parse(url).map_err(Error::InvalidUrl)?;
        let client = Client::builder()
            .timeout(HttpReader::REQUEST_TIMEOUT)
            .build()?;
        Ok(HttpReader {
            client,
            url,
            token: token.filter(|token| !token.is_empty()),
            format,
        })
    }
}

impl FlagReader for HttpReader {
    fn read_all(&self) -> Result<Vec<u8>> {
        log::debug!(target: "flagserve", "fetching flags from {}", self.url);
        let mut request = self
            .client
            .get(self.url.clone())
            // Git hosts serve file contents instead of metadata with this.
            .header(header::ACCEPT, "application/vnd.github.raw");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            log::warn!(target: "flagserve", "received non-2xx response while fetching flags: {:?}", status);
            return Err(Error::UnexpectedStatus(status));
        }
        Ok(response.bytes()?.to_vec())
    }

    fn read_by_key(&self, key: &str) -> Result<Vec<u8>> {
        extract_flag(&self.read_all()?, self.format, key)
    }
}
