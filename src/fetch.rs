// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use reqwest::{Response, StatusCode, header};
use url::Url;

use crate::errors::{Error, Result};

/// HTTP transport for manifest and archive retrieval.
///
/// Thin wrapper around a shared [`reqwest::Client`] that enforces the
/// status codes the pipelines rely on: plain GETs must answer `200 OK`,
/// ranged GETs must answer `206 Partial Content` with an exact
/// `Content-Length`. A server ignoring the `Range` header is a protocol
/// error, not a fallback.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    /// Creates a fetcher with a fresh client.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder().build()?;

        Ok(Self { client })
    }

    /// Issues a GET and requires status `200 OK`.
    pub async fn get(&self, url: &Url) -> Result<Response> {
        let response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::BadStatus {
                expected: StatusCode::OK.as_u16(),
                got: status.as_u16(),
            });
        }

        tracing::debug!(":: get {url}");

        Ok(response)
    }

    /// Issues a GET for the half-open byte range `[start, end)`.
    ///
    /// Requires status `206 Partial Content`; if the response carries a
    /// `Content-Length` it must equal `end - start`.
    pub async fn get_range(&self, url: &Url, start: u64, end: u64) -> Result<Response> {
        let range = format!("bytes={}-{}", start, end - 1);
        let response = self
            .client
            .get(url.clone())
            .header(header::RANGE, range)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(Error::BadStatus {
                expected: StatusCode::PARTIAL_CONTENT.as_u16(),
                got: status.as_u16(),
            });
        }

        let expected = end - start;
        if let Some(length) = content_length(&response) {
            if length != expected {
                return Err(Error::BadContentLength {
                    expected,
                    got: length,
                });
            }
        }

        tracing::debug!(":: get {url} [{start}, {end})");

        Ok(response)
    }
}

/// The `Content-Length` header of a response, if present and well formed.
pub(crate) fn content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}
