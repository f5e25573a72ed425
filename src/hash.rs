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

use digest::DynDigest;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use strum::{Display, EnumString};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::errors::{Error, Result};

/// Supported types of digest algorithms.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, EnumString, Display,
)]
pub enum HashAlgorithm {
    /// SHA-2 with 256 bits
    #[serde(rename = "sha256")]
    #[strum(serialize = "sha256")]
    Sha256,
    /// SHA-1
    #[serde(rename = "sha1")]
    #[strum(serialize = "sha1")]
    Sha1,
    /// MD5
    #[serde(rename = "md5")]
    #[strum(serialize = "md5")]
    Md5,
}

impl HashAlgorithm {
    /// Length of a digest of this algorithm, in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Md5 => 16,
        }
    }

    /// Length of the lowercase hex encoding of a digest of this algorithm.
    pub fn hex_len(&self) -> usize {
        self.digest_len() * 2
    }

    /// One-shot digest of `data` as lowercase hex.
    pub fn hex_digest(&self, data: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    fn hasher(&self) -> Box<dyn DynDigest + Send> {
        match self {
            HashAlgorithm::Sha256 => Box::new(sha2::Sha256::new()),
            HashAlgorithm::Sha1 => Box::new(sha1::Sha1::new()),
            HashAlgorithm::Md5 => Box::new(md5::Md5::new()),
        }
    }
}

struct ExpectedDigest {
    algorithm: HashAlgorithm,
    hasher: Box<dyn DynDigest + Send>,
    hex: String,
}

/// Streaming sink that tees writes into a hasher set and a byte counter.
///
/// Writes go to the inner sink unchanged while every declared digest is
/// updated along the way. The writer aborts as soon as the byte counter
/// would exceed the declared size; [`HashedWriter::finish`] then enforces
/// that exactly the declared number of bytes arrived and that every
/// declared digest matches.
pub struct HashedWriter<W> {
    inner: W,
    expected_size: u64,
    written: u64,
    digests: Vec<ExpectedDigest>,
}

impl<W: AsyncWrite + Unpin> HashedWriter<W> {
    /// Creates a writer checking against `size` and the given digests.
    ///
    /// Digests are `(algorithm, lowercase-hex)` pairs as declared by the
    /// catalog.
    pub fn new(
        inner: W,
        size: u64,
        digests: impl IntoIterator<Item = (HashAlgorithm, String)>,
    ) -> Self {
        let digests = digests
            .into_iter()
            .map(|(algorithm, hex)| ExpectedDigest {
                algorithm,
                hasher: algorithm.hasher(),
                hex,
            })
            .collect();

        Self {
            inner,
            expected_size: size,
            written: 0,
            digests,
        }
    }

    /// Bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Writes one chunk, updating counter and hashers.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let chunk_len = chunk.len() as u64;

        if self.written + chunk_len > self.expected_size {
            return Err(Error::ReadTooLarge {
                expected: self.expected_size,
            });
        }

        self.inner.write_all(chunk).await?;

        for digest in &mut self.digests {
            digest.hasher.update(chunk);
        }

        self.written += chunk_len;

        Ok(())
    }

    /// Flushes the sink and verifies size and digests, returning the sink.
    pub async fn finish(mut self) -> Result<W> {
        self.inner.flush().await?;

        if self.written != self.expected_size {
            return Err(Error::ReadTooSmall {
                expected: self.expected_size,
                got: self.written,
            });
        }

        for digest in self.digests {
            let got = hex::encode(digest.hasher.finalize());

            if got != digest.hex {
                return Err(Error::BadHash {
                    algorithm: digest.algorithm,
                    got,
                });
            }
        }

        Ok(self.inner)
    }
}
