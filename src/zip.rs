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

use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use flate2::{Decompress, FlushDecompress, Status};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use url::Url;

use crate::errors::{Error, Result};
use crate::fetch::Fetcher;

const LOCAL_HEADER_SIG: u32 = 0x04034b50;
const CENTRAL_HEADER_SIG: u32 = 0x02014b50;
const END_OF_CENTRAL_SIG: u32 = 0x06054b50;

const END_OF_CENTRAL_LEN: usize = 22;
const CENTRAL_HEADER_LEN: usize = 46;
const LOCAL_HEADER_LEN: u64 = 30;
const MAX_COMMENT_LEN: usize = u16::MAX as usize;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

const STREAM_CHUNK: usize = 64 * 1024;

/// Serves half-open byte ranges `[start, end)` out of a ZIP archive.
///
/// Implementations exist for local files and for remote archives via
/// HTTP `Range` requests; the reader only ever touches the ranges it
/// needs (directory records and the requested entry's compressed data).
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Total size of the archive in bytes.
    fn len(&self) -> u64;

    /// Whether the archive has no bytes at all.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the range fully into memory.
    async fn read(&self, start: u64, end: u64) -> Result<Vec<u8>>;

    /// Opens a chunked stream over the range.
    async fn stream(&self, start: u64, end: u64) -> Result<Box<dyn ChunkStream>>;
}

/// A pull based stream of byte chunks.
#[async_trait]
pub trait ChunkStream: Send {
    /// The next chunk, or `None` at the end of the stream.
    async fn next(&mut self) -> Result<Option<Bytes>>;
}

/// A [`RangeSource`] backed by a file on disk.
///
/// Every stream opens its own handle so concurrent entry reads do not
/// interfere with each other.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    /// Opens the file and records its size.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let len = fs::metadata(&path).await?.len();

        Ok(Self { path, len })
    }
}

#[async_trait]
impl RangeSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        check_range(start, end, self.len)?;

        let mut file = fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;

        let mut buffer = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buffer).await?;

        Ok(buffer)
    }

    async fn stream(&self, start: u64, end: u64) -> Result<Box<dyn ChunkStream>> {
        check_range(start, end, self.len)?;

        let mut file = fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;

        Ok(Box::new(FileChunkStream {
            file,
            remaining: end - start,
        }))
    }
}

fn check_range(start: u64, end: u64, len: u64) -> Result<()> {
    if start > end || end > len {
        return Err(Error::Archive(format!(
            "range [{start}, {end}) out of bounds for archive of {len} bytes"
        )));
    }

    Ok(())
}

struct FileChunkStream {
    file: fs::File,
    remaining: u64,
}

#[async_trait]
impl ChunkStream for FileChunkStream {
    async fn next(&mut self) -> Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let want = self.remaining.min(STREAM_CHUNK as u64) as usize;
        let mut buffer = vec![0u8; want];

        let read = self.file.read(&mut buffer).await?;
        if read == 0 {
            return Err(Error::Archive("unexpected end of archive file".into()));
        }

        buffer.truncate(read);
        self.remaining -= read as u64;

        Ok(Some(Bytes::from(buffer)))
    }
}

/// A [`RangeSource`] backed by a remote archive supporting HTTP ranges.
///
/// The archive size is taken from the catalog declaration, not probed.
/// Range responses are not hash verified; integrity of extracted entries
/// is enforced downstream against the child package declarations.
#[derive(Debug, Clone)]
pub struct HttpRangeSource {
    fetcher: Fetcher,
    url: Url,
    len: u64,
}

impl HttpRangeSource {
    /// Creates a source for `url` with the declared archive size.
    pub fn new(fetcher: Fetcher, url: Url, len: u64) -> Self {
        Self { fetcher, url, len }
    }
}

#[async_trait]
impl RangeSource for HttpRangeSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let mut stream = self.stream(start, end).await?;
        let mut buffer = Vec::with_capacity((end - start) as usize);

        while let Some(chunk) = stream.next().await? {
            buffer.extend_from_slice(&chunk);
        }

        Ok(buffer)
    }

    async fn stream(&self, start: u64, end: u64) -> Result<Box<dyn ChunkStream>> {
        check_range(start, end, self.len)?;

        let response = self.fetcher.get_range(&self.url, start, end).await?;

        Ok(Box::new(HttpChunkStream {
            response,
            expected: end - start,
            received: 0,
        }))
    }
}

struct HttpChunkStream {
    response: reqwest::Response,
    expected: u64,
    received: u64,
}

#[async_trait]
impl ChunkStream for HttpChunkStream {
    async fn next(&mut self) -> Result<Option<Bytes>> {
        match self.response.chunk().await? {
            Some(chunk) => {
                self.received += chunk.len() as u64;

                if self.received > self.expected {
                    return Err(Error::ReadTooLarge {
                        expected: self.expected,
                    });
                }

                Ok(Some(chunk))
            }
            None => {
                if self.received < self.expected {
                    return Err(Error::ReadTooSmall {
                        expected: self.expected,
                        got: self.received,
                    });
                }

                Ok(None)
            }
        }
    }
}

/// One entry of a ZIP central directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipEntry {
    /// In-archive path of the entry.
    pub path: String,
    /// Compression method; `0` stored, `8` deflated.
    pub method: u16,
    /// Size of the compressed entry data.
    pub compressed_size: u64,
    /// Size of the entry once decompressed.
    pub uncompressed_size: u64,
    header_offset: u64,
}

/// Reads ZIP archives through a [`RangeSource`].
///
/// Opening parses the end-of-central-directory record and the central
/// directory; entries are then opened individually as decompressed
/// chunk streams. Zip64 and encrypted archives are rejected.
#[derive(Debug)]
pub struct ZipReader<S> {
    source: S,
    entries: Vec<ZipEntry>,
}

impl<S: RangeSource> ZipReader<S> {
    /// Parses the archive directory from the source.
    pub async fn open(source: S) -> Result<Self> {
        let len = source.len();
        if len < END_OF_CENTRAL_LEN as u64 {
            return Err(Error::Archive("archive too small".into()));
        }

        let tail_len = len.min((END_OF_CENTRAL_LEN + MAX_COMMENT_LEN) as u64);
        let tail = source.read(len - tail_len, len).await?;

        let at = find_end_of_central(&tail)
            .ok_or_else(|| Error::Archive("end of central directory not found".into()))?;

        let entry_count = read_u16(&tail, at + 10)?;
        let directory_size = read_u32(&tail, at + 12)?;
        let directory_offset = read_u32(&tail, at + 16)?;

        if entry_count == u16::MAX
            || directory_size == u32::MAX
            || directory_offset == u32::MAX
        {
            return Err(Error::Archive("zip64 archives are not supported".into()));
        }

        let directory_end = u64::from(directory_offset) + u64::from(directory_size);
        if directory_end > len {
            return Err(Error::Archive("central directory out of bounds".into()));
        }

        let directory = source
            .read(u64::from(directory_offset), directory_end)
            .await?;
        let entries = parse_central_directory(&directory, entry_count)?;

        Ok(Self { source, entries })
    }

    /// All entries in central directory order.
    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    /// The entry whose in-archive path equals `path` exactly.
    pub fn entry(&self, path: &str) -> Option<&ZipEntry> {
        self.entries.iter().find(|entry| entry.path == path)
    }

    /// Opens a stream of the entry's decompressed contents.
    pub async fn open_entry(&self, entry: &ZipEntry) -> Result<EntryStream> {
        let header = self
            .source
            .read(entry.header_offset, entry.header_offset + LOCAL_HEADER_LEN)
            .await?;

        if read_u32(&header, 0)? != LOCAL_HEADER_SIG {
            return Err(Error::Archive("bad local header".into()));
        }

        let name_len = u64::from(read_u16(&header, 26)?);
        let extra_len = u64::from(read_u16(&header, 28)?);
        let data_start = entry.header_offset + LOCAL_HEADER_LEN + name_len + extra_len;

        if entry.compressed_size == 0 {
            return Ok(EntryStream {
                inner: EntryStreamInner::Empty,
            });
        }

        let raw = self
            .source
            .stream(data_start, data_start + entry.compressed_size)
            .await?;

        let inner = match entry.method {
            METHOD_STORED => EntryStreamInner::Stored(raw),
            METHOD_DEFLATED => EntryStreamInner::Deflated(Inflater::new(raw)),
            method => {
                return Err(Error::Archive(format!(
                    "unsupported compression method {method}"
                )));
            }
        };

        Ok(EntryStream { inner })
    }
}

fn find_end_of_central(tail: &[u8]) -> Option<usize> {
    for at in (0..=tail.len().checked_sub(END_OF_CENTRAL_LEN)?).rev() {
        if read_u32(tail, at).ok()? == END_OF_CENTRAL_SIG {
            let comment_len = read_u16(tail, at + 20).ok()? as usize;

            if at + END_OF_CENTRAL_LEN + comment_len == tail.len() {
                return Some(at);
            }
        }
    }

    None
}

fn parse_central_directory(directory: &[u8], entry_count: u16) -> Result<Vec<ZipEntry>> {
    let mut entries = Vec::with_capacity(usize::from(entry_count));
    let mut at = 0usize;

    for _ in 0..entry_count {
        if read_u32(directory, at)? != CENTRAL_HEADER_SIG {
            return Err(Error::Archive("bad central directory record".into()));
        }

        let flags = read_u16(directory, at + 8)?;
        let method = read_u16(directory, at + 10)?;
        let compressed_size = read_u32(directory, at + 20)?;
        let uncompressed_size = read_u32(directory, at + 24)?;
        let name_len = usize::from(read_u16(directory, at + 28)?);
        let extra_len = usize::from(read_u16(directory, at + 30)?);
        let comment_len = usize::from(read_u16(directory, at + 32)?);
        let header_offset = read_u32(directory, at + 42)?;

        if flags & 0x1 != 0 {
            return Err(Error::Archive("encrypted entries are not supported".into()));
        }

        if compressed_size == u32::MAX || uncompressed_size == u32::MAX || header_offset == u32::MAX
        {
            return Err(Error::Archive("zip64 archives are not supported".into()));
        }

        let name = directory
            .get(at + CENTRAL_HEADER_LEN..at + CENTRAL_HEADER_LEN + name_len)
            .ok_or_else(truncated)?;
        let path = String::from_utf8(name.to_vec())
            .map_err(|_| Error::Archive("entry name is not valid utf-8".into()))?;

        entries.push(ZipEntry {
            path,
            method,
            compressed_size: u64::from(compressed_size),
            uncompressed_size: u64::from(uncompressed_size),
            header_offset: u64::from(header_offset),
        });

        at += CENTRAL_HEADER_LEN + name_len + extra_len + comment_len;
    }

    Ok(entries)
}

/// Decompressed contents of a single archive entry, pulled chunkwise.
pub struct EntryStream {
    inner: EntryStreamInner,
}

enum EntryStreamInner {
    Empty,
    Stored(Box<dyn ChunkStream>),
    Deflated(Inflater),
}

impl EntryStream {
    /// The next decompressed chunk, or `None` at the end of the entry.
    pub async fn next(&mut self) -> Result<Option<Bytes>> {
        match &mut self.inner {
            EntryStreamInner::Empty => Ok(None),
            EntryStreamInner::Stored(raw) => raw.next().await,
            EntryStreamInner::Deflated(inflater) => inflater.next().await,
        }
    }
}

/// Streaming raw-deflate decoder over a compressed chunk stream.
struct Inflater {
    source: Box<dyn ChunkStream>,
    decompress: Decompress,
    pending: Bytes,
    done: bool,
}

impl Inflater {
    fn new(source: Box<dyn ChunkStream>) -> Self {
        Self {
            source,
            decompress: Decompress::new(false),
            pending: Bytes::new(),
            done: false,
        }
    }

    async fn next(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.done {
                return Ok(None);
            }

            if self.pending.is_empty() {
                match self.source.next().await? {
                    Some(chunk) => self.pending = chunk,
                    None => {
                        return Err(Error::Archive("deflate stream ended unexpectedly".into()));
                    }
                }
            }

            let mut output = vec![0u8; STREAM_CHUNK];
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();

            let status = self
                .decompress
                .decompress(&self.pending, &mut output, FlushDecompress::None)
                .map_err(|error| Error::Archive(format!("deflate error: {error}")))?;

            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;

            self.pending.advance(consumed);

            if status == Status::StreamEnd {
                self.done = true;
            }

            if produced > 0 {
                output.truncate(produced);
                return Ok(Some(Bytes::from(output)));
            }

            if !self.done && consumed == 0 {
                // The decoder wants more input than one chunk provides.
                match self.source.next().await? {
                    Some(chunk) => {
                        let mut merged = BytesMut::from(&self.pending[..]);
                        merged.extend_from_slice(&chunk);
                        self.pending = merged.freeze();
                    }
                    None => {
                        return Err(Error::Archive("deflate stream ended unexpectedly".into()));
                    }
                }
            }
        }
    }
}

fn truncated() -> Error {
    Error::Archive("truncated archive record".into())
}

fn read_u16(data: &[u8], at: usize) -> Result<u16> {
    let bytes = data.get(at..at + 2).ok_or_else(truncated)?;

    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], at: usize) -> Result<u32> {
    let bytes = data.get(at..at + 4).ok_or_else(truncated)?;

    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
