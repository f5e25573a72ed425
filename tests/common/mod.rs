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

//! Shared harness for the end-to-end suite: a package server speaking
//! plain and ranged GETs, archive fixtures, and an event recorder.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use sha2::Digest as _;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use url::Url;

use shockpkg::Manager;
use shockpkg::events::{Event, PackageEvent};

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha2::Sha256::digest(data))
}

pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(sha1::Sha1::digest(data))
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5::Md5::digest(data))
}

/// Deterministic pseudo-random payload bytes.
pub fn payload_bytes(tag: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(tag))
        .collect()
}

pub struct BuiltEntry {
    pub name: String,
    pub method: u16,
    pub data_offset: u64,
    pub compressed_size: u64,
}

pub struct BuiltZip {
    pub bytes: Vec<u8>,
    pub entries: Vec<BuiltEntry>,
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Builds a classic ZIP archive; `true` deflates the entry.
pub fn build_zip(entries: &[(&str, &[u8], bool)]) -> BuiltZip {
    let mut out = Vec::new();
    let mut built = Vec::new();
    let mut records = Vec::new();

    for (name, data, deflated) in entries {
        let offset = out.len() as u32;
        let method: u16 = if *deflated { 8 } else { 0 };
        let compressed = if *deflated { deflate(data) } else { data.to_vec() };

        let crc = {
            let mut crc = flate2::Crc::new();
            crc.update(data);
            crc.sum()
        };

        push_u32(&mut out, 0x04034b50);
        push_u16(&mut out, 20);
        push_u16(&mut out, 0);
        push_u16(&mut out, method);
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        push_u32(&mut out, crc);
        push_u32(&mut out, compressed.len() as u32);
        push_u32(&mut out, data.len() as u32);
        push_u16(&mut out, name.len() as u16);
        push_u16(&mut out, 0);
        out.extend_from_slice(name.as_bytes());

        built.push(BuiltEntry {
            name: name.to_string(),
            method,
            data_offset: out.len() as u64,
            compressed_size: compressed.len() as u64,
        });

        out.extend_from_slice(&compressed);
        records.push((*name, method, crc, compressed.len() as u32, data.len() as u32, offset));
    }

    let directory_offset = out.len() as u32;

    for (name, method, crc, compressed_size, uncompressed_size, offset) in &records {
        push_u32(&mut out, 0x02014b50);
        push_u16(&mut out, 20);
        push_u16(&mut out, 20);
        push_u16(&mut out, 0);
        push_u16(&mut out, *method);
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        push_u32(&mut out, *crc);
        push_u32(&mut out, *compressed_size);
        push_u32(&mut out, *uncompressed_size);
        push_u16(&mut out, name.len() as u16);
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        push_u32(&mut out, 0);
        push_u32(&mut out, *offset);
        out.extend_from_slice(name.as_bytes());
    }

    let directory_size = out.len() as u32 - directory_offset;

    push_u32(&mut out, 0x06054b50);
    push_u16(&mut out, 0);
    push_u16(&mut out, 0);
    push_u16(&mut out, records.len() as u16);
    push_u16(&mut out, records.len() as u16);
    push_u32(&mut out, directory_size);
    push_u32(&mut out, directory_offset);
    push_u16(&mut out, 0);

    BuiltZip {
        bytes: out,
        entries: built,
    }
}

struct ServerState {
    files: Mutex<HashMap<String, Vec<u8>>>,
    ignore_range: AtomicBool,
}

/// Minimal package server: GET answers 200 with the stored body, GET
/// with a `Range` header answers 206 with the slice.
pub struct TestServer {
    base: String,
    state: Arc<ServerState>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState {
            files: Mutex::new(HashMap::new()),
            ignore_range: AtomicBool::new(false),
        });

        let app = Router::new().fallback(serve).with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            state,
            handle,
        }
    }

    pub fn put(&self, path: &str, bytes: Vec<u8>) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), bytes);
    }

    pub fn remove(&self, path: &str) {
        self.state.files.lock().unwrap().remove(path);
    }

    /// Makes the server answer range requests with a full 200 body.
    pub fn set_ignore_range(&self, ignore: bool) {
        self.state.ignore_range.store(ignore, Ordering::SeqCst);
    }

    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("{}{path}", self.base)).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(State(state): State<Arc<ServerState>>, uri: Uri, headers: HeaderMap) -> Response {
    let Some(body) = state.files.lock().unwrap().get(uri.path()).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_range);

    match range {
        Some((start, end)) if !state.ignore_range.load(Ordering::SeqCst) => {
            let total = body.len() as u64;
            let end = end.min(total.saturating_sub(1));

            if start > end {
                return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            }

            let slice = body[start as usize..=end as usize].to_vec();

            (
                StatusCode::PARTIAL_CONTENT,
                [(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{total}"),
                )],
                slice,
            )
                .into_response()
        }
        _ => body.into_response(),
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;

    Some((start.parse().ok()?, end.parse().ok()?))
}

/// A fresh installation root plus a server stocked with the test
/// catalog: `single` (plain root), `multi` (root archive with children
/// `multi-a`, `multi-b` and the intentionally broken `multi-ghost`),
/// and the three level chain `nested-2` > `nested-1` > `nested`.
pub struct Fixture {
    pub server: TestServer,
    pub dir: TempDir,
    pub manifest: serde_json::Value,
    payloads: HashMap<String, Vec<u8>>,
}

pub async fn fixture() -> Fixture {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();

    let server = TestServer::start().await;

    let single = payload_bytes(0x11, 3000);
    let multi_a = payload_bytes(0x22, 2000);
    let multi_b = payload_bytes(0x33, 2500);
    let nested = payload_bytes(0x44, 40_000);

    let nested_1 = build_zip(&[("files/nested.bin", &nested, true)]);
    let nested_2 = build_zip(&[("inner/nested-1.zip", &nested_1.bytes, true)]);
    let multi = build_zip(&[
        ("a/multi-a.bin", &multi_a, true),
        ("b/multi-b.bin", &multi_b, false),
    ]);

    let zipped = |zip: &BuiltZip, name: &str| {
        let entry = zip.entries.iter().find(|entry| entry.name == name).unwrap();
        format!(
            "{}-{}-{}",
            entry.method, entry.data_offset, entry.compressed_size
        )
    };

    let root = |name: &str, file: &str, data: &[u8], source: &Url| {
        json!({
            "name": name,
            "file": file,
            "size": data.len(),
            "sha256": sha256_hex(data),
            "sha1": sha1_hex(data),
            "md5": md5_hex(data),
            "source": source.as_str(),
        })
    };

    let mut manifest = json!({
        "format": "1.2",
        "packages": [
            root("single", "single.bin", &single, &server.url("/archives/single.bin")),
            root("multi", "multi.zip", &multi.bytes, &server.url("/archives/multi.zip")),
            root("nested-2", "nested-2.zip", &nested_2.bytes, &server.url("/archives/nested-2.zip")),
        ],
    });

    manifest["packages"][1]["packages"] = json!([
        {
            "name": "multi-a",
            "file": "multi-a.bin",
            "size": multi_a.len(),
            "sha256": sha256_hex(&multi_a),
            "sha1": sha1_hex(&multi_a),
            "md5": md5_hex(&multi_a),
            "source": "a/multi-a.bin",
            "zipped": zipped(&multi, "a/multi-a.bin"),
        },
        {
            "name": "multi-b",
            "file": "multi-b.bin",
            "size": multi_b.len(),
            "sha256": sha256_hex(&multi_b),
            "source": "b/multi-b.bin",
            "zipped": zipped(&multi, "b/multi-b.bin"),
        },
        {
            "name": "multi-ghost",
            "file": "multi-ghost.bin",
            "size": 10,
            "sha256": "77".repeat(32),
            "source": "missing.bin",
            "zipped": "8-0-10",
        },
    ]);

    manifest["packages"][2]["packages"] = json!([{
        "name": "nested-1",
        "file": "nested-1.zip",
        "size": nested_1.bytes.len(),
        "sha256": sha256_hex(&nested_1.bytes),
        "source": "inner/nested-1.zip",
        "zipped": zipped(&nested_2, "inner/nested-1.zip"),
        "packages": [{
            "name": "nested",
            "file": "nested.bin",
            "size": nested.len(),
            "sha256": sha256_hex(&nested),
            "source": "files/nested.bin",
            "zipped": zipped(&nested_1, "files/nested.bin"),
        }],
    }]);

    server.put("/archives/single.bin", single.clone());
    server.put("/archives/multi.zip", multi.bytes.clone());
    server.put("/archives/nested-2.zip", nested_2.bytes.clone());

    let mut payloads = HashMap::new();
    payloads.insert("single".to_string(), single);
    payloads.insert("multi".to_string(), multi.bytes);
    payloads.insert("multi-a".to_string(), multi_a);
    payloads.insert("multi-b".to_string(), multi_b);
    payloads.insert("nested-2".to_string(), nested_2.bytes);
    payloads.insert("nested-1".to_string(), nested_1.bytes);
    payloads.insert("nested".to_string(), nested);

    let fixture = Fixture {
        server,
        dir: tempfile::tempdir().unwrap(),
        manifest,
        payloads,
    };
    fixture.push_manifest();

    fixture
}

impl Fixture {
    /// (Re)publishes the current manifest value on the server.
    pub fn push_manifest(&self) {
        self.server.put(
            "/packages.json",
            serde_json::to_vec(&self.manifest).unwrap(),
        );
    }

    pub fn manager(&self) -> Manager {
        Manager::with_packages_url(self.dir.path(), self.server.url("/packages.json")).unwrap()
    }

    pub fn size(&self, name: &str) -> u64 {
        self.payloads[name].len() as u64
    }

    pub fn payload(&self, name: &str) -> &[u8] {
        &self.payloads[name]
    }
}

pub type EventLog = Arc<Mutex<Vec<String>>>;

fn tag_package(log: &EventLog, channel: &Event<PackageEvent>, tag: &'static str) {
    let log = Arc::clone(log);
    channel.on(move |event| {
        log.lock().unwrap().push(format!("{tag}:{}", event.package));
    });
}

/// Records every manager event as a flat string log.
pub fn record_events(manager: &Manager) -> EventLog {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let events = manager.events();

    tag_package(&log, &events.install_before, "install-before");
    tag_package(&log, &events.install_after, "install-after");
    tag_package(&log, &events.install_current, "install-current");
    tag_package(&log, &events.download_before, "download-before");
    tag_package(&log, &events.download_after, "download-after");
    tag_package(&log, &events.extract_before, "extract-before");
    tag_package(&log, &events.extract_after, "extract-after");

    {
        let log = Arc::clone(&log);
        events.download_progress.on(move |event| {
            log.lock().unwrap().push(format!(
                "download-progress:{}:{}/{}",
                event.package, event.amount, event.total
            ));
        });
    }
    {
        let log = Arc::clone(&log);
        events.extract_progress.on(move |event| {
            log.lock().unwrap().push(format!(
                "extract-progress:{}:{}/{}",
                event.package, event.amount, event.total
            ));
        });
    }
    {
        let log = Arc::clone(&log);
        events.cleanup_before.on(move |event| {
            log.lock()
                .unwrap()
                .push(format!("cleanup-before:{}", event.package));
        });
    }
    {
        let log = Arc::clone(&log);
        events.cleanup_after.on(move |event| {
            log.lock()
                .unwrap()
                .push(format!("cleanup-after:{}:{}", event.package, event.removed));
        });
    }
    {
        let log = Arc::clone(&log);
        events.catalog_error.on(move |event| {
            log.lock()
                .unwrap()
                .push(format!("catalog-error:{}", event.error));
        });
    }
    {
        let log = Arc::clone(&log);
        events.lock_compromised.on(move |_| {
            log.lock().unwrap().push("lock-compromised".to_string());
        });
    }

    log
}

/// The log without intermediate progress events: progress lines are
/// kept only at amount 0 and amount == total.
pub fn key_events(log: &EventLog) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|line| {
            match line.rsplit(':').next().and_then(|part| part.split_once('/')) {
                Some((amount, total)) => amount == "0" || amount == total,
                None => true,
            }
        })
        .cloned()
        .collect()
}
