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

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::errors::{Error, Result};

/// Cross-process mutex bound to a filesystem path.
///
/// Acquisition creates the lock file exclusively; a fresh lock held by
/// another process fails immediately with [`Error::Locked`], while a
/// stale one (no heartbeat within the staleness window) is taken over.
/// A background task refreshes the file every interval and invokes the
/// compromise callback once if the file disappears or changes owner.
/// After a compromise the lock no longer touches the file; release
/// leaves it to the new owner.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    compromised: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    heartbeat: Option<JoinHandle<()>>,
}

impl LockFile {
    /// Age after which a lock file may be taken over.
    pub const DEFAULT_STALE: Duration = Duration::from_secs(30);

    /// Interval between heartbeat refreshes.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

    /// Acquires the lock with default staleness and heartbeat timings.
    pub async fn acquire(
        path: impl Into<PathBuf>,
        on_compromised: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::acquire_with(
            path,
            Self::DEFAULT_STALE,
            Self::DEFAULT_INTERVAL,
            on_compromised,
        )
        .await
    }

    /// Acquires the lock with explicit staleness and heartbeat timings.
    pub async fn acquire_with(
        path: impl Into<PathBuf>,
        stale: Duration,
        interval: Duration,
        on_compromised: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<Self> {
        let path = path.into();

        match fs::metadata(&path).await {
            Ok(metadata) => {
                let age = metadata
                    .modified()
                    .ok()
                    .and_then(|modified| modified.elapsed().ok())
                    .unwrap_or(Duration::ZERO);

                if age < stale {
                    return Err(Error::Locked);
                }

                tracing::debug!(":: taking over stale lock at {}", path.display());

                match fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(error) if error.kind() == ErrorKind::NotFound => {}
                    Err(error) => return Err(error.into()),
                }
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }

        let token = new_token();

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::Locked);
            }
            Err(error) => return Err(error.into()),
        };

        file.write_all(token.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        let compromised = Arc::new(AtomicBool::new(false));
        let (shutdown, observer) = watch::channel(false);

        let heartbeat = tokio::spawn(heartbeat(
            path.clone(),
            token,
            interval,
            observer,
            Arc::clone(&compromised),
            on_compromised,
        ));

        Ok(Self {
            path,
            compromised,
            shutdown,
            heartbeat: Some(heartbeat),
        })
    }

    /// Whether the lock has been observed compromised.
    pub fn is_compromised(&self) -> bool {
        self.compromised.load(Ordering::Acquire)
    }

    /// Stops the heartbeat and removes the lock file.
    ///
    /// A compromised lock file belongs to whoever replaced it and is
    /// left untouched.
    pub async fn release(mut self) -> Result<()> {
        self.shutdown.send_replace(true);

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.await.ok();
        }

        if !self.is_compromised() {
            match fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }

        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // Released locks have taken the handle; anything else just stops
        // heartbeating and goes stale for the next acquirer.
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

async fn heartbeat(
    path: PathBuf,
    token: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    compromised: Arc<AtomicBool>,
    on_compromised: impl Fn(&str) + Send + 'static,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of an interval fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let reason = match fs::read(&path).await {
            Ok(contents) if contents == token.as_bytes() => {
                // Refresh the modification time for staleness checks.
                match fs::write(&path, token.as_bytes()).await {
                    Ok(()) => continue,
                    Err(error) => format!("failed to refresh lock file: {error}"),
                }
            }
            Ok(_) => "lock file was taken over by another owner".to_string(),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                "lock file was removed".to_string()
            }
            Err(error) => format!("failed to read lock file: {error}"),
        };

        compromised.store(true, Ordering::Release);
        tracing::warn!(":: lock compromised: {reason}");
        on_compromised(&reason);
        break;
    }
}

fn new_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();

    format!("{}-{}\n", process::id(), nanos)
}
