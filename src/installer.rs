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
use std::path::{Path, PathBuf};

use tokio::fs;
use url::Url;

use crate::config::{META_DIR, TMP_DIR};
use crate::errors::{Error, Result};
use crate::events::{Event, ManagerEvents, PackageEvent, ProgressEvent};
use crate::fetch::{Fetcher, content_length};
use crate::hash::HashedWriter;
use crate::package::Package;
use crate::planner::InstallPlanner;
use crate::receipt::{Receipt, ReceiptStore};
use crate::zip::{FileSource, HttpRangeSource, RangeSource, ZipReader};

/// How much of the ancestor chain an install materializes to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstallMode {
    /// Only the target is installed; outer archives are range-streamed
    /// and intermediate extractions are discarded after use.
    Slim,
    /// Every chain member is installed with its own receipt.
    Full,
}

/// Orchestrates download and extract pipelines for one install.
pub(crate) struct Installer<'a> {
    root: &'a Path,
    receipts: &'a ReceiptStore,
    fetcher: &'a Fetcher,
    events: &'a ManagerEvents,
}

/// Source of the next extraction stage in a slim install chain.
enum Stage {
    Start,
    Streamed(ZipReader<HttpRangeSource>),
    File(PathBuf),
}

impl<'a> Installer<'a> {
    pub(crate) fn new(
        root: &'a Path,
        receipts: &'a ReceiptStore,
        fetcher: &'a Fetcher,
        events: &'a ManagerEvents,
    ) -> Self {
        Self {
            root,
            receipts,
            fetcher,
            events,
        }
    }

    /// Installs `target`, returning the chain members that were fully
    /// materialized. Empty when the target was already current.
    pub(crate) async fn install(
        &self,
        target: &Package,
        mode: InstallMode,
    ) -> Result<Vec<Package>> {
        let planner = InstallPlanner::new(self.receipts);
        let list = planner.install_list(target).await?;

        if list.is_empty() {
            tracing::debug!(":: {} is already current", target.name());
            self.events.install_current.emit(&PackageEvent {
                package: target.clone(),
            });

            return Ok(Vec::new());
        }

        self.recreate_tmp().await?;

        let result = match mode {
            InstallMode::Slim => self.install_slim(target, &list).await,
            InstallMode::Full => self.install_full(&list).await,
        };

        // Scratch is removed on success and failure alike; installed
        // state stays consistent because the receipt is the last write.
        self.remove_tmp().await;

        result
    }

    async fn install_slim(&self, target: &Package, list: &[Package]) -> Result<Vec<Package>> {
        self.events.install_before.emit(&PackageEvent {
            package: target.clone(),
        });

        let tmp = self.tmp_dir();
        let mut materialized = Vec::new();
        let mut stage = Stage::Start;

        for package in list {
            let dest = tmp.join(package.sha256());

            stage = match stage {
                Stage::Start => match package.parent() {
                    Some(parent) => {
                        let archive = self.receipts.installed_file(parent.name()).await?;
                        self.extract_from_file(&archive, package, &dest).await?;
                        materialized.push(package.clone());

                        Stage::File(dest)
                    }
                    None if list.len() > 1 => {
                        let url = Url::parse(package.source())?;
                        let source =
                            HttpRangeSource::new(self.fetcher.clone(), url, package.size());

                        Stage::Streamed(ZipReader::open(source).await?)
                    }
                    None => {
                        self.download(package, &dest).await?;
                        materialized.push(package.clone());

                        Stage::File(dest)
                    }
                },
                Stage::Streamed(reader) => {
                    self.extract(&reader, package, &dest).await?;
                    materialized.push(package.clone());

                    Stage::File(dest)
                }
                Stage::File(source) => {
                    self.extract_from_file(&source, package, &dest).await?;
                    // The previous stage only existed to be extracted from.
                    fs::remove_file(&source).await.ok();
                    materialized.push(package.clone());

                    Stage::File(dest)
                }
            };
        }

        let Stage::File(staged) = stage else {
            unreachable!("the install chain always materializes the target");
        };

        self.promote(target, &staged).await?;

        self.events.install_after.emit(&PackageEvent {
            package: target.clone(),
        });
        tracing::info!(":: installed {}", target.name());

        Ok(materialized)
    }

    async fn install_full(&self, list: &[Package]) -> Result<Vec<Package>> {
        let tmp = self.tmp_dir();
        let mut installed = Vec::new();

        for package in list {
            self.events.install_before.emit(&PackageEvent {
                package: package.clone(),
            });

            let dest = tmp.join(package.sha256());

            match package.parent() {
                None => self.download(package, &dest).await?,
                Some(parent) => {
                    let archive = self.receipts.installed_file(parent.name()).await?;
                    self.extract_from_file(&archive, package, &dest).await?;
                }
            }

            self.promote(package, &dest).await?;

            self.events.install_after.emit(&PackageEvent {
                package: package.clone(),
            });
            tracing::info!(":: installed {}", package.name());

            installed.push(package.clone());
        }

        Ok(installed)
    }

    /// Full download of a root archive, size and hash verified.
    async fn download(&self, package: &Package, dest: &Path) -> Result<()> {
        self.events.download_before.emit(&PackageEvent {
            package: package.clone(),
        });

        let url = Url::parse(package.source())?;
        let mut response = self.fetcher.get(&url).await?;

        if let Some(length) = content_length(&response) {
            if length != package.size() {
                return Err(Error::BadContentLength {
                    expected: package.size(),
                    got: length,
                });
            }
        }

        let file = fs::File::create(dest).await?;
        let mut writer = HashedWriter::new(file, package.size(), package.declared_digests());

        self.progress(&self.events.download_progress, package, 0);

        while let Some(chunk) = response.chunk().await? {
            writer.write(&chunk).await?;

            if writer.written() < package.size() {
                self.progress(&self.events.download_progress, package, writer.written());
            }
        }

        writer.finish().await?;

        self.progress(&self.events.download_progress, package, package.size());
        self.events.download_after.emit(&PackageEvent {
            package: package.clone(),
        });
        tracing::debug!(":: downloaded {} ({} bytes)", package.name(), package.size());

        Ok(())
    }

    async fn extract_from_file(&self, archive: &Path, package: &Package, dest: &Path) -> Result<()> {
        let reader = ZipReader::open(FileSource::open(archive).await?).await?;

        self.extract(&reader, package, dest).await
    }

    /// Extracts `package` out of its parent archive, size and hash
    /// verified against the child declaration.
    async fn extract<S: RangeSource>(
        &self,
        reader: &ZipReader<S>,
        package: &Package,
        dest: &Path,
    ) -> Result<()> {
        self.events.extract_before.emit(&PackageEvent {
            package: package.clone(),
        });

        let entry = reader
            .entry(package.source())
            .ok_or_else(|| Error::ExtractTargetMissing(package.source().to_owned()))?
            .clone();

        let mut stream = reader.open_entry(&entry).await?;

        let file = fs::File::create(dest).await?;
        let mut writer = HashedWriter::new(file, package.size(), package.declared_digests());

        self.progress(&self.events.extract_progress, package, 0);

        while let Some(chunk) = stream.next().await? {
            writer.write(&chunk).await?;

            if writer.written() < package.size() {
                self.progress(&self.events.extract_progress, package, writer.written());
            }
        }

        writer.finish().await?;

        self.progress(&self.events.extract_progress, package, package.size());
        self.events.extract_after.emit(&PackageEvent {
            package: package.clone(),
        });
        tracing::debug!(":: extracted {} ({} bytes)", package.name(), package.size());

        Ok(())
    }

    /// Moves a verified staging file into its slot and writes the
    /// receipt, in that order.
    async fn promote(&self, package: &Package, staged: &Path) -> Result<()> {
        let slot = self.receipts.package_dir(package.name());
        fs::create_dir_all(&slot).await?;

        let previous = self.receipts.read(package.name()).await?;

        let dest = slot.join(package.file());
        fs::rename(staged, &dest).await?;

        if let Some(previous) = previous {
            if previous.file != package.file() {
                match fs::remove_file(slot.join(&previous.file)).await {
                    Ok(()) => {}
                    Err(error) if error.kind() == ErrorKind::NotFound => {}
                    Err(error) => return Err(error.into()),
                }
            }
        }

        self.receipts.write(&Receipt::for_package(package)).await
    }

    fn progress(&self, channel: &Event<ProgressEvent>, package: &Package, amount: u64) {
        channel.emit(&ProgressEvent {
            package: package.clone(),
            total: package.size(),
            amount,
        });
    }

    pub(crate) fn tmp_dir(&self) -> PathBuf {
        self.root.join(META_DIR).join(TMP_DIR)
    }

    pub(crate) async fn recreate_tmp(&self) -> Result<()> {
        let tmp = self.tmp_dir();

        match fs::remove_dir_all(&tmp).await {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }

        fs::create_dir_all(&tmp).await?;

        Ok(())
    }

    pub(crate) async fn remove_tmp(&self) {
        let tmp = self.tmp_dir();

        if let Err(error) = fs::remove_dir_all(&tmp).await {
            if error.kind() != ErrorKind::NotFound {
                tracing::warn!(":: failed to remove scratch directory: {error}");
            }
        }
    }
}
