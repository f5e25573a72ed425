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

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::{META_DIR, RECEIPT_FILE};
use crate::errors::{Error, Result};
use crate::package::Package;

/// Per-package install record.
///
/// Its presence under the package slot's meta directory is the
/// authoritative signal that the package is installed; its fields
/// matching the current catalog is the signal that it is current.
/// `source` is informational only and never part of currency checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Package name.
    pub name: String,
    /// File name of the installed payload.
    pub file: String,
    /// Payload size in bytes.
    pub size: u64,
    /// SHA-256 digest of the payload, lowercase hex.
    pub sha256: String,
    /// SHA-1 digest, only when the manifest declared one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    /// MD5 digest, only when the manifest declared one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    /// Source the payload came from, informational.
    pub source: String,
}

impl Receipt {
    /// The receipt a successful install of `package` writes.
    pub fn for_package(package: &Package) -> Self {
        Self {
            name: package.name().to_owned(),
            file: package.file().to_owned(),
            size: package.size(),
            sha256: package.sha256().to_owned(),
            sha1: package.sha1().map(str::to_owned),
            md5: package.md5().map(str::to_owned),
            source: package.source().to_owned(),
        }
    }

    /// Whether the receipt still describes the given catalog entry.
    ///
    /// Compares `name`, `file`, `size` and `sha256`; a package whose
    /// receipt disagrees on any of these is outdated.
    pub fn matches(&self, package: &Package) -> bool {
        self.name == package.name()
            && self.file == package.file()
            && self.size == package.size()
            && self.sha256 == package.sha256()
    }
}

/// Reads and writes install receipts under an installation root.
#[derive(Debug, Clone)]
pub struct ReceiptStore {
    root: PathBuf,
}

impl ReceiptStore {
    /// Creates a store rooted at the installation directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The slot directory of a package.
    pub fn package_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// The meta directory inside a package slot.
    pub fn meta_dir(&self, name: &str) -> PathBuf {
        self.package_dir(name).join(META_DIR)
    }

    /// The receipt file path of a package.
    pub fn receipt_path(&self, name: &str) -> PathBuf {
        self.meta_dir(name).join(RECEIPT_FILE)
    }

    /// Reads a receipt, `None` if the package has none.
    pub async fn read(&self, name: &str) -> Result<Option<Receipt>> {
        let bytes = match fs::read(self.receipt_path(name)).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Writes a receipt atomically (temp-then-rename).
    pub async fn write(&self, receipt: &Receipt) -> Result<()> {
        let meta_dir = self.meta_dir(&receipt.name);
        fs::create_dir_all(&meta_dir).await?;

        let mut body = serde_json::to_vec_pretty(receipt)?;
        body.push(b'\n');

        let path = self.receipt_path(&receipt.name);
        let scratch = path.with_extension("json.tmp");
        fs::write(&scratch, &body).await?;
        fs::rename(&scratch, &path).await?;

        Ok(())
    }

    /// Deletes a receipt, returning whether one existed.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        match fs::remove_file(self.receipt_path(name)).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Path of the installed payload per receipt, [`Error::NotInstalled`]
    /// if the package has no receipt.
    pub async fn installed_file(&self, name: &str) -> Result<PathBuf> {
        let receipt = self
            .read(name)
            .await?
            .ok_or_else(|| Error::NotInstalled(name.to_owned()))?;

        Ok(self.package_dir(name).join(receipt.file))
    }

    /// The installation root this store operates under.
    pub fn root(&self) -> &Path {
        &self.root
    }
}
