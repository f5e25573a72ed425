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

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tokio::fs;
use url::Url;

use crate::errors::{Error, Result};
use crate::hash::HashAlgorithm;
use crate::package::{Package, PackageNode, ZippedLocation};

/// Compiled major manifest format version.
pub const FORMAT_MAJOR: u32 = 1;

/// Compiled minor manifest format version.
pub const FORMAT_MINOR: u32 = 2;

/// Compiled manifest format tag.
pub const FORMAT: &str = "1.2";

/// On-the-wire manifest shape. Unknown fields are ignored on purpose.
#[derive(Debug, Deserialize)]
struct RawManifest {
    format: String,
    packages: Vec<RawPackage>,
}

#[derive(Debug, Deserialize)]
struct RawPackage {
    name: String,
    file: String,
    size: u64,
    sha256: String,
    sha1: Option<String>,
    md5: Option<String>,
    source: String,
    zipped: Option<String>,
    #[serde(default)]
    packages: Vec<RawPackage>,
}

#[derive(Default)]
pub(crate) struct CatalogInner {
    pub(crate) packages: Vec<PackageNode>,
    by_name: HashMap<String, usize>,
    by_sha256: HashMap<String, usize>,
    by_sha1: HashMap<String, usize>,
    by_md5: HashMap<String, usize>,
    by_unique: HashMap<String, usize>,
}

/// The parsed and validated package inventory.
///
/// Packages live in an arena in pre-order of declaration; handles stay
/// valid as long as some clone of this catalog is alive. The raw parsed
/// manifest is kept alongside so persistence writes back what was
/// fetched, pretty printed, including fields this version ignores.
#[derive(Clone)]
pub struct Catalog {
    inner: Arc<CatalogInner>,
    raw: Arc<serde_json::Value>,
}

impl Catalog {
    /// Parses and validates a manifest document.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|error| Error::BadManifest(error.to_string()))?;
        let manifest: RawManifest = serde_json::from_value(raw.clone())
            .map_err(|error| Error::BadManifest(error.to_string()))?;

        let (major, minor) = parse_format(&manifest.format)?;

        if major != FORMAT_MAJOR {
            return Err(Error::FormatMajorMismatch {
                expected: FORMAT_MAJOR,
                got: major,
            });
        }

        if minor > FORMAT_MINOR {
            return Err(Error::FormatMinorTooNew {
                supported: FORMAT_MINOR,
                got: minor,
            });
        }

        let mut inner = CatalogInner::default();

        for package in &manifest.packages {
            add_package(package, None, &mut inner)?;
        }

        Ok(Self {
            inner: Arc::new(inner),
            raw: Arc::new(raw),
        })
    }

    /// Loads a persisted catalog, `None` if the file does not exist.
    pub async fn read_if_exists(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        Ok(Some(Self::parse(&bytes)?))
    }

    /// Persists the raw manifest pretty printed, temp-then-rename.
    pub async fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut body = serde_json::to_vec_pretty(&*self.raw)?;
        body.push(b'\n');

        let scratch = path.with_extension("json.tmp");
        fs::write(&scratch, &body).await?;
        fs::rename(&scratch, path).await?;

        Ok(())
    }

    /// The package with the given name.
    pub fn by_name(&self, name: &str) -> Option<Package> {
        self.package_at(self.inner.by_name.get(name))
    }

    /// The package with the given SHA-256 digest.
    pub fn by_sha256(&self, sha256: &str) -> Option<Package> {
        self.package_at(self.inner.by_sha256.get(sha256))
    }

    /// The package with the given SHA-1 digest.
    pub fn by_sha1(&self, sha1: &str) -> Option<Package> {
        self.package_at(self.inner.by_sha1.get(sha1))
    }

    /// The package with the given MD5 digest.
    pub fn by_md5(&self, md5: &str) -> Option<Package> {
        self.package_at(self.inner.by_md5.get(md5))
    }

    /// The package whose name or any declared digest equals `unique`.
    pub fn by_unique(&self, unique: &str) -> Option<Package> {
        self.package_at(self.inner.by_unique.get(unique))
    }

    /// Deterministic iteration in pre-order of declaration.
    pub fn iter(&self) -> impl Iterator<Item = Package> + '_ {
        (0..self.inner.packages.len()).map(|index| Package::new(Arc::clone(&self.inner), index))
    }

    /// Number of packages, children included.
    pub fn len(&self) -> usize {
        self.inner.packages.len()
    }

    /// Whether the catalog declares no packages at all.
    pub fn is_empty(&self) -> bool {
        self.inner.packages.is_empty()
    }

    /// Identity check: the handle was issued by this catalog instance.
    pub fn has(&self, package: &Package) -> bool {
        package.belongs_to(&self.inner)
    }

    /// Replaces the contents from a fresh manifest, returning the diff.
    ///
    /// On any parse or validation failure the previous contents stay in
    /// place untouched.
    pub fn update(&mut self, bytes: &[u8]) -> Result<CatalogDiff> {
        let next = Self::parse(bytes)?;
        let diff = self.diff(&next);
        *self = next;

        Ok(diff)
    }

    /// The change set from `self` to `next`.
    ///
    /// A package counts as updated when `file`, `size` or `sha256`
    /// changed; a changed `source` alone is not an update, mirrors move
    /// without invalidating installs.
    pub fn diff(&self, next: &Catalog) -> CatalogDiff {
        let mut diff = CatalogDiff::default();

        for package in next.iter() {
            match self.by_name(package.name()) {
                None => diff.added.push(package),
                Some(previous) => {
                    if previous.file() != package.file()
                        || previous.size() != package.size()
                        || previous.sha256() != package.sha256()
                    {
                        diff.updated.push(package);
                    }
                }
            }
        }

        for package in self.iter() {
            if next.by_name(package.name()).is_none() {
                diff.removed.push(package);
            }
        }

        diff
    }

    fn package_at(&self, index: Option<&usize>) -> Option<Package> {
        index.map(|&index| Package::new(Arc::clone(&self.inner), index))
    }
}

/// Result of a catalog refresh.
///
/// `added`, `updated` and `removed` are pairwise disjoint; `removed`
/// handles refer to the catalog known before the refresh.
#[derive(Debug, Default, Clone)]
pub struct CatalogDiff {
    /// Packages that did not exist before.
    pub added: Vec<Package>,
    /// Packages whose `file`, `size` or `sha256` changed.
    pub updated: Vec<Package>,
    /// Packages that no longer exist.
    pub removed: Vec<Package>,
}

impl CatalogDiff {
    /// Whether the refresh changed nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

fn parse_format(tag: &str) -> Result<(u32, u32)> {
    let bad = || Error::BadManifest(format!("malformed format tag: {tag:?}"));

    let (major, minor) = tag.split_once('.').ok_or_else(bad)?;

    Ok((
        major.parse().map_err(|_| bad())?,
        minor.parse().map_err(|_| bad())?,
    ))
}

fn validate_digest(name: &str, algorithm: HashAlgorithm, digest: &str) -> Result<()> {
    let valid = digest.len() == algorithm.hex_len()
        && digest
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));

    if !valid {
        return Err(Error::BadManifest(format!(
            "package {name}: malformed {algorithm} digest {digest:?}"
        )));
    }

    Ok(())
}

fn add_package(raw: &RawPackage, parent: Option<usize>, inner: &mut CatalogInner) -> Result<()> {
    let name = &raw.name;

    if name.is_empty() {
        return Err(Error::BadManifest("package with empty name".into()));
    }

    if raw.file.is_empty() {
        return Err(Error::BadManifest(format!("package {name}: empty file")));
    }

    if raw.source.is_empty() {
        return Err(Error::BadManifest(format!("package {name}: empty source")));
    }

    validate_digest(name, HashAlgorithm::Sha256, &raw.sha256)?;

    if let Some(sha1) = &raw.sha1 {
        validate_digest(name, HashAlgorithm::Sha1, sha1)?;
    }

    if let Some(md5) = &raw.md5 {
        validate_digest(name, HashAlgorithm::Md5, md5)?;
    }

    let zipped = match (parent, &raw.zipped) {
        (Some(_), Some(zipped)) => {
            Some(zipped.parse::<ZippedLocation>().map_err(|error| {
                Error::BadManifest(format!("package {name}: bad zipped field: {error}"))
            })?)
        }
        (Some(_), None) => {
            return Err(Error::BadManifest(format!(
                "package {name}: child is missing the zipped field"
            )));
        }
        (None, Some(_)) => {
            return Err(Error::BadManifest(format!(
                "package {name}: root declares a zipped field"
            )));
        }
        (None, None) => {
            Url::parse(&raw.source).map_err(|error| {
                Error::BadManifest(format!("package {name}: bad source URL: {error}"))
            })?;

            None
        }
    };

    let index = inner.packages.len();

    if inner.by_name.insert(name.clone(), index).is_some() {
        return Err(Error::DuplicateName(name.clone()));
    }

    if inner.by_unique.insert(name.clone(), index).is_some() {
        return Err(Error::DuplicateHash(name.clone()));
    }

    if inner.by_sha256.insert(raw.sha256.clone(), index).is_some() {
        return Err(Error::DuplicateHash(raw.sha256.clone()));
    }
    if inner.by_unique.insert(raw.sha256.clone(), index).is_some() {
        return Err(Error::DuplicateHash(raw.sha256.clone()));
    }

    if let Some(sha1) = &raw.sha1 {
        if inner.by_sha1.insert(sha1.clone(), index).is_some() {
            return Err(Error::DuplicateHash(sha1.clone()));
        }
        if inner.by_unique.insert(sha1.clone(), index).is_some() {
            return Err(Error::DuplicateHash(sha1.clone()));
        }
    }

    if let Some(md5) = &raw.md5 {
        if inner.by_md5.insert(md5.clone(), index).is_some() {
            return Err(Error::DuplicateHash(md5.clone()));
        }
        if inner.by_unique.insert(md5.clone(), index).is_some() {
            return Err(Error::DuplicateHash(md5.clone()));
        }
    }

    inner.packages.push(PackageNode {
        name: raw.name.clone(),
        file: raw.file.clone(),
        size: raw.size,
        sha256: raw.sha256.clone(),
        sha1: raw.sha1.clone(),
        md5: raw.md5.clone(),
        source: raw.source.clone(),
        zipped,
        parent,
        children: Vec::new(),
    });

    if let Some(parent) = parent {
        inner.packages[parent].children.push(index);
    }

    for child in &raw.packages {
        add_package(child, Some(index), inner)?;
    }

    Ok(())
}
