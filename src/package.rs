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

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

use crate::catalog::CatalogInner;
use crate::hash::HashAlgorithm;

/// Location of a child entry inside its parent archive.
///
/// Declared in the manifest as `method-offsetCompressed-sizeCompressed`,
/// letting a reader find the compressed bytes without scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZippedLocation {
    /// ZIP compression method of the entry.
    pub method: u16,
    /// Offset of the compressed entry data in the outer archive.
    pub compressed_offset: u64,
    /// Size of the compressed entry data.
    pub compressed_size: u64,
}

/// Errors parsing a [`ZippedLocation`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ZippedLocationError {
    /// Not of the form `method-offset-size`.
    #[error("expected method-offset-size")]
    Format,
    /// One of the three fields is not a valid number.
    #[error("invalid number in zipped location: {0}")]
    Number(String),
}

impl FromStr for ZippedLocation {
    type Err = ZippedLocationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut parts = input.split('-');

        let (Some(method), Some(offset), Some(size), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ZippedLocationError::Format);
        };

        let number = |part: &str| ZippedLocationError::Number(part.to_string());

        Ok(Self {
            method: method.parse().map_err(|_| number(method))?,
            compressed_offset: offset.parse().map_err(|_| number(offset))?,
            compressed_size: size.parse().map_err(|_| number(size))?,
        })
    }
}

impl fmt::Display for ZippedLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.method, self.compressed_offset, self.compressed_size
        )
    }
}

/// One package record in the catalog arena.
#[derive(Debug, Clone)]
pub(crate) struct PackageNode {
    pub name: String,
    pub file: String,
    pub size: u64,
    pub sha256: String,
    pub sha1: Option<String>,
    pub md5: Option<String>,
    pub source: String,
    pub zipped: Option<ZippedLocation>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// A package of the loaded catalog.
///
/// Cheap handle into the catalog arena; clones refer to the same record.
/// Handles compare equal exactly when they denote the same record of the
/// same catalog instance, which is how membership checks distinguish a
/// stale handle from a refreshed catalog.
#[derive(Clone)]
pub struct Package {
    catalog: Arc<CatalogInner>,
    index: usize,
}

impl Package {
    pub(crate) fn new(catalog: Arc<CatalogInner>, index: usize) -> Self {
        Self { catalog, index }
    }

    fn node(&self) -> &PackageNode {
        &self.catalog.packages[self.index]
    }

    /// Unique package name.
    pub fn name(&self) -> &str {
        &self.node().name
    }

    /// File name the payload is materialized under.
    pub fn file(&self) -> &str {
        &self.node().file
    }

    /// Exact payload size in bytes.
    pub fn size(&self) -> u64 {
        self.node().size
    }

    /// SHA-256 digest of the payload, lowercase hex.
    pub fn sha256(&self) -> &str {
        &self.node().sha256
    }

    /// SHA-1 digest of the payload, if the manifest declares one.
    pub fn sha1(&self) -> Option<&str> {
        self.node().sha1.as_deref()
    }

    /// MD5 digest of the payload, if the manifest declares one.
    pub fn md5(&self) -> Option<&str> {
        self.node().md5.as_deref()
    }

    /// Download URL for roots, in-archive path for children.
    pub fn source(&self) -> &str {
        &self.node().source
    }

    /// Location inside the parent archive; present iff not a root.
    pub fn zipped(&self) -> Option<ZippedLocation> {
        self.node().zipped
    }

    /// Whether this package is a top level archive.
    pub fn is_root(&self) -> bool {
        self.node().parent.is_none()
    }

    /// The package whose archive contains this one.
    pub fn parent(&self) -> Option<Package> {
        self.node()
            .parent
            .map(|index| Package::new(Arc::clone(&self.catalog), index))
    }

    /// Direct children in declaration order.
    pub fn children(&self) -> Vec<Package> {
        self.node()
            .children
            .iter()
            .map(|&index| Package::new(Arc::clone(&self.catalog), index))
            .collect()
    }

    /// Iterator over ancestors, nearest first.
    pub fn ancestors(&self) -> Ancestors {
        Ancestors {
            catalog: Arc::clone(&self.catalog),
            next: self.node().parent,
        }
    }

    /// All declared digests as `(algorithm, lowercase-hex)` pairs.
    pub(crate) fn declared_digests(&self) -> Vec<(HashAlgorithm, String)> {
        let node = self.node();
        let mut digests = vec![(HashAlgorithm::Sha256, node.sha256.clone())];

        if let Some(sha1) = &node.sha1 {
            digests.push((HashAlgorithm::Sha1, sha1.clone()));
        }

        if let Some(md5) = &node.md5 {
            digests.push((HashAlgorithm::Md5, md5.clone()));
        }

        digests
    }

    pub(crate) fn belongs_to(&self, catalog: &Arc<CatalogInner>) -> bool {
        Arc::ptr_eq(&self.catalog, catalog)
    }
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.catalog, &other.catalog) && self.index == other.index
    }
}

impl Eq for Package {}

impl fmt::Debug for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Package")
            .field("name", &self.name())
            .field("file", &self.file())
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Iterator over a package's ancestors, nearest first.
pub struct Ancestors {
    catalog: Arc<CatalogInner>,
    next: Option<usize>,
}

impl Iterator for Ancestors {
    type Item = Package;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next?;
        self.next = self.catalog.packages[index].parent;

        Some(Package::new(Arc::clone(&self.catalog), index))
    }
}
