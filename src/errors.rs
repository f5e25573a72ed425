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

use miette::Diagnostic;
use thiserror::Error;

use crate::hash::HashAlgorithm;

/// Crate level result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure mode of the crate.
///
/// Variants are grouped by concern: manager lifecycle, catalog, network,
/// integrity, archive, and install state. OS and transport errors are
/// surfaced unchanged through the transparent variants.
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    /// The manager has not been initialized.
    #[error("manager is not initialized")]
    #[diagnostic(code(shockpkg::not_inited))]
    NotInited,

    /// The manager is already initialized.
    #[error("manager is already initialized")]
    #[diagnostic(code(shockpkg::already_inited))]
    AlreadyInited,

    /// The manager has been destroyed.
    #[error("manager has been destroyed")]
    #[diagnostic(code(shockpkg::destroyed))]
    Destroyed,

    /// Another process holds the installation directory lock.
    #[error("installation directory is locked by another process")]
    #[diagnostic(code(shockpkg::locked))]
    Locked,

    /// The held lock was externally removed or replaced.
    #[error("lock on the installation directory was compromised")]
    #[diagnostic(code(shockpkg::lock_compromised))]
    LockCompromised,

    /// A public operation was entered while another one was running.
    #[error("another operation is already running on this manager")]
    #[diagnostic(code(shockpkg::reentrant))]
    Reentrant,

    /// No catalog has been loaded yet.
    #[error("no catalog loaded, run update first")]
    #[diagnostic(code(shockpkg::catalog_not_loaded))]
    CatalogNotLoaded,

    /// The manifest failed structural validation.
    #[error("bad manifest: {0}")]
    #[diagnostic(code(shockpkg::bad_manifest))]
    BadManifest(String),

    /// The manifest declares an incompatible major format version.
    #[error("manifest format major version mismatch: expected {expected}, got {got}")]
    #[diagnostic(code(shockpkg::format_major_mismatch))]
    FormatMajorMismatch {
        /// Compiled major version.
        expected: u32,
        /// Major version found in the manifest.
        got: u32,
    },

    /// The manifest declares a minor format version newer than supported.
    #[error("manifest format minor version too new: supported {supported}, got {got}")]
    #[diagnostic(code(shockpkg::format_minor_too_new))]
    FormatMinorTooNew {
        /// Compiled minor version.
        supported: u32,
        /// Minor version found in the manifest.
        got: u32,
    },

    /// Two packages in the manifest share a name.
    #[error("duplicate package name: {0}")]
    #[diagnostic(code(shockpkg::duplicate_name))]
    DuplicateName(String),

    /// Two packages in the manifest share a hash digest.
    #[error("duplicate package hash: {0}")]
    #[diagnostic(code(shockpkg::duplicate_hash))]
    DuplicateHash(String),

    /// No package with the given identifier exists in the catalog.
    #[error("unknown package: {0}")]
    #[diagnostic(code(shockpkg::unknown_package))]
    UnknownPackage(String),

    /// The package handle does not belong to the loaded catalog.
    #[error("package is not a member of the loaded catalog: {0}")]
    #[diagnostic(code(shockpkg::not_member))]
    NotMember(String),

    /// The remote answered with an unexpected HTTP status.
    #[error("unexpected http status: expected {expected}, got {got}")]
    #[diagnostic(code(shockpkg::bad_status))]
    BadStatus {
        /// Status required by the protocol at this point.
        expected: u16,
        /// Status the server actually returned.
        got: u16,
    },

    /// The response announced a content length other than the one declared.
    #[error("unexpected content-length: expected {expected}, got {got}")]
    #[diagnostic(code(shockpkg::bad_content_length))]
    BadContentLength {
        /// Byte count declared by the catalog or range.
        expected: u64,
        /// Byte count announced by the server.
        got: u64,
    },

    /// A body stream produced more bytes than declared.
    #[error("stream exceeded the expected size of {expected} bytes")]
    #[diagnostic(code(shockpkg::read_too_large))]
    ReadTooLarge {
        /// Declared byte count.
        expected: u64,
    },

    /// A body stream ended before the declared size was reached.
    #[error("stream ended after {got} of {expected} bytes")]
    #[diagnostic(code(shockpkg::read_too_small))]
    ReadTooSmall {
        /// Declared byte count.
        expected: u64,
        /// Bytes actually received.
        got: u64,
    },

    /// Transport level request failure.
    #[error(transparent)]
    Request(#[from] reqwest::Error),

    /// A file on disk has an unexpected size.
    #[error("unexpected size: {got}")]
    #[diagnostic(code(shockpkg::bad_size))]
    BadSize {
        /// Size found on disk.
        got: u64,
    },

    /// A computed digest disagrees with the declared one.
    #[error("unexpected {algorithm} hash: {got}")]
    #[diagnostic(code(shockpkg::bad_hash))]
    BadHash {
        /// Algorithm that produced the mismatch.
        algorithm: HashAlgorithm,
        /// Digest actually computed, lowercase hex.
        got: String,
    },

    /// Underlying filesystem failure, surfaced unchanged.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The archive does not contain the requested entry.
    #[error("archive entry not found: {0}")]
    #[diagnostic(code(shockpkg::extract_target_missing))]
    ExtractTargetMissing(String),

    /// The archive is malformed or uses an unsupported feature.
    #[error("archive error: {0}")]
    #[diagnostic(code(shockpkg::archive))]
    Archive(String),

    /// The package has no install receipt.
    #[error("package is not installed: {0}")]
    #[diagnostic(code(shockpkg::not_installed))]
    NotInstalled(String),

    /// A URL failed to parse.
    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// A JSON document failed to serialize or deserialize.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
