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

use std::env;
use std::path::PathBuf;

use url::Url;

use crate::errors::Result;

/// Environment variable overriding the installation directory.
pub const PATH_ENV: &str = "SHOCKPKG_PATH";

/// Environment variable overriding the package manifest URL.
pub const PACKAGES_URL_ENV: &str = "SHOCKPKG_PACKAGES_URL";

/// Default installation directory, relative to the working directory.
pub const DEFAULT_PATH: &str = "shockpkg";

/// Default package manifest URL.
pub const DEFAULT_PACKAGES_URL: &str = "https://shockpkg.github.io/packages/packages.json";

/// Meta directory name, used both at the root and per package slot.
pub const META_DIR: &str = ".meta";

/// Scratch directory under the root meta directory.
pub const TMP_DIR: &str = "tmp";

/// Lock file name under the root meta directory.
pub const LOCK_FILE: &str = "lock";

/// On-disk copy of the last fetched manifest, under the root meta directory.
pub const PACKAGES_FILE: &str = "packages.json";

/// Install receipt file name, under the per-package meta directory.
pub const RECEIPT_FILE: &str = "package.json";

/// The installation directory, honoring [`PATH_ENV`].
pub fn install_path() -> PathBuf {
    match env::var_os(PATH_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_PATH),
    }
}

/// The package manifest URL, honoring [`PACKAGES_URL_ENV`].
pub fn packages_url() -> Result<Url> {
    let url = match env::var(PACKAGES_URL_ENV) {
        Ok(url) if !url.is_empty() => Url::parse(&url)?,
        _ => Url::parse(DEFAULT_PACKAGES_URL)?,
    };

    Ok(url)
}
