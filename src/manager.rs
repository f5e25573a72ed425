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
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use sha2::Digest as _;
use tokio::fs;
use tokio::io::AsyncReadExt;
use url::Url;

use crate::catalog::{Catalog, CatalogDiff};
use crate::config::{self, LOCK_FILE, META_DIR, PACKAGES_FILE};
use crate::errors::{Error, Result};
use crate::events::{
    CatalogErrorEvent, CleanupEntry, CleanupEvent, LockCompromisedEvent, ManagerEvents,
};
use crate::fetch::Fetcher;
use crate::hash::HashAlgorithm;
use crate::installer::{InstallMode, Installer};
use crate::lockfile::LockFile;
use crate::package::Package;
use crate::planner::{self, InstallPlanner};
use crate::receipt::{Receipt, ReceiptStore};

enum Phase {
    New,
    Active {
        lock: LockFile,
        catalog: Option<Catalog>,
    },
    Dead,
}

/// Public facade over an installation directory.
///
/// A manager is created cold and must be initialized before use; `init`
/// takes the cross-process lock and loads the persisted catalog, while
/// `destroy` releases both. Every public operation runs in an exclusive
/// section: entering one while another is still running fails with
/// [`Error::Reentrant`], including from within event handlers.
pub struct Manager {
    root: PathBuf,
    packages_url: Url,
    fetcher: Fetcher,
    receipts: ReceiptStore,
    events: Arc<ManagerEvents>,
    busy: AtomicBool,
    compromised: Arc<AtomicBool>,
    phase: Mutex<Phase>,
}

impl Manager {
    /// Age after which another process may take over the lock.
    const LOCK_STALE: std::time::Duration = std::time::Duration::from_secs(10);

    /// Interval between lock heartbeats.
    const LOCK_HEARTBEAT: std::time::Duration = std::time::Duration::from_secs(1);

    /// Creates a manager over `root`, with the manifest URL taken from
    /// the environment or the compiled default.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let url = config::packages_url()?;

        Self::with_packages_url(root, url)
    }

    /// Creates a manager honoring both environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::new(config::install_path())
    }

    /// Creates a manager with an explicit manifest URL.
    pub fn with_packages_url(root: impl Into<PathBuf>, packages_url: Url) -> Result<Self> {
        let root = root.into();

        Ok(Self {
            receipts: ReceiptStore::new(&root),
            root,
            packages_url,
            fetcher: Fetcher::new()?,
            events: Arc::new(ManagerEvents::default()),
            busy: AtomicBool::new(false),
            compromised: Arc::new(AtomicBool::new(false)),
            phase: Mutex::new(Phase::New),
        })
    }

    /// The installation directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The manifest URL `update` fetches.
    pub fn packages_url(&self) -> &Url {
        &self.packages_url
    }

    /// The event channels of this manager.
    pub fn events(&self) -> &ManagerEvents {
        &self.events
    }

    /// Path of the root meta directory.
    pub fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    fn packages_path(&self) -> PathBuf {
        self.meta_dir().join(PACKAGES_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.meta_dir().join(LOCK_FILE)
    }

    /// Takes the directory lock and loads the persisted catalog.
    ///
    /// Fails with [`Error::Locked`] without retrying when another
    /// process holds the lock. A broken on-disk catalog is not fatal:
    /// a `catalog_error` event fires and the catalog stays unloaded.
    pub async fn init(&self) -> Result<()> {
        let _busy = self.busy()?;

        if matches!(&*self.phase_guard(), Phase::Active { .. }) {
            return Err(Error::AlreadyInited);
        }

        fs::create_dir_all(self.meta_dir()).await?;

        self.compromised.store(false, Ordering::Release);

        let events = Arc::clone(&self.events);
        let compromised = Arc::clone(&self.compromised);
        let lock = LockFile::acquire_with(
            self.lock_path(),
            Self::LOCK_STALE,
            Self::LOCK_HEARTBEAT,
            move |reason| {
                compromised.store(true, Ordering::Release);
                events.lock_compromised.emit(&LockCompromisedEvent {
                    reason: reason.to_owned(),
                });
            },
        )
        .await?;

        let catalog = match Catalog::read_if_exists(self.packages_path()).await {
            Ok(catalog) => catalog,
            Err(error) => {
                self.events.catalog_error.emit(&CatalogErrorEvent {
                    error: error.to_string(),
                });

                None
            }
        };

        *self.phase_guard() = Phase::Active { lock, catalog };
        tracing::debug!(":: manager ready at {}", self.root.display());

        Ok(())
    }

    /// Releases the directory lock and renders the manager cold again.
    ///
    /// Runs even after a lock compromise; whatever is left is released
    /// safely. A manager that was never initialized fails with
    /// [`Error::NotInited`].
    pub async fn destroy(&self) -> Result<()> {
        let _busy = self.busy()?;

        let lock = {
            let mut phase = self.phase_guard();

            match std::mem::replace(&mut *phase, Phase::Dead) {
                Phase::Active { lock, .. } => lock,
                other => {
                    *phase = other;

                    return Err(Error::NotInited);
                }
            }
        };

        if let Err(error) = lock.release().await {
            tracing::warn!(":: failed to release lock: {error}");
        }

        tracing::debug!(":: manager destroyed");

        Ok(())
    }

    /// Scoped lifecycle helper: `init`, run `f`, `destroy` on every
    /// exit path. The closure's error wins over a destroy failure.
    pub async fn with<T, F>(&self, f: F) -> Result<T>
    where
        F: AsyncFnOnce(&Manager) -> Result<T>,
    {
        self.init().await?;

        let result = f(self).await;
        let destroyed = self.destroy().await;

        let value = result?;
        destroyed?;

        Ok(value)
    }

    /// Fetches the manifest, refreshes the catalog and persists it.
    ///
    /// Returns the change set relative to the catalog known before the
    /// refresh; any failure leaves the previous catalog in place.
    pub async fn update(&self) -> Result<CatalogDiff> {
        let _busy = self.busy()?;
        self.ensure_active()?;

        let response = self.fetcher.get(&self.packages_url).await?;
        let bytes = response.bytes().await?;

        let next = Catalog::parse(&bytes)?;

        let diff = match self.current_catalog() {
            Some(previous) => previous.diff(&next),
            None => CatalogDiff {
                added: next.iter().collect(),
                ..Default::default()
            },
        };

        next.write(self.packages_path()).await?;

        if let Phase::Active { catalog, .. } = &mut *self.phase_guard() {
            *catalog = Some(next);
        }

        tracing::info!(
            ":: catalog updated ({} added, {} updated, {} removed)",
            diff.added.len(),
            diff.updated.len(),
            diff.removed.len(),
        );

        Ok(diff)
    }

    /// The package with the given name.
    pub fn by_name(&self, name: &str) -> Result<Option<Package>> {
        let _busy = self.busy()?;

        Ok(self.catalog()?.by_name(name))
    }

    /// The package with the given SHA-256 digest.
    pub fn by_sha256(&self, sha256: &str) -> Result<Option<Package>> {
        let _busy = self.busy()?;

        Ok(self.catalog()?.by_sha256(sha256))
    }

    /// The package with the given SHA-1 digest.
    pub fn by_sha1(&self, sha1: &str) -> Result<Option<Package>> {
        let _busy = self.busy()?;

        Ok(self.catalog()?.by_sha1(sha1))
    }

    /// The package with the given MD5 digest.
    pub fn by_md5(&self, md5: &str) -> Result<Option<Package>> {
        let _busy = self.busy()?;

        Ok(self.catalog()?.by_md5(md5))
    }

    /// The package whose name or any declared digest equals `unique`.
    pub fn by_unique(&self, unique: &str) -> Result<Option<Package>> {
        let _busy = self.busy()?;

        Ok(self.catalog()?.by_unique(unique))
    }

    /// All packages in catalog pre-order, children included.
    pub fn iter(&self) -> Result<Vec<Package>> {
        let _busy = self.busy()?;

        Ok(self.catalog()?.iter().collect())
    }

    /// Whether the handle belongs to the loaded catalog.
    pub fn is_member(&self, package: &Package) -> Result<bool> {
        let _busy = self.busy()?;

        Ok(self.catalog()?.has(package))
    }

    /// Stable ancestor-first ordering of an install request.
    pub fn depend_ordered(&self, packages: &[Package]) -> Result<Vec<Package>> {
        let _busy = self.busy()?;
        let catalog = self.catalog()?;

        for package in packages {
            require_member(&catalog, package)?;
        }

        Ok(planner::depend_ordered(packages))
    }

    /// Path inside a package slot, without touching the filesystem.
    pub fn path_to(&self, package: &Package, parts: &[&str]) -> Result<PathBuf> {
        let _busy = self.busy()?;
        require_member(&self.catalog()?, package)?;

        let mut path = self.root.join(package.name());
        for part in parts {
            path.push(part);
        }

        Ok(path)
    }

    /// All catalog packages that have an install receipt.
    pub async fn installed(&self) -> Result<Vec<Package>> {
        let _busy = self.busy()?;
        let catalog = self.catalog()?;

        let mut installed = Vec::new();
        for package in catalog.iter() {
            if self.receipts.read(package.name()).await?.is_some() {
                installed.push(package);
            }
        }

        Ok(installed)
    }

    /// Installed packages whose receipt disagrees with the catalog.
    pub async fn outdated(&self) -> Result<Vec<Package>> {
        let _busy = self.busy()?;

        self.outdated_inner().await
    }

    /// Names of slot directories that are not in the current catalog.
    pub async fn obsolete(&self) -> Result<Vec<String>> {
        let _busy = self.busy()?;
        let catalog = self.catalog()?;

        self.obsolete_slots(&catalog).await
    }

    /// Whether the package has an install receipt.
    pub async fn is_installed(&self, package: &Package) -> Result<bool> {
        let _busy = self.busy()?;
        require_member(&self.catalog()?, package)?;

        Ok(self.receipts.read(package.name()).await?.is_some())
    }

    /// Whether the package is installed and matches the catalog.
    pub async fn is_current(&self, package: &Package) -> Result<bool> {
        let _busy = self.busy()?;
        require_member(&self.catalog()?, package)?;

        InstallPlanner::new(&self.receipts).is_current(package).await
    }

    /// Whether a slot of this name exists but is not in the catalog.
    pub async fn is_obsolete(&self, name: &str) -> Result<bool> {
        let _busy = self.busy()?;
        let catalog = self.catalog()?;

        if name.starts_with('.') || catalog.by_name(name).is_some() {
            return Ok(false);
        }

        Ok(fs::try_exists(self.root.join(name).join(META_DIR)).await?)
    }

    /// The package's install receipt.
    pub async fn receipt(&self, package: &Package) -> Result<Receipt> {
        let _busy = self.busy()?;
        require_member(&self.catalog()?, package)?;

        self.receipts
            .read(package.name())
            .await?
            .ok_or_else(|| Error::NotInstalled(package.name().to_owned()))
    }

    /// Path of the installed payload per the receipt.
    pub async fn installed_file(&self, package: &Package) -> Result<PathBuf> {
        let _busy = self.busy()?;
        require_member(&self.catalog()?, package)?;

        self.receipts.installed_file(package.name()).await
    }

    /// Re-verifies an installed payload against its receipt.
    ///
    /// Checks the file size first, then recomputes the SHA-256 over the
    /// payload; the error names whichever field mismatched.
    pub async fn verify(&self, package: &Package) -> Result<()> {
        let _busy = self.busy()?;
        require_member(&self.catalog()?, package)?;

        let receipt = self
            .receipts
            .read(package.name())
            .await?
            .ok_or_else(|| Error::NotInstalled(package.name().to_owned()))?;

        let path = self.receipts.package_dir(package.name()).join(&receipt.file);

        let metadata = fs::metadata(&path).await?;
        if metadata.len() != receipt.size {
            return Err(Error::BadSize {
                got: metadata.len(),
            });
        }

        let mut file = fs::File::open(&path).await?;
        let mut hasher = sha2::Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];

        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }

            hasher.update(&buffer[..read]);
        }

        let got = hex::encode(hasher.finalize());
        if got != receipt.sha256 {
            return Err(Error::BadHash {
                algorithm: HashAlgorithm::Sha256,
                got,
            });
        }

        Ok(())
    }

    /// Installs a package slim: only the target is materialized, outer
    /// archives are streamed by byte range.
    ///
    /// Returns the chain members that were fully materialized; empty
    /// (with an `install_current` event) when nothing was needed.
    pub async fn install(&self, package: &Package) -> Result<Vec<Package>> {
        let _busy = self.busy()?;

        self.install_inner(package, InstallMode::Slim).await
    }

    /// Installs a package and its whole ancestor chain, receipt each.
    pub async fn install_full(&self, package: &Package) -> Result<Vec<Package>> {
        let _busy = self.busy()?;

        self.install_inner(package, InstallMode::Full).await
    }

    /// Slim-installs several packages in dependency order.
    pub async fn install_many(&self, packages: &[Package]) -> Result<Vec<Package>> {
        let _busy = self.busy()?;

        self.install_many_inner(packages, InstallMode::Slim).await
    }

    /// Full-installs several packages in dependency order.
    pub async fn install_full_many(&self, packages: &[Package]) -> Result<Vec<Package>> {
        let _busy = self.busy()?;

        self.install_many_inner(packages, InstallMode::Full).await
    }

    /// Slim-installs every outdated package.
    pub async fn upgrade(&self) -> Result<Vec<Package>> {
        let _busy = self.busy()?;
        let outdated = self.outdated_inner().await?;

        self.install_many_inner(&outdated, InstallMode::Slim).await
    }

    /// Full-installs every outdated package.
    pub async fn upgrade_full(&self) -> Result<Vec<Package>> {
        let _busy = self.busy()?;
        let outdated = self.outdated_inner().await?;

        self.install_many_inner(&outdated, InstallMode::Full).await
    }

    /// Removes an installed package.
    ///
    /// The receipt is deleted first so a partially removed slot never
    /// appears installed; the slot directory follows. Returns whether
    /// anything existed to remove.
    pub async fn remove(&self, package: &Package) -> Result<bool> {
        let _busy = self.busy()?;
        require_member(&self.catalog()?, package)?;

        let had_receipt = self.receipts.remove(package.name()).await?;

        let had_slot = match fs::remove_dir_all(self.receipts.package_dir(package.name())).await {
            Ok(()) => true,
            Err(error) if error.kind() == ErrorKind::NotFound => false,
            Err(error) => return Err(error.into()),
        };

        if had_receipt || had_slot {
            tracing::info!(":: removed {}", package.name());
        }

        Ok(had_receipt || had_slot)
    }

    /// Removes scratch and every obsolete slot directory.
    pub async fn cleanup(&self) -> Result<Vec<CleanupEntry>> {
        let _busy = self.busy()?;
        let catalog = self.catalog()?;

        self.installer().remove_tmp().await;

        let mut entries = Vec::new();

        for name in self.obsolete_slots(&catalog).await? {
            self.events.cleanup_before.emit(&CleanupEvent {
                package: name.clone(),
            });

            let removed = match fs::remove_dir_all(self.receipts.package_dir(&name)).await {
                Ok(()) => true,
                Err(error) if error.kind() == ErrorKind::NotFound => false,
                Err(error) => return Err(error.into()),
            };

            if removed {
                tracing::info!(":: cleaned up obsolete slot {name}");
            }

            let entry = CleanupEntry {
                package: name,
                removed,
            };
            self.events.cleanup_after.emit(&entry);
            entries.push(entry);
        }

        Ok(entries)
    }

    async fn install_inner(&self, package: &Package, mode: InstallMode) -> Result<Vec<Package>> {
        require_member(&self.catalog()?, package)?;

        self.installer().install(package, mode).await
    }

    async fn install_many_inner(
        &self,
        packages: &[Package],
        mode: InstallMode,
    ) -> Result<Vec<Package>> {
        let catalog = self.catalog()?;
        for package in packages {
            require_member(&catalog, package)?;
        }

        let installer = self.installer();
        let mut installed = Vec::new();

        for package in planner::depend_ordered(packages) {
            installed.extend(installer.install(&package, mode).await?);
        }

        Ok(installed)
    }

    async fn outdated_inner(&self) -> Result<Vec<Package>> {
        let catalog = self.catalog()?;

        let mut outdated = Vec::new();
        for package in catalog.iter() {
            if let Some(receipt) = self.receipts.read(package.name()).await? {
                if !receipt.matches(&package) {
                    outdated.push(package);
                }
            }
        }

        Ok(outdated)
    }

    async fn obsolete_slots(&self, catalog: &Catalog) -> Result<Vec<String>> {
        let mut slots = Vec::new();

        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(slots),
            Err(error) => return Err(error.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };

            if name.starts_with('.') || catalog.by_name(&name).is_some() {
                continue;
            }

            // Only directories carrying a meta directory are slots.
            if !fs::try_exists(self.root.join(&name).join(META_DIR)).await? {
                continue;
            }

            slots.push(name);
        }

        slots.sort();

        Ok(slots)
    }

    fn installer(&self) -> Installer<'_> {
        Installer::new(&self.root, &self.receipts, &self.fetcher, &self.events)
    }

    fn busy(&self) -> Result<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Reentrant)?;

        Ok(BusyGuard(&self.busy))
    }

    fn phase_guard(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_active(&self) -> Result<()> {
        match &*self.phase_guard() {
            Phase::New => Err(Error::NotInited),
            Phase::Dead => Err(Error::Destroyed),
            Phase::Active { .. } => {
                if self.compromised.load(Ordering::Acquire) {
                    Err(Error::LockCompromised)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn catalog(&self) -> Result<Catalog> {
        self.ensure_active()?;

        self.current_catalog().ok_or(Error::CatalogNotLoaded)
    }

    fn current_catalog(&self) -> Option<Catalog> {
        match &*self.phase_guard() {
            Phase::Active { catalog, .. } => catalog.clone(),
            _ => None,
        }
    }
}

fn require_member(catalog: &Catalog, package: &Package) -> Result<()> {
    if !catalog.has(package) {
        return Err(Error::NotMember(package.name().to_owned()));
    }

    Ok(())
}

/// Non-reentrant in-process exclusion flag.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
