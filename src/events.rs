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

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use crate::package::Package;

/// Handle returned by [`Event::on`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A typed event channel with add/remove listener semantics.
///
/// Listeners run synchronously inline on the emitting task, in
/// registration order. They may freely register and remove listeners,
/// including on the channel currently being emitted.
pub struct Event<T> {
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> Event<T> {
    /// Registers a listener, returning a handle for [`Event::off`].
    pub fn on(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, Arc::new(listener)));
        Subscription(id)
    }

    /// Removes a previously registered listener.
    ///
    /// Returns `false` if the subscription was already removed.
    pub fn off(&self, subscription: Subscription) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != subscription.0);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn emit(&self, payload: &T) {
        // Snapshot under the lock so listeners can mutate the channel.
        let listeners: Vec<Listener<T>> =
            self.lock().iter().map(|(_, f)| Arc::clone(f)).collect();

        for listener in listeners {
            (listener.as_ref())(payload);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Listener<T>)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Payload of package scoped lifecycle events.
#[derive(Debug, Clone)]
pub struct PackageEvent {
    /// The package the event refers to.
    pub package: Package,
}

/// Payload of download and extract progress events.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// The package being transferred.
    pub package: Package,
    /// Total number of bytes that will be transferred.
    pub total: u64,
    /// Bytes transferred so far.
    pub amount: u64,
}

/// Payload of the `cleanup_before` event.
#[derive(Debug, Clone)]
pub struct CleanupEvent {
    /// Name of the obsolete package slot.
    pub package: String,
}

/// Payload of the `cleanup_after` event; also the per-slot return value
/// of [`crate::Manager::cleanup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupEntry {
    /// Name of the obsolete package slot.
    pub package: String,
    /// Whether the slot directory was removed.
    pub removed: bool,
}

/// Payload of the `catalog_error` event.
#[derive(Debug, Clone)]
pub struct CatalogErrorEvent {
    /// Human readable description of the failure.
    pub error: String,
}

/// Payload of the `lock_compromised` event.
#[derive(Debug, Clone)]
pub struct LockCompromisedEvent {
    /// Human readable description of what was observed.
    pub reason: String,
}

/// The event channels a [`crate::Manager`] exposes.
///
/// Handlers run inline during the operation that triggers them; events
/// are always delivered before the triggering operation returns.
#[derive(Default)]
pub struct ManagerEvents {
    /// Install is about to start for a package.
    pub install_before: Event<PackageEvent>,
    /// Install finished for a package.
    pub install_after: Event<PackageEvent>,
    /// Install was requested but the package is already current.
    pub install_current: Event<PackageEvent>,
    /// A full download is about to start.
    pub download_before: Event<PackageEvent>,
    /// A full download finished and verified.
    pub download_after: Event<PackageEvent>,
    /// Download progress; emitted at 0, possibly in between, and at total.
    pub download_progress: Event<ProgressEvent>,
    /// An archive extraction is about to start.
    pub extract_before: Event<PackageEvent>,
    /// An archive extraction finished and verified.
    pub extract_after: Event<PackageEvent>,
    /// Extract progress; emitted at 0, possibly in between, and at total.
    pub extract_progress: Event<ProgressEvent>,
    /// An obsolete slot is about to be removed.
    pub cleanup_before: Event<CleanupEvent>,
    /// An obsolete slot was handled.
    pub cleanup_after: Event<CleanupEntry>,
    /// Loading the on-disk catalog failed non-fatally.
    pub catalog_error: Event<CatalogErrorEvent>,
    /// The cross-process lock was compromised.
    pub lock_compromised: Event<LockCompromisedEvent>,
}
