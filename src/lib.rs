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

#![doc = include_str!("../README.md")]

/// Catalog model, validation and persistence
pub mod catalog;
/// Compiled defaults and environment overrides
pub mod config;
/// Error taxonomy
pub mod errors;
/// Typed event channels
pub mod events;
/// HTTP transport for manifests and archives
pub mod fetch;
/// Hash algorithms and the verifying stream sink
pub mod hash;
mod installer;
/// Cross-process lock file with heartbeats
pub mod lockfile;
/// The public facade
pub mod manager;
/// Package handles and archive locations
pub mod package;
/// Install chain planning
pub mod planner;
/// Install receipts
pub mod receipt;
/// ZIP reading over byte-range sources
pub mod zip;

pub use catalog::{Catalog, CatalogDiff};
pub use errors::{Error, Result};
pub use manager::Manager;
pub use package::Package;
pub use receipt::Receipt;
