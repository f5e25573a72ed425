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

use crate::errors::Result;
use crate::package::Package;
use crate::receipt::ReceiptStore;

/// Computes which archives an install has to materialize.
pub struct InstallPlanner<'a> {
    receipts: &'a ReceiptStore,
}

impl<'a> InstallPlanner<'a> {
    /// Creates a planner consulting the given receipt store.
    pub fn new(receipts: &'a ReceiptStore) -> Self {
        Self { receipts }
    }

    /// Whether the package is installed and its receipt matches the
    /// catalog.
    pub async fn is_current(&self, package: &Package) -> Result<bool> {
        let current = match self.receipts.read(package.name()).await? {
            Some(receipt) => receipt.matches(package),
            None => false,
        };

        Ok(current)
    }

    /// The ordered chain of archives to materialize for `target`.
    ///
    /// Walks the parent chain upward collecting ancestors that are not
    /// current and stops at the first current one; nothing above it
    /// needs touching. The result is ordered ancestors-first with the
    /// target last, or empty when the target itself is current.
    pub async fn install_list(&self, target: &Package) -> Result<Vec<Package>> {
        if self.is_current(target).await? {
            return Ok(Vec::new());
        }

        let mut chain = vec![target.clone()];

        for ancestor in target.ancestors() {
            if self.is_current(&ancestor).await? {
                break;
            }

            chain.push(ancestor);
        }

        chain.reverse();

        Ok(chain)
    }
}

/// Stable ancestor-first ordering of an install request.
///
/// A package is placed before every requested package whose ancestor
/// chain contains it; unrelated packages keep their input order.
pub fn depend_ordered(packages: &[Package]) -> Vec<Package> {
    let mut ordered: Vec<Package> = Vec::with_capacity(packages.len());

    for package in packages {
        let position = ordered
            .iter()
            .position(|placed| placed.ancestors().any(|ancestor| ancestor == *package));

        match position {
            Some(index) => ordered.insert(index, package.clone()),
            None => ordered.push(package.clone()),
        }
    }

    ordered
}
