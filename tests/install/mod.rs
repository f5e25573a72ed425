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

use pretty_assertions::assert_eq;
use tokio::fs;

use shockpkg::hash::HashAlgorithm;
use shockpkg::{Error, Package};

use crate::common::{self, key_events, record_events, sha256_hex};

fn names(packages: &[Package]) -> Vec<String> {
    packages
        .iter()
        .map(|package| package.name().to_string())
        .collect()
}

#[tokio::test]
async fn installs_a_single_root() {
    let fixture = common::fixture().await;
    let manager = fixture.manager();

    manager.init().await.unwrap();
    manager.update().await.unwrap();

    let single = manager.by_name("single").unwrap().unwrap();
    let log = record_events(&manager);

    let installed = manager.install(&single).await.unwrap();
    assert_eq!(names(&installed), ["single"]);

    let size = fixture.size("single");
    assert_eq!(
        key_events(&log),
        vec![
            "install-before:single".to_string(),
            "download-before:single".to_string(),
            format!("download-progress:single:0/{size}"),
            format!("download-progress:single:{size}/{size}"),
            "download-after:single".to_string(),
            "install-after:single".to_string(),
        ]
    );

    let file = manager.installed_file(&single).await.unwrap();
    assert_eq!(fs::read(&file).await.unwrap(), fixture.payload("single"));
    assert!(manager.is_current(&single).await.unwrap());
    manager.verify(&single).await.unwrap();

    let receipt = manager.receipt(&single).await.unwrap();
    assert_eq!(receipt.size, size);
    assert_eq!(receipt.sha256, sha256_hex(fixture.payload("single")));
    assert!(receipt.sha1.is_some());

    log.lock().unwrap().clear();
    let again = manager.install(&single).await.unwrap();
    assert!(again.is_empty());
    assert_eq!(key_events(&log), vec!["install-current:single".to_string()]);

    manager.destroy().await.unwrap();
}

#[tokio::test]
async fn slim_install_streams_outer_archives() {
    let fixture = common::fixture().await;
    let manager = fixture.manager();

    manager.init().await.unwrap();
    manager.update().await.unwrap();

    let nested = manager.by_name("nested").unwrap().unwrap();
    let log = record_events(&manager);

    let installed = manager.install(&nested).await.unwrap();
    assert_eq!(names(&installed), ["nested-1", "nested"]);

    let inner_size = fixture.size("nested-1");
    let leaf_size = fixture.size("nested");
    assert_eq!(
        key_events(&log),
        vec![
            "install-before:nested".to_string(),
            "extract-before:nested-1".to_string(),
            format!("extract-progress:nested-1:0/{inner_size}"),
            format!("extract-progress:nested-1:{inner_size}/{inner_size}"),
            "extract-after:nested-1".to_string(),
            "extract-before:nested".to_string(),
            format!("extract-progress:nested:0/{leaf_size}"),
            format!("extract-progress:nested:{leaf_size}/{leaf_size}"),
            "extract-after:nested".to_string(),
            "install-after:nested".to_string(),
        ]
    );

    // Only the target is installed; ancestors were transient.
    assert!(manager.is_installed(&nested).await.unwrap());
    let nested_1 = manager.by_name("nested-1").unwrap().unwrap();
    let nested_2 = manager.by_name("nested-2").unwrap().unwrap();
    assert!(!manager.is_installed(&nested_1).await.unwrap());
    assert!(!manager.is_installed(&nested_2).await.unwrap());

    let file = manager.installed_file(&nested).await.unwrap();
    assert_eq!(fs::read(&file).await.unwrap(), fixture.payload("nested"));

    // Scratch is gone after the operation.
    assert!(!fs::try_exists(fixture.dir.path().join(".meta/tmp")).await.unwrap());

    manager.destroy().await.unwrap();
}

#[tokio::test]
async fn reuses_the_closest_current_ancestor() {
    let fixture = common::fixture().await;
    let manager = fixture.manager();

    manager.init().await.unwrap();
    manager.update().await.unwrap();

    let nested_1 = manager.by_name("nested-1").unwrap().unwrap();
    assert_eq!(names(&manager.install(&nested_1).await.unwrap()), ["nested-1"]);
    assert!(manager.is_current(&nested_1).await.unwrap());

    let nested = manager.by_name("nested").unwrap().unwrap();
    let log = record_events(&manager);

    let installed = manager.install(&nested).await.unwrap();
    assert_eq!(names(&installed), ["nested"]);

    let leaf_size = fixture.size("nested");
    assert_eq!(
        key_events(&log),
        vec![
            "install-before:nested".to_string(),
            "extract-before:nested".to_string(),
            format!("extract-progress:nested:0/{leaf_size}"),
            format!("extract-progress:nested:{leaf_size}/{leaf_size}"),
            "extract-after:nested".to_string(),
            "install-after:nested".to_string(),
        ]
    );

    manager.destroy().await.unwrap();
}

#[tokio::test]
async fn full_install_materializes_the_chain() {
    let fixture = common::fixture().await;
    let manager = fixture.manager();

    manager.init().await.unwrap();
    manager.update().await.unwrap();

    let nested = manager.by_name("nested").unwrap().unwrap();
    let log = record_events(&manager);

    let installed = manager.install_full(&nested).await.unwrap();
    assert_eq!(names(&installed), ["nested-2", "nested-1", "nested"]);

    let outer_size = fixture.size("nested-2");
    let inner_size = fixture.size("nested-1");
    let leaf_size = fixture.size("nested");
    assert_eq!(
        key_events(&log),
        vec![
            "install-before:nested-2".to_string(),
            "download-before:nested-2".to_string(),
            format!("download-progress:nested-2:0/{outer_size}"),
            format!("download-progress:nested-2:{outer_size}/{outer_size}"),
            "download-after:nested-2".to_string(),
            "install-after:nested-2".to_string(),
            "install-before:nested-1".to_string(),
            "extract-before:nested-1".to_string(),
            format!("extract-progress:nested-1:0/{inner_size}"),
            format!("extract-progress:nested-1:{inner_size}/{inner_size}"),
            "extract-after:nested-1".to_string(),
            "install-after:nested-1".to_string(),
            "install-before:nested".to_string(),
            "extract-before:nested".to_string(),
            format!("extract-progress:nested:0/{leaf_size}"),
            format!("extract-progress:nested:{leaf_size}/{leaf_size}"),
            "extract-after:nested".to_string(),
            "install-after:nested".to_string(),
        ]
    );

    for name in ["nested-2", "nested-1", "nested"] {
        let package = manager.by_name(name).unwrap().unwrap();
        assert!(manager.is_current(&package).await.unwrap(), "{name}");
        manager.verify(&package).await.unwrap();

        let file = manager.installed_file(&package).await.unwrap();
        assert_eq!(
            fs::metadata(&file).await.unwrap().len(),
            fixture.size(name),
            "{name}"
        );
    }

    manager.destroy().await.unwrap();
}

#[tokio::test]
async fn install_many_orders_dependencies() {
    let fixture = common::fixture().await;
    let manager = fixture.manager();

    manager.init().await.unwrap();
    manager.update().await.unwrap();

    let multi = manager.by_name("multi").unwrap().unwrap();
    let multi_b = manager.by_name("multi-b").unwrap().unwrap();

    // The parent is requested last but must be installed first.
    let installed = manager
        .install_many(&[multi_b.clone(), multi.clone()])
        .await
        .unwrap();
    assert_eq!(names(&installed), ["multi", "multi-b"]);

    assert!(manager.is_current(&multi).await.unwrap());
    assert!(manager.is_current(&multi_b).await.unwrap());

    let file = manager.installed_file(&multi_b).await.unwrap();
    assert_eq!(fs::read(&file).await.unwrap(), fixture.payload("multi-b"));

    manager.destroy().await.unwrap();
}

#[tokio::test]
async fn verify_reports_the_mismatched_field() {
    let fixture = common::fixture().await;
    let manager = fixture.manager();

    manager.init().await.unwrap();
    manager.update().await.unwrap();

    let single = manager.by_name("single").unwrap().unwrap();
    manager.install(&single).await.unwrap();

    let size = fixture.size("single") as usize;
    let file = manager.installed_file(&single).await.unwrap();

    fs::write(&file, vec![0u8; size + 1]).await.unwrap();
    match manager.verify(&single).await.unwrap_err() {
        Error::BadSize { got } => assert_eq!(got, size as u64 + 1),
        other => panic!("unexpected error: {other:?}"),
    }

    fs::write(&file, vec![0u8; size]).await.unwrap();
    match manager.verify(&single).await.unwrap_err() {
        Error::BadHash { algorithm, got } => {
            assert_eq!(algorithm, HashAlgorithm::Sha256);
            assert_eq!(got, sha256_hex(&vec![0u8; size]));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    manager.destroy().await.unwrap();
}

#[tokio::test]
async fn missing_archive_entry_fails_the_install() {
    let fixture = common::fixture().await;
    let manager = fixture.manager();

    manager.init().await.unwrap();
    manager.update().await.unwrap();

    let ghost = manager.by_name("multi-ghost").unwrap().unwrap();
    let error = manager.install(&ghost).await.unwrap_err();

    assert!(matches!(
        error,
        Error::ExtractTargetMissing(path) if path == "missing.bin"
    ));

    let multi = manager.by_name("multi").unwrap().unwrap();
    assert!(!manager.is_installed(&ghost).await.unwrap());
    assert!(!manager.is_installed(&multi).await.unwrap());

    // Failure still cleans the scratch directory.
    assert!(!fs::try_exists(fixture.dir.path().join(".meta/tmp")).await.unwrap());

    manager.destroy().await.unwrap();
}

#[tokio::test]
async fn corrupted_download_leaves_no_trace() {
    let fixture = common::fixture().await;
    let manager = fixture.manager();

    manager.init().await.unwrap();
    manager.update().await.unwrap();

    let size = fixture.size("single") as usize;
    fixture
        .server
        .put("/archives/single.bin", common::payload_bytes(0x99, size));

    let single = manager.by_name("single").unwrap().unwrap();
    let error = manager.install(&single).await.unwrap_err();
    assert!(matches!(error, Error::BadHash { .. }));

    assert!(!manager.is_installed(&single).await.unwrap());
    assert!(!fs::try_exists(fixture.dir.path().join("single")).await.unwrap());

    manager.destroy().await.unwrap();
}

#[tokio::test]
async fn server_ignoring_range_is_a_protocol_error() {
    let fixture = common::fixture().await;
    let manager = fixture.manager();

    manager.init().await.unwrap();
    manager.update().await.unwrap();

    fixture.server.set_ignore_range(true);

    let nested = manager.by_name("nested").unwrap().unwrap();
    let error = manager.install(&nested).await.unwrap_err();

    assert!(matches!(
        error,
        Error::BadStatus {
            expected: 206,
            got: 200
        }
    ));

    manager.destroy().await.unwrap();
}

#[tokio::test]
async fn reinstall_after_file_rename_drops_the_old_payload() {
    let mut fixture = common::fixture().await;
    let manager = fixture.manager();

    manager.init().await.unwrap();
    manager.update().await.unwrap();

    let single = manager.by_name("single").unwrap().unwrap();
    manager.install(&single).await.unwrap();

    // Same bytes, new file name: the package is outdated by `file`.
    fixture.manifest["packages"][0]["file"] = serde_json::json!("renamed.bin");
    fixture.push_manifest();
    manager.update().await.unwrap();

    let renamed = manager.by_name("single").unwrap().unwrap();
    assert!(!manager.is_current(&renamed).await.unwrap());

    manager.install(&renamed).await.unwrap();

    let slot = fixture.dir.path().join("single");
    assert!(fs::try_exists(slot.join("renamed.bin")).await.unwrap());
    assert!(!fs::try_exists(slot.join("single.bin")).await.unwrap());

    manager.destroy().await.unwrap();
}
