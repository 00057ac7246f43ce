//! Integration tests: merge rootfs directories into an OCI layout.
//!
//! Each test seeds a minimal base image into a temporary layout and runs
//! the build with `skip_import`, so no external copy tool is needed.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use oci_spec::image::MediaType;
use rand::Rng;
use rootmerge_core::config::BuildConfig;
use rootmerge_core::error::MergeError;
use rootmerge_runtime::oci::build::{build, build_layers, read_rootfs_list};
use rootmerge_runtime::{BlobDescriptor, BlobStore, OciLayout};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

const TAG: &str = "rootmerge";

/// Write a base image with one (absent) layer and return its manifest digest.
async fn seed_base(oci_dir: &Path) -> String {
    let layout = OciLayout::open(oci_dir).unwrap();
    let config = serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {},
        "rootfs": {
            "type": "layers",
            "diff_ids": ["sha256:2222222222222222222222222222222222222222222222222222222222222222"],
        },
        "history": [],
    });
    let (config_digest, config_size) = layout.put_blob_json(&config).await.unwrap();
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MediaType::ImageManifest.to_string(),
        "config": {
            "mediaType": MediaType::ImageConfig.to_string(),
            "digest": config_digest,
            "size": config_size,
        },
        "layers": [{
            "mediaType": MediaType::ImageLayerGzip.to_string(),
            "digest": "sha256:3333333333333333333333333333333333333333333333333333333333333333",
            "size": 32,
        }],
    });
    let (digest, size) = layout.put_blob_json(&manifest).await.unwrap();
    layout
        .update_reference(TAG, BlobDescriptor::new(MediaType::ImageManifest, &digest, size))
        .await
        .unwrap();
    digest
}

fn config_for(oci_dir: &Path) -> BuildConfig {
    BuildConfig {
        oci_dir: oci_dir.to_path_buf(),
        tag: TAG.to_string(),
        skip_import: true,
        ..Default::default()
    }
}

fn make_rootfs(parent: &Path, name: &str, files: &[(&str, Vec<u8>)]) -> PathBuf {
    let root = parent.join(name);
    std::fs::create_dir_all(&root).unwrap();
    for (file, content) in files {
        let path = root.join(file);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
    root
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill(&mut data[..]);
    data
}

async fn read_json(layout: &OciLayout, digest: &str) -> serde_json::Value {
    serde_json::from_slice(&layout.read_blob(digest).await.unwrap()).unwrap()
}

/// Manifest and config currently tagged.
async fn current_image(layout: &OciLayout) -> (String, serde_json::Value, serde_json::Value) {
    let refs = layout.resolve_reference(TAG).await.unwrap();
    assert_eq!(refs.len(), 1);
    let manifest = read_json(layout, &refs[0].digest).await;
    let config = read_json(layout, manifest["config"]["digest"].as_str().unwrap()).await;
    (refs[0].digest.clone(), manifest, config)
}

/// Decompressed tar bytes and file contents of a layer blob.
async fn open_layer(layout: &OciLayout, digest: &str) -> (Vec<u8>, HashMap<String, Vec<u8>>) {
    let blob = layout.read_blob(digest).await.unwrap();
    let mut tar_bytes = Vec::new();
    flate2::read::GzDecoder::new(&blob[..])
        .read_to_end(&mut tar_bytes)
        .unwrap();

    let mut files = HashMap::new();
    let mut archive = tar::Archive::new(&tar_bytes[..]);
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let name = entry.path().unwrap().to_string_lossy().to_string();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        files.insert(name, content);
    }
    (tar_bytes, files)
}

fn sha256_hex(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn blob_count(oci_dir: &Path) -> usize {
    std::fs::read_dir(oci_dir.join("blobs").join("sha256"))
        .unwrap()
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_rootfses_two_layers() {
    let tmp = TempDir::new().unwrap();
    let oci_dir = tmp.path().join("oci");
    seed_base(&oci_dir).await;
    let a = make_rootfs(tmp.path(), "a", &[("file1", b"0123456789".to_vec())]);
    let b = make_rootfs(tmp.path(), "b", &[("file2", b"abcdefghij".to_vec())]);

    let result = build(&config_for(&oci_dir), "unused", vec![a, b]).await.unwrap();
    assert_eq!(result.layers_added, 2);
    assert_eq!(result.diff_ids.len(), 2);

    let layout = OciLayout::open(&oci_dir).unwrap();
    let (digest, manifest, config) = current_image(&layout).await;
    assert_eq!(digest, result.manifest_digest());

    let layers = manifest["layers"].as_array().unwrap();
    assert_eq!(layers.len(), 3);
    let diff_ids = config["rootfs"]["diff_ids"].as_array().unwrap();
    assert_eq!(diff_ids.len(), 3);
    assert_eq!(diff_ids[1], result.diff_ids[0].as_str());
    assert_eq!(diff_ids[2], result.diff_ids[1].as_str());

    let (_, first) = open_layer(&layout, layers[1]["digest"].as_str().unwrap()).await;
    let (_, second) = open_layer(&layout, layers[2]["digest"].as_str().unwrap()).await;
    assert_eq!(first.get("file1").unwrap(), b"0123456789");
    assert_eq!(second.get("file2").unwrap(), b"abcdefghij");
    assert_eq!(layers[1]["mediaType"], MediaType::ImageLayerGzip.to_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_group_order_preserved_under_concurrency() {
    let tmp = TempDir::new().unwrap();
    let oci_dir = tmp.path().join("oci");
    seed_base(&oci_dir).await;

    // Larger early groups so later ones tend to finish first.
    let rootfses: Vec<PathBuf> = (0..8)
        .map(|i| {
            let name = format!("only-{}", i);
            make_rootfs(
                tmp.path(),
                &format!("r{}", i),
                &[(name.as_str(), random_bytes((8 - i) * 128 * 1024))],
            )
        })
        .collect();

    let result = build(&config_for(&oci_dir), "unused", rootfses).await.unwrap();
    assert_eq!(result.layers_added, 8);

    let layout = OciLayout::open(&oci_dir).unwrap();
    let (_, manifest, config) = current_image(&layout).await;
    let layers = manifest["layers"].as_array().unwrap();
    let diff_ids = config["rootfs"]["diff_ids"].as_array().unwrap();
    for i in 0..8 {
        let (tar_bytes, files) =
            open_layer(&layout, layers[i + 1]["digest"].as_str().unwrap()).await;
        assert!(files.contains_key(&format!("only-{}", i)));
        assert_eq!(diff_ids[i + 1], sha256_hex(&tar_bytes).as_str());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_diff_ids_match_decompressed_blobs() {
    let tmp = TempDir::new().unwrap();
    let oci_dir = tmp.path().join("oci");
    seed_base(&oci_dir).await;
    let rootfs = make_rootfs(
        tmp.path(),
        "rootfs",
        &[
            ("etc/hostname", b"merged\n".to_vec()),
            ("usr/bin/tool", random_bytes(300 * 1024)),
            ("var/lib/data", vec![0u8; 512 * 1024]),
        ],
    );

    let config = BuildConfig {
        max_layer_size: 128 * 1024,
        ..config_for(&oci_dir)
    };
    let result = build(&config, "unused", vec![rootfs]).await.unwrap();

    let layout = OciLayout::open(&oci_dir).unwrap();
    let (_, manifest, _) = current_image(&layout).await;
    let layers = manifest["layers"].as_array().unwrap();
    assert_eq!(layers.len(), 1 + result.layers_added);
    for (layer, diff_id) in layers[1..].iter().zip(&result.diff_ids) {
        let digest = layer["digest"].as_str().unwrap();
        let (tar_bytes, _) = open_layer(&layout, digest).await;
        assert_eq!(&sha256_hex(&tar_bytes), diff_id);
        assert_eq!(
            layer["size"].as_u64().unwrap(),
            layout.read_blob(digest).await.unwrap().len() as u64
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_split_budget() {
    let tmp = TempDir::new().unwrap();
    let oci_dir = tmp.path().join("oci");
    seed_base(&oci_dir).await;
    let file_size = 64 * 1024;
    let files: Vec<(String, Vec<u8>)> = (0..24)
        .map(|i| (format!("f{:02}", i), random_bytes(file_size)))
        .collect();
    let file_refs: Vec<(&str, Vec<u8>)> =
        files.iter().map(|(n, c)| (n.as_str(), c.clone())).collect();
    let rootfs = make_rootfs(tmp.path(), "rootfs", &file_refs);

    let max_size = 256 * 1024u64;
    let config = BuildConfig {
        max_layer_size: max_size,
        ..config_for(&oci_dir)
    };
    let result = build(&config, "unused", vec![rootfs]).await.unwrap();
    assert!(result.layers_added > 1);

    let layout = OciLayout::open(&oci_dir).unwrap();
    let (_, manifest, _) = current_image(&layout).await;
    let mut seen = Vec::new();
    for layer in &manifest["layers"].as_array().unwrap()[1..] {
        let size = layer["size"].as_u64().unwrap();
        assert!(size as f64 <= max_size as f64 * 1.05 + file_size as f64);
        let (_, contents) = open_layer(&layout, layer["digest"].as_str().unwrap()).await;
        let mut names: Vec<String> = contents.into_keys().collect();
        names.sort();
        seen.extend(names);
    }
    let expected: Vec<String> = files.into_iter().map(|(n, _)| n).collect();
    assert_eq!(seen, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unbounded_single_layer() {
    let tmp = TempDir::new().unwrap();
    let oci_dir = tmp.path().join("oci");
    seed_base(&oci_dir).await;
    let rootfs = make_rootfs(
        tmp.path(),
        "rootfs",
        &[("a", random_bytes(512 * 1024)), ("b", random_bytes(512 * 1024))],
    );

    let result = build(&config_for(&oci_dir), "unused", vec![rootfs]).await.unwrap();
    assert_eq!(result.layers_added, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_cancels_build_and_leaves_reference() {
    let tmp = TempDir::new().unwrap();
    let oci_dir = tmp.path().join("oci");
    let base_digest = seed_base(&oci_dir).await;
    let blobs_before = blob_count(&oci_dir);

    let mut rootfses: Vec<PathBuf> = (0..6)
        .map(|i| {
            make_rootfs(
                tmp.path(),
                &format!("r{}", i),
                &[("data", random_bytes(256 * 1024))],
            )
        })
        .collect();
    let missing = tmp.path().join("missing");
    rootfses.insert(2, missing.clone());

    let err = build(&config_for(&oci_dir), "unused", rootfses)
        .await
        .unwrap_err();
    match err {
        MergeError::WalkError { path, .. } => assert_eq!(path, missing),
        other => panic!("expected walk error, got {:?}", other),
    }

    let layout = OciLayout::open(&oci_dir).unwrap();
    let (digest, _, _) = current_image(&layout).await;
    assert_eq!(digest, base_digest);
    assert_eq!(blob_count(&oci_dir), blobs_before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_build_layers_missing_tag() {
    let tmp = TempDir::new().unwrap();
    let oci_dir = tmp.path().join("oci");
    let store: Arc<dyn BlobStore> = Arc::new(OciLayout::open(&oci_dir).unwrap());
    let rootfs = make_rootfs(tmp.path(), "rootfs", &[("file", b"x".to_vec())]);

    let err = build_layers(&config_for(&oci_dir), store, vec![rootfs])
        .await
        .unwrap_err();
    assert!(matches!(err, MergeError::InvalidReference(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rebuild_stacks_and_collects_garbage() {
    let tmp = TempDir::new().unwrap();
    let oci_dir = tmp.path().join("oci");
    seed_base(&oci_dir).await;
    let rootfs = make_rootfs(tmp.path(), "rootfs", &[("file", b"content".to_vec())]);

    // Stray blob from an earlier interrupted run.
    let layout = OciLayout::open(&oci_dir).unwrap();
    let (junk, _) = layout
        .put_blob_json(&serde_json::json!({"stray": true}))
        .await
        .unwrap();

    let config = config_for(&oci_dir);
    build(&config, "unused", vec![rootfs.clone()]).await.unwrap();
    assert!(!layout.blob_path(&junk).unwrap().exists());

    let other = make_rootfs(tmp.path(), "other", &[("more", b"more".to_vec())]);
    build(&config, "unused", vec![other]).await.unwrap();

    let (_, manifest, config_json) = current_image(&layout).await;
    assert_eq!(manifest["layers"].as_array().unwrap().len(), 3);
    assert_eq!(config_json["rootfs"]["diff_ids"].as_array().unwrap().len(), 3);
    // Manifest, config and two layers; superseded documents are gone.
    assert_eq!(blob_count(&oci_dir), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_build_from_rootfs_list_with_groups() {
    let tmp = TempDir::new().unwrap();
    let oci_dir = tmp.path().join("oci");
    seed_base(&oci_dir).await;
    let mut list = String::new();
    for i in 0..5 {
        let name = format!("f{}", i);
        let root = make_rootfs(tmp.path(), &format!("r{}", i), &[(name.as_str(), vec![i as u8; 16])]);
        list.push_str(&format!("{}\n\n", root.display()));
    }
    let list_path = tmp.path().join("rootfses.txt");
    std::fs::write(&list_path, list).unwrap();

    let rootfses = read_rootfs_list(&list_path).unwrap();
    assert_eq!(rootfses.len(), 5);

    let config = BuildConfig {
        dirs_per_blob: 2,
        serialize: true,
        ..config_for(&oci_dir)
    };
    let result = build(&config, "unused", rootfses).await.unwrap();
    assert_eq!(result.layers_added, 3);

    let layout = OciLayout::open(&oci_dir).unwrap();
    let (_, manifest, _) = current_image(&layout).await;
    let layers = manifest["layers"].as_array().unwrap();
    let (_, first) = open_layer(&layout, layers[1]["digest"].as_str().unwrap()).await;
    let (_, last) = open_layer(&layout, layers[3]["digest"].as_str().unwrap()).await;
    assert!(first.contains_key("f0") && first.contains_key("f1"));
    assert_eq!(last.keys().collect::<Vec<_>>(), vec!["f4"]);
}
