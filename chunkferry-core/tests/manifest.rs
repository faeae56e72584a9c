mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chunkferry_core::backend::MemoryBackend;
use chunkferry_core::download::OutputTarget;
use chunkferry_core::manifest::ManifestLock;
use chunkferry_core::{ChunkStore, Error, Manifest, Orchestrator, Stage, TransferState};
use common::{bytes, config};
use serde_json::Value;

/// Upload 1000 bytes in 400-byte chunks and return the manifest as JSON.
fn uploaded_manifest(dir: &Path) -> (std::path::PathBuf, Value) {
    let cfg = config(dir, &bytes(1000, 1), 400);
    let orch = Orchestrator::new(cfg.clone(), Arc::new(MemoryBackend::new())).unwrap();
    let outcome = orch.upload(&orch.split().unwrap()).unwrap();
    assert!(outcome.is_complete());
    let path = cfg.manifest_path();
    let json: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    (path, json)
}

fn write_json(path: &Path, v: &Value) {
    fs::write(path, serde_json::to_vec_pretty(v).unwrap()).unwrap();
}

#[test]
fn persisted_layout() {
    let td = tempfile::tempdir().unwrap();
    let (_, json) = uploaded_manifest(td.path());
    assert_eq!(json["version"], 1);
    assert_eq!(json["source_name"], "input.bin");
    assert_eq!(json["source_size"], 1000);
    assert_eq!(json["chunk_size"], 400);
    assert_eq!(json["replicas"], 1);
    let rec = &json["records"][0];
    assert_eq!(rec["index"], 1);
    assert_eq!(rec["state"], "uploaded");
    assert_eq!(rec["source_path"], "input-part-01.bin");
    assert!(rec["root_hash"].as_str().unwrap().starts_with("0x"));
    assert!(rec["receipt"].as_str().is_some());
    assert!(rec.get("error").is_none());
}

#[test]
fn malformed_json_is_corrupt() {
    let td = tempfile::tempdir().unwrap();
    let path = td.path().join("manifest.json");
    fs::write(&path, b"{ \"version\": 1, \"records\": [").unwrap();
    assert!(matches!(Manifest::load(&path), Err(Error::ManifestCorrupt(_))));
}

#[test]
fn index_gap_is_corrupt() {
    let td = tempfile::tempdir().unwrap();
    let (path, mut json) = uploaded_manifest(td.path());
    json["records"].as_array_mut().unwrap().remove(1);
    write_json(&path, &json);
    let err = Manifest::load(&path).unwrap_err();
    assert!(matches!(&err, Error::ManifestCorrupt(m) if m.contains("gap")), "{err}");
}

#[test]
fn uploaded_without_root_hash_is_corrupt() {
    let td = tempfile::tempdir().unwrap();
    let (path, mut json) = uploaded_manifest(td.path());
    json["records"][0].as_object_mut().unwrap().remove("root_hash");
    write_json(&path, &json);
    assert!(matches!(Manifest::load(&path), Err(Error::ManifestCorrupt(_))));
}

#[test]
fn pending_with_root_hash_is_corrupt() {
    let td = tempfile::tempdir().unwrap();
    let (path, mut json) = uploaded_manifest(td.path());
    json["records"][2]["state"] = "pending".into();
    write_json(&path, &json);
    assert!(matches!(Manifest::load(&path), Err(Error::ManifestCorrupt(_))));
}

#[test]
fn bad_root_hash_text_is_corrupt() {
    let td = tempfile::tempdir().unwrap();
    let (path, mut json) = uploaded_manifest(td.path());
    json["records"][0]["root_hash"] = "0xnothex".into();
    write_json(&path, &json);
    assert!(matches!(Manifest::load(&path), Err(Error::ManifestCorrupt(_))));
}

#[test]
fn interrupted_upload_reloads_as_failed() {
    let td = tempfile::tempdir().unwrap();
    let (path, mut json) = uploaded_manifest(td.path());
    let rec = json["records"][2].as_object_mut().unwrap();
    rec.insert("state".into(), "uploading".into());
    rec.remove("root_hash");
    rec.remove("receipt");
    write_json(&path, &json);

    let store = ChunkStore::open(&path).unwrap();
    let rec = store.get(3).unwrap();
    assert_eq!(rec.state, TransferState::Failed);
    assert_eq!(rec.error.as_deref(), Some("interrupted"));
    assert_eq!(store.counts().uploaded, 2);
}

#[test]
fn download_requires_complete_manifest() {
    let td = tempfile::tempdir().unwrap();
    let (path, mut json) = uploaded_manifest(td.path());
    let rec = json["records"][1].as_object_mut().unwrap();
    rec.insert("state".into(), "failed".into());
    rec.insert("error".into(), "rejected".into());
    rec.remove("root_hash");
    write_json(&path, &json);

    let cfg = config(td.path(), &bytes(1000, 1), 400);
    let orch = Orchestrator::new(cfg, Arc::new(MemoryBackend::new())).unwrap();
    let out = td.path().join("out.bin");
    let err = orch.download_manifest(&path, &OutputTarget::File(out.clone())).unwrap_err();
    assert_eq!(err.stage, Stage::Manifest);
    assert!(matches!(err.error, Error::IncompleteManifest { index: 2, state: TransferState::Failed }));
    assert!(!out.exists());
}

#[test]
fn manifest_lock_is_exclusive() {
    let td = tempfile::tempdir().unwrap();
    let path = td.path().join("manifest.json");
    let held = ManifestLock::acquire(&path).unwrap();
    assert!(ManifestLock::acquire(&path).is_err());
    drop(held);
    assert!(ManifestLock::acquire(&path).is_ok());
}

#[test]
fn per_chunk_directory_download() {
    let td = tempfile::tempdir().unwrap();
    let data = bytes(1000, 1);
    let cfg = config(td.path(), &data, 400);
    let orch = Orchestrator::new(cfg.clone(), Arc::new(MemoryBackend::new())).unwrap();
    let chunks = orch.split().unwrap();
    assert!(orch.upload(&chunks).unwrap().is_complete());

    let dir = td.path().join("parts");
    let rep = orch.download_manifest(&cfg.manifest_path(), &OutputTarget::Directory(dir.clone())).unwrap();
    assert_eq!(rep.chunks, 3);
    assert_eq!(rep.bytes, 1000);
    for c in &chunks {
        assert_eq!(fs::read(dir.join(c.file_name())).unwrap(), c.read().unwrap());
    }
    assert_eq!(ChunkStore::open(&cfg.manifest_path()).unwrap().counts().verified, 3);
}
