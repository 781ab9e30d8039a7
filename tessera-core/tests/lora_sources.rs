use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use httpmock::prelude::*;
use tempfile::TempDir;
use tessera_core::lora::{
    EntryKind, HubClient, LoraFetcher, LoraId, WeightsCache, REPLICATE_LORA_PATH,
};
use tessera_core::LoraError;

mod common;

struct OfflineHub;

#[async_trait]
impl HubClient for OfflineHub {
    async fn fetch(&self, repo: &str, file: &str) -> Result<PathBuf, LoraError> {
        Err(LoraError::Hub {
            repo: repo.to_string(),
            file: file.to_string(),
            message: "offline".to_string(),
        })
    }
}

/// Serves one file for every repo and remembers what was asked for.
struct RecordingHub {
    weights: PathBuf,
    requests: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl HubClient for RecordingHub {
    async fn fetch(&self, repo: &str, file: &str) -> Result<PathBuf, LoraError> {
        self.requests
            .lock()
            .unwrap()
            .push((repo.to_string(), file.to_string()));
        Ok(self.weights.clone())
    }
}

fn fetcher(dir: &TempDir) -> LoraFetcher {
    let cache = WeightsCache::new(dir.path().join("cache"), 0).unwrap();
    LoraFetcher::new(cache, Arc::new(OfflineHub))
}

#[tokio::test]
async fn safetensors_url_is_downloaded_once() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/styles/ink.safetensors");
            then.status(200).body(common::safetensors_bytes());
        })
        .await;

    let dir = TempDir::new().unwrap();
    let mut fetcher = fetcher(&dir);
    let id = LoraId::parse(&server.url("/styles/ink.safetensors")).unwrap();
    assert!(matches!(id, LoraId::SafetensorsUrl { .. }));

    let first = fetcher.fetch(&id).await.unwrap();
    let second = fetcher.fetch(&id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(std::fs::read(&first).unwrap(), common::safetensors_bytes());
    mock.assert_hits_async(1).await;
    assert_eq!(fetcher.cache().misses(), 1);
    assert_eq!(fetcher.cache().hits(), 1);
}

#[tokio::test]
async fn http_errors_leave_no_entry_behind() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/missing.safetensors");
            then.status(404).body("Not Found");
        })
        .await;

    let dir = TempDir::new().unwrap();
    let mut cache = WeightsCache::new(dir.path(), 0).unwrap();
    let url = server.url("/missing.safetensors");
    let err = cache.ensure(&url, EntryKind::File).await.unwrap_err();
    assert!(matches!(err, LoraError::HttpStatus { status: 404, .. }));
    assert!(!cache.contains(&url));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn html_page_is_rejected_as_weights() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/login.safetensors");
            then.status(200).body("<html>please sign in</html>");
        })
        .await;

    let dir = TempDir::new().unwrap();
    let mut fetcher = fetcher(&dir);
    let id = LoraId::parse(&server.url("/login.safetensors")).unwrap();
    assert!(matches!(
        fetcher.fetch(&id).await,
        Err(LoraError::InvalidWeights { .. })
    ));
}

#[tokio::test]
async fn replicate_tarball_is_unpacked() {
    let weights = common::safetensors_bytes();
    let tar = common::tarball(
        &[
            ("output/flux_train_replicate/config.yaml", &b"rank: 16"[..]),
            (REPLICATE_LORA_PATH, weights.as_slice()),
        ],
        false,
    );
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/yhqm/abc/trained_model.tar");
            then.status(200).body(tar);
        })
        .await;

    let dir = TempDir::new().unwrap();
    let mut fetcher = fetcher(&dir);
    let id = LoraId::ReplicateTar {
        url: server.url("/yhqm/abc/trained_model.tar"),
    };
    let path = fetcher.fetch(&id).await.unwrap();
    assert!(path.ends_with(REPLICATE_LORA_PATH));
    assert_eq!(std::fs::read(&path).unwrap(), weights);

    fetcher.fetch(&id).await.unwrap();
    mock.assert_hits_async(1).await;
}

#[tokio::test]
async fn gzipped_archive_entries_are_directories() {
    let tar = common::tarball(&[("weights/style.safetensors", &b"x"[..])], true);
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/bundle.tar.gz");
            then.status(200).body(tar);
        })
        .await;

    let dir = TempDir::new().unwrap();
    let mut cache = WeightsCache::new(dir.path(), 0).unwrap();
    let entry = cache
        .ensure(&server.url("/bundle.tar.gz"), EntryKind::Archive)
        .await
        .unwrap();
    assert!(entry.is_dir());
    assert!(entry.join("weights/style.safetensors").is_file());
}

#[tokio::test]
async fn low_disk_space_evicts_before_download() {
    let server = MockServer::start_async().await;
    for name in ["/a.safetensors", "/b.safetensors"] {
        server
            .mock_async(|when, then| {
                when.method(GET).path(name);
                then.status(200).body(common::safetensors_bytes());
            })
            .await;
    }

    let dir = TempDir::new().unwrap();
    let mut cache = WeightsCache::new(dir.path(), 1)
        .unwrap()
        .with_space_probe(Arc::new(|_: &Path| 0u64));
    let a = cache
        .ensure(&server.url("/a.safetensors"), EntryKind::File)
        .await
        .unwrap();
    assert!(cache.is_pinned(&a));
    cache.unpin_all();
    let b = cache
        .ensure(&server.url("/b.safetensors"), EntryKind::File)
        .await
        .unwrap();

    assert!(!a.exists());
    assert!(b.exists());
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn entries_fetched_together_are_not_evicted() {
    let server = MockServer::start_async().await;
    for name in ["/a.safetensors", "/b.safetensors"] {
        server
            .mock_async(|when, then| {
                when.method(GET).path(name);
                then.status(200).body(common::safetensors_bytes());
            })
            .await;
    }

    let dir = TempDir::new().unwrap();
    let mut cache = WeightsCache::new(dir.path(), 1)
        .unwrap()
        .with_space_probe(Arc::new(|_: &Path| 0u64));
    let a = cache
        .ensure(&server.url("/a.safetensors"), EntryKind::File)
        .await
        .unwrap();
    let b = cache
        .ensure(&server.url("/b.safetensors"), EntryKind::File)
        .await
        .unwrap();

    assert!(a.exists());
    assert!(b.exists());
    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn restart_reuses_downloads() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/keep.safetensors");
            then.status(200).body(common::safetensors_bytes());
        })
        .await;
    let url = server.url("/keep.safetensors");

    let dir = TempDir::new().unwrap();
    {
        let mut cache = WeightsCache::new(dir.path(), 0).unwrap();
        cache.ensure(&url, EntryKind::File).await.unwrap();
    }
    let mut cache = WeightsCache::new(dir.path(), 0).unwrap();
    assert!(cache.contains(&url));
    cache.ensure(&url, EntryKind::File).await.unwrap();
    mock.assert_hits_async(1).await;
}

#[tokio::test]
async fn local_sources() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("style.safetensors");
    common::write_safetensors(&file);
    let archive = dir.path().join("bundle.tgz");
    std::fs::write(
        &archive,
        common::tarball(
            &[("nested/lora.safetensors", common::safetensors_bytes().as_slice())],
            true,
        ),
    )
    .unwrap();

    let mut fetcher = fetcher(&dir);

    let id = LoraId::parse(file.to_str().unwrap()).unwrap();
    assert!(matches!(id, LoraId::LocalFile { .. }));
    assert_eq!(fetcher.fetch(&id).await.unwrap(), file);

    let id = LoraId::parse(archive.to_str().unwrap()).unwrap();
    assert!(matches!(id, LoraId::LocalArchive { .. }));
    let weights = fetcher.fetch(&id).await.unwrap();
    assert!(weights.ends_with("nested/lora.safetensors"));
    assert!(weights.starts_with(fetcher.cache().base_dir()));

    let missing = LoraId::parse("/nowhere/style.safetensors").unwrap();
    assert!(matches!(
        fetcher.fetch(&missing).await,
        Err(LoraError::MissingWeights(_))
    ));
}

#[tokio::test]
async fn hub_errors_propagate() {
    let dir = TempDir::new().unwrap();
    let mut fetcher = fetcher(&dir);
    let id = LoraId::parse("owner/style").unwrap();
    assert!(matches!(
        fetcher.fetch(&id).await,
        Err(LoraError::Hub { .. })
    ));
}

#[tokio::test]
async fn hub_url_asks_for_the_named_file() {
    let dir = TempDir::new().unwrap();
    let weights = dir.path().join("hub/lora.safetensors");
    common::write_safetensors(&weights);
    let hub = Arc::new(RecordingHub {
        weights: weights.clone(),
        requests: Mutex::new(Vec::new()),
    });
    let cache = WeightsCache::new(dir.path().join("cache"), 0).unwrap();
    let mut fetcher = LoraFetcher::new(cache, hub.clone());

    let id = LoraId::parse(
        "https://huggingface.co/XLabs-AI/flux-RealismLora/blob/main/lora.safetensors",
    )
    .unwrap();
    assert!(matches!(id, LoraId::HubUrl { .. }));
    assert_eq!(fetcher.fetch(&id).await.unwrap(), weights);

    let id = LoraId::parse("owner/style").unwrap();
    fetcher.fetch(&id).await.unwrap();

    assert_eq!(
        *hub.requests.lock().unwrap(),
        vec![
            (
                "XLabs-AI/flux-RealismLora".to_string(),
                "lora.safetensors".to_string()
            ),
            (
                "owner/style".to_string(),
                "pytorch_lora_weights.safetensors".to_string()
            ),
        ]
    );
    assert!(fetcher.cache().is_empty());
}

#[tokio::test]
async fn civitai_download_is_cached_as_a_file() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/download/models/735063")
                .query_param("type", "Model")
                .query_param("format", "SafeTensor");
            then.status(200).body(common::safetensors_bytes());
        })
        .await;
    let url = server.url("/api/download/models/735063?type=Model&format=SafeTensor");

    let dir = TempDir::new().unwrap();
    let mut fetcher = fetcher(&dir);
    let id = LoraId::Civitai { url: url.clone() };

    let path = fetcher.fetch(&id).await.unwrap();
    assert!(path.is_file());
    assert_eq!(path, fetcher.cache().entry_path(&url));
    assert_eq!(std::fs::read(&path).unwrap(), common::safetensors_bytes());

    fetcher.fetch(&id).await.unwrap();
    mock.assert_hits_async(1).await;
}
