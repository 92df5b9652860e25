//! Concurrent layer download.
//!
//! Every included layer gets its own task on a [`JoinSet`]; a [`Semaphore`]
//! bounds how many of them talk to the source at once. The first failure
//! aborts all siblings, and every failure seen up to that point is reported
//! together.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use layerdisk_oci::{ContentHash, ImageRef, OciError};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{BlobDownloadFailures, BlobFailure};
use crate::image::{ImageInfo, LayerDescriptor};
use crate::{Error, Result};

const BLOB_PREFIX: &str = "blob-";
const BOOTSTRAP_PREFIX: &str = "bootstrap-";

/// Buffer size for local blob files.
pub(crate) const IO_BUFFER_SIZE: usize = 1024 * 1024;

/// A layer that has been downloaded to local storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBlob {
    pub layer_index: usize,
    pub digest: ContentHash,
    pub local_path: PathBuf,
}

/// Local file name for the layer at `index`: `bootstrap-<hex>` for the
/// first layer, `blob-<hex>` for the rest.
pub fn blob_file_name(index: usize, digest: &ContentHash) -> String {
    let prefix = if index == 0 {
        BOOTSTRAP_PREFIX
    } else {
        BLOB_PREFIX
    };
    format!("{}{}", prefix, digest.encoded())
}

/// Remove `path` if it exists and create it again, empty.
pub async fn prepare_dir(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!(path = %path.display(), "removed previous target directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(path).await
}

/// Downloads image layers into a directory.
pub struct Fetcher {
    source: Arc<dyn crate::ImageSource>,
    concurrency: usize,
}

impl Fetcher {
    pub fn new(source: Arc<dyn crate::ImageSource>, concurrency: usize) -> Self {
        Self {
            source,
            concurrency: concurrency.max(1),
        }
    }

    /// Reset `dest` and download the first `limit` layers of `image` (all
    /// of them when `None`). The result is ordered by layer index.
    pub async fn fetch_all(
        &self,
        image_ref: &ImageRef,
        image: &ImageInfo,
        dest: &Path,
        limit: Option<usize>,
    ) -> Result<Vec<FetchedBlob>> {
        let started = Instant::now();
        let count = image.included(limit);
        info!(dir = %dest.display(), layers = count, "downloading blobs");

        prepare_dir(dest).await.map_err(|source| Error::TargetDir {
            path: dest.to_path_buf(),
            source,
        })?;

        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set = JoinSet::new();

        for (index, layer) in image.layers.iter().take(count).enumerate() {
            let path = dest.join(blob_file_name(index, &layer.digest));
            let source = self.source.clone();
            let sem = sem.clone();
            let image_ref = image_ref.clone();
            let layer = layer.clone();

            join_set.spawn(async move {
                let result = match sem.acquire_owned().await {
                    Ok(_permit) => download_layer(source.as_ref(), &image_ref, &layer, &path).await,
                    Err(_) => Err(OciError::Registry("fetch pool closed".to_string())),
                };
                (index, layer.digest, path, result)
            });
        }

        let mut fetched = Vec::with_capacity(count);
        let mut failures = Vec::new();
        let mut panicked = None;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, digest, local_path, Ok(()))) => fetched.push(FetchedBlob {
                    layer_index: index,
                    digest,
                    local_path,
                }),
                Ok((index, digest, _, Err(error))) => {
                    warn!(index, %digest, %error, "blob download failed");
                    if failures.is_empty() {
                        join_set.abort_all();
                    }
                    failures.push(BlobFailure {
                        layer_index: index,
                        digest: digest.to_string(),
                        error,
                    });
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    join_set.abort_all();
                    panicked.get_or_insert_with(|| e.to_string());
                }
            }
        }

        if let Some(msg) = panicked {
            return Err(Error::InternalConsistency(format!(
                "fetch task panicked: {}",
                msg
            )));
        }
        if !failures.is_empty() {
            failures.sort_by_key(|f| f.layer_index);
            return Err(Error::BlobDownload(BlobDownloadFailures(failures)));
        }

        fetched.sort_by_key(|b| b.layer_index);
        info!(
            count = fetched.len(),
            elapsed = %crate::elapsed(started),
            "downloaded blobs"
        );
        Ok(fetched)
    }
}

/// Stream one layer to `path`, checking its size and digest on the way.
async fn download_layer(
    source: &dyn crate::ImageSource,
    image_ref: &ImageRef,
    layer: &LayerDescriptor,
    path: &Path,
) -> std::result::Result<(), OciError> {
    let mut stream = source
        .fetch_blob(image_ref, &layer.digest, layer.size)
        .await?;

    let file = tokio::fs::File::create(path).await?;
    let mut out = BufWriter::with_capacity(IO_BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        out.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    out.flush().await?;
    out.into_inner().sync_all().await?;

    if written != layer.size {
        return Err(OciError::SizeMismatch {
            expected: layer.size,
            actual: written,
        });
    }
    let actual = ContentHash::from_hasher(hasher);
    if actual != layer.digest {
        return Err(OciError::DigestMismatch {
            expected: layer.digest.to_string(),
            actual: actual.to_string(),
        });
    }

    info!(path = %path.display(), bytes = written, "downloaded blob");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::classify;
    use crate::source::SourceManifest;
    use bytes::Bytes;
    use layerdisk_oci::manifest::{MEDIA_TYPE_NYDUS_BLOB, MEDIA_TYPE_NYDUS_BOOTSTRAP};
    use layerdisk_oci::BlobStream;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves blobs from memory; digests listed in `broken` fail to open
    /// and those in `stalled` never answer.
    #[derive(Default)]
    struct MemorySource {
        blobs: HashMap<ContentHash, Vec<u8>>,
        broken: Vec<ContentHash>,
        stalled: Vec<ContentHash>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl crate::ImageSource for MemorySource {
        async fn resolve_manifest(
            &self,
            _image_ref: &ImageRef,
        ) -> std::result::Result<SourceManifest, OciError> {
            Err(OciError::NotFound("manifest".into()))
        }

        async fn fetch_blob(
            &self,
            _image_ref: &ImageRef,
            digest: &ContentHash,
            _expected_size: u64,
        ) -> std::result::Result<BlobStream, OciError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.stalled.contains(digest) {
                std::future::pending::<()>().await;
            }
            if self.broken.contains(digest) {
                return Err(OciError::NotFound(digest.to_string()));
            }
            let data = self
                .blobs
                .get(digest)
                .cloned()
                .ok_or_else(|| OciError::NotFound(digest.to_string()))?;
            let chunks: Vec<std::result::Result<Bytes, OciError>> = data
                .chunks(4096)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(Box::pin(futures_util::stream::iter(chunks)))
        }
    }

    fn image_of(source: &mut MemorySource, contents: &[Vec<u8>]) -> ImageInfo {
        let mut raw = Vec::new();
        for (i, data) in contents.iter().enumerate() {
            let digest = ContentHash::of_bytes(data);
            source.blobs.insert(digest.clone(), data.clone());
            let media = if i == 0 {
                MEDIA_TYPE_NYDUS_BOOTSTRAP
            } else {
                MEDIA_TYPE_NYDUS_BLOB
            };
            raw.push(LayerDescriptor::new(digest, data.len() as u64, media));
        }
        classify("localhost:5000/test:latest", ContentHash::of_bytes(b"m"), raw).unwrap()
    }

    fn image_ref() -> ImageRef {
        ImageRef::parse("localhost:5000/test:latest").unwrap()
    }

    #[test]
    fn file_names_follow_role() {
        let d = ContentHash::of_bytes(b"x");
        assert_eq!(blob_file_name(0, &d), format!("bootstrap-{}", d.encoded()));
        assert_eq!(blob_file_name(3, &d), format!("blob-{}", d.encoded()));
    }

    #[tokio::test]
    async fn fetches_every_layer_index_aligned() {
        let mut source = MemorySource::default();
        let contents: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 10_000 + i as usize]).collect();
        let image = image_of(&mut source, &contents);
        let source = Arc::new(source);

        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("work");
        let fetcher = Fetcher::new(source.clone(), 2);
        let blobs = fetcher
            .fetch_all(&image_ref(), &image, &dest, None)
            .await
            .unwrap();

        assert_eq!(blobs.len(), 6);
        for (i, blob) in blobs.iter().enumerate() {
            assert_eq!(blob.layer_index, i);
            assert_eq!(blob.digest, image.layers[i].digest);
            assert_eq!(std::fs::read(&blob.local_path).unwrap(), contents[i]);
        }
        assert!(source.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn layer_limit_leaves_later_layers_unfetched() {
        let mut source = MemorySource::default();
        let contents = vec![vec![1u8; 100], vec![2u8; 200], vec![3u8; 300]];
        let image = image_of(&mut source, &contents);

        let tmp = tempfile::tempdir().unwrap();
        let blobs = Fetcher::new(Arc::new(source), 4)
            .fetch_all(&image_ref(), &image, tmp.path(), Some(2))
            .await
            .unwrap();

        assert_eq!(blobs.len(), 2);
        let unfetched = tmp.path().join(blob_file_name(2, &image.layers[2].digest));
        assert!(!unfetched.exists());
    }

    #[tokio::test]
    async fn target_directory_is_reset() {
        let mut source = MemorySource::default();
        let image = image_of(&mut source, &[vec![7u8; 64]]);

        let tmp = tempfile::tempdir().unwrap();
        let stale = tmp.path().join("stale");
        std::fs::write(&stale, b"old").unwrap();

        Fetcher::new(Arc::new(source), 1)
            .fetch_all(&image_ref(), &image, tmp.path(), None)
            .await
            .unwrap();
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn failures_are_aggregated() {
        let mut source = MemorySource::default();
        let contents = vec![vec![1u8; 10], vec![2u8; 20], vec![3u8; 30]];
        let image = image_of(&mut source, &contents);
        source.broken.push(image.layers[1].digest.clone());

        let tmp = tempfile::tempdir().unwrap();
        let err = Fetcher::new(Arc::new(source), 1)
            .fetch_all(&image_ref(), &image, tmp.path(), None)
            .await
            .unwrap_err();

        match err {
            Error::BlobDownload(failures) => {
                assert_eq!(failures.layer_indices(), vec![1]);
                assert!(matches!(failures.0[0].error, OciError::NotFound(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn first_failure_cancels_stalled_siblings() {
        let mut source = MemorySource::default();
        let contents = vec![vec![1u8; 10], vec![2u8; 20], vec![3u8; 30]];
        let image = image_of(&mut source, &contents);
        source.stalled.push(image.layers[0].digest.clone());
        source.stalled.push(image.layers[2].digest.clone());
        source.broken.push(image.layers[1].digest.clone());

        let tmp = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(Arc::new(source), 8);
        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            fetcher.fetch_all(&image_ref(), &image, tmp.path(), None),
        )
        .await
        .expect("stalled downloads were not cancelled")
        .unwrap_err();

        match err {
            Error::BlobDownload(failures) => assert_eq!(failures.layer_indices(), vec![1]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unusable_target_directory_names_its_path() {
        let mut source = MemorySource::default();
        let image = image_of(&mut source, &[vec![7u8; 64]]);

        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("plain-file");
        std::fs::write(&file, b"not a directory").unwrap();
        let dest = file.join("work");

        let err = Fetcher::new(Arc::new(source), 1)
            .fetch_all(&image_ref(), &image, &dest, None)
            .await
            .unwrap_err();

        assert_eq!(err.phase(), "fetch");
        match err {
            Error::TargetDir { path, .. } => assert_eq!(path, dest),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn wrong_bytes_fail_digest_check() {
        let mut source = MemorySource::default();
        let image = image_of(&mut source, &[vec![1u8; 32], vec![2u8; 32]]);
        // Same length, different content.
        source
            .blobs
            .insert(image.layers[1].digest.clone(), vec![9u8; 32]);

        let tmp = tempfile::tempdir().unwrap();
        let err = Fetcher::new(Arc::new(source), 2)
            .fetch_all(&image_ref(), &image, tmp.path(), None)
            .await
            .unwrap_err();

        match err {
            Error::BlobDownload(failures) => {
                assert_eq!(failures.layer_indices(), vec![1]);
                assert!(matches!(
                    failures.0[0].error,
                    OciError::DigestMismatch { .. }
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn short_blob_fails_size_check() {
        let mut source = MemorySource::default();
        let mut image = image_of(&mut source, &[vec![1u8; 32]]);
        image.layers[0].size = 64;

        let tmp = tempfile::tempdir().unwrap();
        let err = Fetcher::new(Arc::new(source), 1)
            .fetch_all(&image_ref(), &image, tmp.path(), None)
            .await
            .unwrap_err();

        match err {
            Error::BlobDownload(failures) => assert!(matches!(
                failures.0[0].error,
                OciError::SizeMismatch {
                    expected: 64,
                    actual: 32
                }
            )),
            other => panic!("unexpected error: {other}"),
        }
    }
}
