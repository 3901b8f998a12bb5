//! Mirror-failover model download with streaming progress.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::pipeline::{Progress, ProgressSink};

use super::cache::ModelCache;

/// Upper bound on the buffer pre-allocated from a size hint.
const MAX_PREALLOCATION: u64 = 512 * 1024 * 1024;

/// Opens streaming reads of a URL.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a GET request; the body is read through the returned [`Body`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] on connection failures and non-success
    /// statuses.
    async fn open(&self, url: &str) -> Result<Box<dyn Body>>;
}

/// An in-flight response body.
#[async_trait]
pub trait Body: Send {
    /// Total size announced by the server, if any.
    fn size_hint(&self) -> Option<u64>;

    /// Append the next chunk to `buf` and return its length; `0` marks the
    /// end of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] if the stream breaks.
    async fn read_chunk(&mut self, buf: &mut Vec<u8>) -> Result<usize>;
}

/// [`Transport`] over HTTP(S) using `reqwest`. Redirects are followed.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn Body>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| network(url, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network {
                url: url.to_string(),
                reason: format!("HTTP {status}"),
            });
        }

        Ok(Box::new(HttpBody {
            url: url.to_string(),
            response,
        }))
    }
}

struct HttpBody {
    url: String,
    response: reqwest::Response,
}

#[async_trait]
impl Body for HttpBody {
    fn size_hint(&self) -> Option<u64> {
        self.response.content_length()
    }

    async fn read_chunk(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        loop {
            match self.response.chunk().await {
                Ok(Some(bytes)) if bytes.is_empty() => continue,
                Ok(Some(bytes)) => {
                    buf.extend_from_slice(&bytes);
                    return Ok(bytes.len());
                }
                Ok(None) => return Ok(0),
                Err(err) => return Err(network(&self.url, err)),
            }
        }
    }
}

fn network(url: &str, err: impl std::fmt::Display) -> Error {
    Error::Network {
        url: url.to_string(),
        reason: err.to_string(),
    }
}

/// Fetches the model blob, preferring the cache and falling back to an
/// ordered list of mirrors.
pub struct ModelDownloader {
    cache: Option<ModelCache>,
    cache_key: String,
    mirrors: Vec<String>,
    transport: Arc<dyn Transport>,
}

impl ModelDownloader {
    /// Create a downloader. With `cache` set to `None` every call goes to
    /// the network.
    #[must_use]
    pub fn new(
        cache: Option<ModelCache>,
        cache_key: impl Into<String>,
        mirrors: Vec<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            cache,
            cache_key: cache_key.into(),
            mirrors,
            transport,
        }
    }

    /// Return the model bytes from the cache, or download and cache them.
    ///
    /// A cache hit reports 100% progress and makes no network call. Cache
    /// failures are logged and otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DownloadExhausted`] if no mirror delivers the model.
    pub async fn download_model(&self, progress: &dyn ProgressSink) -> Result<Vec<u8>> {
        self.download_model_if(progress, &|| true).await
    }

    /// Like [`download_model`](Self::download_model), but a freshly
    /// downloaded blob is only written to the cache if `persist` still
    /// returns `true` once the transfer has finished.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DownloadExhausted`] if no mirror delivers the model.
    pub async fn download_model_if(
        &self,
        progress: &dyn ProgressSink,
        persist: &(dyn Fn() -> bool + Sync),
    ) -> Result<Vec<u8>> {
        if let Some(blob) = self.read_cache().await {
            tracing::info!("Model {} loaded from cache", self.cache_key);
            progress.report(&Progress::download_complete(blob.len() as u64));
            return Ok(blob);
        }

        let mut failures = Vec::with_capacity(self.mirrors.len());
        for url in &self.mirrors {
            match self.fetch(url, progress).await {
                Ok(blob) => {
                    tracing::info!("Downloaded {} bytes from {url}", blob.len());
                    if persist() {
                        self.write_cache(&blob).await;
                    } else {
                        tracing::debug!("Download superseded; not caching {}", self.cache_key);
                    }
                    return Ok(blob);
                }
                Err(err) => {
                    tracing::warn!("{err}");
                    failures.push(err);
                }
            }
        }

        Err(Error::DownloadExhausted { failures })
    }

    /// Whether the model is present in the cache.
    pub async fn is_cached(&self) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        match cache.contains(&self.cache_key).await {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!("{err}");
                false
            }
        }
    }

    /// Remove the model from the cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the cached file cannot be removed.
    pub async fn clear_cache(&self) -> Result<()> {
        match &self.cache {
            Some(cache) => cache.delete(&self.cache_key).await,
            None => Ok(()),
        }
    }

    async fn read_cache(&self) -> Option<Vec<u8>> {
        let cache = self.cache.as_ref()?;
        match cache.get(&self.cache_key).await {
            Ok(Some(blob)) if !blob.is_empty() => Some(blob),
            Ok(Some(_)) => {
                tracing::warn!("Ignoring empty cached model {}", self.cache_key);
                None
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!("{err}; falling back to download");
                None
            }
        }
    }

    async fn write_cache(&self, blob: &[u8]) {
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.put(&self.cache_key, blob).await {
                tracing::warn!("{err}; model will be downloaded again next time");
            }
        }
    }

    /// Stream one mirror to completion.
    #[allow(clippy::cast_possible_truncation)]
    async fn fetch(&self, url: &str, progress: &dyn ProgressSink) -> Result<Vec<u8>> {
        tracing::info!("Downloading model from {url}");

        let mut body = self.transport.open(url).await?;
        let total = body.size_hint();

        // Safe: bounded by MAX_PREALLOCATION
        let mut blob = Vec::with_capacity(total.unwrap_or(0).min(MAX_PREALLOCATION) as usize);
        progress.report(&Progress::download(0, total));

        loop {
            let read = body.read_chunk(&mut blob).await?;
            if read == 0 {
                break;
            }
            tracing::trace!("{} bytes from {url}", blob.len());
            progress.report(&Progress::download(blob.len() as u64, total));
        }

        if blob.is_empty() {
            return Err(Error::Network {
                url: url.to_string(),
                reason: "empty response body".to_string(),
            });
        }
        if let Some(expected) = total {
            if (blob.len() as u64) < expected {
                return Err(Error::Network {
                    url: url.to_string(),
                    reason: format!("truncated body: {} of {expected} bytes", blob.len()),
                });
            }
        }

        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone)]
    enum Script {
        Status(u16),
        Chunks { chunks: Vec<Vec<u8>>, hint: Option<u64> },
        BreaksAfter(Vec<u8>),
    }

    #[derive(Default)]
    struct ScriptedTransport {
        scripts: HashMap<String, Script>,
        opened: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn with(mut self, url: &str, script: Script) -> Self {
            self.scripts.insert(url.to_string(), script);
            self
        }

        fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }
    }

    struct ScriptedBody {
        chunks: std::vec::IntoIter<Vec<u8>>,
        hint: Option<u64>,
        fail_at_end: bool,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(&self, url: &str) -> Result<Box<dyn Body>> {
            self.opened.lock().unwrap().push(url.to_string());
            let body = match self.scripts.get(url).cloned() {
                Some(Script::Chunks { chunks, hint }) => ScriptedBody {
                    chunks: chunks.into_iter(),
                    hint,
                    fail_at_end: false,
                },
                Some(Script::BreaksAfter(chunk)) => ScriptedBody {
                    chunks: vec![chunk].into_iter(),
                    hint: None,
                    fail_at_end: true,
                },
                Some(Script::Status(code)) => {
                    return Err(Error::Network {
                        url: url.to_string(),
                        reason: format!("HTTP {code}"),
                    })
                }
                None => {
                    return Err(Error::Network {
                        url: url.to_string(),
                        reason: "connection refused".to_string(),
                    })
                }
            };
            Ok(Box::new(body))
        }
    }

    #[async_trait]
    impl Body for ScriptedBody {
        fn size_hint(&self) -> Option<u64> {
            self.hint
        }

        async fn read_chunk(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
            match self.chunks.next() {
                Some(chunk) => {
                    buf.extend_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None if self.fail_at_end => Err(Error::Network {
                    url: "scripted".to_string(),
                    reason: "connection reset".to_string(),
                }),
                None => Ok(0),
            }
        }
    }

    const KEY: &str = "model.onnx";

    fn downloader(
        cache: Option<ModelCache>,
        mirrors: &[&str],
        transport: &Arc<ScriptedTransport>,
    ) -> ModelDownloader {
        let transport: Arc<dyn Transport> = transport.clone();
        ModelDownloader::new(
            cache,
            KEY,
            mirrors.iter().map(ToString::to_string).collect(),
            transport,
        )
    }

    fn recorder() -> (Arc<Mutex<Vec<Progress>>>, impl ProgressSink) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        (events, move |p: &Progress| sink_events.lock().unwrap().push(*p))
    }

    #[tokio::test]
    async fn test_falls_through_to_second_mirror_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::at(dir.path()).unwrap();
        let transport = Arc::new(
            ScriptedTransport::default()
                .with("https://a/model", Script::Status(503))
                .with(
                    "https://b/model",
                    Script::Chunks {
                        chunks: vec![b"abc".to_vec(), b"def".to_vec()],
                        hint: Some(6),
                    },
                ),
        );
        let dl = downloader(
            Some(cache.clone()),
            &["https://a/model", "https://b/model"],
            &transport,
        );

        let blob = dl.download_model(&crate::pipeline::NoProgress).await.unwrap();

        assert_eq!(blob, b"abcdef");
        assert_eq!(transport.opened(), vec!["https://a/model", "https://b/model"]);
        assert_eq!(cache.get(KEY).await.unwrap(), Some(b"abcdef".to_vec()));
        assert!(dl.is_cached().await);
    }

    #[tokio::test]
    async fn test_superseded_download_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::at(dir.path()).unwrap();
        let transport = Arc::new(ScriptedTransport::default().with(
            "https://a/model",
            Script::Chunks {
                chunks: vec![b"model".to_vec()],
                hint: Some(5),
            },
        ));
        let dl = downloader(Some(cache.clone()), &["https://a/model"], &transport);

        let blob = dl
            .download_model_if(&crate::pipeline::NoProgress, &|| false)
            .await
            .unwrap();

        assert_eq!(blob, b"model");
        assert_eq!(cache.get(KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::at(dir.path()).unwrap();
        cache.put(KEY, b"cached").await.unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let dl = downloader(Some(cache), &["https://a/model"], &transport);
        let (events, sink) = recorder();

        let blob = dl.download_model(&sink).await.unwrap();

        assert_eq!(blob, b"cached");
        assert!(transport.opened().is_empty());
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].percent(), Some(100.0));
    }

    #[tokio::test]
    async fn test_all_mirrors_failing_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::at(dir.path()).unwrap();
        let transport = Arc::new(
            ScriptedTransport::default()
                .with("https://a/model", Script::Status(404))
                .with("https://b/model", Script::BreaksAfter(b"partial".to_vec())),
        );
        let dl = downloader(
            Some(cache.clone()),
            &["https://a/model", "https://b/model", "https://c/model"],
            &transport,
        );

        let err = dl.download_model(&crate::pipeline::NoProgress).await.unwrap_err();

        match err {
            Error::DownloadExhausted { failures } => assert_eq!(failures.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(cache.get(KEY).await.unwrap(), None);
        assert!(!dl.is_cached().await);
    }

    #[tokio::test]
    async fn test_no_mirrors_is_exhausted() {
        let transport = Arc::new(ScriptedTransport::default());
        let dl = downloader(None, &[], &transport);

        let err = dl.download_model(&crate::pipeline::NoProgress).await.unwrap_err();

        assert!(matches!(err, Error::DownloadExhausted { failures } if failures.is_empty()));
    }

    #[tokio::test]
    async fn test_empty_and_truncated_bodies_are_rejected() {
        let transport = Arc::new(
            ScriptedTransport::default()
                .with(
                    "https://empty/model",
                    Script::Chunks {
                        chunks: vec![],
                        hint: None,
                    },
                )
                .with(
                    "https://short/model",
                    Script::Chunks {
                        chunks: vec![vec![1; 10]],
                        hint: Some(20),
                    },
                )
                .with(
                    "https://good/model",
                    Script::Chunks {
                        chunks: vec![vec![7; 4]],
                        hint: None,
                    },
                ),
        );
        let dl = downloader(
            None,
            &["https://empty/model", "https://short/model", "https://good/model"],
            &transport,
        );

        let blob = dl.download_model(&crate::pipeline::NoProgress).await.unwrap();

        assert_eq!(blob, vec![7; 4]);
        assert_eq!(transport.opened().len(), 3);
    }

    #[tokio::test]
    async fn test_progress_with_and_without_size_hint() {
        let transport = Arc::new(
            ScriptedTransport::default()
                .with(
                    "https://hinted/model",
                    Script::Chunks {
                        chunks: vec![vec![0; 25], vec![0; 75]],
                        hint: Some(100),
                    },
                )
                .with(
                    "https://bare/model",
                    Script::Chunks {
                        chunks: vec![vec![0; 10], vec![0; 5]],
                        hint: None,
                    },
                ),
        );

        let (events, sink) = recorder();
        downloader(None, &["https://hinted/model"], &transport)
            .download_model(&sink)
            .await
            .unwrap();
        let percents: Vec<_> = events.lock().unwrap().iter().map(Progress::percent).collect();
        assert_eq!(percents, vec![Some(0.0), Some(25.0), Some(100.0)]);

        let (events, sink) = recorder();
        downloader(None, &["https://bare/model"], &transport)
            .download_model(&sink)
            .await
            .unwrap();
        let events = events.lock().unwrap();
        assert!(events.iter().all(|p| p.percent().is_none()));
        let loaded: Vec<_> = events.iter().map(|p| p.loaded_bytes).collect();
        assert_eq!(loaded, vec![0, 10, 15]);
    }

    #[tokio::test]
    async fn test_broken_cache_degrades_to_network() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::at(dir.path()).unwrap();
        std::fs::create_dir(cache.path_for(KEY)).unwrap();
        let transport = Arc::new(ScriptedTransport::default().with(
            "https://a/model",
            Script::Chunks {
                chunks: vec![b"net".to_vec()],
                hint: Some(3),
            },
        ));
        let dl = downloader(Some(cache), &["https://a/model"], &transport);

        let blob = dl.download_model(&crate::pipeline::NoProgress).await.unwrap();

        assert_eq!(blob, b"net");
        assert_eq!(transport.opened().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::at(dir.path()).unwrap();
        cache.put(KEY, b"x").await.unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let dl = downloader(Some(cache), &[], &transport);

        assert!(dl.is_cached().await);
        dl.clear_cache().await.unwrap();
        assert!(!dl.is_cached().await);
    }
}
