use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, Instrument};

use crate::error::{ServiceError, ServiceResult};

/// Which operation produced an artifact; decides the filename prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    Speech,
    Conversion,
}

impl ArtifactKind {
    pub const fn prefix(self) -> &'static str {
        match self {
            ArtifactKind::Speech => "tts",
            ArtifactKind::Conversion => "vc",
        }
    }
}

/// Deterministic digest of every input that affects the rendered audio.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_speech(
        text: &str,
        model_name: &str,
        speaker: Option<&str>,
        reference: Option<&Path>,
        language: Option<&str>,
    ) -> Self {
        let reference = reference.map(|path| path.to_string_lossy());
        let mut hasher = Sha256::new();
        for field in [
            Some(ArtifactKind::Speech.prefix()),
            Some(text),
            Some(model_name),
            speaker,
            reference.as_deref(),
            language,
        ] {
            update_field(&mut hasher, field);
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Conversion keys hash the uploaded audio content, not the upload paths.
    pub fn for_conversion(source_digest: &str, target_digest: &str, model_name: &str) -> Self {
        let mut hasher = Sha256::new();
        for field in [
            ArtifactKind::Conversion.prefix(),
            source_digest,
            target_digest,
            model_name,
        ] {
            update_field(&mut hasher, Some(field));
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

// Length-prefixed so that ("ab", "c") and ("a", "bc") never collide.
fn update_field(hasher: &mut Sha256, field: Option<&str>) {
    match field {
        Some(value) => {
            hasher.update([1u8]);
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        None => hasher.update([0u8]),
    }
}

/// Hex sha256 of a file's content.
pub async fn digest_file(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[derive(Clone, Debug)]
pub struct Artifact {
    pub path: PathBuf,
    pub key: CacheKey,
    pub cache_hit: bool,
}

/// Content-addressed audio files under the output directory.
///
/// Renders go to a private staging directory and are renamed into place,
/// so a published path is always a complete file. Concurrent requests for
/// the same key wait on one render.
pub struct OutputCache {
    output_dir: PathBuf,
    staging_dir: PathBuf,
    inflight: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl OutputCache {
    pub fn new(output_dir: PathBuf, staging_dir: PathBuf) -> Self {
        Self {
            output_dir,
            staging_dir,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn path_for(&self, kind: ArtifactKind, key: &CacheKey, format: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}.{}", kind.prefix(), key.as_str(), format))
    }

    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    /// Returns the published artifact for `key`, invoking `render` with a
    /// staging path only when no complete file exists yet.
    ///
    /// The fill runs on its own task. Dropping the returned future leaves
    /// the render running, and its file is still published for later hits.
    pub async fn produce<F, Fut>(
        self: &Arc<Self>,
        kind: ArtifactKind,
        key: CacheKey,
        format: &str,
        render: F,
    ) -> ServiceResult<Artifact>
    where
        F: FnOnce(PathBuf) -> Fut + Send + 'static,
        Fut: Future<Output = ServiceResult<()>> + Send + 'static,
    {
        let path = self.path_for(kind, &key, format);
        if self.exists(&path).await {
            return Ok(Artifact {
                path,
                key,
                cache_hit: true,
            });
        }

        let cache = Arc::clone(self);
        let fill_path = path.clone();
        let fill = tokio::spawn(
            async move {
                let slot = cache.slot(&fill_path);
                let result = async {
                    let _guard = slot.lock().await;
                    // another request may have published while we waited
                    if cache.exists(&fill_path).await {
                        return Ok(true);
                    }
                    cache.render_and_publish(&fill_path, render).await?;
                    Ok::<_, ServiceError>(false)
                }
                .await;
                cache.release(&fill_path, &slot);
                result
            }
            .in_current_span(),
        );

        let cache_hit = fill.await.map_err(|err| {
            ServiceError::Internal(anyhow::Error::new(err).context("render task failed"))
        })??;
        Ok(Artifact {
            path,
            key,
            cache_hit,
        })
    }

    async fn render_and_publish<F, Fut>(&self, path: &Path, render: F) -> ServiceResult<()>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = ServiceResult<()>>,
    {
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .with_context(|| format!("failed to create {}", self.staging_dir.display()))?;
        // removed on drop, taking any partial output with it
        let staging = tempfile::Builder::new()
            .prefix("render_")
            .tempdir_in(&self.staging_dir)
            .context("failed to create staging directory")?;
        let file_name = path
            .file_name()
            .context("artifact path has no file name")?;
        let staged = staging.path().join(file_name);

        render(staged.clone()).await?;

        if !self.exists(&staged).await {
            return Err(ServiceError::Synthesis(
                "engine finished without writing an output file".to_string(),
            ));
        }
        tokio::fs::rename(&staged, path)
            .await
            .with_context(|| format!("failed to publish {}", path.display()))?;
        debug!(
            target = "tts_gateway::outputs",
            path = %path.display(),
            "artifact published"
        );
        Ok(())
    }

    fn slot(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.inflight
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    fn release(&self, path: &Path, slot: &Arc<tokio::sync::Mutex<()>>) {
        let mut inflight = self.inflight.lock();
        // one reference here, one in the map
        if Arc::strong_count(slot) <= 2 {
            inflight.remove(path);
        }
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn cache(root: &Path) -> Arc<OutputCache> {
        Arc::new(OutputCache::new(
            root.join("outputs"),
            root.join("outputs/.staging"),
        ))
    }

    fn key(text: &str) -> CacheKey {
        CacheKey::for_speech(text, "tts_models/en/ljspeech/vits", None, None, None)
    }

    #[test]
    fn keys_depend_on_every_field() {
        let base = CacheKey::for_speech("hi", "m", Some("p225"), None, Some("en"));
        assert_eq!(
            base,
            CacheKey::for_speech("hi", "m", Some("p225"), None, Some("en"))
        );
        assert_ne!(base, CacheKey::for_speech("hi", "m", Some("p226"), None, Some("en")));
        assert_ne!(base, CacheKey::for_speech("hi", "m", Some("p225"), None, None));
        assert_ne!(
            base,
            CacheKey::for_speech("hi", "m", Some("p225"), Some(Path::new("a.wav")), Some("en"))
        );
        assert_ne!(
            CacheKey::for_speech("ab", "c", None, None, None),
            CacheKey::for_speech("a", "bc", None, None, None)
        );
        assert_eq!(base.as_str().len(), 64);
        assert_eq!(base.short().len(), 8);
    }

    #[test]
    fn filenames_use_kind_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let speech = cache.path_for(ArtifactKind::Speech, &key("x"), "wav");
        let name = speech.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("tts_") && name.ends_with(".wav"));

        let vc = CacheKey::for_conversion("aa", "bb", "freevc24");
        let name = cache.path_for(ArtifactKind::Conversion, &vc, "flac");
        assert!(name.file_name().unwrap().to_string_lossy().starts_with("vc_"));
    }

    #[tokio::test]
    async fn second_request_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));

        for expected_hit in [false, true] {
            let calls = calls.clone();
            let artifact = cache
                .produce(ArtifactKind::Speech, key("hello"), "wav", move |staged| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        tokio::fs::write(staged, b"RIFF").await.unwrap();
                        Ok(())
                    }
                })
                .await
                .unwrap();
            assert_eq!(artifact.cache_hit, expected_hit);
            assert_eq!(tokio::fs::read(&artifact.path).await.unwrap(), b"RIFF");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.inflight_len(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_render_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .produce(ArtifactKind::Speech, key("same"), "wav", |staged| async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            tokio::fs::write(staged, b"RIFF").await.unwrap();
                            Ok(())
                        })
                        .await
                })
            })
            .collect();

        let mut hits = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().cache_hit {
                hits += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hits, 4);
        assert_eq!(cache.inflight_len(), 0);
    }

    #[tokio::test]
    async fn failed_render_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());

        let err = cache
            .produce(ArtifactKind::Speech, key("boom"), "wav", |staged| async move {
                tokio::fs::write(staged, b"half").await.unwrap();
                Err(ServiceError::Synthesis("oom".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Synthesis(_)));

        let path = cache.path_for(ArtifactKind::Speech, &key("boom"), "wav");
        assert!(!path.exists());
        let leftovers = std::fs::read_dir(dir.path().join("outputs/.staging"))
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn render_without_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());

        let err = cache
            .produce(ArtifactKind::Speech, key("nothing"), "wav", |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Synthesis(_)));
    }

    #[tokio::test]
    async fn dropped_caller_still_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));

        let render = {
            let calls = calls.clone();
            move |staged: PathBuf| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                tokio::fs::write(staged, b"RIFF").await.unwrap();
                Ok(())
            }
        };
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            cache.produce(ArtifactKind::Speech, key("walk away"), "wav", render),
        )
        .await;
        assert!(abandoned.is_err());

        let path = cache.path_for(ArtifactKind::Speech, &key("walk away"), "wav");
        let mut waited = Duration::ZERO;
        while !path.exists() && waited < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"RIFF");

        let artifact = cache
            .produce(ArtifactKind::Speech, key("walk away"), "wav", |_| async {
                Err(ServiceError::Synthesis("should not render".into()))
            })
            .await
            .unwrap();
        assert!(artifact.cache_hit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn digests_file_content() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        std::fs::write(&a, b"same").unwrap();
        std::fs::write(&b, b"same").unwrap();
        assert_eq!(digest_file(&a).await.unwrap(), digest_file(&b).await.unwrap());
    }
}
