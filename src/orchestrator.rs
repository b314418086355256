//! Capture orchestration: partition a claimed batch, run one render session
//! per partition and drive every URL through bounded retry.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::{
    clock, slug, CaptureConfig, CaptureOutcome, CaptureResult, PartitionKey, ReferenceItem,
    RenderEngine, RenderSession, Result,
};

/// One URL to capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
    pub item_id: String,
    pub source_url: String,
    /// 1-based position in the whole submitted batch
    pub index: usize,
}

/// URLs sharing one render session, in batch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub key: PartitionKey,
    pub targets: Vec<CaptureTarget>,
}

impl Partition {
    /// FAILED outcomes for every target, all carrying `error`.
    pub fn fail_all(&self, error: &str) -> Vec<CaptureOutcome> {
        self.targets
            .iter()
            .map(|target| CaptureOutcome {
                item_id: target.item_id.clone(),
                source_url: target.source_url.clone(),
                index: target.index,
                attempts: 0,
                result: CaptureResult::failure(error),
            })
            .collect()
    }
}

/// Group `items` by (brand, season, item).
///
/// Partitions appear in order of first occurrence and keep their URLs in
/// batch order. Indexes are assigned over the whole batch, so file names of
/// different partitions captured in the same second never collide.
pub fn partition_batch(items: &[ReferenceItem]) -> Vec<Partition> {
    let mut partitions: Vec<Partition> = Vec::new();
    let mut slots: HashMap<PartitionKey, usize> = HashMap::new();

    for (pos, item) in items.iter().enumerate() {
        let key = item.partition_key();
        let slot = *slots.entry(key.clone()).or_insert_with(|| {
            partitions.push(Partition {
                key,
                targets: Vec::new(),
            });
            partitions.len() - 1
        });
        partitions[slot].targets.push(CaptureTarget {
            item_id: item.id.clone(),
            source_url: item.source_url.clone(),
            index: pos + 1,
        });
    }
    partitions
}

/// Drives partitions through a [`RenderEngine`].
pub struct Orchestrator {
    engine: Arc<dyn RenderEngine>,
    config: CaptureConfig,
    output_root: PathBuf,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn RenderEngine>, config: CaptureConfig, output_root: PathBuf) -> Self {
        Self {
            engine,
            config,
            output_root,
        }
    }

    /// Capture every URL of `partition` in one session.
    ///
    /// Always returns exactly one outcome per target. If the session cannot
    /// be opened, every target fails with the session error; an empty
    /// partition opens no session.
    pub fn capture_partition(&self, partition: &Partition) -> Vec<CaptureOutcome> {
        if partition.targets.is_empty() {
            return Vec::new();
        }

        let mut session = match self.engine.open_session(self.config.viewport) {
            Ok(session) => session,
            Err(e) => {
                error!(
                    "Session for {} failed to open, failing {} item(s): {}",
                    partition.key,
                    partition.targets.len(),
                    e
                );
                return partition.fail_all(&e.to_string());
            }
        };
        debug!(
            "Session opened for {} ({} url(s))",
            partition.key,
            partition.targets.len()
        );

        let outcomes: Vec<CaptureOutcome> = partition
            .targets
            .iter()
            .map(|target| self.capture_target(session.as_mut(), &partition.key, target))
            .collect();

        if let Err(e) = session.close() {
            warn!("Failed to close session for {}: {}", partition.key, e);
        }

        let ok = outcomes.iter().filter(|o| o.is_success()).count();
        info!(
            "Partition {} done: {} succeeded, {} failed",
            partition.key,
            ok,
            outcomes.len() - ok
        );
        outcomes
    }

    /// Capture a whole batch on the calling thread, partition by partition.
    pub fn capture_batch(&self, items: &[ReferenceItem]) -> Vec<CaptureOutcome> {
        partition_batch(items)
            .iter()
            .flat_map(|partition| self.capture_partition(partition))
            .collect()
    }

    /// Up to `max_retries + 1` immediate attempts; the last error is kept.
    fn capture_target(
        &self,
        session: &mut dyn RenderSession,
        key: &PartitionKey,
        target: &CaptureTarget,
    ) -> CaptureOutcome {
        let started = clock::local_now();
        let path = slug::capture_path(
            &self.output_root,
            key,
            &clock::file_stamp(started),
            target.index,
        );
        let max_attempts = self.config.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.render_to(session, &target.source_url, &path) {
                Ok(written) => {
                    debug!(
                        "Captured {} -> {} (attempt {})",
                        target.source_url,
                        written.display(),
                        attempt
                    );
                    return CaptureOutcome {
                        item_id: target.item_id.clone(),
                        source_url: target.source_url.clone(),
                        index: target.index,
                        attempts: attempt,
                        result: CaptureResult::success(
                            written.to_string_lossy(),
                            clock::captured_at(clock::local_now()),
                        ),
                    };
                }
                Err(e) => {
                    warn!(
                        "Capture attempt {}/{} for {} failed: {}",
                        attempt, max_attempts, target.source_url, e
                    );
                    last_error = e.to_string();
                }
            }
        }

        CaptureOutcome {
            item_id: target.item_id.clone(),
            source_url: target.source_url.clone(),
            index: target.index,
            attempts: max_attempts,
            result: CaptureResult::failure(last_error),
        }
    }

    fn render_to(
        &self,
        session: &mut dyn RenderSession,
        url: &str,
        path: &Path,
    ) -> Result<PathBuf> {
        let bytes = session.render(url, self.config.timeout(), self.config.jpeg_quality)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_new(path, &bytes)
    }
}

/// Write `bytes` to `path`, or to the first free `{stem}_{n}.{ext}` beside it.
///
/// Existing files are never overwritten, so captures of the same partition
/// landing on the same name in one second keep distinct images.
pub(crate) fn write_new(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut candidate = path.to_path_buf();
    let mut n = 0u32;
    loop {
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut file) => {
                if let Err(e) = file.write_all(bytes) {
                    let _ = fs::remove_file(&candidate);
                    return Err(e.into());
                }
                return Ok(candidate);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && n < u32::MAX => {
                n += 1;
                let name = match &ext {
                    Some(ext) => format!("{}_{}.{}", stem, n, ext),
                    None => format!("{}_{}", stem, n),
                };
                candidate = path.with_file_name(name);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, ItemStatus, Tags, Viewport};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    fn item(id: &str, brand: &str, url: &str) -> ReferenceItem {
        ReferenceItem {
            id: id.into(),
            brand: brand.into(),
            season: "fw25".into(),
            item: "tee".into(),
            source_url: url.into(),
            image_path: String::new(),
            captured_at: String::new(),
            tags: Tags::default(),
            fit_key: String::new(),
            fit_score: None,
            notes: String::new(),
            status: ItemStatus::Processing,
            error_message: String::new(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    /// Each render pops the next scripted answer; an empty script succeeds.
    struct Scripted {
        answers: Mutex<VecDeque<bool>>,
        calls: Mutex<u32>,
        open_fails: bool,
    }

    impl Scripted {
        fn new(answers: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                calls: Mutex::new(0),
                open_fails: false,
            })
        }
    }

    struct ScriptedSession(Arc<Scripted>);

    impl RenderEngine for Arc<Scripted> {
        fn open_session(&self, _viewport: Viewport) -> Result<Box<dyn RenderSession>> {
            if self.open_fails {
                return Err(Error::SessionEstablish("no browser".into()));
            }
            Ok(Box::new(ScriptedSession(Arc::clone(self))))
        }
    }

    impl RenderSession for ScriptedSession {
        fn render(&mut self, url: &str, _timeout: Duration, _q: u8) -> Result<Vec<u8>> {
            *self.0.calls.lock().unwrap() += 1;
            match self.0.answers.lock().unwrap().pop_front() {
                Some(false) => Err(Error::Render(format!("{url} timed out"))),
                _ => Ok(b"jpeg".to_vec()),
            }
        }
    }

    fn orchestrator(engine: Arc<Scripted>, retries: u32, root: &Path) -> Orchestrator {
        Orchestrator::new(
            Arc::new(engine),
            CaptureConfig {
                max_retries: retries,
                ..Default::default()
            },
            root.to_path_buf(),
        )
    }

    #[test]
    fn partitions_keep_first_seen_order_and_global_index() {
        let items = vec![
            item("1", "nike", "https://a"),
            item("2", "apc", "https://b"),
            item("3", "nike", "https://c"),
        ];
        let parts = partition_batch(&items);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].key.brand, "nike");
        let idx: Vec<usize> = parts[0].targets.iter().map(|t| t.index).collect();
        assert_eq!(idx, vec![1, 3]);
        assert_eq!(parts[1].targets[0].index, 2);
        assert!(partition_batch(&[]).is_empty());
    }

    #[test]
    fn retries_stop_at_first_success() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Scripted::new(&[false, false, true]);
        let orch = orchestrator(Arc::clone(&engine), 2, dir.path());

        let out = orch.capture_batch(&[item("1", "nike", "https://a")]);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_success());
        assert_eq!(out[0].attempts, 3);
        assert_eq!(*engine.calls.lock().unwrap(), 3);

        let path = out[0].result.image_path.clone().unwrap();
        assert!(path.ends_with("_001.jpg"), "{path}");
        assert_eq!(std::fs::read(&path).unwrap(), b"jpeg");
    }

    #[test]
    fn exhausted_retries_keep_last_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Scripted::new(&[false, false, false, true]);
        let orch = orchestrator(Arc::clone(&engine), 2, dir.path());

        let out = orch.capture_batch(&[item("1", "nike", "https://a")]);
        assert_eq!(out[0].result.status(), ItemStatus::Failed);
        assert_eq!(out[0].attempts, 3);
        assert_eq!(*engine.calls.lock().unwrap(), 3);
        let err = out[0].result.error_message.clone().unwrap();
        assert!(err.contains("https://a timed out"), "{err}");
        assert_eq!(out[0].result.image_path, None);
        assert_eq!(out[0].result.captured_at, None);
    }

    #[test]
    fn session_failure_fails_every_target() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Scripted {
            answers: Mutex::new(VecDeque::new()),
            calls: Mutex::new(0),
            open_fails: true,
        });
        let orch = orchestrator(Arc::clone(&engine), 2, dir.path());

        let out = orch.capture_batch(&[
            item("1", "nike", "https://a"),
            item("2", "nike", "https://b"),
        ]);
        assert_eq!(out.len(), 2);
        for o in &out {
            assert_eq!(o.result.status(), ItemStatus::Failed);
            assert_eq!(o.attempts, 0);
            assert!(o
                .result
                .error_message
                .as_deref()
                .unwrap()
                .contains("no browser"));
        }
        assert_eq!(*engine.calls.lock().unwrap(), 0);
    }

    #[test]
    fn empty_partition_opens_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Scripted {
            answers: Mutex::new(VecDeque::new()),
            calls: Mutex::new(0),
            open_fails: true,
        });
        let orch = orchestrator(engine, 0, dir.path());
        let empty = Partition {
            key: item("x", "nike", "u").partition_key(),
            targets: Vec::new(),
        };
        assert!(orch.capture_partition(&empty).is_empty());
    }

    #[test]
    fn taken_names_get_a_numbered_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20260101_120000_001.jpg");

        assert_eq!(write_new(&path, b"first").unwrap(), path);
        let second = write_new(&path, b"second").unwrap();
        let third = write_new(&path, b"third").unwrap();

        assert_eq!(second, dir.path().join("20260101_120000_001_1.jpg"));
        assert_eq!(third, dir.path().join("20260101_120000_001_2.jpg"));
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
        assert_eq!(std::fs::read(&second).unwrap(), b"second");
    }

    #[test]
    fn recapturing_a_target_keeps_the_earlier_image() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Scripted::new(&[]);
        let orch = orchestrator(Arc::clone(&engine), 0, dir.path());
        let batch = [item("1", "nike", "https://a")];

        let first = orch.capture_batch(&batch);
        let second = orch.capture_batch(&batch);
        let a = first[0].result.image_path.clone().unwrap();
        let b = second[0].result.image_path.clone().unwrap();
        assert_ne!(a, b);
        assert!(Path::new(&a).exists());
        assert!(Path::new(&b).exists());
    }

    #[test]
    fn write_failure_counts_as_failed_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let engine = Scripted::new(&[]);
        let orch = orchestrator(Arc::clone(&engine), 1, &blocker);

        let out = orch.capture_batch(&[item("1", "nike", "https://a")]);
        assert_eq!(out[0].result.status(), ItemStatus::Failed);
        assert_eq!(*engine.calls.lock().unwrap(), 2);
        assert!(out[0].result.error_message.as_deref().unwrap().starts_with("I/O error"));
    }
}
