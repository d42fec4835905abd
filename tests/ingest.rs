use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, bail};
use assert_fs::TempDir;
use assert_fs::prelude::*;
use async_trait::async_trait;
use rstest::*;
use serde_json::Value;

use imingest::cache::{CacheEntry, CacheStore, MemoryCache};
use imingest::config::IngestOptions;
use imingest::inference::{InferenceInput, InferenceOutput, InferenceService};
use imingest::ingest::IngestService;
use imingest::job::JobStatus;
use imingest::store::{ImageRecord, VectorStore};
use imingest::{archive, utils};

/// 记录每次调用批大小的推理桩，路径中含 corrupt 的条目返回逐条错误
#[derive(Default)]
struct StubInference {
    batch_sizes: Mutex<Vec<usize>>,
    fail_first_n: AtomicUsize,
    delay: Option<Duration>,
    conflict_cache: Option<(Arc<MemoryCache>, CacheEntry)>,
}

impl StubInference {
    fn calls(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceService for StubInference {
    async fn embed_batch(&self, items: &[InferenceInput]) -> Result<Vec<InferenceOutput>> {
        self.batch_sizes.lock().unwrap().push(items.len());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_first_n
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!("connection refused");
        }
        // 模拟并发任务抢先写入了不同载荷
        if let Some((cache, entry)) = &self.conflict_cache {
            for item in items {
                cache.insert(&item.unique_id, entry.clone()).await.ok();
            }
        }
        Ok(items
            .iter()
            .map(|item| {
                if item.image_path.contains("corrupt") {
                    InferenceOutput {
                        unique_id: item.unique_id.clone(),
                        embedding: None,
                        caption: None,
                        error: Some("decode failed".to_string()),
                    }
                } else {
                    InferenceOutput {
                        unique_id: item.unique_id.clone(),
                        embedding: Some(vec![0.5, 0.25, 0.125, 1.0]),
                        caption: Some("stub caption".to_string()),
                        error: None,
                    }
                }
            })
            .collect())
    }
}

/// 进程内向量存储桩
#[derive(Default)]
struct StubStore {
    points: Mutex<Vec<ImageRecord>>,
    upsert_calls: AtomicUsize,
}

impl StubStore {
    fn len(&self) -> usize {
        self.points.lock().unwrap().len()
    }
}

#[async_trait]
impl VectorStore for StubStore {
    async fn ensure_ready(&self) -> Result<()> {
        Ok(())
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Option<Value>> {
        Ok(self
            .points
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.content_hash == hash)
            .map(|r| Value::Object(r.payload())))
    }

    async fn upsert_batch(&self, records: &[ImageRecord]) -> Result<()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.points.lock().unwrap().extend_from_slice(records);
        Ok(())
    }

    async fn delete_by_hashes(&self, hashes: &[String]) -> Result<()> {
        self.points.lock().unwrap().retain(|r| !hashes.contains(&r.content_hash));
        Ok(())
    }
}

/// 始终不可达的存储桩
struct UnreachableStore;

#[async_trait]
impl VectorStore for UnreachableStore {
    async fn ensure_ready(&self) -> Result<()> {
        bail!("connection refused")
    }

    async fn find_by_hash(&self, _hash: &str) -> Result<Option<Value>> {
        bail!("connection refused")
    }

    async fn upsert_batch(&self, _records: &[ImageRecord]) -> Result<()> {
        bail!("connection refused")
    }

    async fn delete_by_hashes(&self, _hashes: &[String]) -> Result<()> {
        bail!("connection refused")
    }
}

fn options() -> IngestOptions {
    IngestOptions { ml_retry_delay_ms: 1, ..Default::default() }
}

fn service_with(
    inference: Arc<StubInference>,
    store: Arc<StubStore>,
    opts: IngestOptions,
) -> Arc<IngestService> {
    Arc::new(
        IngestService::new(Arc::new(MemoryCache::new()), store, inference).with_options(opts),
    )
}

async fn run_to_end(service: &Arc<IngestService>, root: &Path) -> imingest::job::JobSnapshot {
    let job = service.jobs().create();
    service.run_directory(job.clone(), root.to_path_buf(), None, None).await;
    job.snapshot()
}

#[tokio::test]
async fn example_scenario_five_files() {
    // 5 个文件：2 个字节级副本、1 个损坏、2 个正常
    let dir = TempDir::new().unwrap();
    dir.child("a.jpg").write_str("alpha").unwrap();
    dir.child("a_copy.jpg").write_str("alpha").unwrap();
    dir.child("b.jpg").write_str("beta").unwrap();
    dir.child("c.jpg").write_str("gamma").unwrap();
    dir.child("corrupt.jpg").write_str("broken bytes").unwrap();

    let inference = Arc::new(StubInference::default());
    let store = Arc::new(StubStore::default());
    let service = service_with(inference.clone(), store.clone(), options());

    let snap = run_to_end(&service, dir.path()).await;

    assert_eq!(snap.status, JobStatus::Completed);
    let result = snap.result.unwrap();
    assert_eq!(result.total, 5);
    assert_eq!(result.processed, 3);
    assert_eq!(result.failed, 1);
    assert_eq!(result.duplicates, 1);
    assert_eq!(result.cached, 0);
    assert_eq!(snap.errors.len(), 1);
    assert!(snap.errors[0].contains("corrupt"));
    assert_eq!(snap.exact_duplicates.len(), 1);
    // 向量库恰好新增 3 条记录
    assert_eq!(store.len(), 3);
}

#[tokio::test]
async fn second_run_is_idempotent() {
    let dir = TempDir::new().unwrap();
    for (name, content) in [("a.jpg", "alpha"), ("b.jpg", "beta"), ("c.jpg", "gamma")] {
        dir.child(name).write_str(content).unwrap();
    }

    let inference = Arc::new(StubInference::default());
    let store = Arc::new(StubStore::default());
    let service = service_with(inference.clone(), store.clone(), options());

    let first = run_to_end(&service, dir.path()).await;
    assert_eq!(first.result.unwrap().processed, 3);
    let calls_after_first = inference.calls().len();

    let second = run_to_end(&service, dir.path()).await;
    let result = second.result.unwrap();
    // 第二次运行全部命中缓存，存储无新增，推理服务未被调用
    assert_eq!(result.processed, 0);
    assert_eq!(result.cached, 3);
    assert_eq!(result.duplicates, 0);
    assert_eq!(store.len(), 3);
    assert_eq!(inference.calls().len(), calls_after_first);
}

#[tokio::test]
async fn copied_file_is_detected_by_content_not_path() {
    let dir1 = TempDir::new().unwrap();
    dir1.child("original.jpg").write_str("same pixels").unwrap();
    let dir2 = TempDir::new().unwrap();
    dir2.child("renamed/copy.jpg").write_str("same pixels").unwrap();

    let store = Arc::new(StubStore::default());
    // 两次摄取使用各自的空缓存，模拟进程重启后只剩持久化存储
    let first = service_with(Arc::new(StubInference::default()), store.clone(), options());
    run_to_end(&first, dir1.path()).await;
    assert_eq!(store.len(), 1);

    let second = service_with(Arc::new(StubInference::default()), store.clone(), options());
    let snap = run_to_end(&second, dir2.path()).await;

    let result = snap.result.unwrap();
    assert_eq!(result.duplicates, 1);
    assert_eq!(result.processed, 0);
    assert_eq!(store.len(), 1);
    // 载荷来自已入库的记录，指向最初的路径
    let payload = &snap.exact_duplicates[0].existing_payload;
    assert!(payload["path"].as_str().unwrap().contains("original.jpg"));
}

#[rstest]
#[case::exact_multiple(9, 3, 3)]
#[case::with_remainder(10, 3, 4)]
#[case::single_batch(2, 16, 1)]
#[tokio::test]
async fn batches_are_bounded(#[case] n: usize, #[case] batch_size: usize, #[case] expected: usize) {
    let dir = TempDir::new().unwrap();
    for i in 0..n {
        dir.child(format!("img{i}.jpg")).write_str(&format!("pixels {i}")).unwrap();
    }

    let inference = Arc::new(StubInference::default());
    let store = Arc::new(StubStore::default());
    let service = service_with(
        inference.clone(),
        store.clone(),
        IngestOptions { batch_size, ..options() },
    );

    let snap = run_to_end(&service, dir.path()).await;
    assert_eq!(snap.result.unwrap().processed, n);

    let calls = inference.calls();
    assert_eq!(calls.len(), expected);
    assert!(calls.iter().all(|&size| size <= batch_size));
    assert_eq!(calls.iter().sum::<usize>(), n);
}

#[tokio::test]
async fn corrupted_items_do_not_abort_the_job() {
    let dir = TempDir::new().unwrap();
    for i in 0..4 {
        dir.child(format!("ok{i}.jpg")).write_str(&format!("pixels {i}")).unwrap();
    }
    dir.child("corrupt1.jpg").write_str("bad 1").unwrap();
    dir.child("corrupt2.jpg").write_str("bad 2").unwrap();

    let inference = Arc::new(StubInference::default());
    let store = Arc::new(StubStore::default());
    let service = service_with(inference, store.clone(), options());

    let snap = run_to_end(&service, dir.path()).await;

    assert_eq!(snap.status, JobStatus::Completed);
    let result = snap.result.unwrap();
    assert_eq!(result.processed, 4);
    assert_eq!(result.failed, 2);
    assert_eq!(snap.errors.len(), 2);
    assert_eq!(store.len(), 4);
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let dir = TempDir::new().unwrap();
    dir.child("a.jpg").write_str("alpha").unwrap();

    let inference = Arc::new(StubInference {
        fail_first_n: AtomicUsize::new(2),
        ..Default::default()
    });
    let store = Arc::new(StubStore::default());
    let service = service_with(inference.clone(), store.clone(), options());

    let snap = run_to_end(&service, dir.path()).await;

    // 前两次失败后第三次成功
    assert_eq!(snap.status, JobStatus::Completed);
    assert_eq!(snap.result.unwrap().processed, 1);
    assert_eq!(inference.calls().len(), 3);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn exhausted_retries_become_item_errors() {
    let dir = TempDir::new().unwrap();
    dir.child("a.jpg").write_str("alpha").unwrap();
    dir.child("b.jpg").write_str("beta").unwrap();

    let inference = Arc::new(StubInference {
        fail_first_n: AtomicUsize::new(usize::MAX),
        ..Default::default()
    });
    let store = Arc::new(StubStore::default());
    let service = service_with(
        inference,
        store.clone(),
        IngestOptions { ml_retries: 2, batch_size: 16, ..options() },
    );

    let snap = run_to_end(&service, dir.path()).await;

    // 单批失败不会使整个任务 failed
    assert_eq!(snap.status, JobStatus::Completed);
    let result = snap.result.unwrap();
    assert_eq!(result.processed, 0);
    assert_eq!(result.failed, 2);
    assert_eq!(snap.errors.len(), 2);
    assert_eq!(store.len(), 0);
}

#[tokio::test]
async fn missing_directory_fails_fast() {
    let inference = Arc::new(StubInference::default());
    let store = Arc::new(StubStore::default());
    let service = service_with(inference.clone(), store, options());

    let snap = run_to_end(&service, Path::new("/no/such/directory")).await;

    assert_eq!(snap.status, JobStatus::Failed);
    assert!(snap.message.contains("目标目录不存在"));
    // 未进行任何处理
    assert!(inference.calls().is_empty());
}

#[tokio::test]
async fn unreachable_store_fails_fast() {
    let dir = TempDir::new().unwrap();
    dir.child("a.jpg").write_str("alpha").unwrap();

    let service = Arc::new(
        IngestService::new(
            Arc::new(MemoryCache::new()),
            Arc::new(UnreachableStore),
            Arc::new(StubInference::default()),
        )
        .with_options(options()),
    );

    let job = service.jobs().create();
    service.run_directory(job.clone(), dir.path().to_path_buf(), None, None).await;

    let snap = job.snapshot();
    assert_eq!(snap.status, JobStatus::Failed);
    assert!(snap.message.contains("向量存储不可用"));
}

#[tokio::test]
async fn non_image_files_are_skipped_silently() {
    let dir = TempDir::new().unwrap();
    dir.child("a.jpg").write_str("alpha").unwrap();
    dir.child("notes.txt").write_str("not an image").unwrap();
    dir.child("data.bin").write_str("binary").unwrap();

    let inference = Arc::new(StubInference::default());
    let store = Arc::new(StubStore::default());
    let service = service_with(inference, store, options());

    let snap = run_to_end(&service, dir.path()).await;

    let result = snap.result.unwrap();
    assert_eq!(result.total, 1);
    assert_eq!(result.processed, 1);
    assert!(snap.errors.is_empty());
}

#[tokio::test]
async fn empty_directory_completes_immediately() {
    let dir = TempDir::new().unwrap();
    let service = service_with(
        Arc::new(StubInference::default()),
        Arc::new(StubStore::default()),
        options(),
    );

    let snap = run_to_end(&service, dir.path()).await;
    assert_eq!(snap.status, JobStatus::Completed);
    assert_eq!(snap.progress, 100.0);
    assert_eq!(snap.result.unwrap().total, 0);
}

#[tokio::test]
async fn progress_is_monotonic_while_polling() {
    let dir = TempDir::new().unwrap();
    for i in 0..12 {
        dir.child(format!("img{i}.jpg")).write_str(&format!("pixels {i}")).unwrap();
    }

    let inference = Arc::new(StubInference {
        delay: Some(Duration::from_millis(5)),
        ..Default::default()
    });
    let store = Arc::new(StubStore::default());
    let service = service_with(
        inference,
        store,
        IngestOptions { batch_size: 2, max_workers: 2, ..options() },
    );

    let job_id = service.process_directory(dir.path().to_path_buf(), None, None);
    let job = service.jobs().get(&job_id).unwrap();

    let mut samples = vec![];
    loop {
        let snap = job.snapshot();
        samples.push(snap.progress);
        if snap.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert!(samples.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {samples:?}");
    assert_eq!(*samples.last().unwrap(), 100.0);
}

#[tokio::test]
async fn cancelled_job_skips_pending_batches_and_completes() {
    let dir = TempDir::new().unwrap();
    for i in 0..8 {
        dir.child(format!("img{i}.jpg")).write_str(&format!("pixels {i}")).unwrap();
    }

    let inference = Arc::new(StubInference::default());
    let store = Arc::new(StubStore::default());
    let service = service_with(
        inference.clone(),
        store.clone(),
        IngestOptions { batch_size: 2, ..options() },
    );

    let job_id = service.process_directory(dir.path().to_path_buf(), None, None);
    let job = service.jobs().get(&job_id).unwrap();
    // 在任何批次派发前请求取消，全部批次应被跳过
    job.cancel();

    loop {
        if job.snapshot().status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let snap = job.snapshot();
    assert_eq!(snap.status, JobStatus::Completed);
    assert_eq!(snap.result.unwrap().processed, 0);
    assert!(inference.calls().is_empty());
    assert_eq!(store.len(), 0);
    assert!(snap.logs.iter().any(|line| line.contains("取消")));
}

#[tokio::test]
async fn duplicates_can_be_archived_after_the_run() {
    let dir = TempDir::new().unwrap();
    dir.child("one.jpg").write_str("same bytes").unwrap();
    dir.child("two.jpg").write_str("same bytes").unwrap();
    dir.child("three.jpg").write_str("same bytes").unwrap();

    let service = service_with(
        Arc::new(StubInference::default()),
        Arc::new(StubStore::default()),
        options(),
    );

    let job = service.jobs().create();
    service.run_directory(job.clone(), dir.path().to_path_buf(), None, None).await;
    assert_eq!(job.snapshot().exact_duplicates.len(), 2);

    let result = archive::archive_all(&job).await;
    assert_eq!(result.archived.len(), 2);
    assert!(result.failed.is_empty());
    assert!(job.snapshot().exact_duplicates.is_empty());

    // 副本被移入 _duplicates 目录，正本原地保留
    let remaining: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .collect();
    assert_eq!(remaining.len(), 1);
    let archived: Vec<_> = std::fs::read_dir(dir.path().join("_duplicates"))
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(archived.len(), 2);
}

#[tokio::test]
async fn racing_insert_with_divergent_payload_fails_loudly() {
    let dir = TempDir::new().unwrap();
    dir.child("a.jpg").write_str("alpha").unwrap();

    // 推理期间另一个写入方抢先放入了不同的载荷，合并时必须冲突
    let cache = Arc::new(MemoryCache::new());
    let inference = Arc::new(StubInference {
        conflict_cache: Some((
            cache.clone(),
            CacheEntry { embedding: vec![9.0, 9.0], caption: None },
        )),
        ..Default::default()
    });
    let service = Arc::new(
        IngestService::new(cache, Arc::new(StubStore::default()), inference)
            .with_options(options()),
    );

    let job = service.jobs().create();
    service.run_directory(job.clone(), dir.path().to_path_buf(), None, None).await;

    let snap = job.snapshot();
    assert_eq!(snap.status, JobStatus::Failed);
    assert!(snap.message.contains("缓存冲突"));
}

#[tokio::test]
async fn within_run_duplicate_hash_matches_file_content() {
    let dir = TempDir::new().unwrap();
    dir.child("x.jpg").write_str("payload").unwrap();
    dir.child("y.jpg").write_str("payload").unwrap();

    let service = service_with(
        Arc::new(StubInference::default()),
        Arc::new(StubStore::default()),
        options(),
    );
    let snap = run_to_end(&service, dir.path()).await;

    let expected = utils::hash_bytes(b"payload");
    assert_eq!(
        snap.exact_duplicates[0].existing_payload["content_hash"],
        Value::String(expected)
    );
}
