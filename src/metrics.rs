use std::sync::LazyLock;

use prometheus::*;

static METRIC_CACHE_HIT: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("ingest_cache_hit_count", "count of cache hits during ingestion")
        .unwrap()
});

static METRIC_CACHE_MISS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("ingest_cache_miss_count", "count of cache misses during ingestion")
        .unwrap()
});

static METRIC_BATCH_COUNT: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("ingest_batch_count", "count of inference batches dispatched").unwrap()
});

static METRIC_ITEM_ERROR: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("ingest_item_error_count", "count of per-item ingestion errors")
        .unwrap()
});

static METRIC_DUPLICATE: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("ingest_duplicate_count", "count of exact duplicates detected")
        .unwrap()
});

/// 缓存命中计数
pub fn inc_cache_hit() {
    METRIC_CACHE_HIT.inc();
}

pub fn inc_cache_miss() {
    METRIC_CACHE_MISS.inc();
}

/// 成功派发的推理批次计数
pub fn inc_batch() {
    METRIC_BATCH_COUNT.inc();
}

pub fn inc_item_errors(n: u64) {
    METRIC_ITEM_ERROR.inc_by(n);
}

pub fn inc_duplicate() {
    METRIC_DUPLICATE.inc();
}
