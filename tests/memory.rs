//! Heap growth while moving a large file through the filesystem.
//!
//! Runs as its own test binary so the counting allocator sees only this
//! test's allocations. All phases share one test function to keep them from
//! running concurrently.

use futures::TryStreamExt;
use sqlfs::{FsConfig, SqlBackendConfig, SqlFs, WriteConfig};
use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::AsyncReadExt;

struct Counting;

static CURRENT: AtomicUsize = AtomicUsize::new(0);
static PEAK: AtomicUsize = AtomicUsize::new(0);

fn grow(n: usize) {
    let now = CURRENT.fetch_add(n, Ordering::SeqCst) + n;
    PEAK.fetch_max(now, Ordering::SeqCst);
}

fn shrink(n: usize) {
    CURRENT.fetch_sub(n, Ordering::SeqCst);
}

unsafe impl GlobalAlloc for Counting {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            grow(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) };
        shrink(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { System.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            if new_size > layout.size() {
                grow(new_size - layout.size());
            } else {
                shrink(layout.size() - new_size);
            }
        }
        new_ptr
    }
}

#[global_allocator]
static ALLOCATOR: Counting = Counting;

const FILE_SIZE: u64 = 15 * 1024 * 1024;
const MAX_GROWTH: usize = 2 * 1024 * 1024;
const CHUNK_SIZE: usize = 16 * 1024;

/// Reset the high-water mark and return the current heap size
fn start_phase() -> usize {
    let now = CURRENT.load(Ordering::SeqCst);
    PEAK.store(now, Ordering::SeqCst);
    now
}

fn assert_bounded(phase: &str, baseline: usize) {
    let growth = PEAK.load(Ordering::SeqCst).saturating_sub(baseline);
    assert!(
        growth <= MAX_GROWTH,
        "{phase}: heap grew by {growth} bytes moving a {FILE_SIZE} byte file"
    );
}

async fn drain(fs: &SqlFs, path: &str) -> u64 {
    let file = fs.read_stream(path).await.unwrap().unwrap();
    let mut stream = file.stream;
    let mut total = 0u64;
    while let Some(chunk) = stream.try_next().await.unwrap() {
        total += chunk.len() as u64;
    }
    total
}

async fn open(db: &str, unbuffered: bool) -> SqlFs {
    SqlFs::open(
        SqlBackendConfig::Sqlite(db.to_string()),
        FsConfig::default()
            .with_chunk_size(CHUNK_SIZE)
            .with_unbuffered_reads(unbuffered),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_large_file_memory_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("memory.db");
    let db = db.to_str().unwrap().to_string();

    let buffered = open(&db, false).await;
    let unbuffered = open(&db, true).await;

    // Warm up pools, statement caches and tracing callsites
    buffered.write("/warmup.bin", vec![1u8; 4 * CHUNK_SIZE], &WriteConfig::new()).await.unwrap();
    assert_eq!(drain(&buffered, "/warmup.bin").await, 4 * CHUNK_SIZE as u64);
    assert_eq!(drain(&unbuffered, "/warmup.bin").await, 4 * CHUNK_SIZE as u64);

    let baseline = start_phase();
    let source = tokio::io::repeat(0xA5).take(FILE_SIZE);
    let record = buffered
        .write_stream("/large.bin", source, &WriteConfig::new())
        .await
        .unwrap();
    assert_eq!(record.size, FILE_SIZE);
    assert_bounded("write_stream", baseline);

    let baseline = start_phase();
    assert_eq!(drain(&buffered, "/large.bin").await, FILE_SIZE);
    assert_bounded("buffered read_stream", baseline);

    let baseline = start_phase();
    assert_eq!(drain(&unbuffered, "/large.bin").await, FILE_SIZE);
    assert_bounded("unbuffered read_stream", baseline);

    let baseline = start_phase();
    let source = tokio::io::repeat(0x5A).take(FILE_SIZE);
    let record = unbuffered
        .update_stream("/large.bin", source, &WriteConfig::new().compressed(true))
        .await
        .unwrap();
    assert!(record.is_compressed);
    assert_bounded("compressed update_stream", baseline);

    let baseline = start_phase();
    assert_eq!(drain(&unbuffered, "/large.bin").await, FILE_SIZE);
    assert_bounded("compressed read_stream", baseline);
}
