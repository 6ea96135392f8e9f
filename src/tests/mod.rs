//! Cross-module, end-to-end scenarios exercising the whole
//! writer -> index -> reader pipeline, mirroring the S1-S7 scenarios.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::cache::{CoalescingCache, MemoryCache};
use crate::decompress::DecoderPool;
use crate::entry::Compression;
use crate::errors::Error;
use crate::fixtures::CountingSource;
use crate::index::Index;
use crate::reader::{Reader, ReaderOptions};
use crate::source::{ByteSource, MemorySource};
use crate::writer::{self, WriterOptions};

async fn write_tree(files: &[(&str, &[u8])]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (rel, content) in files {
        let path = dir.path().join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(&path, content).await.unwrap();
    }
    dir
}

async fn create_archive(dir: &std::path::Path, options: &WriterOptions) -> (Index, Vec<u8>) {
    let mut index_buf = Vec::new();
    let mut data_buf = Vec::new();
    writer::create(dir, &mut index_buf, &mut data_buf, options, CancellationToken::new())
        .await
        .unwrap();
    (Index::load(Bytes::from(index_buf)).unwrap(), data_buf)
}

fn reader_over(index: Index, data: Vec<u8>) -> Reader<MemoryCache> {
    let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(Bytes::from(data), "mem"));
    Reader::new(index, source, Arc::new(DecoderPool::new(Default::default())), None, ReaderOptions::default())
}

#[tokio::test]
async fn s1_round_trip_uncompressed() {
    let files: &[(&str, &[u8])] = &[
        ("a.txt", b"content of a"),
        ("b.txt", b"content of b"),
        ("sub/c.txt", b"content of c"),
        ("sub/deep/d.go", b"package main"),
    ];
    let dir = write_tree(files).await;
    let (index, data) = create_archive(dir.path(), &WriterOptions::default()).await;

    assert_eq!(index.len(), 4);
    let paths: Vec<_> = index.entries_view().map(|v| v.path().unwrap().to_owned()).collect();
    assert_eq!(paths, vec!["a.txt", "b.txt", "sub/c.txt", "sub/deep/d.go"]);

    let reader = reader_over(index, data);
    for (path, content) in files {
        assert_eq!(reader.read_file(path).await.unwrap(), Bytes::copy_from_slice(content));
    }
}

#[tokio::test]
async fn s2_compression_shrinks_compressible_content() {
    let content = b"hello world ".repeat(1000);
    let dir = write_tree(&[("test.txt", &content)]).await;
    let options = WriterOptions {
        compression: Compression::Zstd,
        ..Default::default()
    };
    let (index, data) = create_archive(dir.path(), &options).await;

    let entry = index.lookup_view("test.txt").unwrap().to_entry().unwrap();
    assert!(entry.data_size < entry.original_size);

    let reader = reader_over(index, data);
    let bytes = reader.read_file("test.txt").await.unwrap();
    assert_eq!(bytes, Bytes::from(content));
}

#[tokio::test]
async fn s3_hash_tampering_is_detected_and_cache_is_purged() {
    let files: &[(&str, &[u8])] = &[("a.txt", b"content of a"), ("b.txt", b"content of b")];
    let dir = write_tree(files).await;
    let (index, mut data) = create_archive(dir.path(), &WriterOptions::default()).await;

    data[0] ^= 0xFF;

    let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(Bytes::from(data), "mem"));
    let cache = Arc::new(CoalescingCache::new(MemoryCache::new()));
    let reader = Reader::new(
        index.clone(),
        source,
        Arc::new(DecoderPool::new(Default::default())),
        Some(cache.clone()),
        ReaderOptions::default(),
    );

    let entry = index.lookup_view("a.txt").unwrap().to_entry().unwrap();
    // Pre-poison the cache to exercise the purge-on-mismatch path directly.
    use crate::cache::Cache;
    cache.put(&entry.hash, Bytes::from_static(b"not the real content")).await.unwrap();

    let err = reader.read_file("a.txt").await.unwrap_err();
    assert!(matches!(err, Error::HashMismatch { .. }));
    assert!(cache.get(&entry.hash).await.unwrap().is_none());
}

#[tokio::test]
async fn s4_symlink_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("real.txt"), b"real content").await.unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt")).unwrap();

    let (index, _data) = create_archive(dir.path(), &WriterOptions::default()).await;

    assert_eq!(index.len(), 1);
    assert!(index.lookup_view("real.txt").is_some());
    assert!(index.lookup_view("link.txt").is_none());
}

#[tokio::test]
async fn s5_prefix_scan_and_read_dir_synthesis() {
    let files: &[(&str, &[u8])] = &[
        ("assets/css/main.css", b"body{}"),
        ("assets/css/reset.css", b"*{}"),
        ("assets/images/logo.png", b"\x89PNG"),
        ("src/main.go", b"package main"),
    ];
    let dir = write_tree(files).await;
    let (index, data) = create_archive(dir.path(), &WriterOptions::default()).await;

    let scanned: Vec<_> = index
        .entries_with_prefix_view("assets/css/")
        .map(|v| v.path().unwrap().to_owned())
        .collect();
    assert_eq!(scanned, vec!["assets/css/main.css", "assets/css/reset.css"]);

    let reader = reader_over(index, data);
    let assets_children = reader.read_dir("assets").unwrap();
    let mut names: Vec<_> = assets_children.iter().map(|e| e.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["css", "images"]);
    assert!(assets_children.iter().all(|e| e.is_dir));
}

#[tokio::test]
async fn s6_single_flight_coalesces_misses() {
    let files: &[(&str, &[u8])] = &[("p.txt", b"shared payload")];
    let dir = write_tree(files).await;
    let (index, data) = create_archive(dir.path(), &WriterOptions::default()).await;

    let counting = Arc::new(CountingSource::new(MemorySource::new(Bytes::from(data), "mem")));
    let source: Arc<dyn ByteSource> = counting.clone();
    let reader = Arc::new(Reader::new(
        index,
        source,
        Arc::new(DecoderPool::new(Default::default())),
        Some(Arc::new(CoalescingCache::new(MemoryCache::new()))),
        ReaderOptions::default(),
    ));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let reader = reader.clone();
        tasks.push(tokio::spawn(async move { reader.read_file("p.txt").await.unwrap() }));
    }
    let mut results = Vec::new();
    for t in tasks {
        results.push(t.await.unwrap());
    }
    assert!(results.iter().all(|b| b == &results[0]));
    assert!(counting.call_count() <= 2);
}

#[tokio::test]
async fn s7_cancellation_aborts_before_writing_an_index() {
    let mut files = Vec::new();
    let owned: Vec<(String, Vec<u8>)> = (0..10).map(|i| (format!("f{i}.txt"), format!("content {i}").into_bytes())).collect();
    for (name, content) in &owned {
        files.push((name.as_str(), content.as_slice()));
    }
    let dir = write_tree(&files).await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut index_buf = Vec::new();
    let mut data_buf = Vec::new();
    let err = writer::create(dir.path(), &mut index_buf, &mut data_buf, &WriterOptions::default(), cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Canceled));
    assert!(index_buf.is_empty());
}

#[tokio::test]
async fn dir_stats_and_validate_files_agree_with_the_writer() {
    let files: &[(&str, &[u8])] = &[("a.txt", b"aaaa"), ("sub/b.txt", b"bbbbbb")];
    let dir = write_tree(files).await;
    let (index, data) = create_archive(dir.path(), &WriterOptions::default()).await;
    let reader = reader_over(index, data);

    let stats = reader.dir_stats(".").unwrap();
    assert_eq!(stats.file_count, 2);
    assert_eq!(stats.total_uncompressed, 4 + 6);

    let results = reader.validate_files(&["a.txt".to_string(), "sub/b.txt".to_string()]).await;
    assert!(results.iter().all(|(_, r)| r.is_ok()));
}

#[tokio::test]
async fn copy_to_extracts_requested_paths() {
    let files: &[(&str, &[u8])] = &[("a.txt", b"aaaa"), ("sub/b.txt", b"bbbbbb"), ("sub/c.txt", b"cccccc")];
    let dir = write_tree(files).await;
    let (index, data) = create_archive(dir.path(), &WriterOptions::default()).await;
    let reader = reader_over(index, data);

    let dest = tempfile::tempdir().unwrap();
    reader
        .copy_to(
            dest.path(),
            &["a.txt".to_string(), "sub".to_string()],
            &Default::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(dest.path().join("a.txt")).await.unwrap(), b"aaaa");
    assert_eq!(tokio::fs::read(dest.path().join("b.txt")).await.unwrap(), b"bbbbbb");
    assert_eq!(tokio::fs::read(dest.path().join("c.txt")).await.unwrap(), b"cccccc");
}
