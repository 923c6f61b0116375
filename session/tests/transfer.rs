mod session_test_common;

use anyhow::Result;
use camino::Utf8PathBuf;
use common::{Allocation, Depot, DepotMap, Exnode, Mode};
use protocol::{MemDriver, ProtocolDriver};
use rand::{RngCore, rng};
use session::{
    CopyOptions, Direction, DownloadOptions, Session, SessionConfig, SessionError, UploadOptions,
};
pub use session_test_common::*;
use std::{collections::BTreeMap, fs, time::Duration};
use store::{DataStore, ExnodeRecord, ExtentRecord, Persist};

fn utf8(path: &std::path::Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).expect("non-utf8 temp path")
}

fn random_file(dir: &tempfile::TempDir, name: &str, len: usize) -> (Utf8PathBuf, Vec<u8>) {
    let mut data = vec![0u8; len];
    rng().fill_bytes(&mut data);
    let path = dir.path().join(name);
    fs::write(&path, &data).unwrap();
    (utf8(&path), data)
}

/// Persists a hand-built exnode and its extents, preserving the given
/// insertion order (the download schedule pops the last-inserted replica
/// first).
async fn persist_exnode(
    registry: &DataStore,
    exnode: &Exnode,
    allocs: Vec<Allocation>,
) -> Vec<Allocation> {
    registry.store(ExnodeRecord::from(exnode)).await.unwrap();
    let mut rows = Vec::new();
    let mut parented = Vec::new();
    for mut alloc in allocs {
        alloc.parent = Some(exnode.id);
        rows.push(ExtentRecord::from_allocation(&alloc).unwrap());
        parented.push(alloc);
    }
    registry.store_all(rows).await.unwrap();
    parented
}

#[tokio::test]
async fn test_single_chunk_upload() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (path, data) = random_file(&dir, "tiny.bin", 100);

    let registry = setup_registry().await;
    let config = SessionConfig::default().block_size(4096).copies(1);
    let session = Session::new(registry, Some(mem_depots(&["s1d1"])), config).await?;

    let result = session.upload(&path, UploadOptions::default()).await?;

    assert_eq!(result.bytes, 100);
    assert_eq!(result.exnode.size, 100);
    assert_eq!(result.exnode.mode, Mode::File);
    assert_eq!(result.exnode.extents.len(), 1);

    let alloc = &result.exnode.extents[0];
    assert_eq!(alloc.offset, 0);
    assert_eq!(alloc.size, 100);
    assert_eq!(alloc.location, "mem://s1d1:1");
    assert_eq!(alloc.parent, Some(result.exnode.id));

    // The stored replica holds the file's bytes.
    let driver = MemDriver::new();
    let depot = Depot::new("mem://s1d1:1", "mem");
    assert_eq!(driver.read(alloc, &depot).await?, data);

    let records = session.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].direction, Direction::Up);
    assert_eq!(records[0].bytes, 100);
    Ok(())
}

#[tokio::test]
async fn test_replicated_upload_covers_every_offset_twice() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (path, _) = random_file(&dir, "twochunk.bin", 8192);

    let registry = setup_registry().await;
    // One worker keeps job order deterministic: both replicas of a chunk
    // are scheduled back to back, landing on distinct depots.
    let config = SessionConfig::default().block_size(4096).copies(2).threads(1);
    let session = Session::new(registry, Some(mem_depots(&["s2d1", "s2d2"])), config).await?;

    let result = session.upload(&path, UploadOptions::default()).await?;
    assert_eq!(result.exnode.extents.len(), 4);
    assert_eq!(result.bytes, 2 * 8192);

    let mut by_offset: BTreeMap<u64, Vec<&str>> = BTreeMap::new();
    for alloc in &result.exnode.extents {
        assert_eq!(alloc.size, 4096);
        by_offset
            .entry(alloc.offset)
            .or_default()
            .push(alloc.location.as_str());
    }
    assert_eq!(
        by_offset.keys().copied().collect::<Vec<_>>(),
        vec![0, 4096],
        "extents must cover [0, 8192)"
    );
    for (offset, locations) in by_offset {
        assert_eq!(locations.len(), 2, "offset {offset} should have 2 replicas");
        assert_ne!(
            locations[0], locations[1],
            "replicas at {offset} should sit on distinct depots"
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_upload_retries_on_failing_depot() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (path, _) = random_file(&dir, "retry.bin", 4096);

    let registry = setup_registry().await;
    // Ring order is alphabetical, so the flaky depot is asked first and
    // fails exactly once.
    let mut depots = mem_depots(&["s3b"]);
    let flaky = Depot::new("flaky://s3a:1", "flaky");
    depots.insert(flaky.access_point.clone(), flaky);

    let config = SessionConfig::default().block_size(4096).copies(1).threads(1);
    let session = Session::with_protocols(
        registry,
        registry_with_flaky(1, 0),
        Some(depots),
        config,
    )
    .await?;

    let result = session.upload(&path, UploadOptions::default()).await?;
    assert_eq!(result.bytes, 4096);
    assert_eq!(result.exnode.extents.len(), 1);
    let location = result.exnode.extents[0].location.as_str();
    assert!(
        location == "flaky://s3a:1" || location == "mem://s3b:1",
        "terminal allocation must land on one of the session depots, got {location}"
    );
    Ok(())
}

#[tokio::test]
async fn test_download_fails_over_to_second_replica() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut data = vec![0u8; 1024];
    rng().fill_bytes(&mut data);

    let registry = setup_registry().await;
    let protocols = registry_with_flaky(0, 1);

    let healthy = Depot::new("mem://s4d2:1", "mem");
    let flaky = Depot::new("flaky://s4d1:1", "flaky");

    // Two replicas of the same extent. The flaky one is inserted last so
    // the schedule tries it first, and its single read fails.
    let mem_alloc = MemDriver::new()
        .make_allocation(&data, 0, &healthy, Duration::from_secs(60))
        .await?;
    let flaky_alloc = protocols
        .by_kind("flaky")?
        .make_allocation(&data, 0, &flaky, Duration::from_secs(60))
        .await?;

    let exnode = Exnode::file("replicated.bin", 1024, None, "644");
    persist_exnode(&registry, &exnode, vec![mem_alloc, flaky_alloc]).await;

    let mut depots = DepotMap::new();
    depots.insert(healthy.access_point.clone(), healthy);
    depots.insert(flaky.access_point.clone(), flaky);

    let config = SessionConfig::default().threads(2);
    let session = Session::with_protocols(registry, protocols, Some(depots), config).await?;

    let dest = utf8(&dir.path().join("out.bin"));
    let result = session
        .download(&exnode.id, &dest, DownloadOptions::default())
        .await?;

    assert_eq!(result.bytes, 1024);
    assert_eq!(fs::read(dest.as_std_path())?, data);

    // Exactly one write happened; the failed replica only cost a retry.
    let downs: Vec<_> = session
        .records()
        .into_iter()
        .filter(|r| r.direction == Direction::Down)
        .collect();
    assert_eq!(downs.len(), 1);
    assert_eq!(downs[0].allocation.location, "mem://s4d2:1");
    Ok(())
}

#[tokio::test]
async fn test_download_splits_partially_covering_extent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut data = vec![0u8; 2048];
    rng().fill_bytes(&mut data);

    let registry = setup_registry().await;
    let depots = mem_depots(&["s5d1", "s5d2"]);
    let d1 = depots["mem://s5d1:1"].clone();
    let d2 = depots["mem://s5d2:1"].clone();

    let driver = MemDriver::new();
    let first = driver
        .make_allocation(&data[..1024], 0, &d1, Duration::from_secs(60))
        .await?;
    let second = driver
        .make_allocation(&data[1024..], 1024, &d2, Duration::from_secs(60))
        .await?;

    let exnode = Exnode::file("split.bin", 2048, None, "644");
    persist_exnode(&registry, &exnode, vec![first, second]).await;

    // Worker-pool path: the single job (0, 2048) is served by the first
    // extent and the remainder (1024, 2048) is re-enqueued.
    let session = Session::new(
        registry.clone(),
        Some(depots.clone()),
        SessionConfig::default().threads(2),
    )
    .await?;
    let dest = utf8(&dir.path().join("pool.bin"));
    let result = session
        .download(&exnode.id, &dest, DownloadOptions::default())
        .await?;
    assert_eq!(result.bytes, 2048);
    assert_eq!(fs::read(dest.as_std_path())?, data);
    assert_eq!(session.records().len(), 2);

    // Linear path: one thread walks the schedule cursor instead.
    let linear = Session::new(registry, Some(depots), SessionConfig::default().threads(1)).await?;
    let dest = utf8(&dir.path().join("linear.bin"));
    let result = linear
        .download(&exnode.id, &dest, DownloadOptions::default())
        .await?;
    assert_eq!(result.bytes, 2048);
    assert_eq!(fs::read(dest.as_std_path())?, data);
    Ok(())
}

#[tokio::test]
async fn test_insufficient_depots_fails_before_any_job() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (path, _) = random_file(&dir, "big.bin", 4096);

    let registry = setup_registry().await;
    let config = SessionConfig::default().copies(3);
    let session = Session::new(registry, Some(mem_depots(&["s6d1", "s6d2"])), config).await?;

    let err = session
        .upload(&path, UploadOptions::default())
        .await
        .unwrap_err();
    match err {
        SessionError::InsufficientDepots { needed, available } => {
            assert_eq!(needed, 3);
            assert_eq!(available, 2);
        }
        other => panic!("expected InsufficientDepots, got {other}"),
    }
    // Nothing was transferred and nothing was recorded.
    assert!(session.records().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_upload_download_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    // Not a multiple of the block size, so the tail chunk is short.
    let (path, data) = random_file(&dir, "scene.tif", 200_000);

    let registry = setup_registry().await;
    let config = SessionConfig::default()
        .block_size_str("32k")?
        .copies(2)
        .threads(4);
    let session = Session::new(
        registry,
        Some(mem_depots(&["rtd1", "rtd2", "rtd3"])),
        config,
    )
    .await?;

    let uploaded = session.upload(&path, UploadOptions::default()).await?;
    assert_eq!(uploaded.exnode.size, 200_000);
    // ceil(200000 / 32768) = 7 chunks, 2 replicas each.
    assert_eq!(uploaded.exnode.extents.len(), 14);
    for alloc in &uploaded.exnode.extents {
        assert!(alloc.offset < 200_000);
        assert!(alloc.end() <= 200_000);
        assert!(alloc.size <= 32 * KB);
    }

    let dest = utf8(&dir.path().join("scene.out"));
    let downloaded = session
        .download(&uploaded.exnode.id, &dest, DownloadOptions::default())
        .await?;

    assert_eq!(downloaded.bytes, 200_000);
    assert_eq!(fs::read(dest.as_std_path())?, data);
    Ok(())
}

#[tokio::test]
async fn test_copy_assembles_fresh_manifest() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (path, data) = random_file(&dir, "copied.bin", 3 * KB as usize);

    let registry = setup_registry().await;
    let config = SessionConfig::default().block_size(1024).threads(2);
    let session = Session::new(
        registry,
        Some(mem_depots(&["cpd1", "cpd2"])),
        config,
    )
    .await?;

    let uploaded = session.upload(&path, UploadOptions::default()).await?;
    let copied = session
        .copy(&uploaded.exnode.id, CopyOptions::default())
        .await?;

    // A new exnode, same shape, fully covered.
    assert_ne!(copied.exnode.id, uploaded.exnode.id);
    assert_eq!(copied.exnode.size, uploaded.exnode.size);
    assert_eq!(copied.exnode.extents.len(), 3);
    let mut offsets: Vec<u64> = copied.exnode.extents.iter().map(|a| a.offset).collect();
    offsets.sort_unstable();
    assert_eq!(offsets, vec![0, 1024, 2048]);

    // The copied manifest downloads to the original bytes.
    let dest = utf8(&dir.path().join("copied.out"));
    let result = session
        .download(&copied.exnode.id, &dest, DownloadOptions::default())
        .await?;
    assert_eq!(result.bytes, 3 * KB);
    assert_eq!(fs::read(dest.as_std_path())?, data);
    Ok(())
}

#[tokio::test]
async fn test_mkdir_and_upload_into_folder() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (path, _) = random_file(&dir, "leaf.bin", 512);

    let registry = setup_registry().await;
    let session = Session::new(
        registry,
        Some(mem_depots(&["dird1"])),
        SessionConfig::default(),
    )
    .await?;

    let created = session.mkdir("landsat/lc8/008").await?;
    assert_eq!(created.name, "008");
    assert_eq!(created.mode, Mode::Directory);

    // mkdir is idempotent on an existing path.
    let again = session.mkdir("landsat/lc8/008").await?;
    assert_eq!(again.id, created.id);

    let opts = UploadOptions {
        folder: Some("landsat/lc8".to_string()),
        ..Default::default()
    };
    let uploaded = session.upload(&path, opts).await?;

    let listing = session.ls(Some("landsat/lc8")).await?;
    let names: Vec<&str> = listing.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"008"));
    assert!(names.contains(&"leaf.bin"));

    let file = listing.iter().find(|e| e.mode == Mode::File).unwrap();
    assert_eq!(file.id, uploaded.exnode.id);

    // Roots only contain the top directory.
    let roots = session.ls(None).await?;
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].name, "landsat");
    Ok(())
}
