use crate::{
    CopyResult, Direction, DownloadResult, Job, JobQueue, ProgressFn, RETRY_LIMIT,
    ReplicaDownload, RoundRobinUpload, Schedule, ScheduleContext, SessionConfig, SessionError,
    TransferRecord, UploadResult, VizSink, viz::host_of,
};
use camino::{Utf8Path, Utf8PathBuf};
use common::{Allocation, Depot, DepotMap, Exnode, ExnodeId, Mode};
use log::{debug, info, warn};
use protocol::ProtocolRegistry;
use std::{
    collections::HashSet,
    io::SeekFrom,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use store::{DataStore, ExnodeRecord, ExtentRecord, Fetch, Persist};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    time::timeout,
};

/// Per-transfer options for [`Session::upload`].
#[derive(Clone, Default)]
pub struct UploadOptions {
    /// Exnode name; the file name of the source path when unset.
    pub filename: Option<String>,
    /// Slash-separated folder path the exnode is filed under, created on
    /// demand.
    pub folder: Option<String>,
    /// Replica count override.
    pub copies: Option<usize>,
    /// Allocation lifetime override.
    pub duration: Option<Duration>,
    pub progress: Option<ProgressFn>,
}

#[derive(Clone, Default)]
pub struct DownloadOptions {
    pub progress: Option<ProgressFn>,
}

#[derive(Clone, Default)]
pub struct CopyOptions {
    pub duration: Option<Duration>,
    pub progress: Option<ProgressFn>,
}

/// A transfer session against one metadata registry and one depot table.
///
/// The session owns the depot table (read-only during transfers), the job
/// queue shared by its workers and the transfer record log. Schedules are
/// created per transfer and never shared between concurrent transfers.
pub struct Session {
    registry: Arc<DataStore>,
    protocols: Arc<ProtocolRegistry>,
    depots: Arc<DepotMap>,
    config: SessionConfig,
    jobs: JobQueue,
    records: Arc<Mutex<Vec<TransferRecord>>>,
}

impl Session {
    /// Builds a session with the bundled protocol drivers. Depots may be
    /// supplied directly; otherwise the registry's depot table is used.
    pub async fn new(
        registry: Arc<DataStore>,
        depots: Option<DepotMap>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        Self::with_protocols(
            registry,
            Arc::new(ProtocolRegistry::with_defaults()),
            depots,
            config,
        )
        .await
    }

    /// Same as [`Session::new`] with a caller-assembled protocol registry.
    pub async fn with_protocols(
        registry: Arc<DataStore>,
        protocols: Arc<ProtocolRegistry>,
        depots: Option<DepotMap>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let depots: DepotMap = match depots {
            Some(map) => map.into_iter().filter(|(_, d)| d.enabled).collect(),
            None => {
                let mut map = DepotMap::new();
                for rec in registry.depots().await? {
                    let depot: Depot = rec.try_into()?;
                    if depot.enabled && protocols.by_kind(&depot.service_type).is_ok() {
                        map.insert(depot.access_point.clone(), depot);
                    }
                }
                map
            }
        };
        if depots.is_empty() {
            return Err(SessionError::NoDepots);
        }

        Ok(Self {
            registry,
            protocols,
            depots: Arc::new(depots),
            config,
            jobs: JobQueue::unbounded(),
            records: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn depots(&self) -> &DepotMap {
        &self.depots
    }

    /// Snapshot of the audit log of successful chunk transfers.
    pub fn records(&self) -> Vec<TransferRecord> {
        self.records.lock().expect("record log poisoned").clone()
    }

    /// Drains any leftover jobs and closes the registry connection.
    pub async fn shutdown(self) {
        while self.jobs.get().is_some() {}
        self.registry.close().await;
    }

    /// Uploads a local file with the default round-robin schedule.
    pub async fn upload(
        &self,
        path: impl AsRef<Utf8Path>,
        opts: UploadOptions,
    ) -> Result<UploadResult, SessionError> {
        self.upload_with(RoundRobinUpload::default(), path, opts).await
    }

    /// Uploads a local file: fragments it into block-sized jobs, replicates
    /// each chunk onto schedule-chosen depots, then assembles and persists
    /// the resulting exnode.
    pub async fn upload_with<S>(
        &self,
        mut schedule: S,
        path: impl AsRef<Utf8Path>,
        opts: UploadOptions,
    ) -> Result<UploadResult, SessionError>
    where
        S: Schedule<Source = DepotMap, Choice = String> + Send + 'static,
    {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(SessionError::NotAFile(path.to_string()));
        }
        let size = meta.len();
        if size > 0 && self.config.block_size == 0 {
            return Err(SessionError::InvalidBlockSize);
        }

        let copies = opts.copies.unwrap_or(self.config.copies);
        if self.depots.len() < copies {
            return Err(SessionError::InsufficientDepots {
                needed: copies,
                available: self.depots.len(),
            });
        }

        let parent = match &opts.folder {
            Some(folder) => Some(self.mkdir(folder).await?.id),
            None => None,
        };
        let name = opts
            .filename
            .clone()
            .or_else(|| path.file_name().map(str::to_string))
            .unwrap_or_else(|| path.to_string());
        let mut exnode = Exnode::file(name, size, parent, file_permission(&meta));

        let viz = VizSink::register(
            self.config.viz_url.as_deref(),
            &exnode.name,
            size,
            self.depots.len(),
        )
        .await;

        schedule.set_source((*self.depots).clone());

        debug!(
            "generating jobs: size={size} block={} copies={copies}",
            self.config.block_size
        );
        let mut chunk = 0u64;
        while chunk < size {
            for _ in 0..copies {
                self.jobs.try_put(Job::new(chunk, self.config.block_size));
            }
            chunk += self.config.block_size;
        }

        let shared = Arc::new(UploadShared {
            path: path.to_owned(),
            jobs: self.jobs.clone(),
            schedule: Mutex::new(schedule),
            protocols: self.protocols.clone(),
            depots: self.depots.clone(),
            records: self.records.clone(),
            viz,
            progress: opts.progress.clone(),
            timeout: self.config.timeout,
            duration: opts.duration.unwrap_or(self.config.duration),
        });

        let started = Instant::now();
        let mut handles = Vec::new();
        for rank in 0..self.config.threads.max(1) {
            let shared = shared.clone();
            handles.push(tokio::spawn(async move { upload_worker(shared, rank).await }));
        }

        let mut uploaded = 0u64;
        let mut allocs = Vec::new();
        let mut failed = 0u32;
        for handle in handles {
            let (bytes, mut worker_allocs, worker_failed) = handle
                .await
                .map_err(|e| SessionError::Worker(e.to_string()))?;
            uploaded += bytes;
            allocs.append(&mut worker_allocs);
            failed += worker_failed;
        }
        if failed > 0 {
            warn!("{failed} upload jobs gave up before producing an allocation");
        }

        self.assemble(&mut exnode, allocs).await?;

        Ok(UploadResult {
            duration_s: started.elapsed().as_secs_f64(),
            bytes: uploaded,
            exnode,
        })
    }

    /// Downloads an exnode with the default replica schedule.
    pub async fn download(
        &self,
        exnode_id: &ExnodeId,
        dest: impl AsRef<Utf8Path>,
        opts: DownloadOptions,
    ) -> Result<DownloadResult, SessionError> {
        self.download_with(ReplicaDownload::default(), exnode_id, dest, opts)
            .await
    }

    /// Downloads an exnode: resolves its extents, then reassembles the file
    /// by racing workers over schedule-chosen replicas. With one thread the
    /// transfer degenerates to a linear schedule-driven loop.
    pub async fn download_with<S>(
        &self,
        mut schedule: S,
        exnode_id: &ExnodeId,
        dest: impl AsRef<Utf8Path>,
        opts: DownloadOptions,
    ) -> Result<DownloadResult, SessionError>
    where
        S: Schedule<Source = Vec<Allocation>, Choice = Allocation> + Send + 'static,
    {
        let dest = dest.as_ref();
        let record: ExnodeRecord = self.registry.fetch_by(exnode_id).await?;
        let mut exnode: Exnode = record.try_into()?;
        let rows: Vec<ExtentRecord> = self.registry.fetch_by(exnode_id).await?;
        let mut extents = Vec::with_capacity(rows.len());
        for row in rows {
            extents.push(Allocation::try_from(row)?);
        }
        exnode.extents = extents.clone();

        let locations: HashSet<&str> = extents.iter().map(|a| a.location.as_str()).collect();
        let viz = VizSink::register(
            self.config.viz_url.as_deref(),
            &exnode.name,
            exnode.size,
            locations.len(),
        )
        .await;

        schedule.set_source(extents);

        let started = Instant::now();
        let downloaded = if self.config.threads > 1 {
            // Pre-size the output once; workers then only ever write whole
            // buffers at absolute offsets.
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(dest.as_std_path())
                .await?;
            file.set_len(exnode.size).await?;
            drop(file);

            if exnode.size > 0 {
                self.jobs.try_put(Job::new(0, exnode.size));
            }

            let shared = Arc::new(DownloadShared {
                dest: dest.to_owned(),
                jobs: self.jobs.clone(),
                schedule: Mutex::new(schedule),
                protocols: self.protocols.clone(),
                depots: self.depots.clone(),
                records: self.records.clone(),
                viz,
                progress: opts.progress.clone(),
                timeout: self.config.timeout,
            });

            let mut handles = Vec::new();
            for rank in 0..self.config.threads {
                let shared = shared.clone();
                handles.push(tokio::spawn(async move { download_worker(shared, rank).await }));
            }

            let mut downloaded = 0u64;
            let mut failed = 0u32;
            for handle in handles {
                let (bytes, worker_failed) = handle
                    .await
                    .map_err(|e| SessionError::Worker(e.to_string()))?;
                downloaded += bytes;
                failed += worker_failed;
            }
            if failed > 0 {
                warn!("{failed} download jobs could not be served by any replica");
            }
            if let Some(viz) = &shared.viz {
                viz.clear().await;
            }
            downloaded
        } else {
            self.download_linear(schedule, &exnode, dest, viz, opts.progress.as_ref())
                .await?
        };

        Ok(DownloadResult {
            duration_s: started.elapsed().as_secs_f64(),
            bytes: downloaded,
            exnode,
        })
    }

    /// Single-threaded download: one cursor advanced by whatever the
    /// schedule serves next.
    async fn download_linear<S>(
        &self,
        mut schedule: S,
        exnode: &Exnode,
        dest: &Utf8Path,
        viz: Option<VizSink>,
        progress: Option<&ProgressFn>,
    ) -> Result<u64, SessionError>
    where
        S: Schedule<Source = Vec<Allocation>, Choice = Allocation> + Send,
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dest.as_std_path())
            .await?;
        file.set_len(exnode.size).await?;

        let mut offset = 0u64;
        while offset < exnode.size {
            let alloc = match schedule.get(&ScheduleContext::at(offset)) {
                Ok(alloc) => alloc,
                Err(err) => {
                    warn!("{err}");
                    break;
                }
            };
            let Some(depot) = self.depots.get(&alloc.location) else {
                warn!("allocation references unknown depot {}", alloc.location);
                continue;
            };
            let driver = match self.protocols.for_allocation(&alloc) {
                Ok(driver) => driver,
                Err(err) => {
                    warn!("{err}");
                    continue;
                }
            };

            let data = match timeout(self.config.timeout, driver.read(&alloc, depot)).await {
                Ok(Ok(data)) if !data.is_empty() => data,
                Ok(Ok(_)) => {
                    warn!("unable to download block - empty read at {offset}");
                    continue;
                }
                Ok(Err(err)) => {
                    warn!("unable to download block - {err}");
                    continue;
                }
                Err(_) => {
                    warn!("unable to download block - timed out at {offset}");
                    continue;
                }
            };

            write_at(&mut file, alloc.offset, &data).await?;
            let written = data.len() as u64;
            self.records
                .lock()
                .expect("record log poisoned")
                .push(TransferRecord {
                    direction: Direction::Down,
                    allocation: alloc.clone(),
                    offset,
                    bytes: written,
                });
            if let Some(viz) = &viz {
                viz.progress(host_of(&alloc.location), alloc.size, alloc.offset)
                    .await;
            }
            if let Some(progress) = progress {
                progress(&alloc.location, alloc.size, alloc.offset);
            }
            info!("downloaded: {}-{}", offset, offset + written);
            offset += written;
        }

        if let Some(viz) = &viz {
            viz.clear().await;
        }
        Ok(offset)
    }

    /// Replicates an exnode's data onto schedule-chosen destination depots
    /// with default schedules.
    pub async fn copy(
        &self,
        exnode_id: &ExnodeId,
        opts: CopyOptions,
    ) -> Result<CopyResult, SessionError> {
        self.copy_with(
            ReplicaDownload::default(),
            RoundRobinUpload::default(),
            exnode_id,
            opts,
        )
        .await
    }

    /// Copy fuses both schedules: the download schedule orders the source
    /// extents, the upload schedule picks a destination per extent, and the
    /// drivers move the data server-to-server. The destination allocations
    /// are assembled into a fresh exnode manifest.
    pub async fn copy_with<D, U>(
        &self,
        mut download_schedule: D,
        mut upload_schedule: U,
        exnode_id: &ExnodeId,
        opts: CopyOptions,
    ) -> Result<CopyResult, SessionError>
    where
        D: Schedule<Source = Vec<Allocation>, Choice = Allocation> + Send,
        U: Schedule<Source = DepotMap, Choice = String> + Send + 'static,
    {
        let record: ExnodeRecord = self.registry.fetch_by(exnode_id).await?;
        let source: Exnode = record.try_into()?;
        let rows: Vec<ExtentRecord> = self.registry.fetch_by(exnode_id).await?;
        let mut extents = Vec::with_capacity(rows.len());
        for row in rows {
            extents.push(Allocation::try_from(row)?);
        }

        download_schedule.set_source(extents);
        upload_schedule.set_source((*self.depots).clone());

        // The ordered extent stream is derived through the download
        // schedule before any worker starts.
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut cursor = 0u64;
        while cursor < source.size {
            match download_schedule.get(&ScheduleContext::at(cursor)) {
                Ok(ext) => {
                    cursor += ext.size;
                    let _ = tx.send(ext);
                }
                Err(err) => {
                    warn!("{err}");
                    break;
                }
            }
        }
        drop(tx);

        let viz_down = VizSink::register(
            self.config.viz_url.as_deref(),
            &format!("{}_download", source.name),
            source.size,
            self.depots.len(),
        )
        .await;
        let viz_up = VizSink::register(
            self.config.viz_url.as_deref(),
            &format!("{}_upload", source.name),
            source.size,
            self.depots.len(),
        )
        .await;

        let shared = Arc::new(CopyShared {
            extents: rx,
            schedule: Mutex::new(upload_schedule),
            protocols: self.protocols.clone(),
            depots: self.depots.clone(),
            viz_down,
            viz_up,
            progress: opts.progress.clone(),
            timeout: self.config.timeout,
            duration: opts.duration.unwrap_or(self.config.duration),
        });

        let started = Instant::now();
        let mut handles = Vec::new();
        for rank in 0..self.config.threads.max(1) {
            let shared = shared.clone();
            handles.push(tokio::spawn(async move { copy_worker(shared, rank).await }));
        }

        let mut allocs = Vec::new();
        let mut failed = 0u32;
        for handle in handles {
            let (mut worker_allocs, worker_failed) = handle
                .await
                .map_err(|e| SessionError::Worker(e.to_string()))?;
            allocs.append(&mut worker_allocs);
            failed += worker_failed;
        }
        if failed > 0 {
            warn!("{failed} extents were not copied");
        }

        let mut manifest = Exnode::file(
            source.name.clone(),
            source.size,
            source.parent,
            source.permission.clone(),
        );
        self.assemble(&mut manifest, allocs).await?;

        Ok(CopyResult {
            duration_s: started.elapsed().as_secs_f64(),
            exnode: manifest,
        })
    }

    /// Persists a transfer's outcome: the exnode record first (extents
    /// reference it), then every allocation with its parent back reference
    /// set, flushed in one transaction.
    async fn assemble(
        &self,
        exnode: &mut Exnode,
        allocs: Vec<Allocation>,
    ) -> Result<(), SessionError> {
        self.registry.store(ExnodeRecord::from(&*exnode)).await?;

        let mut extent_rows = Vec::with_capacity(allocs.len());
        for mut alloc in allocs {
            alloc.parent = Some(exnode.id);
            extent_rows.push(ExtentRecord::from_allocation(&alloc)?);
            exnode.extents.push(alloc);
        }
        self.registry.store_all(extent_rows).await?;
        Ok(())
    }

    /// Creates (or finds) the directory exnode at a slash-separated path,
    /// creating missing components on the way down. Serialized per session.
    pub async fn mkdir(&self, path: &str) -> Result<Exnode, SessionError> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if parts.is_empty() {
            return Err(SessionError::InvalidPath(path.to_string()));
        }

        let mut parent: Option<ExnodeId> = None;
        let mut current: Option<Exnode> = None;
        for part in parts {
            let next = match self
                .registry
                .find_child(parent.as_ref(), part, Mode::Directory)
                .await?
            {
                Some(rec) => rec.try_into()?,
                None => {
                    let dir = Exnode::directory(part, parent);
                    self.registry.store(ExnodeRecord::from(&dir)).await?;
                    debug!("created directory exnode {} ({})", dir.name, dir.id);
                    dir
                }
            };
            parent = Some(next.id);
            current = Some(next);
        }

        current.ok_or_else(|| SessionError::InvalidPath(path.to_string()))
    }

    /// Lists the children of a directory path, or of the registry root
    /// when no path is given.
    pub async fn ls(&self, path: Option<&str>) -> Result<Vec<Exnode>, SessionError> {
        let parent = match path {
            Some(p) if p.split('/').any(|s| !s.is_empty()) => Some(self.resolve_dir(p).await?.id),
            _ => None,
        };
        let rows = self.registry.children(parent.as_ref()).await?;
        let mut children = Vec::with_capacity(rows.len());
        for row in rows {
            children.push(Exnode::try_from(row)?);
        }
        Ok(children)
    }

    async fn resolve_dir(&self, path: &str) -> Result<Exnode, SessionError> {
        let mut parent: Option<ExnodeId> = None;
        let mut current: Option<Exnode> = None;
        for part in path.split('/').filter(|s| !s.is_empty()) {
            let rec = self
                .registry
                .find_child(parent.as_ref(), part, Mode::Directory)
                .await?
                .ok_or_else(|| SessionError::PathNotFound(path.to_string()))?;
            let dir: Exnode = rec.try_into()?;
            parent = Some(dir.id);
            current = Some(dir);
        }
        current.ok_or_else(|| SessionError::InvalidPath(path.to_string()))
    }
}

struct UploadShared<S> {
    path: Utf8PathBuf,
    jobs: JobQueue,
    schedule: Mutex<S>,
    protocols: Arc<ProtocolRegistry>,
    depots: Arc<DepotMap>,
    records: Arc<Mutex<Vec<TransferRecord>>>,
    viz: Option<VizSink>,
    progress: Option<ProgressFn>,
    timeout: Duration,
    duration: Duration,
}

async fn upload_worker<S>(shared: Arc<UploadShared<S>>, rank: usize) -> (u64, Vec<Allocation>, u32)
where
    S: Schedule<Source = DepotMap, Choice = String> + Send,
{
    let mut uploaded = 0u64;
    let mut allocs = Vec::new();
    let mut failed = 0u32;

    let mut file = match File::open(shared.path.as_std_path()).await {
        Ok(file) => file,
        Err(err) => {
            warn!("[{rank}] cannot open {}: {err}", shared.path);
            return (0, allocs, 1);
        }
    };

    while let Some(job) = shared.jobs.get() {
        let data = match read_chunk(&mut file, job.offset, job.size).await {
            Ok(data) => data,
            Err(err) => {
                warn!("[{rank}] read failed at {}: {err}", job.offset);
                failed += 1;
                continue;
            }
        };
        if data.is_empty() {
            debug!("[{rank}] empty chunk at {}, skipping", job.offset);
            continue;
        }
        let read_len = data.len() as u64;

        let context = ScheduleContext {
            offset: job.offset,
            size: Some(read_len),
        };
        let choice = shared
            .schedule
            .lock()
            .expect("schedule mutex poisoned")
            .get(&context);
        let target = match choice {
            Ok(key) => key,
            Err(err) => {
                warn!("[{rank}] failed to schedule chunk upload - {err}");
                failed += 1;
                continue;
            }
        };
        let Some(depot) = shared.depots.get(&target) else {
            warn!("[{rank}] schedule chose unknown depot {target}");
            failed += 1;
            continue;
        };
        let driver = match shared.protocols.for_depot(depot) {
            Ok(driver) => driver,
            Err(err) => {
                warn!("[{rank}] {err}");
                failed += 1;
                continue;
            }
        };

        let attempt = timeout(
            shared.timeout,
            driver.make_allocation(&data, job.offset, depot, shared.duration),
        )
        .await;
        let alloc = match attempt {
            Ok(Ok(alloc)) => alloc,
            Ok(Err(err)) if err.is_transient() => {
                warn!("[{rank}] allocation failed on {target}: {err}");
                requeue(&shared.jobs, job, &mut failed);
                continue;
            }
            Ok(Err(err)) => {
                warn!("[{rank}] fatal backend error on {target}: {err}");
                failed += 1;
                continue;
            }
            Err(_) => {
                warn!("[{rank}] allocation timed out on {target}");
                requeue(&shared.jobs, job, &mut failed);
                continue;
            }
        };

        shared
            .records
            .lock()
            .expect("record log poisoned")
            .push(TransferRecord {
                direction: Direction::Up,
                allocation: alloc.clone(),
                offset: job.offset,
                bytes: read_len,
            });
        if let Some(viz) = &shared.viz {
            viz.progress(host_of(&alloc.location), alloc.size, alloc.offset)
                .await;
        }
        if let Some(progress) = &shared.progress {
            progress(&alloc.location, alloc.size, alloc.offset);
        }
        info!("[{rank}] uploaded: {}-{}", job.offset, job.offset + read_len);

        allocs.push(alloc);
        uploaded += read_len;
    }

    (uploaded, allocs, failed)
}

struct DownloadShared<S> {
    dest: Utf8PathBuf,
    jobs: JobQueue,
    schedule: Mutex<S>,
    protocols: Arc<ProtocolRegistry>,
    depots: Arc<DepotMap>,
    records: Arc<Mutex<Vec<TransferRecord>>>,
    viz: Option<VizSink>,
    progress: Option<ProgressFn>,
    timeout: Duration,
}

async fn download_worker<S>(shared: Arc<DownloadShared<S>>, rank: usize) -> (u64, u32)
where
    S: Schedule<Source = Vec<Allocation>, Choice = Allocation> + Send,
{
    let mut downloaded = 0u64;
    let mut failed = 0u32;

    let mut file = match OpenOptions::new()
        .write(true)
        .open(shared.dest.as_std_path())
        .await
    {
        Ok(file) => file,
        Err(err) => {
            warn!("[{rank}] cannot open {}: {err}", shared.dest);
            return (0, 1);
        }
    };

    while let Some(job) = shared.jobs.get() {
        let end = job.offset + job.size;
        let choice = shared
            .schedule
            .lock()
            .expect("schedule mutex poisoned")
            .get(&ScheduleContext::at(job.offset));
        let alloc = match choice {
            Ok(alloc) => alloc,
            Err(err) => {
                warn!("[{rank}] {err}");
                failed += 1;
                continue;
            }
        };

        // Hand the remainder to the pool before the (slow) read so other
        // workers can make progress in parallel.
        if alloc.end() < end {
            shared.jobs.try_put(Job::new(alloc.end(), end - alloc.end()));
        }

        let Some(depot) = shared.depots.get(&alloc.location) else {
            warn!("[{rank}] allocation references unknown depot {}", alloc.location);
            failed += 1;
            continue;
        };
        let driver = match shared.protocols.for_allocation(&alloc) {
            Ok(driver) => driver,
            Err(err) => {
                warn!("[{rank}] {err}");
                failed += 1;
                continue;
            }
        };

        let outcome = timeout(shared.timeout, driver.read(&alloc, depot)).await;
        let data = match outcome {
            Ok(Ok(data)) if !data.is_empty() => data,
            Ok(Ok(_)) => {
                warn!("[{rank}] unable to download block - empty read at {}", job.offset);
                shared
                    .jobs
                    .try_put(Job::new(job.offset, alloc.end() - job.offset));
                continue;
            }
            Ok(Err(err)) => {
                warn!("[{rank}] unable to download block - {err}");
                shared
                    .jobs
                    .try_put(Job::new(job.offset, alloc.end() - job.offset));
                continue;
            }
            Err(_) => {
                warn!("[{rank}] unable to download block - timed out at {}", job.offset);
                shared
                    .jobs
                    .try_put(Job::new(job.offset, alloc.end() - job.offset));
                continue;
            }
        };

        // Whole-buffer write at the allocation's absolute offset; ranges
        // of completed reads are disjoint, so workers need no further
        // synchronization on the file.
        if let Err(err) = write_at(&mut file, alloc.offset, &data).await {
            warn!("[{rank}] write failed at {}: {err}", alloc.offset);
            failed += 1;
            continue;
        }
        let written = data.len() as u64;

        shared
            .records
            .lock()
            .expect("record log poisoned")
            .push(TransferRecord {
                direction: Direction::Down,
                allocation: alloc.clone(),
                offset: job.offset,
                bytes: written,
            });
        if let Some(viz) = &shared.viz {
            viz.progress(host_of(&alloc.location), alloc.size, alloc.offset)
                .await;
        }
        if let Some(progress) = &shared.progress {
            progress(&alloc.location, alloc.size, alloc.offset);
        }
        info!("[{rank}] downloaded: {}-{}", job.offset, job.offset + written);
        downloaded += written;
    }

    (downloaded, failed)
}

struct CopyShared<U> {
    extents: crossbeam_channel::Receiver<Allocation>,
    schedule: Mutex<U>,
    protocols: Arc<ProtocolRegistry>,
    depots: Arc<DepotMap>,
    viz_down: Option<VizSink>,
    viz_up: Option<VizSink>,
    progress: Option<ProgressFn>,
    timeout: Duration,
    duration: Duration,
}

async fn copy_worker<U>(shared: Arc<CopyShared<U>>, rank: usize) -> (Vec<Allocation>, u32)
where
    U: Schedule<Source = DepotMap, Choice = String> + Send,
{
    let mut allocs = Vec::new();
    let mut failed = 0u32;

    while let Ok(ext) = shared.extents.try_recv() {
        let driver = match shared.protocols.for_allocation(&ext) {
            Ok(driver) => driver,
            Err(err) => {
                warn!("[{rank}] {err}");
                failed += 1;
                continue;
            }
        };
        let Some(src_depot) = shared.depots.get(&ext.location) else {
            warn!("[{rank}] source depot {} not in session table", ext.location);
            failed += 1;
            continue;
        };

        let choice = shared
            .schedule
            .lock()
            .expect("schedule mutex poisoned")
            .get(&ScheduleContext {
                offset: ext.offset,
                size: Some(ext.size),
            });
        let target = match choice {
            Ok(key) => key,
            Err(err) => {
                warn!("[{rank}] failed to schedule extent copy - {err}");
                failed += 1;
                continue;
            }
        };
        let Some(dst_depot) = shared.depots.get(&target) else {
            warn!("[{rank}] schedule chose unknown depot {target}");
            failed += 1;
            continue;
        };

        let outcome = timeout(
            shared.timeout,
            driver.copy(&ext, src_depot, dst_depot, shared.duration),
        )
        .await;
        match outcome {
            Ok(Ok(dst)) => {
                if let Some(viz) = &shared.viz_down {
                    viz.progress(host_of(&ext.location), ext.size, ext.offset).await;
                }
                if let Some(viz) = &shared.viz_up {
                    viz.progress(host_of(&dst.location), dst.size, dst.offset).await;
                }
                if let Some(progress) = &shared.progress {
                    progress(&dst.location, dst.size, dst.offset);
                }
                info!("[{rank}] copied: {}-{}", ext.offset, ext.end());
                allocs.push(dst);
            }
            Ok(Err(err)) => {
                warn!("[{rank}] copy failed for {}-{}: {err}", ext.offset, ext.end());
                failed += 1;
            }
            Err(_) => {
                warn!("[{rank}] copy timed out for {}-{}", ext.offset, ext.end());
                failed += 1;
            }
        }
    }

    (allocs, failed)
}

fn requeue(jobs: &JobQueue, job: Job, failed: &mut u32) {
    if job.attempts + 1 < RETRY_LIMIT {
        jobs.try_put(job.retry());
    } else {
        warn!("job at offset {} exhausted its retries", job.offset);
        *failed += 1;
    }
}

async fn read_chunk(file: &mut File, offset: u64, size: u64) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; size as usize];
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

async fn write_at(file: &mut File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await
}

#[cfg(unix)]
fn file_permission(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("{:o}", meta.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn file_permission(_meta: &std::fs::Metadata) -> String {
    "644".to_string()
}
