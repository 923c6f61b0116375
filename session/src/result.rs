use common::Exnode;

/// Summary returned by a completed upload. `bytes` counts every chunk
/// transferred, replicas included, so it can exceed the file size.
#[derive(Clone, Debug)]
pub struct UploadResult {
    pub duration_s: f64,
    pub bytes: u64,
    pub exnode: Exnode,
}

/// Summary returned by a completed download. `bytes` below the exnode
/// size means some offsets exhausted every replica.
#[derive(Clone, Debug)]
pub struct DownloadResult {
    pub duration_s: f64,
    pub bytes: u64,
    pub exnode: Exnode,
}

/// Summary returned by a completed copy; the exnode is the freshly
/// assembled destination manifest.
#[derive(Clone, Debug)]
pub struct CopyResult {
    pub duration_s: f64,
    pub exnode: Exnode,
}
