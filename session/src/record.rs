use common::Allocation;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// Audit entry appended whenever a chunk transfer succeeds. In-memory
/// only; retrievable through `Session::records`.
#[derive(Clone, Debug)]
pub struct TransferRecord {
    pub direction: Direction,
    pub allocation: Allocation,
    /// Offset of the job that was served (for downloads this can differ
    /// from the allocation's own offset when a covering replica was used).
    pub offset: u64,
    pub bytes: u64,
}
