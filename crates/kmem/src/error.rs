//! Error types and the misuse policy shared by both allocators.

use snafu::Snafu;

/// What an allocator does when it detects a corruption-class error.
///
/// Corruption-class errors are frees or resizes of pointers the allocator
/// does not own (or no longer owns), and damaged block sentinels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, derive_more::IsVariant)]
pub enum MisusePolicy {
    /// Panic with the formatted error.
    #[default]
    Abort,
    /// Log the error and return it to the caller.
    Checked,
}

impl MisusePolicy {
    /// Applies the policy to a detected misuse.
    ///
    /// # Panics
    ///
    /// Panics with `error` when the policy is [`MisusePolicy::Abort`].
    #[track_caller]
    pub(crate) fn report<T, E>(self, error: E) -> Result<T, E>
    where
        E: core::error::Error,
    {
        match self {
            Self::Abort => panic!("memory misuse detected: {error}"),
            Self::Checked => {
                log::error!("memory misuse detected: {error}");
                Err(error)
            }
        }
    }
}

/// Errors returned by [`MemHeap`](crate::heap::MemHeap).
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(module, visibility(pub(crate)))]
#[non_exhaustive]
pub enum HeapError {
    #[snafu(display("heap alignment must be a power of two: align={align}"))]
    InvalidAlignment { align: usize },
    #[snafu(display("heap region too small: needed={needed}, actual={actual}"))]
    RegionTooSmall { needed: usize, actual: usize },
    #[snafu(display("out of heap memory: size={size}"))]
    OutOfMemory { size: usize },
    #[snafu(display("pointer not owned by this heap or already free: address={address:#x}"))]
    ForeignOrDoubleFree { address: usize },
    #[snafu(display("heap block sentinel corrupted: address={address:#x}"))]
    Corrupted { address: usize },
}

/// Errors returned by [`MemPool`](crate::pool::MemPool).
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(module, visibility(pub(crate)))]
#[non_exhaustive]
pub enum PoolError {
    #[snafu(display("invalid pool block size: block_size={block_size}"))]
    InvalidBlockSize { block_size: usize },
    #[snafu(display("pool region too small: needed={needed}, actual={actual}"))]
    RegionTooSmall { needed: usize, actual: usize },
    #[snafu(display("failed to obtain pool region from heap: {source}"))]
    Backing { source: HeapError },
    #[snafu(display("no free block in pool"))]
    OutOfMemory,
    #[snafu(display("timed out waiting for a pool block"))]
    Timeout,
    #[snafu(display("pool closed while waiting for a block"))]
    Aborted,
    #[snafu(display("pointer not owned by this pool or already free: address={address:#x}"))]
    ForeignOrDoubleFree { address: usize },
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_policy_returns_error() {
        let err = MisusePolicy::Checked.report::<(), _>(HeapError::ForeignOrDoubleFree {
            address: 0x1000,
        });
        assert_eq!(
            err,
            Err(HeapError::ForeignOrDoubleFree { address: 0x1000 })
        );
    }

    #[test]
    fn test_default_policy_aborts() {
        assert!(MisusePolicy::default().is_abort());
        assert!(!MisusePolicy::Checked.is_abort());
    }

    #[test]
    #[should_panic = "memory misuse detected"]
    fn test_abort_policy_panics() {
        let _ = MisusePolicy::Abort.report::<(), _>(PoolError::ForeignOrDoubleFree { address: 8 });
    }

    #[test]
    fn test_display() {
        let err = HeapError::RegionTooSmall {
            needed: 96,
            actual: 32,
        };
        assert_eq!(
            err.to_string(),
            "heap region too small: needed=96, actual=32"
        );
        let err = PoolError::Backing {
            source: HeapError::OutOfMemory { size: 1280 },
        };
        assert_eq!(
            err.to_string(),
            "failed to obtain pool region from heap: out of heap memory: size=1280"
        );
    }
}
