//! Cooperative cancellation for slow operations

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag checked inside key derivation loops and between body blocks.
///
/// Clones observe the same flag, so a caller can keep one half and hand the
/// other to a worker thread running the reader or writer.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; every clone sees it
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Checkpoint: `Err(CancellationRequested)` once cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::CancellationRequested)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let token = CancellationToken::new();
        let worker = token.clone();
        assert!(worker.check().is_ok());

        token.cancel();
        assert!(worker.is_cancelled());
        assert_eq!(worker.check(), Err(Error::CancellationRequested));
    }
}
