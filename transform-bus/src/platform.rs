use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::TransformError;
use crate::transform::TransformProvider;

static ACTIVE_LEASES: AtomicUsize = AtomicUsize::new(0);

/// Number of sessions currently holding the media platform.
pub fn active_leases() -> usize {
    ACTIVE_LEASES.load(Ordering::SeqCst)
}

/// One session's hold on the platform media subsystem.
/// The subsystem is shut down again when the lease is dropped.
pub struct PlatformLease {
    provider: Arc<dyn TransformProvider>,
}

impl PlatformLease {
    pub fn acquire(provider: Arc<dyn TransformProvider>) -> Result<Self, TransformError> {
        provider.startup()?;
        let active = ACTIVE_LEASES.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("media platform acquired, active leases: {}", active);
        Ok(Self { provider })
    }
}

impl Drop for PlatformLease {
    fn drop(&mut self) {
        self.provider.shutdown();
        let active = ACTIVE_LEASES.fetch_sub(1, Ordering::SeqCst) - 1;
        log::debug!("media platform released, active leases: {}", active);
    }
}
