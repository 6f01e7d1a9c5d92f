use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::info;

/// Process-wide operating mode. While `Sync`, block production and normal
/// gossip relay are suppressed by their owning subsystems.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    Normal,
    Sync,
    Produce,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Normal => write!(f, "normal"),
            SyncMode::Sync => write!(f, "sync"),
            SyncMode::Produce => write!(f, "produce"),
        }
    }
}

#[derive(Debug)]
pub struct ModeFlag(AtomicU8);

impl ModeFlag {
    pub fn new(mode: SyncMode) -> Self {
        Self(AtomicU8::new(mode as u8))
    }

    pub fn mode(&self) -> SyncMode {
        match self.0.load(Ordering::SeqCst) {
            0 => SyncMode::Normal,
            1 => SyncMode::Sync,
            _ => SyncMode::Produce,
        }
    }

    pub fn set_mode(&self, mode: SyncMode) {
        let prev = self.0.swap(mode as u8, Ordering::SeqCst);
        if prev != mode as u8 {
            info!(%mode, "node mode changed");
        }
    }
}

impl Default for ModeFlag {
    fn default() -> Self {
        Self::new(SyncMode::Normal)
    }
}
