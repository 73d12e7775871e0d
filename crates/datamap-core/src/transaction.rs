//! Nestable transactions on top of a link's raw transaction primitives.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::link::DataLink;

/// A transaction that can be started several times.
///
/// Only the outermost `start` begins an engine transaction and only the
/// matching outermost `commit` commits it. `abort` at any level rolls back
/// and resets the nesting level to zero.
pub struct NestableTransaction {
    link: Arc<dyn DataLink>,
    level: Mutex<usize>,
}

impl NestableTransaction {
    /// Create an idle transaction over `link`.
    pub fn new(link: Arc<dyn DataLink>) -> Self {
        Self {
            link,
            level: Mutex::new(0),
        }
    }

    fn lock_level(&self) -> MutexGuard<'_, usize> {
        self.level.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current nesting level; zero when idle.
    pub fn level(&self) -> usize {
        *self.lock_level()
    }

    /// Whether an engine transaction is open.
    pub fn is_active(&self) -> bool {
        self.level() > 0
    }

    /// Enter one level, beginning the engine transaction at level zero.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn start(&self) -> Result<()> {
        let mut level = self.lock_level();
        if *level == 0 {
            self.link.begin()?;
            tracing::debug!("Engine transaction started");
        }
        *level += 1;
        Ok(())
    }

    /// Leave one level, committing when the outermost level is left.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit(&self) -> Result<()> {
        let mut level = self.lock_level();
        match *level {
            0 => Err(Error::Transaction {
                message: "commit without an active transaction".to_string(),
            }),
            1 => {
                self.link.commit()?;
                *level = 0;
                tracing::debug!("Engine transaction committed");
                Ok(())
            }
            _ => {
                *level -= 1;
                Ok(())
            }
        }
    }

    /// Roll back everything, whatever the nesting level.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn abort(&self) -> Result<()> {
        let mut level = self.lock_level();
        if *level == 0 {
            return Ok(());
        }
        *level = 0;
        self.link.rollback()?;
        tracing::debug!("Engine transaction rolled back");
        Ok(())
    }
}

impl std::fmt::Debug for NestableTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestableTransaction")
            .field("engine", &self.link.engine().name)
            .field("level", &self.level())
            .finish()
    }
}
