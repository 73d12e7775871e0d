//! Background sweep of collected entities.
//!
//! The collector thread holds only a weak reference to the repository. Each
//! tick it takes the master lock and purges metadata whose entity has been
//! dropped from every identity index. Purging is best effort: with the
//! collector disabled, stale entries are simply skipped during lookups.

use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Sender, bounded, select, tick};

use crate::repository::RepositoryCore;

/// Handle to a running collector thread.
pub(crate) struct EntityCollector {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl EntityCollector {
    /// Start sweeping `repository` every `interval`.
    pub(crate) fn spawn(repository: Weak<RepositoryCore>, interval: Duration) -> std::io::Result<Self> {
        let (stop, signal) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("datamap-collector".to_string())
            .spawn(move || {
                tracing::debug!(interval_ms = interval.as_millis(), "Entity collector started");
                let ticker = tick(interval);
                loop {
                    select! {
                        // a stop message or a dropped handle
                        recv(signal) -> _ => break,
                        recv(ticker) -> _ => {
                            let Some(core) = repository.upgrade() else {
                                break;
                            };
                            core.collect();
                        }
                    }
                }
                tracing::debug!("Entity collector stopped");
            })?;
        Ok(Self { stop, handle })
    }

    /// Signal the thread and wait for it to finish.
    pub(crate) fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            tracing::warn!("Entity collector thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_stop_does_not_wait_for_tick() {
        let collector = EntityCollector::spawn(Weak::new(), Duration::from_secs(60)).unwrap();
        let started = Instant::now();
        collector.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_exits_once_repository_is_gone() {
        let collector = EntityCollector::spawn(Weak::new(), Duration::from_millis(10)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !collector.handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(collector.handle.is_finished());
        collector.stop();
    }
}
