use crate::error::{Result, WardenError};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Source of resident-memory samples for a PID
pub trait MemoryProbe: Send + Sync + 'static {
    /// Resident memory of `pid` in bytes
    ///
    /// # Returns
    /// * `Err(WardenError::SampleError)` - The process is gone or unreadable
    fn sample(&self, pid: u32) -> Result<u64>;
}

/// Probe backed by the OS process table (via sysinfo)
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemProbe {
    fn sample(&self, pid: u32) -> Result<u64> {
        let sys_pid = Pid::from_u32(pid);
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);

        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        system
            .process(sys_pid)
            .map(|process| process.memory())
            .ok_or_else(|| WardenError::SampleError(pid, "process not found".to_string()))
    }
}

/// The ceiling was exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBreach {
    pub rss: u64,
    pub limit: u64,
}

/// Periodic memory check for one running process
pub struct MemoryWatchdog {
    pid: u32,
    limit: u64,
    period: Duration,
    probe: Arc<dyn MemoryProbe>,
}

impl MemoryWatchdog {
    pub fn new(pid: u32, limit: u64, period: Duration, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            pid,
            limit,
            period,
            probe,
        }
    }

    /// Sample every period until the ceiling is exceeded.
    ///
    /// Resolves once, with the offending sample; a watchdog is consumed by
    /// its running episode and cannot fire twice. Failed samples are skipped.
    /// `on_sample` sees every successful sample.
    pub fn watch<F>(self, mut on_sample: F) -> impl Future<Output = MemoryBreach>
    where
        F: FnMut(u64),
    {
        async move {
            let mut ticker = interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match self.probe.sample(self.pid) {
                    Ok(rss) => {
                        trace!(pid = self.pid, rss, limit = self.limit, "memory sample");
                        on_sample(rss);
                        if rss > self.limit {
                            warn!(
                                pid = self.pid,
                                rss,
                                limit = self.limit,
                                "memory ceiling exceeded"
                            );
                            return MemoryBreach {
                                rss,
                                limit: self.limit,
                            };
                        }
                    }
                    Err(e) => {
                        // The exit wait reports a vanished process
                        debug!(pid = self.pid, "skipping memory sample: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use tokio::process::Command;

    /// Returns whatever value the test stores; 0 means "process gone"
    struct FixedProbe {
        rss: AtomicU64,
        calls: AtomicUsize,
    }

    impl MemoryProbe for FixedProbe {
        fn sample(&self, pid: u32) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.rss.load(Ordering::SeqCst) {
                0 => Err(WardenError::SampleError(pid, "gone".to_string())),
                rss => Ok(rss),
            }
        }
    }

    fn fixed_probe(rss: u64) -> Arc<FixedProbe> {
        Arc::new(FixedProbe {
            rss: AtomicU64::new(rss),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_system_probe_samples_live_process() {
        let mut child = Command::new("/bin/sleep")
            .arg("5")
            .spawn()
            .expect("Failed to spawn process");
        let pid = child.id().expect("Failed to get PID");

        let probe = SystemProbe::new();
        assert!(probe.sample(pid).unwrap() > 0);

        child.kill().await.expect("Failed to kill process");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            probe.sample(pid),
            Err(WardenError::SampleError(..))
        ));
    }

    #[tokio::test]
    async fn test_watchdog_fires_above_limit() {
        let probe = fixed_probe(1_200);
        let watchdog = MemoryWatchdog::new(1, 1_000, Duration::from_millis(10), probe.clone());

        let breach = tokio::time::timeout(Duration::from_secs(1), watchdog.watch(|_| {}))
            .await
            .expect("watchdog should fire");
        assert_eq!(
            breach,
            MemoryBreach {
                rss: 1_200,
                limit: 1_000
            }
        );
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watchdog_quiet_at_or_below_limit() {
        let probe = fixed_probe(1_000);
        let watchdog = MemoryWatchdog::new(1, 1_000, Duration::from_millis(10), probe.clone());

        let mut seen = Vec::new();
        let result = tokio::time::timeout(
            Duration::from_millis(100),
            watchdog.watch(|rss| seen.push(rss)),
        )
        .await;

        assert!(result.is_err());
        assert!(probe.calls.load(Ordering::SeqCst) >= 2);
        assert!(seen.iter().all(|&rss| rss == 1_000));
    }

    #[tokio::test]
    async fn test_watchdog_ignores_failed_samples() {
        let probe = fixed_probe(0);
        let watchdog = MemoryWatchdog::new(1, 1_000, Duration::from_millis(10), probe.clone());
        let watching = tokio::spawn(watchdog.watch(|_| {}));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!watching.is_finished());

        probe.rss.store(5_000, Ordering::SeqCst);
        let breach = tokio::time::timeout(Duration::from_secs(1), watching)
            .await
            .expect("watchdog should fire")
            .unwrap();
        assert_eq!(breach.rss, 5_000);
    }
}
