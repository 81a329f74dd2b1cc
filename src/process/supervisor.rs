use crate::config::AppSpec;
use crate::error::{Result, WardenError};
use crate::process::events::{EventBus, EventStream};
use crate::process::instance::InstanceSupervisor;
use crate::process::monitor::{MemoryProbe, SystemProbe};
use crate::process::types::InstanceState;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Supervisor for every instance of one application entry.
///
/// Owns the pool `slot index → InstanceSupervisor`. Slots run independently;
/// a slot that fails never affects its siblings. The pool is only reshaped
/// by `start`/`reconfigure`, which are serialized against each other.
pub struct AppSupervisor {
    spec: RwLock<Arc<AppSpec>>,
    pool: RwLock<BTreeMap<usize, InstanceSupervisor>>,
    reconcile: Mutex<()>,
    bus: EventBus,
    probe: Arc<dyn MemoryProbe>,
}

impl AppSupervisor {
    /// Create a supervisor sampling memory from the OS process table
    ///
    /// # Returns
    /// * `Err(WardenError::InvalidSpec)` - The spec violates an invariant
    pub fn new(spec: AppSpec) -> Result<Self> {
        Self::with_probe(spec, Arc::new(SystemProbe::new()))
    }

    /// Create a supervisor with a custom memory probe
    pub fn with_probe(spec: AppSpec, probe: Arc<dyn MemoryProbe>) -> Result<Self> {
        spec.validate()?;

        Ok(Self {
            spec: RwLock::new(Arc::new(spec)),
            pool: RwLock::new(BTreeMap::new()),
            reconcile: Mutex::new(()),
            bus: EventBus::new(),
            probe,
        })
    }

    /// The spec currently in force
    pub fn spec(&self) -> Arc<AppSpec> {
        Arc::clone(&self.spec.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn name(&self) -> String {
        self.spec().name.clone()
    }

    /// Events from every slot, starting now
    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// Snapshot of every slot, ordered by slot index
    pub fn status(&self) -> Vec<InstanceState> {
        self.read_pool().values().map(|i| i.snapshot()).collect()
    }

    /// Slots the restart policy gave up on, including those stopped since
    pub fn failed_slots(&self) -> Vec<usize> {
        self.status()
            .into_iter()
            .filter(|s| s.failed_permanently)
            .map(|s| s.slot)
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.read_pool().len()
    }

    /// Receiver observing state changes of one slot
    pub fn watch_slot(&self, slot: usize) -> Result<watch::Receiver<InstanceState>> {
        self.read_pool()
            .get(&slot)
            .map(|i| i.watch_state())
            .ok_or(WardenError::SlotNotFound(slot))
    }

    /// Bring the pool to the configured size and start every idle slot
    pub async fn start(&self) -> Result<()> {
        let _guard = self.reconcile.lock().await;
        let spec = self.spec();

        self.grow(&spec);
        info!(app = %spec.name, instances = spec.instances, "starting app");

        for instance in self.read_pool().values() {
            instance.start()?;
        }
        Ok(())
    }

    /// Gracefully stop every slot and wait until all have settled
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.reconcile.lock().await;
        info!(app = %self.name(), "stopping app");

        let acks = self
            .read_pool()
            .values()
            .map(|i| Ok((i.slot(), i.request_stop()?)))
            .collect::<Result<Vec<_>>>()?;

        for (slot, ack) in acks {
            if ack.await.is_err() {
                warn!(slot, "instance supervisor went away while stopping");
            }
        }
        Ok(())
    }

    /// Restart every slot (stop, then start)
    pub async fn restart(&self) -> Result<()> {
        let _guard = self.reconcile.lock().await;
        info!(app = %self.name(), "restarting app");

        for instance in self.read_pool().values() {
            instance.restart()?;
        }
        Ok(())
    }

    /// Replace the spec and reconcile the pool to its instance count.
    ///
    /// Surviving slots keep their running process and pick the new spec up
    /// on their next spawn. Excess slots are removed from the highest index
    /// down, after being stopped.
    pub async fn reconfigure(&self, new_spec: AppSpec) -> Result<()> {
        new_spec.validate()?;
        let _guard = self.reconcile.lock().await;

        let current = self.spec();
        if new_spec.name != current.name {
            return Err(WardenError::InvalidSpec(format!(
                "cannot rename app '{}' to '{}'",
                current.name, new_spec.name
            )));
        }

        let spec = Arc::new(new_spec);
        *self.spec.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&spec);

        let size = self.instance_count();
        if size == 0 {
            // Never started; the pool is built on start
            return Ok(());
        }

        for instance in self.read_pool().values() {
            instance.update_spec(Arc::clone(&spec))?;
        }

        let target = spec.instances;
        info!(app = %spec.name, from = size, to = target, "reconciling instance pool");

        if target > size {
            let added = self.grow(&spec);
            let pool = self.read_pool();
            for slot in added {
                if let Some(instance) = pool.get(&slot) {
                    instance.start()?;
                }
            }
        } else if target < size {
            let removed = self.write_pool().split_off(&target);
            for (slot, instance) in removed {
                debug!(slot, "removing slot");
                instance.shutdown().await;
            }
        }

        Ok(())
    }

    /// Create missing slots up to the spec's instance count
    fn grow(&self, spec: &Arc<AppSpec>) -> Vec<usize> {
        let mut pool = self.write_pool();
        let mut added = Vec::new();

        for slot in pool.len()..spec.instances {
            let instance = InstanceSupervisor::spawn(
                slot,
                Arc::clone(spec),
                self.bus.clone(),
                Arc::clone(&self.probe),
            );
            pool.insert(slot, instance);
            added.push(slot);
        }
        added
    }

    fn read_pool(&self) -> RwLockReadGuard<'_, BTreeMap<usize, InstanceSupervisor>> {
        self.pool.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_pool(&self) -> RwLockWriteGuard<'_, BTreeMap<usize, InstanceSupervisor>> {
        self.pool.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::types::InstanceStatus;
    use std::time::Duration;

    fn create_test_spec(name: &str, instances: usize) -> AppSpec {
        let mut spec = AppSpec::new(name, "/bin/sleep");
        spec.args = vec!["30".to_string()];
        spec.instances = instances;
        spec.kill_timeout = 500;
        spec
    }

    async fn wait_all_running(supervisor: &AppSupervisor) {
        for slot in 0..supervisor.instance_count() {
            let mut state = supervisor.watch_slot(slot).unwrap();
            tokio::time::timeout(
                Duration::from_secs(5),
                state.wait_for(|s| s.status == InstanceStatus::Running),
            )
            .await
            .expect("timed out waiting for running")
            .unwrap();
        }
    }

    #[test]
    fn test_new_rejects_invalid_spec() {
        let result = AppSupervisor::new(create_test_spec("bad", 0));
        assert!(matches!(result, Err(WardenError::InvalidSpec(_))));
    }

    #[tokio::test]
    async fn test_pool_is_empty_until_started() {
        let supervisor = AppSupervisor::new(create_test_spec("idle", 2)).unwrap();
        assert_eq!(supervisor.instance_count(), 0);
        assert!(supervisor.status().is_empty());
        assert!(matches!(
            supervisor.watch_slot(0),
            Err(WardenError::SlotNotFound(0))
        ));
    }

    #[tokio::test]
    async fn test_start_and_stop_all_slots() {
        let supervisor = AppSupervisor::new(create_test_spec("pool", 3)).unwrap();
        supervisor.start().await.unwrap();
        wait_all_running(&supervisor).await;

        let status = supervisor.status();
        assert_eq!(
            status.iter().map(|s| s.slot).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(status.iter().all(|s| s.pid.is_some()));

        supervisor.stop().await.unwrap();
        assert!(supervisor
            .status()
            .iter()
            .all(|s| s.status == InstanceStatus::Stopped && s.pid.is_none()));
    }

    #[tokio::test]
    async fn test_start_again_after_stop() {
        let supervisor = AppSupervisor::new(create_test_spec("again", 1)).unwrap();
        supervisor.start().await.unwrap();
        wait_all_running(&supervisor).await;
        supervisor.stop().await.unwrap();

        supervisor.start().await.unwrap();
        wait_all_running(&supervisor).await;
        assert_eq!(supervisor.instance_count(), 1);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconfigure_rejects_rename() {
        let supervisor = AppSupervisor::new(create_test_spec("api", 1)).unwrap();
        let result = supervisor
            .reconfigure(create_test_spec("other", 1))
            .await;
        assert!(matches!(result, Err(WardenError::InvalidSpec(_))));
        assert_eq!(supervisor.name(), "api");
    }

    #[tokio::test]
    async fn test_reconfigure_before_start_only_swaps_spec() {
        let supervisor = AppSupervisor::new(create_test_spec("later", 1)).unwrap();
        supervisor.reconfigure(create_test_spec("later", 4)).await.unwrap();

        assert_eq!(supervisor.instance_count(), 0);
        assert_eq!(supervisor.spec().instances, 4);
    }

    #[tokio::test]
    async fn test_reconfigure_grows_pool() {
        let supervisor = AppSupervisor::new(create_test_spec("grow", 1)).unwrap();
        supervisor.start().await.unwrap();
        wait_all_running(&supervisor).await;
        let slot0_pid = supervisor.status()[0].pid;

        supervisor.reconfigure(create_test_spec("grow", 3)).await.unwrap();
        assert_eq!(supervisor.instance_count(), 3);
        wait_all_running(&supervisor).await;

        let status = supervisor.status();
        assert_eq!(status[0].pid, slot0_pid);
        assert_eq!(status[0].restarts, 0);

        supervisor.stop().await.unwrap();
    }
}
