//! Named collection of supervised services
//!
//! The registry owns one [`TaskSupervisor`] per service name. Mutations take
//! a coarse lock that is never held across an `.await`: supervisors are
//! `Arc`s cloned out of the map before anyone waits on them.

use crate::backlog::BacklogEntry;
use crate::config::TaskSettings;
use crate::error::RegistryError;
use crate::supervisor::{SpawnHook, SupervisorOptions, TaskInfo, TaskStatus, TaskSupervisor};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Name, settings and live state of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub id: Uuid,
    pub settings: TaskSettings,
    #[serde(flatten)]
    pub info: TaskInfo,
}

/// Result of a configuration reload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadResult {
    /// Newly added services
    pub added: Vec<String>,
    /// Removed services (stopped)
    pub removed: Vec<String>,
    /// Services whose settings changed (replaced)
    pub updated: Vec<String>,
}

/// Owns every supervised service.
///
/// Create it once at startup, share it behind an `Arc`, and call
/// [`shutdown`](Self::shutdown) before exiting so no child outlives the
/// server.
pub struct ServiceRegistry {
    services: Mutex<BTreeMap<String, Arc<TaskSupervisor>>>,
    options: SupervisorOptions,
    spawn_hook: Option<Arc<dyn SpawnHook>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(SupervisorOptions::default())
    }
}

impl ServiceRegistry {
    pub fn new(options: SupervisorOptions) -> Self {
        Self {
            services: Mutex::new(BTreeMap::new()),
            options,
            spawn_hook: None,
        }
    }

    /// Install a hook applied to every task spawned by this registry
    pub fn with_spawn_hook(mut self, hook: Arc<dyn SpawnHook>) -> Self {
        self.spawn_hook = Some(hook);
        self
    }

    pub fn len(&self) -> usize {
        self.services.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.lock().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.lock().contains_key(name)
    }

    /// Service names in listing order
    pub fn names(&self) -> Vec<String> {
        self.services.lock().keys().cloned().collect()
    }

    /// Handle to one service's supervisor
    pub fn get(&self, name: &str) -> Option<Arc<TaskSupervisor>> {
        self.services.lock().get(name).cloned()
    }

    fn lookup(&self, name: &str) -> Result<Arc<TaskSupervisor>, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    fn snapshot(&self) -> Vec<(String, Arc<TaskSupervisor>)> {
        self.services
            .lock()
            .iter()
            .map(|(name, supervisor)| (name.clone(), Arc::clone(supervisor)))
            .collect()
    }

    fn new_supervisor(&self, settings: TaskSettings) -> Result<Arc<TaskSupervisor>, RegistryError> {
        let mut supervisor = TaskSupervisor::with_options(settings, self.options);
        if let Some(ref hook) = self.spawn_hook {
            supervisor = supervisor.with_spawn_hook(Arc::clone(hook));
        }
        supervisor.start_loop()?;
        Ok(Arc::new(supervisor))
    }

    /// Register a service with its loop running and the task stopped
    fn insert(
        &self,
        name: &str,
        settings: TaskSettings,
    ) -> Result<Arc<TaskSupervisor>, RegistryError> {
        let mut services = self.services.lock();
        if services.contains_key(name) {
            return Err(RegistryError::NameExists(name.to_string()));
        }

        let supervisor = self.new_supervisor(settings)?;
        services.insert(name.to_string(), Arc::clone(&supervisor));
        info!(service = name, task_id = %supervisor.id(), "Service added");
        Ok(supervisor)
    }

    /// Register every service in `services` without starting any of them.
    ///
    /// Used at startup, followed by [`autolaunch_all`](Self::autolaunch_all).
    pub fn load(&self, services: &BTreeMap<String, TaskSettings>) -> Result<(), RegistryError> {
        for (name, settings) in services {
            self.insert(name, settings.clone())?;
        }
        Ok(())
    }

    /// Add a service, starting it right away if it is flagged autolaunch
    pub async fn add(&self, name: &str, settings: TaskSettings) -> Result<(), RegistryError> {
        let supervisor = self.insert(name, settings)?;

        if supervisor.settings().autolaunch {
            if let Err(e) = supervisor.start().await {
                warn!(service = name, error = %e, "Failed to autolaunch new service");
            }
        }
        Ok(())
    }

    /// Remove a service, stopping its process and loop
    pub async fn remove(&self, name: &str) -> Result<(), RegistryError> {
        let supervisor = self
            .services
            .lock()
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        supervisor.stop_loop().await;
        info!(service = name, task_id = %supervisor.id(), "Service removed");
        Ok(())
    }

    /// Relabel a service without touching its process or backlog
    pub fn rename(&self, old: &str, new: &str) -> Result<(), RegistryError> {
        let mut services = self.services.lock();
        if !services.contains_key(old) {
            return Err(RegistryError::NotFound(old.to_string()));
        }
        if old == new {
            return Ok(());
        }
        if services.contains_key(new) {
            return Err(RegistryError::NameExists(new.to_string()));
        }

        let Some(supervisor) = services.remove(old) else {
            return Err(RegistryError::NotFound(old.to_string()));
        };
        info!(old, new, task_id = %supervisor.id(), "Service renamed");
        services.insert(new.to_string(), supervisor);
        Ok(())
    }

    /// Replace a service's settings.
    ///
    /// The old process and loop are stopped; the replacement is left
    /// stopped even if it is flagged autolaunch.
    pub async fn update_settings(
        &self,
        name: &str,
        settings: TaskSettings,
    ) -> Result<(), RegistryError> {
        let previous = {
            let mut services = self.services.lock();
            let Some(slot) = services.get_mut(name) else {
                return Err(RegistryError::NotFound(name.to_string()));
            };
            let fresh = self.new_supervisor(settings)?;
            std::mem::replace(slot, fresh)
        };

        previous.stop_loop().await;
        info!(service = name, old_task_id = %previous.id(), "Service settings updated");
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<TaskInfo, RegistryError> {
        Ok(self.lookup(name)?.start().await?)
    }

    pub async fn stop(&self, name: &str) -> Result<TaskInfo, RegistryError> {
        Ok(self.lookup(name)?.stop().await?)
    }

    pub async fn status(&self, name: &str) -> Result<TaskInfo, RegistryError> {
        Ok(self.lookup(name)?.status().await?)
    }

    pub fn backlog(&self, name: &str) -> Result<Vec<BacklogEntry>, RegistryError> {
        Ok(self.lookup(name)?.backlog())
    }

    /// Start every service flagged autolaunch
    pub async fn autolaunch_all(&self) {
        for (name, supervisor) in self.snapshot() {
            if !supervisor.settings().autolaunch {
                continue;
            }
            match supervisor.start().await {
                Ok(info) => debug!(service = %name, status = ?info.status, "Autolaunched service"),
                Err(e) => warn!(service = %name, error = %e, "Failed to autolaunch service"),
            }
        }
    }

    /// Stop every service concurrently; loops keep running
    pub async fn stop_all(&self) {
        let mut stops = JoinSet::new();
        for (name, supervisor) in self.snapshot() {
            stops.spawn(async move { (name, supervisor.stop().await) });
        }
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((name, Err(e))) => warn!(service = %name, error = %e, "Failed to stop service"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Stop task failed"),
            }
        }
    }

    /// Stop every loop (killing live processes) and empty the registry
    pub async fn shutdown(&self) {
        let services = std::mem::take(&mut *self.services.lock());
        let count = services.len();

        let mut stops = JoinSet::new();
        for (_, supervisor) in services {
            stops.spawn(async move { supervisor.stop_loop().await });
        }
        while let Some(joined) = stops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Supervisor shutdown task failed");
            }
        }
        info!(count, "All services shut down");
    }

    /// Snapshot of every service, in name order
    pub async fn list_infos(&self) -> Vec<ServiceInfo> {
        let mut infos = Vec::new();
        for (name, supervisor) in self.snapshot() {
            infos.push(service_info(name, &supervisor).await);
        }
        infos
    }

    /// Snapshot of one service
    pub async fn info(&self, name: &str) -> Result<ServiceInfo, RegistryError> {
        let supervisor = self.lookup(name)?;
        Ok(service_info(name.to_string(), &supervisor).await)
    }

    /// Bring the registry in line with a new `services` table.
    ///
    /// - Services missing from `services` are removed
    /// - New services are added (autolaunching as configured)
    /// - Services with changed settings are replaced, and restarted if they
    ///   were active or are flagged autolaunch
    /// - Unchanged services are left alone
    pub async fn apply_config(&self, services: &BTreeMap<String, TaskSettings>) -> ReloadResult {
        let mut result = ReloadResult::default();

        let current: BTreeMap<String, TaskSettings> = self
            .snapshot()
            .into_iter()
            .map(|(name, supervisor)| (name, supervisor.settings().clone()))
            .collect();

        for name in current.keys().filter(|name| !services.contains_key(*name)) {
            info!(service = %name, "Removing service (config reload)");
            match self.remove(name).await {
                Ok(()) => result.removed.push(name.clone()),
                Err(e) => warn!(service = %name, error = %e, "Failed to remove service"),
            }
        }

        for (name, settings) in services {
            match current.get(name) {
                None => {
                    info!(service = %name, "Adding service (config reload)");
                    match self.add(name, settings.clone()).await {
                        Ok(()) => result.added.push(name.clone()),
                        Err(e) => warn!(service = %name, error = %e, "Failed to add service"),
                    }
                }
                Some(old) if old != settings => {
                    let was_active = self
                        .status(name)
                        .await
                        .map(|info| info.status != TaskStatus::Stopped)
                        .unwrap_or(false);

                    if let Err(e) = self.update_settings(name, settings.clone()).await {
                        warn!(service = %name, error = %e, "Failed to update service");
                        continue;
                    }
                    if was_active || settings.autolaunch {
                        if let Err(e) = self.start(name).await {
                            warn!(service = %name, error = %e, "Failed to restart updated service");
                        }
                    }
                    result.updated.push(name.clone());
                }
                Some(_) => {}
            }
        }

        info!(
            added = result.added.len(),
            removed = result.removed.len(),
            updated = result.updated.len(),
            "Configuration reloaded"
        );
        result
    }
}

async fn service_info(name: String, supervisor: &TaskSupervisor) -> ServiceInfo {
    let info = match supervisor.status().await {
        Ok(info) => info,
        Err(e) => {
            warn!(service = %name, error = %e, "Service status unavailable");
            TaskInfo::default()
        }
    };
    ServiceInfo {
        name,
        id: supervisor.id(),
        settings: supervisor.settings().clone(),
        info,
    }
}
