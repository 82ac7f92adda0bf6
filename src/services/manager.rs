//! Services manager for long-running background services.
//!
//! Services register with the manager and are started/stopped together.
//! Start order respects [dependencies](Service::dependencies); a service is only
//! started after all of its dependencies. Stop runs in the reverse order.
//!
//! Most pipeline components are a single cancellable loop, so they are wrapped
//! in a [TaskService] instead of implementing [Service] by hand.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Health status of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of a service health check.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServiceHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }
}

/// A service that can be started, stopped, restarted, and health-checked by the manager.
///
/// Use [tracing] for lifecycle logging and include the service name so logs
/// are filterable (e.g. `tracing::info!(service = %self.name(), "Started")`).
///
/// Stateless utilities (path resolver, importer, metadata extractor) do not
/// implement `Service`; they are constructed and passed where needed.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Unique name for logging and lookup (e.g. "completion_detector").
    fn name(&self) -> &str;

    /// Names of services that must be started before this one. Start order is
    /// computed from this; cycles are an error.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Start background tasks. Idempotent.
    async fn start(&self) -> Result<()>;

    /// Stop background tasks and wait for them to finish. Idempotent.
    async fn stop(&self) -> Result<()>;

    async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    /// Report current health. Used by the manager and by `/readyz`.
    async fn health(&self) -> Result<ServiceHealth> {
        Ok(ServiceHealth::healthy())
    }
}

type SpawnFn = dyn Fn(CancellationToken) -> JoinHandle<()> + Send + Sync;

/// A [Service] backed by one spawned task that exits when its token is cancelled
pub struct TaskService {
    name: String,
    dependencies: Vec<String>,
    spawn: Box<SpawnFn>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TaskService {
    /// `run` is called on every start with a fresh cancellation token
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            spawn: Box::new(move |cancel| tokio::spawn(run(cancel))),
            running: Mutex::new(None),
        }
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }
}

#[async_trait]
impl Service for TaskService {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        let handle = (self.spawn)(cancel.clone());
        *running = Some((cancel, handle));
        info!(service = %self.name, "Started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self.running.lock().take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(service = %self.name, error = %e, "Task ended abnormally");
            }
            info!(service = %self.name, "Stopped");
        }
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        let running = self.running.lock();
        Ok(match running.as_ref() {
            Some((_, handle)) if !handle.is_finished() => ServiceHealth::healthy(),
            Some(_) => ServiceHealth::unhealthy("task exited"),
            None => ServiceHealth::degraded("not started"),
        })
    }
}

/// Builder for [ServicesManager]: add services, then [build](ServicesManagerBuilder::build) or [start](ServicesManagerBuilder::start).
///
/// ```ignore
/// let services = ServicesManager::builder()
///     .add_service(Arc::new(TaskService::new("processing_worker", move |cancel| {
///         worker.clone().run(cancel)
///     })))
///     .start()
///     .await?;
/// ```
pub struct ServicesManagerBuilder {
    services: Vec<Arc<dyn Service>>,
}

impl ServicesManagerBuilder {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
        }
    }

    pub fn add_service(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Build the manager and register all services. Does not start them.
    pub async fn build(self) -> Result<Arc<ServicesManager>> {
        let manager = Arc::new(ServicesManager::new());
        for svc in self.services {
            manager.register(svc).await;
        }
        Ok(manager)
    }

    /// Build the manager and start every service in dependency order.
    pub async fn start(self) -> Result<Arc<ServicesManager>> {
        let manager = self.build().await?;
        manager.start_all().await?;
        Ok(manager)
    }
}

impl Default for ServicesManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry and lifecycle controller for services.
pub struct ServicesManager {
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
    started: RwLock<HashSet<String>>,
}

impl Default for ServicesManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServicesManager {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            started: RwLock::new(HashSet::new()),
        }
    }

    pub fn builder() -> ServicesManagerBuilder {
        ServicesManagerBuilder::new()
    }

    /// Compute start order from dependencies (topological order). Returns an error on unknown deps or cycles.
    async fn start_order(&self) -> Result<Vec<String>> {
        let guard = self.services.read().await;
        let names: HashSet<String> = guard.keys().cloned().collect();
        let mut deps: HashMap<String, Vec<String>> = HashMap::new();
        for (name, svc) in guard.iter() {
            let d = svc.dependencies();
            for dep in &d {
                if !names.contains(dep) {
                    anyhow::bail!(
                        "Service {} depends on {} which is not registered",
                        name,
                        dep
                    );
                }
            }
            deps.insert(name.clone(), d);
        }
        drop(guard);

        // Kahn's algorithm: dependencies first.
        let mut in_degree: HashMap<String, usize> = deps
            .iter()
            .map(|(name, d)| (name.clone(), d.len()))
            .collect();
        let mut dependent_on: HashMap<String, Vec<String>> =
            names.iter().map(|n| (n.clone(), Vec::new())).collect();
        for (name, d) in &deps {
            for dep in d {
                dependent_on
                    .entry(dep.clone())
                    .or_default()
                    .push(name.clone());
            }
        }
        let mut queue: Vec<String> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| n.clone())
            .collect();
        queue.sort();
        let mut order = Vec::with_capacity(names.len());
        while let Some(n) = queue.pop() {
            order.push(n.clone());
            for s in dependent_on.get(&n).map(Vec::as_slice).unwrap_or_default() {
                if let Some(deg) = in_degree.get_mut(s) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push(s.clone());
                    }
                }
            }
        }
        if order.len() != names.len() {
            anyhow::bail!("Service dependency cycle detected");
        }
        Ok(order)
    }

    /// Register a service. Does not start it. If a service with the same name
    /// exists, it is replaced (the previous instance is not stopped).
    pub async fn register(&self, service: Arc<dyn Service>) {
        let name = service.name().to_string();
        let mut guard = self.services.write().await;
        if guard.insert(name.clone(), service).is_some() {
            warn!(service = %name, "Service '{}' reregistered, overwriting previous", name);
        } else {
            info!(service = %name, "Service '{}' registered", name);
        }
    }

    /// Start all registered services in dependency order.
    pub async fn start_all(&self) -> Result<()> {
        let order = self.start_order().await?;
        for name in &order {
            let svc = {
                let g = self.services.read().await;
                g.get(name).cloned()
            };
            if let Some(s) = svc {
                if let Err(e) = s.start().await {
                    warn!(service = %name, error = %e, "Service '{}' start failed", name);
                    return Err(e).context(format!("failed to start service {}", name));
                }
                self.started.write().await.insert(name.clone());
            }
        }
        Ok(())
    }

    /// Stop all registered services in reverse dependency order (dependents first).
    pub async fn stop_all(&self) -> Result<()> {
        let order = self.start_order().await?;
        for name in order.into_iter().rev() {
            let svc = {
                let g = self.services.read().await;
                g.get(&name).cloned()
            };
            if let Some(s) = svc {
                if let Err(e) = s.stop().await {
                    warn!(service = %name, error = %e, "Service '{}' stop failed", name);
                }
                self.started.write().await.remove(&name);
            }
        }
        Ok(())
    }

    /// Restart a single service by name. Dependencies are not restarted.
    pub async fn restart_one(&self, name: &str) -> Result<()> {
        let svc = self
            .get(name)
            .await
            .ok_or_else(|| anyhow::anyhow!("Service not found: {}", name))?;
        svc.stop().await?;
        self.started.write().await.remove(name);
        svc.start().await?;
        self.started.write().await.insert(name.to_string());
        info!(service = %name, "Service '{}' restarted", name);
        Ok(())
    }

    /// Health check for all registered services. Services whose check errors
    /// are reported as [Unhealthy](HealthStatus::Unhealthy).
    pub async fn health_all(&self) -> HashMap<String, ServiceHealth> {
        let services: Vec<(String, Arc<dyn Service>)> = {
            let guard = self.services.read().await;
            guard.iter().map(|(n, s)| (n.clone(), s.clone())).collect()
        };
        let mut out = HashMap::new();
        for (name, svc) in services {
            let h = match svc.health().await {
                Ok(h) => h,
                Err(e) => ServiceHealth::unhealthy(e.to_string()),
            };
            out.insert(name, h);
        }
        out
    }

    pub async fn is_started(&self, name: &str) -> bool {
        self.started.read().await.contains(name)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        let guard = self.services.read().await;
        guard.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn waiting_task(name: &str) -> TaskService {
        TaskService::new(name, |cancel: CancellationToken| async move {
            cancel.cancelled().await;
        })
    }

    #[tokio::test]
    async fn test_start_order_puts_dependencies_first() {
        let manager = ServicesManager::builder()
            .add_service(Arc::new(waiting_task("worker").depends_on("detector")))
            .add_service(Arc::new(waiting_task("detector").depends_on("cleanup")))
            .add_service(Arc::new(waiting_task("cleanup")))
            .build()
            .await
            .unwrap();

        let order = manager.start_order().await.unwrap();
        assert_eq!(order, vec!["cleanup", "detector", "worker"]);
    }

    #[tokio::test]
    async fn test_unknown_dependency_is_an_error() {
        let manager = ServicesManager::builder()
            .add_service(Arc::new(waiting_task("worker").depends_on("missing")))
            .build()
            .await
            .unwrap();

        assert!(manager.start_all().await.is_err());
    }

    #[tokio::test]
    async fn test_cycle_is_an_error() {
        let manager = ServicesManager::builder()
            .add_service(Arc::new(waiting_task("a").depends_on("b")))
            .add_service(Arc::new(waiting_task("b").depends_on("a")))
            .build()
            .await
            .unwrap();

        assert!(manager.start_all().await.is_err());
    }

    #[tokio::test]
    async fn test_task_service_lifecycle() {
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = starts.clone();
        let svc = Arc::new(TaskService::new("loop", move |cancel: CancellationToken| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { cancel.cancelled().await }
        }));
        let manager = ServicesManager::builder()
            .add_service(svc.clone())
            .start()
            .await
            .unwrap();

        assert!(manager.is_started("loop").await);
        assert_eq!(svc.health().await.unwrap().status, HealthStatus::Healthy);

        // starting twice does not spawn a second task
        svc.start().await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        manager.restart_one("loop").await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);

        manager.stop_all().await.unwrap();
        assert!(!manager.is_started("loop").await);
        assert_eq!(svc.health().await.unwrap().status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_finished_task_reports_unhealthy() {
        let svc = TaskService::new("oneshot", |_cancel: CancellationToken| async {});
        svc.start().await.unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let health = svc.health().await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        svc.stop().await.unwrap();
    }
}
