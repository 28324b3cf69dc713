//! The container hierarchy: engine -> virtual host -> context -> servlet
//! wrapper. Each container owns a valve pipeline; request dispatch walks
//! child containers through the basic valves.

pub mod background;
pub mod pipeline;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::{debug, error, warn};

use crate::error::{KilnError, KilnResult};
use crate::http::processor::Adapter;
use crate::http::request::HttpRequest;
use crate::http::response::HttpResponse;
use crate::lifecycle::{Lifecycle, LifecycleEvent, LifecycleState, LifecycleSupport};

use background::BackgroundProcessor;
use pipeline::{ContextValve, EngineValve, HostValve, HttpService, Pipeline, WrapperValve};

/// Session-replication transport attachment point. Out of scope beyond
/// its lifecycle and background hooks.
pub trait Cluster: Send + Sync {
    fn start(&self) -> KilnResult<()> {
        Ok(())
    }
    fn stop(&self) -> KilnResult<()> {
        Ok(())
    }
    fn background_process(&self) {}
}

/// Authentication realm attachment point. Same deal as `Cluster`.
pub trait Realm: Send + Sync {
    fn start(&self) -> KilnResult<()> {
        Ok(())
    }
    fn stop(&self) -> KilnResult<()> {
        Ok(())
    }
    fn background_process(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEventType {
    AddChild,
    RemoveChild,
    AddValve,
    RemoveValve,
    Start,
    Stop,
}

pub type ContainerListener = Arc<dyn Fn(&Container, ContainerEventType, Option<&str>) + Send + Sync>;

/// Kind-specific state. The child-key semantics differ per kind: hosts
/// are keyed by name, contexts by path, wrappers by servlet name.
pub enum ContainerKind {
    Engine { default_host: Mutex<String> },
    Host,
    Context { mappings: Mutex<Vec<(String, String)>> },
    Wrapper { service: Mutex<Option<Arc<dyn HttpService>>> },
}

pub struct Container {
    name: String,
    kind: ContainerKind,
    lifecycle: LifecycleSupport,
    parent: Mutex<Weak<Container>>,
    children: Mutex<HashMap<String, Arc<Container>>>,
    pipeline: Pipeline,
    // Copy-on-write so a listener may add/remove listeners mid-dispatch.
    listeners: Mutex<Arc<Vec<ContainerListener>>>,
    realm: RwLock<Option<Arc<dyn Realm>>>,
    cluster: RwLock<Option<Arc<dyn Cluster>>>,
    background_delay_secs: AtomicI64,
    background: Mutex<Option<BackgroundProcessor>>,
}

impl Container {
    fn build(name: &str, kind: ContainerKind) -> Arc<Container> {
        let container = Arc::new_cyclic(|weak: &Weak<Container>| Container {
            name: name.to_string(),
            kind,
            lifecycle: LifecycleSupport::new(),
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(HashMap::new()),
            pipeline: Pipeline::new(weak.clone()),
            listeners: Mutex::new(Arc::new(Vec::new())),
            realm: RwLock::new(None),
            cluster: RwLock::new(None),
            background_delay_secs: AtomicI64::new(-1),
            background: Mutex::new(None),
        });
        container
    }

    pub fn new_engine(name: &str, default_host: &str) -> Arc<Container> {
        let engine = Self::build(
            name,
            ContainerKind::Engine {
                default_host: Mutex::new(default_host.to_string()),
            },
        );
        engine
            .pipeline
            .set_basic(Arc::new(EngineValve::new(Arc::downgrade(&engine))));
        engine
    }

    pub fn new_host(name: &str) -> Arc<Container> {
        let host = Self::build(name, ContainerKind::Host);
        host.pipeline
            .set_basic(Arc::new(HostValve::new(Arc::downgrade(&host))));
        host
    }

    /// Contexts are named by their URI path ("" or "/" for the root).
    pub fn new_context(path: &str) -> Arc<Container> {
        let context = Self::build(
            path,
            ContainerKind::Context {
                mappings: Mutex::new(Vec::new()),
            },
        );
        context
            .pipeline
            .set_basic(Arc::new(ContextValve::new(Arc::downgrade(&context))));
        context
    }

    pub fn new_wrapper(name: &str, service: Arc<dyn HttpService>) -> Arc<Container> {
        let wrapper = Self::build(
            name,
            ContainerKind::Wrapper {
                service: Mutex::new(Some(service)),
            },
        );
        wrapper
            .pipeline
            .set_basic(Arc::new(WrapperValve::new(Arc::downgrade(&wrapper))));
        wrapper
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn parent(&self) -> Option<Arc<Container>> {
        self.parent.lock().unwrap().upgrade()
    }

    pub fn default_host(&self) -> Option<String> {
        match &self.kind {
            ContainerKind::Engine { default_host } => Some(default_host.lock().unwrap().clone()),
            _ => None,
        }
    }

    pub fn set_default_host(&self, name: &str) {
        if let ContainerKind::Engine { default_host } = &self.kind {
            *default_host.lock().unwrap() = name.to_string();
        }
    }

    pub fn service(&self) -> Option<Arc<dyn HttpService>> {
        match &self.kind {
            ContainerKind::Wrapper { service } => service.lock().unwrap().clone(),
            _ => None,
        }
    }

    /// Register a servlet mapping on a context: exact pattern,
    /// "/prefix/*", or "/" as the default.
    pub fn add_servlet_mapping(&self, pattern: &str, wrapper_name: &str) {
        if let ContainerKind::Context { mappings } = &self.kind {
            mappings
                .lock()
                .unwrap()
                .push((pattern.to_string(), wrapper_name.to_string()));
        }
    }

    /// Resolve a context-relative path to a wrapper name: exact match
    /// first, then longest "/prefix/*", then the default mapping.
    pub fn map_servlet(&self, path: &str) -> Option<String> {
        let ContainerKind::Context { mappings } = &self.kind else {
            return None;
        };
        let mappings = mappings.lock().unwrap();

        for (pattern, name) in mappings.iter() {
            if pattern == path {
                return Some(name.clone());
            }
        }
        let mut best: Option<(usize, &str)> = None;
        for (pattern, name) in mappings.iter() {
            if let Some(prefix) = pattern.strip_suffix("/*") {
                if path == prefix || path.starts_with(&format!("{prefix}/")) {
                    let len = prefix.len();
                    if best.map(|(l, _)| len > l).unwrap_or(true) {
                        best = Some((len, name));
                    }
                }
            }
        }
        if let Some((_, name)) = best {
            return Some(name.to_string());
        }
        mappings
            .iter()
            .find(|(pattern, _)| pattern == "/")
            .map(|(_, name)| name.clone())
    }

    // ---- Tree management ----

    /// Attach a child. Names must be unique within a parent; an available
    /// parent starts the child immediately.
    pub fn add_child(self: &Arc<Self>, child: Arc<Container>) -> KilnResult<()> {
        {
            let mut children = self.children.lock().unwrap();
            if children.contains_key(child.name()) {
                return Err(KilnError::IllegalState(format!(
                    "child name [{}] is not unique",
                    child.name()
                )));
            }
            *child.parent.lock().unwrap() = Arc::downgrade(self);
            children.insert(child.name().to_string(), child.clone());
        }

        self.fire_container_event(ContainerEventType::AddChild, Some(child.name()));

        // Outside the children lock: starting can be slow.
        if self.state().is_available() || self.state() == LifecycleState::StartingPrep {
            child.start()?;
        }
        Ok(())
    }

    pub fn remove_child(self: &Arc<Self>, child: &Arc<Container>) {
        if child.state().is_available() {
            if let Err(e) = child.stop() {
                error!(child = child.name(), error = %e, "failed to stop child");
            }
        }
        if child.state() != LifecycleState::Destroying {
            if let Err(e) = child.destroy() {
                error!(child = child.name(), error = %e, "failed to destroy child");
            }
        }
        self.fire_container_event(ContainerEventType::RemoveChild, Some(child.name()));
        self.children.lock().unwrap().remove(child.name());
    }

    pub fn find_child(&self, name: &str) -> Option<Arc<Container>> {
        self.children.lock().unwrap().get(name).cloned()
    }

    pub fn children(&self) -> Vec<Arc<Container>> {
        self.children.lock().unwrap().values().cloned().collect()
    }

    // ---- Listeners and events ----

    pub fn add_listener(&self, listener: ContainerListener) {
        let mut guard = self.listeners.lock().unwrap();
        let mut next = (**guard).clone();
        next.push(listener);
        *guard = Arc::new(next);
    }

    pub fn fire_container_event(&self, event: ContainerEventType, data: Option<&str>) {
        let snapshot = self.listeners.lock().unwrap().clone();
        for listener in snapshot.iter() {
            listener(self, event, data);
        }
    }

    // ---- Realm / cluster ----

    pub fn set_realm(&self, realm: Arc<dyn Realm>) {
        *self.realm.write().unwrap() = Some(realm);
    }

    pub fn realm(&self) -> Option<Arc<dyn Realm>> {
        self.realm.read().unwrap().clone()
    }

    pub fn set_cluster(&self, cluster: Arc<dyn Cluster>) {
        *self.cluster.write().unwrap() = Some(cluster);
    }

    pub fn cluster(&self) -> Option<Arc<dyn Cluster>> {
        self.cluster.read().unwrap().clone()
    }

    // ---- Background processing ----

    pub fn set_background_processor_delay(&self, delay_secs: i64) {
        self.background_delay_secs.store(delay_secs, Ordering::Release);
    }

    pub fn background_processor_delay(&self) -> i64 {
        self.background_delay_secs.load(Ordering::Acquire)
    }

    /// One housekeeping pass: cluster, realm, then every valve.
    pub fn background_process(&self) {
        if !self.state().is_available() {
            return;
        }
        if let Some(cluster) = self.cluster() {
            cluster.background_process();
        }
        if let Some(realm) = self.realm() {
            realm.background_process();
        }
        for valve in self.pipeline.snapshot() {
            valve.background_process();
        }
        self.lifecycle.fire(LifecycleEvent::Periodic);
    }

    // ---- Request dispatch ----

    pub fn invoke(&self, request: &mut HttpRequest, response: &mut HttpResponse) -> KilnResult<()> {
        self.pipeline.invoke(request, response)
    }

    fn start_children_parallel(&self) -> KilnResult<()> {
        let children = self.children();
        if children.is_empty() {
            return Ok(());
        }
        let mut failures = 0;
        std::thread::scope(|scope| {
            let handles: Vec<_> = children
                .iter()
                .map(|child| {
                    let child = child.clone();
                    scope.spawn(move || child.start())
                })
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(container = %self.name, error = %e, "child failed to start");
                        failures += 1;
                    }
                    Err(_) => {
                        error!(container = %self.name, "child start panicked");
                        failures += 1;
                    }
                }
            }
        });
        if failures > 0 {
            Err(KilnError::Lifecycle(format!(
                "{failures} child container(s) failed to start"
            )))
        } else {
            Ok(())
        }
    }

    fn stop_children_parallel(&self) -> KilnResult<()> {
        let children = self.children();
        if children.is_empty() {
            return Ok(());
        }
        let mut failures = 0;
        std::thread::scope(|scope| {
            let handles: Vec<_> = children
                .iter()
                .map(|child| {
                    let child = child.clone();
                    scope.spawn(move || {
                        if child.state().is_available() {
                            child.stop()
                        } else {
                            Ok(())
                        }
                    })
                })
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(container = %self.name, error = %e, "child failed to stop");
                        failures += 1;
                    }
                    Err(_) => {
                        warn!(container = %self.name, "child stop panicked");
                        failures += 1;
                    }
                }
            }
        });
        if failures > 0 {
            Err(KilnError::Lifecycle(format!(
                "{failures} child container(s) failed to stop"
            )))
        } else {
            Ok(())
        }
    }
}

impl Lifecycle for Container {
    fn lifecycle(&self) -> &LifecycleSupport {
        &self.lifecycle
    }

    /// Start order: cluster, realm, children (in parallel), pipeline.
    fn start_internal(&self) -> KilnResult<()> {
        if let Some(cluster) = self.cluster() {
            cluster.start()?;
        }
        if let Some(realm) = self.realm() {
            realm.start()?;
        }

        self.start_children_parallel()?;

        self.lifecycle.set_state(LifecycleState::Starting);
        self.fire_container_event(ContainerEventType::Start, None);

        let delay = self.background_processor_delay();
        if delay > 0 {
            debug!(container = %self.name, delay, "starting background processor");
            let weak = {
                // Reconstruct a weak self-reference through the pipeline's
                // back-pointer; the pipeline holds the canonical one.
                self.pipeline().container_ref()
            };
            *self.background.lock().unwrap() =
                Some(BackgroundProcessor::start(weak, delay as u64));
        }
        Ok(())
    }

    /// Stop order: pipeline (passive), children, realm, cluster.
    fn stop_internal(&self) -> KilnResult<()> {
        if let Some(background) = self.background.lock().unwrap().take() {
            background.stop();
        }
        self.lifecycle.set_state(LifecycleState::Stopping);
        self.fire_container_event(ContainerEventType::Stop, None);

        self.stop_children_parallel()?;

        if let Some(realm) = self.realm() {
            realm.stop()?;
        }
        if let Some(cluster) = self.cluster() {
            cluster.stop()?;
        }
        Ok(())
    }

    fn destroy_internal(&self) -> KilnResult<()> {
        let children = self.children();
        for child in &children {
            if let Err(e) = child.destroy() {
                warn!(child = child.name(), error = %e, "failed to destroy child");
            }
        }
        self.children.lock().unwrap().clear();
        Ok(())
    }
}

/// Adapter wiring an engine container into the HTTP protocol layer.
pub struct EngineAdapter {
    engine: Arc<Container>,
}

impl EngineAdapter {
    pub fn new(engine: Arc<Container>) -> Self {
        Self { engine }
    }
}

impl Adapter for EngineAdapter {
    fn service(&self, request: &mut HttpRequest, response: &mut HttpResponse) -> KilnResult<()> {
        if !self.engine.state().is_available() {
            response.set_status(503);
            return Ok(());
        }
        self.engine.invoke(request, response)
    }
}
