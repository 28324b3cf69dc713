//! Valves and pipelines: each container owns an ordered chain of request
//! processing valves terminated by its kind-specific basic valve.

use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::error::{KilnError, KilnResult};
use crate::http::request::HttpRequest;
use crate::http::response::HttpResponse;

use super::{Container, ContainerEventType};

/// Chain-of-responsibility cursor over a pipeline snapshot.
pub struct ValveChain<'a> {
    valves: &'a [Arc<dyn Valve>],
    index: usize,
}

impl ValveChain<'_> {
    /// Invoke the next valve in the chain. Running past the basic valve
    /// is a pipeline wiring error.
    pub fn invoke_next(&self, request: &mut HttpRequest, response: &mut HttpResponse) -> KilnResult<()> {
        match self.valves.get(self.index) {
            None => Err(KilnError::IllegalState(
                "no valve left in pipeline".to_string(),
            )),
            Some(valve) => valve.invoke(
                request,
                response,
                &ValveChain {
                    valves: self.valves,
                    index: self.index + 1,
                },
            ),
        }
    }
}

/// One request-processing stage. A valve belongs to exactly one pipeline
/// at a time.
pub trait Valve: Send + Sync {
    fn name(&self) -> &str;

    fn invoke(
        &self,
        request: &mut HttpRequest,
        response: &mut HttpResponse,
        chain: &ValveChain,
    ) -> KilnResult<()>;

    /// Periodic housekeeping driven by the background processor.
    fn background_process(&self) {}
}

/// Ordered valve chain; the basic valve is always last and is never
/// removed by configuration changes.
pub struct Pipeline {
    container: Weak<Container>,
    valves: Mutex<Vec<Arc<dyn Valve>>>,
    basic: Mutex<Option<Arc<dyn Valve>>>,
}

impl Pipeline {
    pub fn new(container: Weak<Container>) -> Self {
        Self {
            container,
            valves: Mutex::new(Vec::new()),
            basic: Mutex::new(None),
        }
    }

    /// Back-reference to the owning container.
    pub fn container_ref(&self) -> Weak<Container> {
        self.container.clone()
    }

    pub fn set_basic(&self, valve: Arc<dyn Valve>) {
        *self.basic.lock().unwrap() = Some(valve);
    }

    pub fn basic(&self) -> Option<Arc<dyn Valve>> {
        self.basic.lock().unwrap().clone()
    }

    pub fn add_valve(&self, valve: Arc<dyn Valve>) {
        self.valves.lock().unwrap().push(valve);
        if let Some(container) = self.container.upgrade() {
            container.fire_container_event(ContainerEventType::AddValve, None);
        }
    }

    pub fn remove_valve(&self, name: &str) {
        self.valves.lock().unwrap().retain(|v| v.name() != name);
        if let Some(container) = self.container.upgrade() {
            container.fire_container_event(ContainerEventType::RemoveValve, None);
        }
    }

    /// First valve of the chain (the basic valve when no other is set).
    pub fn first(&self) -> Option<Arc<dyn Valve>> {
        self.valves
            .lock()
            .unwrap()
            .first()
            .cloned()
            .or_else(|| self.basic())
    }

    /// Configured valves plus the terminal basic valve.
    pub fn snapshot(&self) -> Vec<Arc<dyn Valve>> {
        let mut valves = self.valves.lock().unwrap().clone();
        if let Some(basic) = self.basic() {
            valves.push(basic);
        }
        valves
    }

    pub fn invoke(&self, request: &mut HttpRequest, response: &mut HttpResponse) -> KilnResult<()> {
        let valves = self.snapshot();
        let chain = ValveChain {
            valves: &valves,
            index: 0,
        };
        chain.invoke_next(request, response)
    }
}

/// The application stage run by a wrapper's basic valve.
pub trait HttpService: Send + Sync {
    fn handle(&self, request: &mut HttpRequest, response: &mut HttpResponse) -> KilnResult<()>;
}

impl<F> HttpService for F
where
    F: Fn(&mut HttpRequest, &mut HttpResponse) -> KilnResult<()> + Send + Sync,
{
    fn handle(&self, request: &mut HttpRequest, response: &mut HttpResponse) -> KilnResult<()> {
        self(request, response)
    }
}

// ---- Basic valves ----

/// Engine basic valve: selects a virtual host by the Host header, falling
/// back to the engine's default host.
pub struct EngineValve {
    container: Weak<Container>,
}

impl EngineValve {
    pub fn new(container: Weak<Container>) -> Self {
        Self { container }
    }
}

impl Valve for EngineValve {
    fn name(&self) -> &str {
        "engine-valve"
    }

    fn invoke(
        &self,
        request: &mut HttpRequest,
        response: &mut HttpResponse,
        _chain: &ValveChain,
    ) -> KilnResult<()> {
        let Some(engine) = self.container.upgrade() else {
            return Err(KilnError::IllegalState("engine is gone".to_string()));
        };

        let host_header = request
            .headers
            .get("host")
            .map(|h| h.split(':').next().unwrap_or(h).to_ascii_lowercase());

        let host = host_header
            .as_deref()
            .and_then(|name| engine.find_child(name))
            .or_else(|| {
                engine
                    .default_host()
                    .and_then(|name| engine.find_child(&name))
            });

        match host {
            None => {
                debug!(host = ?host_header, "no matching virtual host");
                response.set_status(404);
                Ok(())
            }
            Some(host) => {
                request.resolved_host = Some(host.name().to_string());
                host.invoke(request, response)
            }
        }
    }
}

/// Host basic valve: selects a context by longest URI prefix.
pub struct HostValve {
    container: Weak<Container>,
}

impl HostValve {
    pub fn new(container: Weak<Container>) -> Self {
        Self { container }
    }
}

impl Valve for HostValve {
    fn name(&self) -> &str {
        "host-valve"
    }

    fn invoke(
        &self,
        request: &mut HttpRequest,
        response: &mut HttpResponse,
        _chain: &ValveChain,
    ) -> KilnResult<()> {
        let Some(host) = self.container.upgrade() else {
            return Err(KilnError::IllegalState("host is gone".to_string()));
        };

        let uri = request.uri.clone();
        let mut best: Option<(usize, Arc<Container>)> = None;
        for child in host.children() {
            let path = child.name();
            let matches = if path.is_empty() || path == "/" {
                Some(0)
            } else if uri == path || uri.starts_with(&format!("{path}/")) {
                Some(path.len())
            } else {
                None
            };
            if let Some(len) = matches {
                if best.as_ref().map(|(l, _)| len >= *l).unwrap_or(true) {
                    best = Some((len, child));
                }
            }
        }

        match best {
            None => {
                debug!(%uri, "no matching context");
                response.set_status(404);
                Ok(())
            }
            Some((_, context)) => context.invoke(request, response),
        }
    }
}

/// Context basic valve: selects a servlet wrapper by mapping (exact, then
/// `/prefix/*`, then the default mapping).
pub struct ContextValve {
    container: Weak<Container>,
}

impl ContextValve {
    pub fn new(container: Weak<Container>) -> Self {
        Self { container }
    }
}

impl Valve for ContextValve {
    fn name(&self) -> &str {
        "context-valve"
    }

    fn invoke(
        &self,
        request: &mut HttpRequest,
        response: &mut HttpResponse,
        _chain: &ValveChain,
    ) -> KilnResult<()> {
        let Some(context) = self.container.upgrade() else {
            return Err(KilnError::IllegalState("context is gone".to_string()));
        };

        let context_path = context.name().to_string();
        let relative = if context_path.is_empty() || context_path == "/" {
            request.uri.clone()
        } else {
            request.uri[context_path.len()..].to_string()
        };
        let relative = if relative.is_empty() {
            "/".to_string()
        } else {
            relative
        };

        let wrapper_name = context.map_servlet(&relative);
        let wrapper = wrapper_name.and_then(|name| context.find_child(&name));
        match wrapper {
            None => {
                debug!(uri = %request.uri, "no servlet mapping");
                response.set_status(404);
                Ok(())
            }
            Some(wrapper) => wrapper.invoke(request, response),
        }
    }
}

/// Wrapper basic valve: runs the application service.
pub struct WrapperValve {
    container: Weak<Container>,
}

impl WrapperValve {
    pub fn new(container: Weak<Container>) -> Self {
        Self { container }
    }
}

impl Valve for WrapperValve {
    fn name(&self) -> &str {
        "wrapper-valve"
    }

    fn invoke(
        &self,
        request: &mut HttpRequest,
        response: &mut HttpResponse,
        _chain: &ValveChain,
    ) -> KilnResult<()> {
        let Some(wrapper) = self.container.upgrade() else {
            return Err(KilnError::IllegalState("wrapper is gone".to_string()));
        };
        match wrapper.service() {
            None => {
                warn!(wrapper = wrapper.name(), "no service attached");
                response.set_status(404);
                Ok(())
            }
            Some(service) => service.handle(request, response),
        }
    }
}

/// Access logging valve: one line per request, including failures.
pub struct AccessLogValve;

impl Valve for AccessLogValve {
    fn name(&self) -> &str {
        "access-log"
    }

    fn invoke(
        &self,
        request: &mut HttpRequest,
        response: &mut HttpResponse,
        chain: &ValveChain,
    ) -> KilnResult<()> {
        let started = request.start_time.unwrap_or_else(Instant::now);
        let result = chain.invoke_next(request, response);
        let elapsed_ms = started.elapsed().as_millis();
        let status = if result.is_err() && !response.is_committed() {
            500
        } else {
            response.status
        };
        info!(
            method = %request.method,
            uri = %request.uri,
            query = %request.query_string,
            status,
            elapsed_ms,
            host = request.resolved_host.as_deref().unwrap_or("-"),
            "access"
        );
        result
    }
}
