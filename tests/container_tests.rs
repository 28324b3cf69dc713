//! Container tree, pipeline dispatch, events and background processing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kiln::container::pipeline::{AccessLogValve, Valve, ValveChain};
use kiln::container::{Container, ContainerEventType, EngineAdapter};
use kiln::http::processor::Adapter;
use kiln::http::request::HttpRequest;
use kiln::http::response::HttpResponse;
use kiln::lifecycle::{Lifecycle, LifecycleState};
use kiln::KilnResult;

fn request(method: &str, uri: &str, host: Option<&str>) -> HttpRequest {
    let mut req = HttpRequest::new();
    req.method = method.to_string();
    req.uri = uri.to_string();
    req.protocol = "HTTP/1.1".to_string();
    if let Some(host) = host {
        let idx = req.headers.add_name("host".to_string());
        req.headers.set_value(idx, host.to_string());
    }
    req
}

fn echo_service() -> Arc<dyn kiln::container::pipeline::HttpService> {
    Arc::new(|req: &mut HttpRequest, res: &mut HttpResponse| {
        res.write(format!("{} {}", req.method, req.uri).as_bytes());
        Ok(())
    })
}

/// engine -> host "localhost" -> context "" -> wrapper "default".
fn simple_tree() -> Arc<Container> {
    let engine = Container::new_engine("test-engine", "localhost");
    let host = Container::new_host("localhost");
    let context = Container::new_context("");
    let wrapper = Container::new_wrapper("default", echo_service());
    context.add_servlet_mapping("/", "default");
    context.add_child(wrapper).unwrap();
    host.add_child(context).unwrap();
    engine.add_child(host).unwrap();
    engine.start().unwrap();
    engine
}

#[test]
fn dispatch_reaches_the_default_servlet() {
    let engine = simple_tree();
    let adapter = EngineAdapter::new(engine.clone());
    let mut req = request("GET", "/anything", Some("localhost"));
    let mut res = HttpResponse::new();
    adapter.service(&mut req, &mut res).unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.body(), b"GET /anything");
    engine.stop().unwrap();
}

#[test]
fn unknown_host_falls_back_to_default_host() {
    let engine = simple_tree();
    let adapter = EngineAdapter::new(engine.clone());
    let mut req = request("GET", "/x", Some("nonexistent.example"));
    let mut res = HttpResponse::new();
    adapter.service(&mut req, &mut res).unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(req.resolved_host.as_deref(), Some("localhost"));
    engine.stop().unwrap();
}

#[test]
fn host_header_port_is_stripped() {
    let engine = simple_tree();
    let adapter = EngineAdapter::new(engine.clone());
    let mut req = request("GET", "/x", Some("LOCALHOST:8080"));
    let mut res = HttpResponse::new();
    adapter.service(&mut req, &mut res).unwrap();
    assert_eq!(res.status, 200);
    engine.stop().unwrap();
}

#[test]
fn longest_context_prefix_wins() {
    let engine = Container::new_engine("e", "h");
    let host = Container::new_host("h");

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_api = seen.clone();
    let api_ctx = Container::new_context("/api");
    let api_wrapper = Container::new_wrapper(
        "api",
        Arc::new(move |_req: &mut HttpRequest, _res: &mut HttpResponse| {
            seen_api.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    api_ctx.add_servlet_mapping("/", "api");
    api_ctx.add_child(api_wrapper).unwrap();

    let root_ctx = Container::new_context("");
    let root_wrapper = Container::new_wrapper("root", echo_service());
    root_ctx.add_servlet_mapping("/", "root");
    root_ctx.add_child(root_wrapper).unwrap();

    host.add_child(api_ctx).unwrap();
    host.add_child(root_ctx).unwrap();
    engine.add_child(host).unwrap();
    engine.start().unwrap();

    let adapter = EngineAdapter::new(engine.clone());
    let mut req = request("GET", "/api/items", Some("h"));
    let mut res = HttpResponse::new();
    adapter.service(&mut req, &mut res).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    engine.stop().unwrap();
}

#[test]
fn servlet_mapping_prefers_exact_then_prefix_then_default() {
    let ctx = Container::new_context("");
    ctx.add_servlet_mapping("/exact", "a");
    ctx.add_servlet_mapping("/files/*", "b");
    ctx.add_servlet_mapping("/", "c");
    assert_eq!(ctx.map_servlet("/exact").as_deref(), Some("a"));
    assert_eq!(ctx.map_servlet("/files/x/y").as_deref(), Some("b"));
    assert_eq!(ctx.map_servlet("/files").as_deref(), Some("b"));
    assert_eq!(ctx.map_servlet("/other").as_deref(), Some("c"));
}

#[test]
fn child_names_must_be_unique() {
    let host = Container::new_host("h");
    host.add_child(Container::new_context("/a")).unwrap();
    let dup = Container::new_context("/a");
    assert!(host.add_child(dup).is_err());
}

#[test]
fn add_child_to_started_parent_starts_the_child() {
    let host = Container::new_host("h");
    host.start().unwrap();
    let ctx = Container::new_context("/late");
    host.add_child(ctx.clone()).unwrap();
    assert_eq!(ctx.state(), LifecycleState::Started);
    host.stop().unwrap();
    assert_eq!(ctx.state(), LifecycleState::Stopped);
}

#[test]
fn container_events_fire_for_children_and_valves() {
    let host = Container::new_host("h");
    let events = Arc::new(AtomicUsize::new(0));
    let events2 = events.clone();
    host.add_listener(Arc::new(move |_c, event, _data| {
        if matches!(
            event,
            ContainerEventType::AddChild | ContainerEventType::AddValve
        ) {
            events2.fetch_add(1, Ordering::SeqCst);
        }
    }));
    host.add_child(Container::new_context("/x")).unwrap();
    host.pipeline().add_valve(Arc::new(AccessLogValve));
    assert_eq!(events.load(Ordering::SeqCst), 2);
}

#[test]
fn listener_may_add_listeners_during_dispatch() {
    let host = Container::new_host("h");
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();
    let host2 = host.clone();
    host.add_listener(Arc::new(move |_c, _event, _data| {
        // Mutating the listener list mid-dispatch must not deadlock.
        host2.add_listener(Arc::new(|_c, _e, _d| {}));
        fired2.fetch_add(1, Ordering::SeqCst);
    }));
    host.fire_container_event(ContainerEventType::Start, None);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

struct CountingValve {
    calls: Arc<AtomicUsize>,
    background_calls: Arc<AtomicUsize>,
}

impl Valve for CountingValve {
    fn name(&self) -> &str {
        "counting"
    }

    fn invoke(
        &self,
        request: &mut HttpRequest,
        response: &mut HttpResponse,
        chain: &ValveChain,
    ) -> KilnResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        chain.invoke_next(request, response)
    }

    fn background_process(&self) {
        self.background_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn configured_valves_run_before_the_basic_valve() {
    let engine = simple_tree();
    let calls = Arc::new(AtomicUsize::new(0));
    let background_calls = Arc::new(AtomicUsize::new(0));
    engine.pipeline().add_valve(Arc::new(CountingValve {
        calls: calls.clone(),
        background_calls: background_calls.clone(),
    }));

    let adapter = EngineAdapter::new(engine.clone());
    let mut req = request("GET", "/v", Some("localhost"));
    let mut res = HttpResponse::new();
    adapter.service(&mut req, &mut res).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(res.body(), b"GET /v");

    // A background pass reaches every valve of the container.
    engine.background_process();
    assert_eq!(background_calls.load(Ordering::SeqCst), 1);
    engine.stop().unwrap();
}

#[test]
fn remove_valve_keeps_the_basic_valve() {
    let engine = simple_tree();
    engine.pipeline().add_valve(Arc::new(AccessLogValve));
    engine.pipeline().remove_valve("access-log");
    // Dispatch still works: the basic valve is untouchable.
    let adapter = EngineAdapter::new(engine.clone());
    let mut req = request("GET", "/still", Some("localhost"));
    let mut res = HttpResponse::new();
    adapter.service(&mut req, &mut res).unwrap();
    assert_eq!(res.body(), b"GET /still");
    engine.stop().unwrap();
}

#[test]
fn stopped_engine_answers_503() {
    let engine = simple_tree();
    engine.stop().unwrap();
    let adapter = EngineAdapter::new(engine.clone());
    let mut req = request("GET", "/x", Some("localhost"));
    let mut res = HttpResponse::new();
    adapter.service(&mut req, &mut res).unwrap();
    assert_eq!(res.status, 503);
}

#[test]
fn unmapped_uri_is_404() {
    let engine = Container::new_engine("e", "h");
    let host = Container::new_host("h");
    let ctx = Container::new_context("/only");
    let wrapper = Container::new_wrapper("w", echo_service());
    ctx.add_servlet_mapping("/exact", "w");
    ctx.add_child(wrapper).unwrap();
    host.add_child(ctx).unwrap();
    engine.add_child(host).unwrap();
    engine.start().unwrap();

    let adapter = EngineAdapter::new(engine.clone());
    let mut req = request("GET", "/only/miss", Some("h"));
    let mut res = HttpResponse::new();
    adapter.service(&mut req, &mut res).unwrap();
    assert_eq!(res.status, 404);
    engine.stop().unwrap();
}

#[test]
fn background_processor_ticks_the_tree() {
    let host = Container::new_host("bg-host");
    let calls = Arc::new(AtomicUsize::new(0));
    let background_calls = Arc::new(AtomicUsize::new(0));
    host.pipeline().add_valve(Arc::new(CountingValve {
        calls,
        background_calls: background_calls.clone(),
    }));
    host.set_background_processor_delay(1);
    host.start().unwrap();

    // Two periods plus slack.
    std::thread::sleep(std::time::Duration::from_millis(2500));
    host.stop().unwrap();
    assert!(background_calls.load(Ordering::SeqCst) >= 1);
}
