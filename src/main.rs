use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use kiln::container::pipeline::AccessLogValve;
use kiln::container::{Container, EngineAdapter};
use kiln::http::Http11Handler;
use kiln::lifecycle::Lifecycle;
use kiln::{init_logging, Config, Endpoint, KilnResult};

fn main() {
    init_logging();

    if let Err(e) = run() {
        error!(error = %e, "fatal startup failure");
        std::process::exit(1);
    }
}

fn run() -> KilnResult<()> {
    let config = Config::from_env();
    info!(addr = %config.server_addr(), "starting kiln");

    // Container tree: engine -> host -> root context -> default servlet.
    let engine = Container::new_engine("kiln", "localhost");
    engine.pipeline().add_valve(Arc::new(AccessLogValve));

    let host = Container::new_host("localhost");
    let context = Container::new_context("");
    let wrapper = Container::new_wrapper(
        "default",
        Arc::new(
            |req: &mut kiln::http::HttpRequest, res: &mut kiln::http::HttpResponse| {
                res.set_header("Content-Type", "text/plain");
                res.write(format!("kiln: {} {}\n", req.method, req.uri).as_bytes());
                Ok(())
            },
        ),
    );
    context.add_servlet_mapping("/", "default");
    context.add_child(wrapper)?;
    host.add_child(context)?;
    engine.add_child(host)?;
    engine.start()?;

    let endpoint = Arc::new(Endpoint::new(config.clone()));
    let adapter = Arc::new(EngineAdapter::new(engine.clone()));
    endpoint.set_handler(Arc::new(Http11Handler::new(adapter, config)));
    endpoint.start()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("received SIGINT, shutting down");
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| kiln::KilnError::Other(format!("cannot install signal handler: {e}")))?;

    while !shutdown.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(200));
    }

    endpoint.stop()?;
    endpoint.destroy()?;
    engine.stop()?;
    engine.destroy()?;
    info!("kiln shut down cleanly");
    Ok(())
}
