//! Periodic housekeeping: walks a container subtree invoking
//! `background_process` at each level whose own delay is <= 0 (levels
//! with a positive delay run their own processor).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::trace;

use super::Container;

pub struct BackgroundProcessor {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundProcessor {
    pub fn start(root: Weak<Container>, delay_secs: u64) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = thread::Builder::new()
            .name("kiln-background".to_string())
            .spawn(move || run(root, delay_secs.max(1), &flag))
            .ok();
        Self {
            shutdown,
            handle,
        }
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(root: Weak<Container>, delay_secs: u64, shutdown: &AtomicBool) {
    trace!("background processor started");
    'outer: loop {
        // Sleep in small slices so stop() is prompt.
        let mut remaining_ms = delay_secs * 1000;
        while remaining_ms > 0 {
            if shutdown.load(Ordering::Acquire) {
                break 'outer;
            }
            let slice = remaining_ms.min(100);
            thread::sleep(Duration::from_millis(slice));
            remaining_ms -= slice;
        }
        let Some(container) = root.upgrade() else {
            break;
        };
        process_tree(&container);
    }
    trace!("background processor exiting");
}

fn process_tree(container: &Arc<Container>) {
    container.background_process();
    for child in container.children() {
        // Levels with their own positive delay run their own processor.
        if child.background_processor_delay() <= 0 {
            process_tree(&child);
        }
    }
}
