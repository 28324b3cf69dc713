use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{KilnError, KilnResult};

/// Shared state machine implemented by the endpoint, containers, pipelines
/// and any other managed component.
///
/// NEW -> INITIALIZED -> STARTING_PREP -> STARTING -> STARTED
///     -> STOPPING_PREP -> STOPPING -> STOPPED
///     -> DESTROYING -> DESTROYED
/// FAILED is reachable from any transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    New,
    Initialized,
    StartingPrep,
    Starting,
    Started,
    StoppingPrep,
    Stopping,
    Stopped,
    Destroying,
    Destroyed,
    Failed,
}

impl LifecycleState {
    /// A component is available while it is starting or started: requests
    /// may be dispatched to it.
    pub fn is_available(self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::Started)
    }
}

/// Events fired as a component moves through its lifecycle, plus the
/// periodic event fired by background processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    BeforeInit,
    AfterInit,
    BeforeStart,
    Start,
    AfterStart,
    BeforeStop,
    Stop,
    AfterStop,
    BeforeDestroy,
    AfterDestroy,
    Periodic,
}

pub type LifecycleListener = Arc<dyn Fn(LifecycleEvent) + Send + Sync>;

/// State + listener support embedded by lifecycle-managed components.
/// Listeners are stored copy-on-write so a listener may add or remove
/// listeners during dispatch.
pub struct LifecycleSupport {
    state: Mutex<LifecycleState>,
    listeners: Mutex<Arc<Vec<LifecycleListener>>>,
}

impl Default for LifecycleSupport {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleSupport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::New),
            listeners: Mutex::new(Arc::new(Vec::new())),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: LifecycleState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn add_listener(&self, listener: LifecycleListener) {
        let mut guard = self.listeners.lock().unwrap();
        let mut next = (**guard).clone();
        next.push(listener);
        *guard = Arc::new(next);
    }

    pub fn fire(&self, event: LifecycleEvent) {
        let snapshot = self.listeners.lock().unwrap().clone();
        for listener in snapshot.iter() {
            listener(event);
        }
    }

    /// Guard a transition into `from` states; anything else is a
    /// lifecycle error naming the offending state.
    fn expect(&self, allowed: &[LifecycleState], action: &str) -> KilnResult<LifecycleState> {
        let current = self.state();
        if allowed.contains(&current) {
            Ok(current)
        } else {
            Err(KilnError::Lifecycle(format!(
                "cannot {} from state {:?}",
                action, current
            )))
        }
    }
}

/// Template-method lifecycle. Implementors provide the *_internal hooks;
/// the provided methods drive states and events around them. A failing
/// hook parks the component in FAILED.
pub trait Lifecycle {
    fn lifecycle(&self) -> &LifecycleSupport;

    fn init_internal(&self) -> KilnResult<()> {
        Ok(())
    }
    fn start_internal(&self) -> KilnResult<()>;
    fn stop_internal(&self) -> KilnResult<()>;
    fn destroy_internal(&self) -> KilnResult<()> {
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle().state()
    }

    fn init(&self) -> KilnResult<()> {
        let lc = self.lifecycle();
        lc.expect(&[LifecycleState::New], "init")?;
        lc.fire(LifecycleEvent::BeforeInit);
        if let Err(e) = self.init_internal() {
            lc.set_state(LifecycleState::Failed);
            return Err(e);
        }
        lc.set_state(LifecycleState::Initialized);
        lc.fire(LifecycleEvent::AfterInit);
        Ok(())
    }

    fn start(&self) -> KilnResult<()> {
        let lc = self.lifecycle();
        let current = lc.state();
        if current == LifecycleState::Started {
            debug!("component already started");
            return Ok(());
        }
        if current == LifecycleState::New {
            self.init()?;
        } else {
            lc.expect(
                &[LifecycleState::Initialized, LifecycleState::Stopped],
                "start",
            )?;
        }
        lc.fire(LifecycleEvent::BeforeStart);
        lc.set_state(LifecycleState::StartingPrep);
        // start_internal is expected to move the state to STARTING once its
        // children are up; do it here if the hook did not.
        match self.start_internal() {
            Ok(()) => {
                if lc.state() == LifecycleState::StartingPrep {
                    lc.set_state(LifecycleState::Starting);
                }
                lc.fire(LifecycleEvent::Start);
                lc.set_state(LifecycleState::Started);
                lc.fire(LifecycleEvent::AfterStart);
                Ok(())
            }
            Err(e) => {
                lc.set_state(LifecycleState::Failed);
                Err(e)
            }
        }
    }

    fn stop(&self) -> KilnResult<()> {
        let lc = self.lifecycle();
        let current = lc.state();
        if current == LifecycleState::Stopped || current == LifecycleState::New {
            return Ok(());
        }
        lc.expect(
            &[
                LifecycleState::Started,
                LifecycleState::Starting,
                LifecycleState::Failed,
            ],
            "stop",
        )?;
        lc.fire(LifecycleEvent::BeforeStop);
        lc.set_state(LifecycleState::StoppingPrep);
        match self.stop_internal() {
            Ok(()) => {
                if lc.state() == LifecycleState::StoppingPrep {
                    lc.set_state(LifecycleState::Stopping);
                }
                lc.fire(LifecycleEvent::Stop);
                lc.set_state(LifecycleState::Stopped);
                lc.fire(LifecycleEvent::AfterStop);
                Ok(())
            }
            Err(e) => {
                lc.set_state(LifecycleState::Failed);
                Err(e)
            }
        }
    }

    fn destroy(&self) -> KilnResult<()> {
        let lc = self.lifecycle();
        let current = lc.state();
        if current == LifecycleState::Destroyed {
            return Ok(());
        }
        if current.is_available() {
            self.stop()?;
        }
        lc.fire(LifecycleEvent::BeforeDestroy);
        lc.set_state(LifecycleState::Destroying);
        match self.destroy_internal() {
            Ok(()) => {
                lc.set_state(LifecycleState::Destroyed);
                lc.fire(LifecycleEvent::AfterDestroy);
                Ok(())
            }
            Err(e) => {
                lc.set_state(LifecycleState::Failed);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Component {
        lc: LifecycleSupport,
    }

    impl Lifecycle for Component {
        fn lifecycle(&self) -> &LifecycleSupport {
            &self.lc
        }
        fn start_internal(&self) -> KilnResult<()> {
            Ok(())
        }
        fn stop_internal(&self) -> KilnResult<()> {
            Ok(())
        }
    }

    #[test]
    fn full_lifecycle_walk() {
        let c = Component {
            lc: LifecycleSupport::new(),
        };
        assert_eq!(c.state(), LifecycleState::New);
        c.start().unwrap();
        assert_eq!(c.state(), LifecycleState::Started);
        assert!(c.state().is_available());
        c.stop().unwrap();
        assert_eq!(c.state(), LifecycleState::Stopped);
        c.destroy().unwrap();
        assert_eq!(c.state(), LifecycleState::Destroyed);
    }

    #[test]
    fn stop_before_start_is_rejected() {
        let c = Component {
            lc: LifecycleSupport::new(),
        };
        c.start().unwrap();
        c.stop().unwrap();
        // Stopped again is a no-op, not an error.
        c.stop().unwrap();
        assert!(matches!(
            c.lifecycle().expect(&[LifecycleState::Started], "stop"),
            Err(KilnError::Lifecycle(_))
        ));
    }

    #[test]
    fn listeners_see_ordered_events() {
        let c = Component {
            lc: LifecycleSupport::new(),
        };
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        c.lifecycle().add_listener(Arc::new(move |ev| {
            if matches!(ev, LifecycleEvent::AfterStart) {
                seen2.fetch_add(1, Ordering::SeqCst);
            }
        }));
        c.start().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_start_parks_in_failed() {
        struct Broken {
            lc: LifecycleSupport,
        }
        impl Lifecycle for Broken {
            fn lifecycle(&self) -> &LifecycleSupport {
                &self.lc
            }
            fn start_internal(&self) -> KilnResult<()> {
                Err(KilnError::Other("boom".into()))
            }
            fn stop_internal(&self) -> KilnResult<()> {
                Ok(())
            }
        }
        let b = Broken {
            lc: LifecycleSupport::new(),
        };
        assert!(b.start().is_err());
        assert_eq!(b.state(), LifecycleState::Failed);
    }
}
