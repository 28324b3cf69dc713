//! Lifecycle state machine behavior across the component kinds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kiln::container::Container;
use kiln::lifecycle::{Lifecycle, LifecycleEvent, LifecycleState};

#[test]
fn container_walks_the_full_state_machine() {
    let host = Container::new_host("walk");
    assert_eq!(host.state(), LifecycleState::New);
    host.start().unwrap();
    assert_eq!(host.state(), LifecycleState::Started);
    host.stop().unwrap();
    assert_eq!(host.state(), LifecycleState::Stopped);
    host.destroy().unwrap();
    assert_eq!(host.state(), LifecycleState::Destroyed);
}

#[test]
fn start_is_idempotent_once_started() {
    let host = Container::new_host("twice");
    host.start().unwrap();
    host.start().unwrap();
    assert_eq!(host.state(), LifecycleState::Started);
    host.stop().unwrap();
}

#[test]
fn restart_after_stop_is_allowed() {
    let host = Container::new_host("again");
    host.start().unwrap();
    host.stop().unwrap();
    host.start().unwrap();
    assert_eq!(host.state(), LifecycleState::Started);
    host.stop().unwrap();
}

#[test]
fn children_stop_with_their_parent() {
    let host = Container::new_host("parent");
    let a = Container::new_context("/a");
    let b = Container::new_context("/b");
    host.add_child(a.clone()).unwrap();
    host.add_child(b.clone()).unwrap();
    host.start().unwrap();
    assert_eq!(a.state(), LifecycleState::Started);
    assert_eq!(b.state(), LifecycleState::Started);
    host.stop().unwrap();
    assert_eq!(a.state(), LifecycleState::Stopped);
    assert_eq!(b.state(), LifecycleState::Stopped);
}

#[test]
fn destroy_cascades_to_children() {
    let host = Container::new_host("cascade");
    let child = Container::new_context("/c");
    host.add_child(child.clone()).unwrap();
    host.start().unwrap();
    host.stop().unwrap();
    host.destroy().unwrap();
    assert_eq!(child.state(), LifecycleState::Destroyed);
    assert!(host.children().is_empty());
}

#[test]
fn lifecycle_events_arrive_in_order() {
    let host = Container::new_host("events");
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let order2 = order.clone();
    host.lifecycle().add_listener(Arc::new(move |event| {
        order2.lock().unwrap().push(event);
    }));
    host.start().unwrap();
    host.stop().unwrap();

    let seen = order.lock().unwrap().clone();
    let starts = [
        LifecycleEvent::BeforeInit,
        LifecycleEvent::AfterInit,
        LifecycleEvent::BeforeStart,
        LifecycleEvent::Start,
        LifecycleEvent::AfterStart,
    ];
    assert_eq!(&seen[..5], &starts);
    assert!(seen.contains(&LifecycleEvent::BeforeStop));
    assert!(seen.contains(&LifecycleEvent::AfterStop));
}

#[test]
fn periodic_event_fires_on_background_pass() {
    let host = Container::new_host("periodic");
    host.start().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    host.lifecycle().add_listener(Arc::new(move |event| {
        if event == LifecycleEvent::Periodic {
            count2.fetch_add(1, Ordering::SeqCst);
        }
    }));
    host.background_process();
    host.background_process();
    assert_eq!(count.load(Ordering::SeqCst), 2);
    host.stop().unwrap();
}

#[test]
fn background_pass_is_a_noop_when_not_available() {
    let host = Container::new_host("idle");
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    host.lifecycle().add_listener(Arc::new(move |event| {
        if event == LifecycleEvent::Periodic {
            count2.fetch_add(1, Ordering::SeqCst);
        }
    }));
    host.background_process();
    assert_eq!(count.load(Ordering::SeqCst), 0);
}
