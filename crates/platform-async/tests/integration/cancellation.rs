use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FusedStream;
use platform_async::{Cancellation, Error};
use tokio::time;

type Events = Arc<Mutex<Vec<&'static str>>>;

fn record(events: &Events, event: &'static str) -> impl FnOnce() + Send + 'static {
    let events = Arc::clone(events);
    move || events.lock().unwrap().push(event)
}

#[test]
fn test_parent_cancels_children_but_not_the_other_way_around() {
    platform_async_test::setup();

    let parent = Cancellation::new();
    let child = parent.derive();
    let sibling = parent.derive();

    child.cancel_all();
    assert!(child.is_cancelled());
    assert!(!parent.is_cancelled());
    assert!(!sibling.is_cancelled());

    parent.cancel_all();
    assert!(parent.is_cancelled());
    assert!(sibling.is_cancelled());
}

#[test]
fn test_derive_from_cancelled_is_cancelled() {
    platform_async_test::setup();

    let parent = Cancellation::new();
    parent.cancel_all();
    assert!(parent.derive().is_cancelled());
    assert!(parent.derive().derive().is_cancelled());
}

#[test]
fn test_handlers_run_depth_first_in_registration_order() {
    platform_async_test::setup();

    let events = Events::default();
    let root = Cancellation::new();

    root.on_cancel(record(&events, "root 1"));
    let child = root.derive();
    child.on_cancel(record(&events, "child 1"));
    let grandchild = child.derive();
    grandchild.on_cancel(record(&events, "grandchild"));
    child.on_cancel(record(&events, "child 2"));
    root.on_cancel(record(&events, "root 2"));

    root.cancel_all();
    root.cancel_all();

    assert_eq!(
        *events.lock().unwrap(),
        ["root 1", "child 1", "grandchild", "child 2", "root 2"]
    );
}

#[test]
fn test_handlers_survive_dropped_children() {
    platform_async_test::setup();

    let events = Events::default();
    let root = Cancellation::new();
    root.derive().on_cancel(record(&events, "dropped child"));

    root.cancel_all();
    assert_eq!(*events.lock().unwrap(), ["dropped child"]);
}

#[test]
fn test_try_map_requires_a_source() {
    platform_async_test::setup();

    let cancellation = Cancellation::new();
    let missing: Option<futures::stream::Iter<std::vec::IntoIter<u32>>> = None;
    assert!(matches!(
        cancellation.try_map(missing),
        Err(Error::MissingSource)
    ));
}

#[tokio::test]
async fn test_unmounting_a_scope_ends_all_its_streams() {
    platform_async_test::setup();
    time::pause();

    let component = Cancellation::new();
    let loading = component.derive();

    let ticks = component.map(ticker(Duration::from_millis(10)));
    let mut ticks = ticks.take(100);
    let mut labels = loading.map(futures::stream::pending::<String>());

    assert_eq!(ticks.next().await, Some(()));
    assert_eq!(ticks.next().await, Some(()));

    let guard = component.drop_guard();
    drop(guard);

    assert_eq!(ticks.next().await, None);
    assert_eq!(labels.next().await, None);
    assert!(labels.is_terminated());
}

#[tokio::test]
async fn test_timeout_composed_from_cancellation() {
    platform_async_test::setup();
    time::pause();

    let cancellation = Cancellation::new();
    let deadline = cancellation.clone();
    tokio::spawn(async move {
        time::sleep(Duration::from_millis(50)).await;
        deadline.cancel_all();
    });

    let slow = cancellation.run(time::sleep(Duration::from_secs(10)));
    assert_eq!(slow.await, None);
    assert!(cancellation.is_cancelled());
}

/// A stream that ticks every `period`, starting after the first period.
fn ticker(period: Duration) -> impl futures::Stream<Item = ()> {
    futures::stream::unfold((), move |()| async move {
        time::sleep(period).await;
        Some(((), ()))
    })
}
