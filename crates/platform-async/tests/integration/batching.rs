use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use platform_async::{BatchConfig, BatchedPool, Cancellation};
use platform_async_test::{self as test, FetchLog};
use tokio::time;

/// Labels every input with a trailing `!`, failing batches that contain `"poison"`.
fn label_pool(log: &FetchLog<String>, config: BatchConfig) -> BatchedPool<String, String, String> {
    let log = log.clone();
    BatchedPool::with_config(config, move |inputs: HashSet<String>| {
        log.record(&inputs);
        let outcome = if inputs.contains("poison") {
            Err("label service unavailable".to_owned())
        } else {
            Ok(inputs
                .into_iter()
                .filter(|input| input != "unknown")
                .map(|input| {
                    let label = format!("{input}!");
                    (input, label)
                })
                .collect::<HashMap<_, _>>())
        };
        async move {
            time::sleep(Duration::from_millis(5)).await;
            outcome
        }
    })
    .unwrap()
}

#[tokio::test]
async fn test_concurrent_queries_share_one_fetch() {
    test::setup();
    time::pause();

    let log = FetchLog::default();
    let pool = label_pool(&log, BatchConfig::default());

    let (a, b, a_again) = futures::join!(
        test::first(pool.query("a".to_owned())),
        test::first(pool.query("b".to_owned())),
        test::first(pool.query("a".to_owned())),
    );

    assert_eq!(a, Some(Ok(Some("a!".to_owned()))));
    assert_eq!(b, Some(Ok(Some("b!".to_owned()))));
    assert_eq!(a_again, Some(Ok(Some("a!".to_owned()))));

    let expected: HashSet<String> = ["a", "b"].into_iter().map(String::from).collect();
    assert_eq!(log.calls(), vec![expected]);
}

#[tokio::test]
async fn test_bursts_spill_into_additional_windows() {
    test::setup();
    time::pause();

    let log = FetchLog::default();
    let pool = label_pool(&log, BatchConfig::default());

    let queries: Vec<_> = (0..150).map(|i| pool.query(format!("item-{i}"))).collect();
    let results = join_all(queries.into_iter().map(test::first)).await;

    assert_eq!(log.sizes(), vec![100, 50]);
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result, Some(Ok(Some(format!("item-{i}!")))));
    }
}

#[tokio::test]
async fn test_failures_are_isolated_per_window() {
    test::setup();
    time::pause();

    let log = FetchLog::default();
    let pool = label_pool(&log, BatchConfig::default());

    let (poison, bystander) = futures::join!(
        test::first(pool.query("poison".to_owned())),
        test::first(pool.query("bystander".to_owned())),
    );
    let error = Err("label service unavailable".to_owned());
    assert_eq!(poison, Some(error.clone()));
    assert_eq!(bystander, Some(error));

    let later = test::first(pool.query("later".to_owned())).await;
    assert_eq!(later, Some(Ok(Some("later!".to_owned()))));
    assert_eq!(log.sizes(), vec![2, 1]);
}

#[tokio::test]
async fn test_missing_key_is_not_an_error() {
    test::setup();
    time::pause();

    let log = FetchLog::default();
    let pool = label_pool(&log, BatchConfig::default());

    let unknown = test::first(pool.query("unknown".to_owned())).await;
    assert_eq!(unknown, Some(Ok(None)));
}

#[tokio::test]
async fn test_query_resolves_once() {
    test::setup();
    time::pause();

    let log = FetchLog::default();
    let pool = label_pool(&log, BatchConfig::default());

    let mut query = pool.query("a".to_owned());
    assert_eq!(query.next().await, Some(Ok(Some("a!".to_owned()))));

    // a later window carrying the same key is not observed by the finished query
    let _other = test::first(pool.query("a".to_owned())).await;
    assert_eq!(query.next().await, None);
    assert_eq!(log.sizes(), vec![1, 1]);
}

#[tokio::test]
async fn test_dropped_pool_flushes_queued_inputs() {
    test::setup();
    time::pause();

    let log = FetchLog::default();
    let pool = label_pool(&log, BatchConfig::default());

    let query = pool.query("a".to_owned());
    drop(pool);

    assert_eq!(test::first(query).await, Some(Ok(Some("a!".to_owned()))));
    assert_eq!(log.sizes(), vec![1]);
}

#[tokio::test]
async fn test_panicking_fetch_ends_queries_silently() {
    test::setup();
    time::pause();

    let pool: BatchedPool<u32, u32, String> = BatchedPool::new(|inputs: HashSet<u32>| async move {
        if !inputs.is_empty() {
            panic!("fetch exploded");
        }
        Ok(HashMap::new())
    });

    assert_eq!(test::first(pool.query(1)).await, None);
}

#[tokio::test]
async fn test_cancelled_caller_does_not_affect_batch() {
    test::setup();
    time::pause();

    let log = FetchLog::default();
    let pool = label_pool(&log, BatchConfig::default());
    let component = Cancellation::new();

    let cancelled = component.map(pool.query("a".to_owned()));
    let kept = pool.query("b".to_owned());
    component.cancel_all();

    let (cancelled, kept) = futures::join!(test::first(cancelled), test::first(kept));
    assert_eq!(cancelled, None);
    assert_eq!(kept, Some(Ok(Some("b!".to_owned()))));
    assert_eq!(log.sizes(), vec![2]);
}
