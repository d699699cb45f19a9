use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future;
use leadcache::cache::{
    FetchContext, PrefetchConfig, PrefetchPriority, PrefetchQueue, QueryClient, QueryOptions,
    SetDataOptions,
};
use leadcache::query_key;
use tokio::time::sleep;

#[derive(Debug, thiserror::Error)]
#[error("lead api error")]
struct LeadApiError;

fn queue_with(client: &QueryClient, batch_limit: usize) -> Arc<PrefetchQueue> {
    Arc::new(PrefetchQueue::new(
        client.clone(),
        PrefetchConfig {
            batch_limit,
            concurrency: 2,
            interval: Duration::from_millis(500),
        },
    ))
}

#[tokio::test(start_paused = true)]
async fn auto_drain_warms_the_cache_on_its_cadence() {
    let client = QueryClient::default();
    let queue = queue_with(&client, 1);
    for page in 1..=3_u32 {
        queue.enqueue(
            query_key!["leads", "page", page],
            move |_| future::ready(Ok::<_, LeadApiError>(page)),
            QueryOptions::default(),
            PrefetchPriority::Normal,
        );
    }

    let drainer = queue.spawn_auto_drain();

    // The first tick fires immediately and takes one request.
    sleep(Duration::from_millis(10)).await;
    assert_eq!(queue.len(), 2);

    sleep(Duration::from_millis(1000)).await;
    assert!(queue.is_empty());
    for page in 1..=3_u32 {
        let data = client
            .get_query_data::<u32>(&query_key!["leads", "page", page])
            .expect("typed");
        assert_eq!(data.as_deref(), Some(&page));
    }

    drainer.abort();
}

#[tokio::test(start_paused = true)]
async fn auto_drain_stops_when_the_queue_is_dropped() {
    let client = QueryClient::default();
    let queue = queue_with(&client, 8);

    let drainer = queue.spawn_auto_drain();
    drop(queue);
    sleep(Duration::from_millis(600)).await;

    assert!(drainer.is_finished());
}

#[tokio::test(start_paused = true)]
async fn fresh_entries_are_not_refetched_by_prefetch() {
    let client = QueryClient::default();
    let key = query_key!["contacts", 1];
    client
        .set_query_value(&key, 10_u32, SetDataOptions::default())
        .expect("seed");
    let calls = Arc::new(AtomicUsize::new(0));
    let queue = queue_with(&client, 8);

    let counter = Arc::clone(&calls);
    queue.enqueue(
        key.clone(),
        move |_: FetchContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok::<_, LeadApiError>(11_u32))
        },
        QueryOptions::default().stale_time(Duration::from_secs(60)),
        PrefetchPriority::Low,
    );
    queue.drain().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        client.get_query_data::<u32>(&key).expect("typed").as_deref(),
        Some(&10)
    );
}
