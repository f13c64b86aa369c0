use ccq::chain::ChainId;
use tokio::time;

use crate::{Behaviour, Harness, RETRY_INTERVAL, assert_publication_matches};

#[ccq_macros::test]
async fn publication_is_retried_until_listener_starts(mut harness: Harness) {
    harness.config.publication_channel_size = 1;
    harness.watcher(ChainId::POLYGON, Behaviour::answer());
    let mut node = harness.start();

    // The first response fills the publication channel, so the second has to wait.
    let first = node.query(&[ChainId::POLYGON]);
    let second = node.query(&[ChainId::POLYGON]);
    node.submit(first.clone()).await;
    node.submit(second.clone()).await;

    time::sleep(RETRY_INTERVAL * 3 + RETRY_INTERVAL / 2).await;
    assert_eq!(node.publisher.backlog(), 1);

    let a = node.expect_publication().await;
    let b = node.expect_publication().await;
    let mut published = [a, b];
    published.sort_by_key(|p| p.request.request_id());
    let mut expected = [first, second];
    expected.sort_by_key(|r| r.request_id());
    for (publication, request) in published.iter().zip(&expected) {
        assert_publication_matches(publication, request);
    }

    // Each response is delivered exactly once.
    node.expect_no_publication().await;
    assert_eq!(node.publisher.backlog(), 0);
    node.stop().await;
}

#[ccq_macros::test]
async fn stalled_publications_keep_completion_order(mut harness: Harness) {
    harness.config.publication_channel_size = 1;
    harness.watcher(ChainId::POLYGON, Behaviour::answer());
    harness.watcher(ChainId::BSC, Behaviour::answer());
    let mut node = harness.start();

    let requests = [
        node.query(&[ChainId::POLYGON]),
        node.query(&[ChainId::BSC, ChainId::POLYGON]),
        node.query(&[ChainId::BSC]),
    ];
    for request in &requests {
        node.submit(request.clone()).await;
        // Let each request complete before the next is submitted.
        time::sleep(RETRY_INTERVAL * 2).await;
    }
    assert_eq!(node.publisher.backlog(), 2);

    for request in &requests {
        let publication = node.expect_publication().await;
        assert_publication_matches(&publication, request);
    }
    node.expect_no_publication().await;
    node.stop().await;
}
