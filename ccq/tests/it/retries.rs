use std::time::Duration;

use ccq::chain::ChainId;

use crate::{Behaviour, Harness, REQUEST_TIMEOUT, RETRY_INTERVAL, assert_publication_matches};

#[ccq_macros::test]
async fn single_query(mut harness: Harness) {
    let polygon = harness.watcher(ChainId::POLYGON, Behaviour::answer());
    let mut node = harness.start();

    let request = node.query(&[ChainId::POLYGON]);
    node.submit(request.clone()).await;

    let publication = node.expect_publication().await;
    assert_publication_matches(&publication, &request);
    assert_eq!(polygon.dispatches(), 1);
    node.stop().await;
}

#[ccq_macros::test]
async fn batch_of_two(mut harness: Harness) {
    let polygon = harness.watcher(ChainId::POLYGON, Behaviour::answer());
    let bsc = harness.watcher(ChainId::BSC, Behaviour::answer());
    let mut node = harness.start();

    let request = node.query(&[ChainId::POLYGON, ChainId::BSC]);
    node.submit(request.clone()).await;

    let publication = node.expect_publication().await;
    assert_publication_matches(&publication, &request);
    assert_eq!(publication.per_chain_responses[0].chain_id, ChainId::POLYGON);
    assert_eq!(publication.per_chain_responses[1].chain_id, ChainId::BSC);
    assert_eq!(polygon.dispatches(), 1);
    assert_eq!(bsc.dispatches(), 1);
    node.stop().await;
}

#[ccq_macros::test]
async fn responses_out_of_order_are_published_in_request_order(mut harness: Harness) {
    harness.watcher(
        ChainId::POLYGON,
        Behaviour::answer().delayed(Duration::from_millis(8)),
    );
    harness.watcher(ChainId::BSC, Behaviour::answer().delayed(Duration::ZERO));
    harness.watcher(
        ChainId::ETHEREUM,
        Behaviour::answer().delayed(Duration::from_millis(4)),
    );
    let mut node = harness.start();

    let request = node.query(&[ChainId::POLYGON, ChainId::BSC, ChainId::ETHEREUM]);
    node.submit(request.clone()).await;

    let publication = node.expect_publication().await;
    assert_publication_matches(&publication, &request);
    let chains: Vec<_> = publication
        .per_chain_responses
        .iter()
        .map(|r| r.chain_id)
        .collect();
    assert_eq!(chains, vec![ChainId::POLYGON, ChainId::BSC, ChainId::ETHEREUM]);
    node.stop().await;
}

#[ccq_macros::test]
async fn limited_retries_succeed(mut harness: Harness) {
    let polygon = harness.watcher(ChainId::POLYGON, Behaviour::retries(2));
    let mut node = harness.start();

    let request = node.query(&[ChainId::POLYGON]);
    node.submit(request.clone()).await;

    let publication = node.expect_publication().await;
    assert_publication_matches(&publication, &request);
    assert_eq!(polygon.dispatches(), 3);
    node.stop().await;
}

#[ccq_macros::test]
async fn retries_on_multiple_chains(mut harness: Harness) {
    let polygon = harness.watcher(ChainId::POLYGON, Behaviour::retries(2));
    let bsc = harness.watcher(ChainId::BSC, Behaviour::retries(3));
    let mut node = harness.start();

    let request = node.query(&[ChainId::POLYGON, ChainId::BSC]);
    node.submit(request.clone()).await;

    let publication = node.expect_publication().await;
    assert_publication_matches(&publication, &request);
    assert_eq!(polygon.dispatches(), 3);
    assert_eq!(bsc.dispatches(), 4);
    node.stop().await;
}

#[ccq_macros::test]
async fn ignored_query_is_dispatched_again(mut harness: Harness) {
    let polygon = harness.watcher(ChainId::POLYGON, Behaviour::ignore(1));
    let mut node = harness.start();

    let request = node.query(&[ChainId::POLYGON]);
    node.submit(request.clone()).await;

    let publication = node.expect_publication().await;
    assert_publication_matches(&publication, &request);
    assert_eq!(polygon.dispatches(), 2);
    node.stop().await;
}

#[ccq_macros::test]
async fn too_many_retries_times_out(mut harness: Harness) {
    let polygon = harness.watcher(ChainId::POLYGON, Behaviour::retries(2));
    let bsc = harness.watcher(ChainId::BSC, Behaviour::retries(1000));
    let mut node = harness.start();

    let request = node.query(&[ChainId::POLYGON, ChainId::BSC]);
    node.submit(request).await;

    node.expect_no_publication().await;
    assert_eq!(polygon.dispatches(), 3);
    let max_dispatches =
        (REQUEST_TIMEOUT.as_millis() / RETRY_INTERVAL.as_millis()) as usize + 1;
    let bsc_dispatches = bsc.dispatches();
    assert!(
        (2..=max_dispatches).contains(&bsc_dispatches),
        "{bsc_dispatches} dispatches to a chain which never succeeds"
    );

    // Nothing more is sent once the request has been dropped.
    tokio::time::sleep(REQUEST_TIMEOUT).await;
    assert_eq!(bsc.dispatches(), bsc_dispatches);
    node.stop().await;
}

#[ccq_macros::test]
async fn fatal_error_drops_the_request(mut harness: Harness) {
    let polygon = harness.watcher(ChainId::POLYGON, Behaviour::answer());
    let bsc = harness.watcher(ChainId::BSC, Behaviour::fatal());
    let mut node = harness.start();

    let request = node.query(&[ChainId::POLYGON, ChainId::BSC]);
    node.submit(request).await;

    node.expect_no_publication().await;
    assert_eq!(polygon.dispatches(), 1);
    assert_eq!(bsc.dispatches(), 1);
    node.stop().await;
}

#[ccq_macros::test]
async fn duplicate_submission_is_published_once(mut harness: Harness) {
    let polygon = harness.watcher(ChainId::POLYGON, Behaviour::retries(1));
    let mut node = harness.start();

    let request = node.query(&[ChainId::POLYGON]);
    node.submit(request.clone()).await;
    node.submit(request.clone()).await;

    let publication = node.expect_publication().await;
    assert_publication_matches(&publication, &request);
    node.expect_no_publication().await;
    assert_eq!(polygon.dispatches(), 2);
    node.stop().await;
}
