use alloy::primitives::Bytes;
use ccq::{chain::ChainId, crypto::SecretKey};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{Behaviour, Harness, assert_publication_matches};

#[ccq_macros::test]
async fn invalid_queries_are_dropped(mut harness: Harness) {
    let polygon = harness.watcher(ChainId::POLYGON, Behaviour::answer());
    let mut node = harness.start();

    // Corrupted signature.
    let mut request = node.query(&[ChainId::POLYGON]);
    let mut signature = request.signature.to_vec();
    signature[10] ^= 0xff;
    request.signature = Bytes::from(signature);
    node.submit(request).await;

    // Not an allowed requester.
    let stranger = SecretKey::new_from_rng(&mut ChaCha8Rng::seed_from_u64(u64::MAX));
    let request = node.query_signed_by(&stranger, &[ChainId::POLYGON]);
    node.submit(request).await;

    // Algorand does not support queries.
    let request = node.query(&[ChainId::POLYGON, ChainId::ALGORAND]);
    node.submit(request).await;

    // Sepolia supports queries, but nothing is watching it.
    let request = node.query(&[ChainId::SEPOLIA]);
    node.submit(request).await;

    node.expect_no_publication().await;
    assert_eq!(polygon.dispatches(), 0);

    // The handler is still healthy.
    let request = node.query(&[ChainId::POLYGON]);
    node.submit(request.clone()).await;
    let publication = node.expect_publication().await;
    assert_publication_matches(&publication, &request);
    node.stop().await;
}
