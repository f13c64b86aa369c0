mod admission;
mod publication;
mod retries;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use alloy::primitives::{Address, B256, Bytes};
use anyhow::Result;
use ccq::{
    cfg::{Environment, QueryConfig},
    chain::ChainId,
    crypto::SecretKey,
    launcher::spawn_query_handler,
    message::{
        ChainSpecificQuery, ChainSpecificResponse, EthCallData, EthCallQueryRequest,
        EthCallQueryResponse, PerChainQueryRequest, QueryRequest, QueryResponsePublication,
        SignedQueryRequest,
    },
    publisher::PublisherHandle,
    watcher::{PerChainQueryInternal, PerChainQueryResponseInternal, QueryStatus, WatcherRoutes},
};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::{
    sync::{
        mpsc::{self, Receiver, Sender, error::TryRecvError},
        watch,
    },
    task::JoinSet,
    time,
};
use tracing::*;

const REQUEST_TIMEOUT: Duration = Duration::from_millis(100);
const RETRY_INTERVAL: Duration = Duration::from_millis(10);
/// Upper bound on how long a mock watcher waits before answering. Shorter than [RETRY_INTERVAL], so answers always
/// arrive before a leg is re-dispatched.
const MAX_REPLY_JITTER_MS: u64 = 3;

/// How a mock watcher treats each leg it is sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct Behaviour {
    /// Dispatches to drop without any answer.
    ignore: usize,
    /// Dispatches to answer with [QueryStatus::RetryNeeded], after the ignored ones.
    retries: usize,
    fatal: bool,
    /// Fixed reply delay, instead of a random one.
    delay: Option<Duration>,
}

impl Behaviour {
    pub fn answer() -> Self {
        Self::default()
    }

    pub fn retries(retries: usize) -> Self {
        Behaviour {
            retries,
            ..Default::default()
        }
    }

    pub fn ignore(ignore: usize) -> Self {
        Behaviour {
            ignore,
            ..Default::default()
        }
    }

    pub fn fatal() -> Self {
        Behaviour {
            fatal: true,
            ..Default::default()
        }
    }

    pub fn delayed(self, delay: Duration) -> Self {
        Behaviour {
            delay: Some(delay),
            ..self
        }
    }
}

/// Counts what a mock watcher has seen.
#[derive(Debug, Default)]
pub struct WatcherStats {
    dispatches: AtomicUsize,
}

impl WatcherStats {
    pub fn dispatches(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }
}

/// Builds a query handler surrounded by mock watchers. Created by `#[ccq_macros::test]`.
pub struct Harness {
    pub seed: u64,
    rng: ChaCha8Rng,
    key: SecretKey,
    pub config: QueryConfig,
    watchers: Vec<(ChainId, Behaviour, Arc<WatcherStats>)>,
}

impl Harness {
    pub fn new(mut rng: ChaCha8Rng, seed: u64) -> Self {
        let key = SecretKey::new_from_rng(&mut rng);
        let mut config = QueryConfig::new(Environment::Test, key.address().to_string());
        config.request_timeout = REQUEST_TIMEOUT;
        config.retry_interval = RETRY_INTERVAL;
        Harness {
            seed,
            rng,
            key,
            config,
            watchers: vec![],
        }
    }

    /// Adds a mock watcher for `chain_id`.
    pub fn watcher(&mut self, chain_id: ChainId, behaviour: Behaviour) -> Arc<WatcherStats> {
        let stats = Arc::new(WatcherStats::default());
        self.watchers.push((chain_id, behaviour, stats.clone()));
        stats
    }

    pub fn start(mut self) -> Node {
        let (requests_sender, requests_receiver) =
            mpsc::channel(self.config.signed_request_channel_size);
        let (responses_sender, responses_receiver) =
            mpsc::channel(self.config.response_channel_size);
        let (publications_sender, publications_receiver) =
            mpsc::channel(self.config.publication_channel_size);
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);

        let mut routes = WatcherRoutes::new();
        for (chain_id, behaviour, stats) in self.watchers {
            let requests = routes.add_chain(chain_id, self.config.chain_request_channel_size);
            let rng = ChaCha8Rng::seed_from_u64(self.rng.next_u64());
            tokio::spawn(mock_watcher(
                requests,
                responses_sender.clone(),
                behaviour,
                stats,
                rng,
            ));
        }

        let mut tasks = JoinSet::new();
        let publisher = spawn_query_handler(
            &self.config,
            routes,
            requests_receiver,
            responses_receiver,
            publications_sender,
            shutdown_receiver,
            &mut tasks,
        )
        .unwrap();

        Node {
            key: self.key,
            environment: self.config.environment,
            nonce: 0,
            requests: requests_sender,
            publications: publications_receiver,
            publisher,
            shutdown: shutdown_sender,
            tasks,
        }
    }
}

async fn mock_watcher(
    mut requests: Receiver<PerChainQueryInternal>,
    responses: Sender<PerChainQueryResponseInternal>,
    behaviour: Behaviour,
    stats: Arc<WatcherStats>,
    mut rng: ChaCha8Rng,
) {
    // Watchers see each leg dispatched to them as a fresh request, so they count attempts per leg.
    let mut attempts = std::collections::HashMap::new();

    while let Some(query) = requests.recv().await {
        stats.dispatches.fetch_add(1, Ordering::SeqCst);
        let attempt = attempts
            .entry((query.request_id, query.request_idx))
            .or_insert(0usize);
        *attempt += 1;
        let attempt = *attempt;
        trace!(request_id = %query.request_id, chain_id = %query.request.chain_id, attempt, "mock watcher received query");

        if attempt <= behaviour.ignore {
            continue;
        }
        let response = if behaviour.fatal {
            PerChainQueryResponseInternal::new(&query, QueryStatus::FatalError, None)
        } else if attempt <= behaviour.ignore + behaviour.retries {
            PerChainQueryResponseInternal::new(&query, QueryStatus::RetryNeeded, None)
        } else {
            PerChainQueryResponseInternal::success(&query, answer(&query))
        };

        let delay = behaviour
            .delay
            .unwrap_or_else(|| Duration::from_millis(rng.gen_range(0..=MAX_REPLY_JITTER_MS)));
        let responses = responses.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = responses.send(response).await;
        });
    }
}

/// The answer a mock watcher gives: each call's data echoed back, in a block named after the chain.
fn answer(query: &PerChainQueryInternal) -> ChainSpecificResponse {
    let ChainSpecificQuery::EthCall(eth_call) = &query.request.query;
    ChainSpecificResponse::EthCall(EthCallQueryResponse {
        block_number: 44_440_260,
        hash: B256::repeat_byte(query.request.chain_id.0 as u8),
        time_us: 1_704_449_944_000_000,
        results: eth_call.call_data.iter().map(|c| c.data.clone()).collect(),
    })
}

/// A running query handler, fed by a test.
pub struct Node {
    key: SecretKey,
    environment: Environment,
    nonce: u32,
    pub requests: Sender<SignedQueryRequest>,
    pub publications: Receiver<QueryResponsePublication>,
    pub publisher: PublisherHandle,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<Result<()>>,
}

impl Node {
    /// Builds a request with one eth call per chain, signed by the allowed requester.
    pub fn query(&mut self, chains: &[ChainId]) -> SignedQueryRequest {
        let key = self.key.clone();
        self.query_signed_by(&key, chains)
    }

    pub fn query_signed_by(&mut self, key: &SecretKey, chains: &[ChainId]) -> SignedQueryRequest {
        self.nonce += 1;
        let request = QueryRequest {
            nonce: self.nonce,
            per_chain_queries: chains
                .iter()
                .enumerate()
                .map(|(i, &chain_id)| PerChainQueryRequest {
                    chain_id,
                    query: ChainSpecificQuery::EthCall(EthCallQueryRequest {
                        block_id: format!("0x{:x}", 0x28d9630 + i),
                        call_data: vec![
                            EthCallData {
                                to: Address::repeat_byte(0xdd),
                                data: Bytes::from_static(&[0x06, 0xfd, 0xde, 0x03]),
                            },
                            EthCallData {
                                to: Address::repeat_byte(0xdd),
                                data: Bytes::from(vec![0x18, 0x16, 0x0d, 0xdd, i as u8]),
                            },
                        ],
                    }),
                })
                .collect(),
        };
        SignedQueryRequest::sign(&request, key, self.environment).unwrap()
    }

    pub async fn submit(&self, request: SignedQueryRequest) {
        self.requests.send(request).await.unwrap();
    }

    /// Waits for the next publication. Panics if none arrives within a few request timeouts.
    pub async fn expect_publication(&mut self) -> QueryResponsePublication {
        time::timeout(REQUEST_TIMEOUT * 5, self.publications.recv())
            .await
            .expect("timed out waiting for a publication")
            .expect("publication channel closed")
    }

    /// Waits until any in-flight request must have finished, then checks that nothing was published.
    pub async fn expect_no_publication(&mut self) {
        time::sleep(REQUEST_TIMEOUT + RETRY_INTERVAL * 2).await;
        match self.publications.try_recv() {
            Err(TryRecvError::Empty) => {}
            Ok(p) => panic!("unexpected publication for {}", p.request.request_id()),
            Err(TryRecvError::Disconnected) => panic!("publication channel closed"),
        }
    }

    pub async fn stop(mut self) {
        self.shutdown.send(true).unwrap();
        while let Some(result) = self.tasks.join_next().await {
            result.unwrap().unwrap();
        }
    }
}

/// Checks a publication echoes `request` and has one response per leg, in request order.
fn assert_publication_matches(publication: &QueryResponsePublication, request: &SignedQueryRequest) {
    assert_eq!(&publication.request, request);
    let query = QueryRequest::unmarshal(&request.query_request).unwrap();
    publication.matches(&query).unwrap();
    for (response, query) in publication
        .per_chain_responses
        .iter()
        .zip(&query.per_chain_queries)
    {
        let ChainSpecificResponse::EthCall(response) = &response.response;
        let ChainSpecificQuery::EthCall(query) = &query.query;
        assert_eq!(response.results.len(), query.call_data.len());
        for (result, call) in response.results.iter().zip(&query.call_data) {
            assert_eq!(result, &call.data);
        }
    }

    // The wire form carries the same information.
    let decoded = QueryResponsePublication::unmarshal(&publication.marshal().unwrap()).unwrap();
    assert_eq!(&decoded, publication);
}
