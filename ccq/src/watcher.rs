//! The contract between the query handler and the per-chain watchers.
//!
//! Each watcher owns the receiving end of its own request channel and holds a clone of the single response sender
//! shared by all watchers. The handler is the only writer to request channels and the only reader of responses.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::{
    chain::ChainId,
    message::{ChainSpecificResponse, PerChainQueryRequest, RequestId},
};

/// One leg of a query, as handed to a watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerChainQueryInternal {
    pub request_id: RequestId,
    /// Position of this leg in the original request.
    pub request_idx: usize,
    pub request: PerChainQueryRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryStatus {
    Success,
    /// The watcher could not answer right now, but may be able to later.
    RetryNeeded,
    /// The query can never succeed. Abandons the whole request.
    FatalError,
}

/// A watcher's answer to a [PerChainQueryInternal].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerChainQueryResponseInternal {
    pub request_id: RequestId,
    pub request_idx: usize,
    pub chain_id: ChainId,
    pub status: QueryStatus,
    /// Only meaningful when `status` is [QueryStatus::Success].
    pub response: Option<ChainSpecificResponse>,
}

impl PerChainQueryResponseInternal {
    pub fn new(
        query: &PerChainQueryInternal,
        status: QueryStatus,
        response: Option<ChainSpecificResponse>,
    ) -> Self {
        PerChainQueryResponseInternal {
            request_id: query.request_id,
            request_idx: query.request_idx,
            chain_id: query.request.chain_id,
            status,
            response,
        }
    }

    pub fn success(query: &PerChainQueryInternal, response: ChainSpecificResponse) -> Self {
        Self::new(query, QueryStatus::Success, Some(response))
    }
}

/// The request channels of every configured watcher, keyed by chain.
#[derive(Debug, Clone, Default)]
pub struct WatcherRoutes {
    routes: HashMap<ChainId, Sender<PerChainQueryInternal>>,
}

impl WatcherRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a request channel for `chain_id`, returning the end the watcher should read from. Replaces any existing
    /// route for the chain.
    pub fn add_chain(&mut self, chain_id: ChainId, capacity: usize) -> Receiver<PerChainQueryInternal> {
        let (sender, receiver) = mpsc::channel(capacity);
        self.routes.insert(chain_id, sender);
        receiver
    }

    pub fn insert(&mut self, chain_id: ChainId, sender: Sender<PerChainQueryInternal>) {
        self.routes.insert(chain_id, sender);
    }

    pub fn get(&self, chain_id: &ChainId) -> Option<&Sender<PerChainQueryInternal>> {
        self.routes.get(chain_id)
    }

    pub fn chains(&self) -> impl Iterator<Item = ChainId> + '_ {
        self.routes.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
