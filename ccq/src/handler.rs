//! The query handler owns every in-flight request.
//!
//! A single task runs [QueryHandler::run]. It reacts to new signed requests, watcher responses and expiring timers one
//! at a time, so the request table needs no locking. Everything else talks to it through channels.

use std::{collections::HashMap, time::Duration};

use anyhow::Result;
use itertools::Itertools;
use tokio::{
    select,
    sync::{
        mpsc::{Receiver, error::TrySendError},
        watch,
    },
    time::{self, Instant},
};
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tracing::*;

use crate::{
    admission::{AdmissionValidator, AdmittedRequest},
    message::{
        ChainSpecificResponse, PerChainQueryResponse, QueryResponsePublication, RequestId,
        SignedQueryRequest,
    },
    metrics::QueryMetrics,
    publisher::PublisherHandle,
    timers::{Timer, TimerKind, TimerQueue},
    watcher::{PerChainQueryInternal, PerChainQueryResponseInternal, QueryStatus, WatcherRoutes},
};

/// Used to park the timer when nothing is scheduled.
const IDLE_TIMER: Duration = Duration::from_secs(60 * 60 * 24);

struct Leg {
    query: PerChainQueryInternal,
    result: Option<ChainSpecificResponse>,
    /// Bumped whenever a new redispatch timer is scheduled, or the leg completes. Older timers are ignored.
    generation: u64,
    dispatches: u32,
}

struct PendingQuery {
    signed_request: SignedQueryRequest,
    received_at: Instant,
    legs: Vec<Leg>,
    remaining: usize,
}

impl PendingQuery {
    fn new(admitted: AdmittedRequest, received_at: Instant) -> Self {
        let AdmittedRequest {
            request_id,
            signed_request,
            request,
            ..
        } = admitted;
        let legs: Vec<_> = request
            .per_chain_queries
            .into_iter()
            .enumerate()
            .map(|(request_idx, request)| Leg {
                query: PerChainQueryInternal {
                    request_id,
                    request_idx,
                    request,
                },
                result: None,
                generation: 0,
                dispatches: 0,
            })
            .collect();
        PendingQuery {
            signed_request,
            received_at,
            remaining: legs.len(),
            legs,
        }
    }

    /// Builds the publication in request order. Only valid once every leg has a result.
    fn into_publication(self) -> Option<QueryResponsePublication> {
        let per_chain_responses = self
            .legs
            .into_iter()
            .map(|leg| {
                leg.result.map(|response| PerChainQueryResponse {
                    chain_id: leg.query.request.chain_id,
                    response,
                })
            })
            .collect::<Option<Vec<_>>>()?;
        Some(QueryResponsePublication {
            request: self.signed_request,
            per_chain_responses,
        })
    }
}

pub struct QueryHandler {
    validator: AdmissionValidator,
    routes: WatcherRoutes,
    publisher: PublisherHandle,
    request_timeout: Duration,
    retry_interval: Duration,
    pending: HashMap<RequestId, PendingQuery>,
    timers: TimerQueue,
    metrics: QueryMetrics,
}

impl QueryHandler {
    pub fn new(
        validator: AdmissionValidator,
        routes: WatcherRoutes,
        publisher: PublisherHandle,
        request_timeout: Duration,
        retry_interval: Duration,
        metrics: QueryMetrics,
    ) -> Self {
        QueryHandler {
            validator,
            routes,
            publisher,
            request_timeout,
            retry_interval,
            pending: HashMap::new(),
            timers: TimerQueue::new(),
            metrics,
        }
    }

    /// Processes events until shutdown is signalled, or until the request channel has closed and every in-flight
    /// request has finished.
    pub async fn run(
        mut self,
        requests: Receiver<SignedQueryRequest>,
        responses: Receiver<PerChainQueryResponseInternal>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut requests = ReceiverStream::new(requests);
        let mut responses = ReceiverStream::new(responses);
        let mut requests_open = true;
        let mut responses_open = true;

        let timer = time::sleep(IDLE_TIMER);
        tokio::pin!(timer);

        loop {
            let next_expiry = self.timers.next_expiry();
            if let Some(at) = next_expiry {
                if timer.deadline() != at {
                    timer.as_mut().reset(at);
                }
            }

            select! {
                request = requests.next(), if requests_open => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        debug!("signed query request channel closed");
                        requests_open = false;
                    }
                },
                response = responses.next(), if responses_open => match response {
                    Some(response) => self.handle_response(response)?,
                    None => {
                        warn!("all watchers have dropped the query response channel");
                        responses_open = false;
                    }
                },
                () = &mut timer, if next_expiry.is_some() => {
                    self.handle_timers(Instant::now());
                },
                _ = shutdown.changed() => {
                    info!(in_flight = self.pending.len(), "query handler shutting down");
                    return Ok(());
                }
            }

            if !requests_open && self.pending.is_empty() {
                info!("no more query requests, query handler stopping");
                return Ok(());
            }
        }
    }

    fn handle_request(&mut self, signed_request: SignedQueryRequest) {
        self.metrics.request_received();

        let admitted = match self.validator.admit(&signed_request) {
            Ok(admitted) => admitted,
            Err(e) => {
                warn!(request_id = %signed_request.request_id(), reason = e.kind(), "dropping query request: {e}");
                self.metrics.request_rejected(e.kind());
                return;
            }
        };

        let request_id = admitted.request_id;
        if self.pending.contains_key(&request_id) {
            warn!(%request_id, "query request is already in flight, dropping duplicate");
            self.metrics.request_rejected("duplicate");
            return;
        }

        let now = Instant::now();
        info!(
            %request_id,
            signer = %admitted.signer,
            nonce = admitted.request.nonce,
            chains = %admitted.request.per_chain_queries.iter().map(|q| q.chain_id).join(","),
            "received query request"
        );
        self.timers
            .schedule(now + self.request_timeout, request_id, TimerKind::Deadline);
        let pending = PendingQuery::new(admitted, now);
        let legs = pending.legs.len();
        self.pending.insert(request_id, pending);
        for request_idx in 0..legs {
            self.dispatch(request_id, request_idx, now);
        }
    }

    /// Sends a leg to its watcher and arms the timer that sends it again if no answer arrives in time. Never blocks: if
    /// the watcher's channel is full the timer covers that too.
    fn dispatch(&mut self, request_id: RequestId, request_idx: usize, now: Instant) {
        let Some(leg) = self
            .pending
            .get_mut(&request_id)
            .and_then(|p| p.legs.get_mut(request_idx))
        else {
            return;
        };
        let chain_id = leg.query.request.chain_id;

        match self.routes.get(&chain_id) {
            Some(route) => match route.try_send(leg.query.clone()) {
                Ok(()) => {
                    leg.dispatches += 1;
                    self.metrics.leg_dispatched(chain_id);
                    debug!(%request_id, %chain_id, request_idx, attempt = leg.dispatches, "forwarded query request to watcher");
                }
                Err(TrySendError::Full(_)) => {
                    warn!(%request_id, %chain_id, request_idx, "failed to send query request to watcher, will retry next interval");
                }
                Err(TrySendError::Closed(_)) => {
                    error!(%request_id, %chain_id, request_idx, "watcher request channel is closed");
                }
            },
            // Routes are checked at admission and never change afterwards.
            None => error!(%request_id, %chain_id, "no watcher route for admitted query"),
        }

        leg.generation += 1;
        self.timers.schedule(
            now + self.retry_interval,
            request_id,
            TimerKind::Redispatch {
                request_idx,
                generation: leg.generation,
            },
        );
    }

    fn handle_response(&mut self, response: PerChainQueryResponseInternal) -> Result<()> {
        let PerChainQueryResponseInternal {
            request_id,
            request_idx,
            chain_id,
            status,
            response,
        } = response;

        let Some(pending) = self.pending.get_mut(&request_id) else {
            debug!(%request_id, %chain_id, request_idx, ?status, "discarding response for a request which is no longer pending");
            return Ok(());
        };
        let Some(leg) = pending.legs.get_mut(request_idx) else {
            warn!(%request_id, %chain_id, request_idx, "discarding response with an out of range request index");
            return Ok(());
        };
        if leg.query.request.chain_id != chain_id {
            warn!(
                %request_id,
                request_idx,
                %chain_id,
                expected = %leg.query.request.chain_id,
                "discarding response from the wrong chain"
            );
            return Ok(());
        }
        if leg.result.is_some() {
            debug!(%request_id, %chain_id, request_idx, ?status, "leg already answered, discarding response");
            return Ok(());
        }

        match (status, response) {
            (QueryStatus::Success, Some(response)) => {
                leg.result = Some(response);
                leg.generation += 1;
                pending.remaining -= 1;
                debug!(%request_id, %chain_id, request_idx, remaining = pending.remaining, "received per chain query response");
                if pending.remaining == 0 {
                    self.complete(request_id)?;
                }
            }
            (QueryStatus::Success, None) | (QueryStatus::RetryNeeded, _) => {
                if status == QueryStatus::Success {
                    warn!(%request_id, %chain_id, request_idx, "successful response carried no payload, retrying");
                }
                self.metrics.leg_retry(chain_id);
                leg.generation += 1;
                let generation = leg.generation;
                info!(%request_id, %chain_id, request_idx, "retrying failed query request");
                self.timers.schedule(
                    Instant::now() + self.retry_interval,
                    request_id,
                    TimerKind::Redispatch {
                        request_idx,
                        generation,
                    },
                );
            }
            (QueryStatus::FatalError, _) => {
                error!(%request_id, %chain_id, request_idx, "received a fatal error, dropping the whole request");
                self.pending.remove(&request_id);
                self.metrics.request_aborted("fatal-error");
            }
        }
        Ok(())
    }

    fn complete(&mut self, request_id: RequestId) -> Result<()> {
        let Some(pending) = self.pending.remove(&request_id) else {
            return Ok(());
        };
        let elapsed = pending.received_at.elapsed();
        let dispatches: u32 = pending.legs.iter().map(|leg| leg.dispatches).sum();
        let Some(publication) = pending.into_publication() else {
            error!(%request_id, "attempted to complete a request with missing responses");
            return Ok(());
        };
        info!(%request_id, ?elapsed, dispatches, "query request complete, publishing response");
        self.metrics.response_completed(elapsed.as_secs_f64());
        self.publisher.publish(publication)
    }

    fn handle_timers(&mut self, now: Instant) {
        while let Some(timer) = self.timers.pop_expired(now) {
            self.handle_timer(timer, now);
        }
    }

    fn handle_timer(&mut self, timer: Timer, now: Instant) {
        let Timer {
            request_id, kind, ..
        } = timer;
        match kind {
            TimerKind::Deadline => {
                if let Some(pending) = self.pending.remove(&request_id) {
                    let outstanding = pending
                        .legs
                        .iter()
                        .filter(|leg| leg.result.is_none())
                        .map(|leg| leg.query.request.chain_id)
                        .join(",");
                    warn!(%request_id, %outstanding, "query request timed out, dropping it");
                    self.metrics.request_aborted("timeout");
                }
            }
            TimerKind::Redispatch {
                request_idx,
                generation,
            } => {
                let current = self
                    .pending
                    .get(&request_id)
                    .and_then(|p| p.legs.get(request_idx))
                    .is_some_and(|leg| leg.result.is_none() && leg.generation == generation);
                if current {
                    self.dispatch(request_id, request_idx, now);
                }
            }
        }
    }
}
