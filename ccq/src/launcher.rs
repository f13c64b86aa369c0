//! Wires the query handler and publication retrier together.

use anyhow::{Result, anyhow};
use tokio::{
    sync::{
        mpsc::{self, Receiver, Sender},
        watch,
    },
    task::JoinSet,
};
use tracing::*;

use crate::{
    admission::AdmissionValidator,
    cfg::QueryConfig,
    handler::QueryHandler,
    message::{QueryResponsePublication, SignedQueryRequest},
    metrics::QueryMetrics,
    publisher::{PublicationRetrier, PublisherHandle},
    watcher::{PerChainQueryResponseInternal, WatcherRoutes},
};

/// The ends of the launcher's channels which belong to the rest of the node.
pub struct QueryInputChannels {
    /// Signed requests from the P2P layer.
    pub signed_requests: Sender<SignedQueryRequest>,
    /// Cloned into every watcher.
    pub responses: Sender<PerChainQueryResponseInternal>,
    /// Completed responses, ready for the P2P layer to broadcast.
    pub publications: Receiver<QueryResponsePublication>,
    /// Send `true` (or drop it) to stop the launcher.
    pub shutdown: watch::Sender<bool>,
}

pub struct QueryLauncher {
    config: QueryConfig,
    routes: WatcherRoutes,
    requests: Receiver<SignedQueryRequest>,
    responses: Receiver<PerChainQueryResponseInternal>,
    publications: Sender<QueryResponsePublication>,
    shutdown: watch::Receiver<bool>,
}

impl QueryLauncher {
    pub fn new(config: QueryConfig, routes: WatcherRoutes) -> Result<(Self, QueryInputChannels)> {
        config.validate()?;

        let (signed_requests_sender, signed_requests_receiver) =
            mpsc::channel(config.signed_request_channel_size);
        let (responses_sender, responses_receiver) = mpsc::channel(config.response_channel_size);
        let (publications_sender, publications_receiver) =
            mpsc::channel(config.publication_channel_size);
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);

        let launcher = QueryLauncher {
            config,
            routes,
            requests: signed_requests_receiver,
            responses: responses_receiver,
            publications: publications_sender,
            shutdown: shutdown_receiver,
        };
        let input_channels = QueryInputChannels {
            signed_requests: signed_requests_sender,
            responses: responses_sender,
            publications: publications_receiver,
            shutdown: shutdown_sender,
        };
        Ok((launcher, input_channels))
    }

    /// Runs until shutdown is signalled or one of the tasks fails.
    pub async fn start(self) -> Result<()> {
        let mut tasks = JoinSet::new();
        spawn_query_handler(
            &self.config,
            self.routes,
            self.requests,
            self.responses,
            self.publications,
            self.shutdown,
            &mut tasks,
        )?;
        info!(environment = ?self.config.environment, "cross chain query handler started");

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("cross chain query task failed: {e:?}");
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(anyhow!("cross chain query task panicked: {e}"));
                }
            }
        }
        info!("cross chain query handler stopped");
        Ok(())
    }
}

/// Spawns the query handler and publication retrier onto `tasks`, using channels the caller has already built.
///
/// Returns a handle onto the publisher, which can be used to observe its backlog.
pub fn spawn_query_handler(
    config: &QueryConfig,
    routes: WatcherRoutes,
    requests: Receiver<SignedQueryRequest>,
    responses: Receiver<PerChainQueryResponseInternal>,
    publications: Sender<QueryResponsePublication>,
    shutdown: watch::Receiver<bool>,
    tasks: &mut JoinSet<Result<()>>,
) -> Result<PublisherHandle> {
    let validator = AdmissionValidator::new(
        config.environment,
        config.allowed_requesters()?,
        config.supported_chains.iter().copied(),
        routes.chains(),
    );
    let metrics = QueryMetrics::new();

    let (retrier, publisher) = PublicationRetrier::new(
        publications,
        config.retry_interval,
        config.publication_backlog_warning,
        metrics.clone(),
    );
    let handler = QueryHandler::new(
        validator,
        routes,
        publisher.clone(),
        config.request_timeout,
        config.retry_interval,
        metrics,
    );

    tasks.spawn(retrier.run(shutdown.clone()));
    tasks.spawn(handler.run(requests, responses, shutdown));
    Ok(publisher)
}
