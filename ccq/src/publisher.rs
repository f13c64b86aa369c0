//! Delivery of completed responses to the publication channel.
//!
//! Everything the query handler hands over here is delivered eventually. Responses wait in FIFO order while the
//! publication channel is full and are offered again every retry interval, for as long as it takes.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use tokio::{
    select,
    sync::{
        mpsc::{self, Sender, UnboundedSender, error::TrySendError},
        watch,
    },
    time::{self, Instant},
};
use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};
use tracing::*;

use crate::{message::QueryResponsePublication, metrics::QueryMetrics};

/// Cheap to clone. Used by the query handler to hand over completed responses.
#[derive(Debug, Clone)]
pub struct PublisherHandle {
    sender: UnboundedSender<QueryResponsePublication>,
    backlog: Arc<AtomicUsize>,
}

impl PublisherHandle {
    /// Queues a response for publication. Only fails if the publisher has stopped.
    pub fn publish(&self, publication: QueryResponsePublication) -> Result<()> {
        self.sender
            .send(publication)
            .map_err(|_| anyhow!("query response publisher has stopped"))
    }

    /// Number of responses the publisher is holding because the publication channel was full.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }
}

pub struct PublicationRetrier {
    incoming: UnboundedReceiverStream<QueryResponsePublication>,
    outbound: Sender<QueryResponsePublication>,
    retry_interval: Duration,
    backlog_warning: usize,
    pending: VecDeque<QueryResponsePublication>,
    backlog: Arc<AtomicUsize>,
    metrics: QueryMetrics,
}

enum Flush {
    Drained,
    Blocked,
}

impl PublicationRetrier {
    pub fn new(
        outbound: Sender<QueryResponsePublication>,
        retry_interval: Duration,
        backlog_warning: usize,
        metrics: QueryMetrics,
    ) -> (Self, PublisherHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        let retrier = PublicationRetrier {
            incoming: UnboundedReceiverStream::new(receiver),
            outbound,
            retry_interval,
            backlog_warning,
            pending: VecDeque::new(),
            backlog: backlog.clone(),
            metrics,
        };
        (retrier, PublisherHandle { sender, backlog })
    }

    /// Runs until shutdown is signalled. If every [PublisherHandle] is dropped, keeps going until the backlog has been
    /// delivered.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let retry = time::sleep(self.retry_interval);
        tokio::pin!(retry);
        let mut retry_armed = false;
        let mut incoming_open = true;

        loop {
            select! {
                publication = self.incoming.next(), if incoming_open => {
                    match publication {
                        Some(publication) => {
                            self.pending.push_back(publication);
                            // While a retry is armed the head of the queue is stuck, so new arrivals just wait behind it.
                            if !retry_armed {
                                if let Flush::Blocked = self.flush(false)? {
                                    retry.as_mut().reset(Instant::now() + self.retry_interval);
                                    retry_armed = true;
                                }
                            }
                            self.update_backlog();
                        }
                        None => {
                            debug!("query handler stopped, draining publication backlog");
                            incoming_open = false;
                        }
                    }
                }
                () = &mut retry, if retry_armed => {
                    retry_armed = false;
                    if let Flush::Blocked = self.flush(true)? {
                        retry.as_mut().reset(Instant::now() + self.retry_interval);
                        retry_armed = true;
                    }
                    self.update_backlog();
                }
                _ = shutdown.changed() => {
                    if !self.pending.is_empty() {
                        warn!(pending = self.pending.len(), "shutting down with undelivered query responses");
                    }
                    return Ok(());
                }
            }

            if !incoming_open && self.pending.is_empty() {
                return Ok(());
            }
        }
    }

    /// Hands over queued responses until the queue is empty or the channel is full.
    fn flush(&mut self, is_retry: bool) -> Result<Flush> {
        let mut first = true;
        while let Some(publication) = self.pending.pop_front() {
            let request_id = publication.request.request_id();
            match self.outbound.try_send(publication) {
                Ok(()) => {
                    if is_retry && first {
                        info!(%request_id, "resend of query response succeeded");
                    } else {
                        debug!(%request_id, "published query response");
                    }
                }
                Err(TrySendError::Full(publication)) => {
                    self.pending.push_front(publication);
                    self.metrics.publication_retry();
                    if is_retry && first {
                        warn!(%request_id, "resend of query response failed again, will keep retrying");
                    } else {
                        warn!(%request_id, "failed to publish query response, will retry publishing next interval");
                    }
                    return Ok(Flush::Blocked);
                }
                Err(TrySendError::Closed(publication)) => {
                    self.pending.push_front(publication);
                    error!(pending = self.pending.len(), "publication channel closed");
                    self.update_backlog();
                    return Err(anyhow!(
                        "publication channel closed with {} responses undelivered",
                        self.pending.len()
                    ));
                }
            }
            first = false;
        }
        Ok(Flush::Drained)
    }

    fn update_backlog(&self) {
        let backlog = self.pending.len();
        let previous = self.backlog.swap(backlog, Ordering::Relaxed);
        if backlog > self.backlog_warning && previous <= self.backlog_warning {
            warn!(
                backlog,
                threshold = self.backlog_warning,
                "query response publication backlog is growing"
            );
        }
    }
}
