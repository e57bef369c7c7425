//! Worker pool driving the dispatcher.
//!
//! Each event runs on its own task; a semaphore bounds how many run at once.
//! Shutdown stops intake and waits for in-flight events.

use std::sync::Arc;

use corral_events::{Event, Reply};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::dispatcher::Dispatcher;
use crate::progress::{LogProgress, Progress, ReplyProgress};

pub struct Agent {
    dispatcher: Arc<Dispatcher>,
    workers: usize,
}

impl Agent {
    pub fn new(dispatcher: Arc<Dispatcher>, workers: usize) -> Self {
        Self {
            dispatcher,
            workers: workers.max(1),
        }
    }

    /// Process events until the channel closes or shutdown is signalled.
    ///
    /// Returns the number of events processed.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<Event>,
        replies: mpsc::UnboundedSender<Reply>,
        mut shutdown: watch::Receiver<bool>,
    ) -> usize {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut processed = 0;

        info!(workers = self.workers, "Agent started");

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => {
                    info!("Shutdown requested, no longer accepting events");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        debug!("Event stream ended");
                        break;
                    }
                },
            };

            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let dispatcher = self.dispatcher.clone();
            let replies = replies.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let reply_progress;
                let progress: &dyn Progress = if event.reply_to.is_some() {
                    reply_progress = ReplyProgress::new(&event, replies.clone());
                    &reply_progress
                } else {
                    &LogProgress
                };
                if let Some(reply) = dispatcher.dispatch(&event, progress).await {
                    if replies.send(reply).is_err() {
                        debug!(event_id = %event.id, "Reply channel closed, dropping reply");
                    }
                }
            });

            while let Some(result) = tasks.try_join_next() {
                processed += 1;
                log_task_result(result);
            }
        }

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Waiting for in-flight events");
        }
        while let Some(result) = tasks.join_next().await {
            processed += 1;
            log_task_result(result);
        }

        info!(processed, "Agent stopped");
        processed
    }
}

fn log_task_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Event task panicked");
    }
}
