use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    dispatcher::Dispatcher,
    job::Job,
    store::Store,
    JoblinError,
};

/// Periodically selects a batch of jobs and starts them, handing started jobs to the caller.
pub(crate) struct PollRunner<S> {
    dispatcher: Dispatcher<S>,
    poll_interval: Duration,
    batch_size: usize,
    sender: mpsc::UnboundedSender<Job>,
}

impl<S> PollRunner<S>
where
    S: Store,
{
    pub fn new(
        dispatcher: Dispatcher<S>,
        poll_interval: Duration,
        batch_size: usize,
        sender: mpsc::UnboundedSender<Job>,
    ) -> Self {
        Self {
            dispatcher,
            poll_interval,
            batch_size,
            sender,
        }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(err) = self.poll(&cancellation_token).await {
                    tracing::error!(?err, "Scheduling pass failed with error {err}");
                }
                if self.sender.is_closed() {
                    tracing::debug!("Job receiver dropped, shutting down the poll runner");
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the poll runner");
                        break;
                    },
                }
            }
        })
    }

    /// One scheduling pass. Returns how many jobs were started.
    ///
    /// Cancellation is honoured between jobs, so a pass never stops halfway through starting
    /// one.
    pub async fn poll(&self, cancellation_token: &CancellationToken) -> Result<usize, JoblinError> {
        let batch = self
            .dispatcher
            .scheduler()
            .next_batch(self.batch_size)
            .await?;
        let mut started = 0;
        for job in batch {
            if cancellation_token.is_cancelled() || self.sender.is_closed() {
                break;
            }
            match self.dispatcher.start_job(job.id, None).await {
                Ok(outcome) if outcome.is_started() => {
                    started += 1;
                    if let Err(err) = self.sender.send(outcome.into_job()) {
                        tracing::error!(job_id = %err.0.id, "Started job could not be handed over");
                        break;
                    }
                }
                Ok(outcome) => {
                    tracing::debug!(job_id = %outcome.job().id, ?outcome, "Job not started")
                }
                Err(JoblinError::JobChanged(job_id)) => {
                    tracing::debug!(%job_id, "Job changed before it could be started")
                }
                Err(err) => {
                    tracing::error!(?err, job_id = %job.id, "Failed to start job with error {err}")
                }
            }
        }
        Ok(started)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::{
        clock::Clock,
        config::JoblinConfig,
        event::TracingEventSink,
        job::JobStatus,
        rate_limit::{configuration::test::limits, RateLimitConfiguration},
        store::{memory::InMemoryStore, JobStore},
        testing::ManualClock,
    };

    fn runner(
        store: &InMemoryStore,
        clock: Arc<ManualClock>,
    ) -> (PollRunner<InMemoryStore>, mpsc::UnboundedReceiver<Job>) {
        let dispatcher = Dispatcher::new(
            store.clone(),
            clock,
            Arc::new(TracingEventSink),
            JoblinConfig::default(),
        );
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            PollRunner::new(dispatcher, Duration::from_secs(1), 10, sender),
            receiver,
        )
    }

    #[tokio::test]
    async fn poll_starts_admitted_jobs_in_priority_order() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::default());
        let (runner, mut receiver) = runner(&store, clock.clone());
        let mut configuration = RateLimitConfiguration::builder("one at a time", limits(1, 60, 10))
            .build(clock.now())
            .unwrap();
        runner
            .dispatcher
            .save_configuration(&mut configuration)
            .await
            .unwrap();
        for priority in [1, 5] {
            runner
                .dispatcher
                .enqueue(
                    runner
                        .dispatcher
                        .job_builder("report", "a")
                        .with_priority(priority),
                )
                .await
                .unwrap();
        }

        let started = runner.poll(&CancellationToken::new()).await.unwrap();

        assert_eq!(started, 1);
        let job = receiver.try_recv().unwrap();
        assert_eq!(job.priority, 5);
        assert_eq!(job.status, JobStatus::InProgress);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancelled_pass_starts_nothing() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::default());
        let (runner, mut receiver) = runner(&store, clock);
        let job = runner
            .dispatcher
            .enqueue(runner.dispatcher.job_builder("report", "a"))
            .await
            .unwrap();
        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(runner.poll(&token).await.unwrap(), 0);
        assert!(receiver.try_recv().is_err());
        assert_eq!(
            store.load_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn nothing_is_started_once_the_receiver_is_gone() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::default());
        let (runner, receiver) = runner(&store, clock);
        let job = runner
            .dispatcher
            .enqueue(runner.dispatcher.job_builder("report", "a"))
            .await
            .unwrap();
        drop(receiver);

        assert_eq!(runner.poll(&CancellationToken::new()).await.unwrap(), 0);
        assert_eq!(
            store.load_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_runner_stops_on_cancellation() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::default());
        let (runner, _receiver) = runner(&store, clock);
        let token = CancellationToken::new();

        let handle = runner.spawn(token.clone());
        token.cancel();

        assert!(handle.await.is_ok());
    }
}
