//! Ownership of the queue connection.
//!
//! A single [`ConnectionSupervisor`] owns the channel to the broker and is shared, via [`Arc`],
//! by everything that talks to the queue. It is the only place that connects, health checks, and
//! reconnects; callers ask it for a channel and report back when one turns out to be broken.
use std::{sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::Backoff,
    queue::{Broker, Channel, QueueError},
};

/// How connection failures are retried.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts before [`ConnectionSupervisor::connect`] gives up.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: Backoff,
    /// Pause before a worker restarts its consumption loop after losing the connection.
    pub restart_delay: Duration,
    /// How often [`ConnectionSupervisor::spawn_monitor`] checks the connection.
    pub health_check_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Backoff::constant(Duration::from_secs(5)),
            restart_delay: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    pub fn with_backoff(self, backoff: Backoff) -> Self {
        Self { backoff, ..self }
    }

    pub fn with_restart_delay(self, restart_delay: Duration) -> Self {
        Self {
            restart_delay,
            ..self
        }
    }

    pub fn with_health_check_interval(self, health_check_interval: Duration) -> Self {
        Self {
            health_check_interval,
            ..self
        }
    }
}

/// Owns, and reconnects, the channel to a [`Broker`].
pub struct ConnectionSupervisor<B: Broker> {
    broker: B,
    policy: ReconnectPolicy,
    current: Mutex<Option<Arc<B::Channel>>>,
}

impl<B: Broker> ConnectionSupervisor<B> {
    pub fn new(broker: B, policy: ReconnectPolicy) -> Self {
        Self {
            broker,
            policy,
            current: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Returns the current channel, connecting with bounded retries if there is no open one.
    ///
    /// Fails with [`QueueError::RetriesExhausted`] once [`ReconnectPolicy::max_attempts`]
    /// consecutive attempts have failed. The channel lock is only held to read or install a
    /// channel, never across an attempt or a delay, so [`Self::channel`] and
    /// [`Self::health_check`] answer while a reconnect is in progress.
    pub async fn connect(&self) -> Result<Arc<B::Channel>, QueueError> {
        if let Some(channel) = self.current().await {
            return Ok(channel);
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            tracing::info!(attempt, max_attempts, "Connecting to the queue");
            match self.broker.connect().await {
                Ok(channel) => {
                    tracing::info!(attempt, "Connected to the queue");
                    return Ok(self.install(channel).await);
                }
                Err(error) if attempt >= max_attempts => {
                    tracing::error!(
                        ?error,
                        attempt,
                        "Could not connect to the queue after {max_attempts} attempts"
                    );
                    return Err(QueueError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(error),
                    });
                }
                Err(error) => {
                    let delay = self.policy.backoff.delay(attempt);
                    tracing::warn!(
                        ?error,
                        attempt,
                        "Queue connection attempt {attempt} failed, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    if let Some(channel) = self.current().await {
                        return Ok(channel);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Returns the current channel, making a single connection attempt if there is no open one.
    ///
    /// Used on request paths which should fail fast rather than wait out the retry policy.
    pub async fn channel(&self) -> Result<Arc<B::Channel>, QueueError> {
        if let Some(channel) = self.current().await {
            return Ok(channel);
        }
        let channel = self.broker.connect().await?;
        Ok(self.install(channel).await)
    }

    async fn current(&self) -> Option<Arc<B::Channel>> {
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|channel| channel.is_open())
            .cloned()
    }

    /// Stores a freshly opened channel, unless another caller installed an open one first, in
    /// which case the new one is closed and the existing one returned.
    async fn install(&self, channel: B::Channel) -> Arc<B::Channel> {
        let mut current = self.current.lock().await;
        if let Some(existing) = current.as_ref().filter(|existing| existing.is_open()) {
            let existing = existing.clone();
            drop(current);
            channel.close().await;
            return existing;
        }
        let channel = Arc::new(channel);
        *current = Some(channel.clone());
        channel
    }

    /// Whether there is an open channel which answers a ping.
    pub async fn health_check(&self) -> bool {
        let channel = self.current.lock().await.clone();
        match channel {
            Some(channel) if channel.is_open() => channel.ping().await.is_ok(),
            _ => false,
        }
    }

    /// Drops the current channel so that the next call reconnects.
    pub async fn invalidate(&self) {
        if let Some(channel) = self.current.lock().await.take() {
            channel.close().await;
        }
    }

    /// Closes the current channel, if any.
    pub async fn shutdown(&self) {
        tracing::debug!("Shutting down queue connection");
        self.invalidate().await;
    }

    /// Spawns a task which checks the connection every
    /// [`ReconnectPolicy::health_check_interval`] and reconnects it when it is broken.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        cancellation_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            loop {
                if !supervisor.health_check().await {
                    supervisor.invalidate().await;
                    if let Err(error) = supervisor.connect().await {
                        tracing::error!(?error, "Queue connection monitor could not reconnect");
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(supervisor.policy.health_check_interval) => {},
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the queue connection monitor");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::queue::memory::InMemoryBroker;
    use assert_matches::assert_matches;

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::default()
            .with_max_attempts(max_attempts)
            .with_backoff(Backoff::constant(Duration::from_millis(5)))
            .with_restart_delay(Duration::from_millis(5))
            .with_health_check_interval(Duration::from_millis(10))
    }

    #[test]
    fn default_policy() {
        let policy = ReconnectPolicy::default();

        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.backoff.delay(1), Duration::from_secs(5));
        assert_eq!(policy.restart_delay, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn connect_retries_until_success() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(3);
        let supervisor = ConnectionSupervisor::new(broker.clone(), fast_policy(5));

        let channel = supervisor.connect().await.unwrap();

        assert!(channel.is_open());
        assert_eq!(broker.connect_attempts(), 4);
        assert!(supervisor.health_check().await);
    }

    #[tokio::test]
    async fn connect_gives_up_after_max_attempts() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(10);
        let supervisor = ConnectionSupervisor::new(broker.clone(), fast_policy(3));

        let result = supervisor.connect().await;

        assert_matches!(
            result,
            Err(QueueError::RetriesExhausted { attempts: 3, .. })
        );
        assert_eq!(broker.connect_attempts(), 3);
        assert!(!supervisor.health_check().await);
    }

    #[tokio::test]
    async fn connect_reuses_open_channel() {
        let broker = InMemoryBroker::new();
        let supervisor = ConnectionSupervisor::new(broker.clone(), fast_policy(3));

        let first = supervisor.connect().await.unwrap();
        let second = supervisor.channel().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn channel_makes_a_single_attempt() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(1);
        let supervisor = ConnectionSupervisor::new(broker.clone(), fast_policy(5));

        assert_matches!(supervisor.channel().await, Err(QueueError::Connect(_)));
        assert_eq!(broker.connect_attempts(), 1);
        assert!(supervisor.channel().await.is_ok());
    }

    #[tokio::test]
    async fn requests_do_not_wait_for_a_reconnect_in_progress() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(u32::MAX);
        let policy = fast_policy(10).with_backoff(Backoff::constant(Duration::from_millis(200)));
        let supervisor = Arc::new(ConnectionSupervisor::new(broker.clone(), policy));
        let reconnect = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        assert_matches!(supervisor.channel().await, Err(QueueError::Connect(_)));
        assert!(!supervisor.health_check().await);
        assert!(started.elapsed() < Duration::from_millis(100));

        reconnect.abort();
    }

    #[tokio::test]
    async fn reconnect_in_progress_picks_up_channel_opened_meanwhile() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(1);
        let policy = fast_policy(5).with_backoff(Backoff::constant(Duration::from_millis(50)));
        let supervisor = Arc::new(ConnectionSupervisor::new(broker.clone(), policy));
        let reconnect = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let opened = supervisor.channel().await.unwrap();
        let reconnected = reconnect.await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&opened, &reconnected));
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn reconnects_after_broker_drops_connections() {
        let broker = InMemoryBroker::new();
        let supervisor = ConnectionSupervisor::new(broker.clone(), fast_policy(3));
        let first = supervisor.connect().await.unwrap();

        broker.drop_connections().unwrap();
        assert!(!supervisor.health_check().await);

        let second = supervisor.connect().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_open());
    }

    #[tokio::test]
    async fn invalidate_closes_channel() {
        let broker = InMemoryBroker::new();
        let supervisor = ConnectionSupervisor::new(broker, fast_policy(3));
        let channel = supervisor.connect().await.unwrap();

        supervisor.invalidate().await;

        assert!(!channel.is_open());
        assert!(!supervisor.health_check().await);
    }

    #[tokio::test]
    async fn monitor_restores_connection() {
        let broker = InMemoryBroker::new();
        let supervisor = Arc::new(ConnectionSupervisor::new(broker.clone(), fast_policy(3)));
        let token = CancellationToken::new();
        let handle = supervisor.spawn_monitor(token.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(supervisor.health_check().await);

        broker.drop_connections().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(supervisor.health_check().await);

        token.cancel();
        handle.await.unwrap();
    }
}
