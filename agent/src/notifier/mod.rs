//! Notification router
//!
//! Routes lifecycle events to the configured receivers. Every receiver owns
//! a bounded queue drained by its own task, so a slow receiver only delays
//! its own events.

pub mod matcher;
pub mod slack;
pub mod webhook;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use piped_model::notification::PipedEventData;
use piped_model::{NotificationEvent, NotificationEventMetadata, NotificationEventType};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::piped::PipedSpec;
use crate::errors::AgentError;
use crate::notifier::matcher::Matcher;
use crate::notifier::slack::SlackSender;
use crate::notifier::webhook::WebhookSender;

/// Notifier options
#[derive(Debug, Clone)]
pub struct Options {
    /// How long `close` may spend draining receiver queues
    pub close_grace_period: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            close_grace_period: Duration::from_secs(10),
        }
    }
}

/// Bounded event queue owned by one receiver
pub struct EventQueue {
    tx: mpsc::Sender<NotificationEvent>,
    rx: Mutex<mpsc::Receiver<NotificationEvent>>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Enqueue without blocking. A full queue drops the event.
    pub fn push(&self, receiver: &str, event: NotificationEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    receiver = receiver,
                    "notification queue is full, dropping {}", event.event_type
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(
                    receiver = receiver,
                    "notification queue is closed, dropping {}", event.event_type
                );
            }
        }
    }
}

/// A notification receiver
#[async_trait]
pub trait Sender: Send + Sync {
    fn name(&self) -> &str;

    fn queue(&self) -> &EventQueue;

    /// Deliver one event. Failures are logged by the sender.
    async fn send(&self, event: &NotificationEvent);
}

/// Deliver queued events until cancelled.
async fn run_sender(sender: Arc<dyn Sender>, cancel: CancellationToken) {
    let mut rx = sender.queue().rx.lock().await;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => sender.send(&event).await,
                None => return,
            },
        }
    }
}

/// Close the queue and deliver what is left until empty or the deadline passes.
async fn close_sender(sender: Arc<dyn Sender>, deadline: Instant) {
    let mut rx = sender.queue().rx.lock().await;
    rx.close();
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => match event {
                Some(event) => {
                    if tokio::time::timeout_at(deadline, sender.send(&event)).await.is_err() {
                        warn!(receiver = sender.name(), "grace period expired while draining notifications");
                        return;
                    }
                }
                None => return,
            },
            _ = tokio::time::sleep_until(deadline) => {
                warn!(receiver = sender.name(), "grace period expired while draining notifications");
                return;
            }
        }
    }
}

struct Handler {
    route: String,
    matcher: Matcher,
    sender: Arc<dyn Sender>,
}

/// Fans events out to receivers according to the configured routes
pub struct Notifier {
    handlers: Vec<Handler>,
    senders: Vec<Arc<dyn Sender>>,
    closed: AtomicBool,
    piped: PipedEventData,
    options: Options,
}

impl Notifier {
    /// Build senders for every receiver referenced by a route.
    pub async fn new(config: &PipedSpec, version: &str, options: Options) -> Result<Self, AgentError> {
        let mut senders: HashMap<String, Arc<dyn Sender>> = HashMap::new();
        for receiver in &config.notifications.receivers {
            let sender: Arc<dyn Sender> = match (&receiver.slack, &receiver.webhook) {
                (Some(slack), _) => {
                    Arc::new(SlackSender::new(&receiver.name, slack, &config.web_address).await?)
                }
                (None, Some(webhook)) => Arc::new(WebhookSender::new(&receiver.name, webhook).await?),
                (None, None) => {
                    return Err(AgentError::ConfigError(format!(
                        "receiver {} has no configuration",
                        receiver.name
                    )))
                }
            };
            senders.insert(receiver.name.clone(), sender);
        }

        let piped = PipedEventData {
            id: config.piped_id.clone(),
            version: version.to_string(),
            project_id: config.project_id.clone(),
        };
        Self::with_senders(piped, &config.notifications.routes, senders, options)
    }

    pub fn with_senders(
        piped: PipedEventData,
        routes: &[crate::config::piped::NotificationRoute],
        senders: HashMap<String, Arc<dyn Sender>>,
        options: Options,
    ) -> Result<Self, AgentError> {
        let mut handlers = Vec::with_capacity(routes.len());
        for route in routes {
            let sender = senders.get(&route.receiver).cloned().ok_or_else(|| {
                AgentError::ConfigError(format!(
                    "route {} refers to unknown receiver {}",
                    route.name, route.receiver
                ))
            })?;
            handlers.push(Handler {
                route: route.name.clone(),
                matcher: Matcher::new(route),
                sender,
            });
        }

        // Only receivers reachable from a route get a delivery task.
        let mut used: Vec<Arc<dyn Sender>> = Vec::new();
        for handler in &handlers {
            if !used.iter().any(|s| s.name() == handler.sender.name()) {
                used.push(handler.sender.clone());
            }
        }

        let notifier = Self {
            handlers,
            senders: used,
            closed: AtomicBool::new(false),
            piped,
            options,
        };
        // Queued before anyone else can hold the notifier.
        notifier.notify(notifier.piped_event(NotificationEventType::PipedStarted));
        Ok(notifier)
    }

    /// Route an event to every matching receiver.
    pub fn notify(&self, event: NotificationEvent) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("notifier is closed, dropping {}", event.event_type);
            return;
        }
        for handler in &self.handlers {
            if handler.matcher.matches(&event) {
                debug!(route = %handler.route, "routing {} to {}", event.event_type, handler.sender.name());
                handler.sender.queue().push(handler.sender.name(), event.clone());
            }
        }
    }

    /// Deliver events until cancelled, then announce the stop and drain.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AgentError> {
        info!("Notifier starting with {} receivers...", self.senders.len());

        let handles: Vec<_> = self
            .senders
            .iter()
            .map(|sender| tokio::spawn(run_sender(sender.clone(), cancel.clone())))
            .collect();

        cancel.cancelled().await;
        for handle in handles {
            if let Err(e) = handle.await {
                error!("notification receiver task failed: {}", e);
            }
        }

        self.notify(self.piped_event(NotificationEventType::PipedStopped));
        self.closed.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + self.options.close_grace_period;
        futures::future::join_all(
            self.senders
                .iter()
                .map(|sender| close_sender(sender.clone(), deadline)),
        )
        .await;

        info!("Notifier stopped");
        Ok(())
    }

    fn piped_event(&self, event_type: NotificationEventType) -> NotificationEvent {
        NotificationEvent::new(event_type, NotificationEventMetadata::Piped(self.piped.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::piped::NotificationRoute;
    use piped_model::notification::DeploymentEventData;
    use piped_model::Deployment;

    struct RecordingSender {
        name: String,
        queue: EventQueue,
        sent: std::sync::Mutex<Vec<NotificationEventType>>,
        delay: Duration,
    }

    impl RecordingSender {
        fn new(name: &str, capacity: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                queue: EventQueue::new(capacity),
                sent: std::sync::Mutex::new(Vec::new()),
                delay,
            })
        }

        fn sent(&self) -> Vec<NotificationEventType> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sender for RecordingSender {
        fn name(&self) -> &str {
            &self.name
        }

        fn queue(&self) -> &EventQueue {
            &self.queue
        }

        async fn send(&self, event: &NotificationEvent) {
            tokio::time::sleep(self.delay).await;
            self.sent.lock().unwrap().push(event.event_type);
        }
    }

    fn route(name: &str, receiver: &str, events: &[&str]) -> NotificationRoute {
        NotificationRoute {
            name: name.to_string(),
            receiver: receiver.to_string(),
            events: events.iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        }
    }

    fn deployment_event(event_type: NotificationEventType) -> NotificationEvent {
        NotificationEvent::new(
            event_type,
            NotificationEventMetadata::Deployment(DeploymentEventData {
                deployment: Deployment::default(),
                ..Default::default()
            }),
        )
    }

    fn notifier(routes: &[NotificationRoute], senders: Vec<Arc<RecordingSender>>) -> Arc<Notifier> {
        let senders = senders
            .into_iter()
            .map(|s| (s.name.clone(), s as Arc<dyn Sender>))
            .collect();
        Arc::new(
            Notifier::with_senders(PipedEventData::default(), routes, senders, Options::default())
                .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_events_and_drain_on_close() {
        let slack = RecordingSender::new("slack", 100, Duration::from_millis(10));
        let notifier = notifier(&[route("all", "slack", &[])], vec![slack.clone()]);

        let cancel = CancellationToken::new();
        let handle = {
            let notifier = notifier.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { notifier.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        notifier.notify(deployment_event(NotificationEventType::DeploymentTriggered));
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(
            slack.sent(),
            vec![
                NotificationEventType::PipedStarted,
                NotificationEventType::DeploymentTriggered,
                NotificationEventType::PipedStopped,
            ]
        );

        // Closed notifiers drop further events.
        notifier.notify(deployment_event(NotificationEventType::DeploymentFailed));
        assert_eq!(slack.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_routes_select_receivers() {
        let slack = RecordingSender::new("slack", 100, Duration::ZERO);
        let hook = RecordingSender::new("hook", 1000, Duration::ZERO);
        let notifier = notifier(
            &[
                route("failures", "slack", &["DEPLOYMENT_FAILED"]),
                route("everything", "hook", &[]),
            ],
            vec![slack.clone(), hook.clone()],
        );

        notifier.notify(deployment_event(NotificationEventType::DeploymentTriggered));
        notifier.notify(deployment_event(NotificationEventType::DeploymentFailed));

        let cancel = CancellationToken::new();
        cancel.cancel();
        notifier.run(cancel).await.unwrap();

        assert_eq!(slack.sent(), vec![NotificationEventType::DeploymentFailed]);
        assert_eq!(
            hook.sent(),
            vec![
                NotificationEventType::PipedStarted,
                NotificationEventType::DeploymentTriggered,
                NotificationEventType::DeploymentFailed,
                NotificationEventType::PipedStopped,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_event_precedes_events_sent_before_run() {
        let hook = RecordingSender::new("hook", 1000, Duration::ZERO);
        let notifier = notifier(&[route("all", "hook", &[])], vec![hook.clone()]);

        let cancel = CancellationToken::new();
        notifier.notify(deployment_event(NotificationEventType::DeploymentTriggered));
        let handle = {
            let notifier = notifier.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { notifier.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(
            hook.sent(),
            vec![
                NotificationEventType::PipedStarted,
                NotificationEventType::DeploymentTriggered,
                NotificationEventType::PipedStopped,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_instead_of_blocking() {
        let slow = RecordingSender::new("slow", 2, Duration::from_secs(1));
        let notifier = notifier(&[route("all", "slow", &[])], vec![slow.clone()]);

        for _ in 0..5 {
            notifier.notify(deployment_event(NotificationEventType::DeploymentPlanned));
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        notifier.run(cancel).await.unwrap();

        // The started event holds one of the two slots.
        assert_eq!(
            slow.sent(),
            vec![NotificationEventType::PipedStarted, NotificationEventType::DeploymentPlanned]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_respects_grace_period() {
        let slow = RecordingSender::new("slow", 100, Duration::from_secs(4));
        let notifier = notifier(&[route("all", "slow", &[])], vec![slow.clone()]);
        for _ in 0..5 {
            notifier.notify(deployment_event(NotificationEventType::DeploymentPlanned));
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = Instant::now();
        notifier.run(cancel).await.unwrap();

        assert!(started.elapsed() <= Duration::from_secs(11));
        assert!(slow.sent().len() < 7);
    }

    #[test]
    fn test_unknown_receiver() {
        let result = Notifier::with_senders(
            PipedEventData::default(),
            &[route("r", "missing", &[])],
            HashMap::new(),
            Options::default(),
        );
        assert!(matches!(result, Err(AgentError::ConfigError(_))));
    }
}
