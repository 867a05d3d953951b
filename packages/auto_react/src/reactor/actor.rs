use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::machine::{CloseOutcome, MessageDecision, ReactorMachine, ReactorSettings};
use super::{ReactorCommand, ReactorHandle, ReactorSnapshot};
use crate::credentials::CredentialHandle;
use crate::error::ReactorError;
use crate::events::{DisconnectReason, EventKind, StatusChange};
use crate::gateway::{
    BatchKind, Connection, ConnectionPhase, Disconnect, GatewayEvent, InboundMessage,
    Subscription,
};
use crate::registry::RegistrySlot;
use crate::session::{ConnectionObserver, OpenedConnection, SessionManager};

/// Reply channel for the outcome of the initial connect.
pub(crate) type StartReply = oneshot::Receiver<Result<(), ReactorError>>;

/// The connection a reactor is currently attached to.
struct Live {
    connection: Arc<dyn Connection>,
    subscription: Subscription,
    observer: ConnectionObserver,
}

struct ReactorActor {
    session_id: String,
    channel_id: String,
    emoji: String,
    credentials: CredentialHandle,
    sessions: Arc<SessionManager>,
    machine: ReactorMachine,
    live: Option<Live>,
    receiver: mpsc::Receiver<ReactorCommand>,
    cancel: CancellationToken,
    reconnect_at: Option<Instant>,
    resume_at: Option<Instant>,
    slot: RegistrySlot,
}

/// Spawn a reactor actor. The returned receiver resolves once the first
/// connection is established (or failed to be).
pub(crate) fn spawn(
    sessions: Arc<SessionManager>,
    credentials: CredentialHandle,
    channel_id: String,
    emoji: String,
    settings: ReactorSettings,
    slot: RegistrySlot,
) -> (ReactorHandle, StartReply) {
    let (sender, receiver) = mpsc::channel(settings.command_buffer.max(1));
    let cancel = CancellationToken::new();
    let session_id = credentials.session_id.clone();

    let actor = ReactorActor {
        session_id: session_id.clone(),
        channel_id,
        emoji,
        credentials,
        sessions,
        machine: ReactorMachine::new(settings),
        live: None,
        receiver,
        cancel: cancel.clone(),
        reconnect_at: None,
        resume_at: None,
        slot,
    };

    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(async move {
        actor.run(ready_tx).await;
    });

    (
        ReactorHandle {
            session_id,
            sender,
            cancel,
        },
        ready_rx,
    )
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_event(live: &mut Option<Live>) -> Option<GatewayEvent> {
    match live {
        Some(live) => live.subscription.next().await,
        None => std::future::pending().await,
    }
}

impl ReactorActor {
    async fn run(mut self, ready: oneshot::Sender<Result<(), ReactorError>>) {
        self.machine.begin_start();
        info!(
            "Starting reactor for session {} on channel {}",
            self.session_id, self.channel_id
        );

        if let Err(e) = self.establish().await {
            if matches!(e, ReactorError::Aborted(_)) {
                self.shutdown().await;
            } else {
                warn!("Reactor for session {} failed to start: {}", self.session_id, e);
                self.emit(EventKind::ReactorError {
                    error: e.to_string(),
                })
                .await;
                self.machine.stop();
                self.slot.release().await;
            }
            let _ = ready.send(Err(e));
            self.drain_commands().await;
            return;
        }
        let _ = ready.send(Ok(()));

        loop {
            tokio::select! {
                biased;

                cmd = self.receiver.recv() => match cmd {
                    Some(ReactorCommand::Snapshot { respond_to }) => {
                        let _ = respond_to.send(self.snapshot());
                    }
                    Some(ReactorCommand::Stop { respond_to }) => {
                        self.shutdown().await;
                        let _ = respond_to.send(());
                    }
                    None => self.shutdown().await,
                },

                _ = self.cancel.cancelled() => self.shutdown().await,

                event = next_event(&mut self.live) => {
                    if let Some(event) = event {
                        self.on_gateway_event(event).await;
                    }
                }

                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.reconnect().await;
                }

                _ = sleep_until(self.resume_at) => {
                    self.resume_at = None;
                    if self.machine.on_rate_limit_elapsed() {
                        info!("Reactor for session {} resumed", self.session_id);
                        self.status(StatusChange::Resumed).await;
                    }
                }
            }

            if self.machine.phase().is_terminal() {
                break;
            }
        }

        self.drain_commands().await;
        debug!("Reactor actor for session {} exited", self.session_id);
    }

    /// Answer whatever is still queued once the reactor has finished.
    async fn drain_commands(&mut self) {
        self.receiver.close();
        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                ReactorCommand::Snapshot { respond_to } => {
                    let _ = respond_to.send(self.snapshot());
                }
                ReactorCommand::Stop { respond_to } => {
                    let _ = respond_to.send(());
                }
            }
        }
    }

    fn snapshot(&self) -> ReactorSnapshot {
        ReactorSnapshot {
            session_id: self.session_id.clone(),
            channel_id: self.channel_id.clone(),
            emoji: self.emoji.clone(),
            phase: self.machine.phase(),
            reconnect_attempts: self.machine.attempts(),
            rate_limited: self.machine.is_rate_limited(),
            reacted_count: self.machine.reacted_count(),
        }
    }

    async fn emit(&self, kind: EventKind) {
        self.sessions.events().emit(&self.session_id, kind).await;
    }

    async fn status(&self, change: StatusChange) {
        self.emit(EventKind::ReactorStatus(change)).await;
    }

    /// Open a fresh connection and attach to it.
    async fn establish(&mut self) -> Result<(), ReactorError> {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(ReactorError::Aborted(self.session_id.clone()));
            }
            result = self.sessions.open(&self.credentials) => result?,
        };

        let OpenedConnection {
            connection,
            subscription,
            observer,
        } = opened;
        if let Some(mut previous) = self.live.take() {
            previous.subscription.detach();
        }
        self.live = Some(Live {
            connection,
            subscription,
            observer,
        });

        self.status(StatusChange::Starting).await;
        Ok(())
    }

    async fn reconnect(&mut self) {
        debug!(
            "Reconnecting session {} (attempt {})",
            self.session_id,
            self.machine.attempts()
        );
        match self.establish().await {
            Ok(()) => {}
            Err(ReactorError::Aborted(_)) => {}
            Err(e) => {
                warn!("Reconnect for session {} failed: {}", self.session_id, e);
                self.emit(EventKind::ReactorError {
                    error: e.to_string(),
                })
                .await;
                self.on_closed(Disconnect::default()).await;
            }
        }
    }

    async fn on_gateway_event(&mut self, event: GatewayEvent) {
        if let Some(live) = &self.live {
            live.observer.observe(&event).await;
        }

        match event {
            GatewayEvent::Connection(update) => match update.phase {
                Some(ConnectionPhase::Open) => {
                    self.machine.on_open();
                    info!("Reactor for session {} connected", self.session_id);
                    self.status(StatusChange::Connected).await;
                }
                Some(ConnectionPhase::Closed) => {
                    let disconnect = update
                        .disconnect
                        .or_else(|| {
                            self.live
                                .as_ref()
                                .and_then(|live| live.connection.last_disconnect())
                        })
                        .unwrap_or_default();
                    self.on_closed(disconnect).await;
                }
                _ => {}
            },
            GatewayEvent::Messages(batch) => {
                for message in batch.messages {
                    if self.cancel.is_cancelled() || !self.machine.is_running() {
                        break;
                    }
                    self.on_message(batch.kind, message).await;
                }
            }
        }
    }

    async fn on_closed(&mut self, disconnect: Disconnect) {
        if let Some(mut live) = self.live.take() {
            live.subscription.detach();
        }

        match self.machine.on_close(&disconnect) {
            CloseOutcome::LoggedOut => {
                warn!("Session {} was logged out", self.session_id);
                self.status(StatusChange::Disconnected {
                    reason: DisconnectReason::LoggedOut,
                })
                .await;
                self.finish().await;
            }
            CloseOutcome::Exhausted { attempts } => {
                warn!(
                    "Reactor for session {} gave up after {} reconnect attempts",
                    self.session_id, attempts
                );
                self.status(StatusChange::Disconnected {
                    reason: DisconnectReason::ConnectionLost,
                })
                .await;
                self.status(StatusChange::Exhausted { attempts }).await;
                self.finish().await;
            }
            CloseOutcome::Reconnect { attempt, delay } => {
                info!(
                    "Session {} disconnected, reconnecting in {:?} (attempt {})",
                    self.session_id, delay, attempt
                );
                self.status(StatusChange::Disconnected {
                    reason: DisconnectReason::ConnectionLost,
                })
                .await;
                self.status(StatusChange::Reconnecting {
                    attempt,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                })
                .await;
                self.reconnect_at = Some(Instant::now() + delay);
            }
        }
    }

    async fn on_message(&mut self, kind: BatchKind, message: InboundMessage) {
        let message_id = message.key.id.clone();
        match self.machine.decide(kind, &message, &self.channel_id) {
            MessageDecision::Ignore => {}
            MessageDecision::Skip(reason) => {
                debug!(
                    "Skipping message {} for session {}: {:?}",
                    message_id, self.session_id, reason
                );
                self.emit(EventKind::ReactorSkip { reason, message_id })
                    .await;
            }
            MessageDecision::React => self.react(message).await,
        }
    }

    async fn react(&mut self, message: InboundMessage) {
        let Some(connection) = self.live.as_ref().map(|live| live.connection.clone()) else {
            return;
        };
        let key = &message.key;

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            result = connection.send_reaction(&key.remote_jid, key, &self.emoji) => result,
        };

        match result {
            Ok(()) => {
                self.machine.record_reaction(&key.id);
                debug!("Reacted to {} for session {}", key.id, self.session_id);
                self.emit(EventKind::Reacted {
                    message_id: key.id.clone(),
                    emoji: self.emoji.clone(),
                })
                .await;
            }
            Err(e) if e.is_rate_limited() => {
                warn!("Session {} rate limited: {}", self.session_id, e);
                if let Some(backoff) = self.machine.on_rate_limited() {
                    self.resume_at = Some(Instant::now() + backoff);
                    self.status(StatusChange::RateLimited {
                        backoff_seconds: backoff.as_secs(),
                    })
                    .await;
                }
            }
            Err(e) => {
                warn!(
                    "Reaction to {} for session {} failed: {}",
                    key.id, self.session_id, e
                );
                self.emit(EventKind::ReactorError {
                    error: e.to_string(),
                })
                .await;
            }
        }
    }

    /// Terminal without a stop request: give up the registry slot.
    async fn finish(&mut self) {
        self.reconnect_at = None;
        self.resume_at = None;
        self.slot.release().await;
    }

    async fn shutdown(&mut self) {
        if !self.machine.stop() {
            return;
        }
        self.reconnect_at = None;
        self.resume_at = None;

        if let Some(mut live) = self.live.take() {
            live.subscription.detach();
            live.connection.close().await;
            self.sessions
                .store()
                .unbind(&self.session_id, &live.connection)
                .await;
        }

        self.status(StatusChange::Stopped).await;
        self.slot.release().await;
        info!("Reactor for session {} stopped", self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::SendError;
    use crate::events::SkipReason;
    use crate::gateway::MessageBatch;
    use crate::testing::{EventProbe, FakeConnection, ReactorFixture};

    const CHANNEL: &str = "120363000000000000@newsletter";

    fn post(id: &str) -> InboundMessage {
        InboundMessage::new(CHANNEL, id)
    }

    fn is_status(event: &crate::events::Event, change: &StatusChange) -> bool {
        event.kind == EventKind::ReactorStatus(change.clone())
    }

    fn is_reconnecting(event: &crate::events::Event) -> bool {
        matches!(
            event.kind,
            EventKind::ReactorStatus(StatusChange::Reconnecting { .. })
        )
    }

    async fn connected(fx: &ReactorFixture, probe: &mut EventProbe) -> Arc<FakeConnection> {
        fx.registry
            .start_reactor("s1", CHANNEL, "🔥")
            .await
            .unwrap();
        let conn = fx.connector.last_connection().unwrap();
        conn.open().await;
        probe
            .next_matching(|e| is_status(e, &StatusChange::Connected))
            .await
            .unwrap();
        conn
    }

    #[tokio::test(start_paused = true)]
    async fn reacts_once_per_message() {
        let fx = ReactorFixture::new().await;
        let mut probe = fx.probe().await;
        let conn = connected(&fx, &mut probe).await;

        conn.deliver(MessageBatch::live(vec![post("m1")])).await;
        let reacted = probe
            .next_matching(|e| matches!(e.kind, EventKind::Reacted { .. }))
            .await
            .unwrap();
        assert_eq!(
            reacted.kind,
            EventKind::Reacted {
                message_id: "m1".into(),
                emoji: "🔥".into()
            }
        );

        conn.deliver(MessageBatch::live(vec![post("m1")])).await;
        let skip = probe
            .next_matching(|e| matches!(e.kind, EventKind::ReactorSkip { .. }))
            .await
            .unwrap();
        assert_eq!(
            skip.kind,
            EventKind::ReactorSkip {
                reason: SkipReason::AlreadyReacted,
                message_id: "m1".into()
            }
        );

        let sent = conn.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target_id, CHANNEL);
        assert_eq!(sent[0].key.id, "m1");
        assert_eq!(sent[0].emoji, "🔥");
    }

    #[tokio::test(start_paused = true)]
    async fn backlog_and_foreign_messages_are_ignored() {
        let fx = ReactorFixture::new().await;
        let mut probe = fx.probe().await;
        let conn = connected(&fx, &mut probe).await;

        conn.deliver(MessageBatch::backlog(vec![post("old")])).await;
        conn.deliver(MessageBatch::live(vec![
            post("mine").from_me(),
            post("stub").without_content(),
            InboundMessage::new("12345@s.whatsapp.net", "dm"),
            post("new"),
        ]))
        .await;

        let reacted = probe
            .next_matching(|e| matches!(e.kind, EventKind::Reacted { .. }))
            .await
            .unwrap();
        assert!(
            matches!(reacted.kind, EventKind::Reacted { ref message_id, .. } if message_id == "new")
        );
        let sent: Vec<_> = conn.sent().into_iter().map(|s| s.key.id).collect();
        assert_eq!(sent, vec!["new".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_gates_then_resumes() {
        let fx = ReactorFixture::new().await;
        let mut probe = fx.probe().await;
        let conn = connected(&fx, &mut probe).await;

        conn.fail_next_send(SendError::new(Some(429), "rate-overlimit"));
        conn.deliver(MessageBatch::live(vec![post("m1")])).await;
        let limited = probe
            .next_matching(|e| {
                matches!(
                    e.kind,
                    EventKind::ReactorStatus(StatusChange::RateLimited { .. })
                )
            })
            .await
            .unwrap();
        assert_eq!(
            limited.kind,
            EventKind::ReactorStatus(StatusChange::RateLimited {
                backoff_seconds: 30
            })
        );

        conn.deliver(MessageBatch::live(vec![post("m2")])).await;
        let skip = probe
            .next_matching(|e| matches!(e.kind, EventKind::ReactorSkip { .. }))
            .await
            .unwrap();
        assert_eq!(
            skip.kind,
            EventKind::ReactorSkip {
                reason: SkipReason::BackingOff,
                message_id: "m2".into()
            }
        );
        assert_eq!(conn.sent().len(), 1);

        let resumed_at = Instant::now();
        probe
            .next_matching(|e| is_status(e, &StatusChange::Resumed))
            .await
            .unwrap();
        assert!(resumed_at.elapsed() >= Duration::from_secs(29));

        conn.deliver(MessageBatch::live(vec![post("m1")])).await;
        probe
            .next_matching(|e| matches!(e.kind, EventKind::Reacted { .. }))
            .await
            .unwrap();
        assert_eq!(conn.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_reports_error_and_allows_retry() {
        let fx = ReactorFixture::new().await;
        let mut probe = fx.probe().await;
        let conn = connected(&fx, &mut probe).await;

        conn.fail_next_send(SendError::new(None, "not-authorized"));
        conn.deliver(MessageBatch::live(vec![post("m1")])).await;
        let error = probe
            .next_matching(|e| matches!(e.kind, EventKind::ReactorError { .. }))
            .await
            .unwrap();
        assert_eq!(
            error.kind,
            EventKind::ReactorError {
                error: "not-authorized".into()
            }
        );

        conn.deliver(MessageBatch::live(vec![post("m1")])).await;
        probe
            .next_matching(|e| matches!(e.kind, EventKind::Reacted { .. }))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_backoff() {
        let fx = ReactorFixture::new().await;
        let mut probe = fx.probe().await;
        let conn = connected(&fx, &mut probe).await;

        conn.close_with(Disconnect::new(Some(428), "connection closed"))
            .await;
        probe
            .next_matching(|e| {
                is_status(
                    e,
                    &StatusChange::Disconnected {
                        reason: DisconnectReason::ConnectionLost,
                    },
                )
            })
            .await
            .unwrap();
        let reconnecting = probe
            .next_matching(is_reconnecting)
            .await
            .unwrap();
        assert_eq!(
            reconnecting.kind,
            EventKind::ReactorStatus(StatusChange::Reconnecting {
                attempt: 1,
                delay_ms: 1000
            })
        );

        let before = Instant::now();
        probe
            .next_matching(|e| is_status(e, &StatusChange::Starting))
            .await
            .unwrap();
        assert!(before.elapsed() >= Duration::from_millis(1000));
        assert_eq!(fx.connector.connect_count(), 2);

        let second = fx.connector.last_connection().unwrap();
        second.open().await;
        probe
            .next_matching(|e| is_status(e, &StatusChange::Connected))
            .await
            .unwrap();
        let snapshot = fx.registry.list().await;
        assert_eq!(snapshot[0].reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_ten_reconnects() {
        let fx = ReactorFixture::new().await;
        let mut probe = fx.probe().await;
        let mut conn = connected(&fx, &mut probe).await;

        for attempt in 1..=10u32 {
            conn.close_with(Disconnect::default()).await;
            let event = probe
                .next_matching(is_reconnecting)
                .await
                .unwrap();
            let expected = crate::reactor::backoff_delay(
                attempt,
                Duration::from_millis(1000),
                Duration::from_millis(30_000),
            );
            assert_eq!(
                event.kind,
                EventKind::ReactorStatus(StatusChange::Reconnecting {
                    attempt,
                    delay_ms: expected.as_millis() as u64
                })
            );
            probe
                .next_matching(|e| is_status(e, &StatusChange::Starting))
                .await
                .unwrap();
            conn = fx.connector.last_connection().unwrap();
        }

        conn.close_with(Disconnect::default()).await;
        let exhausted = probe
            .next_matching(|e| {
                matches!(
                    e.kind,
                    EventKind::ReactorStatus(StatusChange::Exhausted { .. })
                )
            })
            .await
            .unwrap();
        assert_eq!(
            exhausted.kind,
            EventKind::ReactorStatus(StatusChange::Exhausted { attempts: 10 })
        );
        assert_eq!(fx.connector.connect_count(), 11);
        assert!(!fx.registry.is_running("s1").await);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fx.connector.connect_count(), 11);
        assert!(
            probe
                .drain()
                .iter()
                .all(|e| !is_reconnecting(e) && !is_status(e, &StatusChange::Stopped))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn logged_out_never_reconnects() {
        let fx = ReactorFixture::new().await;
        let mut probe = fx.probe().await;
        let conn = connected(&fx, &mut probe).await;

        conn.close_with(Disconnect::logged_out()).await;
        probe
            .next_matching(|e| {
                is_status(
                    e,
                    &StatusChange::Disconnected {
                        reason: DisconnectReason::LoggedOut,
                    },
                )
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!fx.registry.is_running("s1").await);
        assert_eq!(fx.connector.connect_count(), 1);
        let rest = probe.drain();
        assert!(
            rest.iter()
                .all(|e| !matches!(e.kind, EventKind::ReactorStatus(_)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnect_counts_as_lost_connection() {
        let fx = ReactorFixture::new().await;
        let mut probe = fx.probe().await;
        let conn = connected(&fx, &mut probe).await;

        fx.connector
            .fail_next_connect(crate::error::GatewayError::ConnectFailed("refused".into()));
        conn.close_with(Disconnect::default()).await;

        probe
            .next_matching(|e| matches!(e.kind, EventKind::ReactorError { .. }))
            .await
            .unwrap();
        let second = probe
            .next_matching(is_reconnecting)
            .await
            .unwrap();
        assert_eq!(
            second.kind,
            EventKind::ReactorStatus(StatusChange::Reconnecting {
                attempt: 2,
                delay_ms: 2000
            })
        );
        probe
            .next_matching(|e| is_status(e, &StatusChange::Starting))
            .await
            .unwrap();
        assert!(fx.registry.is_running("s1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_backoff_cancels_reconnect() {
        let fx = ReactorFixture::new().await;
        let mut probe = fx.probe().await;
        let conn = connected(&fx, &mut probe).await;

        conn.close_with(Disconnect::default()).await;
        probe
            .next_matching(is_reconnecting)
            .await
            .unwrap();

        fx.registry.stop_reactor("s1").await.unwrap();
        probe
            .next_matching(|e| is_status(e, &StatusChange::Stopped))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fx.connector.connect_count(), 1);
        assert!(probe.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_slow_connect_reports_stopped() {
        let fx = Arc::new(ReactorFixture::new().await);
        let mut probe = fx.probe().await;
        fx.connector.delay_next_connect(Duration::from_secs(5));

        let starting = tokio::spawn({
            let fx = fx.clone();
            async move { fx.registry.start_reactor("s1", CHANNEL, "🔥").await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(fx.registry.is_running("s1").await);

        fx.registry.stop_reactor("s1").await.unwrap();
        let started = starting.await.unwrap();
        assert!(matches!(started, Err(ReactorError::Aborted(_))));
        assert!(!fx.registry.is_running("s1").await);

        let kinds: Vec<_> = probe.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::ReactorStatus(StatusChange::Stopped)]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fx.connector.connect_count(), 0);
        assert!(probe.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_closes_connection_and_goes_quiet() {
        let fx = ReactorFixture::new().await;
        let mut probe = fx.probe().await;
        let conn = connected(&fx, &mut probe).await;

        fx.registry.stop_reactor("s1").await.unwrap();
        assert!(conn.was_closed());
        assert!(fx.sessions.store().connection("s1").await.is_none());
        probe
            .next_matching(|e| is_status(e, &StatusChange::Stopped))
            .await
            .unwrap();

        conn.deliver(MessageBatch::live(vec![post("late")])).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(probe.drain().is_empty());
        assert!(conn.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn handle_stop_is_idempotent() {
        let fx = ReactorFixture::new().await;
        let mut probe = fx.probe().await;
        connected(&fx, &mut probe).await;

        let handle = fx.registry.handle("s1").await.unwrap();
        handle.stop().await;
        handle.stop().await;
        assert!(handle.is_finished());
        let stopped: Vec<_> = probe
            .drain()
            .into_iter()
            .filter(|e| is_status(e, &StatusChange::Stopped))
            .collect();
        assert_eq!(stopped.len(), 1);
    }
}
