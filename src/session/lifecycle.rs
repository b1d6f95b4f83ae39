//! Connection lifecycle: start, stop and the background network-service tick
//!
//! [`ConnectionManager`] owns the observable [`ConnectionState`]. The tick task
//! polls the protocol client, routes every event synchronously through
//! [`SessionEvents`], and runs the reconnect policy after an unexpected loss.
//! Only the manager writes the state channel.

use super::dispatcher::MessageDispatcher;
use crate::config::MqttConfig;
use crate::transport::mqtt::{
    ConnectionEvent, ConnectionState, HealthMonitor, ReconnectPolicy, ReconnectionDecision,
};
use crate::transport::{
    ConnAckCode, DisconnectReason, EventSink, InboundMessage, ProtocolClient, ProtocolEvent,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// How long `stop()` waits for the tick before aborting it
const TICK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// What the tick does after handling one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    /// Leave the loop; the session stays in its current (terminal) state
    Halt,
    /// Run the reconnect policy
    Reconnect,
}

/// Event sink the tick feeds: tracks connection state, subscribes on connect
/// and hands messages to the dispatcher
pub struct SessionEvents<C: ProtocolClient> {
    client: Arc<C>,
    config: Arc<MqttConfig>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    dispatcher: Arc<MessageDispatcher>,
    stop_requested: AtomicBool,
}

impl<C: ProtocolClient> SessionEvents<C> {
    pub fn new(
        client: Arc<C>,
        config: Arc<MqttConfig>,
        state_tx: Arc<watch::Sender<ConnectionState>>,
        dispatcher: Arc<MessageDispatcher>,
    ) -> Self {
        Self {
            client,
            config,
            state_tx,
            dispatcher,
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn set_stop_requested(&self, requested: bool) {
        self.stop_requested.store(requested, Ordering::SeqCst);
    }

    /// Apply one state transition and log it
    pub fn transition(&self, event: ConnectionEvent) -> ConnectionState {
        let current = self.state();
        let next = HealthMonitor::determine_next_state(&current, event);
        HealthMonitor::log_state_transition(&current, &next);
        self.state_tx.send_replace(next.clone());
        next
    }

    /// Route one protocol event and tell the tick how to proceed
    pub fn handle_event(&self, event: ProtocolEvent) -> TickControl {
        match event {
            ProtocolEvent::ConnAck(code) => {
                self.on_connected(code);
                if code.is_success() {
                    TickControl::Continue
                } else {
                    TickControl::Halt
                }
            }
            ProtocolEvent::Message(message) => {
                self.on_message(message);
                TickControl::Continue
            }
            ProtocolEvent::Disconnected(reason) => {
                self.on_disconnected(reason);
                self.after_disconnect()
            }
            ProtocolEvent::Other(description) => {
                debug!(event = %description, "MQTT event");
                TickControl::Continue
            }
        }
    }

    fn after_disconnect(&self) -> TickControl {
        if self.stop_requested() {
            TickControl::Halt
        } else {
            TickControl::Reconnect
        }
    }

    fn subscribe_configured_topics(&self) {
        let qos = self.config.default_qos;
        for topic in &self.config.subscribe_topics {
            let _span = crate::mqtt_span!(operation = "subscribe", topic = %topic).entered();
            match self.client.subscribe(topic, qos) {
                Ok(()) => info!(topic = %topic, qos = %qos, "Subscription requested"),
                Err(e) => error!(topic = %topic, error = %e, "Failed to subscribe"),
            }
        }
    }
}

impl<C: ProtocolClient> EventSink for SessionEvents<C> {
    fn on_connected(&self, code: ConnAckCode) {
        if code.is_success() {
            self.transition(ConnectionEvent::ConnAckAccepted);
            self.subscribe_configured_topics();
        } else {
            error!(
                code = code.code(),
                reason = %code,
                broker = %self.config.broker_address(),
                "Broker refused the connection"
            );
            self.transition(ConnectionEvent::ConnAckRefused(code));
        }
    }

    fn on_message(&self, message: InboundMessage) {
        self.dispatcher.on_message(message);
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        if self.stop_requested() {
            debug!(reason = %reason, "Disconnected during shutdown");
            self.transition(ConnectionEvent::StopRequested);
            return;
        }

        warn!(reason = %reason, "Unexpected disconnection");
        let event = match reason {
            DisconnectReason::ByBroker => ConnectionEvent::DisconnectedByBroker,
            DisconnectReason::Network(error) => ConnectionEvent::NetworkError(error),
        };
        self.transition(event);
    }
}

struct TickRun {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the protocol client's connection and the background tick
pub struct ConnectionManager<C: ProtocolClient> {
    config: Arc<MqttConfig>,
    client: Arc<C>,
    events: Arc<SessionEvents<C>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    policy: ReconnectPolicy,
    tick_interval: Duration,
    running: AtomicBool,
    tick: Mutex<Option<TickRun>>,
}

impl<C: ProtocolClient> ConnectionManager<C> {
    pub fn new(
        config: Arc<MqttConfig>,
        client: Arc<C>,
        dispatcher: Arc<MessageDispatcher>,
        policy: ReconnectPolicy,
        tick_interval: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Stopped);
        let state_tx = Arc::new(state_tx);
        let events = Arc::new(SessionEvents::new(
            Arc::clone(&client),
            Arc::clone(&config),
            Arc::clone(&state_tx),
            dispatcher,
        ));

        Self {
            config,
            client,
            events,
            state_tx,
            policy,
            tick_interval,
            running: AtomicBool::new(false),
            tick: Mutex::new(None),
        }
    }

    /// Initiate the connection and spawn the tick. Failures are logged, not returned.
    pub async fn start(&self) {
        let mut tick = self.tick.lock().await;
        if self.running.load(Ordering::SeqCst) {
            warn!(client_id = %self.config.client_id, "Session already running; start ignored");
            return;
        }

        self.events.set_stop_requested(false);
        self.events.transition(ConnectionEvent::ConnectRequested);
        info!(
            broker = %self.config.broker_address(),
            client_id = %self.config.client_id,
            "Connecting to MQTT broker"
        );

        if let Err(e) = self.client.connect(&self.config).await {
            error!(
                broker = %self.config.broker_address(),
                error = %e,
                "Failed to initiate MQTT connection"
            );
            self.events.transition(ConnectionEvent::StartFailed);
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = TickRunner {
            client: Arc::clone(&self.client),
            config: Arc::clone(&self.config),
            events: Arc::clone(&self.events),
            policy: self.policy.clone(),
            tick_interval: self.tick_interval,
            shutdown_rx,
            reconnect_attempts: 0,
        };
        let span = crate::session_span!(client_id = %self.config.client_id);
        let handle = tokio::spawn(runner.run().instrument(span));

        self.running.store(true, Ordering::SeqCst);
        *tick = Some(TickRun {
            shutdown_tx,
            handle,
        });
    }

    /// Stop the tick, disconnect and settle in `Stopped`. No-op when not running.
    pub async fn stop(&self) {
        let mut tick = self.tick.lock().await;
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Session not running; stop ignored");
            return;
        }

        self.events.set_stop_requested(true);

        if let Some(TickRun {
            shutdown_tx,
            mut handle,
        }) = tick.take()
        {
            // The tick may already have halted and dropped its receiver
            let _ = shutdown_tx.send(true);

            match tokio::time::timeout(TICK_SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!("Session tick shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(error = %e, "Session tick ended abnormally");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Session tick did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "MQTT disconnect failed");
        }

        self.events.transition(ConnectionEvent::StopRequested);
        info!(client_id = %self.config.client_id, "Session stopped");
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    /// Whether the background tick is still servicing the connection.
    /// False after a refused CONNACK or an exhausted reconnect budget.
    pub async fn is_ticking(&self) -> bool {
        self.tick
            .lock()
            .await
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            *self.state_tx.borrow(),
            ConnectionState::PermanentlyDisconnected(_)
        )
    }

    pub fn events(&self) -> &Arc<SessionEvents<C>> {
        &self.events
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}

impl<C: ProtocolClient> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        if let Some(run) = self.tick.get_mut().take() {
            debug!("Session dropped while running; aborting tick");
            run.handle.abort();
        }
    }
}

/// State owned by the background tick task
struct TickRunner<C: ProtocolClient> {
    client: Arc<C>,
    config: Arc<MqttConfig>,
    events: Arc<SessionEvents<C>>,
    policy: ReconnectPolicy,
    tick_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_attempts: u32,
}

impl<C: ProtocolClient> TickRunner<C> {
    async fn run(mut self) {
        debug!("Session tick started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let step = tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => break,
                step = self.client.poll_event() => step,
            };

            let control = match step {
                Ok(None) => {
                    if !self.interruptible_sleep(self.tick_interval).await {
                        break;
                    }
                    continue;
                }
                Ok(Some(event)) => {
                    let control = self.events.handle_event(event);
                    if self.events.state().is_connected() {
                        self.reconnect_attempts = 0;
                    }
                    control
                }
                Err(e) => {
                    self.events
                        .on_disconnected(DisconnectReason::Network(e.to_string()));
                    self.events.after_disconnect()
                }
            };

            match control {
                TickControl::Continue => tokio::task::yield_now().await,
                TickControl::Halt => break,
                TickControl::Reconnect => {
                    if !self.reconnect().await {
                        break;
                    }
                }
            }
        }

        debug!(state = %self.events.state(), "Session tick stopped");
    }

    /// Sleep unless shutdown is signalled first; false means shut down
    async fn interruptible_sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown_rx.changed() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Run the reconnect policy until a connect is initiated (true) or the
    /// session must stay down (false)
    async fn reconnect(&mut self) -> bool {
        loop {
            let decision = HealthMonitor::should_attempt_reconnection(
                self.reconnect_attempts,
                &self.policy,
                self.events.stop_requested(),
            );

            match decision {
                ReconnectionDecision::Proceed { attempt, delay } => {
                    self.reconnect_attempts = attempt;
                    self.events
                        .transition(ConnectionEvent::ReconnectionStarted(attempt));

                    let max_display = self
                        .policy
                        .max_attempts
                        .map_or("unlimited".to_string(), |max| max.to_string());
                    info!(
                        attempt,
                        max_attempts = %max_display,
                        delay_ms = delay.as_millis() as u64,
                        "Attempting reconnection"
                    );

                    if !self.interruptible_sleep(delay).await {
                        return false;
                    }

                    let connected = tokio::select! {
                        biased;
                        _ = self.shutdown_rx.changed() => return false,
                        result = self.client.connect(&self.config) => result,
                    };

                    match connected {
                        // The acknowledgement arrives through the tick
                        Ok(()) => return true,
                        Err(e) => {
                            warn!(attempt, error = %e, "Reconnection attempt failed");
                            self.events
                                .transition(ConnectionEvent::ConnectFailed(e.to_string()));
                        }
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    debug!("Shutdown requested, abandoning reconnection");
                    return false;
                }
                ReconnectionDecision::AbortDisabled => {
                    info!("Automatic reconnection disabled; session stays disconnected");
                    return false;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    let max_attempts = self
                        .policy
                        .max_attempts
                        .unwrap_or(self.reconnect_attempts);
                    self.events.transition(ConnectionEvent::PermanentFailure(format!(
                        "Max reconnection attempts ({max_attempts}) exceeded"
                    )));
                    return false;
                }
            }
        }
    }
}
