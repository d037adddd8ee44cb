//! Connection lifecycle.
//!
//! A session is one websocket connection to the exchange. While it is open the
//! [`TelemetryLoop`] and [`CommandLoop`] run concurrently and share a single
//! [`Outbound`] queue; one writer owns the socket sink and sends frames in
//! queue order, so the two loops never write to the socket at the same time.
//!
//! [`SessionSupervisor::run`] keeps sessions going until shutdown. Every ended
//! session, whether closed by the exchange or failed, is followed by an
//! exponential backoff delay. The backoff only starts over once a session has
//! stayed up for [`ReconnectConfig::stable_after`], so an exchange that accepts
//! and immediately closes is not hammered with reconnects.
//!
//! The worker identity is generated once and reused for every session. A job
//! that is still running when its session ends is abandoned.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capacity::{CapacityProbe, CapacitySampler};
use crate::config::{ReconnectConfig, WorkerConfig};
use crate::error::{Result, WorkerError};
use crate::protocol::{encode_envelope, Envelope};
use crate::worker::{CommandLoop, SandboxRunner, TelemetryLoop};

const OUTBOUND_CAPACITY: usize = 64;

/// Cloneable handle for queueing envelopes to the session writer.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Envelope>,
}

impl Outbound {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| WorkerError::OutboundClosed)
    }
}

/// Drain queued envelopes into `sink` as JSON text frames.
///
/// Returns when every [`Outbound`] handle is dropped, or with the first
/// transport error.
pub async fn run_writer<S>(mut sink: S, mut rx: mpsc::Receiver<Envelope>) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(envelope) = rx.recv().await {
        let frame = match encode_envelope(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "Dropping envelope that failed to encode");
                continue;
            }
        };
        sink.send(Message::Text(frame)).await?;
    }
    Ok(())
}

/// Exponential reconnect delay with up to 25% random jitter.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial: config.initial_delay,
            max: config.max_delay,
            current: config.initial_delay,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);

        let jitter_ms = base.as_millis() as u64 / 4;
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        base + Duration::from_millis(jitter)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Owns the connection to the exchange and restarts it when it drops.
pub struct SessionSupervisor {
    config: WorkerConfig,
    identity: Uuid,
    runner: SandboxRunner,
    capacity: CapacitySampler,
}

impl SessionSupervisor {
    pub fn new(config: WorkerConfig, runner: SandboxRunner, probe: Arc<dyn CapacityProbe>) -> Self {
        let capacity = CapacitySampler::new(probe, config.telemetry.load_ceiling);
        Self {
            config,
            identity: Uuid::new_v4(),
            runner,
            capacity,
        }
    }

    pub fn with_identity(mut self, identity: Uuid) -> Self {
        self.identity = identity;
        self
    }

    pub fn identity(&self) -> Uuid {
        self.identity
    }

    /// Keep a session open until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(&self.config.reconnect);
        let mut attempt: u64 = 0;

        tracing::info!(
            identity = %self.identity,
            url = %self.config.exchange_url,
            mode = %self.runner.mode(),
            "Starting exchange worker"
        );

        loop {
            attempt += 1;
            let mut connected_at = None;

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.run_session(attempt, &mut connected_at) => outcome,
            };

            let stable =
                connected_at.is_some_and(|at| at.elapsed() >= self.config.reconnect.stable_after);
            if stable {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            let retry_in_ms = delay.as_millis() as u64;

            match outcome {
                Ok(()) => {
                    tracing::info!(attempt, retry_in_ms, "Session closed by exchange");
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, retry_in_ms, "Session failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(identity = %self.identity, "Session supervisor stopped");
    }

    /// Run one connection to completion. `connected_at` is set once the
    /// websocket handshake succeeds.
    async fn run_session(&self, attempt: u64, connected_at: &mut Option<Instant>) -> Result<()> {
        let url = self.config.exchange_url.as_str();
        tracing::debug!(attempt, url, "Connecting to exchange");

        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|source| WorkerError::Connect {
                url: url.to_string(),
                source,
            })?;
        *connected_at = Some(Instant::now());
        tracing::info!(attempt, url, identity = %self.identity, "Connected to exchange");

        let (sink, inbound) = stream.split();
        let (outbound, rx) = Outbound::channel(OUTBOUND_CAPACITY);

        let telemetry = TelemetryLoop::new(
            self.identity,
            self.config.telemetry.interval,
            self.capacity.clone(),
        );
        let commands = CommandLoop::new(
            self.identity,
            self.runner.clone(),
            self.capacity.clone(),
            self.config.staging_path(),
        );

        tokio::select! {
            result = commands.run(inbound, &outbound) => result,
            result = run_writer(sink, rx) => match result {
                Ok(()) => Err(WorkerError::OutboundClosed),
                Err(e) => Err(e),
            },
            _ = telemetry.run(&outbound) => Ok(()),
        }
    }
}
