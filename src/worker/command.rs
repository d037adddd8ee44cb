use std::path::PathBuf;

use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::capacity::CapacitySampler;
use crate::error::Result;
use crate::protocol::{decode_command, decode_file_content, Envelope, InboundCommand, JobResult};
use crate::session::Outbound;
use crate::worker::SandboxRunner;

/// Receives commands from the exchange and answers `run-file` jobs.
///
/// Jobs run one at a time: the next frame is not read until the current job's
/// result has been queued for sending.
pub struct CommandLoop {
    identity: Uuid,
    runner: SandboxRunner,
    capacity: CapacitySampler,
    staging_path: PathBuf,
}

impl CommandLoop {
    pub fn new(
        identity: Uuid,
        runner: SandboxRunner,
        capacity: CapacitySampler,
        staging_path: PathBuf,
    ) -> Self {
        Self {
            identity,
            runner,
            capacity,
            staging_path,
        }
    }

    /// Process inbound frames until the connection ends.
    ///
    /// Returns `Ok(())` when the exchange closes the connection and an error
    /// when the transport fails.
    pub async fn run<S>(&self, mut inbound: S, outbound: &Outbound) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
    {
        while let Some(frame) = inbound.next().await {
            match frame {
                Ok(Message::Text(text)) => self.handle_frame(text.as_bytes(), outbound).await,
                Ok(Message::Binary(data)) => self.handle_frame(&data, outbound).await,
                Ok(Message::Close(frame)) => {
                    tracing::info!(frame = ?frame, "Exchange closed the connection");
                    return Ok(());
                }
                Ok(_) => {}
                Err(tungstenite::Error::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!("Inbound stream ended");
        Ok(())
    }

    async fn handle_frame(&self, frame: &[u8], outbound: &Outbound) {
        let command = match decode_command(frame) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed inbound frame");
                return;
            }
        };

        if !command.is_run_file() {
            tracing::debug!(command = ?command.command, "Ignoring unsupported command");
            return;
        }

        tracing::info!(token = ?command.token, file_name = ?command.file_name, "Received run-file command");
        let result = self.run_file(&command).await;

        let memory = self.capacity.read().await;
        let envelope = Envelope::response(self.identity, memory, result, command.token);
        match outbound.send(envelope).await {
            Ok(()) => tracing::debug!("Job result queued"),
            Err(e) => tracing::error!(error = %e, "Failed to send job result"),
        }
    }

    async fn run_file(&self, command: &InboundCommand) -> JobResult {
        let (_, file_content) = match command.job_fields() {
            Ok(fields) => fields,
            Err(message) => {
                tracing::warn!(%message, "Rejecting run-file command");
                return JobResult::error(message);
            }
        };

        let source = match decode_file_content(file_content) {
            Ok(source) => source,
            Err(e) => return JobResult::error(format!("invalid file_content: {}", e)),
        };

        if let Err(e) = tokio::fs::write(&self.staging_path, &source).await {
            tracing::error!(path = %self.staging_path.display(), error = %e, "Failed to stage job");
            return JobResult::error(format!("failed to stage job: {}", e));
        }

        self.runner.run(&self.staging_path).await
    }
}
