use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::drivers::{self, ConnectorConfig};
use crate::model::Connector;
use crate::pipeline::EventSubmitter;
use crate::store::{CredentialError, CredentialStore, Store};

use super::transport::{connect_hub, connect_vms, Transport};
use super::{backoff_delay_jittered, ControlMessage, SessionError, SessionState, SessionStatus};

pub(super) struct WorkerContext {
    pub connector_id: String,
    pub store: Arc<Store>,
    pub credentials: Arc<CredentialStore>,
    pub submitter: EventSubmitter,
    pub control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    pub status_tx: watch::Sender<SessionStatus>,
}

impl WorkerContext {
    fn set_status(&self, state: SessionState, last_error: Option<String>) {
        let _ = self.status_tx.send(SessionStatus::new(state, last_error));
    }
}

/// Outcome of one connected stretch, deciding the next worker move.
enum LinkEnd {
    Shutdown,
    Reconnect,
    Dropped(String),
}

/// One worker drives one connector session for its whole lifetime:
/// connect, pump frames, reconnect with backoff, tear down on disable.
pub(super) async fn run(mut ctx: WorkerContext) {
    info!("Initiating session");
    let mut attempts: u32 = 0;
    loop {
        // The connector row is re-read every attempt so config edits and
        // credential rotations take effect on reconnect.
        let connector = match ctx.store.get_connector(&ctx.connector_id) {
            Ok(Some(connector)) if connector.events_enabled => connector,
            Ok(_) => {
                debug!("Connector disabled or deleted; session exiting");
                ctx.set_status(SessionState::Disabled, None);
                return;
            }
            Err(e) => {
                error!(error = %e, "Connector could not be loaded; session exiting");
                ctx.set_status(SessionState::Failed, Some(e.to_string()));
                return;
            }
        };

        ctx.set_status(SessionState::Connecting, None);
        match connect(&connector, &ctx.credentials).await {
            Ok(transport) => {
                attempts = 0;
                ctx.set_status(SessionState::Connected, None);
                info!("Session established");
                match pump(&mut ctx, &connector, transport).await {
                    LinkEnd::Shutdown => {
                        ctx.set_status(SessionState::Disabled, None);
                        return;
                    }
                    LinkEnd::Reconnect => continue,
                    LinkEnd::Dropped(reason) => {
                        warn!(%reason, "Session dropped; reconnecting");
                        attempts = 1;
                        ctx.set_status(SessionState::Reconnecting, Some(reason));
                        if !sleep_backoff(&mut ctx, attempts).await {
                            ctx.set_status(SessionState::Disabled, None);
                            return;
                        }
                    }
                }
            }
            Err(SessionError::AuthRejected(reason)) => {
                // One refresh attempt; only a refused refresh is terminal.
                warn!(%reason, "Session credentials rejected; refreshing token");
                match ctx.credentials.force_refresh(&ctx.connector_id).await {
                    Ok(_) => {
                        attempts += 1;
                        ctx.set_status(SessionState::Reconnecting, Some(reason));
                        if !sleep_backoff(&mut ctx, attempts).await {
                            ctx.set_status(SessionState::Disabled, None);
                            return;
                        }
                    }
                    Err(CredentialError::Auth(auth)) => {
                        error!(error = %auth, "Credentials are invalid; session parked until operator action");
                        ctx.set_status(SessionState::Failed, Some(auth));
                        if !park(&mut ctx).await {
                            ctx.set_status(SessionState::Disabled, None);
                            return;
                        }
                    }
                    Err(e) => {
                        attempts += 1;
                        ctx.set_status(SessionState::Reconnecting, Some(e.to_string()));
                        if !sleep_backoff(&mut ctx, attempts).await {
                            ctx.set_status(SessionState::Disabled, None);
                            return;
                        }
                    }
                }
            }
            Err(e) if is_terminal(&e) => {
                error!(error = %e, "Session failed terminally; parked until operator action");
                ctx.set_status(SessionState::Failed, Some(e.to_string()));
                if !park(&mut ctx).await {
                    ctx.set_status(SessionState::Disabled, None);
                    return;
                }
            }
            Err(e) => {
                attempts += 1;
                warn!(error = %e, attempt = attempts, "Connect failed; backing off");
                ctx.set_status(SessionState::Reconnecting, Some(e.to_string()));
                if !sleep_backoff(&mut ctx, attempts).await {
                    ctx.set_status(SessionState::Disabled, None);
                    return;
                }
            }
        }
    }
}

async fn connect(
    connector: &Connector,
    credentials: &CredentialStore,
) -> Result<Transport, SessionError> {
    match ConnectorConfig::parse(connector)? {
        ConnectorConfig::Hub(cfg) => connect_hub(connector, &cfg, credentials).await,
        ConnectorConfig::Vms(cfg) => connect_vms(&cfg).await,
    }
}

/// Pump frames until the link ends or a control message arrives. Frames
/// are parsed synchronously and handed to the pipeline without blocking.
async fn pump(ctx: &mut WorkerContext, connector: &Connector, mut transport: Transport) -> LinkEnd {
    let idle = transport.idle_timeout();
    let end = loop {
        tokio::select! {
            control = ctx.control_rx.recv() => {
                break match control {
                    Some(ControlMessage::Reconnect) => LinkEnd::Reconnect,
                    Some(ControlMessage::Shutdown) | None => LinkEnd::Shutdown,
                };
            }
            frame = tokio::time::timeout(idle, transport.next_frame()) => match frame {
                Err(_) => break LinkEnd::Dropped("idle timeout expired".into()),
                Ok(Err(e)) => break LinkEnd::Dropped(e.to_string()),
                Ok(Ok(None)) => break LinkEnd::Dropped(SessionError::Closed.to_string()),
                Ok(Ok(Some(raw))) => {
                    let events = drivers::parse_frame(connector, &raw);
                    ctx.submitter.submit(events);
                }
            }
        }
    };
    transport.shutdown().await;
    end
}

/// Back off before the next attempt, still answering control messages.
/// Returns `false` when the worker should exit.
async fn sleep_backoff(ctx: &mut WorkerContext, attempt: u32) -> bool {
    let delay = backoff_delay_jittered(attempt);
    debug!(?delay, attempt, "Backing off before reconnect");
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        control = ctx.control_rx.recv() => match control {
            Some(ControlMessage::Reconnect) => true,
            Some(ControlMessage::Shutdown) | None => false,
        },
    }
}

/// Failed sessions wait for an operator-driven control message instead of
/// burning retries. Returns `false` when the worker should exit.
async fn park(ctx: &mut WorkerContext) -> bool {
    match ctx.control_rx.recv().await {
        Some(ControlMessage::Reconnect) => true,
        Some(ControlMessage::Shutdown) | None => false,
    }
}

fn is_terminal(error: &SessionError) -> bool {
    match error {
        SessionError::Credential(e) => !e.is_transient(),
        SessionError::Driver(e) => !e.is_transient(),
        SessionError::Config(_) => true,
        _ => false,
    }
}
