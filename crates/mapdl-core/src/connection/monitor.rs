//! Background liveness tasks: the heartbeat and the health watch.

use super::state::ConnectionState;
use super::Shared;
use crate::cancel::CancellationToken;
use crate::error::{MapdlError, Result};
use crate::rpc::{Call, Reply, StatusCode, StreamItem, TransportConnector};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Inquiry used as the cheap liveness probe.
pub(crate) const PROBE_FUNCTION: &str = "JOBNAME";

/// Probe the solver every `interval` until cancelled or a probe fails.
///
/// A failed probe marks the connection degraded and ends the loop; the
/// caller decides whether to reconnect.
pub(crate) fn spawn_heartbeat(shared: Arc<Shared>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let peer = shared.transport.peer();
        debug!("Heartbeat for {} every {:?}", peer, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if shared.state.get() == ConnectionState::Exited {
                break;
            }

            let probe = shared
                .transport
                .unary(Call::Inquire {
                    function: PROBE_FUNCTION.to_string(),
                })
                .await;
            match probe {
                Ok(_) => debug!("Heartbeat to {} ok", peer),
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!("Heartbeat to {} failed: {}", peer, e);
                    shared.state.mark_degraded();
                    break;
                }
            }
        }
        debug!("Heartbeat for {} stopped", peer);
    })
}

/// Subscribe to the solver's health stream on a dedicated channel.
///
/// Returns `Ok(None)` when the endpoint has no health service or the
/// subscription could not be opened. A first status of "not serving" is an
/// error. Once running, a lost or "not serving" stream marks the connection
/// degraded.
pub(crate) async fn start_health_watch(
    connector: Arc<dyn TransportConnector>,
    addr: &str,
    timeout: Duration,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) -> Result<Option<JoinHandle<()>>> {
    let transport = match connector.connect(addr, timeout).await {
        Ok(transport) => transport,
        Err(e) => {
            warn!("Could not open a health channel to {}: {}", addr, e);
            return Ok(None);
        }
    };

    let (first_tx, first_rx) = oneshot::channel::<Result<bool>>();
    let peer = addr.to_string();

    let task = tokio::spawn(async move {
        let mut first = Some(first_tx);
        let outcome = {
            let mut sink = |item: StreamItem| -> Result<()> {
                let serving = match item {
                    StreamItem::Reply(Reply::Health { serving }) => serving,
                    _ => return Ok(()),
                };
                match first.take() {
                    Some(tx) => {
                        let _ = tx.send(Ok(serving));
                    }
                    None if !serving => {
                        warn!("MAPDL at {} reports not serving", peer);
                        shared.state.mark_degraded();
                    }
                    None => debug!("MAPDL at {} is serving", peer),
                }
                Ok(())
            };
            tokio::select! {
                _ = cancel.cancelled() => None,
                outcome = transport.server_stream(Call::HealthWatch, &mut sink) => Some(outcome),
            }
        };
        transport.close().await;

        let Some(outcome) = outcome else {
            return;
        };
        if let Some(tx) = first.take() {
            let _ = tx.send(outcome.and_then(|_| {
                Err(MapdlError::Protocol {
                    message: "health watch ended without a status".into(),
                })
            }));
            return;
        }
        if cancel.is_cancelled() || shared.state.get() == ConnectionState::Exited {
            return;
        }
        match outcome {
            Ok(()) => warn!("Health watch for {} ended", peer),
            Err(e) => warn!("Lost health watch for {}: {}", peer, e),
        }
        shared.state.mark_degraded();
    });

    let first = match tokio::time::timeout(timeout, first_rx).await {
        Ok(Ok(first)) => first,
        Ok(Err(_)) => Err(MapdlError::Internal("health watch task ended early".into())),
        Err(_) => Err(MapdlError::ConnectionTimeout {
            addr: addr.to_string(),
            timeout,
        }),
    };

    match first {
        Ok(true) => {
            info!("Health watch enabled for {}", addr);
            Ok(Some(task))
        }
        Ok(false) => {
            task.abort();
            Err(MapdlError::ConnectionClosed {
                addr: addr.to_string(),
                message: "unable to enable health check: MAPDL is not serving".into(),
            })
        }
        Err(MapdlError::Remote {
            code: StatusCode::Unimplemented,
            ..
        }) => {
            debug!("MAPDL at {} has no health service", addr);
            Ok(None)
        }
        Err(e) => {
            task.abort();
            warn!("Health watch for {} not started: {}", addr, e);
            Ok(None)
        }
    }
}
