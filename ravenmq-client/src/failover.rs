//! Connecting, reconnecting and session replay.
//!
//! Faults are funneled through one channel per connection and handled by a
//! single loop, so at most one failover runs at a time. The loop holds the
//! failover gate's write side from the moment it accepts a fault until every
//! session has been replayed on the new transport.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::LocatorConfig;
use crate::connection::{ConnectionInner, ConnectionState, FailoverEvent};
use crate::error::RavenClientError;
use crate::locator::LocatorInner;
use crate::session::SessionInner;
use crate::topology::Endpoint;
use crate::transport::{
    with_call_timeout, BrokerTransport, EventReceiver, EventSender, SessionSpec, WeakEventSender,
};
use crate::Result;

/// A broken transport, identified by its generation
#[derive(Debug, Clone)]
pub(crate) struct Fault {
    pub(crate) generation: u64,
    pub(crate) reason: String,
}

pub(crate) type Connected = (
    Arc<dyn BrokerTransport>,
    Endpoint,
    WeakEventSender,
    EventReceiver,
);

/// Open a transport with a fresh event channel
pub(crate) async fn connect_to(
    locator: &LocatorInner,
    endpoint: &Endpoint,
    timeout: Duration,
) -> Result<Connected> {
    let (events, rx) = EventSender::channel();
    let weak = events.downgrade();
    let transport = with_call_timeout(timeout, locator.connector.connect(endpoint, events)).await?;
    Ok((transport, endpoint.clone(), weak, rx))
}

/// First connection of a new client connection.
///
/// Every round tries the candidates in policy order; rounds are separated by
/// the retry backoff.
pub(crate) async fn initial_connect(
    locator: &LocatorInner,
    config: &LocatorConfig,
) -> Result<Connected> {
    let rounds = config.retry.initial_connect_attempts.max(1);
    let mut last_error = None;

    for round in 0..rounds {
        if round > 0 {
            tokio::time::sleep(config.retry.delay_for_attempt(round - 1)).await;
        }

        for endpoint in locator.ordered(locator.live_candidates()) {
            match connect_to(locator, &endpoint, config.call_timeout).await {
                Ok(connected) => return Ok(connected),
                Err(e) => {
                    debug!(endpoint = %endpoint, round, error = %e, "Initial connect failed");
                    last_error = Some(e);
                }
            }

            if config.retry.failover_on_initial_connection {
                if let Some(backup) = locator.topology.backup_for(&endpoint) {
                    match connect_to(locator, &backup, config.call_timeout).await {
                        Ok(connected) => {
                            info!(live = %endpoint, backup = %backup, "Connected to backup on initial connection");
                            return Ok(connected);
                        }
                        Err(e) => last_error = Some(e),
                    }
                }
            }
        }
    }

    Err(last_error.unwrap_or(RavenClientError::NoServersAvailable))
}

/// Where to go after `failed` broke: its backup, then the other live
/// servers in policy order, then `failed` itself
pub(crate) fn failover_candidates(locator: &LocatorInner, failed: &Endpoint) -> Vec<Endpoint> {
    let mut candidates = Vec::new();
    if let Some(backup) = locator.topology.backup_for(failed) {
        candidates.push(backup);
    }

    let others: Vec<Endpoint> = locator
        .live_candidates()
        .into_iter()
        .filter(|e| e != failed && !candidates.contains(e))
        .collect();
    candidates.extend(locator.ordered(others));

    if !candidates.contains(failed) {
        candidates.push(failed.clone());
    }
    candidates
}

pub(crate) fn spawn_failover_loop(
    connection: &Arc<ConnectionInner>,
    faults: mpsc::UnboundedReceiver<Fault>,
) {
    let weak = Arc::downgrade(connection);
    connection
        .services
        .spawn("failover", run_failover_loop(weak, faults));
}

async fn run_failover_loop(connection: Weak<ConnectionInner>, mut faults: mpsc::UnboundedReceiver<Fault>) {
    while let Some(fault) = faults.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        if connection.is_closed() {
            break;
        }
        handle_fault(&connection, fault).await;
        if connection.is_closed() {
            break;
        }
    }
    debug!("Failover loop stopped");
}

async fn handle_fault(connection: &Arc<ConnectionInner>, fault: Fault) {
    let mut slot = connection.gate.write().await;
    if slot.generation != fault.generation || slot.transport.is_none() || connection.is_closed() {
        debug!(
            connection = %connection.id,
            stale = fault.generation,
            current = slot.generation,
            "Ignoring stale fault"
        );
        return;
    }

    let generation = slot.generation;
    let failed = slot
        .endpoint
        .clone()
        .unwrap_or_else(|| Endpoint::new("unknown", 0));
    let error = RavenClientError::connection(fault.reason.clone());

    warn!(connection = %connection.id, endpoint = %failed, reason = %fault.reason, "Connection failure detected");
    connection.set_status(ConnectionState::FailingOver, generation);
    connection.active_generation.store(0, Ordering::Release);
    connection.emit(FailoverEvent::FailoverStarted { from: failed.clone() });
    for listener in connection.failure_listeners() {
        listener.before_reconnect(&error);
    }

    if let Some(old) = slot.take() {
        old.abort().await;
    }

    let config = connection.locator.config();
    let mut reconnected = None;
    let mut last_error = RavenClientError::connection(fault.reason.clone());

    'attempts: for (attempt, delay) in config.retry.backoff_schedule().enumerate() {
        tokio::select! {
            _ = connection.shutdown.cancelled() => break 'attempts,
            _ = tokio::time::sleep(delay) => {}
        }

        for endpoint in failover_candidates(&connection.locator, &failed) {
            let (transport, endpoint, events, rx) =
                match connect_to(&connection.locator, &endpoint, config.call_timeout).await {
                    Ok(connected) => connected,
                    Err(e) => {
                        debug!(endpoint = %endpoint, attempt, error = %e, "Reconnect attempt failed");
                        last_error = e;
                        continue;
                    }
                };

            match replay_sessions(connection, &transport).await {
                Ok(()) => {
                    reconnected = Some((transport, endpoint, events, rx));
                    break 'attempts;
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Session replay failed");
                    transport.abort().await;
                    last_error = e;
                }
            }
        }
    }

    match reconnected {
        Some((transport, endpoint, events, rx)) => {
            let next = generation + 1;
            connection.active_generation.store(next, Ordering::Release);
            let pump = connection.start_pump(next, rx);
            slot.install(transport, endpoint.clone(), next, events, pump);
            drop(slot);

            connection.touch();
            connection.set_status(ConnectionState::Connected, next);
            connection.emit(FailoverEvent::FailoverCompleted {
                to: endpoint.clone(),
                generation: next,
            });
            connection.locator.metrics.record_failover();
            info!(connection = %connection.id, from = %failed, to = %endpoint, generation = next, "Failover completed");

            for listener in connection.failure_listeners() {
                listener.connection_failed(&error, true);
            }
        }
        None => {
            drop(slot);
            fail_connection(connection, generation, last_error).await;
        }
    }
}

/// Give up on the connection after a fault could not be recovered
async fn fail_connection(connection: &Arc<ConnectionInner>, generation: u64, cause: RavenClientError) {
    if !connection.mark_closed() {
        return;
    }
    error!(connection = %connection.id, error = %cause, "Failover failed, closing connection");

    connection.set_status(ConnectionState::Closed, generation);
    connection.emit(FailoverEvent::FailoverFailed {
        reason: cause.to_string(),
    });
    connection.locator.metrics.record_failover_failure();

    let lost = RavenClientError::connection_lost(cause.to_string());
    for listener in connection.failure_listeners() {
        listener.connection_failed(&lost, false);
    }

    connection.close_sessions_locally().await;
    connection.shutdown.cancel();
    connection.services.shutdown();
}

async fn replay_sessions(
    connection: &Arc<ConnectionInner>,
    transport: &Arc<dyn BrokerTransport>,
) -> Result<()> {
    for session in connection.sessions() {
        if session.is_closed() {
            continue;
        }
        replay_session(&session, transport).await?;
    }
    Ok(())
}

/// Re-create one session on a new transport: consumers first, then the
/// sends the server has not confirmed
async fn replay_session(session: &Arc<SessionInner>, transport: &Arc<dyn BrokerTransport>) -> Result<()> {
    let spec = SessionSpec {
        name: session.name.clone(),
        ack_mode: session.ack_mode,
        confirmation_window_size: session.config.confirmation_window_size,
    };
    let attach = transport.create_session(&spec).await?;
    session.begin_replay();

    for consumer in session.consumers_in_order() {
        transport
            .create_consumer(&session.name, &consumer.spec())
            .await?;
    }

    if let Some(last) = attach.last_received_sequence {
        session.handle_confirmation(last);
    }

    let pending = session.pending_resends();
    let resent = pending.len() as u64;
    for packet in pending {
        packet.transmit(transport.as_ref(), &session.name).await?;
    }
    if resent > 0 {
        session.metrics.record_resend(resent);
        debug!(session = %session.name, resent, "Resent unconfirmed packets");
    }

    if session.is_started() {
        transport.start(&session.name).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadBalancingPolicyKind;
    use crate::invm::InVmCluster;
    use crate::locator::ServerLocator;

    #[tokio::test]
    async fn test_failover_candidates_prefer_backup() {
        let cluster = InVmCluster::new();
        let (live_a, backup_a) = cluster.add_node("a");
        let (live_b, _) = cluster.add_node("b");

        let config = LocatorConfig::builder()
            .load_balancing_policy(LoadBalancingPolicyKind::First)
            .build()
            .unwrap();
        let locator = ServerLocator::new(cluster.connector(), vec![live_a.clone()], true, config).unwrap();
        let connection = locator.create_connection().await.unwrap();

        let candidates = failover_candidates(locator.inner(), &live_a);
        assert_eq!(candidates[0], backup_a);
        assert!(candidates.contains(&live_b));
        assert_eq!(candidates.last(), Some(&live_a));

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_initial_connect_reports_no_servers() {
        let cluster = InVmCluster::new();
        let (live, _) = cluster.add_node("a");
        cluster.kill_node("a");
        cluster.kill_backup("a");

        let config = LocatorConfig::builder()
            .initial_connect_attempts(2)
            .retry_interval(Duration::from_millis(5))
            .max_retry_interval(Duration::from_millis(5))
            .build()
            .unwrap();
        let locator = ServerLocator::new(cluster.connector(), vec![live], false, config).unwrap();
        let err = locator.create_connection().await.unwrap_err();
        assert!(err.is_connection_error());
    }
}
