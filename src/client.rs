//! Client loop — queued inbound delivery plus the render/push timer.
//!
//! One task owns the session. Inbound messages wait in an mpsc queue and are
//! handled one at a time between timer ticks, so no handler ever runs
//! concurrently with another or with a tick. The session is `!Send`; run the
//! loop on the current task (or a `LocalSet`), never through `tokio::spawn`.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

use crate::insitu::SimulationLink;
use crate::link::SessionLink;
use crate::message::StateMessage;
use crate::render::ViewHost;
use crate::session::{self, Session, SessionError, TickReport};

/// Totals over the lifetime of one client loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub received: usize,
    pub rejected: usize,
    pub ticks: usize,
    pub pushed: usize,
    pub rendered: usize,
}

impl ClientStats {
    fn record(&mut self, tick: TickReport) {
        self.ticks += 1;
        self.pushed += tick.pushed;
        self.rendered += tick.rendered;
    }
}

/// Run until `inbound` closes, then flush with one final tick.
///
/// # Errors
///
/// Returns an error only if the final tick fails. Errors from individual
/// messages and periodic ticks are logged and counted.
pub async fn run_client<L, S, V>(
    session: &mut Session<L, S>,
    mut inbound: mpsc::Receiver<StateMessage>,
    views: &mut V,
    interval: Duration,
) -> Result<ClientStats, SessionError>
where
    L: SessionLink,
    S: SimulationLink,
    V: ViewHost + ?Sized,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats = ClientStats::default();

    loop {
        tokio::select! {
            msg = inbound.recv() => {
                let Some(msg) = msg else { break };
                stats.received += 1;
                if let Err(e) = session.receive(msg) {
                    stats.rejected += 1;
                    session::report(&e, "receive");
                }
            }
            _ = ticker.tick() => {
                match session.tick(views) {
                    Ok(tick) => stats.record(tick),
                    Err(e) => session::report(&e, "tick"),
                }
            }
        }
    }

    stats.record(session.tick(views)?);
    info!(
        received = stats.received,
        rejected = stats.rejected,
        ticks = stats.ticks,
        "client: inbound closed"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::message::{self, Variant};
    use crate::proxy::ProxyTree;
    use crate::test_support::{RecordingLink, RecordingSimulation, RecordingViews};

    fn session() -> Session<RecordingLink, RecordingSimulation> {
        Session::new(RecordingLink::default(), RecordingSimulation::default(), &SessionConfig::default())
    }

    #[tokio::test]
    async fn queued_renders_are_drained_once() {
        let mut session = session();
        let mut views = RecordingViews::default();
        let (tx, rx) = mpsc::channel(16);
        for _ in 0..5 {
            tx.send(message::render(4)).await.unwrap();
        }
        drop(tx);

        let stats = run_client(&mut session, rx, &mut views, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(stats.received, 5);
        assert_eq!(views.rendered, vec![4]);
        assert!(session.collab().link().sent.is_empty());
    }

    #[tokio::test]
    async fn bad_messages_are_counted_not_fatal() {
        let mut session = session();
        let mut views = RecordingViews::default();
        let (tx, rx) = mpsc::channel(4);
        let orphan = message::proxy_state(3, &crate::proxy::ProxyState::default())
            .with_value("property:x", Variant::Integer(1));
        tx.send(message::StateMessage::new(message::MessageKind::UserData, 3)).await.unwrap();
        tx.send(orphan).await.unwrap();
        drop(tx);

        let stats = run_client(&mut session, rx, &mut views, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.rejected, 1);
        assert!(session.tree().contains(3));
    }

    #[tokio::test]
    async fn timer_pushes_local_edits() {
        let mut session = session();
        session.receive(message::welcome(1)).unwrap();
        let mut relay = crate::collaboration::CollaborationManager::new(RecordingLink::default());
        relay.connect(1, "A");
        session.receive(relay.membership_message()).unwrap();
        session.create_proxy("sources", "Sphere").unwrap();

        let mut views = RecordingViews::default();
        let (tx, rx) = mpsc::channel::<StateMessage>(1);
        let closer = async move {
            tokio::time::sleep(Duration::from_millis(90)).await;
            drop(tx);
        };
        let (stats, ()) = tokio::join!(
            run_client(&mut session, rx, &mut views, Duration::from_millis(20)),
            closer
        );
        let stats = stats.unwrap();
        assert!(stats.ticks >= 2);
        assert_eq!(stats.pushed, 1);
        assert_eq!(session.collab().link().sent.len(), 1);
    }
}
