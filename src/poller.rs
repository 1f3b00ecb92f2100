//! Drives the bridges: (re)starts them whenever the message bus begins a new session and polls
//! them in between.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::climate::Bridge;
use crate::mqtt::MessageBus;

pub struct Poller {
    bridges: Vec<Bridge>,
    bus: Arc<dyn MessageBus>,
    /// The message bus session the bridges were last started for.
    session: Option<u64>,
}

impl Poller {
    pub fn new(bridges: Vec<Bridge>, bus: Arc<dyn MessageBus>) -> Self {
        Self { bridges, bus, session: None }
    }

    /// Run a round every `period` until `shutdown` completes. A round that is in progress when
    /// shutdown is requested is completed first; rounds that fall behind are skipped.
    pub async fn run(&mut self, period: Duration, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!("stopping the poller");
                    return;
                }
                _ = interval.tick() => self.round().await,
            }
        }
    }

    pub async fn round(&mut self) {
        let Some(session) = self.bus.session_id() else {
            debug!("message bus is not connected, skipping the round");
            return;
        };
        if self.session != Some(session) {
            info!(session, bridges = self.bridges.len(), "new message bus session, starting bridges");
            for bridge in &mut self.bridges {
                if let Err(e) = bridge.start().await {
                    warn!(
                        message = "could not start the bridge, retrying in the next round",
                        module = bridge.module(),
                        error = (&e as &dyn std::error::Error)
                    );
                    return;
                }
            }
            self.session = Some(session);
            return;
        }
        for bridge in &self.bridges {
            if let Err(e) = bridge.tick().await {
                warn!(
                    message = "could not poll the module",
                    module = bridge.module(),
                    error = (&e as &dyn std::error::Error)
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::climate::BridgeConfig;
    use crate::testing::{MemoryFieldbus, RecordingBus, module_image};

    fn poller(slaves: &[(u8, &str)]) -> (Arc<MemoryFieldbus>, Arc<RecordingBus>, Poller) {
        let fieldbus = Arc::new(MemoryFieldbus::new());
        let bus = Arc::new(RecordingBus::new());
        let bridges = slaves
            .iter()
            .map(|&(slave, module)| {
                fieldbus.insert_slave(slave, module_image());
                let config = BridgeConfig {
                    module: module.to_string(),
                    slave,
                    prefix: "koolnova2mqtt".to_string(),
                    hass_prefix: "homeassistant".to_string(),
                };
                Bridge::new(config, Arc::clone(&fieldbus) as _, Arc::clone(&bus) as _)
            })
            .collect();
        let poller = Poller::new(bridges, Arc::clone(&bus) as _);
        (fieldbus, bus, poller)
    }

    fn discovery_count(bus: &RecordingBus) -> usize {
        bus.messages().iter().filter(|m| m.topic.ends_with("/config")).count()
    }

    #[tokio::test]
    async fn waits_for_a_session() {
        let (_, bus, mut poller) = poller(&[(49, "first")]);
        bus.set_session(None);
        poller.round().await;
        assert!(bus.messages().is_empty());
        assert_eq!(poller.session, None);
    }

    #[tokio::test]
    async fn starts_then_ticks() {
        let (_, bus, mut poller) = poller(&[(49, "first"), (50, "second")]);
        poller.round().await;
        assert_eq!(poller.session, Some(1));
        assert_eq!(discovery_count(&bus), 2 * 10 * 2);
        assert_eq!(bus.on("koolnova2mqtt/second/sys/slaveId"), vec!["49"]);
        bus.take();

        poller.round().await;
        let messages = bus.take();
        assert_eq!(messages.len(), 2 * 10);
        assert!(messages.iter().all(|m| m.topic.ends_with("/currentTemp")));
    }

    #[tokio::test]
    async fn failed_start_is_retried() {
        let (fieldbus, bus, mut poller) = poller(&[(49, "first")]);
        fieldbus.fail_requests(true);
        poller.round().await;
        assert_eq!(poller.session, None);
        poller.round().await;
        assert_eq!(poller.session, None);
        assert!(bus.messages().is_empty());

        fieldbus.fail_requests(false);
        poller.round().await;
        assert_eq!(poller.session, Some(1));
        assert_eq!(discovery_count(&bus), 10 * 2);
    }

    #[tokio::test]
    async fn failed_tick_does_not_restart() {
        let (fieldbus, bus, mut poller) = poller(&[(49, "first")]);
        poller.round().await;
        bus.take();
        fieldbus.fail_requests(true);
        poller.round().await;
        assert_eq!(poller.session, Some(1));
        fieldbus.fail_requests(false);
        poller.round().await;
        assert_eq!(discovery_count(&bus), 0);
    }

    #[tokio::test]
    async fn reconnection_restarts_the_bridges() {
        let (_, bus, mut poller) = poller(&[(49, "first")]);
        poller.round().await;
        bus.take();
        bus.set_session(None);
        poller.round().await;
        assert!(bus.take().is_empty());
        bus.set_session(Some(2));
        poller.round().await;
        assert_eq!(poller.session, Some(2));
        assert_eq!(discovery_count(&bus), 10 * 2);
        assert_eq!(bus.on("koolnova2mqtt/first/zone1/hvacMode").last().map(String::as_str), Some("cool"));
    }

    #[tokio::test(start_paused = true)]
    async fn runs_until_shutdown() {
        let (_, bus, mut poller) = poller(&[(49, "first")]);
        let shutdown = tokio::time::sleep(Duration::from_millis(2500));
        poller.run(Duration::from_secs(1), shutdown).await;
        assert_eq!(poller.session, Some(1));
        assert_eq!(bus.on("koolnova2mqtt/first/zone1/currentTemp"), vec!["20.5"]);
    }
}
