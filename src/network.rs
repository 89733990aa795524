//! The presence engine: periodic self-announcement, the introduction
//! handshake, farewells, restart detection and the maintenance/clustering
//! loop, all riding on the broker adapter.
//!
//! One [`Network`] owns the neighbourhood map (last-known status snapshot
//! per peer, replaced wholesale on every inbound update) and shares the
//! [`LocalNara`] with the sensors task. Inbound broker messages are
//! dispatched by topic; every handler is tolerant of malformed payloads
//! (log and drop) and of peers it has never heard of.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broker::{
    topic_matches, Broker, BrokerConfig, BrokerError, BrokerEvent, TOPIC_CHAU, TOPIC_HEY_THERE,
    TOPIC_NEWSPAPER_PREFIX, TOPIC_PING_PREFIX,
};
use crate::clustering;
use crate::codec;
use crate::local::LocalNara;
use crate::nara::{now_unix, Nara, NaraStatus, OnlineStatus, PingEvent};
use crate::opinion;

/// Seconds of silence after which an ONLINE peer is marked MISSING.
const MISSING_AFTER_SECS: i64 = 100;
/// Delay before the one-shot opinion-forming pass.
const OPINION_DELAY: Duration = Duration::from_secs(40);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);
/// Chattiness at or below which inbound newspapers start being shed.
const SKIP_THRESHOLD: i64 = 10;

pub struct Network {
    local: Arc<LocalNara>,
    broker: Broker,
    neighbourhood: Mutex<HashMap<String, Nara>>,
    /// Unix seconds of the last hey-there we published; rate-limits the
    /// introduction handshake so it terminates.
    last_hey_there: Mutex<i64>,
    skipping_events: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Network {
    /// Connect to the broker (fatal if unreachable) and launch the
    /// background tasks: inbound dispatch, periodic announcements, the
    /// deferred opinion pass and the maintenance/clustering loop.
    pub async fn start(
        local: Arc<LocalNara>,
        config: &BrokerConfig,
    ) -> Result<Arc<Network>, BrokerError> {
        let (broker, events) = Broker::connect(config).await?;
        let network = Arc::new(Network::with_broker(local, broker));

        let mut tasks = network.tasks.lock().expect("task list lock poisoned");
        tasks.push(tokio::spawn(Arc::clone(&network).dispatch_loop(events)));
        tasks.push(tokio::spawn(Arc::clone(&network).announce_loop()));
        tasks.push(tokio::spawn(Arc::clone(&network).opinion_loop()));
        tasks.push(tokio::spawn(Arc::clone(&network).maintenance_loop()));
        drop(tasks);

        Ok(network)
    }

    fn with_broker(local: Arc<LocalNara>, broker: Broker) -> Network {
        Network {
            local,
            broker,
            neighbourhood: Mutex::new(HashMap::new()),
            last_hey_there: Mutex::new(0),
            skipping_events: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Read-only snapshot of every known neighbour, for UIs and observers.
    pub fn neighbourhood(&self) -> HashMap<String, Nara> {
        self.hood().clone()
    }

    /// Publish a farewell and mark ourselves OFFLINE.
    pub fn chau(&self) {
        log::info!("posting farewell on {TOPIC_CHAU}");
        let now = now_unix();
        let mut observation = self.local.me_observation();
        observation.online = OnlineStatus::Offline;
        observation.last_seen = now;
        self.local.set_me_observation(observation);

        self.post_event(TOPIC_CHAU, &self.local.me());
    }

    /// Graceful shutdown: farewell, broker disconnect, task teardown.
    pub fn shutdown(&self) {
        self.chau();
        self.broker.disconnect();
        for task in self.tasks.lock().expect("task list lock poisoned").drain(..) {
            task.abort();
        }
    }

    /// Publish one latency measurement on behalf of the ping measurer.
    pub fn post_ping(&self, ping: &PingEvent) {
        let topic = format!("{TOPIC_PING_PREFIX}{}/{}", ping.from, ping.to);
        self.post_event(&topic, ping);
    }

    fn hood(&self) -> MutexGuard<'_, HashMap<String, Nara>> {
        self.neighbourhood.lock().expect("neighbourhood lock poisoned")
    }

    fn post_event<T: Serialize>(&self, topic: &str, event: &T) {
        match codec::encode(event) {
            Ok(payload) => self.broker.publish(topic, payload),
            Err(e) => log::warn!("failed to encode event for {topic}: {e}"),
        }
    }

    // ─── Background tasks ────────────────────────────────────────────────────

    async fn dispatch_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<BrokerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                // Fresh broker session: introduce ourselves (again).
                BrokerEvent::Connected => self.hey_there(),
                BrokerEvent::Message { topic, payload } => self.dispatch(&topic, &payload),
            }
        }
    }

    async fn announce_loop(self: Arc<Self>) {
        loop {
            let secs = self.local.chattiness_rate(20, 30);
            tokio::time::sleep(Duration::from_secs(secs)).await;
            self.announce();
        }
    }

    async fn opinion_loop(self: Arc<Self>) {
        // Give the neighbourhood time to fill up before forming beliefs.
        tokio::time::sleep(OPINION_DELAY).await;
        self.form_opinion();
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            ticker.tick().await;
            self.observation_maintenance();
            self.calculate_clusters();
        }
    }

    // ─── Dispatch ────────────────────────────────────────────────────────────

    fn dispatch(&self, topic: &str, payload: &[u8]) {
        if topic_matches("nara/newspaper/#", topic) {
            self.handle_newspaper(topic, payload, &mut rand::thread_rng());
        } else if topic == TOPIC_HEY_THERE {
            self.handle_hey_there(payload);
        } else if topic == TOPIC_CHAU {
            self.handle_chau(payload);
        } else if topic_matches("nara/ping/#", topic) {
            self.handle_ping(payload);
        } else {
            log::debug!("message on unhandled topic {topic}");
        }
    }

    // ─── Presence protocol ───────────────────────────────────────────────────

    /// Announce our current status on the newspaper topic, refreshing our
    /// own observation first so neighbours and we agree that we are online.
    fn announce(&self) {
        let name = self.local.name().to_string();
        self.record_observation_online(&name);
        let topic = format!("{TOPIC_NEWSPAPER_PREFIX}{name}");
        self.post_event(&topic, &self.local.status());
    }

    fn handle_newspaper(&self, topic: &str, payload: &[u8], rng: &mut impl Rng) {
        if self.update_skip_mode() && rng.gen_bool(0.5) {
            return;
        }

        let Some(from) = topic.strip_prefix(TOPIC_NEWSPAPER_PREFIX) else { return };
        if from == self.local.name() {
            return;
        }

        let status: NaraStatus = match codec::decode(payload) {
            Ok(status) => status,
            Err(e) => {
                log::debug!("dropping malformed newspaper from {from}: {e}");
                return;
            }
        };

        let known = {
            let mut hood = self.hood();
            let known = hood.contains_key(from);
            hood.insert(from.to_string(), Nara::with_status(from, status));
            known
        };

        if !known {
            log::info!("{from} posted a newspaper story (whodis?)");
            if self.local.chattiness() > 0 {
                self.hey_there();
            }
        }

        self.record_observation_online(from);
    }

    /// Introduce ourselves on the plaza, at most once per rate window.
    fn hey_there(&self) {
        let window = self.local.chattiness_rate(10, 20) as i64;
        {
            let mut last = self.last_hey_there.lock().expect("hey-there lock poisoned");
            let now = now_unix();
            if now - *last <= window {
                return;
            }
            *last = now;
        }
        self.post_event(TOPIC_HEY_THERE, &self.local.me());
    }

    fn handle_hey_there(&self, payload: &[u8]) {
        let nara: Nara = match codec::decode(payload) {
            Ok(nara) => nara,
            Err(e) => {
                log::debug!("dropping malformed hey-there: {e}");
                return;
            }
        };
        if nara.name.is_empty() || nara.name == self.local.name() {
            return;
        }

        log::info!("{} says: hey there!", nara.name);
        let name = nara.name.clone();
        self.hood().insert(name.clone(), nara);
        self.record_observation_online(&name);

        // Greet back; the rate limit keeps the handshake from ping-ponging.
        self.hey_there();
    }

    fn handle_chau(&self, payload: &[u8]) {
        let nara: Nara = match codec::decode(payload) {
            Ok(nara) => nara,
            Err(e) => {
                log::debug!("dropping malformed chau: {e}");
                return;
            }
        };
        if nara.name.is_empty() || nara.name == self.local.name() {
            return;
        }

        let now = now_unix();
        self.local.update_observation(&nara.name, |observation| {
            observation.online = OnlineStatus::Offline;
            observation.last_seen = now;
        });
        self.local.forget_ping(&nara.name);
        log::info!("{}: chau!", nara.name);
        self.hood().insert(nara.name.clone(), nara);
    }

    fn handle_ping(&self, payload: &[u8]) {
        let ping: PingEvent = match codec::decode(payload) {
            Ok(ping) => ping,
            Err(e) => {
                log::debug!("dropping malformed ping: {e}");
                return;
            }
        };
        log::debug!("ping from {} to {} is {:.2}ms", ping.from, ping.to, ping.time_ms);

        if ping.from == self.local.name() {
            self.local.record_ping(ping.to, ping.time_ms);
        } else if let Some(nara) = self.hood().get_mut(&ping.from) {
            // A third-party measurement: remember it in the reporter's ping
            // map so clustering sees edges we never measured ourselves.
            nara.status.ping_map.insert(ping.to, ping.time_ms);
        }
    }

    /// Track whether we are shedding inbound newspapers, logging each mode
    /// change once. Returns the mode now in effect.
    fn update_skip_mode(&self) -> bool {
        let chattiness = self.local.chattiness();
        let skipping = self.skipping_events.load(Ordering::Relaxed);
        if chattiness <= SKIP_THRESHOLD && !skipping {
            log::warn!("low chattiness, newspaper events may be dropped");
            self.skipping_events.store(true, Ordering::Relaxed);
            true
        } else if chattiness > SKIP_THRESHOLD && skipping {
            log::info!("chattiness is healthy again, not dropping events anymore");
            self.skipping_events.store(false, Ordering::Relaxed);
            false
        } else {
            skipping
        }
    }

    // ─── Observation lifecycle ───────────────────────────────────────────────

    /// Refresh the observation for `name` after hearing from it: seed its
    /// history from the neighbourhood on first sight, count a restart when
    /// a MISSING or OFFLINE peer resurfaces, and stamp it ONLINE now.
    fn record_observation_online(&self, name: &str) {
        let now = now_unix();
        let is_me = name == self.local.name();
        let mut observation = self.local.observation(name);

        if observation.start_time == 0 || is_me {
            if !is_me {
                log::info!("observation: seen {name} for the first time");
            }
            // Adopt only what the neighbourhood actually agrees on; a vote
            // of 0 must not reset history we already counted ourselves.
            let hood = self.neighbourhood();
            let restarts = opinion::restarts_vote(&hood, name);
            if restarts > 0 {
                observation.restarts = restarts;
            }
            let start_time = opinion::start_time_vote(&hood, name);
            if start_time > 0 {
                observation.start_time = start_time;
            }
            let last_restart = opinion::last_restart_vote(&hood, name);
            if last_restart > 0 {
                observation.last_restart = last_restart;
            }

            // Nobody knows us yet: our own history starts now. For remote
            // peers we decline to guess until a plurality arrives.
            if observation.start_time == 0 && is_me {
                observation.start_time = now;
            }
            if observation.last_restart == 0 && is_me {
                observation.last_restart = now;
            }
        }

        if observation.online.is_gone() {
            observation.restarts += 1;
            observation.last_restart = now;
            log::info!("observation: {name} came back online");
        }

        observation.online = OnlineStatus::Online;
        observation.last_seen = now;
        self.local.set_observation(name, observation);
    }

    // ─── Opinion forming ─────────────────────────────────────────────────────

    /// Re-run reconciliation for every known neighbour, adopting whatever
    /// the neighbourhood now agrees on. Fields with no plurality are left
    /// alone.
    fn form_opinion(&self) {
        log::info!("forming opinions about the neighbourhood");
        let hood = self.neighbourhood();
        for name in hood.keys() {
            let mut observation = self.local.observation(name);

            let start_time = opinion::start_time_vote(&hood, name);
            if start_time > 0 {
                observation.start_time = start_time;
            } else {
                log::info!("no agreement on a start time for {name}");
            }

            let restarts = opinion::restarts_vote(&hood, name);
            if restarts > 0 {
                observation.restarts = restarts;
            } else {
                log::info!("no agreement on a restart count for {name}");
            }

            let last_restart = opinion::last_restart_vote(&hood, name);
            if last_restart > 0 {
                observation.last_restart = last_restart;
            } else {
                log::info!("no agreement on a last restart for {name}");
            }

            self.local.set_observation(name, observation);
        }
    }

    // ─── Maintenance ─────────────────────────────────────────────────────────

    /// Age observations: clear cluster assignments of peers that are no
    /// longer online, and mark silent ONLINE peers MISSING — unless we are
    /// in skip mode and the silence is probably self-inflicted.
    fn observation_maintenance(&self) {
        let now = now_unix();
        let skipping = self.skipping_events.load(Ordering::Relaxed);

        for (name, observation) in self.local.observations() {
            if observation.online != OnlineStatus::Online {
                if !observation.cluster_name.is_empty() {
                    self.local.update_observation(&name, |current| {
                        if current.online != OnlineStatus::Online {
                            current.cluster_name.clear();
                        }
                    });
                }
                continue;
            }

            if now - observation.last_seen > MISSING_AFTER_SECS && !skipping {
                self.local.update_observation(&name, |current| {
                    if current.online == OnlineStatus::Online
                        && now - current.last_seen > MISSING_AFTER_SECS
                    {
                        current.online = OnlineStatus::Missing;
                    }
                });
                log::info!("observation: {name} has disappeared");
            }
        }
    }

    // ─── Clustering ──────────────────────────────────────────────────────────

    /// Group everyone by reported latency and hand out cluster names by
    /// rank. Only peers currently ONLINE receive a name; our own barrio is
    /// whatever our own observation ends up with.
    fn calculate_clusters(&self) {
        let hood = self.neighbourhood();
        let distances =
            clustering::build_distance_map(&hood, self.local.name(), self.local.ping_map());
        let clusters = clustering::cluster(&distances, clustering::MERGE_THRESHOLD_MS);
        let sorted = clustering::sorted_clusters(clusters, |name| {
            self.local.observation(name).start_time
        });

        for (rank, cluster) in sorted.iter().enumerate() {
            let cluster_name = clustering::cluster_name(rank);
            for member in cluster {
                if self.local.observation(member).online != OnlineStatus::Online {
                    continue;
                }
                self.local.update_observation(member, |observation| {
                    if observation.online == OnlineStatus::Online {
                        observation.cluster_name = cluster_name.to_string();
                    }
                });
            }
        }

        self.local.set_barrio(self.local.me_observation().cluster_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Outbound;
    use crate::nara::Observation;
    use proptest::prelude::*;
    use rand::rngs::mock::StepRng;

    fn test_network(name: &str) -> (Network, mpsc::UnboundedReceiver<Outbound>) {
        let (broker, outbound) = Broker::detached();
        let local = Arc::new(LocalNara::new(name));
        local.set_chattiness(100);
        (Network::with_broker(local, broker), outbound)
    }

    fn newspaper_from(name: &str, status: &NaraStatus) -> (String, Vec<u8>) {
        (format!("{TOPIC_NEWSPAPER_PREFIX}{name}"), codec::encode(status).unwrap())
    }

    fn published_topics(outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut topics = Vec::new();
        while let Ok(Outbound::Publish { topic, .. }) = outbound.try_recv() {
            topics.push(topic);
        }
        topics
    }

    /// Rngs that never (or always) trip the 50% drop gate.
    fn keep_rng() -> StepRng {
        StepRng::new(u64::MAX, 0)
    }
    fn drop_rng() -> StepRng {
        StepRng::new(0, 0)
    }

    // ── First meeting (S1) ───────────────────────────────────────────────────

    #[test]
    fn newspaper_from_a_stranger_triggers_an_introduction() {
        let (network, mut outbound) = test_network("alice");
        let (topic, payload) = newspaper_from("bob", &NaraStatus::default());

        network.handle_newspaper(&topic, &payload, &mut keep_rng());

        assert!(network.neighbourhood().contains_key("bob"));
        let observation = network.local.observation("bob");
        assert_eq!(observation.online, OnlineStatus::Online);
        assert!(observation.last_seen > 0);
        assert_eq!(published_topics(&mut outbound), vec![TOPIC_HEY_THERE.to_string()]);
    }

    #[test]
    fn hey_there_installs_the_sender_and_greets_back() {
        let (network, mut outbound) = test_network("alice");
        let payload = codec::encode(&Nara::new("bob")).unwrap();

        network.handle_hey_there(&payload);

        assert!(network.neighbourhood().contains_key("bob"));
        assert_eq!(network.local.observation("bob").online, OnlineStatus::Online);
        assert_eq!(published_topics(&mut outbound), vec![TOPIC_HEY_THERE.to_string()]);
    }

    #[test]
    fn hey_there_is_rate_limited() {
        let (network, mut outbound) = test_network("alice");
        network.hey_there();
        network.hey_there();
        assert_eq!(published_topics(&mut outbound).len(), 1);
    }

    #[test]
    fn own_newspaper_and_empty_names_are_ignored() {
        let (network, mut outbound) = test_network("alice");

        let (topic, payload) = newspaper_from("alice", &NaraStatus::default());
        network.handle_newspaper(&topic, &payload, &mut keep_rng());
        network.handle_hey_there(&codec::encode(&Nara::new("")).unwrap());
        network.handle_hey_there(&codec::encode(&Nara::new("alice")).unwrap());

        assert!(network.neighbourhood().is_empty());
        assert!(published_topics(&mut outbound).is_empty());
    }

    #[test]
    fn known_sender_gets_a_wholesale_status_update_and_no_greeting() {
        let (network, mut outbound) = test_network("alice");
        let (topic, payload) = newspaper_from("bob", &NaraStatus::default());
        network.handle_newspaper(&topic, &payload, &mut keep_rng());
        let _ = published_topics(&mut outbound);

        let mut status = NaraStatus::default();
        status.chattiness = 55;
        status.barrio = "peach".into();
        let (topic, payload) = newspaper_from("bob", &status);
        network.handle_newspaper(&topic, &payload, &mut keep_rng());

        let hood = network.neighbourhood();
        assert_eq!(hood["bob"].status.chattiness, 55);
        assert_eq!(hood["bob"].status.barrio, "peach");
        assert!(published_topics(&mut outbound).is_empty());
    }

    #[test]
    fn malformed_payloads_are_dropped() {
        let (network, mut outbound) = test_network("alice");
        network.handle_newspaper("nara/newspaper/bob", b"not json", &mut keep_rng());
        network.handle_hey_there(b"not json");
        network.handle_chau(b"not json");
        network.handle_ping(b"not json");

        assert!(network.neighbourhood().is_empty());
        assert!(published_topics(&mut outbound).is_empty());
    }

    // ── Restart detection (S2) ───────────────────────────────────────────────

    #[test]
    fn a_returning_peer_counts_as_a_restart() {
        let (network, _outbound) = test_network("alice");
        network.record_observation_online("bob");
        assert_eq!(network.local.observation("bob").restarts, 0);

        // Maintenance marked bob missing in the meantime.
        network.local.update_observation("bob", |observation| {
            observation.online = OnlineStatus::Missing;
        });

        network.record_observation_online("bob");
        let observation = network.local.observation("bob");
        assert_eq!(observation.online, OnlineStatus::Online);
        assert_eq!(observation.restarts, 1);
        assert!(observation.last_restart > 0);
        assert!(observation.last_restart <= observation.last_seen);
    }

    #[test]
    fn reseeding_without_a_plurality_keeps_counted_restarts() {
        let (network, _outbound) = test_network("alice");
        network.record_observation_online("bob");
        network.local.update_observation("bob", |observation| {
            observation.online = OnlineStatus::Missing;
        });
        network.record_observation_online("bob");
        assert_eq!(network.local.observation("bob").restarts, 1);

        // Bob's start time is still unknown, so further refreshes re-run
        // the vote; the empty neighbourhood must not wipe the counted
        // restart.
        network.record_observation_online("bob");
        network.record_observation_online("bob");
        let observation = network.local.observation("bob");
        assert_eq!(observation.restarts, 1);
        assert!(observation.last_restart > 0);
    }

    #[test]
    fn own_restart_survives_the_next_announcement() {
        let (network, _outbound) = test_network("alice");
        network.announce();
        network.local.update_observation("alice", |observation| {
            observation.online = OnlineStatus::Missing;
        });
        network.announce();
        assert_eq!(network.local.me_observation().restarts, 1);

        // Reconciliation runs again for self on every announcement, and the
        // neighbours have nothing to report yet.
        network.announce();
        assert_eq!(network.local.me_observation().restarts, 1);
    }

    #[test]
    fn maintenance_marks_silent_peers_missing() {
        let (network, _outbound) = test_network("alice");
        network.record_observation_online("bob");
        network.local.update_observation("bob", |observation| {
            observation.last_seen = now_unix() - MISSING_AFTER_SECS - 1;
        });

        network.observation_maintenance();
        assert_eq!(network.local.observation("bob").online, OnlineStatus::Missing);
    }

    #[test]
    fn maintenance_leaves_recent_peers_alone() {
        let (network, _outbound) = test_network("alice");
        network.record_observation_online("bob");
        network.observation_maintenance();
        assert_eq!(network.local.observation("bob").online, OnlineStatus::Online);
    }

    #[test]
    fn skip_mode_suspends_missing_marks() {
        let (network, _outbound) = test_network("alice");
        network.record_observation_online("bob");
        network.local.update_observation("bob", |observation| {
            observation.last_seen = now_unix() - MISSING_AFTER_SECS - 1;
        });
        network.skipping_events.store(true, Ordering::Relaxed);

        network.observation_maintenance();
        assert_eq!(network.local.observation("bob").online, OnlineStatus::Online);
    }

    #[test]
    fn maintenance_clears_clusters_of_gone_peers() {
        let (network, _outbound) = test_network("alice");
        network.local.set_observation(
            "bob",
            Observation {
                online: OnlineStatus::Offline,
                cluster_name: "olive".into(),
                ..Default::default()
            },
        );

        network.observation_maintenance();
        assert_eq!(network.local.observation("bob").cluster_name, "");
    }

    // ── Reconciliation on first sight ────────────────────────────────────────

    #[test]
    fn first_sight_seeds_history_from_the_neighbourhood() {
        let (network, _outbound) = test_network("alice");
        // Three neighbours agree carol started at 1000 with 2 restarts.
        for i in 0..3 {
            let mut nara = Nara::new(format!("n{i}"));
            nara.status.observations.insert(
                "carol".into(),
                Observation {
                    start_time: 1000,
                    restarts: 2,
                    last_restart: 1500,
                    ..Default::default()
                },
            );
            network.hood().insert(nara.name.clone(), nara);
        }

        network.record_observation_online("carol");
        let observation = network.local.observation("carol");
        assert_eq!(observation.start_time, 1000);
        assert_eq!(observation.restarts, 2);
        assert_eq!(observation.last_restart, 1500);
        assert_eq!(observation.online, OnlineStatus::Online);
    }

    #[test]
    fn own_first_announcement_starts_the_clock() {
        let (network, _outbound) = test_network("alice");
        network.announce();

        let observation = network.local.me_observation();
        assert!(observation.start_time > 0);
        assert!(observation.last_restart > 0);
        assert_eq!(observation.online, OnlineStatus::Online);
        assert!(observation.start_time <= observation.last_restart);
        assert!(observation.last_restart <= observation.last_seen);
    }

    #[test]
    fn unknown_remote_history_stays_unknown() {
        let (network, _outbound) = test_network("alice");
        network.record_observation_online("bob");

        let observation = network.local.observation("bob");
        assert_eq!(observation.start_time, 0);
        assert_eq!(observation.last_restart, 0);
    }

    #[test]
    fn announce_publishes_the_newspaper() {
        let (network, mut outbound) = test_network("alice");
        network.announce();
        assert_eq!(
            published_topics(&mut outbound),
            vec![format!("{TOPIC_NEWSPAPER_PREFIX}alice")]
        );
    }

    // ── Opinion forming ──────────────────────────────────────────────────────

    #[test]
    fn form_opinion_adopts_pluralities_and_keeps_the_rest() {
        let (network, _outbound) = test_network("alice");
        network.local.set_observation(
            "bob",
            Observation { start_time: 7, restarts: 9, last_restart: 8, ..Default::default() },
        );
        // Two of three neighbours agree on bob's start time; nobody reports
        // restarts or a last restart.
        for (i, start_time) in [(0, 4000), (1, 4000), (2, 5000)] {
            let mut nara = Nara::new(format!("n{i}"));
            nara.status.observations.insert(
                "bob".into(),
                Observation { start_time, ..Default::default() },
            );
            network.hood().insert(nara.name.clone(), nara);
        }

        network.form_opinion();
        let observation = network.local.observation("bob");
        assert_eq!(observation.start_time, 4000);
        assert_eq!(observation.restarts, 9, "no plurality must not zero the field");
        assert_eq!(observation.last_restart, 8);
    }

    // ── Chattiness shedding (S5) ─────────────────────────────────────────────

    #[test]
    fn low_chattiness_enters_skip_mode_and_drops() {
        let (network, _outbound) = test_network("alice");
        network.local.set_chattiness(8);

        let (topic, payload) = newspaper_from("bob", &NaraStatus::default());
        network.handle_newspaper(&topic, &payload, &mut drop_rng());

        assert!(network.skipping_events.load(Ordering::Relaxed));
        assert!(network.neighbourhood().is_empty(), "gated message must be dropped");
    }

    #[test]
    fn skip_mode_still_passes_half_the_traffic() {
        let (network, _outbound) = test_network("alice");
        network.local.set_chattiness(0);

        let (topic, payload) = newspaper_from("bob", &NaraStatus::default());
        network.handle_newspaper(&topic, &payload, &mut keep_rng());

        // Gate let it through; chattiness 0 also suppresses the greeting.
        assert!(network.neighbourhood().contains_key("bob"));
    }

    #[test]
    fn recovered_chattiness_leaves_skip_mode() {
        let (network, _outbound) = test_network("alice");
        network.local.set_chattiness(8);
        let (topic, payload) = newspaper_from("bob", &NaraStatus::default());
        network.handle_newspaper(&topic, &payload, &mut drop_rng());
        assert!(network.skipping_events.load(Ordering::Relaxed));

        network.local.set_chattiness(30);
        network.handle_newspaper(&topic, &payload, &mut drop_rng());

        assert!(!network.skipping_events.load(Ordering::Relaxed));
        assert!(network.neighbourhood().contains_key("bob"));
    }

    // ── Farewell (S6) ────────────────────────────────────────────────────────

    #[test]
    fn chau_from_a_peer_marks_it_offline_and_forgets_pings() {
        let (network, _outbound) = test_network("alice");
        let (topic, payload) = newspaper_from("bob", &NaraStatus::default());
        network.handle_newspaper(&topic, &payload, &mut keep_rng());
        network.local.record_ping("bob", 12.0);

        network.handle_chau(&codec::encode(&Nara::new("bob")).unwrap());

        let observation = network.local.observation("bob");
        assert_eq!(observation.online, OnlineStatus::Offline);
        assert!(!network.local.ping_map().contains_key("bob"));
        assert!(network.neighbourhood().contains_key("bob"));
    }

    #[test]
    fn chau_publishes_a_farewell_and_goes_offline() {
        let (network, mut outbound) = test_network("alice");
        network.chau();

        assert_eq!(network.local.me_observation().online, OnlineStatus::Offline);
        assert_eq!(published_topics(&mut outbound), vec![TOPIC_CHAU.to_string()]);
    }

    // ── Ping ingestion ───────────────────────────────────────────────────────

    #[test]
    fn own_pings_land_in_the_local_map() {
        let (network, _outbound) = test_network("alice");
        let ping = PingEvent { from: "alice".into(), to: "bob".into(), time_ms: 12.5 };
        network.handle_ping(&codec::encode(&ping).unwrap());
        assert_eq!(network.local.ping_map().get("bob"), Some(&12.5));
    }

    #[test]
    fn third_party_pings_update_the_reporters_map() {
        let (network, _outbound) = test_network("alice");
        let (topic, payload) = newspaper_from("bob", &NaraStatus::default());
        network.handle_newspaper(&topic, &payload, &mut keep_rng());

        let ping = PingEvent { from: "bob".into(), to: "carol".into(), time_ms: 30.0 };
        network.handle_ping(&codec::encode(&ping).unwrap());

        assert_eq!(network.neighbourhood()["bob"].status.ping_map.get("carol"), Some(&30.0));
        assert!(network.local.ping_map().is_empty());
    }

    #[test]
    fn pings_from_strangers_are_dropped() {
        let (network, _outbound) = test_network("alice");
        let ping = PingEvent { from: "ghost".into(), to: "bob".into(), time_ms: 5.0 };
        network.handle_ping(&codec::encode(&ping).unwrap());
        assert!(network.neighbourhood().is_empty());
        assert!(network.local.ping_map().is_empty());
    }

    #[test]
    fn post_ping_uses_the_from_to_topic() {
        let (network, mut outbound) = test_network("alice");
        let ping = PingEvent { from: "alice".into(), to: "bob".into(), time_ms: 1.0 };
        network.post_ping(&ping);
        assert_eq!(published_topics(&mut outbound), vec!["nara/ping/alice/bob".to_string()]);
    }

    // ── Clustering integration (S4) ──────────────────────────────────────────

    #[test]
    fn clusters_are_named_and_barrio_is_set() {
        let (network, _outbound) = test_network("x");
        network.record_observation_online("x");
        network.record_observation_online("y");
        network.record_observation_online("z");
        network.local.record_ping("y", 20.0);
        network.local.record_ping("z", 80.0);

        let mut y = Nara::new("y");
        y.status.ping_map.insert("x".into(), 20.0);
        y.status.ping_map.insert("z".into(), 70.0);
        network.hood().insert("y".into(), y);

        let mut z = Nara::new("z");
        z.status.ping_map.insert("x".into(), 80.0);
        z.status.ping_map.insert("y".into(), 70.0);
        network.hood().insert("z".into(), z);

        network.calculate_clusters();

        assert_eq!(network.local.observation("x").cluster_name, "olive");
        assert_eq!(network.local.observation("y").cluster_name, "olive");
        assert_eq!(network.local.observation("z").cluster_name, "peach");
        assert_eq!(network.local.barrio(), "olive");
    }

    #[test]
    fn offline_peers_are_never_assigned_a_cluster() {
        let (network, _outbound) = test_network("alice");
        network.record_observation_online("alice");
        network.local.record_ping("bob", 10.0);
        network.local.update_observation("bob", |observation| {
            observation.online = OnlineStatus::Offline;
        });

        let mut bob = Nara::new("bob");
        bob.status.ping_map.insert("alice".into(), 10.0);
        network.hood().insert("bob".into(), bob);

        network.calculate_clusters();
        assert_eq!(network.local.observation("bob").cluster_name, "");
    }

    // ── Invariants ───────────────────────────────────────────────────────────

    #[derive(Debug, Clone)]
    enum PeerEvent {
        Heard,
        WentMissing,
        SaidChau,
    }

    fn peer_event() -> impl Strategy<Value = PeerEvent> {
        prop_oneof![
            Just(PeerEvent::Heard),
            Just(PeerEvent::WentMissing),
            Just(PeerEvent::SaidChau),
        ]
    }

    proptest! {
        // Replaying any event sequence keeps restarts monotone and the
        // timestamps ordered whenever they are all known.
        #[test]
        fn observation_invariants_hold_under_replay(events in proptest::collection::vec(peer_event(), 1..40)) {
            let (network, _outbound) = test_network("alice");
            let mut last_restarts = 0;

            for event in events {
                match event {
                    PeerEvent::Heard => network.record_observation_online("bob"),
                    PeerEvent::WentMissing => {
                        network.local.update_observation("bob", |observation| {
                            if observation.online == OnlineStatus::Online {
                                observation.online = OnlineStatus::Missing;
                            }
                        });
                    }
                    PeerEvent::SaidChau => {
                        network.handle_chau(&codec::encode(&Nara::new("bob")).unwrap());
                    }
                }

                let observation = network.local.observation("bob");
                prop_assert!(observation.restarts >= last_restarts);
                last_restarts = observation.restarts;

                if observation.start_time > 0
                    && observation.last_restart > 0
                    && observation.last_seen > 0
                {
                    prop_assert!(observation.start_time <= observation.last_restart);
                    prop_assert!(observation.last_restart <= observation.last_seen);
                }
            }
        }
    }
}
