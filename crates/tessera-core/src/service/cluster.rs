//! Node manager: discovery, liveness and leader election driver
//!
//! Owns the registry of known peers and the election state machine. Both
//! live behind a single lock: election transitions and registry updates
//! must be observed atomically by the liveness check, so every mutation
//! goes through the same mutual-exclusion domain. Handlers compute their
//! outbound messages and events under the lock and perform the actual
//! sends and notifications after releasing it.
//!
//! Periodic work (ping, leader check, stale-peer eviction) runs as
//! interval tasks that shut down through a watch signal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tessera_api::message::{BroadcastMessage, LeaderHint};
use tessera_api::model::{ConnectionCredentials, NodeData, NodeIdentity, NodeRole};
use tessera_common::{TesseraError, local_ip, now_millis};
use tessera_consistency::election::{ElectionRole, LeaderElectionStateMachine};
use tessera_consistency::oplog::OperationLog;

use crate::model::ClusterConfig;
use crate::service::codec::MessageCodec;
use crate::service::events::{ClusterEvent, ClusterEventPublisher};
use crate::service::transport::BroadcastTransport;

/// Registry + election state, mutated only under one lock
struct CoordinationState {
    known_servers: HashMap<NodeIdentity, NodeData>,
    election: LeaderElectionStateMachine,
}

/// Outbound work computed by a handler while the state lock was held
#[derive(Default)]
struct Actions {
    send: Vec<BroadcastMessage>,
    events: Vec<ClusterEvent>,
}

/// Discovery loop, liveness sweep and election driver of one node
pub struct NodeManager {
    config: ClusterConfig,
    identity: NodeIdentity,
    local_address: String,
    codec: MessageCodec,
    transport: Arc<dyn BroadcastTransport>,
    oplog: Option<Arc<dyn OperationLog>>,
    events: Arc<ClusterEventPublisher>,
    state: Mutex<CoordinationState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeManager {
    /// Create a node manager; fails fast on invalid configuration
    pub fn new(
        config: ClusterConfig,
        transport: Arc<dyn BroadcastTransport>,
        oplog: Option<Arc<dyn OperationLog>>,
    ) -> Result<Arc<Self>, TesseraError> {
        config.validate()?;

        let identity = NodeIdentity::generate(&config.node_name);
        let starting_term = oplog
            .as_ref()
            .map(|log| log.last_persistent_log().0)
            .unwrap_or(0);
        let election =
            LeaderElectionStateMachine::new(identity.clone(), config.quorum, starting_term);
        let codec = MessageCodec::new(&config.group_name, config.group_password.as_deref());
        let (shutdown_tx, _) = watch::channel(false);

        info!(node = %identity, group = config.group_name, "node manager created");

        Ok(Arc::new(Self {
            config,
            identity,
            local_address: local_ip(),
            codec,
            transport,
            oplog,
            events: Arc::new(ClusterEventPublisher::new(1024)),
            state: Mutex::new(CoordinationState {
                known_servers: HashMap::new(),
                election,
            }),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Start the receive loop and the periodic ping/check/eviction tasks
    pub async fn start(self: &Arc<Self>) {
        self.events.start().await;

        let receive = {
            let manager = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        result = manager.transport.recv() => match result {
                            Ok((payload, from)) => {
                                if let Some(message) = manager.codec.decode(&payload) {
                                    manager.handle_message(message, &from).await;
                                }
                            }
                            Err(e) => {
                                warn!("discovery receive failed: {}", e);
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        },
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let ping = self.spawn_periodic(self.config.ping_interval, |manager| async move {
            manager.send_ping().await;
        });
        let checker = self.spawn_periodic(self.config.check_leader_interval, |manager| async move {
            manager.check_leader().await;
        });
        let eviction = self.spawn_periodic(self.config.ping_interval, |manager| async move {
            manager.evict_stale_nodes().await;
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.extend([receive, ping, checker, eviction]);
        info!(node = %self.identity, "node manager started");
    }

    /// Stop every task; the manager cannot be restarted
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
        }
        self.events.stop().await;
        info!(node = %self.identity, "node manager stopped");
    }

    fn spawn_periodic<F, Fut>(self: &Arc<Self>, period: Duration, run: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => run(Arc::clone(&manager)).await,
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /* =============== accessors ================= */

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn current_term(&self) -> u64 {
        self.lock_state().election.current_term()
    }

    pub fn role(&self) -> ElectionRole {
        self.lock_state().election.role()
    }

    /// The node currently believed to lead the group, if any
    pub fn current_leader(&self) -> Option<NodeData> {
        self.lock_state()
            .known_servers
            .values()
            .find(|data| data.leader)
            .cloned()
    }

    pub fn known_nodes(&self) -> Vec<NodeData> {
        self.lock_state().known_servers.values().cloned().collect()
    }

    pub fn events(&self) -> &Arc<ClusterEventPublisher> {
        &self.events
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /* =============== internals ================= */

    fn lock_state(&self) -> MutexGuard<'_, CoordinationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn last_log_id(&self) -> u64 {
        self.oplog
            .as_ref()
            .map(|log| log.last_persistent_log().0)
            .unwrap_or(0)
    }

    fn set_oplog_leader(&self, leader: bool, term: u64) {
        if let Some(log) = &self.oplog {
            log.set_leader(leader, term);
        }
    }

    fn reset_leader_flags(state: &mut CoordinationState) {
        for data in state.known_servers.values_mut() {
            data.leader = false;
        }
    }

    fn has_current_leader(state: &CoordinationState) -> bool {
        state
            .known_servers
            .values()
            .any(|data| data.leader && data.term >= state.election.current_term())
    }

    async fn run_actions(&self, actions: Actions) {
        for message in actions.send {
            self.broadcast(message).await;
        }
        for event in actions.events {
            self.events.publish(event).await;
        }
    }

    async fn broadcast(&self, message: BroadcastMessage) {
        let payload = match self.codec.encode(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("cannot encode {} message: {}", message.type_name(), e);
                return;
            }
        };
        if let Err(e) = self.transport.send_to_group(&payload).await {
            // fire-and-forget: the next ping cycle retransmits what matters
            warn!("cannot send {} message: {}", message.type_name(), e);
        }
    }

    async fn handle_message(&self, message: BroadcastMessage, from_addr: &str) {
        debug!(
            node = %self.identity,
            from = %message.sender(),
            kind = message.type_name(),
            term = message.term(),
            "handling message"
        );
        let actions = {
            let mut state = self.lock_state();
            match message {
                BroadcastMessage::Ping {
                    sender,
                    term,
                    role,
                    tcp_port,
                    credentials,
                    leader_hint,
                    ..
                } => self.on_ping(
                    &mut state,
                    sender,
                    term,
                    role,
                    tcp_port,
                    credentials,
                    leader_hint,
                    from_addr,
                ),
                BroadcastMessage::StartElection {
                    sender,
                    term,
                    last_log_id,
                    ..
                } => self.on_start_election(&mut state, sender, term, last_log_id),
                BroadcastMessage::Vote {
                    sender,
                    term,
                    vote_for,
                    ..
                } => self.on_vote(&mut state, sender, term, vote_for),
                BroadcastMessage::LeaderElected {
                    sender,
                    term,
                    tcp_port,
                    credentials,
                    ..
                } => self.on_leader_elected(&mut state, sender, term, tcp_port, credentials, from_addr),
            }
        };
        self.run_actions(actions).await;
    }

    /* =============== ping ================= */

    async fn send_ping(&self) {
        let (message, actions) = {
            let mut state = self.lock_state();
            let message = self.generate_ping(&state);
            // the local node takes part in the same bookkeeping as any peer
            let actions = if let BroadcastMessage::Ping {
                sender,
                term,
                role,
                tcp_port,
                credentials,
                leader_hint,
                ..
            } = message.clone()
            {
                self.on_ping(
                    &mut state,
                    sender,
                    term,
                    role,
                    tcp_port,
                    credentials,
                    leader_hint,
                    &self.local_address,
                )
            } else {
                Actions::default()
            };
            (message, actions)
        };
        self.run_actions(actions).await;
        self.broadcast(message).await;
    }

    fn generate_ping(&self, state: &CoordinationState) -> BroadcastMessage {
        let role = if state.election.role() == ElectionRole::Leader {
            NodeRole::Coordinator
        } else {
            NodeRole::Replica
        };
        let leader_hint = state
            .known_servers
            .values()
            .find(|data| data.leader)
            .map(|leader| LeaderHint {
                identity: leader.identity.clone(),
                term: leader.term,
                address: leader.address.clone(),
                port: leader.port,
                credentials: leader.credentials.clone(),
                last_ping_at: leader.last_ping_at,
            });
        BroadcastMessage::Ping {
            group: self.config.group_name.clone(),
            sender: self.identity.clone(),
            term: state.election.current_term(),
            role,
            tcp_port: self.config.tcp_port,
            credentials: self.config.credentials.clone(),
            leader_hint,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_ping(
        &self,
        state: &mut CoordinationState,
        sender: NodeIdentity,
        term: u64,
        role: NodeRole,
        tcp_port: u16,
        credentials: ConnectionCredentials,
        leader_hint: Option<LeaderHint>,
        from_addr: &str,
    ) -> Actions {
        let mut actions = Actions::default();
        if state.election.current_term() > term {
            return actions;
        }
        let now = now_millis();

        let was_leader = state
            .known_servers
            .get(&sender)
            .map(|data| data.leader)
            .unwrap_or(false);
        if !state.known_servers.contains_key(&sender) {
            let mut data = NodeData::new(sender.clone(), from_addr, tcp_port);
            data.term = term;
            data.credentials = credentials.clone();
            state.known_servers.insert(sender.clone(), data.clone());
            actions.events.push(ClusterEvent::node_connected(data));
        }

        let entry_term = {
            let entry = state
                .known_servers
                .get_mut(&sender)
                .expect("entry inserted above");
            entry.last_ping_at = now;
            entry.address = from_addr.to_string();
            entry.port = tcp_port;
            entry.credentials = credentials;
            entry.term
        };

        if entry_term < term {
            if role == NodeRole::Coordinator {
                Self::reset_leader_flags(state);
            }
            let entry = state.known_servers.get_mut(&sender).expect("entry exists");
            entry.term = term;
            entry.leader = role == NodeRole::Coordinator;
            if state.election.current_term() < term {
                state.election.change_term(term);
                if sender == self.identity {
                    state.election.set_role(ElectionRole::Leader);
                    self.set_oplog_leader(true, term);
                }
            }
        } else if entry_term == term && role == NodeRole::Coordinator {
            Self::reset_leader_flags(state);
            let entry = state.known_servers.get_mut(&sender).expect("entry exists");
            entry.leader = true;
            if sender != self.identity {
                state.election.set_role(ElectionRole::Follower);
                self.set_oplog_leader(false, term);
            }
        }

        let entry = state.known_servers.get(&sender).expect("entry exists");
        if entry.leader && !was_leader {
            actions.events.push(ClusterEvent::leader_elected(entry.clone()));
        }

        // materialize a leader we only know through hearsay, if the hint is
        // fresh enough to still be trustworthy
        if let Some(hint) = leader_hint {
            let fresh = hint.last_ping_at + self.config.max_inactive.as_millis() as i64 > now;
            if hint.term >= state.election.current_term()
                && fresh
                && !state.known_servers.contains_key(&hint.identity)
            {
                let mut data = NodeData::new(hint.identity.clone(), hint.address, hint.port);
                data.term = hint.term;
                data.leader = true;
                data.credentials = hint.credentials;
                data.last_ping_at = hint.last_ping_at;
                state.known_servers.insert(hint.identity.clone(), data.clone());
                actions.events.push(ClusterEvent::node_connected(data.clone()));
                actions.events.push(ClusterEvent::leader_elected(data));
            }
        }
        actions
    }

    /* =============== leader election ================= */

    async fn check_leader(&self) {
        {
            let mut state = self.lock_state();
            if state.election.role() == ElectionRole::Candidate {
                // the previous election timed out without reaching quorum
                state.election.reset_leader_election();
            }
            if state.known_servers.len() < state.election.quorum() {
                return;
            }
            if Self::has_current_leader(&state) {
                return;
            }
        }

        // anti-collision backoff, then re-check before campaigning
        let backoff_max = self.config.election_backoff_max.as_millis() as u64;
        let backoff = rand::rng().random_range(0..=backoff_max);
        tokio::time::sleep(Duration::from_millis(backoff)).await;

        let actions = {
            let mut state = self.lock_state();
            if Self::has_current_leader(&state) || state.election.role() != ElectionRole::Follower {
                Actions::default()
            } else {
                state.election.start_election();
                if state.election.role() == ElectionRole::Leader {
                    // a quorum of one: the self-vote already decided it
                    self.assume_leadership(&mut state)
                } else {
                    let mut actions = Actions::default();
                    actions.send.push(BroadcastMessage::StartElection {
                        group: self.config.group_name.clone(),
                        sender: self.identity.clone(),
                        term: state.election.current_term(),
                        last_log_id: self.last_log_id(),
                        tcp_port: self.config.tcp_port,
                        credentials: self.config.credentials.clone(),
                    });
                    actions
                }
            }
        };
        self.run_actions(actions).await;
    }

    /// Bookkeeping for a freshly won election: mark self as the group
    /// leader, notify upward and announce the result
    fn assume_leadership(&self, state: &mut CoordinationState) -> Actions {
        let mut actions = Actions::default();
        let current_term = state.election.current_term();
        Self::reset_leader_flags(state);

        let mut data = NodeData::new(
            self.identity.clone(),
            self.local_address.clone(),
            self.config.tcp_port,
        );
        data.term = current_term;
        data.leader = true;
        data.credentials = self.config.credentials.clone();
        state.known_servers.insert(self.identity.clone(), data.clone());

        self.set_oplog_leader(true, current_term);
        actions.events.push(ClusterEvent::leader_elected(data));
        actions.send.push(BroadcastMessage::LeaderElected {
            group: self.config.group_name.clone(),
            sender: self.identity.clone(),
            term: current_term,
            tcp_port: self.config.tcp_port,
            credentials: self.config.credentials.clone(),
        });
        actions
    }

    fn on_start_election(
        &self,
        state: &mut CoordinationState,
        sender: NodeIdentity,
        term: u64,
        last_log_id: u64,
    ) -> Actions {
        let mut actions = Actions::default();
        let local_last = self.last_log_id();
        // one vote per term, and never for a candidate whose log is behind
        if state.election.can_vote_in(term) && last_log_id >= local_last {
            state.election.record_vote_cast(term);
            debug!(node = %self.identity, candidate = %sender, term, "casting vote");
            actions.send.push(BroadcastMessage::Vote {
                group: self.config.group_name.clone(),
                sender: self.identity.clone(),
                term,
                vote_for: sender,
                last_log_id: local_last,
                tcp_port: self.config.tcp_port,
                credentials: self.config.credentials.clone(),
            });
        }
        actions
    }

    fn on_vote(
        &self,
        state: &mut CoordinationState,
        sender: NodeIdentity,
        term: u64,
        vote_for: NodeIdentity,
    ) -> Actions {
        let actions = Actions::default();
        if state.election.role() != ElectionRole::Candidate {
            return actions;
        }
        state.election.receive_vote(term, sender, &vote_for);
        if state.election.role() == ElectionRole::Leader {
            return self.assume_leadership(state);
        }
        actions
    }

    fn on_leader_elected(
        &self,
        state: &mut CoordinationState,
        sender: NodeIdentity,
        term: u64,
        tcp_port: u16,
        credentials: ConnectionCredentials,
        from_addr: &str,
    ) -> Actions {
        let mut actions = Actions::default();
        if term < state.election.current_term() {
            return actions;
        }

        if sender == self.identity {
            state.election.set_role(ElectionRole::Leader);
            self.set_oplog_leader(true, term);
        } else {
            state.election.set_role(ElectionRole::Follower);
            self.set_oplog_leader(false, term);
        }
        state.election.set_current_term(term);

        Self::reset_leader_flags(state);
        let mut data = NodeData::new(sender.clone(), from_addr, tcp_port);
        data.term = term;
        data.leader = true;
        data.credentials = credentials;
        let previous = state.known_servers.insert(sender, data.clone());

        if previous.is_none() {
            actions.events.push(ClusterEvent::node_connected(data.clone()));
        }
        // a re-announcement from a leader we already follow is not news
        let already_known_leader = previous.map(|old| old.leader).unwrap_or(false);
        if !already_known_leader {
            actions.events.push(ClusterEvent::leader_elected(data));
        }
        actions
    }

    /* =============== liveness ================= */

    async fn evict_stale_nodes(&self) {
        let events: Vec<ClusterEvent> = {
            let mut state = self.lock_state();
            let now = now_millis();
            let max_inactive = self.config.max_inactive.as_millis() as u64;
            let stale: Vec<NodeIdentity> = state
                .known_servers
                .values()
                .filter(|data| data.is_stale(now, max_inactive))
                .map(|data| data.identity.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|identity| state.known_servers.remove(&identity))
                .map(ClusterEvent::node_disconnected)
                .collect()
        };
        for event in events {
            info!(node = %event.node.identity, "peer presumed departed");
            self.events.publish(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::transport::InMemoryHub;
    use tessera_api::log::{LogId, LogRequest};
    use tessera_consistency::oplog::MemoryOperationLog;

    fn config(name: &str) -> ClusterConfig {
        ClusterConfig {
            group_name: "g1".to_string(),
            node_name: name.to_string(),
            quorum: 2,
            max_inactive: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn manager(name: &str) -> Arc<NodeManager> {
        let hub = InMemoryHub::new();
        NodeManager::new(config(name), Arc::new(hub.transport("10.0.0.1")), None).unwrap()
    }

    fn manager_with_log(name: &str, log: Arc<MemoryOperationLog>) -> Arc<NodeManager> {
        let hub = InMemoryHub::new();
        NodeManager::new(
            config(name),
            Arc::new(hub.transport("10.0.0.1")),
            Some(log as Arc<dyn OperationLog>),
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let hub = InMemoryHub::new();
        let bad = ClusterConfig {
            group_name: String::new(),
            node_name: "node-a".to_string(),
            ..Default::default()
        };
        assert!(NodeManager::new(bad, Arc::new(hub.transport("x")), None).is_err());
    }

    #[test]
    fn test_ping_registers_peer_and_emits_connected() {
        let manager = manager("node-a");
        let peer = NodeIdentity::generate("node-b");

        let mut state = manager.lock_state();
        let actions = manager.on_ping(
            &mut state,
            peer.clone(),
            0,
            NodeRole::Replica,
            2424,
            ConnectionCredentials::default(),
            None,
            "10.0.0.2",
        );
        drop(state);

        assert_eq!(actions.events.len(), 1);
        assert_eq!(actions.events[0].kind, crate::ClusterEventKind::NodeConnected);
        let nodes = manager.known_nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].identity, peer);
        assert_eq!(nodes[0].address, "10.0.0.2");
    }

    #[test]
    fn test_stale_term_ping_ignored() {
        let manager = manager("node-a");
        let peer = NodeIdentity::generate("node-b");

        let mut state = manager.lock_state();
        state.election.change_term(5);
        let actions = manager.on_ping(
            &mut state,
            peer,
            3,
            NodeRole::Replica,
            2424,
            ConnectionCredentials::default(),
            None,
            "10.0.0.2",
        );
        assert!(actions.events.is_empty());
        assert!(state.known_servers.is_empty());
    }

    #[test]
    fn test_coordinator_ping_marks_leader_once() {
        let manager = manager("node-a");
        let peer = NodeIdentity::generate("node-b");

        let mut state = manager.lock_state();
        let actions = manager.on_ping(
            &mut state,
            peer.clone(),
            1,
            NodeRole::Coordinator,
            2424,
            ConnectionCredentials::default(),
            None,
            "10.0.0.2",
        );
        assert_eq!(actions.events.len(), 2); // connected + leader elected
        assert!(state.known_servers[&peer].leader);
        assert_eq!(state.election.role(), ElectionRole::Follower);

        // a second identical ping refreshes liveness but emits nothing
        let actions = manager.on_ping(
            &mut state,
            peer.clone(),
            1,
            NodeRole::Coordinator,
            2424,
            ConnectionCredentials::default(),
            None,
            "10.0.0.2",
        );
        assert!(actions.events.is_empty());
    }

    #[test]
    fn test_leader_hint_materializes_unknown_leader() {
        let manager = manager("node-a");
        let peer = NodeIdentity::generate("node-b");
        let leader = NodeIdentity::generate("node-c");

        let hint = LeaderHint {
            identity: leader.clone(),
            term: 1,
            address: "10.0.0.3".to_string(),
            port: 2426,
            credentials: ConnectionCredentials::default(),
            last_ping_at: now_millis(),
        };
        let mut state = manager.lock_state();
        let actions = manager.on_ping(
            &mut state,
            peer,
            1,
            NodeRole::Replica,
            2424,
            ConnectionCredentials::default(),
            Some(hint),
            "10.0.0.2",
        );

        let leader_entry = &state.known_servers[&leader];
        assert!(leader_entry.leader);
        assert_eq!(leader_entry.address, "10.0.0.3");
        let kinds: Vec<_> = actions.events.iter().map(|e| e.kind.clone()).collect();
        assert!(kinds.contains(&crate::ClusterEventKind::LeaderElected));
    }

    #[test]
    fn test_expired_leader_hint_ignored() {
        let manager = manager("node-a");
        let peer = NodeIdentity::generate("node-b");
        let leader = NodeIdentity::generate("node-c");

        let hint = LeaderHint {
            identity: leader.clone(),
            term: 1,
            address: "10.0.0.3".to_string(),
            port: 2426,
            credentials: ConnectionCredentials::default(),
            last_ping_at: now_millis() - 60_000,
        };
        let mut state = manager.lock_state();
        manager.on_ping(
            &mut state,
            peer,
            1,
            NodeRole::Replica,
            2424,
            ConnectionCredentials::default(),
            Some(hint),
            "10.0.0.2",
        );
        assert!(!state.known_servers.contains_key(&leader));
    }

    #[test]
    fn test_vote_granted_once_per_term() {
        let manager = manager("node-a");
        let first = NodeIdentity::generate("node-b");
        let second = NodeIdentity::generate("node-c");

        let mut state = manager.lock_state();
        let actions = manager.on_start_election(&mut state, first.clone(), 1, 0);
        assert_eq!(actions.send.len(), 1);
        match &actions.send[0] {
            BroadcastMessage::Vote { vote_for, term, .. } => {
                assert_eq!(vote_for, &first);
                assert_eq!(*term, 1);
            }
            other => panic!("expected vote, got {:?}", other),
        }

        // same term, different candidate: no second vote
        let actions = manager.on_start_election(&mut state, second, 1, 0);
        assert!(actions.send.is_empty());
    }

    #[test]
    fn test_vote_requires_fresh_log() {
        let log = Arc::new(MemoryOperationLog::new());
        for i in 1..=3u64 {
            log.log(LogRequest::Confirm { up_to: LogId(i) }).unwrap();
        }
        let manager = manager_with_log("node-a", log);
        let candidate = NodeIdentity::generate("node-b");

        let mut state = manager.lock_state();
        // term must beat the starting term seeded from the log (3)
        let actions = manager.on_start_election(&mut state, candidate.clone(), 5, 1);
        assert!(actions.send.is_empty(), "stale candidate must not get a vote");

        let actions = manager.on_start_election(&mut state, candidate, 5, 3);
        assert_eq!(actions.send.len(), 1);
    }

    #[test]
    fn test_votes_promote_candidate_and_broadcast() {
        let manager = manager("node-a");

        {
            let mut state = manager.lock_state();
            state.election.start_election();
        }
        let voter = NodeIdentity::generate("node-b");
        let me = manager.identity().clone();

        let mut state = manager.lock_state();
        let actions = manager.on_vote(&mut state, voter, 1, me.clone());
        drop(state);

        assert_eq!(manager.role(), ElectionRole::Leader);
        assert!(matches!(
            actions.send.as_slice(),
            [BroadcastMessage::LeaderElected { term: 1, .. }]
        ));
        let leader = manager.current_leader().unwrap();
        assert_eq!(leader.identity, me);
    }

    #[test]
    fn test_vote_ignored_unless_candidate() {
        let manager = manager("node-a");
        let voter = NodeIdentity::generate("node-b");
        let me = manager.identity().clone();

        let mut state = manager.lock_state();
        let actions = manager.on_vote(&mut state, voter, 1, me);
        assert!(actions.send.is_empty());
        assert_eq!(state.election.role(), ElectionRole::Follower);
    }

    #[test]
    fn test_leader_elected_adoption_and_dedup() {
        let manager = manager("node-a");
        let leader = NodeIdentity::generate("node-b");

        let mut state = manager.lock_state();
        let actions = manager.on_leader_elected(
            &mut state,
            leader.clone(),
            2,
            2424,
            ConnectionCredentials::default(),
            "10.0.0.2",
        );
        assert_eq!(state.election.current_term(), 2);
        assert_eq!(state.election.role(), ElectionRole::Follower);
        let kinds: Vec<_> = actions.events.iter().map(|e| e.kind.clone()).collect();
        assert!(kinds.contains(&crate::ClusterEventKind::LeaderElected));

        // the same announcement again must not fire a second notification
        let actions = manager.on_leader_elected(
            &mut state,
            leader,
            2,
            2424,
            ConnectionCredentials::default(),
            "10.0.0.2",
        );
        assert!(actions.events.is_empty());
    }

    #[test]
    fn test_stale_leader_elected_ignored() {
        let manager = manager("node-a");
        let leader = NodeIdentity::generate("node-b");

        let mut state = manager.lock_state();
        state.election.change_term(5);
        let actions = manager.on_leader_elected(
            &mut state,
            leader.clone(),
            3,
            2424,
            ConnectionCredentials::default(),
            "10.0.0.2",
        );
        assert!(actions.events.is_empty());
        assert!(!state.known_servers.contains_key(&leader));
    }

    #[tokio::test]
    async fn test_eviction_emits_single_disconnect() {
        let manager = manager("node-a");
        manager.events.start().await;
        let mut events = manager.subscribe_events();
        let peer = NodeIdentity::generate("node-b");

        {
            let mut state = manager.lock_state();
            manager.on_ping(
                &mut state,
                peer.clone(),
                0,
                NodeRole::Replica,
                2424,
                ConnectionCredentials::default(),
                None,
                "10.0.0.2",
            );
            // silence the peer beyond the inactivity window
            state
                .known_servers
                .get_mut(&peer)
                .unwrap()
                .last_ping_at = now_millis() - 10_000;
        }

        manager.evict_stale_nodes().await;
        manager.evict_stale_nodes().await;

        assert!(manager.known_nodes().is_empty());
        let mut disconnects = 0;
        while let Ok(event) = events.try_recv() {
            if event.kind == crate::ClusterEventKind::NodeDisconnected {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }
}
