//! Leader election state machine
//!
//! Per-node term/role state and the vote-counting algorithm. The machine is
//! perpetual: it cycles between FOLLOWER, CANDIDATE and LEADER for the
//! lifetime of the process. For a fixed term at most one node can collect a
//! quorum of votes for its own candidacy, because a follower votes at most
//! once per term and any two quorums intersect.
//!
//! The machine is not self-synchronizing; the owning node manager serializes
//! every call together with its registry updates.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use tracing::{debug, info};

use tessera_api::model::NodeIdentity;

/// Role of the local node in the current term
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ElectionRole {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl ElectionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElectionRole::Follower => "FOLLOWER",
            ElectionRole::Candidate => "CANDIDATE",
            ElectionRole::Leader => "LEADER",
        }
    }
}

impl Display for ElectionRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-node election state: current term, role and received votes
#[derive(Debug)]
pub struct LeaderElectionStateMachine {
    identity: NodeIdentity,
    current_term: u64,
    role: ElectionRole,
    quorum: usize,
    votes_received: HashSet<NodeIdentity>,
    last_term_voted: u64,
}

impl LeaderElectionStateMachine {
    /// Create the machine in FOLLOWER state at `starting_term`
    ///
    /// The starting term is seeded from the operational log's last
    /// persistent id on restart, or 0 on a fresh node.
    pub fn new(identity: NodeIdentity, quorum: usize, starting_term: u64) -> Self {
        Self {
            identity,
            current_term: starting_term,
            role: ElectionRole::Follower,
            quorum,
            votes_received: HashSet::new(),
            last_term_voted: 0,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn role(&self) -> ElectionRole {
        self.role
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn votes_received(&self) -> usize {
        self.votes_received.len()
    }

    pub fn last_term_voted(&self) -> u64 {
        self.last_term_voted
    }

    /// Become a candidate for the next term, voting for self
    ///
    /// The self-vote already counts toward quorum, so a quorum of one
    /// promotes immediately.
    pub fn start_election(&mut self) {
        self.current_term += 1;
        self.role = ElectionRole::Candidate;
        self.votes_received.clear();
        self.votes_received.insert(self.identity.clone());
        self.last_term_voted = self.current_term;
        info!(
            term = self.current_term,
            node = %self.identity,
            "starting leader election"
        );
        if self.votes_received.len() >= self.quorum {
            self.role = ElectionRole::Leader;
        }
    }

    /// Count a vote sent by `from` for `vote_for`
    ///
    /// Votes for other nodes are ignored. A vote carrying a higher term
    /// demotes the machine regardless of its current role.
    pub fn receive_vote(&mut self, term: u64, from: NodeIdentity, vote_for: &NodeIdentity) {
        if *vote_for != self.identity {
            return;
        }
        if term == self.current_term {
            self.votes_received.insert(from);
            if self.votes_received.len() >= self.quorum {
                self.role = ElectionRole::Leader;
                info!(
                    term = self.current_term,
                    votes = self.votes_received.len(),
                    "quorum reached, assuming leadership"
                );
            }
        } else if term > self.current_term {
            self.change_term(term);
        }
    }

    /// Adopt a higher term observed on the network; demotes to FOLLOWER
    pub fn change_term(&mut self, term: u64) {
        debug!(from = self.current_term, to = term, "changing term");
        self.role = ElectionRole::Follower;
        self.votes_received.clear();
        self.current_term = term;
    }

    /// Abandon a candidacy that did not reach quorum, keeping the term
    pub fn reset_leader_election(&mut self) {
        if self.role == ElectionRole::Candidate {
            self.role = ElectionRole::Follower;
            self.votes_received.clear();
        }
    }

    /// Whether a vote may be granted for an election at `term`
    ///
    /// At most one vote per term: the term must be beyond both the current
    /// term and any term already voted in.
    pub fn can_vote_in(&self, term: u64) -> bool {
        term > self.current_term && term > self.last_term_voted
    }

    /// Record that a vote was cast in `term`; the voter steps to FOLLOWER
    pub fn record_vote_cast(&mut self, term: u64) {
        self.role = ElectionRole::Follower;
        self.last_term_voted = term;
    }

    /// Force a role, used when leadership is learned from the network
    pub fn set_role(&mut self, role: ElectionRole) {
        self.role = role;
    }

    /// Overwrite the term without clearing votes (leader-elected adoption)
    pub fn set_current_term(&mut self, term: u64) {
        self.current_term = term;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(quorum: usize) -> LeaderElectionStateMachine {
        LeaderElectionStateMachine::new(NodeIdentity::generate("node-a"), quorum, 0)
    }

    #[test]
    fn test_initial_state() {
        let sm = machine(2);
        assert_eq!(sm.role(), ElectionRole::Follower);
        assert_eq!(sm.current_term(), 0);
        assert_eq!(sm.votes_received(), 0);
    }

    #[test]
    fn test_start_election_votes_for_self() {
        let mut sm = machine(2);
        sm.start_election();
        assert_eq!(sm.role(), ElectionRole::Candidate);
        assert_eq!(sm.current_term(), 1);
        assert_eq!(sm.votes_received(), 1);
        assert_eq!(sm.last_term_voted(), 1);
    }

    #[test]
    fn test_quorum_promotes_to_leader() {
        let mut sm = machine(2);
        sm.start_election();

        let me = sm.identity().clone();
        sm.receive_vote(1, NodeIdentity::generate("node-b"), &me);
        assert_eq!(sm.role(), ElectionRole::Leader);
    }

    #[test]
    fn test_single_node_quorum() {
        let mut sm = machine(1);
        sm.start_election();
        // the self-vote alone satisfies a quorum of one
        assert_eq!(sm.role(), ElectionRole::Leader);
    }

    #[test]
    fn test_vote_for_other_node_ignored() {
        let mut sm = machine(2);
        sm.start_election();

        let other = NodeIdentity::generate("node-c");
        sm.receive_vote(1, NodeIdentity::generate("node-b"), &other);
        assert_eq!(sm.role(), ElectionRole::Candidate);
        assert_eq!(sm.votes_received(), 1);
    }

    #[test]
    fn test_duplicate_voter_counted_once() {
        let mut sm = machine(3);
        sm.start_election();

        let me = sm.identity().clone();
        let voter = NodeIdentity::generate("node-b");
        sm.receive_vote(1, voter.clone(), &me);
        sm.receive_vote(1, voter, &me);
        assert_eq!(sm.votes_received(), 2);
        assert_eq!(sm.role(), ElectionRole::Candidate);
    }

    #[test]
    fn test_stale_term_vote_ignored() {
        let mut sm = machine(2);
        sm.start_election();
        sm.start_election(); // term 2

        let me = sm.identity().clone();
        sm.receive_vote(1, NodeIdentity::generate("node-b"), &me);
        assert_eq!(sm.role(), ElectionRole::Candidate);
        assert_eq!(sm.votes_received(), 1);
    }

    #[test]
    fn test_higher_term_demotes() {
        let mut sm = machine(2);
        sm.start_election();

        let me = sm.identity().clone();
        sm.receive_vote(5, NodeIdentity::generate("node-b"), &me);
        assert_eq!(sm.role(), ElectionRole::Follower);
        assert_eq!(sm.current_term(), 5);
        assert_eq!(sm.votes_received(), 0);
    }

    #[test]
    fn test_reset_keeps_term() {
        let mut sm = machine(3);
        sm.start_election();
        assert_eq!(sm.current_term(), 1);

        sm.reset_leader_election();
        assert_eq!(sm.role(), ElectionRole::Follower);
        assert_eq!(sm.current_term(), 1);
        assert_eq!(sm.votes_received(), 0);
    }

    #[test]
    fn test_one_vote_per_term() {
        let mut sm = machine(2);
        assert!(sm.can_vote_in(1));
        sm.record_vote_cast(1);
        assert!(!sm.can_vote_in(1));
        assert!(sm.can_vote_in(2));
    }

    #[test]
    fn test_cannot_vote_at_or_below_current_term() {
        let mut sm = machine(2);
        sm.change_term(4);
        assert!(!sm.can_vote_in(3));
        assert!(!sm.can_vote_in(4));
        assert!(sm.can_vote_in(5));
    }

    #[test]
    fn test_starting_term_seeded() {
        let sm = LeaderElectionStateMachine::new(NodeIdentity::generate("node-a"), 2, 42);
        assert_eq!(sm.current_term(), 42);
    }
}
