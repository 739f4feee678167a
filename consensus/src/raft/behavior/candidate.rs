use std::collections::HashSet;

use slog::{debug, info};

use crate::error::StorageError;
use crate::metrics;
use crate::raft::actor::RaftActor;
use crate::raft::behavior::{Behavior, CandidateState};
use crate::raft::messages::{RaftRpc, RequestVote, RequestVoteReply};
use crate::raft::types::{RaftRole, ServerId, TermInfo};
use crate::raft::StateMachine;

impl<S: StateMachine> RaftActor<S> {
    /// Vote for ourselves in a new term and solicit the other voters.
    pub(crate) fn start_election(&mut self) -> Result<(), StorageError> {
        let term = self.term_info.term + 1;
        self.term_info = TermInfo::with_vote(term, self.id);
        self.storage.persist_term_info(&self.term_info)?;

        self.install = None;
        self.behavior = Behavior::Candidate(CandidateState {
            votes: HashSet::from([self.id]),
        });
        self.set_role(RaftRole::Candidate);
        self.set_leader(None);
        metrics::RAFT_ELECTIONS
            .with_label_values(&[self.member_label()])
            .inc();
        info!(self.logger, "starting election";
            "term" => term,
            "last_index" => self.log.last_index(),
            "last_term" => self.log.last_term());
        self.arm_election_timer();

        if self.cluster.quorum() <= 1 {
            return self.become_leader();
        }
        let request = RequestVote {
            term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        let voters: Vec<ServerId> = self
            .cluster
            .voting_members()
            .filter(|id| *id != self.id)
            .collect();
        for voter in voters {
            self.send(voter, RaftRpc::RequestVote(request.clone()));
        }
        Ok(())
    }

    pub(crate) fn handle_vote_reply(&mut self, m: RequestVoteReply) -> Result<(), StorageError> {
        if m.term != self.term_info.term {
            return Ok(());
        }
        let Behavior::Candidate(state) = &mut self.behavior else {
            return Ok(());
        };
        if !m.vote_granted {
            debug!(self.logger, "vote refused"; "voter" => m.voter_id, "term" => m.term);
            return Ok(());
        }
        if !self.cluster.is_voting(m.voter_id) {
            return Ok(());
        }
        state.votes.insert(m.voter_id);
        let votes = state.votes.len();
        debug!(self.logger, "vote granted";
            "voter" => m.voter_id, "votes" => votes, "quorum" => self.cluster.quorum());
        if votes >= self.cluster.quorum() {
            self.become_leader()?;
        }
        Ok(())
    }
}
