use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry as ProtoLogEntry, VoteRequest,
    VoteResponse,
};
use crate::raft::state::{LogEntry, RaftRole, RaftState};

/// Handle RequestVote RPC.
///
/// Returns the response plus whether persistent state changed and must be
/// flushed before the response leaves this node.
pub fn handle_request_vote(
    state: &mut RaftState,
    req: &VoteRequest,
    my_id: u64,
) -> (VoteResponse, bool) {
    let mut persist = false;

    // If request term is greater, update our term and become follower
    if req.term > state.current_term {
        state.become_follower(req.term);
        persist = true;
    }

    let vote_granted = if req.term < state.current_term {
        // Reject if request term is less than our current term
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        // Already voted for someone else in this term
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        // Candidate's log is not up-to-date
        false
    } else {
        // Grant vote
        state.voted_for = Some(req.candidate_id);
        persist = true;
        true
    };

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    (
        VoteResponse {
            term: state.current_term,
            vote_granted,
        },
        persist,
    )
}

/// Handle AppendEntries RPC.
///
/// Returns the response plus whether persistent state changed and must be
/// flushed before the response leaves this node.
pub fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesRequest,
    my_id: u64,
) -> (AppendEntriesResponse, bool) {
    let mut persist = false;

    // If request term is greater, update our term and become follower
    if req.term > state.current_term {
        state.become_follower(req.term);
        persist = true;
    }

    // Reject if request term is less than our current term
    if req.term < state.current_term {
        return (
            AppendEntriesResponse {
                term: state.current_term,
                success: false,
                match_index: state.last_log_index(),
            },
            persist,
        );
    }

    // Valid AppendEntries from the leader of this term - step down if we
    // are a candidate (voted_for stays: one ballot per term)
    if state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.leader_id = Some(req.leader_id);

    // Consistency check: our log must contain prev_log_index with the
    // matching term. Anything at or below the snapshot anchor is known
    // committed and passes by construction.
    if req.prev_log_index > state.snapshot_index {
        match state.term_at(req.prev_log_index) {
            None => {
                // We don't have the entry at prev_log_index
                return (
                    AppendEntriesResponse {
                        term: state.current_term,
                        success: false,
                        match_index: state.last_log_index(),
                    },
                    persist,
                );
            }
            Some(term) if term != req.prev_log_term => {
                // Conflict: drop the divergent suffix and reject so the
                // leader backs off
                state.truncate_from(req.prev_log_index);
                persist = true;
                return (
                    AppendEntriesResponse {
                        term: state.current_term,
                        success: false,
                        match_index: state.last_log_index(),
                    },
                    persist,
                );
            }
            Some(_) => {}
        }
    }

    // Append entries not already present. A duplicate or reordered call
    // must not touch entries it carries consistently, so the log is only
    // truncated at the first real divergence.
    let mut appended = 0usize;
    for entry in &req.entries {
        if entry.index <= state.snapshot_index {
            continue; // already compacted, therefore already committed
        }
        match state.term_at(entry.index) {
            Some(term) if term == entry.term => {} // already present
            Some(_) => {
                state.truncate_from(entry.index);
                state.push_entry(proto_to_log_entry(entry));
                appended += 1;
                persist = true;
            }
            None => {
                state.push_entry(proto_to_log_entry(entry));
                appended += 1;
                persist = true;
            }
        }
    }

    if appended > 0 {
        tracing::debug!(
            node_id = my_id,
            entries_appended = appended,
            new_last_index = state.last_log_index(),
            "Appended entries"
        );
    }

    // If leaderCommit > commitIndex, advance commitIndex toward it but
    // never past our own log
    if req.leader_commit > state.commit_index {
        state.commit_index = std::cmp::min(req.leader_commit, state.last_log_index());
    }

    (
        AppendEntriesResponse {
            term: state.current_term,
            success: true,
            match_index: state.last_log_index(),
        },
        persist,
    )
}

/// Convert protobuf LogEntry to internal LogEntry
pub fn proto_to_log_entry(proto: &ProtoLogEntry) -> LogEntry {
    LogEntry {
        term: proto.term,
        index: proto.index,
        command: proto.command.clone(),
    }
}

/// Convert internal LogEntry to protobuf LogEntry
pub fn log_entry_to_proto(entry: &LogEntry) -> ProtoLogEntry {
    ProtoLogEntry {
        term: entry.term,
        index: entry.index,
        command: entry.command.clone(),
    }
}
