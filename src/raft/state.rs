use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::storage::PersistedState;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// A single entry in the replicated log.
///
/// Commands are opaque bytes; the owning service defines their meaning.
/// Indices start at 1, with the snapshot anchor (initially `(0, 0)`) acting
/// as the sentinel below the first live entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Vec<u8>,
}

/// Consensus state for one node.
///
/// # Raft Safety Invariants
///
/// This implementation maintains the following safety guarantees:
///
/// ## Election Safety
/// At most one leader can be elected in a given term. Enforced by:
/// - Each node votes for at most one candidate per term (`voted_for`,
///   cleared only when `current_term` increases)
/// - Candidate must receive majority of votes to become leader
///
/// ## Leader Append-Only
/// A leader never overwrites or deletes entries in its log. Enforced by:
/// - Leaders only append new entries via `append_entry()`
/// - Log truncation only occurs on followers during replication conflicts
///
/// ## Log Matching
/// If two logs contain an entry with the same index and term, then the logs
/// are identical in all entries up through that index. Enforced by:
/// - `AppendEntries` consistency check (prev_log_index, prev_log_term)
/// - Conflicting entries are truncated before appending
///
/// ## Leader Completeness
/// If a log entry is committed in a given term, that entry will be present
/// in the logs of all leaders for higher terms. Enforced by:
/// - Vote restriction: candidates must have up-to-date logs (`is_log_up_to_date`)
/// - Leaders only commit entries from their current term
///
/// ## State Machine Safety
/// If a server has applied a log entry at a given index, no other server will
/// ever apply a different entry for that index. Enforced by:
/// - Entries are only applied after being committed (`last_applied <= commit_index`)
/// - Committed entries are never overwritten (Leader Completeness)
#[derive(Debug)]
pub struct RaftState {
    // Persistent state, flushed via Storage before any externally
    // visible effect
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,

    // Snapshot anchor: everything at or below snapshot_index has been
    // compacted away and is known committed
    pub snapshot_index: u64,
    pub snapshot_term: u64,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,

    // Current role
    pub role: RaftRole,

    // Known leader (if any)
    pub leader_id: Option<u64>,

    // Votes received in current election (for candidates)
    pub votes_received: u64,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            snapshot_index: 0,
            snapshot_term: 0,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: 0,
        }
    }

    /// Rebuild from a persisted triple after restart.
    ///
    /// Everything at or below the snapshot anchor was both committed and
    /// applied by the owning service before it asked for compaction, so
    /// commit_index and last_applied restart from there.
    pub fn restore(&mut self, persisted: PersistedState) {
        self.current_term = persisted.current_term;
        self.voted_for = persisted.voted_for;
        self.log = persisted.log;
        self.snapshot_index = persisted.snapshot_index;
        self.snapshot_term = persisted.snapshot_term;
        self.commit_index = self.snapshot_index;
        self.last_applied = self.snapshot_index;
    }

    /// Snapshot of the persistent fields, for handing to `Storage::save`.
    pub fn persistent_state(&self) -> PersistedState {
        PersistedState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
            snapshot_index: self.snapshot_index,
            snapshot_term: self.snapshot_term,
        }
    }

    /// Get the last log index
    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(self.snapshot_index)
    }

    /// Get the last log term
    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    /// Get log entry at index, or None if it is compacted or absent
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.log.get((index - self.snapshot_index - 1) as usize)
    }

    /// Term of the entry at index, answering from the snapshot anchor for
    /// the compacted boundary. The anchor at index 0 doubles as the
    /// sentinel entry with term 0.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get_entry(index).map(|e| e.term)
    }

    /// Get entries starting from index (inclusive)
    pub fn entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        let start = start_index.max(self.snapshot_index + 1);
        let offset = (start - self.snapshot_index - 1) as usize;
        if offset >= self.log.len() {
            return Vec::new();
        }
        self.log[offset..].to_vec()
    }

    /// Append a new entry carrying the current term
    pub fn append_entry(&mut self, command: Vec<u8>) -> &LogEntry {
        let index = self.last_log_index() + 1;
        let entry = LogEntry {
            term: self.current_term,
            index,
            command,
        };
        self.log.push(entry);
        self.log.last().expect("entry was just pushed")
    }

    /// Push a replicated entry as-is (follower side)
    pub fn push_entry(&mut self, entry: LogEntry) {
        self.log.push(entry);
    }

    /// Drop all entries at or after `from_index` (follower conflict
    /// resolution; never called on a leader's own entries)
    pub fn truncate_from(&mut self, from_index: u64) {
        if from_index <= self.snapshot_index {
            return;
        }
        let keep = (from_index - self.snapshot_index - 1) as usize;
        if keep < self.log.len() {
            self.log.truncate(keep);
        }
    }

    /// Discard entries at or below `index` and move the snapshot anchor to
    /// `(index, term)`. Entries after `index` are retained.
    pub fn compact_to(&mut self, index: u64, term: u64) {
        let prefix_len = (index - self.snapshot_index) as usize;
        if prefix_len >= self.log.len() {
            self.log.clear();
        } else {
            self.log.drain(..prefix_len);
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        let our_last_index = self.last_log_index();

        // Candidate's log is up-to-date if:
        // 1. Their last term is greater, OR
        // 2. Terms are equal and their index is >= ours
        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// Transition to follower state.
    ///
    /// `voted_for` is cleared only when the term actually increases; a vote
    /// cast in the current term must stand for the rest of that term.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        self.role = RaftRole::Follower;
        self.votes_received = 0;
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes_received = 1; // Vote for self
        self.leader_id = None;
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, my_id: u64, peer_ids: &[u64]) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);

        // Initialize next_index and match_index for all peers
        let last_log_index = self.last_log_index();
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, last_log_index + 1);
            self.match_index.insert(peer_id, 0);
        }
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
