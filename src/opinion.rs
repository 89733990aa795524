//! Neighbour plurality voting.
//!
//! A nara never trusts a single peer about another peer's history. Instead
//! it tallies what every neighbour reports about a name's start time,
//! restart count and last restart, and adopts the most common value —
//! subject to the winning count strictly exceeding one third of the
//! neighbourhood. Ties between equally supported values go to the smallest
//! value so that a vote over the same snapshot is deterministic.

use std::collections::HashMap;

use crate::nara::Nara;

/// Winner-take-all over a value tally. Only strictly positive values are
/// candidates; a winner must have strictly more than `floor` votes.
/// Returns 0 when no candidate qualifies.
fn winning_vote(tally: &HashMap<i64, usize>, floor: usize) -> i64 {
    let mut winner = 0i64;
    let mut max_seen = 0usize;
    for (&value, &count) in tally {
        if value <= 0 || count <= floor {
            continue;
        }
        if count > max_seen || (count == max_seen && value < winner) {
            winner = value;
            max_seen = count;
        }
    }
    winner
}

/// Reconciled first-boot time for `name`, or 0 when no value is reported by
/// strictly more than a third of the neighbourhood.
pub fn start_time_vote(neighbourhood: &HashMap<String, Nara>, name: &str) -> i64 {
    let mut tally: HashMap<i64, usize> = HashMap::new();
    for nara in neighbourhood.values() {
        let observed = nara.observation_of(name).start_time;
        if observed > 0 {
            *tally.entry(observed).or_default() += 1;
        }
    }
    winning_vote(&tally, neighbourhood.len() / 3)
}

/// Reconciled restart count for `name`. The zero vote is never a candidate —
/// a restart count of 0 is the uninformed default — so any positive value
/// with the highest support wins outright, with no floor.
pub fn restarts_vote(neighbourhood: &HashMap<String, Nara>, name: &str) -> i64 {
    let mut tally: HashMap<i64, usize> = HashMap::new();
    for nara in neighbourhood.values() {
        let observed = nara.observation_of(name).restarts;
        *tally.entry(observed).or_default() += 1;
    }
    winning_vote(&tally, 0)
}

/// Reconciled most-recent-restart time for `name`; same rule as
/// [`start_time_vote`].
pub fn last_restart_vote(neighbourhood: &HashMap<String, Nara>, name: &str) -> i64 {
    let mut tally: HashMap<i64, usize> = HashMap::new();
    for nara in neighbourhood.values() {
        let observed = nara.observation_of(name).last_restart;
        if observed > 0 {
            *tally.entry(observed).or_default() += 1;
        }
    }
    winning_vote(&tally, neighbourhood.len() / 3)
}
