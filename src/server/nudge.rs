//! Nudge voting (C6): a lightweight "everyone agrees this person should get
//! a nudge sound" mechanism. Threshold is `max(1, room_size - 1)` distinct
//! voters for a given target; a voter's vote against the same target is
//! rate-limited by a cooldown so repeated clicks don't immediately retrigger.

use std::collections::HashMap;

use crate::config::NUDGE_VOTE_COOLDOWN_SECS;

use super::state::SharedState;

pub enum VoteOutcome {
    /// Vote recorded but threshold not yet reached.
    Recorded,
    /// Vote ignored: this voter is still in cooldown for this target.
    Cooldown,
    /// Threshold reached: votes for this target were cleared, caller should
    /// deliver `play_nudge` to the target and `nudge_triggered` to the room.
    Triggered,
}

/// Record `voter_uid`'s vote against `target_uid` in `room`, given the
/// room's current member count (including the target, excluding no one).
pub fn record_vote(
    state: &SharedState,
    room: &str,
    target_uid: u32,
    voter_uid: u32,
    room_member_count: usize,
    now: f64,
) -> VoteOutcome {
    let mut votes = state.nudge_votes.lock();
    let room_votes = votes.entry(room.to_string()).or_default();
    let target_votes = room_votes.entry(target_uid).or_insert_with(HashMap::new);

    if let Some(&last) = target_votes.get(&voter_uid) {
        if now - last < NUDGE_VOTE_COOLDOWN_SECS {
            return VoteOutcome::Cooldown;
        }
    }
    target_votes.insert(voter_uid, now);

    let threshold = room_member_count.saturating_sub(1).max(1);
    let active = target_votes.values().filter(|&&ts| now - ts < NUDGE_VOTE_COOLDOWN_SECS).count();
    if active >= threshold {
        room_votes.remove(&target_uid);
        VoteOutcome::Triggered
    } else {
        VoteOutcome::Recorded
    }
}

/// Drop all recorded votes naming `uid`, either as target or voter, used on
/// disconnect/room change so stale votes can't linger and count toward a
/// future threshold.
pub fn clear_votes_for(state: &SharedState, uid: u32) {
    let mut votes = state.nudge_votes.lock();
    for room_votes in votes.values_mut() {
        room_votes.remove(&uid);
        for target_votes in room_votes.values_mut() {
            target_votes.remove(&uid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggers_at_room_size_minus_one_distinct_voters() {
        let state = SharedState::new();
        // room of 4: threshold is 3 distinct voters against the target.
        assert!(matches!(
            record_vote(&state, "r", 1, 2, 4, 100.0),
            VoteOutcome::Recorded
        ));
        assert!(matches!(
            record_vote(&state, "r", 1, 3, 4, 100.0),
            VoteOutcome::Recorded
        ));
        assert!(matches!(
            record_vote(&state, "r", 1, 4, 4, 100.0),
            VoteOutcome::Triggered
        ));
    }

    #[test]
    fn single_member_room_threshold_is_one() {
        let state = SharedState::new();
        assert!(matches!(
            record_vote(&state, "r", 1, 2, 1, 100.0),
            VoteOutcome::Triggered
        ));
    }

    #[test]
    fn repeated_vote_within_cooldown_is_ignored() {
        let state = SharedState::new();
        assert!(matches!(
            record_vote(&state, "r", 1, 2, 10, 100.0),
            VoteOutcome::Recorded
        ));
        assert!(matches!(
            record_vote(&state, "r", 1, 2, 10, 100.0 + NUDGE_VOTE_COOLDOWN_SECS - 1.0),
            VoteOutcome::Cooldown
        ));
        assert!(matches!(
            record_vote(&state, "r", 1, 2, 10, 100.0 + NUDGE_VOTE_COOLDOWN_SECS + 1.0),
            VoteOutcome::Recorded
        ));
    }
}
