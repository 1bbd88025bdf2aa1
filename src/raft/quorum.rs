//! Majority arithmetic. The local member is never included in the counts
//! passed in here, it is always implicitly counted as agreeing.

use super::{Index, MemberId, NO_INDEX};
use crate::raft::state::FollowerStates;

use std::collections::{BTreeMap, BTreeSet};

/// The smallest quorum we accept, unless the cluster itself is smaller. This
/// guards against a two-member cluster treating a lone member as a majority.
pub const MIN_QUORUM: usize = 2;

/// Returns true if the given number of agreeing members, not including
/// ourself, forms a majority of a cluster of the given size.
pub fn is_quorum(cluster_size: usize, count_not_including_self: usize) -> bool {
    is_quorum_with_min(MIN_QUORUM, cluster_size, count_not_including_self)
}

/// Like is_quorum(), with an explicit minimum quorum size.
pub fn is_quorum_with_min(
    min_quorum: usize,
    cluster_size: usize,
    count_not_including_self: usize,
) -> bool {
    count_not_including_self + 1 >= min_quorum.min(cluster_size)
        && count_not_including_self >= cluster_size / 2
}

/// Returns true if the given set of agreeing members, not including ourself,
/// is a majority of the voting members. An empty voting set has no quorum.
pub fn is_quorum_of(voting_members: &BTreeSet<MemberId>, agreeing: &BTreeSet<MemberId>) -> bool {
    if voting_members.is_empty() {
        return false;
    }
    is_quorum(voting_members.len(), agreeing.intersection(voting_members).count())
}

/// Returns the highest log index that a majority of the voting members are
/// known to have appended, or NO_INDEX if there is none. Members without a
/// follower state (including the leader itself) count as NO_INDEX.
///
/// Members are grouped by match index and the groups are accumulated in
/// descending index order until the running total forms a quorum.
pub fn quorum_append_index(
    voting_members: &BTreeSet<MemberId>,
    follower_states: &FollowerStates,
) -> Index {
    if voting_members.is_empty() {
        return NO_INDEX;
    }
    let mut counts: BTreeMap<Index, usize> = BTreeMap::new();
    for member in voting_members {
        let match_index = follower_states.get(member).map_or(NO_INDEX, |s| s.match_index);
        *counts.entry(match_index).or_default() += 1;
    }
    let mut total = 0;
    for (index, count) in counts.into_iter().rev() {
        total += count;
        if is_quorum(voting_members.len(), total) {
            return index;
        }
    }
    NO_INDEX
}
