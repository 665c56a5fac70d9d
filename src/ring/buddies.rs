//! Buddy selection helper.

use crate::member::{Member, MemberId};

/// Picks the buddies `me` should watch: the next `count` members after `me`
/// in ascending ID order, wrapping around. Never includes `me`; returns every
/// other member if there are not enough of them.
pub fn select_buddies(
    members: &[Member],
    me: MemberId,
    count: usize,
) -> Vec<Member> {
    let mut others: Vec<Member> =
        members.iter().filter(|m| m.id != me).copied().collect();
    others.sort_by_key(|m| m.id);
    others.dedup_by_key(|m| m.id);

    let start = others.partition_point(|m| m.id < me);
    others.rotate_left(start);
    others.truncate(count);
    others
}
