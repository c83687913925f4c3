use std::collections::HashSet;

use crate::types::UserId;

/// A group counts as online when at least one member is in the online set.
pub fn group_online<'a, I>(members: I, online: &HashSet<UserId>) -> bool
where
    I: IntoIterator<Item = &'a UserId>,
{
    members.into_iter().any(|m| online.contains(m))
}
