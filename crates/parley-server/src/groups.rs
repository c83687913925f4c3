use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{SubsecRound, Utc};
use tracing::info;

use parley_shared::constants::MIN_GROUP_MEMBERS;
use parley_shared::presence::group_online;
use parley_shared::protocol::ServerEvent;
use parley_shared::rest::{AddMembersRequest, CreateGroupRequest, GroupInfo, WrappedGroupKey};
use parley_shared::types::{GroupId, UserId};
use parley_store::{Group, NewGroupMember};

use crate::error::ServerError;
use crate::presence::PresenceBroadcaster;
use crate::registry::ConnectionRegistry;
use crate::state::SharedDatabase;

#[derive(Clone)]
pub struct GroupService {
    db: SharedDatabase,
    registry: ConnectionRegistry,
    presence: PresenceBroadcaster,
}

impl GroupService {
    pub fn new(
        db: SharedDatabase,
        registry: ConnectionRegistry,
        presence: PresenceBroadcaster,
    ) -> Self {
        Self {
            db,
            registry,
            presence,
        }
    }

    /// Create a group of the creator plus at least two other members. Every
    /// member is told about the group with `group-added`.
    pub async fn create_group(
        &self,
        creator: &UserId,
        req: CreateGroupRequest,
    ) -> Result<GroupInfo, ServerError> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(ServerError::BadRequest("group name is empty".into()));
        }

        let mut members = vec![creator.clone()];
        let mut seen: HashSet<UserId> = HashSet::from([creator.clone()]);
        for m in normalize(req.members)? {
            if seen.insert(m.clone()) {
                members.push(m);
            }
        }
        if members.len() < MIN_GROUP_MEMBERS {
            return Err(ServerError::BadRequest(format!(
                "a group needs at least {MIN_GROUP_MEMBERS} members including the creator"
            )));
        }

        let group = Group {
            id: GroupId::new(),
            name,
            creator: creator.clone(),
            created_at: Utc::now().trunc_subsecs(6),
        };
        let rows = with_keys(&members, req.wrapped_keys);
        self.db.lock()?.create_group(&group, &rows)?;

        info!(
            group = %group.id,
            creator = %creator.short(),
            members = members.len(),
            "group created"
        );

        self.notify_added(&group, creator, &members).await;
        self.info(group, members).await
    }

    /// Add members to an existing group. The actor must already be a member;
    /// users already in the group are skipped.
    pub async fn add_members(
        &self,
        group_id: &GroupId,
        actor: &UserId,
        req: AddMembersRequest,
    ) -> Result<GroupInfo, ServerError> {
        let candidates: Vec<UserId> = normalize(req.members)?
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if candidates.is_empty() {
            return Err(ServerError::BadRequest("no members to add".into()));
        }
        let rows = with_keys(&candidates, req.wrapped_keys);

        let (group, added, members) = {
            let mut db = self.db.lock()?;
            let group = self.require_member(&db, group_id, actor)?;
            let added = db.add_group_members(group_id, actor, &rows)?;
            let members = db.group_members(group_id)?;
            (group, added, members)
        };

        if !added.is_empty() {
            info!(group = %group_id, actor = %actor.short(), added = added.len(), "members added");
            self.notify_added(&group, actor, &added).await;
        }
        self.info(group, members).await
    }

    /// The member's copy of the group key. `Ok(None)` when none was
    /// distributed to them.
    pub fn wrapped_key_for(
        &self,
        group_id: &GroupId,
        member: &UserId,
    ) -> Result<Option<WrappedGroupKey>, ServerError> {
        let db = self.db.lock()?;
        self.require_member(&db, group_id, member)?;
        Ok(db.wrapped_group_key(group_id, member)?)
    }

    pub async fn groups_for(&self, user: &UserId) -> Result<Vec<GroupInfo>, ServerError> {
        let listed = {
            let db = self.db.lock()?;
            let mut listed = Vec::new();
            for group in db.list_groups_for_user(user)? {
                let members = db.group_members(&group.id)?;
                listed.push((group, members));
            }
            listed
        };

        let online = self.presence.online_set().await;
        Ok(listed
            .into_iter()
            .map(|(group, members)| to_info(group, members, &online))
            .collect())
    }

    pub async fn details(&self, group_id: &GroupId, viewer: &UserId) -> Result<GroupInfo, ServerError> {
        let (group, members) = {
            let db = self.db.lock()?;
            let group = self.require_member(&db, group_id, viewer)?;
            (group, db.group_members(group_id)?)
        };
        self.info(group, members).await
    }

    fn require_member(
        &self,
        db: &parley_store::Database,
        group_id: &GroupId,
        user: &UserId,
    ) -> Result<Group, ServerError> {
        let group = db
            .get_group(group_id)?
            .ok_or_else(|| ServerError::NotFound(format!("group {group_id}")))?;
        if !db.is_group_member(group_id, user)? {
            return Err(ServerError::Forbidden("not a member of this group".into()));
        }
        Ok(group)
    }

    async fn notify_added(&self, group: &Group, added_by: &UserId, members: &[UserId]) {
        let event = ServerEvent::GroupAdded {
            group_id: group.id,
            group_name: group.name.clone(),
            added_by: added_by.clone(),
        };
        self.registry.send_to_users(members, event, None).await;
    }

    async fn info(&self, group: Group, members: Vec<UserId>) -> Result<GroupInfo, ServerError> {
        let online = self.presence.online_set().await;
        Ok(to_info(group, members, &online))
    }
}

/// Member ids from a request body: trimmed, and rejected when blank.
fn normalize(raw: Vec<UserId>) -> Result<Vec<UserId>, ServerError> {
    raw.iter()
        .map(|m| UserId::parse(m.as_str()).map_err(|e| ServerError::BadRequest(e.to_string())))
        .collect()
}

fn with_keys(
    members: &[UserId],
    wrapped: HashMap<UserId, WrappedGroupKey>,
) -> Vec<NewGroupMember> {
    let mut wrapped: HashMap<UserId, WrappedGroupKey> = wrapped
        .into_iter()
        .filter_map(|(m, key)| UserId::parse(m.as_str()).ok().map(|m| (m, key)))
        .collect();
    members
        .iter()
        .map(|m| NewGroupMember {
            user_id: m.clone(),
            wrapped_key: wrapped.remove(m),
        })
        .collect()
}

fn to_info(group: Group, members: Vec<UserId>, online: &HashSet<UserId>) -> GroupInfo {
    GroupInfo {
        online: group_online(&members, online),
        id: group.id,
        name: group.name,
        creator: group.creator,
        members,
        created_at: group.created_at,
    }
}
