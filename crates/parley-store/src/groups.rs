use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use parley_shared::rest::WrappedGroupKey;
use parley_shared::types::{GroupId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::messages::{format_ts, parse_ts};
use crate::models::{Group, NewGroupMember};

impl Database {
    /// Insert the group and all its initial members in one transaction.
    pub fn create_group(&mut self, group: &Group, members: &[NewGroupMember]) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO groups (id, name, creator, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                group.id.to_string(),
                group.name,
                group.creator.as_str(),
                format_ts(&group.created_at),
            ],
        )?;
        for member in members {
            insert_member(&tx, &group.id, &group.creator, member)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Add members, skipping those already present. Returns the users that
    /// were actually added.
    pub fn add_group_members(
        &mut self,
        group_id: &GroupId,
        added_by: &UserId,
        members: &[NewGroupMember],
    ) -> Result<Vec<UserId>> {
        let tx = self.conn_mut().transaction()?;
        let mut added = Vec::new();
        for member in members {
            if insert_member(&tx, group_id, added_by, member)? {
                added.push(member.user_id.clone());
            }
        }
        tx.commit()?;
        Ok(added)
    }

    pub fn get_group(&self, group_id: &GroupId) -> Result<Option<Group>> {
        let group = self
            .conn()
            .query_row(
                "SELECT id, name, creator, created_at FROM groups WHERE id = ?1",
                params![group_id.to_string()],
                row_to_group,
            )
            .optional()?;
        Ok(group)
    }

    pub fn list_groups_for_user(&self, user_id: &UserId) -> Result<Vec<Group>> {
        let mut stmt = self.conn().prepare(
            "SELECT g.id, g.name, g.creator, g.created_at
             FROM groups g
             JOIN group_members m ON m.group_id = g.id
             WHERE m.user_id = ?1
             ORDER BY g.created_at ASC",
        )?;
        let rows = stmt.query_map(params![user_id.as_str()], row_to_group)?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    pub fn group_members(&self, group_id: &GroupId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY added_at ASC, user_id ASC",
        )?;
        let rows = stmt.query_map(params![group_id.to_string()], |row| {
            let id: String = row.get(0)?;
            Ok(UserId::from(id.as_str()))
        })?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    pub fn is_group_member(&self, group_id: &GroupId, user_id: &UserId) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                params![group_id.to_string(), user_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The member's copy of the group key, if one was distributed.
    pub fn wrapped_group_key(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<Option<WrappedGroupKey>> {
        let row: Option<(Option<String>, Option<u32>)> = self
            .conn()
            .query_row(
                "SELECT wrapped_key, key_version FROM group_members
                 WHERE group_id = ?1 AND user_id = ?2",
                params![group_id.to_string(), user_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(match row {
            Some((Some(wrapped_key), version)) => Some(WrappedGroupKey {
                wrapped_key,
                key_version: version.unwrap_or(1),
            }),
            _ => None,
        })
    }
}

fn insert_member(
    conn: &rusqlite::Connection,
    group_id: &GroupId,
    added_by: &UserId,
    member: &NewGroupMember,
) -> Result<bool> {
    let (wrapped, version) = match &member.wrapped_key {
        Some(w) => (Some(w.wrapped_key.as_str()), Some(w.key_version)),
        None => (None, None),
    };
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO group_members
            (group_id, user_id, added_by, added_at, wrapped_key, key_version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            group_id.to_string(),
            member.user_id.as_str(),
            added_by.as_str(),
            format_ts(&Utc::now()),
            wrapped,
            version,
        ],
    )?;
    Ok(inserted > 0)
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    let id_str: String = row.get(0)?;
    let creator: String = row.get(2)?;
    let created: String = row.get(3)?;

    let id = GroupId::parse(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Group {
        id,
        name: row.get(1)?,
        creator: UserId::from(creator.as_str()),
        created_at: parse_ts(3, &created)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::SubsecRound;

    use super::*;

    fn member(name: &str, key: Option<&str>) -> NewGroupMember {
        NewGroupMember {
            user_id: UserId::from(name),
            wrapped_key: key.map(|k| WrappedGroupKey {
                wrapped_key: k.into(),
                key_version: 1,
            }),
        }
    }

    fn new_group(creator: &str) -> Group {
        Group {
            id: GroupId::new(),
            name: "hikers".into(),
            creator: UserId::from(creator),
            // Stored with microsecond precision.
            created_at: Utc::now().trunc_subsecs(6),
        }
    }

    #[test]
    fn create_and_list() {
        let mut db = Database::open_in_memory().unwrap();
        let group = new_group("a");
        db.create_group(
            &group,
            &[member("a", Some("ka")), member("b", Some("kb")), member("c", None)],
        )
        .unwrap();

        assert_eq!(db.get_group(&group.id).unwrap(), Some(group.clone()));
        assert_eq!(db.group_members(&group.id).unwrap().len(), 3);
        assert!(db.is_group_member(&group.id, &UserId::from("b")).unwrap());
        assert!(!db.is_group_member(&group.id, &UserId::from("z")).unwrap());

        let for_c = db.list_groups_for_user(&UserId::from("c")).unwrap();
        assert_eq!(for_c, vec![group.clone()]);
        assert!(db.list_groups_for_user(&UserId::from("z")).unwrap().is_empty());

        let key = db.wrapped_group_key(&group.id, &UserId::from("b")).unwrap();
        assert_eq!(key.unwrap().wrapped_key, "kb");
        assert!(db.wrapped_group_key(&group.id, &UserId::from("c")).unwrap().is_none());
    }

    #[test]
    fn add_members_skips_existing() {
        let mut db = Database::open_in_memory().unwrap();
        let group = new_group("a");
        db.create_group(&group, &[member("a", None), member("b", None), member("c", None)])
            .unwrap();

        let added = db
            .add_group_members(
                &group.id,
                &UserId::from("b"),
                &[member("c", None), member("d", Some("kd"))],
            )
            .unwrap();
        assert_eq!(added, vec![UserId::from("d")]);
        assert_eq!(db.group_members(&group.id).unwrap().len(), 4);
    }

    #[test]
    fn unknown_group_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_group(&GroupId::new()).unwrap().is_none());
    }
}
