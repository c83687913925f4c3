use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use parley_shared::types::UserId;

use crate::database::Database;
use crate::error::Result;
use crate::messages::{format_ts, parse_ts};
use crate::models::PublicKeyRecord;

impl Database {
    /// Insert or replace a user's public key. A version older than the stored
    /// one is ignored; returns whether the row changed.
    pub fn upsert_public_key(
        &self,
        user_id: &UserId,
        public_key: &str,
        key_version: u32,
    ) -> Result<bool> {
        let changed = self.conn().execute(
            "INSERT INTO public_keys (user_id, public_key, key_version, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                public_key  = excluded.public_key,
                key_version = excluded.key_version,
                updated_at  = excluded.updated_at
             WHERE excluded.key_version >= public_keys.key_version",
            params![user_id.as_str(), public_key, key_version, format_ts(&Utc::now())],
        )?;
        Ok(changed > 0)
    }

    pub fn get_public_key(&self, user_id: &UserId) -> Result<Option<PublicKeyRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT user_id, public_key, key_version, updated_at
                 FROM public_keys WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| {
                    let user: String = row.get(0)?;
                    let updated: String = row.get(3)?;
                    Ok(PublicKeyRecord {
                        user_id: UserId::from(user.as_str()),
                        public_key: row.get(1)?,
                        key_version: row.get(2)?,
                        updated_at: parse_ts(3, &updated)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_missing_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_public_key(&UserId::from("ghost")).unwrap().is_none());
    }

    #[test]
    fn upsert_is_idempotent_and_ignores_stale_versions() {
        let db = Database::open_in_memory().unwrap();
        let alice = UserId::from("alice");

        assert!(db.upsert_public_key(&alice, "k1", 1).unwrap());
        assert!(db.upsert_public_key(&alice, "k1", 1).unwrap());
        assert!(db.upsert_public_key(&alice, "k2", 2).unwrap());
        assert!(!db.upsert_public_key(&alice, "k1", 1).unwrap());

        let rec = db.get_public_key(&alice).unwrap().unwrap();
        assert_eq!(rec.public_key, "k2");
        assert_eq!(rec.key_version, 2);
    }
}
