//! CRUD operations on the `kv_store` table.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Fetch the value stored under `key`, if any.
    pub fn get_value(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Insert or replace the value stored under `key`.
    pub fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO kv_store (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Delete `key`. Returns whether a row was removed.
    pub fn remove_value(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::database::Database;

    #[test]
    fn set_overwrites_previous_value() {
        let db = Database::open_in_memory().unwrap();
        db.set_value("queue", "[]").unwrap();
        db.set_value("queue", "[1]").unwrap();
        assert_eq!(db.get_value("queue").unwrap().as_deref(), Some("[1]"));
    }

    #[test]
    fn missing_key_reads_as_none() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get_value("nope").unwrap(), None);
        assert!(!db.remove_value("nope").unwrap());
    }
}
