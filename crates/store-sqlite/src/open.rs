use crate::schema::MIG_0001_INIT;
use anyhow::Result;
use rusqlite::Connection;
use std::time::Duration;

pub struct Db {
    pub conn: Connection,
}

impl Db {
    pub fn open_or_create(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        let db = Db { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", &"ON")?;
        let db = Db { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        // naive: if hunting_tasks doesn't exist, apply 0001
        if !self.table_exists("hunting_tasks")? {
            self.conn.execute_batch(MIG_0001_INIT)?;
        }
        Ok(())
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", &"WAL")?;
    conn.pragma_update(None, "synchronous", &"NORMAL")?;
    conn.pragma_update(None, "foreign_keys", &"ON")?;
    // concurrent cache writers wait for each other instead of failing at once
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}
