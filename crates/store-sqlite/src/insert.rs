use crate::models::to_ms;
use crate::{Db, TaskId};
use anyhow::{anyhow, Result};
use certhunt_core::{CertStore, NewObservation, ObservationId, StoreError, TaskTarget};
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::debug;

impl Db {
    pub fn insert_task(&self, target: &TaskTarget, hmac_key: &[u8], created: OffsetDateTime) -> Result<TaskId> {
        self.conn.execute(
            "INSERT INTO hunting_tasks(target_host,target_port,target_ip,hmac_key,active,created_ms) VALUES (?,?,?,?,1,?)",
            params![target.host, target.port, target.ip.to_string(), hmac_key, to_ms(created)],
        )?;
        let id = self.conn.last_insert_rowid();
        TaskId::try_from(id).map_err(|_| anyhow!("task id {} does not fit the wire format", id))
    }

    /// Returns false if no such task exists.
    pub fn set_task_active(&self, task_id: TaskId, active: bool) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE hunting_tasks SET active=? WHERE task_id=?",
            params![active, task_id],
        )?;
        Ok(n > 0)
    }

    /// Store a certificate by the hex SHA-256 of its DER encoding. A chain
    /// digest marks it chain-verified.
    pub fn insert_server_cert(&self, der: &[u8], cert_chain_md5: Option<&str>) -> Result<String> {
        let hash = hex::encode(Sha256::digest(der));
        self.conn.execute(
            "INSERT INTO server_certs(sha256_der_hash,der,cert_chain_md5) VALUES (?,?,?)
             ON CONFLICT(sha256_der_hash) DO UPDATE SET cert_chain_md5=COALESCE(excluded.cert_chain_md5,server_certs.cert_chain_md5)",
            params![hash, der, cert_chain_md5],
        )?;
        Ok(hash)
    }
}

impl CertStore for Db {
    fn find_verified_cert(&self, cert_hash: &[u8; 32]) -> Result<bool, StoreError> {
        let cnt: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(1) FROM server_certs WHERE sha256_der_hash=? AND cert_chain_md5 IS NOT NULL",
                [hex::encode(cert_hash)],
                |r| r.get(0),
            )
            .map_err(StoreError::backend)?;
        Ok(cnt > 0)
    }

    fn has_observation(&self, cert_hash: &[u8; 32], server_host_port: &str) -> Result<bool, StoreError> {
        let cnt: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(1) FROM cert_observations WHERE cert_hash=? AND server_host_port=?",
                params![hex::encode(cert_hash), server_host_port],
                |r| r.get(0),
            )
            .map_err(StoreError::backend)?;
        Ok(cnt > 0)
    }

    fn record_observation(&self, obs: &NewObservation) -> Result<ObservationId, StoreError> {
        insert_observation(&self.conn, obs).map_err(StoreError::backend)
    }

    fn record_task_result(&self, task_id: u32, trace: &str, observation_id: ObservationId) -> Result<(), StoreError> {
        insert_task_result(&self.conn, task_id, trace, observation_id).map_err(StoreError::backend)
    }

    fn record_task_observation(&self, task_id: u32, trace: &str, obs: &NewObservation) -> Result<ObservationId, StoreError> {
        let tx = self.conn.unchecked_transaction().map_err(StoreError::backend)?;
        let observation_id = insert_observation(&tx, obs).map_err(StoreError::backend)?;
        insert_task_result(&tx, task_id, trace, observation_id).map_err(StoreError::backend)?;
        tx.commit().map_err(StoreError::backend)?;
        debug!(task_id, observation_id, "stored hunting task result");
        Ok(observation_id)
    }
}

fn insert_observation(conn: &Connection, obs: &NewObservation) -> rusqlite::Result<ObservationId> {
    conn.execute(
        "INSERT INTO cert_observations(cert_hash,server_host_port,server_ip,observed_ms,observer_type,observer_ip) VALUES (?,?,?,?,?,?)",
        params![
            obs.cert_hash_hex,
            obs.server_host_port,
            obs.server_ip.to_string(),
            to_ms(obs.observed_at),
            obs.observer_type,
            obs.observer_ip.to_string()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_task_result(conn: &Connection, task_id: u32, trace: &str, observation_id: ObservationId) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO hunting_task_results(task_id,trace,observation_id) VALUES (?,?,?)",
        params![task_id, trace, observation_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use certhunt_core::TaskStore;

    fn target() -> TaskTarget {
        TaskTarget { host: "www.example.org".into(), port: 443, ip: "2001:db8::9".parse().unwrap() }
    }

    #[test]
    fn tasks_round_trip_and_deactivate() {
        let db = Db::open_in_memory().unwrap();
        let id = db.insert_task(&target(), b"key", OffsetDateTime::UNIX_EPOCH).unwrap();
        let task = db.lookup_task(id).unwrap().unwrap();
        assert_eq!(task.target, target());
        assert!(task.active);
        assert_eq!(task.hmac_key, b"key");
        assert!(db.set_task_active(id, false).unwrap());
        assert!(!db.lookup_task(id).unwrap().unwrap().active);
        assert!(db.list_active_tasks().unwrap().is_empty());
        assert!(!db.set_task_active(id + 1, false).unwrap());
        assert_eq!(db.lookup_task(id + 1).unwrap(), None);
    }

    #[test]
    fn observation_ids_increase() {
        let db = Db::open_in_memory().unwrap();
        let hash = db.insert_server_cert(b"not really der", None).unwrap();
        let obs = NewObservation {
            cert_hash_hex: hash,
            server_host_port: "www.example.org:443".into(),
            server_ip: "203.0.113.9".parse().unwrap(),
            observed_at: OffsetDateTime::UNIX_EPOCH,
            observer_type: "Test",
            observer_ip: "198.51.100.1".parse().unwrap(),
        };
        let a = db.record_observation(&obs).unwrap();
        let b = db.record_observation(&obs).unwrap();
        assert!(b > a);
    }

    #[test]
    fn failed_task_result_leaves_no_observation() {
        let db = Db::open_in_memory().unwrap();
        let hash = db.insert_server_cert(b"cert", Some("00ff")).unwrap();
        let obs = NewObservation {
            cert_hash_hex: hash,
            server_host_port: "www.example.org:443".into(),
            server_ip: "203.0.113.9".parse().unwrap(),
            observed_at: OffsetDateTime::UNIX_EPOCH,
            observer_type: "Test",
            observer_ip: "198.51.100.1".parse().unwrap(),
        };
        // No task 99: the result row violates its foreign key.
        assert!(db.record_task_observation(99, "trace", &obs).is_err());
        let observations: i64 = db.conn.query_row("SELECT COUNT(1) FROM cert_observations", [], |r| r.get(0)).unwrap();
        assert_eq!(observations, 0);

        let task_id = db.insert_task(&target(), b"key", OffsetDateTime::UNIX_EPOCH).unwrap();
        let id = db.record_task_observation(task_id, "trace", &obs).unwrap();
        let stored: i64 = db.conn.query_row("SELECT observation_id FROM hunting_task_results", [], |r| r.get(0)).unwrap();
        assert_eq!(stored, id);
    }

    #[test]
    fn chain_digest_marks_verified() {
        let db = Db::open_in_memory().unwrap();
        let hex_hash = db.insert_server_cert(b"cert", None).unwrap();
        let mut hash = [0u8; 32];
        hex::decode_to_slice(&hex_hash, &mut hash).unwrap();
        assert!(!db.find_verified_cert(&hash).unwrap());
        // Re-inserting without a digest keeps an existing one.
        db.insert_server_cert(b"cert", Some("00ff")).unwrap();
        db.insert_server_cert(b"cert", None).unwrap();
        assert!(db.find_verified_cert(&hash).unwrap());
    }
}
