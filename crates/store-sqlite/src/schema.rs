pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE hunting_tasks (
  task_id         INTEGER PRIMARY KEY AUTOINCREMENT,
  target_host     TEXT NOT NULL,
  target_port     INTEGER NOT NULL CHECK (target_port BETWEEN 1 AND 65535),
  target_ip       TEXT NOT NULL,
  hmac_key        BLOB NOT NULL,
  active          INTEGER NOT NULL CHECK (active IN (0,1)) DEFAULT 1,
  created_ms      INTEGER NOT NULL
);

CREATE TABLE server_certs (
  sha256_der_hash TEXT PRIMARY KEY,
  der             BLOB NOT NULL,
  cert_chain_md5  TEXT
);

CREATE TABLE cert_observations (
  observation_id   INTEGER PRIMARY KEY AUTOINCREMENT,
  cert_hash        TEXT NOT NULL REFERENCES server_certs(sha256_der_hash),
  server_host_port TEXT NOT NULL CHECK (length(server_host_port) <= 2048),
  server_ip        TEXT NOT NULL,
  observed_ms      INTEGER NOT NULL,
  observer_type    TEXT NOT NULL,
  observer_ip      TEXT NOT NULL
);

CREATE TABLE hunting_task_results (
  result_id       INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id         INTEGER NOT NULL REFERENCES hunting_tasks(task_id),
  trace           TEXT NOT NULL,
  observation_id  INTEGER NOT NULL REFERENCES cert_observations(observation_id)
);

CREATE TABLE hunting_task_list_cache (
  data            BLOB NOT NULL,
  valid_until_ms  INTEGER NOT NULL
);

CREATE INDEX idx_tasks_active ON hunting_tasks(active);
CREATE INDEX idx_observations_cert ON cert_observations(cert_hash, server_host_port);
CREATE INDEX idx_results_task ON hunting_task_results(task_id);

COMMIT;
"#
;
