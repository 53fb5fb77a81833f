//! Initialization-mode collaborator (SPEC_FULL.md §6 addendum): creates and
//! populates the four fixed schema tables against the configured connection.
//! Deliberately thin relative to the core — plumbing, not scheduling.

use std::fmt;

use crate::cli::Config;
use crate::db::DbConnection;

const SCALE_32BIT_THRESHOLD: i64 = 20_000;

#[derive(Debug)]
pub enum InitError {
    Connect(String),
    Query(String),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Connect(m) => write!(f, "connection error during initialization: {m}"),
            InitError::Query(m) => write!(f, "query error during initialization: {m}"),
        }
    }
}

impl std::error::Error for InitError {}

impl From<crate::db::DbError> for InitError {
    fn from(e: crate::db::DbError) -> Self {
        InitError::Query(e.to_string())
    }
}

fn key_type(scale: i64) -> &'static str {
    if scale >= SCALE_32BIT_THRESHOLD { "bigint" } else { "int" }
}

/// Runs the requested `--init-steps` letters against `conn` (spec: `d` drop,
/// `t` create tables, `g` client-side generate, `v` vacuum, `p` primary keys,
/// `f` foreign keys; `G`, server-side generation, is not implemented — the
/// core never needs it, so it is treated as `g`).
pub fn run<C: DbConnection>(conn: &mut C, cfg: &Config) -> Result<(), InitError> {
    let scale = cfg.scale.unwrap_or(1);
    let steps = cfg.init_steps.as_str();

    if steps.contains('d') {
        drop_tables(conn)?;
    }
    if steps.contains('t') {
        create_tables(conn, scale)?;
    }
    if steps.contains('g') || steps.contains('G') {
        populate(conn, scale)?;
    }
    if steps.contains('p') && !cfg.no_index {
        add_primary_keys(conn)?;
    }
    if steps.contains('f') && !cfg.no_fk {
        add_foreign_keys(conn)?;
    }
    if steps.contains('v') {
        vacuum(conn)?;
    }
    Ok(())
}

fn drop_tables<C: DbConnection>(conn: &mut C) -> Result<(), InitError> {
    for table in ["pgbench_history", "pgbench_accounts", "pgbench_tellers", "pgbench_branches"] {
        conn.blocking_query(&format!("DROP TABLE IF EXISTS {table}"))?;
    }
    Ok(())
}

fn create_tables<C: DbConnection>(conn: &mut C, scale: i64) -> Result<(), InitError> {
    let key = key_type(scale);
    conn.blocking_query(&format!(
        "CREATE TABLE pgbench_branches (bid {key} NOT NULL, bbalance {key} NOT NULL, filler char(88))"
    ))?;
    conn.blocking_query(&format!(
        "CREATE TABLE pgbench_tellers (tid {key} NOT NULL, bid {key} NOT NULL, tbalance {key} NOT NULL, filler char(84))"
    ))?;
    conn.blocking_query(&format!(
        "CREATE TABLE pgbench_accounts (aid {key} NOT NULL, bid {key} NOT NULL, abalance {key} NOT NULL, filler char(84))"
    ))?;
    conn.blocking_query(&format!(
        "CREATE TABLE pgbench_history (tid {key}, bid {key}, aid {key}, delta int, mtime timestamp, filler char(22))"
    ))?;
    Ok(())
}

/// Bulk-populates the three balance tables (spec: `scale` branches, `scale *
/// 10` tellers via batched `INSERT`, `scale * 100_000` accounts via the fast
/// `COPY ... FROM STDIN` path, grounded in the original's
/// `initGenerateDataClientSide`).
fn populate<C: DbConnection>(conn: &mut C, scale: i64) -> Result<(), InitError> {
    for bid in 1..=scale {
        conn.blocking_query(&format!(
            "INSERT INTO pgbench_branches (bid, bbalance) VALUES ({bid}, 0)"
        ))?;
    }
    for tid in 1..=(scale * 10) {
        let bid = ((tid - 1) / 10) + 1;
        conn.blocking_query(&format!(
            "INSERT INTO pgbench_tellers (tid, bid, tbalance) VALUES ({tid}, {bid}, 0)"
        ))?;
    }
    let naccounts = scale * 100_000;
    let mut row_idx = 0i64;
    let mut rows = std::iter::from_fn(move || {
        row_idx += 1;
        if row_idx > naccounts {
            return None;
        }
        let bid = ((row_idx - 1) / 100_000) + 1;
        Some(format!("{row_idx}\t{bid}\t0\t\\N"))
    });
    conn.copy_in("pgbench_accounts", &mut rows)?;
    Ok(())
}

fn add_primary_keys<C: DbConnection>(conn: &mut C) -> Result<(), InitError> {
    conn.blocking_query("ALTER TABLE pgbench_branches ADD PRIMARY KEY (bid)")?;
    conn.blocking_query("ALTER TABLE pgbench_tellers ADD PRIMARY KEY (tid)")?;
    conn.blocking_query("ALTER TABLE pgbench_accounts ADD PRIMARY KEY (aid)")?;
    Ok(())
}

fn add_foreign_keys<C: DbConnection>(conn: &mut C) -> Result<(), InitError> {
    conn.blocking_query(
        "ALTER TABLE pgbench_tellers ADD FOREIGN KEY (bid) REFERENCES pgbench_branches (bid)",
    )?;
    conn.blocking_query(
        "ALTER TABLE pgbench_accounts ADD FOREIGN KEY (bid) REFERENCES pgbench_branches (bid)",
    )?;
    conn.blocking_query(
        "ALTER TABLE pgbench_history ADD FOREIGN KEY (bid) REFERENCES pgbench_branches (bid)",
    )?;
    conn.blocking_query(
        "ALTER TABLE pgbench_history ADD FOREIGN KEY (tid) REFERENCES pgbench_tellers (tid)",
    )?;
    conn.blocking_query(
        "ALTER TABLE pgbench_history ADD FOREIGN KEY (aid) REFERENCES pgbench_accounts (aid)",
    )?;
    Ok(())
}

fn vacuum<C: DbConnection>(conn: &mut C) -> Result<(), InitError> {
    for table in ["pgbench_branches", "pgbench_tellers", "pgbench_accounts", "pgbench_history"] {
        conn.blocking_query(&format!("VACUUM ANALYZE {table}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::ScriptSource;
    use crate::db::{ConnParams, MockConnection};

    fn cfg(init_steps: &str, scale: i64) -> Config {
        Config {
            clients: 1,
            jobs: 1,
            target_txn_count: None,
            duration_s: None,
            query_mode: crate::script::QueryMode::Simple,
            scripts: ScriptSource::Builtin(crate::script::BuiltinScript::TpcbLike),
            defines: vec![],
            per_statement_latency: false,
            rate_tps: None,
            latency_limit_us: None,
            log_mode: None,
            progress_interval_s: None,
            per_transaction_connection: false,
            scale: Some(scale),
            initialize: true,
            init_steps: init_steps.to_string(),
            no_index: false,
            no_fk: false,
            conn_params: ConnParams {
                host: "mock".into(),
                port: 0,
                user: "u".into(),
                password: None,
                dbname: "d".into(),
            },
        }
    }

    #[test]
    fn small_scale_uses_int_keys() {
        assert_eq!(key_type(1), "int");
        assert_eq!(key_type(SCALE_32BIT_THRESHOLD), "bigint");
    }

    #[test]
    fn full_init_runs_all_requested_steps() {
        let mut conn = MockConnection::with_responses(Vec::new());
        let result = run(&mut conn, &cfg("dtgvpf", 1));
        assert!(result.is_ok());
        assert!(conn.sent.iter().any(|s| s.contains("CREATE TABLE pgbench_branches")));
        assert!(conn.sent.iter().any(|s| s.contains("ADD PRIMARY KEY")));
        assert!(conn.sent.iter().any(|s| s.contains("VACUUM")));
    }

    #[test]
    fn no_index_flag_skips_primary_keys() {
        let mut conn = MockConnection::with_responses(Vec::new());
        let mut c = cfg("tp", 1);
        c.no_index = true;
        run(&mut conn, &c).unwrap();
        assert!(!conn.sent.iter().any(|s| s.contains("PRIMARY KEY")));
    }
}
