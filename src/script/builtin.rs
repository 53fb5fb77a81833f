//! The three built-in scripts (spec §6 "Built-in scripts"), in spirit verbatim
//! from `original_source/src/bin/pgbench/pgbench.c`'s `tpcb_like`/`simple_update`/
//! `select_only` command tables.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinScript {
    /// Default: full TPC-B-like transaction.
    TpcbLike,
    /// `-N`: skips the teller/branch balance updates.
    SimpleUpdate,
    /// `-S`: a single read-only `SELECT`.
    SelectOnly,
}

impl BuiltinScript {
    /// The synthetic file name each builtin is parsed under (spec §6).
    pub fn file_name(self) -> &'static str {
        match self {
            BuiltinScript::TpcbLike => "<builtin: tpcb-like>",
            BuiltinScript::SimpleUpdate => "<builtin: simple-update>",
            BuiltinScript::SelectOnly => "<builtin: select-only>",
        }
    }
}

pub fn builtin_script_source(b: BuiltinScript) -> &'static str {
    match b {
        BuiltinScript::TpcbLike => TPCB_LIKE,
        BuiltinScript::SimpleUpdate => SIMPLE_UPDATE,
        BuiltinScript::SelectOnly => SELECT_ONLY,
    }
}

// The expression language (spec §4.2) covers only literals, variables, and
// `+ - * / %`; it has no `random(...)`-style function call like the original
// pgbench's extended grammar. So the scaled bounds are computed once with
// `\set` (plain arithmetic) and then handed to `\setrandom` by variable
// reference, which is exactly what `\setrandom`'s argument substitution (spec
// §4.6/§8) is for. `:scale` is seeded into every client's variable table by the
// coordinator from the configured scale factor.

const TPCB_LIKE: &str = "\
\\set naccounts 100000 * :scale
\\setrandom aid 1 :naccounts
\\setrandom bid 1 :scale
\\setrandom tid 1 :scale
\\setrandom delta -5000 5000
BEGIN;
UPDATE pgbench_accounts SET abalance = abalance + :delta WHERE aid = :aid;
SELECT abalance FROM pgbench_accounts WHERE aid = :aid;
UPDATE pgbench_tellers SET tbalance = tbalance + :delta WHERE tid = :tid;
UPDATE pgbench_branches SET bbalance = bbalance + :delta WHERE bid = :bid;
INSERT INTO pgbench_history (tid, bid, aid, delta, mtime) VALUES (:tid, :bid, :aid, :delta, CURRENT_TIMESTAMP);
END;
";

const SIMPLE_UPDATE: &str = "\
\\set naccounts 100000 * :scale
\\setrandom aid 1 :naccounts
\\setrandom bid 1 :scale
\\setrandom tid 1 :scale
\\setrandom delta -5000 5000
BEGIN;
UPDATE pgbench_accounts SET abalance = abalance + :delta WHERE aid = :aid;
SELECT abalance FROM pgbench_accounts WHERE aid = :aid;
INSERT INTO pgbench_history (tid, bid, aid, delta, mtime) VALUES (:tid, :bid, :aid, :delta, CURRENT_TIMESTAMP);
END;
";

const SELECT_ONLY: &str = "\
\\set naccounts 100000 * :scale
\\setrandom aid 1 :naccounts
SELECT abalance FROM pgbench_accounts WHERE aid = :aid;
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{parse_script_source, QueryMode};

    #[test]
    fn builtins_parse_under_simple_mode() {
        for b in [
            BuiltinScript::TpcbLike,
            BuiltinScript::SimpleUpdate,
            BuiltinScript::SelectOnly,
        ] {
            let src = builtin_script_source(b);
            let result = parse_script_source(b.file_name(), src, QueryMode::Simple, 0);
            assert!(result.is_ok(), "{:?} failed to parse: {:?}", b, result.err());
        }
    }
}
