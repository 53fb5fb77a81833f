//! Script model (spec §3 `Command`, `Script file`) and parser (spec §4.1).

mod builtin;
mod parser;

pub use builtin::{builtin_script_source, BuiltinScript};
pub use parser::{parse_script_source, rewrite_placeholders};

use crate::expr::PgBenchExpr;

/// Query submission protocol (spec §6 `-M`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Simple,
    Extended,
    Prepared,
}

/// The verbs a meta-command (`\...`) can name (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaVerb {
    Set { var: String, expr: PgBenchExpr },
    /// `min`/`max`/threshold are kept as raw argument tokens: argument
    /// substitution (`:name` -> value, `::x` -> literal `:x`) and the final i64
    /// parse both happen at dispatch time, since variable values are per-client
    /// and only known at runtime (spec §4.6/§8 "Argument substitution").
    SetRandom {
        var: String,
        min_tok: String,
        max_tok: String,
        dist: RandomDistSpec,
    },
    Sleep { amount_tok: String, unit: SleepUnit },
    SetShell { var: String, cmd: String, args: Vec<String> },
    Shell { cmd: String, args: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepUnit {
    Us,
    Ms,
    S,
}

impl SleepUnit {
    pub fn factor_us(self) -> i64 {
        match self {
            SleepUnit::Us => 1,
            SleepUnit::Ms => 1_000,
            SleepUnit::S => 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistKind {
    Uniform,
    Gaussian,
    Exponential,
}

/// Distribution plus its raw threshold token (unused for `Uniform`), resolved at
/// dispatch time just like `min_tok`/`max_tok`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomDistSpec {
    pub kind: DistKind,
    pub threshold_tok: Option<String>,
}

/// One parsed command, belonging to exactly one script file (spec §3 `Command`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Sql {
        /// SQL with `:name` rewritten to `$k` for extended/prepared modes, kept
        /// verbatim for simple mode.
        sql_text: String,
        /// Names bound as `$1..$N`, in order of first appearance.
        params: Vec<String>,
        /// Stable per-(file, position) name for `PREPARE` in prepared mode
        /// (SPEC_FULL.md §3 addendum).
        prepared_name: String,
    },
    Meta(MetaVerb),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub raw_line: String,
    pub command_num: usize,
}

/// An ordered sequence of commands; a client's transaction is the full script.
#[derive(Debug, Clone)]
pub struct ScriptFile {
    pub name: String,
    pub commands: Vec<Command>,
}
