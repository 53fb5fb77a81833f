//! Script text parser (spec §4.1): line classification, meta-command tokenizing
//! and validation, and the `:name` -> `$k` placeholder rewriter for SQL commands.

use crate::error::ScriptParseError;
use crate::expr;
use crate::script::{Command, CommandKind, DistKind, MetaVerb, QueryMode, RandomDistSpec, ScriptFile, SleepUnit};

/// At most `MAX_ARGS - 1` bound parameters per SQL statement (spec §4.1, from
/// the original's `#define MAX_ARGS 10`).
pub const MAX_ARGS: usize = 10;

/// Parses one script file's source text into a `ScriptFile`.
///
/// `command_num_start` is the next globally unique `command_num` to assign (spec
/// §3: command numbers are assigned in parse order across all script files).
/// Returns the parsed file and the next free `command_num`.
pub fn parse_script_source(
    name: &str,
    source: &str,
    mode: QueryMode,
    command_num_start: usize,
) -> Result<(ScriptFile, usize), ScriptParseError> {
    let mut commands = Vec::new();
    let mut command_num = command_num_start;
    let mut sql_seq = 0usize;

    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw_line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }

        let kind = if let Some(rest) = trimmed.strip_prefix('\\') {
            parse_meta(rest, name, line_no, raw_line)?
        } else {
            let prepared_name = format!("P_{name}_{sql_seq}");
            sql_seq += 1;
            let (sql_text, params) = if mode == QueryMode::Simple {
                (trimmed.trim_end().to_string(), Vec::new())
            } else {
                rewrite_placeholders(trimmed.trim_end(), name, line_no, raw_line)?
            };
            CommandKind::Sql { sql_text, params, prepared_name }
        };

        commands.push(Command {
            kind,
            raw_line: raw_line.to_string(),
            command_num,
        });
        command_num += 1;
    }

    Ok((
        ScriptFile {
            name: name.to_string(),
            commands,
        },
        command_num,
    ))
}

fn col_of(raw_line: &str, trimmed: &str) -> usize {
    raw_line.len() - trimmed.len() + 1
}

/// `\verb arg arg ...`. `set` is special: only the variable name is
/// whitespace-split as a second token, the rest of the line is the expression.
fn parse_meta(
    rest: &str,
    file: &str,
    line: usize,
    raw_line: &str,
) -> Result<CommandKind, ScriptParseError> {
    let trimmed_all = rest.trim_start();
    let verb_end = trimmed_all.find(char::is_whitespace).unwrap_or(trimmed_all.len());
    let verb = &trimmed_all[..verb_end];
    let after_verb = &trimmed_all[verb_end..];

    let err = |col: usize, msg: String| ScriptParseError::new(file, line, col, raw_line, msg);

    match verb {
        "set" => {
            let rest = after_verb.trim_start();
            let name_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            if name_end == 0 {
                return Err(err(col_of(raw_line, rest), "\\set requires a variable name".into()));
            }
            let var = rest[..name_end].to_string();
            let expr_src = rest[name_end..].trim_start();
            if expr_src.is_empty() {
                return Err(err(col_of(raw_line, &rest[name_end..]), "\\set requires an expression".into()));
            }
            let col_offset = col_of(raw_line, expr_src);
            let expr = expr::parse_expr(expr_src, file, line, raw_line, col_offset)?;
            Ok(CommandKind::Meta(MetaVerb::Set { var, expr }))
        }
        "setrandom" => {
            let toks = split_ws(after_verb);
            if toks.len() != 4 && toks.len() != 5 && toks.len() != 6 {
                return Err(err(
                    col_of(raw_line, trimmed_all),
                    "\\setrandom requires \"var min max [uniform]\" or \"var min max (gaussian|exponential) threshold\"".into(),
                ));
            }
            let var = toks[0].to_string();
            let min_tok = toks[1].to_string();
            let max_tok = toks[2].to_string();
            let dist = if toks.len() <= 5 {
                if toks.len() == 5 && toks[4] != "uniform" {
                    return Err(err(col_of(raw_line, toks[4]), format!("unknown distribution \"{}\"", toks[4])));
                }
                RandomDistSpec { kind: DistKind::Uniform, threshold_tok: None }
            } else {
                let kind = match toks[3] {
                    "gaussian" => DistKind::Gaussian,
                    "exponential" => DistKind::Exponential,
                    other => {
                        return Err(err(col_of(raw_line, toks[3]), format!("unknown distribution \"{other}\"")));
                    }
                };
                RandomDistSpec { kind, threshold_tok: Some(toks[5].to_string()) }
            };
            Ok(CommandKind::Meta(MetaVerb::SetRandom { var, min_tok, max_tok, dist }))
        }
        "sleep" => {
            let arg = after_verb.trim();
            if arg.is_empty() {
                return Err(err(col_of(raw_line, after_verb), "\\sleep requires an argument".into()));
            }
            let toks = split_ws(after_verb);
            let (amount_tok, unit) = if toks.len() == 2 {
                (toks[0].to_string(), parse_unit(toks[1]).ok_or_else(|| {
                    err(col_of(raw_line, toks[1]), format!("unknown sleep unit \"{}\"", toks[1]))
                })?)
            } else if toks.len() == 1 {
                split_trailing_unit(toks[0])
            } else {
                return Err(err(col_of(raw_line, after_verb), "\\sleep takes at most 2 arguments".into()));
            };
            Ok(CommandKind::Meta(MetaVerb::Sleep { amount_tok, unit }))
        }
        "setshell" => {
            let toks = split_ws(after_verb);
            if toks.len() < 2 {
                return Err(err(
                    col_of(raw_line, trimmed_all),
                    "\\setshell requires \"var cmd ...\"".into(),
                ));
            }
            let var = toks[0].to_string();
            let cmd = toks[1].to_string();
            let args = toks[2..].iter().map(|s| s.to_string()).collect();
            Ok(CommandKind::Meta(MetaVerb::SetShell { var, cmd, args }))
        }
        "shell" => {
            let toks = split_ws(after_verb);
            if toks.is_empty() {
                return Err(err(col_of(raw_line, trimmed_all), "\\shell requires \"cmd ...\"".into()));
            }
            let cmd = toks[0].to_string();
            let args = toks[1..].iter().map(|s| s.to_string()).collect();
            Ok(CommandKind::Meta(MetaVerb::Shell { cmd, args }))
        }
        "" => Err(err(col_of(raw_line, trimmed_all), "empty meta-command".into())),
        other => Err(err(col_of(raw_line, trimmed_all), format!("unknown meta-command \"\\{other}\""))),
    }
}

fn split_ws(s: &str) -> Vec<&str> {
    s.split_whitespace().collect()
}

fn parse_unit(s: &str) -> Option<SleepUnit> {
    match s {
        "us" => Some(SleepUnit::Us),
        "ms" => Some(SleepUnit::Ms),
        "s" => Some(SleepUnit::S),
        _ => None,
    }
}

/// `<digits><unit>` concatenated (e.g. `500ms`); default unit is `s` if no unit
/// suffix is present.
fn split_trailing_unit(tok: &str) -> (String, SleepUnit) {
    for (unit_str, unit) in [("us", SleepUnit::Us), ("ms", SleepUnit::Ms), ("s", SleepUnit::S)] {
        if let Some(digits) = tok.strip_suffix(unit_str) {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit() || c == ':') {
                return (digits.to_string(), unit);
            }
        }
    }
    (tok.to_string(), SleepUnit::S)
}

/// Rewrites `:name` references in `sql` into positional `$k` parameters, for
/// extended/prepared query modes (spec §4.1). Scans for `:`, then a following
/// `[A-Za-z0-9_]+`; if found, replaces `:name` with `$k` (k = next positional
/// index, reusing `k` for a name already seen) and records `name` in `params`;
/// if not found (e.g. `:` not followed by an identifier), the `:` run is left
/// untouched (spec §8 "`:name` with no match is left textually unchanged").
pub fn rewrite_placeholders(
    sql: &str,
    file: &str,
    line: usize,
    raw_line: &str,
) -> Result<(String, Vec<String>), ScriptParseError> {
    let mut out = String::with_capacity(sql.len());
    let mut params: Vec<String> = Vec::new();
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c != ':' {
            out.push(c);
            i += 1;
            continue;
        }
        // `::` is not a placeholder escape here (that's only for meta-command
        // arguments); a literal `::` in SQL is simply two colons, neither of
        // which start a valid identifier run on its own once consumed one at a
        // time, so it falls through to "not found" naturally below.
        let start = i + 1;
        let mut end = start;
        while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
            end += 1;
        }
        if end > start {
            let name: String = chars[start..end].iter().collect();
            let idx = match params.iter().position(|p| p == &name) {
                Some(pos) => pos + 1,
                None => {
                    params.push(name);
                    params.len()
                }
            };
            if params.len() > MAX_ARGS - 1 {
                return Err(ScriptParseError::new(
                    file,
                    line,
                    col_of(raw_line, &sql[i..]),
                    raw_line,
                    format!("at most {} parameters are supported per statement", MAX_ARGS - 1),
                ));
            }
            out.push('$');
            out.push_str(&idx.to_string());
            i = end;
        } else {
            out.push(':');
            i += 1;
        }
    }
    Ok((out, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(mode: QueryMode, src: &str) -> ScriptFile {
        parse_script_source("t", src, mode, 0).unwrap().0
    }

    #[test]
    fn blank_and_comment_lines_are_ignored() {
        let f = parse_one(QueryMode::Simple, "\n-- comment\nSELECT 1;\n");
        assert_eq!(f.commands.len(), 1);
    }

    #[test]
    fn set_meta_command() {
        let f = parse_one(QueryMode::Simple, "\\set x 3 + 4 * 2");
        match &f.commands[0].kind {
            CommandKind::Meta(MetaVerb::Set { var, .. }) => assert_eq!(var, "x"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn setrandom_uniform_4_tokens() {
        let f = parse_one(QueryMode::Simple, "\\setrandom k 1 100");
        match &f.commands[0].kind {
            CommandKind::Meta(MetaVerb::SetRandom { dist, .. }) => {
                assert_eq!(dist.kind, DistKind::Uniform);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn setrandom_explicit_uniform_5_tokens() {
        let f = parse_one(QueryMode::Simple, "\\setrandom k 1 100 uniform");
        assert!(f.commands.len() == 1);
    }

    #[test]
    fn setrandom_bad_trailing_token_is_rejected() {
        let r = parse_script_source("t", "\\setrandom k 1 100 bogus\n", QueryMode::Simple, 0);
        assert!(r.is_err());
    }

    #[test]
    fn setrandom_gaussian_6_tokens() {
        let f = parse_one(QueryMode::Simple, "\\setrandom k 1 100 gaussian 4.0");
        match &f.commands[0].kind {
            CommandKind::Meta(MetaVerb::SetRandom { dist, .. }) => {
                assert_eq!(dist.kind, DistKind::Gaussian);
                assert_eq!(dist.threshold_tok.as_deref(), Some("4.0"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sleep_digits_and_unit_concatenated() {
        let f = parse_one(QueryMode::Simple, "\\sleep 500ms");
        match &f.commands[0].kind {
            CommandKind::Meta(MetaVerb::Sleep { amount_tok, unit }) => {
                assert_eq!(amount_tok, "500");
                assert_eq!(*unit, SleepUnit::Ms);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sleep_default_unit_is_seconds() {
        let f = parse_one(QueryMode::Simple, "\\sleep 2");
        match &f.commands[0].kind {
            CommandKind::Meta(MetaVerb::Sleep { amount_tok, unit }) => {
                assert_eq!(amount_tok, "2");
                assert_eq!(*unit, SleepUnit::S);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sleep_number_and_unit_as_two_tokens() {
        let f = parse_one(QueryMode::Simple, "\\sleep 2 ms");
        match &f.commands[0].kind {
            CommandKind::Meta(MetaVerb::Sleep { amount_tok, unit }) => {
                assert_eq!(amount_tok, "2");
                assert_eq!(*unit, SleepUnit::Ms);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn setshell_requires_at_least_three_tokens() {
        assert!(parse_script_source("t", "\\setshell x\n", QueryMode::Simple, 0).is_err());
    }

    #[test]
    fn shell_requires_at_least_two_tokens() {
        assert!(parse_script_source("t", "\\shell\n", QueryMode::Simple, 0).is_err());
    }

    #[test]
    fn simple_mode_keeps_sql_verbatim() {
        let f = parse_one(QueryMode::Simple, "SELECT abalance FROM pgbench_accounts WHERE aid = :aid;");
        match &f.commands[0].kind {
            CommandKind::Sql { sql_text, params, .. } => {
                assert!(sql_text.contains(":aid"));
                assert!(params.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn prepared_mode_rewrites_placeholders() {
        // spec §8 scenario 6.
        let f = parse_one(QueryMode::Prepared, "SELECT abalance FROM pgbench_accounts WHERE aid = :aid;");
        match &f.commands[0].kind {
            CommandKind::Sql { sql_text, params, .. } => {
                assert_eq!(sql_text, "SELECT abalance FROM pgbench_accounts WHERE aid = $1;");
                assert_eq!(params, &vec!["aid".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn repeated_name_reuses_positional_index() {
        let (sql, params) = rewrite_placeholders("SELECT :x + :y + :x", "f", 1, "SELECT :x + :y + :x").unwrap();
        assert_eq!(sql, "SELECT $1 + $2 + $1");
        assert_eq!(params, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn colon_not_followed_by_identifier_is_unchanged() {
        let (sql, params) = rewrite_placeholders("a::b ':' c", "f", 1, "a::b ':' c").unwrap();
        assert_eq!(sql, "a::b ':' c");
        assert!(params.is_empty());
    }

    #[test]
    fn too_many_params_is_a_parse_error() {
        let sql = (0..10).map(|i| format!(":v{i}")).collect::<Vec<_>>().join(", ");
        assert!(rewrite_placeholders(&sql, "f", 1, &sql).is_err());
    }

    proptest::proptest! {
        #[test]
        fn rewriter_produces_k_sequential_placeholders(names in proptest::collection::vec("[a-z]{1,5}", 1..8)) {
            let mut seen: Vec<String> = Vec::new();
            let mut sql = String::new();
            for n in &names {
                sql.push_str(&format!(":{n} "));
                if !seen.contains(n) {
                    seen.push(n.clone());
                }
            }
            if seen.len() > MAX_ARGS - 1 {
                return Ok(());
            }
            let (rewritten, params) = rewrite_placeholders(&sql, "f", 1, &sql).unwrap();
            proptest::prop_assert_eq!(&params, &seen);
            for (i, _) in seen.iter().enumerate() {
                let marker = format!("${}", i + 1);
                proptest::prop_assert!(rewritten.contains(&marker));
            }
        }
    }
}
