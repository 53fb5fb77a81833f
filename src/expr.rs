//! Expression model for the `\set` meta-command (spec §3/§4.2).
//!
//! `PgBenchExpr` is a tagged variant over three cases — integer constant, variable
//! reference, binary operator — evaluated recursively. Parsing is a standard
//! recursive-descent parser over `+ - * / %` with conventional precedence and
//! left-associativity.

use crate::error::{ClientError, ScriptParseError};
use crate::variables::Variables;

/// A parsed `\set` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgBenchExpr {
    Constant(i64),
    Variable(String),
    BinOp {
        op: BinOp,
        left: Box<PgBenchExpr>,
        right: Box<PgBenchExpr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl PgBenchExpr {
    /// Evaluation is recursive and total except for `/` and `%` with a zero
    /// divisor, which fail the client command (spec §4.2).
    ///
    /// Integer overflow in `+ - *` wraps in two's complement (spec §9 Open
    /// Question, resolved in SPEC_FULL.md).
    pub fn eval(&self, vars: &Variables) -> Result<i64, ClientError> {
        match self {
            PgBenchExpr::Constant(v) => Ok(*v),
            PgBenchExpr::Variable(name) => {
                let raw = vars
                    .get(name)
                    .ok_or_else(|| ClientError::UndefinedVariable(name.clone()))?;
                raw.parse::<i64>()
                    .map_err(|_| ClientError::UndefinedVariable(name.clone()))
            }
            PgBenchExpr::BinOp { op, left, right } => {
                let l = left.eval(vars)?;
                let r = right.eval(vars)?;
                match op {
                    BinOp::Add => Ok(l.wrapping_add(r)),
                    BinOp::Sub => Ok(l.wrapping_sub(r)),
                    BinOp::Mul => Ok(l.wrapping_mul(r)),
                    BinOp::Div => {
                        if r == 0 {
                            Err(ClientError::DivisionByZero)
                        } else {
                            Ok(l.wrapping_div(r))
                        }
                    }
                    BinOp::Mod => {
                        if r == 0 {
                            Err(ClientError::DivisionByZero)
                        } else {
                            Ok(l.wrapping_rem(r))
                        }
                    }
                }
            }
        }
    }
}

/// Parses an expression from `input`, reporting errors against `file`/`line` with
/// a column into `source_line` (the full raw line the expression was taken from),
/// as spec §7 requires for parse diagnostics. `col_offset` is where `input` starts
/// within `source_line` (1-based), so carets point at the right column.
pub fn parse_expr(
    input: &str,
    file: &str,
    line: usize,
    source_line: &str,
    col_offset: usize,
) -> Result<PgBenchExpr, ScriptParseError> {
    let tokens = tokenize(input, file, line, source_line, col_offset)?;
    let mut p = ExprParser {
        tokens: &tokens,
        pos: 0,
        file,
        line,
        source_line,
    };
    let expr = p.parse_additive()?;
    if p.pos != p.tokens.len() {
        let tok = &p.tokens[p.pos];
        return Err(ScriptParseError::new(
            file,
            line,
            tok.col,
            source_line,
            format!("unexpected token \"{}\"", tok.text),
        ));
    }
    Ok(expr)
}

#[derive(Debug, Clone)]
struct Token {
    text: String,
    kind: TokKind,
    col: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokKind {
    Int,
    Ident,
    Op(char),
    LParen,
    RParen,
}

fn tokenize(
    input: &str,
    file: &str,
    line: usize,
    source_line: &str,
    col_offset: usize,
) -> Result<Vec<Token>, ScriptParseError> {
    let mut out = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let col = col_offset + i;
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            out.push(Token {
                text,
                kind: TokKind::Int,
                col,
            });
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            out.push(Token {
                text,
                kind: TokKind::Ident,
                col,
            });
        } else if "+-*/%".contains(c) {
            out.push(Token {
                text: c.to_string(),
                kind: TokKind::Op(c),
                col,
            });
            i += 1;
        } else if c == '(' {
            out.push(Token {
                text: "(".to_string(),
                kind: TokKind::LParen,
                col,
            });
            i += 1;
        } else if c == ')' {
            out.push(Token {
                text: ")".to_string(),
                kind: TokKind::RParen,
                col,
            });
            i += 1;
        } else {
            return Err(ScriptParseError::new(
                file,
                line,
                col,
                source_line,
                format!("unexpected character '{c}' in expression"),
            ));
        }
    }
    Ok(out)
}

struct ExprParser<'a> {
    tokens: &'a [Token],
    pos: usize,
    file: &'a str,
    line: usize,
    source_line: &'a str,
}

impl<'a> ExprParser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn err(&self, col: usize, msg: impl Into<String>) -> ScriptParseError {
        ScriptParseError::new(self.file, self.line, col, self.source_line, msg.into())
    }

    fn eof_col(&self) -> usize {
        self.tokens.last().map(|t| t.col + t.text.len()).unwrap_or(1)
    }

    // additive := multiplicative (('+' | '-') multiplicative)*
    fn parse_additive(&mut self) -> Result<PgBenchExpr, ScriptParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            match self.peek() {
                Some(Token { kind: TokKind::Op('+'), .. }) => {
                    self.pos += 1;
                    let rhs = self.parse_multiplicative()?;
                    lhs = PgBenchExpr::BinOp {
                        op: BinOp::Add,
                        left: Box::new(lhs),
                        right: Box::new(rhs),
                    };
                }
                Some(Token { kind: TokKind::Op('-'), .. }) => {
                    self.pos += 1;
                    let rhs = self.parse_multiplicative()?;
                    lhs = PgBenchExpr::BinOp {
                        op: BinOp::Sub,
                        left: Box::new(lhs),
                        right: Box::new(rhs),
                    };
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    // multiplicative := unary (('*' | '/' | '%') unary)*
    fn parse_multiplicative(&mut self) -> Result<PgBenchExpr, ScriptParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token { kind: TokKind::Op('*'), .. }) => Some(BinOp::Mul),
                Some(Token { kind: TokKind::Op('/'), .. }) => Some(BinOp::Div),
                Some(Token { kind: TokKind::Op('%'), .. }) => Some(BinOp::Mod),
                _ => None,
            };
            let Some(op) = op else { break };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = PgBenchExpr::BinOp {
                op,
                left: Box::new(lhs),
                right: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    // unary := '-' unary | primary
    fn parse_unary(&mut self) -> Result<PgBenchExpr, ScriptParseError> {
        if let Some(Token { kind: TokKind::Op('-'), .. }) = self.peek() {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(PgBenchExpr::BinOp {
                op: BinOp::Sub,
                left: Box::new(PgBenchExpr::Constant(0)),
                right: Box::new(inner),
            });
        }
        self.parse_primary()
    }

    // primary := INT | IDENT | '(' additive ')'
    fn parse_primary(&mut self) -> Result<PgBenchExpr, ScriptParseError> {
        let tok = self
            .peek()
            .cloned()
            .ok_or_else(|| self.err(self.eof_col(), "expected expression, found end of line"))?;
        match tok.kind {
            TokKind::Int => {
                self.pos += 1;
                let v: i64 = tok
                    .text
                    .parse()
                    .map_err(|_| self.err(tok.col, format!("integer literal too large: {}", tok.text)))?;
                Ok(PgBenchExpr::Constant(v))
            }
            TokKind::Ident => {
                self.pos += 1;
                Ok(PgBenchExpr::Variable(tok.text))
            }
            TokKind::LParen => {
                self.pos += 1;
                let inner = self.parse_additive()?;
                match self.peek() {
                    Some(Token { kind: TokKind::RParen, .. }) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(self.err(self.eof_col(), "expected ')'")),
                }
            }
            _ => Err(self.err(tok.col, format!("unexpected token \"{}\"", tok.text))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_str(expr: &str, vars: &Variables) -> Result<i64, String> {
        let parsed = parse_expr(expr, "<test>", 1, expr, 1).map_err(|e| e.to_string())?;
        parsed.eval(vars).map_err(|e| e.to_string())
    }

    #[test]
    fn simple_expression() {
        // spec §8 scenario 1: \set x 3 + 4 * 2 => x = 11
        let vars = Variables::new();
        assert_eq!(eval_str("3 + 4 * 2", &vars).unwrap(), 11);
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let vars = Variables::new();
        assert!(eval_str("10 / 0", &vars).is_err());
    }

    #[test]
    fn left_associative_subtraction() {
        let vars = Variables::new();
        assert_eq!(eval_str("10 - 3 - 2", &vars).unwrap(), 5);
    }

    #[test]
    fn parentheses_override_precedence() {
        let vars = Variables::new();
        assert_eq!(eval_str("(3 + 4) * 2", &vars).unwrap(), 14);
    }

    #[test]
    fn variable_reference() {
        let mut vars = Variables::new();
        vars.set("aid", "42");
        assert_eq!(eval_str("aid + 1", &vars).unwrap(), 43);
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let vars = Variables::new();
        assert!(eval_str("missing + 1", &vars).is_err());
    }

    #[test]
    fn modulo() {
        let vars = Variables::new();
        assert_eq!(eval_str("10 % 3", &vars).unwrap(), 1);
    }

    #[test]
    fn overflow_wraps() {
        let vars = Variables::new();
        let expr = format!("{} + 1", i64::MAX);
        assert_eq!(eval_str(&expr, &vars).unwrap(), i64::MIN);
    }

    proptest::proptest! {
        #[test]
        fn reparsing_raw_text_is_idempotent(a in -1000i64..1000, b in -1000i64..1000) {
            let text = format!("{a} + {b} * 2");
            let e1 = parse_expr(&text, "f", 1, &text, 1).unwrap();
            let e2 = parse_expr(&text, "f", 1, &text, 1).unwrap();
            prop_assert_eq!(e1, e2);
        }
    }
}
