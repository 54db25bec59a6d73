//! Exposure time models
//!
//! Each filter has a function `f(h)` giving the ideal exposure time in seconds
//! at solar altitude `h` (degrees), e.g. `exp(-0.9*(h+3.9))`. The expression is
//! compiled once when the flat fielder is built; evaluating it afterwards
//! cannot fail.
//!
//! Supported syntax:
//! - numbers (`1`, `0.5`, `2e-3`), the variable `h`, constants `pi` and `e`
//! - `+ - * /`, power with `^` or `**` (right associative), unary minus
//! - functions `exp`, `ln`, `log` (natural), `log10`, `sqrt`, `abs`,
//!   `sin`, `cos`, `tan` (radians), `pow(a, b)`, `min(a, b)`, `max(a, b)`

use crate::error::{Result, SkyFlatsError};
use std::fmt;
use thiserror::Error;

/// Expression could not be compiled
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message} at position {position}")]
pub struct ParseError {
    pub position: usize,
    pub message: String,
}

/// Compiled exposure time function of solar altitude `h`
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureModel {
    source: String,
    expr: Expr,
}

impl ExposureModel {
    pub fn parse(source: &str) -> std::result::Result<Self, ParseError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            end: source.len(),
        };
        let expr = parser.expression()?;
        if let Some(tok) = parser.peek() {
            return Err(ParseError {
                position: tok.position,
                message: format!("unexpected {}", tok.kind),
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Compile the function configured for `filter`
    pub fn compile(filter: &str, source: &str) -> Result<Self> {
        Self::parse(source).map_err(|e| SkyFlatsError::InvalidExpression {
            filter: filter.to_string(),
            message: e.to_string(),
        })
    }

    /// Exposure time in seconds at solar altitude `h` in degrees
    pub fn evaluate(&self, h: f64) -> f64 {
        self.expr.eval(h)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for ExposureModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// =============================================================================
// SYNTAX TREE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Function {
    Exp,
    Ln,
    Log10,
    Sqrt,
    Abs,
    Sin,
    Cos,
    Tan,
    Pow,
    Min,
    Max,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        let func = match name {
            "exp" => Function::Exp,
            "ln" | "log" => Function::Ln,
            "log10" => Function::Log10,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "pow" => Function::Pow,
            "min" => Function::Min,
            "max" => Function::Max,
            _ => return None,
        };
        Some(func)
    }

    fn arity(&self) -> usize {
        match self {
            Function::Pow | Function::Min | Function::Max => 2,
            _ => 1,
        }
    }

    fn apply(&self, args: &[f64]) -> f64 {
        match self {
            Function::Exp => args[0].exp(),
            Function::Ln => args[0].ln(),
            Function::Log10 => args[0].log10(),
            Function::Sqrt => args[0].sqrt(),
            Function::Abs => args[0].abs(),
            Function::Sin => args[0].sin(),
            Function::Cos => args[0].cos(),
            Function::Tan => args[0].tan(),
            Function::Pow => args[0].powf(args[1]),
            Function::Min => args[0].min(args[1]),
            Function::Max => args[0].max(args[1]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Altitude,
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

impl Expr {
    fn eval(&self, h: f64) -> f64 {
        match self {
            Expr::Number(v) => *v,
            Expr::Altitude => h,
            Expr::Neg(inner) => -inner.eval(h),
            Expr::Binary(op, lhs, rhs) => {
                let (a, b) = (lhs.eval(h), rhs.eval(h));
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Pow => a.powf(b),
                }
            }
            Expr::Call(func, args) => {
                let values: Vec<f64> = args.iter().map(|a| a.eval(h)).collect();
                func.apply(&values)
            }
        }
    }
}

// =============================================================================
// TOKENIZER
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Number(v) => write!(f, "number {}", v),
            TokenKind::Ident(name) => write!(f, "identifier '{}'", name),
            TokenKind::Plus => f.write_str("'+'"),
            TokenKind::Minus => f.write_str("'-'"),
            TokenKind::Star => f.write_str("'*'"),
            TokenKind::Slash => f.write_str("'/'"),
            TokenKind::Caret => f.write_str("'^'"),
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
            TokenKind::Comma => f.write_str("','"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn tokenize(source: &str) -> std::result::Result<Vec<Token>, ParseError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        let kind = match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' if bytes.get(i + 1) == Some(&b'*') => {
                i += 1;
                TokenKind::Caret
            }
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'^' => TokenKind::Caret,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b',' => TokenKind::Comma,
            b'0'..=b'9' | b'.' => {
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                // exponent part, only if digits follow
                if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                    let mut j = i + 1;
                    if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                        j += 1;
                    }
                    if j < bytes.len() && bytes[j].is_ascii_digit() {
                        while j < bytes.len() && bytes[j].is_ascii_digit() {
                            j += 1;
                        }
                        i = j;
                    }
                }
                let text = &source[start..i];
                let value = text.parse::<f64>().map_err(|_| ParseError {
                    position: start,
                    message: format!("invalid number '{}'", text),
                })?;
                tokens.push(Token {
                    kind: TokenKind::Number(value),
                    position: start,
                });
                continue;
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(source[start..i].to_string()),
                    position: start,
                });
                continue;
            }
            _ => {
                let ch = source[start..].chars().next().unwrap_or('?');
                return Err(ParseError {
                    position: start,
                    message: format!("unexpected character '{}'", ch),
                });
            }
        };

        i += 1;
        tokens.push(Token { kind, position: start });
    }

    Ok(tokens)
}

// =============================================================================
// PARSER
// =============================================================================

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    end: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().map(|t| &t.kind) == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            position: self.peek().map(|t| t.position).unwrap_or(self.end),
            message: message.into(),
        }
    }

    fn expect(&mut self, kind: TokenKind) -> std::result::Result<(), ParseError> {
        if self.eat(&kind) {
            Ok(())
        } else {
            match self.peek() {
                Some(tok) => Err(self.error_here(format!("expected {}, found {}", kind, tok.kind))),
                None => Err(self.error_here(format!("expected {}, found end of input", kind))),
            }
        }
    }

    // expression := term (('+' | '-') term)*
    fn expression(&mut self) -> std::result::Result<Expr, ParseError> {
        let mut lhs = self.term()?;
        loop {
            let op = if self.eat(&TokenKind::Plus) {
                BinaryOp::Add
            } else if self.eat(&TokenKind::Minus) {
                BinaryOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> std::result::Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat(&TokenKind::Star) {
                BinaryOp::Mul
            } else if self.eat(&TokenKind::Slash) {
                BinaryOp::Div
            } else {
                return Ok(lhs);
            };
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    // unary := ('-' | '+') unary | power
    fn unary(&mut self) -> std::result::Result<Expr, ParseError> {
        if self.eat(&TokenKind::Minus) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat(&TokenKind::Plus) {
            return self.unary();
        }
        self.power()
    }

    // power := primary ('^' unary)?
    fn power(&mut self) -> std::result::Result<Expr, ParseError> {
        let base = self.primary()?;
        if self.eat(&TokenKind::Caret) {
            let exponent = self.unary()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> std::result::Result<Expr, ParseError> {
        let tok = match self.next() {
            Some(tok) => tok,
            None => return Err(self.error_here("unexpected end of input")),
        };

        match &tok.kind {
            TokenKind::Number(v) => Ok(Expr::Number(*v)),
            TokenKind::LParen => {
                let inner = self.expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::Ident(name) => {
                if self.eat(&TokenKind::LParen) {
                    return self.call(name, tok.position);
                }
                match name.as_str() {
                    "h" => Ok(Expr::Altitude),
                    "pi" | "PI" => Ok(Expr::Number(std::f64::consts::PI)),
                    "e" | "E" => Ok(Expr::Number(std::f64::consts::E)),
                    _ => Err(ParseError {
                        position: tok.position,
                        message: format!("unknown variable '{}' (only 'h' is defined)", name),
                    }),
                }
            }
            other => Err(ParseError {
                position: tok.position,
                message: format!("unexpected {}", other),
            }),
        }
    }

    fn call(&mut self, name: &str, position: usize) -> std::result::Result<Expr, ParseError> {
        let func = Function::lookup(name).ok_or_else(|| ParseError {
            position,
            message: format!("unknown function '{}'", name),
        })?;

        let mut args = Vec::new();
        if !self.eat(&TokenKind::RParen) {
            loop {
                args.push(self.expression()?);
                if self.eat(&TokenKind::Comma) {
                    continue;
                }
                self.expect(TokenKind::RParen)?;
                break;
            }
        }

        if args.len() != func.arity() {
            return Err(ParseError {
                position,
                message: format!(
                    "function '{}' takes {} argument(s), got {}",
                    name,
                    func.arity(),
                    args.len()
                ),
            });
        }

        Ok(Expr::Call(func, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str, h: f64) -> f64 {
        ExposureModel::parse(src).unwrap().evaluate(h)
    }

    #[test]
    fn test_typical_twilight_function() {
        let model = ExposureModel::parse("exp(-0.9*(h+3.9))").unwrap();
        assert!((model.evaluate(-3.9) - 1.0).abs() < 1e-12);
        assert!((model.evaluate(-5.0) - (0.99f64).exp()).abs() < 1e-12);
        assert_eq!(model.source(), "exp(-0.9*(h+3.9))");
    }

    #[test]
    fn test_operator_precedence() {
        assert_eq!(eval("1 + 2 * 3", 0.0), 7.0);
        assert_eq!(eval("(1 + 2) * 3", 0.0), 9.0);
        assert_eq!(eval("10 - 4 - 3", 0.0), 3.0);
        assert_eq!(eval("8 / 4 / 2", 0.0), 1.0);
    }

    #[test]
    fn test_power_and_unary_minus() {
        assert_eq!(eval("2^3^2", 0.0), 512.0);
        assert_eq!(eval("2**3", 0.0), 8.0);
        assert_eq!(eval("-2^2", 0.0), -4.0);
        assert_eq!(eval("2^-1", 0.0), 0.5);
        assert_eq!(eval("-h", 3.0), -3.0);
    }

    #[test]
    fn test_functions_and_constants() {
        assert_eq!(eval("max(h, 0)", -5.0), 0.0);
        assert_eq!(eval("min(h, 0)", -5.0), -5.0);
        assert_eq!(eval("pow(10, 2)", 0.0), 100.0);
        assert_eq!(eval("log10(1000)", 0.0), 3.0);
        assert!((eval("ln(e)", 0.0) - 1.0).abs() < 1e-12);
        assert!((eval("cos(pi)", 0.0) + 1.0).abs() < 1e-12);
        assert_eq!(eval("abs(h)", -2.5), 2.5);
        assert_eq!(eval("sqrt(16)", 0.0), 4.0);
    }

    #[test]
    fn test_scientific_notation() {
        assert_eq!(eval("2e-3 * 1000", 0.0), 2.0);
        assert_eq!(eval("1.5E2", 0.0), 150.0);
    }

    #[test]
    fn test_rejects_unknown_variable() {
        let err = ExposureModel::parse("exp(-0.9*(x+3.9))").unwrap_err();
        assert!(err.message.contains("unknown variable 'x'"));
        assert_eq!(err.position, 10);
    }

    #[test]
    fn test_rejects_syntax_errors() {
        assert!(ExposureModel::parse("").is_err());
        assert!(ExposureModel::parse("exp(-0.9*(h+3.9)").is_err());
        assert!(ExposureModel::parse("1 +").is_err());
        assert!(ExposureModel::parse("2 3").is_err());
        assert!(ExposureModel::parse("h $ 2").is_err());
        assert!(ExposureModel::parse("foo(h)").is_err());
        assert!(ExposureModel::parse("pow(h)").is_err());
    }

    #[test]
    fn test_compile_reports_filter() {
        let err = ExposureModel::compile("R", "exp(").unwrap_err();
        match err {
            SkyFlatsError::InvalidExpression { filter, .. } => assert_eq!(filter, "R"),
            other => panic!("unexpected error: {}", other),
        }
    }
}
