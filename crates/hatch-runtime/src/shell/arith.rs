//! `$((...))` evaluation over signed 64-bit integers with wrapping overflow.
//!
//! Supports the C operators shells accept: unary `+ - ! ~`, `* / %`, `+ -`,
//! shifts, comparisons, bitwise and logical operators, `?:` and the plain
//! and compound assignments. Variables are read by name; unset or empty
//! ones count as zero.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Num(i64),
    Name(String),
    Op(&'static str),
    LParen,
    RParen,
}

/// Longest operators first so `<<=` is not read as `<` `<=`.
const OPERATORS: &[&str] = &[
    "<<=", ">>=", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "+=", "-=", "*=", "/=", "%=",
    "&=", "^=", "|=", "+", "-", "*", "/", "%", "<", ">", "&", "^", "|", "!", "~", "?", ":", "=",
];

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_alphanumeric() {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Num(parse_number(&text)?));
        } else if c == '_' || c.is_ascii_alphabetic() {
            let start = i;
            while i < chars.len() && (chars[i] == '_' || chars[i].is_ascii_alphanumeric()) {
                i += 1;
            }
            tokens.push(Token::Name(chars[start..i].iter().collect()));
        } else if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
        } else if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
        } else {
            let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
            let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) else {
                return Err(format!("syntax error: unexpected '{c}'"));
            };
            tokens.push(Token::Op(*op));
            i += op.len();
        }
    }
    Ok(tokens)
}

/// Decimal, `0x` hexadecimal or leading-zero octal.
fn parse_number(text: &str) -> Result<i64, String> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        i64::from_str_radix(&text[1..], 8)
    } else {
        text.parse()
    };
    parsed.map_err(|_| format!("invalid number '{text}'"))
}

#[derive(Debug)]
enum Expr {
    Num(i64),
    Var(String),
    Unary(&'static str, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
    /// `name op= value`; `op` is `=` for a plain assignment.
    Assign(String, &'static str, Box<Expr>),
}

fn binding_power(op: &str) -> Option<u8> {
    Some(match op {
        "||" => 1,
        "&&" => 2,
        "|" => 3,
        "^" => 4,
        "&" => 5,
        "==" | "!=" => 6,
        "<" | "<=" | ">" | ">=" => 7,
        "<<" | ">>" => 8,
        "+" | "-" => 9,
        "*" | "/" | "%" => 10,
        _ => return None,
    })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect_op(&mut self, op: &str) -> Result<(), String> {
        match self.next() {
            Some(Token::Op(o)) if o == op => Ok(()),
            _ => Err(format!("expected '{op}'")),
        }
    }

    fn assignment(&mut self) -> Result<Expr, String> {
        if let (Some(Token::Name(name)), Some(Token::Op(op))) =
            (self.tokens.get(self.pos), self.tokens.get(self.pos + 1))
        {
            if op.ends_with('=') && !matches!(*op, "==" | "!=" | "<=" | ">=") {
                let (name, op) = (name.clone(), *op);
                self.pos += 2;
                let value = self.assignment()?;
                return Ok(Expr::Assign(name, op, Box::new(value)));
            }
        }
        self.conditional()
    }

    fn conditional(&mut self) -> Result<Expr, String> {
        let condition = self.binary(1)?;
        if self.peek() != Some(&Token::Op("?")) {
            return Ok(condition);
        }
        self.pos += 1;
        let then = self.assignment()?;
        self.expect_op(":")?;
        let otherwise = self.conditional()?;
        Ok(Expr::Cond(
            Box::new(condition),
            Box::new(then),
            Box::new(otherwise),
        ))
    }

    fn binary(&mut self, min: u8) -> Result<Expr, String> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            let Some(power) = binding_power(op).filter(|p| *p >= min) else {
                break;
            };
            self.pos += 1;
            let rhs = self.binary(power + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Op(op @ ("+" | "-" | "!" | "~"))) => {
                Ok(Expr::Unary(op, Box::new(self.unary()?)))
            }
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Name(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                let inner = self.assignment()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_owned()),
                }
            }
            Some(Token::Op(op)) => Err(format!("syntax error: unexpected '{op}'")),
            Some(Token::RParen) => Err("syntax error: unexpected ')'".to_owned()),
            None => Err("syntax error: operand expected".to_owned()),
        }
    }
}

fn apply(op: &str, a: i64, b: i64) -> Result<i64, String> {
    Ok(match op {
        "+" => a.wrapping_add(b),
        "-" => a.wrapping_sub(b),
        "*" => a.wrapping_mul(b),
        "/" | "%" if b == 0 => return Err("division by zero".to_owned()),
        "/" => a.wrapping_div(b),
        "%" => a.wrapping_rem(b),
        "<<" => a.wrapping_shl(shift_count(b)),
        ">>" => a.wrapping_shr(shift_count(b)),
        "<" => i64::from(a < b),
        "<=" => i64::from(a <= b),
        ">" => i64::from(a > b),
        ">=" => i64::from(a >= b),
        "==" => i64::from(a == b),
        "!=" => i64::from(a != b),
        "&" => a & b,
        "^" => a ^ b,
        "|" => a | b,
        other => return Err(format!("unsupported operator '{other}'")),
    })
}

/// Shift counts wrap at the word size.
fn shift_count(b: i64) -> u32 {
    u32::try_from(b & 63).unwrap_or(0)
}

struct Eval<'a> {
    vars: &'a mut BTreeMap<String, String>,
}

impl Eval<'_> {
    fn var(&self, name: &str) -> Result<i64, String> {
        match self.vars.get(name).map(|v| v.trim()) {
            None | Some("") => Ok(0),
            Some(value) => {
                let (negative, digits) = match value.strip_prefix('-') {
                    Some(rest) => (true, rest),
                    None => (false, value.strip_prefix('+').unwrap_or(value)),
                };
                let n = parse_number(digits)
                    .map_err(|_| format!("{name}: value '{value}' is not a number"))?;
                Ok(if negative { n.wrapping_neg() } else { n })
            }
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<i64, String> {
        match expr {
            Expr::Num(n) => Ok(*n),
            Expr::Var(name) => self.var(name),
            Expr::Unary(op, inner) => {
                let v = self.eval(inner)?;
                Ok(match *op {
                    "-" => v.wrapping_neg(),
                    "!" => i64::from(v == 0),
                    "~" => !v,
                    _ => v,
                })
            }
            Expr::Binary("&&", a, b) => {
                Ok(i64::from(self.eval(a)? != 0 && self.eval(b)? != 0))
            }
            Expr::Binary("||", a, b) => {
                Ok(i64::from(self.eval(a)? != 0 || self.eval(b)? != 0))
            }
            Expr::Binary(op, a, b) => {
                let a = self.eval(a)?;
                let b = self.eval(b)?;
                apply(op, a, b)
            }
            Expr::Cond(condition, then, otherwise) => {
                if self.eval(condition)? == 0 {
                    self.eval(otherwise)
                } else {
                    self.eval(then)
                }
            }
            Expr::Assign(name, op, value) => {
                let value = self.eval(value)?;
                let result = match *op {
                    "=" => value,
                    compound => apply(&compound[..compound.len() - 1], self.var(name)?, value)?,
                };
                self.vars.insert(name.clone(), result.to_string());
                Ok(result)
            }
        }
    }
}

/// Evaluate an already expanded expression. Assignments update `vars`.
pub(super) fn evaluate(src: &str, vars: &mut BTreeMap<String, String>) -> Result<i64, String> {
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
    };
    if parser.tokens.is_empty() {
        return Ok(0);
    }
    let expr = parser.assignment()?;
    if let Some(token) = parser.peek() {
        return Err(format!("syntax error: unexpected {token:?}"));
    }
    Eval { vars }.eval(&expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str) -> Result<i64, String> {
        evaluate(src, &mut BTreeMap::new())
    }

    #[test]
    fn precedence_and_grouping() {
        assert_eq!(eval("1 + 2 * 3"), Ok(7));
        assert_eq!(eval("(1 + 2) * 3"), Ok(9));
        assert_eq!(eval("10 - 4 - 3"), Ok(3));
        assert_eq!(eval("-3 + +5"), Ok(2));
        assert_eq!(eval("7 / 2 + 7 % 2"), Ok(4));
        assert_eq!(eval("1 << 4 | 1"), Ok(17));
        assert_eq!(eval("!0 + ~0"), Ok(0));
        assert_eq!(eval(""), Ok(0));
    }

    #[test]
    fn comparisons_and_logic() {
        assert_eq!(eval("3 < 5 && 5 <= 5"), Ok(1));
        assert_eq!(eval("2 == 3 || 4 != 4"), Ok(0));
        assert_eq!(eval("1 ? 10 : 20"), Ok(10));
        assert_eq!(eval("0 ? 10 : 1 ? 30 : 40"), Ok(30));
    }

    #[test]
    fn number_bases() {
        assert_eq!(eval("0x1F"), Ok(31));
        assert_eq!(eval("010"), Ok(8));
        assert!(eval("09").is_err());
    }

    #[test]
    fn variables_and_assignment() {
        let mut vars = BTreeMap::from([
            ("n".to_owned(), "4".to_owned()),
            ("neg".to_owned(), "-2".to_owned()),
            ("empty".to_owned(), String::new()),
        ]);
        assert_eq!(evaluate("n * neg + empty + unset", &mut vars), Ok(-8));
        assert_eq!(evaluate("n += 3", &mut vars), Ok(7));
        assert_eq!(evaluate("m = n = 1", &mut vars), Ok(1));
        assert_eq!(vars["n"], "1");
        assert_eq!(vars["m"], "1");
        vars.insert("word".to_owned(), "abc".to_owned());
        assert!(evaluate("word + 1", &mut vars).is_err());
    }

    #[test]
    fn short_circuit_skips_assignments() {
        let mut vars = BTreeMap::new();
        assert_eq!(evaluate("0 && (x = 5)", &mut vars), Ok(0));
        assert_eq!(evaluate("1 ? 2 : (y = 3)", &mut vars), Ok(2));
        assert!(vars.is_empty());
    }

    #[test]
    fn errors() {
        assert_eq!(eval("1 / 0"), Err("division by zero".to_owned()));
        assert!(eval("5 %").is_err());
        assert!(eval("(1").is_err());
        assert!(eval("1 2").is_err());
        assert!(eval("1 @ 2").is_err());
        assert_eq!(eval("9223372036854775807 + 1"), Ok(i64::MIN));
    }
}
