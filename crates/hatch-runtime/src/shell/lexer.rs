use super::parser::{parse, Program};
use super::ShellError;
use std::fmt;

/// A parameter reference such as `$HOME`, `$1` or `$@`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Named(String),
    Positional(usize),
    Count,
    All,
    Star,
    Status,
    Pid,
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(n) => f.write_str(n),
            Self::Positional(i) => write!(f, "{i}"),
            Self::Count => f.write_str("#"),
            Self::All => f.write_str("@"),
            Self::Star => f.write_str("*"),
            Self::Status => f.write_str("?"),
            Self::Pid => f.write_str("$"),
        }
    }
}

/// `${NAME:-word}` (`if_empty`) or `${NAME-word}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fallback {
    pub if_empty: bool,
    pub word: Word,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub param: Param,
    pub quoted: bool,
    pub fallback: Option<Fallback>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    /// Text taken as-is. `quoted` is set for text from quotes or escapes.
    Literal { text: String, quoted: bool },
    Param(Expansion),
    /// `${#NAME}`.
    Length(Param),
    /// `$(...)` or `` `...` ``, parsed when the enclosing word is read.
    Command { program: Program, quoted: bool },
    /// `$((...))`. The expression is expanded before it is evaluated.
    Arith { expr: Word, quoted: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Word(pub Vec<Part>);

impl Word {
    pub fn literal(text: &str) -> Self {
        Self(vec![Part::Literal {
            text: text.to_owned(),
            quoted: false,
        }])
    }

    /// The word's text when it contains nothing quoted or expanded. Reserved
    /// words are only recognized in this form.
    pub fn plain(&self) -> Option<&str> {
        match self.0.as_slice() {
            [Part::Literal {
                text,
                quoted: false,
            }] => Some(text),
            _ => None,
        }
    }

    /// Split `NAME=value` into the name and the value word.
    pub fn assignment(&self) -> Option<(String, Word)> {
        let (first, rest) = self.0.split_first()?;
        let Part::Literal {
            text,
            quoted: false,
        } = first
        else {
            return None;
        };
        let (name, value) = text.split_once('=')?;
        if !is_name(name) {
            return None;
        }
        let mut parts = Vec::with_capacity(self.0.len());
        if !value.is_empty() {
            parts.push(Part::Literal {
                text: value.to_owned(),
                quoted: false,
            });
        }
        parts.extend(rest.iter().cloned());
        Some((name.to_owned(), Word(parts)))
    }
}

pub fn is_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    DSemi,
    AndIf,
    OrIf,
    Pipe,
    Semi,
    LParen,
    RParen,
    Great,
    DGreat,
    Less,
    GreatAnd,
    LessAnd,
}

impl Op {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::DSemi => ";;",
            Self::AndIf => "&&",
            Self::OrIf => "||",
            Self::Pipe => "|",
            Self::Semi => ";",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::Great => ">",
            Self::DGreat => ">>",
            Self::Less => "<",
            Self::GreatAnd => ">&",
            Self::LessAnd => "<&",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Word(Word),
    IoNumber(u32),
    Op(Op),
    Newline,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Word(w) => match w.plain() {
                Some(text) => write!(f, "'{text}'"),
                None => f.write_str("word"),
            },
            Self::IoNumber(n) => write!(f, "'{n}'"),
            Self::Op(op) => write!(f, "'{}'", op.symbol()),
            Self::Newline => f.write_str("newline"),
            Self::Eof => f.write_str("end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, ShellError> {
    let mut lexer = Lexer {
        chars: src.chars().collect(),
        pos: 0,
        line: 1,
    };
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

fn is_word_break(c: char) -> bool {
    matches!(
        c,
        ' ' | '\t' | '\n' | ';' | '&' | '|' | '<' | '>' | '(' | ')'
    )
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> ShellError {
        ShellError::Syntax {
            line: self.line,
            message: message.into(),
        }
    }

    fn op(&mut self, op: Op, len: usize) -> TokenKind {
        self.pos += len;
        TokenKind::Op(op)
    }

    fn next_token(&mut self) -> Result<Token, ShellError> {
        loop {
            match self.peek() {
                Some(' ' | '\t' | '\r') => self.pos += 1,
                Some('\\') if self.peek_at(1) == Some('\n') => {
                    self.bump();
                    self.bump();
                }
                Some('#') => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }

        let line = self.line;
        let kind = match (self.peek(), self.peek_at(1)) {
            (None, _) => TokenKind::Eof,
            (Some('\n'), _) => {
                self.bump();
                TokenKind::Newline
            }
            (Some(';'), Some(';')) => self.op(Op::DSemi, 2),
            (Some(';'), _) => self.op(Op::Semi, 1),
            (Some('&'), Some('&')) => self.op(Op::AndIf, 2),
            (Some('&'), _) => return Err(self.error("background jobs ('&') are not supported")),
            (Some('|'), Some('|')) => self.op(Op::OrIf, 2),
            (Some('|'), _) => self.op(Op::Pipe, 1),
            (Some('('), _) => self.op(Op::LParen, 1),
            (Some(')'), _) => self.op(Op::RParen, 1),
            (Some('>'), Some('>')) => self.op(Op::DGreat, 2),
            (Some('>'), Some('&')) => self.op(Op::GreatAnd, 2),
            (Some('>'), Some('|')) => self.op(Op::Great, 2),
            (Some('>'), _) => self.op(Op::Great, 1),
            (Some('<'), Some('<')) => return Err(self.error("here-documents are not supported")),
            (Some('<'), Some('&')) => self.op(Op::LessAnd, 2),
            (Some('<'), _) => self.op(Op::Less, 1),
            (Some(c), _) if c.is_ascii_digit() => match self.io_number() {
                Some(n) => TokenKind::IoNumber(n),
                None => TokenKind::Word(self.word()?),
            },
            (Some(_), _) => TokenKind::Word(self.word()?),
        };
        Ok(Token { kind, line })
    }

    /// Digits directly followed by a redirection operator.
    fn io_number(&mut self) -> Option<u32> {
        let mut end = self.pos;
        while self.chars.get(end).is_some_and(char::is_ascii_digit) {
            end += 1;
        }
        if !matches!(self.chars.get(end), Some('<' | '>')) {
            return None;
        }
        let digits: String = self.chars[self.pos..end].iter().collect();
        let n = digits.parse().ok()?;
        self.pos = end;
        Some(n)
    }

    fn word(&mut self) -> Result<Word, ShellError> {
        let mut parts = Vec::new();
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if is_word_break(c) {
                break;
            }
            match c {
                '\'' => {
                    flush(&mut text, &mut parts);
                    self.bump();
                    let mut quoted = String::new();
                    loop {
                        match self.bump() {
                            Some('\'') => break,
                            Some(c) => quoted.push(c),
                            None => return Err(self.error("unterminated single quote")),
                        }
                    }
                    parts.push(Part::Literal {
                        text: quoted,
                        quoted: true,
                    });
                }
                '"' => {
                    flush(&mut text, &mut parts);
                    self.bump();
                    self.double_quoted(&mut parts)?;
                }
                '\\' => {
                    self.bump();
                    match self.bump() {
                        Some('\n') => {}
                        Some(escaped) => {
                            flush(&mut text, &mut parts);
                            parts.push(Part::Literal {
                                text: escaped.to_string(),
                                quoted: true,
                            });
                        }
                        None => text.push('\\'),
                    }
                }
                '$' => {
                    flush(&mut text, &mut parts);
                    self.bump();
                    parts.push(self.dollar(false)?);
                }
                '`' => {
                    flush(&mut text, &mut parts);
                    self.bump();
                    parts.push(self.backquoted(false)?);
                }
                _ => {
                    text.push(c);
                    self.bump();
                }
            }
        }
        flush(&mut text, &mut parts);
        Ok(Word(parts))
    }

    fn double_quoted(&mut self, parts: &mut Vec<Part>) -> Result<(), ShellError> {
        let start = parts.len();
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated double quote")),
                Some('"') => break,
                Some('\\') => match self.peek() {
                    Some(c @ ('$' | '`' | '"' | '\\')) => {
                        self.bump();
                        text.push(c);
                    }
                    Some('\n') => {
                        self.bump();
                    }
                    _ => text.push('\\'),
                },
                Some('$') => {
                    flush_quoted(&mut text, parts);
                    parts.push(self.dollar(true)?);
                }
                Some('`') => {
                    flush_quoted(&mut text, parts);
                    parts.push(self.backquoted(true)?);
                }
                Some(c) => text.push(c),
            }
        }
        flush_quoted(&mut text, parts);
        if parts.len() == start {
            parts.push(Part::Literal {
                text: String::new(),
                quoted: true,
            });
        }
        Ok(())
    }

    /// Everything after a `$`.
    fn dollar(&mut self, quoted: bool) -> Result<Part, ShellError> {
        let expansion = |param| {
            Part::Param(Expansion {
                param,
                quoted,
                fallback: None,
            })
        };
        match self.peek() {
            Some('{') => {
                self.bump();
                self.braced(quoted)
            }
            Some('(') if self.peek_at(1) == Some('(') => {
                self.pos += 2;
                self.arithmetic(quoted)
            }
            Some('(') => {
                self.bump();
                self.substitution(quoted)
            }
            Some(c) if c.is_ascii_digit() => {
                self.bump();
                Ok(expansion(Param::Positional(c as usize - '0' as usize)))
            }
            Some(c @ ('#' | '@' | '*' | '?' | '$')) => {
                self.bump();
                Ok(expansion(special(c)))
            }
            Some(c) if c == '_' || c.is_ascii_alphabetic() => {
                let mut name = String::new();
                while let Some(c) = self.peek().filter(|c| *c == '_' || c.is_ascii_alphanumeric()) {
                    name.push(c);
                    self.bump();
                }
                Ok(expansion(Param::Named(name)))
            }
            _ => Ok(Part::Literal {
                text: "$".to_owned(),
                quoted,
            }),
        }
    }

    fn braced(&mut self, quoted: bool) -> Result<Part, ShellError> {
        let length = self.peek() == Some('#') && !matches!(self.peek_at(1), Some('}') | None);
        if length {
            self.bump();
        }
        let param = match self.peek() {
            Some(c) if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(d) = self.peek().filter(char::is_ascii_digit) {
                    digits.push(d);
                    self.bump();
                }
                Param::Positional(digits.parse().map_err(|_| self.error("bad substitution"))?)
            }
            Some(c @ ('#' | '@' | '*' | '?' | '$')) => {
                self.bump();
                special(c)
            }
            Some(c) if c == '_' || c.is_ascii_alphabetic() => {
                let mut name = String::new();
                while let Some(c) = self.peek().filter(|c| *c == '_' || c.is_ascii_alphanumeric()) {
                    name.push(c);
                    self.bump();
                }
                Param::Named(name)
            }
            _ => return Err(self.error("bad substitution")),
        };

        if length {
            if self.bump() != Some('}') {
                return Err(self.error("bad substitution"));
            }
            return Ok(Part::Length(param));
        }

        let if_empty = match (self.peek(), self.peek_at(1)) {
            (Some('}'), _) => {
                self.bump();
                return Ok(Part::Param(Expansion {
                    param,
                    quoted,
                    fallback: None,
                }));
            }
            (Some(':'), Some('-')) => {
                self.pos += 2;
                true
            }
            (Some('-'), _) => {
                self.pos += 1;
                false
            }
            _ => return Err(self.error(format!("unsupported parameter expansion for '{param}'"))),
        };

        let raw = self.until_closing_brace()?;
        let mut inner = Lexer {
            chars: raw.chars().collect(),
            pos: 0,
            line: self.line,
        };
        let mut word = inner.fallback_word()?;
        if quoted {
            mark_quoted(&mut word);
        }
        Ok(Part::Param(Expansion {
            param,
            quoted,
            fallback: Some(Fallback { if_empty, word }),
        }))
    }

    /// The body of `$(...)`. Tokens are read until the `)` that closes the
    /// substitution; a `)` ending a `case` pattern does not count.
    fn substitution(&mut self, quoted: bool) -> Result<Part, ShellError> {
        let start = self.pos;
        let line = self.line;
        let mut depth = 0_usize;
        let mut cases = 0_usize;
        loop {
            let token = self.next_token()?;
            match token.kind {
                TokenKind::Eof => return Err(self.error("missing ')'")),
                TokenKind::Op(Op::LParen) => depth += 1,
                TokenKind::Op(Op::RParen) if depth > 0 => depth -= 1,
                TokenKind::Op(Op::RParen) if cases > 0 => {}
                TokenKind::Op(Op::RParen) => break,
                TokenKind::Word(w) => match w.plain() {
                    Some("case") => cases += 1,
                    Some("esac") => cases = cases.saturating_sub(1),
                    _ => {}
                },
                _ => {}
            }
        }
        let raw: String = self.chars[start..self.pos - 1].iter().collect();
        Ok(Part::Command {
            program: parse_nested(&raw, line)?,
            quoted,
        })
    }

    /// The body of `` `...` ``. Inside, a backslash only escapes `` ` ``, `$`
    /// and another backslash.
    fn backquoted(&mut self, quoted: bool) -> Result<Part, ShellError> {
        let line = self.line;
        let mut raw = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated '`'")),
                Some('`') => break,
                Some('\\') => match self.peek() {
                    Some(c @ ('`' | '$' | '\\')) => {
                        self.bump();
                        raw.push(c);
                    }
                    _ => raw.push('\\'),
                },
                Some(c) => raw.push(c),
            }
        }
        Ok(Part::Command {
            program: parse_nested(&raw, line)?,
            quoted,
        })
    }

    /// The body of `$((...))`, read up to the `))` that balances it.
    fn arithmetic(&mut self, quoted: bool) -> Result<Part, ShellError> {
        let line = self.line;
        let mut raw = String::new();
        let mut depth = 0_usize;
        loop {
            match self.bump() {
                None => return Err(self.error("missing '))'")),
                Some('(') => depth += 1,
                Some(')') if depth > 0 => depth -= 1,
                Some(')') if self.peek() == Some(')') => {
                    self.bump();
                    break;
                }
                Some(')') => return Err(self.error("missing '))'")),
                Some(_) => {}
            }
            if let Some(c) = self.chars.get(self.pos - 1) {
                raw.push(*c);
            }
        }
        let mut inner = Lexer {
            chars: raw.chars().collect(),
            pos: 0,
            line,
        };
        let mut expr = inner.fallback_word()?;
        mark_quoted(&mut expr);
        Ok(Part::Arith { expr, quoted })
    }

    fn until_closing_brace(&mut self) -> Result<String, ShellError> {
        let mut raw = String::new();
        let mut depth = 0_usize;
        let mut in_single = false;
        let mut in_double = false;
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("missing '}'"));
            };
            match c {
                '\'' if !in_double => in_single = !in_single,
                '"' if !in_single => in_double = !in_double,
                '\\' if !in_single => {
                    raw.push(c);
                    if let Some(next) = self.bump() {
                        raw.push(next);
                    }
                    continue;
                }
                '{' if !in_single && raw.ends_with('$') => depth += 1,
                '}' if !in_single && !in_double => {
                    if depth == 0 {
                        return Ok(raw);
                    }
                    depth -= 1;
                }
                _ => {}
            }
            raw.push(c);
        }
    }

    /// A fallback word may contain blanks and operators literally.
    fn fallback_word(&mut self) -> Result<Word, ShellError> {
        let mut parts = Vec::new();
        while self.peek().is_some() {
            let mut word = self.word()?;
            parts.append(&mut word.0);
            if let Some(c) = self.peek() {
                if is_word_break(c) {
                    self.bump();
                    parts.push(Part::Literal {
                        text: c.to_string(),
                        quoted: false,
                    });
                }
            }
        }
        Ok(Word(parts))
    }
}

/// Parse a substitution body, reporting errors against the outer line.
fn parse_nested(src: &str, line: usize) -> Result<Program, ShellError> {
    parse(src).map_err(|e| match e {
        ShellError::Syntax { line: inner, message } => ShellError::Syntax {
            line: line + inner - 1,
            message,
        },
        other => other,
    })
}

fn special(c: char) -> Param {
    match c {
        '#' => Param::Count,
        '@' => Param::All,
        '*' => Param::Star,
        '?' => Param::Status,
        _ => Param::Pid,
    }
}

fn flush(text: &mut String, parts: &mut Vec<Part>) {
    if !text.is_empty() {
        parts.push(Part::Literal {
            text: std::mem::take(text),
            quoted: false,
        });
    }
}

fn flush_quoted(text: &mut String, parts: &mut Vec<Part>) {
    if !text.is_empty() {
        parts.push(Part::Literal {
            text: std::mem::take(text),
            quoted: true,
        });
    }
}

fn mark_quoted(word: &mut Word) {
    for part in &mut word.0 {
        match part {
            Part::Literal { quoted, .. }
            | Part::Command { quoted, .. }
            | Part::Arith { quoted, .. } => *quoted = true,
            Part::Param(e) => e.quoted = true,
            Part::Length(_) => {}
        }
    }
}
