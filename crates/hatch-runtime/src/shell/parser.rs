use super::lexer::{is_name, tokenize, Op, Token, TokenKind, Word};
use super::ShellError;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub body: List,
}

pub type List = Vec<AndOr>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AndOr {
    pub first: Pipeline,
    pub rest: Vec<(Connector, Pipeline)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub negated: bool,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Simple(SimpleCommand),
    Compound(Compound, Vec<Redirect>),
    /// `name() compound-command`. The body is shared with the shell's
    /// function table once the definition runs.
    Function { name: String, body: Arc<Command> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimpleCommand {
    pub assignments: Vec<(String, Word)>,
    pub words: Vec<Word>,
    pub redirects: Vec<Redirect>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compound {
    If {
        branches: Vec<(List, List)>,
        otherwise: Option<List>,
    },
    Loop {
        until: bool,
        condition: List,
        body: List,
    },
    For {
        var: String,
        items: Option<Vec<Word>>,
        body: List,
    },
    Case {
        word: Word,
        arms: Vec<CaseArm>,
    },
    Group(List),
    Subshell(List),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseArm {
    pub patterns: Vec<Word>,
    pub body: List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    Write,
    Append,
    Read,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub fd: u32,
    pub kind: RedirectKind,
    pub target: Word,
}

const RESERVED: &[&str] = &[
    "then", "elif", "else", "fi", "do", "done", "}", "if", "while", "until", "for", "{", "!",
    "in", "case", "esac",
];

/// Words that end a list when they appear in command position.
const TERMINATORS: &[&str] = &["then", "elif", "else", "fi", "do", "done", "}", "esac"];

/// Parse a whole script.
pub fn parse(src: &str) -> Result<Program, ShellError> {
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
    };
    let body = parser.list()?;
    match parser.peek_kind() {
        TokenKind::Eof => Ok(Program { body }),
        other => Err(parser.error(format!("unexpected {other}"))),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The token stream always ends with Eof, which is never consumed.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_kind_at(&self, offset: usize) -> &TokenKind {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].kind
    }

    fn bump(&mut self) -> TokenKind {
        let kind = self.peek_kind().clone();
        if kind != TokenKind::Eof {
            self.pos += 1;
        }
        kind
    }

    fn error(&self, message: impl Into<String>) -> ShellError {
        ShellError::Syntax {
            line: self.peek().line,
            message: message.into(),
        }
    }

    fn peek_reserved(&self) -> Option<&str> {
        match self.peek_kind() {
            TokenKind::Word(w) => w.plain().filter(|t| RESERVED.contains(t)),
            _ => None,
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        self.peek_reserved() == Some(keyword)
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ShellError> {
        if self.at_keyword(keyword) {
            self.bump();
            Ok(())
        } else {
            Err(self.error(format!(
                "expected '{keyword}', found {}",
                self.peek_kind()
            )))
        }
    }

    fn skip_newlines(&mut self) {
        while *self.peek_kind() == TokenKind::Newline {
            self.bump();
        }
    }

    fn at_list_end(&self) -> bool {
        match self.peek_kind() {
            TokenKind::Eof | TokenKind::Op(Op::RParen | Op::DSemi) => true,
            TokenKind::Word(_) => self
                .peek_reserved()
                .is_some_and(|t| TERMINATORS.contains(&t)),
            _ => false,
        }
    }

    fn list(&mut self) -> Result<List, ShellError> {
        let mut items = Vec::new();
        loop {
            self.skip_newlines();
            if self.at_list_end() {
                return Ok(items);
            }
            items.push(self.and_or()?);
            match self.peek_kind() {
                TokenKind::Op(Op::Semi) | TokenKind::Newline => {
                    self.bump();
                }
                _ => return Ok(items),
            }
        }
    }

    /// A list that must contain at least one command, ended by `keyword`.
    fn body(&mut self, keyword: &str) -> Result<List, ShellError> {
        let list = self.list()?;
        if list.is_empty() {
            return Err(self.error(format!("expected a command before '{keyword}'")));
        }
        Ok(list)
    }

    fn and_or(&mut self) -> Result<AndOr, ShellError> {
        let first = self.pipeline()?;
        let mut rest = Vec::new();
        loop {
            let connector = match self.peek_kind() {
                TokenKind::Op(Op::AndIf) => Connector::And,
                TokenKind::Op(Op::OrIf) => Connector::Or,
                _ => return Ok(AndOr { first, rest }),
            };
            self.bump();
            self.skip_newlines();
            rest.push((connector, self.pipeline()?));
        }
    }

    fn pipeline(&mut self) -> Result<Pipeline, ShellError> {
        let negated = self.at_keyword("!");
        if negated {
            self.bump();
        }
        let mut commands = vec![self.command()?];
        while *self.peek_kind() == TokenKind::Op(Op::Pipe) {
            self.bump();
            self.skip_newlines();
            commands.push(self.command()?);
        }
        Ok(Pipeline { negated, commands })
    }

    fn command(&mut self) -> Result<Command, ShellError> {
        if let Some(name) = self.function_name() {
            return self.function_def(name);
        }
        let reserved = self.peek_reserved().map(str::to_owned);
        let paren = *self.peek_kind() == TokenKind::Op(Op::LParen);
        let compound = match (reserved.as_deref(), paren) {
            (Some("if"), _) => self.if_clause()?,
            (Some("while"), _) => self.loop_clause(false)?,
            (Some("until"), _) => self.loop_clause(true)?,
            (Some("for"), _) => self.for_clause()?,
            (Some("case"), _) => self.case_clause()?,
            (Some("{"), _) => {
                self.bump();
                let body = self.body("}")?;
                self.expect_keyword("}")?;
                Compound::Group(body)
            }
            (_, true) => {
                self.bump();
                let body = self.list()?;
                if body.is_empty() {
                    return Err(self.error("expected a command before ')'"));
                }
                if *self.peek_kind() != TokenKind::Op(Op::RParen) {
                    return Err(self.error(format!("expected ')', found {}", self.peek_kind())));
                }
                self.bump();
                Compound::Subshell(body)
            }
            (Some(word), _) if word != "in" => {
                return Err(self.error(format!("unexpected '{word}'")));
            }
            _ => return self.simple().map(Command::Simple),
        };
        let mut redirects = Vec::new();
        while let Some(r) = self.redirect()? {
            redirects.push(r);
        }
        Ok(Command::Compound(compound, redirects))
    }

    /// The name when the next tokens are `name ( )`.
    fn function_name(&self) -> Option<String> {
        let TokenKind::Word(w) = self.peek_kind() else {
            return None;
        };
        let name = w.plain().filter(|n| is_name(n) && !RESERVED.contains(n))?;
        let opens = *self.peek_kind_at(1) == TokenKind::Op(Op::LParen)
            && *self.peek_kind_at(2) == TokenKind::Op(Op::RParen);
        opens.then(|| name.to_owned())
    }

    fn function_def(&mut self, name: String) -> Result<Command, ShellError> {
        self.pos += 3;
        self.skip_newlines();
        let body = self.command()?;
        if !matches!(body, Command::Compound(..)) {
            return Err(self.error(format!("function '{name}' needs a compound command as its body")));
        }
        Ok(Command::Function {
            name,
            body: Arc::new(body),
        })
    }

    fn case_clause(&mut self) -> Result<Compound, ShellError> {
        self.bump();
        let word = match self.bump() {
            TokenKind::Word(w) => w,
            other => return Err(self.error(format!("expected a word after 'case', found {other}"))),
        };
        self.skip_newlines();
        self.expect_keyword("in")?;
        self.skip_newlines();

        let mut arms = Vec::new();
        while !self.at_keyword("esac") {
            if *self.peek_kind() == TokenKind::Op(Op::LParen) {
                self.bump();
            }
            let mut patterns = Vec::new();
            loop {
                match self.bump() {
                    TokenKind::Word(w) => patterns.push(w),
                    other => return Err(self.error(format!("expected a pattern, found {other}"))),
                }
                match self.bump() {
                    TokenKind::Op(Op::Pipe) => {}
                    TokenKind::Op(Op::RParen) => break,
                    other => return Err(self.error(format!("expected ')' after pattern, found {other}"))),
                }
            }
            let body = self.list()?;
            arms.push(CaseArm { patterns, body });
            if *self.peek_kind() == TokenKind::Op(Op::DSemi) {
                self.bump();
                self.skip_newlines();
            } else if !self.at_keyword("esac") {
                return Err(self.error(format!("expected ';;' or 'esac', found {}", self.peek_kind())));
            }
        }
        self.bump();
        Ok(Compound::Case { word, arms })
    }

    fn if_clause(&mut self) -> Result<Compound, ShellError> {
        self.bump();
        let mut branches = Vec::new();
        let condition = self.body("then")?;
        self.expect_keyword("then")?;
        branches.push((condition, self.body("fi")?));
        let mut otherwise = None;
        loop {
            if self.at_keyword("elif") {
                self.bump();
                let condition = self.body("then")?;
                self.expect_keyword("then")?;
                branches.push((condition, self.body("fi")?));
            } else if self.at_keyword("else") {
                self.bump();
                otherwise = Some(self.body("fi")?);
            } else {
                self.expect_keyword("fi")?;
                return Ok(Compound::If {
                    branches,
                    otherwise,
                });
            }
        }
    }

    fn loop_clause(&mut self, until: bool) -> Result<Compound, ShellError> {
        self.bump();
        let condition = self.body("do")?;
        self.expect_keyword("do")?;
        let body = self.body("done")?;
        self.expect_keyword("done")?;
        Ok(Compound::Loop {
            until,
            condition,
            body,
        })
    }

    fn for_clause(&mut self) -> Result<Compound, ShellError> {
        self.bump();
        let var = match self.bump() {
            TokenKind::Word(w) => match w.plain() {
                Some(name) if is_name(name) => name.to_owned(),
                _ => return Err(self.error("expected a variable name after 'for'")),
            },
            other => return Err(self.error(format!("expected a variable name, found {other}"))),
        };
        self.skip_newlines();

        let items = if self.at_keyword("in") {
            self.bump();
            let mut words = Vec::new();
            while let TokenKind::Word(w) = self.peek_kind() {
                words.push(w.clone());
                self.bump();
            }
            match self.peek_kind() {
                TokenKind::Op(Op::Semi) | TokenKind::Newline => {
                    self.bump();
                }
                other => return Err(self.error(format!("unexpected {other} in 'for' list"))),
            }
            Some(words)
        } else {
            if *self.peek_kind() == TokenKind::Op(Op::Semi) {
                self.bump();
            }
            None
        };
        self.skip_newlines();
        self.expect_keyword("do")?;
        let body = self.body("done")?;
        self.expect_keyword("done")?;
        Ok(Compound::For { var, items, body })
    }

    fn redirect(&mut self) -> Result<Option<Redirect>, ShellError> {
        let explicit_fd = match self.peek_kind() {
            TokenKind::IoNumber(n) => {
                let n = *n;
                self.bump();
                Some(n)
            }
            _ => None,
        };
        let (kind, default_fd) = match self.peek_kind() {
            TokenKind::Op(Op::Great) => (RedirectKind::Write, 1),
            TokenKind::Op(Op::DGreat) => (RedirectKind::Append, 1),
            TokenKind::Op(Op::Less) => (RedirectKind::Read, 0),
            TokenKind::Op(Op::GreatAnd) => (RedirectKind::Duplicate, 1),
            TokenKind::Op(Op::LessAnd) => (RedirectKind::Duplicate, 0),
            other if explicit_fd.is_some() => {
                return Err(self.error(format!("expected redirection, found {other}")));
            }
            _ => return Ok(None),
        };
        let op = self.bump();
        let TokenKind::Word(target) = self.bump() else {
            return Err(self.error(format!("expected a word after {op}")));
        };
        Ok(Some(Redirect {
            fd: explicit_fd.unwrap_or(default_fd),
            kind,
            target,
        }))
    }

    fn simple(&mut self) -> Result<SimpleCommand, ShellError> {
        let mut cmd = SimpleCommand::default();
        loop {
            if let Some(r) = self.redirect()? {
                cmd.redirects.push(r);
                continue;
            }
            let TokenKind::Word(word) = self.peek_kind() else {
                break;
            };
            if cmd.words.is_empty() {
                if let Some(assignment) = word.assignment() {
                    cmd.assignments.push(assignment);
                    self.bump();
                    continue;
                }
            }
            cmd.words.push(word.clone());
            self.bump();
        }
        if cmd.words.is_empty() && cmd.assignments.is_empty() && cmd.redirects.is_empty() {
            return Err(self.error(format!("unexpected {}", self.peek_kind())));
        }
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple(cmd: &Command) -> &SimpleCommand {
        match cmd {
            Command::Simple(s) => s,
            other => panic!("expected simple command, got {other:?}"),
        }
    }

    #[test]
    fn lists_and_chains() {
        let p = parse("a; b && c || d\ne").unwrap();
        assert_eq!(p.body.len(), 3);
        assert_eq!(p.body[1].rest.len(), 2);
        assert_eq!(p.body[1].rest[0].0, Connector::And);
        assert_eq!(p.body[1].rest[1].0, Connector::Or);
    }

    #[test]
    fn pipelines_and_negation() {
        let p = parse("! a | b | c").unwrap();
        let pipeline = &p.body[0].first;
        assert!(pipeline.negated);
        assert_eq!(pipeline.commands.len(), 3);
    }

    #[test]
    fn assignments_only_before_command_name() {
        let p = parse("A=1 B=2 env C=3").unwrap();
        let cmd = simple(&p.body[0].first.commands[0]);
        assert_eq!(cmd.assignments.len(), 2);
        assert_eq!(cmd.words.len(), 2);
    }

    #[test]
    fn redirects_attach_to_commands() {
        let p = parse("echo hi >out 2>&1").unwrap();
        let cmd = simple(&p.body[0].first.commands[0]);
        assert_eq!(cmd.words.len(), 2);
        assert_eq!(cmd.redirects.len(), 2);
        assert_eq!(cmd.redirects[0].fd, 1);
        assert_eq!(cmd.redirects[0].kind, RedirectKind::Write);
        assert_eq!(cmd.redirects[1].fd, 2);
        assert_eq!(cmd.redirects[1].kind, RedirectKind::Duplicate);
    }

    #[test]
    fn if_elif_else() {
        let p = parse("if a; then b; elif c\nthen d\nelse e; fi").unwrap();
        match &p.body[0].first.commands[0] {
            Command::Compound(Compound::If { branches, otherwise }, _) => {
                assert_eq!(branches.len(), 2);
                assert!(otherwise.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn loops_and_groups() {
        let p = parse("for x in a b c; do echo $x; done\nwhile false; do :; done\n{ a; b; } >log\n(cd /tmp)").unwrap();
        assert_eq!(p.body.len(), 4);
        match &p.body[0].first.commands[0] {
            Command::Compound(Compound::For { var, items, .. }, _) => {
                assert_eq!(var, "x");
                assert_eq!(items.as_ref().map(Vec::len), Some(3));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            &p.body[1].first.commands[0],
            Command::Compound(Compound::Loop { until: false, .. }, _)
        ));
        match &p.body[2].first.commands[0] {
            Command::Compound(Compound::Group(list), redirects) => {
                assert_eq!(list.len(), 2);
                assert_eq!(redirects.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            &p.body[3].first.commands[0],
            Command::Compound(Compound::Subshell(_), _)
        ));
    }

    #[test]
    fn for_without_in_iterates_arguments() {
        let p = parse("for a\ndo echo $a\ndone").unwrap();
        assert!(matches!(
            &p.body[0].first.commands[0],
            Command::Compound(Compound::For { items: None, .. }, _)
        ));
    }

    #[test]
    fn case_arms() {
        let p = parse("case $1 in\n  a|b) echo ab ;;\n  (c*) echo c\n     echo more ;;\n  *) ;;\nesac").unwrap();
        match &p.body[0].first.commands[0] {
            Command::Compound(Compound::Case { arms, .. }, _) => {
                assert_eq!(arms.len(), 3);
                assert_eq!(arms[0].patterns.len(), 2);
                assert_eq!(arms[1].body.len(), 2);
                assert!(arms[2].body.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse("case x in esac").is_ok());
        assert!(parse("case x in y) echo y; esac").is_ok());
    }

    #[test]
    fn function_definitions() {
        let p = parse("greet() {\n  echo \"hi $1\"\n}\nsub () ( exit 1 ) >log").unwrap();
        assert_eq!(p.body.len(), 2);
        match &p.body[0].first.commands[0] {
            Command::Function { name, body } => {
                assert_eq!(name, "greet");
                assert!(matches!(**body, Command::Compound(Compound::Group(_), _)));
            }
            other => panic!("unexpected {other:?}"),
        }
        match &p.body[1].first.commands[0] {
            Command::Function { body, .. } => {
                assert!(matches!(&**body, Command::Compound(Compound::Subshell(_), r) if r.len() == 1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn keywords_are_plain_words_as_arguments() {
        let p = parse("echo if then fi").unwrap();
        assert_eq!(simple(&p.body[0].first.commands[0]).words.len(), 4);
    }

    #[test]
    fn syntax_errors() {
        for src in [
            "if true; then echo",
            "fi",
            "echo a &&",
            "| b",
            "while true; do done",
            "{ }",
            "for 1 in a; do :; done",
            "echo >",
            "(echo",
            "a ;; b",
            "case x in a) echo",
            "case x a) b;; esac",
            "case x in a b) c;; esac",
            "f() echo hi",
            "if() { :; }",
        ] {
            assert!(
                matches!(parse(src), Err(ShellError::Syntax { .. })),
                "{src} should fail"
            );
        }
    }

    #[test]
    fn empty_script_is_valid() {
        assert!(parse("").unwrap().body.is_empty());
        assert!(parse("\n# only a comment\n").unwrap().body.is_empty());
    }
}
