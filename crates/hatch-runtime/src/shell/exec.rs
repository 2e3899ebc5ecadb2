use super::lexer::{Expansion, Param, Part, Word};
use super::parser::{
    parse, AndOr, Command, Compound, Connector, List, Pipeline, Program, Redirect, RedirectKind,
    SimpleCommand,
};
use super::{arith, builtins, pattern};
use super::ShellError;
use crate::cancel::CancellationToken;
use crate::exit::ExitCode;
use crate::io::{InputSource, IoStreams, OutputSink};
use crate::native::ARG0_PLACEHOLDER;
use crate::prereq::find_in_path;
use crate::process::run_child;
use crate::RuntimeError;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Why execution stopped early.
pub(super) enum Interrupt {
    Exit(u8),
    Return(u8),
    Error(ShellError),
}

impl From<ShellError> for Interrupt {
    fn from(e: ShellError) -> Self {
        Self::Error(e)
    }
}

pub(super) type Flow = Result<u8, Interrupt>;

/// Nested function calls allowed before a call fails.
const MAX_FUNCTION_DEPTH: usize = 64;

/// Status of a run that ends a subshell, pipeline stage or substitution.
fn contained(result: Flow) -> Flow {
    match result {
        Ok(status) | Err(Interrupt::Exit(status) | Interrupt::Return(status)) => Ok(status),
        Err(e) => Err(e),
    }
}

/// Output stream that several redirections can point at at once.
#[derive(Clone)]
pub(super) struct Sink(Arc<Mutex<OutputSink>>);

impl Sink {
    fn new(sink: OutputSink) -> Self {
        Self(Arc::new(Mutex::new(sink)))
    }

    fn into_inner(self) -> OutputSink {
        match Arc::try_unwrap(self.0) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner),
            Err(_) => OutputSink::Null,
        }
    }

    /// A sink for a child process. Process-wide streams are handed over
    /// directly so the child inherits them.
    fn child_sink(&self) -> OutputSink {
        let guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match &*guard {
            OutputSink::Stdout => OutputSink::Stdout,
            OutputSink::Stderr => OutputSink::Stderr,
            OutputSink::Null => OutputSink::Null,
            OutputSink::Writer(_) => OutputSink::Writer(Box::new(self.clone())),
        }
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).flush()
    }
}

#[derive(Clone)]
pub(super) struct Streams {
    pub stdin: InputSource,
    pub stdout: Sink,
    pub stderr: Sink,
}

impl Streams {
    /// Write to stdout; the status is 1 when the write fails.
    pub(super) fn print(&self, text: &str) -> u8 {
        let mut out = self.stdout.clone();
        match out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
            Ok(()) => 0,
            Err(_) => 1,
        }
    }

    pub(super) fn error(&self, message: impl fmt::Display) {
        let mut err = self.stderr.clone();
        let _ = writeln!(err, "{ARG0_PLACEHOLDER}: {message}");
        let _ = err.flush();
    }
}

/// Interpreter state: variables, functions, positional parameters, options
/// and the working directory.
#[derive(Debug, Clone)]
pub struct Shell {
    pub(super) vars: BTreeMap<String, String>,
    pub(super) exported: BTreeSet<String>,
    functions: BTreeMap<String, Arc<Command>>,
    /// One frame per active function call: names made local and the values
    /// they had before.
    pub(super) locals: Vec<Vec<(String, Option<String>)>>,
    last_substitution: Option<u8>,
    pub(super) cwd: PathBuf,
    pub(super) arg0: String,
    pub(super) args: Vec<String>,
    pub(super) status: u8,
    pub(super) errexit: bool,
    pub(super) nounset: bool,
    pub(super) pipefail: bool,
    condition_depth: usize,
    cancel: CancellationToken,
}

impl Shell {
    /// A shell in `cwd` whose variables are `env`, all exported.
    pub fn new(cwd: impl Into<PathBuf>, env: BTreeMap<String, String>) -> Self {
        let exported = env.keys().cloned().collect();
        Self {
            vars: env,
            exported,
            functions: BTreeMap::new(),
            locals: Vec::new(),
            last_substitution: None,
            cwd: cwd.into(),
            arg0: ARG0_PLACEHOLDER.to_owned(),
            args: Vec::new(),
            status: 0,
            errexit: false,
            nounset: false,
            pipefail: false,
            condition_depth: 0,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_arg0(mut self, arg0: impl Into<String>) -> Self {
        self.arg0 = arg0.into();
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Parse and run `script`.
    pub fn run_script(
        &mut self,
        script: &str,
        io: &mut IoStreams,
    ) -> Result<ExitCode, ShellError> {
        let program = parse(script)?;
        self.run(&program, io)
    }

    /// Run a parsed program against `io`. `exit` and a failing command under
    /// `set -e` end the run with their status; only cancellation and
    /// unrecoverable errors are returned as `Err`.
    pub fn run(&mut self, program: &Program, io: &mut IoStreams) -> Result<ExitCode, ShellError> {
        let stdout = Sink::new(std::mem::replace(&mut io.stdout, OutputSink::Null));
        let stderr = Sink::new(std::mem::replace(&mut io.stderr, OutputSink::Null));
        let streams = Streams {
            stdin: io.stdin.clone(),
            stdout: stdout.clone(),
            stderr: stderr.clone(),
        };
        let result = self.exec_list(&program.body, &streams);
        drop(streams);
        io.stdout = stdout.into_inner();
        io.stderr = stderr.into_inner();

        match result {
            Ok(status) | Err(Interrupt::Exit(status) | Interrupt::Return(status)) => {
                Ok(ExitCode::from(status))
            }
            Err(Interrupt::Error(e)) => Err(e),
        }
    }

    pub(super) fn set_var(&mut self, name: &str, value: String) {
        self.vars.insert(name.to_owned(), value);
    }

    pub(super) fn export(&mut self, name: &str) {
        self.exported.insert(name.to_owned());
    }

    pub(super) fn unset(&mut self, name: &str) {
        self.vars.remove(name);
        self.exported.remove(name);
    }

    /// Save `name` in the innermost call frame so it is restored on return.
    /// Returns false outside a function.
    pub(super) fn make_local(&mut self, name: &str) -> bool {
        let old = self.vars.get(name).cloned();
        let Some(frame) = self.locals.last_mut() else {
            return false;
        };
        if !frame.iter().any(|(n, _)| n == name) {
            frame.push((name.to_owned(), old));
        }
        true
    }

    fn check_cancel(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Error(ShellError::Cancelled));
        }
        Ok(())
    }

    fn exec_list(&mut self, list: &List, io: &Streams) -> Flow {
        let mut status = 0;
        for and_or in list {
            status = self.exec_and_or(and_or, io)?;
        }
        Ok(status)
    }

    /// Run `list` as a condition: `set -e` does not apply inside it.
    fn exec_condition(&mut self, list: &List, io: &Streams) -> Flow {
        self.condition_depth += 1;
        let result = self.exec_list(list, io);
        self.condition_depth -= 1;
        result
    }

    fn exec_and_or(&mut self, and_or: &AndOr, io: &Streams) -> Flow {
        let mut status = self.exec_pipeline_checked(&and_or.first, io, and_or.rest.is_empty())?;
        for (i, (connector, pipeline)) in and_or.rest.iter().enumerate() {
            let run = match connector {
                Connector::And => status == 0,
                Connector::Or => status != 0,
            };
            if run {
                let is_last = i + 1 == and_or.rest.len();
                status = self.exec_pipeline_checked(pipeline, io, is_last)?;
            }
        }
        Ok(status)
    }

    /// Only the last pipeline of an and-or chain can trigger `set -e`.
    fn exec_pipeline_checked(&mut self, pipeline: &Pipeline, io: &Streams, is_last: bool) -> Flow {
        if !is_last {
            self.condition_depth += 1;
        }
        let result = self.exec_pipeline(pipeline, io);
        if !is_last {
            self.condition_depth -= 1;
        }
        let status = result?;
        if is_last
            && !pipeline.negated
            && status != 0
            && self.errexit
            && self.condition_depth == 0
        {
            debug!("errexit: stopping with status {status}");
            return Err(Interrupt::Exit(status));
        }
        Ok(status)
    }

    fn exec_pipeline(&mut self, pipeline: &Pipeline, io: &Streams) -> Flow {
        let status = match pipeline.commands.as_slice() {
            [single] => self.exec_command(single, io)?,
            stages => {
                let mut input = io.stdin.clone();
                let mut status = 0;
                let mut failed = 0;
                for (i, command) in stages.iter().enumerate() {
                    let mut stage_io = io.clone();
                    stage_io.stdin = std::mem::take(&mut input);
                    let buffer = if i + 1 < stages.len() {
                        let (sink, buffer) = OutputSink::buffer();
                        stage_io.stdout = Sink::new(sink);
                        Some(buffer)
                    } else {
                        None
                    };
                    // Each stage runs in its own copy of the shell.
                    let mut stage = self.clone();
                    status = contained(stage.exec_command(command, &stage_io))?;
                    if status != 0 {
                        failed = status;
                    }
                    drop(stage_io);
                    if let Some(buffer) = buffer {
                        input = InputSource::Bytes(buffer.contents());
                    }
                }
                if self.pipefail {
                    failed
                } else {
                    status
                }
            }
        };
        let status = if pipeline.negated {
            u8::from(status == 0)
        } else {
            status
        };
        self.status = status;
        Ok(status)
    }

    fn exec_command(&mut self, command: &Command, io: &Streams) -> Flow {
        match command {
            Command::Simple(simple) => self.exec_simple(simple, io),
            Command::Compound(compound, redirects) => {
                let Some(io) = self.apply_redirects(redirects, io)? else {
                    return Ok(1);
                };
                self.exec_compound(compound, &io)
            }
            Command::Function { name, body } => {
                self.functions.insert(name.clone(), Arc::clone(body));
                Ok(0)
            }
        }
    }

    fn exec_compound(&mut self, compound: &Compound, io: &Streams) -> Flow {
        match compound {
            Compound::If {
                branches,
                otherwise,
            } => {
                for (condition, body) in branches {
                    if self.exec_condition(condition, io)? == 0 {
                        return self.exec_list(body, io);
                    }
                }
                match otherwise {
                    Some(body) => self.exec_list(body, io),
                    None => Ok(0),
                }
            }
            Compound::Loop {
                until,
                condition,
                body,
            } => {
                let mut status = 0;
                loop {
                    self.check_cancel()?;
                    let passed = self.exec_condition(condition, io)? == 0;
                    if passed == *until {
                        return Ok(status);
                    }
                    status = self.exec_list(body, io)?;
                }
            }
            Compound::For { var, items, body } => {
                let values = match items {
                    Some(words) => {
                        let mut values = Vec::new();
                        for word in words {
                            values.extend(self.expand_fields(word, io)?);
                        }
                        values
                    }
                    None => self.args.clone(),
                };
                let mut status = 0;
                for value in values {
                    self.check_cancel()?;
                    self.set_var(var, value);
                    status = self.exec_list(body, io)?;
                }
                Ok(status)
            }
            Compound::Case { word, arms } => {
                let subject = self.expand_string(word, io)?;
                for arm in arms {
                    for word in &arm.patterns {
                        let glob = self.expand_pattern(word, io)?;
                        if pattern::matches(&glob, &subject) {
                            return self.exec_list(&arm.body, io);
                        }
                    }
                }
                Ok(0)
            }
            Compound::Group(body) => self.exec_list(body, io),
            Compound::Subshell(body) => {
                let mut sub = self.clone();
                contained(sub.exec_list(body, io))
            }
        }
    }

    fn exec_simple(&mut self, cmd: &SimpleCommand, io: &Streams) -> Flow {
        self.check_cancel()?;
        self.last_substitution = None;

        let mut words = Vec::with_capacity(cmd.words.len());
        for word in &cmd.words {
            words.extend(self.expand_fields(word, io)?);
        }
        let mut assignments = Vec::with_capacity(cmd.assignments.len());
        for (name, value) in &cmd.assignments {
            assignments.push((name.clone(), self.expand_string(value, io)?));
        }
        let Some(io) = self.apply_redirects(&cmd.redirects, io)? else {
            return Ok(1);
        };

        let Some(name) = words.first() else {
            for (name, value) in assignments {
                self.set_var(&name, value);
            }
            return Ok(self.last_substitution.take().unwrap_or(0));
        };

        if let Some(body) = self.functions.get(name).cloned() {
            return self.call_function(&words, &assignments, &body, &io);
        }

        if let Some(builtin) = builtins::lookup(name) {
            let saved: Vec<(String, Option<String>)> = assignments
                .iter()
                .map(|(n, _)| (n.clone(), self.vars.get(n).cloned()))
                .collect();
            for (n, v) in &assignments {
                self.set_var(n, v.clone());
            }
            let result = builtin(self, &words[1..], &io);
            for (n, old) in saved {
                match old {
                    Some(v) => self.set_var(&n, v),
                    None => {
                        self.vars.remove(&n);
                    }
                }
            }
            return result;
        }

        self.exec_external(&words, &assignments, &io)
    }

    /// Run a function body with `words[1..]` as its positional parameters.
    /// Prefix assignments last for the call only.
    fn call_function(
        &mut self,
        words: &[String],
        assignments: &[(String, String)],
        body: &Command,
        io: &Streams,
    ) -> Flow {
        if self.locals.len() >= MAX_FUNCTION_DEPTH {
            io.error(format_args!("{}: maximum function nesting level exceeded", words[0]));
            return Ok(1);
        }
        let saved_args = std::mem::replace(&mut self.args, words[1..].to_vec());
        self.locals.push(Vec::new());
        for (name, value) in assignments {
            self.make_local(name);
            self.set_var(name, value.clone());
        }

        let result = self.exec_command(body, io);

        for (name, old) in self.locals.pop().unwrap_or_default().into_iter().rev() {
            match old {
                Some(value) => self.set_var(&name, value),
                None => {
                    self.vars.remove(&name);
                }
            }
        }
        self.args = saved_args;
        match result {
            Err(Interrupt::Return(status)) => Ok(status),
            other => other,
        }
    }

    fn exec_external(
        &mut self,
        words: &[String],
        assignments: &[(String, String)],
        io: &Streams,
    ) -> Flow {
        let name = &words[0];
        let program = if name.contains('/') {
            find_in_path(&self.cwd.join(name).to_string_lossy(), None)
        } else {
            find_in_path(name, self.vars.get("PATH").map(OsStr::new))
        };
        let Some(program) = program else {
            io.error(format_args!("{name}: command not found"));
            return Ok(127);
        };

        let mut command = std::process::Command::new(&program);
        command
            .args(&words[1..])
            .env_clear()
            .envs(
                self.vars
                    .iter()
                    .filter(|(k, _)| self.exported.contains(*k)),
            )
            .envs(assignments.iter().map(|(k, v)| (k, v)))
            .current_dir(&self.cwd);

        let mut stdout = io.stdout.child_sink();
        let mut stderr = io.stderr.child_sink();
        match run_child(command, &io.stdin, &mut stdout, &mut stderr, &self.cancel) {
            Ok(status) => Ok(ExitCode::from_status(status).map_or(1, ExitCode::value)),
            Err(RuntimeError::Cancelled(_)) => Err(Interrupt::Error(ShellError::Cancelled)),
            Err(e) => {
                io.error(format_args!("{name}: {e}"));
                Ok(126)
            }
        }
    }

    /// Streams after applying `redirects` left to right. `None` means a
    /// redirection failed and the error was already reported.
    fn apply_redirects(
        &mut self,
        redirects: &[Redirect],
        io: &Streams,
    ) -> Result<Option<Streams>, Interrupt> {
        let mut io = io.clone();
        for r in redirects {
            let target = self.expand_string(&r.target, &io)?;
            match r.kind {
                RedirectKind::Write | RedirectKind::Append => {
                    let append = r.kind == RedirectKind::Append;
                    let file = OpenOptions::new()
                        .write(true)
                        .create(true)
                        .append(append)
                        .truncate(!append)
                        .open(self.cwd.join(&target));
                    let sink = match file {
                        Ok(f) => Sink::new(OutputSink::writer(f)),
                        Err(e) => {
                            io.error(format_args!("{target}: {e}"));
                            return Ok(None);
                        }
                    };
                    if !set_output(&mut io, r.fd, sink) {
                        return Ok(None);
                    }
                }
                RedirectKind::Read => {
                    if r.fd != 0 {
                        io.error(format_args!("{}: unsupported file descriptor", r.fd));
                        return Ok(None);
                    }
                    match std::fs::read(self.cwd.join(&target)) {
                        Ok(bytes) => io.stdin = InputSource::Bytes(bytes),
                        Err(e) => {
                            io.error(format_args!("{target}: {e}"));
                            return Ok(None);
                        }
                    }
                }
                RedirectKind::Duplicate => {
                    let sink = match target.as_str() {
                        "1" => io.stdout.clone(),
                        "2" => io.stderr.clone(),
                        "-" => Sink::new(OutputSink::Null),
                        "0" if r.fd == 0 => continue,
                        other => {
                            io.error(format_args!("{other}: bad file descriptor"));
                            return Ok(None);
                        }
                    };
                    if !set_output(&mut io, r.fd, sink) {
                        return Ok(None);
                    }
                }
            }
        }
        Ok(Some(io))
    }

    fn param_value(&mut self, expansion: &Expansion, io: &Streams) -> Result<String, Interrupt> {
        let value = match &expansion.param {
            Param::Named(name) => self.vars.get(name).cloned(),
            Param::Positional(0) => Some(self.arg0.clone()),
            Param::Positional(i) => self.args.get(i - 1).cloned(),
            Param::Count => Some(self.args.len().to_string()),
            Param::All | Param::Star => Some(self.args.join(" ")),
            Param::Status => Some(self.status.to_string()),
            Param::Pid => Some(std::process::id().to_string()),
        };
        if let Some(fallback) = &expansion.fallback {
            let use_fallback = match &value {
                None => true,
                Some(v) => fallback.if_empty && v.is_empty(),
            };
            if use_fallback {
                return self.expand_string(&fallback.word, io);
            }
        }
        match value {
            Some(v) => Ok(v),
            None if self.nounset => Err(Interrupt::Error(ShellError::UnsetParameter(
                expansion.param.to_string(),
            ))),
            None => Ok(String::new()),
        }
    }

    /// `$(...)`: run `program` in a copy of the shell and capture its
    /// stdout without trailing newlines.
    fn substitute(&mut self, program: &Program, io: &Streams) -> Result<String, Interrupt> {
        self.check_cancel()?;
        let (sink, buffer) = OutputSink::buffer();
        let sub_io = Streams {
            stdin: io.stdin.clone(),
            stdout: Sink::new(sink),
            stderr: io.stderr.clone(),
        };
        let mut sub = self.clone();
        let status = contained(sub.exec_list(&program.body, &sub_io))?;
        drop(sub_io);
        self.last_substitution = Some(status);

        let mut text = String::from_utf8_lossy(&buffer.contents()).into_owned();
        text.truncate(text.trim_end_matches('\n').len());
        Ok(text)
    }

    fn expand_part(&mut self, part: &Part, io: &Streams) -> Result<String, Interrupt> {
        match part {
            Part::Literal { text, .. } => Ok(text.clone()),
            Part::Param(e) => self.param_value(e, io),
            Part::Length(Param::All | Param::Star) => Ok(self.args.len().to_string()),
            Part::Length(param) => {
                let expansion = Expansion {
                    param: param.clone(),
                    quoted: true,
                    fallback: None,
                };
                Ok(self.param_value(&expansion, io)?.chars().count().to_string())
            }
            Part::Command { program, .. } => self.substitute(program, io),
            Part::Arith { expr, .. } => {
                let text = self.expand_string(expr, io)?;
                arith::evaluate(&text, &mut self.vars)
                    .map(|n| n.to_string())
                    .map_err(|message| Interrupt::Error(ShellError::Arithmetic(message)))
            }
        }
    }

    /// Expand a word without field splitting.
    pub(super) fn expand_string(&mut self, word: &Word, io: &Streams) -> Result<String, Interrupt> {
        let mut out = String::new();
        for part in &word.0 {
            out.push_str(&self.expand_part(part, io)?);
        }
        Ok(out)
    }

    /// Expand a `case` pattern. Quoted text matches literally.
    fn expand_pattern(&mut self, word: &Word, io: &Streams) -> Result<String, Interrupt> {
        let mut out = String::new();
        for part in &word.0 {
            let quoted = match part {
                Part::Literal { quoted, .. }
                | Part::Command { quoted, .. }
                | Part::Arith { quoted, .. } => *quoted,
                Part::Param(e) => e.quoted,
                Part::Length(_) => false,
            };
            let text = self.expand_part(part, io)?;
            if quoted {
                pattern::escape_into(&mut out, &text);
            } else {
                out.push_str(&text);
            }
        }
        Ok(out)
    }

    /// Expand a word into fields. Unquoted expansions are split on blanks;
    /// a quoted `$@` yields one field per positional parameter.
    pub(super) fn expand_fields(
        &mut self,
        word: &Word,
        io: &Streams,
    ) -> Result<Vec<String>, Interrupt> {
        let mut fields = Vec::new();
        let mut current = String::new();
        let mut has_field = false;

        for part in &word.0 {
            match part {
                Part::Literal { text, quoted } => {
                    current.push_str(text);
                    has_field |= *quoted || !text.is_empty();
                }
                Part::Param(e) if e.quoted && e.param == Param::All && e.fallback.is_none() => {
                    for (i, arg) in self.args.iter().enumerate() {
                        if i > 0 {
                            fields.push(std::mem::take(&mut current));
                        }
                        current.push_str(arg);
                        has_field = true;
                    }
                }
                Part::Param(Expansion { quoted: true, .. })
                | Part::Command { quoted: true, .. }
                | Part::Arith { quoted: true, .. }
                | Part::Length(_) => {
                    current.push_str(&self.expand_part(part, io)?);
                    has_field = true;
                }
                Part::Param(_) | Part::Command { .. } | Part::Arith { .. } => {
                    let value = self.expand_part(part, io)?;
                    let starts_blank = value.starts_with(is_blank);
                    let ends_blank = value.ends_with(is_blank);
                    let pieces: Vec<&str> = value.split(is_blank).filter(|p| !p.is_empty()).collect();
                    if (starts_blank || pieces.is_empty()) && has_field && !value.is_empty() {
                        fields.push(std::mem::take(&mut current));
                        has_field = false;
                    }
                    for (i, piece) in pieces.iter().enumerate() {
                        if i > 0 {
                            fields.push(std::mem::take(&mut current));
                        }
                        current.push_str(piece);
                        has_field = true;
                    }
                    if ends_blank && !pieces.is_empty() {
                        fields.push(std::mem::take(&mut current));
                        has_field = false;
                    }
                }
            }
        }
        if has_field {
            fields.push(current);
        }
        Ok(fields)
    }
}

fn is_blank(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n')
}

fn set_output(io: &mut Streams, fd: u32, sink: Sink) -> bool {
    match fd {
        1 => io.stdout = sink,
        2 => io.stderr = sink,
        other => {
            io.error(format_args!("{other}: unsupported file descriptor"));
            return false;
        }
    }
    true
}
