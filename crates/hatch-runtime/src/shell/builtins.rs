use super::exec::{Flow, Interrupt, Shell, Streams};
use super::lexer::is_name;
use std::fmt::Write as _;
use std::path::Path;

pub(super) type Builtin = fn(&mut Shell, &[String], &Streams) -> Flow;

pub(super) fn lookup(name: &str) -> Option<Builtin> {
    let builtin: Builtin = match name {
        "echo" => echo,
        "printf" => printf,
        "cd" => cd,
        "pwd" => pwd,
        "export" => export,
        "unset" => unset,
        "set" => set,
        "shift" => shift,
        "exit" => exit,
        "return" => return_,
        "local" => local,
        "true" | ":" => |_, _, _| Ok(0),
        "false" => |_, _, _| Ok(1),
        "test" => |sh, args, io| Ok(test(sh, args, io, false)),
        "[" => |sh, args, io| Ok(test(sh, args, io, true)),
        _ => return None,
    };
    Some(builtin)
}

fn echo(_: &mut Shell, args: &[String], io: &Streams) -> Flow {
    let mut newline = true;
    let mut rest = args;
    while let Some((first, tail)) = rest.split_first() {
        if first != "-n" {
            break;
        }
        newline = false;
        rest = tail;
    }
    let mut out = rest.join(" ");
    if newline {
        out.push('\n');
    }
    Ok(io.print(&out))
}

fn printf(_: &mut Shell, args: &[String], io: &Streams) -> Flow {
    let Some((format, args)) = args.split_first() else {
        io.error("printf: usage: printf format [arguments]");
        return Ok(2);
    };
    Ok(io.print(&render_printf(format, args)))
}

/// `%s`, `%d`/`%i`, `%%` with optional width, plus `\n \t \r \\` escapes.
/// The format is reused while arguments remain.
pub(super) fn render_printf(format: &str, args: &[String]) -> String {
    let mut out = String::new();
    let mut next = 0;
    loop {
        let start = next;
        let mut chars = format.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('\\') => out.push('\\'),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => out.push('\\'),
                },
                '%' => {
                    let mut spec = String::new();
                    while let Some(&d) = chars.peek() {
                        if d == '-' || d == '.' || d.is_ascii_digit() {
                            spec.push(d);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let arg = args.get(next).map_or("", String::as_str);
                    match chars.next() {
                        Some('%') => out.push('%'),
                        Some('s') => {
                            out.push_str(&pad(arg, &spec));
                            next += 1;
                        }
                        Some('d' | 'i') => {
                            let n: i64 = arg.trim().parse().unwrap_or(0);
                            out.push_str(&pad(&n.to_string(), &spec));
                            next += 1;
                        }
                        Some(other) => {
                            let _ = write!(out, "%{spec}{other}");
                        }
                        None => out.push('%'),
                    }
                }
                c => out.push(c),
            }
        }
        if next >= args.len() || next == start {
            return out;
        }
    }
}

fn pad(value: &str, spec: &str) -> String {
    let left = spec.starts_with('-');
    let width: usize = spec
        .trim_start_matches('-')
        .split('.')
        .next()
        .and_then(|w| w.parse().ok())
        .unwrap_or(0);
    if left {
        format!("{value:<width$}")
    } else {
        format!("{value:>width$}")
    }
}

fn cd(sh: &mut Shell, args: &[String], io: &Streams) -> Flow {
    let target = match args.first() {
        Some(t) => t.clone(),
        None => match sh.var("HOME") {
            Some(home) => home.to_owned(),
            None => {
                io.error("cd: HOME not set");
                return Ok(1);
            }
        },
    };
    let path = sh.cwd.join(&target);
    let resolved = match std::fs::canonicalize(&path) {
        Ok(p) if p.is_dir() => p,
        Ok(_) => {
            io.error(format_args!("cd: {target}: Not a directory"));
            return Ok(1);
        }
        Err(_) => {
            io.error(format_args!("cd: {target}: No such file or directory"));
            return Ok(1);
        }
    };
    let old = std::mem::replace(&mut sh.cwd, resolved);
    sh.set_var("OLDPWD", old.display().to_string());
    let pwd = sh.cwd.display().to_string();
    sh.set_var("PWD", pwd);
    Ok(0)
}

fn pwd(sh: &mut Shell, _: &[String], io: &Streams) -> Flow {
    Ok(io.print(&format!("{}\n", sh.cwd.display())))
}

fn export(sh: &mut Shell, args: &[String], io: &Streams) -> Flow {
    if args.is_empty() {
        let mut out = String::new();
        for name in &sh.exported {
            if let Some(value) = sh.vars.get(name) {
                let _ = writeln!(out, "export {name}=\"{value}\"");
            }
        }
        return Ok(io.print(&out));
    }
    let mut status = 0;
    for arg in args {
        let (name, value) = match arg.split_once('=') {
            Some((n, v)) => (n, Some(v)),
            None => (arg.as_str(), None),
        };
        if !is_name(name) {
            io.error(format_args!("export: '{arg}': not a valid identifier"));
            status = 1;
            continue;
        }
        if let Some(v) = value {
            sh.set_var(name, v.to_owned());
        }
        sh.export(name);
    }
    Ok(status)
}

fn unset(sh: &mut Shell, args: &[String], _: &Streams) -> Flow {
    for name in args.iter().filter(|a| !a.starts_with('-')) {
        sh.unset(name);
    }
    Ok(0)
}

fn set(sh: &mut Shell, args: &[String], io: &Streams) -> Flow {
    if args.is_empty() {
        let mut out = String::new();
        for (name, value) in &sh.vars {
            let _ = writeln!(out, "{name}='{value}'");
        }
        return Ok(io.print(&out));
    }
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if arg == "--" || arg == "-" {
            sh.args = args[i + 1..].to_vec();
            return Ok(0);
        }
        let enable = arg.starts_with('-');
        if !enable && !arg.starts_with('+') {
            sh.args = args[i..].to_vec();
            return Ok(0);
        }
        if &arg[1..] == "o" {
            let Some(option) = args.get(i + 1) else {
                io.error(format_args!("set: {arg}: option name required"));
                return Ok(2);
            };
            let flag = match option.as_str() {
                "errexit" => 'e',
                "nounset" => 'u',
                "pipefail" => 'p',
                other => {
                    io.error(format_args!("set: {other}: invalid option name"));
                    return Ok(2);
                }
            };
            apply_flag(sh, flag, enable);
            i += 2;
            continue;
        }
        for flag in arg[1..].chars() {
            if !matches!(flag, 'e' | 'u') {
                io.error(format_args!("set: -{flag}: invalid option"));
                return Ok(2);
            }
            apply_flag(sh, flag, enable);
        }
        i += 1;
    }
    Ok(0)
}

fn apply_flag(sh: &mut Shell, flag: char, enable: bool) {
    match flag {
        'e' => sh.errexit = enable,
        'u' => sh.nounset = enable,
        _ => sh.pipefail = enable,
    }
}

fn shift(sh: &mut Shell, args: &[String], io: &Streams) -> Flow {
    let n = match args.first() {
        None => 1,
        Some(a) => match a.parse::<usize>() {
            Ok(n) => n,
            Err(_) => {
                io.error(format_args!("shift: {a}: numeric argument required"));
                return Ok(1);
            }
        },
    };
    if n > sh.args.len() {
        return Ok(1);
    }
    sh.args.drain(..n);
    Ok(0)
}

/// The status operand of `exit` and `return`, taken modulo 256. Defaults to
/// the last command's status.
fn status_arg(sh: &Shell, name: &str, args: &[String], io: &Streams) -> u8 {
    match args.first() {
        None => sh.status,
        Some(a) => match a.trim().parse::<i64>() {
            Ok(n) => u8::try_from(n.rem_euclid(256)).unwrap_or(u8::MAX),
            Err(_) => {
                io.error(format_args!("{name}: {a}: numeric argument required"));
                2
            }
        },
    }
}

fn exit(sh: &mut Shell, args: &[String], io: &Streams) -> Flow {
    Err(Interrupt::Exit(status_arg(sh, "exit", args, io)))
}

fn return_(sh: &mut Shell, args: &[String], io: &Streams) -> Flow {
    if sh.locals.is_empty() {
        io.error("return: can only be used in a function");
        return Ok(1);
    }
    Err(Interrupt::Return(status_arg(sh, "return", args, io)))
}

/// `local NAME[=value]...`: the previous values come back when the
/// function returns.
fn local(sh: &mut Shell, args: &[String], io: &Streams) -> Flow {
    let mut status = 0;
    for arg in args {
        let (name, value) = match arg.split_once('=') {
            Some((n, v)) => (n, Some(v)),
            None => (arg.as_str(), None),
        };
        if !is_name(name) {
            io.error(format_args!("local: '{arg}': not a valid identifier"));
            status = 1;
            continue;
        }
        if !sh.make_local(name) {
            io.error("local: can only be used in a function");
            return Ok(1);
        }
        if let Some(v) = value {
            sh.set_var(name, v.to_owned());
        }
    }
    Ok(status)
}

fn test(sh: &Shell, args: &[String], io: &Streams, bracket: bool) -> u8 {
    let args = if bracket {
        match args.split_last() {
            Some((last, rest)) if last == "]" => rest,
            _ => {
                io.error("[: missing ']'");
                return 2;
            }
        }
    } else {
        args
    };
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match evaluate(sh, &args) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(message) => {
            io.error(format_args!("test: {message}"));
            2
        }
    }
}

fn evaluate(sh: &Shell, args: &[&str]) -> Result<bool, String> {
    match args {
        [] => Ok(false),
        [single] => Ok(!single.is_empty()),
        ["!", operand] => Ok(operand.is_empty()),
        [op, operand] => unary(sh, op, operand),
        [left, op, right] if is_binary(op) => binary(left, op, right),
        ["!", rest @ ..] => evaluate(sh, rest).map(|b| !b),
        _ => Err("too many arguments".to_owned()),
    }
}

fn is_binary(op: &str) -> bool {
    matches!(
        op,
        "=" | "==" | "!=" | "-eq" | "-ne" | "-lt" | "-le" | "-gt" | "-ge"
    )
}

fn unary(sh: &Shell, op: &str, operand: &str) -> Result<bool, String> {
    if op == "-n" {
        return Ok(!operand.is_empty());
    }
    if op == "-z" {
        return Ok(operand.is_empty());
    }
    let path = sh.cwd.join(operand);
    let meta = std::fs::metadata(&path);
    Ok(match op {
        "-e" => meta.is_ok(),
        "-f" => meta.is_ok_and(|m| m.is_file()),
        "-d" => meta.is_ok_and(|m| m.is_dir()),
        "-s" => meta.is_ok_and(|m| m.len() > 0),
        "-L" | "-h" => std::fs::symlink_metadata(&path).is_ok_and(|m| m.file_type().is_symlink()),
        "-r" => mode_allows(&path, 0o444),
        "-w" => mode_allows(&path, 0o222),
        "-x" => mode_allows(&path, 0o111),
        other => return Err(format!("{other}: unary operator expected")),
    })
}

#[cfg(unix)]
fn mode_allows(path: &Path, mask: u32) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.permissions().mode() & mask != 0)
}

#[cfg(not(unix))]
fn mode_allows(path: &Path, mask: u32) -> bool {
    std::fs::metadata(path).is_ok_and(|m| mask & 0o222 == 0 || !m.permissions().readonly())
}

fn binary(left: &str, op: &str, right: &str) -> Result<bool, String> {
    match op {
        "=" | "==" => return Ok(left == right),
        "!=" => return Ok(left != right),
        _ => {}
    }
    let int = |s: &str| {
        s.trim()
            .parse::<i64>()
            .map_err(|_| format!("{s}: integer expression expected"))
    };
    let (l, r) = (int(left)?, int(right)?);
    Ok(match op {
        "-eq" => l == r,
        "-ne" => l != r,
        "-lt" => l < r,
        "-le" => l <= r,
        "-gt" => l > r,
        _ => l >= r,
    })
}
