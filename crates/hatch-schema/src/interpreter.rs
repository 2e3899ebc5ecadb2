//! Interpreter resolution from explicit settings or a script's shebang line.

/// Value of the interpreter setting that asks for shebang detection.
pub const INTERPRETER_AUTO: &str = "auto";

/// An interpreter command line: program plus leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl InterpreterSpec {
    /// Base name of the program without a Windows `.exe` suffix.
    pub fn base_name(&self) -> &str {
        base_name(&self.program)
    }

    /// Conventional script extension for this interpreter, empty when unknown.
    pub fn script_extension(&self) -> &'static str {
        match self.base_name() {
            "python" | "python2" | "python3" => ".py",
            "ruby" => ".rb",
            "perl" => ".pl",
            "node" => ".js",
            "bash" | "sh" => ".sh",
            "zsh" => ".zsh",
            "fish" => ".fish",
            "pwsh" | "powershell" => ".ps1",
            "php" => ".php",
            "lua" => ".lua",
            "Rscript" => ".R",
            _ => "",
        }
    }
}

pub fn base_name(program: &str) -> &str {
    let base = program.rsplit(['/', '\\']).next().unwrap_or(program);
    base.strip_suffix(".exe").unwrap_or(base)
}

/// Parse the first line of `content` as a shebang.
pub fn parse_shebang(content: &str) -> Option<InterpreterSpec> {
    let first = content.lines().next()?.trim();
    let rest = first.strip_prefix("#!")?.trim();
    let mut parts = rest.split_whitespace();
    let program = parts.next()?;
    let args: Vec<&str> = parts.collect();

    if program == "/usr/bin/env" || program == "/bin/env" {
        return unwrap_env(&args);
    }
    Some(spec(program, &args))
}

/// Parse an explicit interpreter setting such as `python3 -u`.
/// Empty and `auto` yield `None`.
pub fn parse_interpreter(setting: &str) -> Option<InterpreterSpec> {
    let setting = setting.trim();
    if setting.is_empty() || setting == INTERPRETER_AUTO {
        return None;
    }
    let parts: Vec<&str> = setting.split_whitespace().collect();
    match parts.split_first() {
        Some((&("/usr/bin/env" | "/bin/env" | "env"), rest)) => unwrap_env(rest),
        Some((program, rest)) => Some(spec(program, rest)),
        None => None,
    }
}

/// Resolve the effective interpreter: explicit setting first, shebang when
/// the setting is absent or `auto`.
pub fn resolve_interpreter(setting: Option<&str>, script: &str) -> Option<InterpreterSpec> {
    match setting.map(str::trim) {
        None | Some("" | INTERPRETER_AUTO) => parse_shebang(script),
        Some(explicit) => parse_interpreter(explicit),
    }
}

/// `env [-S] [flags...] program args...`
fn unwrap_env(args: &[&str]) -> Option<InterpreterSpec> {
    if let Some((&"-S", rest)) = args.split_first() {
        let (program, rest) = rest.split_first()?;
        return Some(spec(program, rest));
    }
    let idx = args.iter().position(|a| !a.starts_with('-'))?;
    Some(spec(args[idx], &args[idx + 1..]))
}

fn spec(program: &str, args: &[&str]) -> InterpreterSpec {
    InterpreterSpec {
        program: program.to_owned(),
        args: args.iter().map(|a| (*a).to_owned()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shebang_direct_path() {
        let spec = parse_shebang("#!/bin/bash -e\necho hi\n").unwrap();
        assert_eq!(spec.program, "/bin/bash");
        assert_eq!(spec.args, vec!["-e".to_owned()]);
        assert_eq!(spec.base_name(), "bash");
    }

    #[test]
    fn shebang_env_and_split_flag() {
        let spec = parse_shebang("#!/usr/bin/env python3\nprint(1)").unwrap();
        assert_eq!(spec.program, "python3");
        assert!(spec.args.is_empty());

        let spec = parse_shebang("#!/usr/bin/env -S python3 -u\r\n").unwrap();
        assert_eq!(spec.program, "python3");
        assert_eq!(spec.args, vec!["-u".to_owned()]);
    }

    #[test]
    fn shebang_absent_or_degenerate() {
        assert!(parse_shebang("echo hi").is_none());
        assert!(parse_shebang("#!").is_none());
        assert!(parse_shebang("#!/usr/bin/env").is_none());
        assert!(parse_shebang("#!/usr/bin/env -S").is_none());
        assert!(parse_shebang("").is_none());
    }

    #[test]
    fn explicit_interpreter_string() {
        let spec = parse_interpreter("python3 -u").unwrap();
        assert_eq!(spec.program, "python3");
        assert_eq!(spec.args, vec!["-u".to_owned()]);
        assert_eq!(parse_interpreter("env node").unwrap().program, "node");
        assert!(parse_interpreter("auto").is_none());
        assert!(parse_interpreter("  ").is_none());
    }

    #[test]
    fn resolve_prefers_explicit_setting() {
        let script = "#!/usr/bin/env ruby\nputs 1";
        assert_eq!(resolve_interpreter(None, script).unwrap().program, "ruby");
        assert_eq!(
            resolve_interpreter(Some("auto"), script).unwrap().program,
            "ruby"
        );
        assert_eq!(
            resolve_interpreter(Some("perl"), script).unwrap().program,
            "perl"
        );
        assert!(resolve_interpreter(None, "echo hi").is_none());
    }

    #[test]
    fn extensions_by_interpreter() {
        let ext = |p: &str| parse_interpreter(p).unwrap().script_extension();
        assert_eq!(ext("/usr/bin/python3"), ".py");
        assert_eq!(ext("node"), ".js");
        assert_eq!(ext("pwsh.exe"), ".ps1");
        assert_eq!(ext("Rscript"), ".R");
        assert_eq!(ext("awk"), "");
    }

    #[test]
    fn base_name_handles_windows_paths() {
        assert_eq!(base_name(r"C:\Program Files\PowerShell\7\pwsh.exe"), "pwsh");
        assert_eq!(base_name("/usr/bin/zsh"), "zsh");
        assert_eq!(base_name("cmd"), "cmd");
    }
}
