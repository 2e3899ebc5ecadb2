use hatch_runtime::container::host_access::{HostAccessServer, LocalHostAccess};
use hatch_runtime::{
    build_registry, CancellationToken, Config, ExecResult, ExecutionContext, ExitCode,
    RegistryOptions,
};
use hatch_schema::{Command, CommandFile, EnvInheritMode, Implementation, RuntimeConfig, RuntimeKind};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_HOST_ACCESS_PORT: u16 = 2222;

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Backend to run on.
    #[arg(long, default_value = "native")]
    pub runtime: RuntimeKind,

    /// Inline script text.
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    pub script: Option<String>,

    /// Script file to run.
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Command-source file. Its directory is the default working directory,
    /// the image build context and the container workspace.
    #[arg(long, default_value = "hatch.toml")]
    pub source: PathBuf,

    /// Command name, used for container run ids and diagnostics.
    #[arg(long, default_value = "run")]
    pub name: String,

    /// Interpreter command line (`auto` reads the shebang).
    #[arg(long)]
    pub interpreter: Option<String>,

    /// Container image to run instead of building one.
    #[arg(long)]
    pub image: Option<String>,

    /// Build file for the container image, relative to the source directory.
    #[arg(long)]
    pub containerfile: Option<String>,

    /// Extra container volume (HOST:CONTAINER[:OPTS]).
    #[arg(long = "volume")]
    pub volumes: Vec<String>,

    /// Published container port (HOST:CONTAINER).
    #[arg(long = "port")]
    pub ports: Vec<String>,

    /// Working directory, relative to the source directory.
    #[arg(long)]
    pub workdir: Option<String>,

    /// Extra environment variable (KEY=VALUE), highest precedence.
    #[arg(long = "env", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Dotenv file, relative to the current directory. Suffix `?` to ignore
    /// a missing file.
    #[arg(long = "env-file")]
    pub env_files: Vec<String>,

    /// Host environment inheritance: none, allow or all.
    #[arg(long)]
    pub inherit: Option<EnvInheritMode>,

    /// Host variable to pass through with `--inherit allow`.
    #[arg(long = "env-allow")]
    pub env_allow: Vec<String>,

    /// Host variable never to pass through.
    #[arg(long = "env-deny")]
    pub env_deny: Vec<String>,

    /// Collect output and print it after the script exits.
    #[arg(long, conflicts_with = "interactive")]
    pub capture: bool,

    /// Attach the terminal to the script.
    #[arg(long)]
    pub interactive: bool,

    /// Give the container credentials to reach the host.
    #[arg(long)]
    pub host_access: bool,

    /// Port advertised to containers for host access.
    #[arg(long, default_value_t = DEFAULT_HOST_ACCESS_PORT)]
    pub host_access_port: u16,

    /// Rebuild the container image even if it is cached.
    #[arg(long)]
    pub rebuild: bool,

    /// Positional arguments passed to the script.
    #[arg(last = true)]
    pub args: Vec<String>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_owned(), v.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

fn script_value(args: &RunArgs) -> Result<String, String> {
    if let Some(file) = &args.file {
        let path = std::path::absolute(file)
            .map_err(|e| format!("cannot resolve {}: {e}", file.display()))?;
        return Ok(path.display().to_string());
    }
    args.script
        .clone()
        .ok_or_else(|| "either --script or --file is required".to_owned())
}

fn runtime_config(args: &RunArgs) -> RuntimeConfig {
    let mut rc = RuntimeConfig::new(args.runtime);
    rc.interpreter.clone_from(&args.interpreter);
    rc.image.clone_from(&args.image);
    rc.containerfile.clone_from(&args.containerfile);
    rc.volumes.clone_from(&args.volumes);
    rc.ports.clone_from(&args.ports);
    rc.enable_host_access = args.host_access;
    rc
}

pub fn build_context(
    args: &RunArgs,
    verbose: bool,
    cancel: &CancellationToken,
) -> Result<ExecutionContext, String> {
    let implementation = Implementation::new(script_value(args)?, runtime_config(args));
    let mut ctx = ExecutionContext::new(
        CommandFile::new(&args.source),
        Command::new(args.name.clone()),
        implementation,
    )
    .with_args(args.args.iter().cloned())
    .with_cancel(cancel.clone());

    ctx.workdir_override.clone_from(&args.workdir);
    ctx.inherit.mode = args.inherit;
    if !args.env_allow.is_empty() {
        ctx.inherit.allow = Some(args.env_allow.clone());
    }
    if !args.env_deny.is_empty() {
        ctx.inherit.deny = Some(args.env_deny.clone());
    }
    ctx.env.env_files.clone_from(&args.env_files);
    ctx.env.env_vars.extend(args.env.iter().cloned());
    ctx.verbose = verbose;
    ctx.force_rebuild = args.rebuild;
    Ok(ctx)
}

fn host_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "hatch".to_owned())
}

fn report(result: ExecResult) -> Result<u8, String> {
    if let Some(e) = result.error {
        return Err(e.to_string());
    }
    Ok(result.exit_code.value())
}

pub fn run(
    config: &Config,
    args: &RunArgs,
    verbose: bool,
    cancel: &CancellationToken,
) -> Result<u8, String> {
    let mut options = RegistryOptions::default();
    let server = args.host_access.then(|| {
        let server = Arc::new(LocalHostAccess::new(args.host_access_port, host_user()));
        server.start();
        server
    });
    if let Some(server) = &server {
        options.host_access = Some(Arc::clone(server) as Arc<dyn HostAccessServer>);
    }

    let built = build_registry(config, options);
    for diag in &built.diagnostics {
        debug!("{}: {}", diag.code, diag.message);
    }

    let mut ctx = build_context(args, verbose, cancel)?;
    debug!(
        "running '{}' on {} (execution {})",
        ctx.command.name, ctx.runtime, ctx.execution_id
    );

    let code = if args.interactive {
        run_interactive(&built.registry, &mut ctx)
    } else if args.capture {
        let result = built.registry.execute_capture(&mut ctx);
        print_captured(&result)?;
        report(result)
    } else {
        report(built.registry.execute(&mut ctx))
    };

    if let Some(server) = server {
        server.stop();
    }
    code
}

fn print_captured(result: &ExecResult) -> Result<(), String> {
    let mut out = std::io::stdout().lock();
    out.write_all(result.output.as_bytes())
        .and_then(|()| out.flush())
        .map_err(|e| format!("failed to write output: {e}"))?;
    let mut err = std::io::stderr().lock();
    err.write_all(result.err_output.as_bytes())
        .map_err(|e| format!("failed to write output: {e}"))
}

fn run_interactive(
    registry: &hatch_runtime::Registry,
    ctx: &mut ExecutionContext,
) -> Result<u8, String> {
    let mut prepared = registry
        .prepare_interactive(ctx)
        .map_err(|e| e.to_string())?;
    let status = prepared
        .command
        .status()
        .map_err(|e| format!("failed to start interactive session: {e}"));
    prepared.finish();
    let code = ExitCode::from_status(status?).map_err(|e| e.to_string())?;
    Ok(code.value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        run: RunArgs,
    }

    fn parse(argv: &[&str]) -> RunArgs {
        Harness::try_parse_from(std::iter::once("run").chain(argv.iter().copied()))
            .unwrap()
            .run
    }

    #[test]
    fn parses_env_pairs() {
        assert_eq!(
            parse_key_value("A=b=c").unwrap(),
            ("A".to_owned(), "b=c".to_owned())
        );
        assert!(parse_key_value("=x").is_err());
        assert!(parse_key_value("novalue").is_err());
    }

    #[test]
    fn script_or_file_is_required() {
        let err = Harness::try_parse_from(["run"]);
        assert!(err.is_err());
        let err = Harness::try_parse_from(["run", "--script", "x", "--file", "y.sh"]);
        assert!(err.is_err());
    }

    #[test]
    fn builds_context_from_flags() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("hatch.toml");
        let source = source.to_str().unwrap();
        let args = parse(&[
            "--runtime",
            "container",
            "--script",
            "echo $1",
            "--source",
            source,
            "--image",
            "alpine:3.20",
            "--env",
            "K=V",
            "--inherit",
            "allow",
            "--env-allow",
            "PATH",
            "--workdir",
            "sub",
            "--rebuild",
            "--",
            "one",
            "two",
        ]);
        let ctx = build_context(&args, true, &CancellationToken::new()).unwrap();
        assert_eq!(ctx.runtime, RuntimeKind::Container);
        assert_eq!(ctx.runtime_config().image.as_deref(), Some("alpine:3.20"));
        assert_eq!(ctx.positional_args, vec!["one".to_owned(), "two".to_owned()]);
        assert_eq!(ctx.env.env_vars.get("K").map(String::as_str), Some("V"));
        assert_eq!(ctx.inherit.mode, Some(EnvInheritMode::Allow));
        assert_eq!(ctx.inherit.allow, Some(vec!["PATH".to_owned()]));
        assert_eq!(ctx.effective_workdir(), dir.path().join("sub"));
        assert!(ctx.verbose);
        assert!(ctx.force_rebuild);
        assert_eq!(ctx.file.dir(), dir.path());
    }

    #[test]
    fn file_flag_becomes_absolute_script_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("task.sh");
        std::fs::write(&file, "echo hi\n").unwrap();
        let args = parse(&["--file", file.to_str().unwrap()]);
        let ctx = build_context(&args, false, &CancellationToken::new()).unwrap();
        assert_eq!(ctx.script().unwrap(), "echo hi\n");
    }
}
