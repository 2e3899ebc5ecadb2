mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::run::RunArgs;
use commands::EXIT_FAILURE;
use hatch_runtime::CancellationToken;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "hatch",
    version,
    about = "Run declared scripts on the host shell, an embedded shell, or a container"
)]
struct Cli {
    /// Path to the config file (default: ~/.config/hatch/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging and build/provision progress.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a script on the native, virtual or container runtime.
    Run(Box<RunArgs>),
    /// List runtimes and whether they can be used on this system.
    Runtimes,
    /// Remove the container image cached for a command file.
    ImageClean {
        /// Command-source file the image was built for.
        #[arg(long, default_value = "hatch.toml")]
        source: PathBuf,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
    /// Run a serialized virtual-runtime invocation (used for interactive mode).
    #[command(name = "__exec-virtual", hide = true)]
    ExecVirtual {
        #[arg(long)]
        invocation: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("HATCH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    commands::install_cancel_handler(&cancel);

    let config_path = cli.config.as_deref();
    let result = match cli.command {
        Commands::Run(args) => commands::load_config(config_path)
            .and_then(|config| commands::run::run(&config, &args, cli.verbose, &cancel)),
        Commands::Runtimes => commands::load_config(config_path)
            .and_then(|config| commands::runtimes::run(&config, cli.json)),
        Commands::ImageClean { source } => commands::load_config(config_path)
            .and_then(|config| commands::image_clean::run(&config, &source)),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
        Commands::ExecVirtual { invocation } => commands::exec_virtual::run(&invocation, &cancel),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
