use super::EXIT_SUCCESS;
use hatch_runtime::{build_registry, Config, ExecutionContext, RegistryOptions};
use hatch_schema::{Command, CommandFile, Implementation, RuntimeConfig, RuntimeKind};
use std::path::Path;

pub fn run(config: &Config, source: &Path) -> Result<u8, String> {
    let built = build_registry(config, RegistryOptions::default());
    let Some(container) = built.container else {
        let reason = built
            .diagnostics
            .first()
            .map_or_else(|| "no container engine".to_owned(), |d| d.message.clone());
        return Err(format!("container runtime unavailable: {reason}"));
    };
    let ctx = ExecutionContext::new(
        CommandFile::new(source),
        Command::new("image-clean"),
        Implementation::new("true", RuntimeConfig::new(RuntimeKind::Container)),
    );
    container.cleanup_image(&ctx).map_err(|e| e.to_string())?;
    println!("removed image for {}", ctx.file.absolute_path().display());
    Ok(EXIT_SUCCESS)
}
