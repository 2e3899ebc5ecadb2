//! End-to-end container runs against whichever engine the host provides.
//!
//! Each test returns early when neither podman nor docker is usable.

#![cfg(unix)]

use hatch_runtime::container::cli::select_engine;
use hatch_runtime::container::engine::ContainerEngine;
use hatch_runtime::{
    CaptureRuntime, ContainerRuntime, EnginePreference, ExecutionContext, ExitCode, NoopRunGate,
};
use hatch_schema::{Command, CommandFile, Implementation, RuntimeConfig, RuntimeKind};
use std::path::Path;
use std::sync::Arc;

const IMAGE: &str = "alpine:3.20";

fn engine() -> Option<Arc<dyn ContainerEngine>> {
    match select_engine(EnginePreference::default()) {
        Ok(engine) if engine.available() => Some(Arc::from(engine)),
        Ok(_) | Err(_) => {
            eprintln!("no container engine available, skipping");
            None
        }
    }
}

fn runtime(engine: Arc<dyn ContainerEngine>, cache: &Path) -> ContainerRuntime {
    ContainerRuntime::new(engine)
        .with_gate(Arc::new(NoopRunGate))
        .with_cache_dir(cache)
}

fn ctx(dir: &Path, script: &str) -> ExecutionContext {
    let mut rc = RuntimeConfig::new(RuntimeKind::Container);
    rc.image = Some(IMAGE.to_owned());
    ExecutionContext::new(
        CommandFile::new(dir.join("hatch.toml")),
        Command::new("demo"),
        Implementation::new(script, rc),
    )
}

#[test]
fn real_engine_echo() {
    let Some(engine) = engine() else { return };
    let source = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let rt = runtime(engine, cache.path());

    let mut c = ctx(source.path(), "echo 'Hello'");
    let result = rt.execute_capture(&mut c);
    assert!(result.is_success(), "{result:?}");
    assert_eq!(result.output, "Hello\n");
}

#[test]
fn real_engine_exit_code() {
    let Some(engine) = engine() else { return };
    let source = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let rt = runtime(engine, cache.path());

    let mut c = ctx(source.path(), "exit 42");
    let result = rt.execute_capture(&mut c);
    assert!(result.error.is_none(), "{result:?}");
    assert_eq!(result.exit_code, ExitCode::from(42));
}

#[test]
fn real_engine_positional_arguments() {
    let Some(engine) = engine() else { return };
    let source = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let rt = runtime(engine, cache.path());

    let mut c = ctx(source.path(), r#"echo "$1 $2 $#""#).with_args(["hello", "world"]);
    let result = rt.execute_capture(&mut c);
    assert!(result.is_success(), "{result:?}");
    assert_eq!(result.output, "hello world 2\n");
}
