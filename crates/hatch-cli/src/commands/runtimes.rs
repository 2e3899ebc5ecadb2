use super::{colorize_availability, json_pretty, EXIT_SUCCESS};
use hatch_runtime::{build_registry, Config, RegistryOptions};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct RuntimeRow {
    name: String,
    available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Debug, Serialize)]
struct DiagnosticRow {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct Report {
    runtimes: Vec<RuntimeRow>,
    diagnostics: Vec<DiagnosticRow>,
}

pub fn run(config: &Config, json: bool) -> Result<u8, String> {
    let built = build_registry(config, RegistryOptions::default());
    let available = built.registry.available();

    let engine_detail = built.container.as_ref().map(|c| {
        let engine = c.engine();
        match engine.version() {
            Ok(v) => format!("{} {v}", engine.name()),
            Err(_) => engine.name().to_owned(),
        }
    });

    let runtimes = built
        .registry
        .names()
        .into_iter()
        .map(|name| RuntimeRow {
            available: available.contains(&name),
            detail: (name == "container").then(|| engine_detail.clone()).flatten(),
            name,
        })
        .collect();
    let report = Report {
        runtimes,
        diagnostics: built
            .diagnostics
            .into_iter()
            .map(|d| DiagnosticRow {
                code: d.code,
                message: d.message,
            })
            .collect(),
    };

    if json {
        println!("{}", json_pretty(&report)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("{:<12} {:<12} DETAIL", "RUNTIME", "STATUS");
    for row in &report.runtimes {
        println!(
            "{:<12} {:<12} {}",
            row.name,
            colorize_availability(row.available),
            row.detail.as_deref().unwrap_or("")
        );
    }
    for diag in &report.diagnostics {
        println!("{}: {}", diag.code, diag.message);
    }
    Ok(EXIT_SUCCESS)
}
