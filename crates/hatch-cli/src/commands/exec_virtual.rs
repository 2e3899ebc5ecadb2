use hatch_runtime::virtual_runtime::run_invocation;
use hatch_runtime::CancellationToken;
use std::path::Path;

pub fn run(invocation: &Path, cancel: &CancellationToken) -> Result<u8, String> {
    let result = run_invocation(invocation, cancel);
    if let Some(e) = result.error {
        return Err(e.to_string());
    }
    Ok(result.exit_code.value())
}
