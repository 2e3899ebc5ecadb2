use crate::cleanup::Cleanup;
use crate::context::ExecutionContext;
use crate::exit::ExecResult;
use crate::RuntimeError;
use hatch_schema::RuntimeKind;
use std::fmt;

/// One interchangeable execution strategy.
pub trait Runtime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    fn name(&self) -> &str {
        self.kind().as_str()
    }

    /// Whether this backend can run on the current system at all.
    fn available(&self) -> bool;

    /// Check a context without running anything.
    fn validate(&self, ctx: &ExecutionContext) -> Result<(), RuntimeError>;

    /// Run the script, streaming to the context's I/O sinks.
    fn execute(&self, ctx: &mut ExecutionContext) -> ExecResult;

    fn as_capture(&self) -> Option<&dyn CaptureRuntime> {
        None
    }

    fn as_interactive(&self) -> Option<&dyn InteractiveRuntime> {
        None
    }
}

/// Backends that can return stdout/stderr in the result instead of
/// streaming them.
pub trait CaptureRuntime: Runtime {
    fn execute_capture(&self, ctx: &mut ExecutionContext) -> ExecResult;
}

/// Backends that can hand back a process for the caller to attach a
/// terminal to.
pub trait InteractiveRuntime: Runtime {
    fn supports_interactive(&self) -> bool {
        true
    }

    fn prepare_interactive(
        &self,
        ctx: &mut ExecutionContext,
    ) -> Result<PreparedCommand, RuntimeError>;
}

/// A ready-to-spawn process plus the resources it depends on. The cleanup
/// runs when the value is dropped or `finish` is called, so the caller must
/// keep it alive for the whole session.
pub struct PreparedCommand {
    pub command: std::process::Command,
    cleanup: Cleanup,
}

impl PreparedCommand {
    pub fn new(command: std::process::Command, cleanup: Cleanup) -> Self {
        Self { command, cleanup }
    }

    pub fn pending_cleanups(&self) -> usize {
        self.cleanup.len()
    }

    /// Release every resource now.
    pub fn finish(self) {
        self.cleanup.run();
    }
}

impl fmt::Debug for PreparedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedCommand")
            .field("command", &self.command)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn prepared_command_cleans_up_on_finish() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut cleanup = Cleanup::new();
        let f = Arc::clone(&flag);
        cleanup.defer(move || f.store(true, Ordering::SeqCst));

        let prepared = PreparedCommand::new(std::process::Command::new("true"), cleanup);
        assert_eq!(prepared.pending_cleanups(), 1);
        assert!(!flag.load(Ordering::SeqCst));
        prepared.finish();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn prepared_command_cleans_up_on_drop() {
        let flag = Arc::new(AtomicBool::new(false));
        {
            let mut cleanup = Cleanup::new();
            let f = Arc::clone(&flag);
            cleanup.defer(move || f.store(true, Ordering::SeqCst));
            let _prepared = PreparedCommand::new(std::process::Command::new("true"), cleanup);
        }
        assert!(flag.load(Ordering::SeqCst));
    }
}
