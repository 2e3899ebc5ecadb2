//! Retrying container runs that fail inside the engine.
//!
//! Exit codes 125 and 126 come from the engine, not from the script. Those
//! attempts are retried with exponential backoff and their stderr is thrown
//! away: only the attempt whose result is returned writes to the caller's
//! stderr.

use super::engine::{ContainerEngine, RunIo, RunOptions, RunResult};
use crate::cancel::CancellationToken;
use crate::gate::{RunGate, RunGateGuard};
use crate::io::{IoStreams, OutputSink, SharedBuffer};
use crate::RuntimeError;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }

    /// Delay after the `failures`-th failed attempt: `base * 2^(failures-1)`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1 << exp)
    }
}

/// Run `opts` until an attempt produces a non-transient outcome or the
/// policy is exhausted.
///
/// Before each attempt the gate is taken if the engine exposes the sysctl
/// capability and currently reports the override inactive. Cancellation during a
/// backoff returns immediately with [`RuntimeError::Cancelled`].
pub fn run_with_retry(
    engine: &dyn ContainerEngine,
    opts: &RunOptions,
    io: &mut IoStreams,
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    gate: &dyn RunGate,
) -> Result<RunResult, RuntimeError> {
    let max_attempts = policy.max_attempts.max(1);

    let mut attempt = 0;
    loop {
        attempt += 1;
        let last = attempt >= max_attempts;
        let serialize = engine
            .sysctl_override()
            .is_some_and(|c| !c.sysctl_override_active());
        let (mut stderr, buffer) = OutputSink::buffer();

        let outcome = {
            let _guard = if serialize {
                debug!("serializing container run (attempt {attempt})");
                gate.acquire()?
            } else {
                RunGateGuard::none()
            };
            engine.run(
                opts,
                RunIo {
                    stdin: &io.stdin,
                    stdout: &mut io.stdout,
                    stderr: &mut stderr,
                },
                cancel,
            )
        };

        match outcome {
            Ok(result) if result.exit_code.is_transient() && !last => {
                debug!(
                    "{} exited with transient code {} (attempt {attempt}/{max_attempts})",
                    engine.name(),
                    result.exit_code
                );
            }
            Err(e) if e.is_transient() && !last => {
                debug!("transient engine error (attempt {attempt}/{max_attempts}): {e}");
            }
            Ok(result) => {
                if result.exit_code.is_transient() {
                    warn!(
                        "{} still failing with code {} after {attempt} attempts",
                        engine.name(),
                        result.exit_code
                    );
                }
                flush(&buffer, &mut io.stderr);
                return Ok(result);
            }
            Err(e) => {
                flush(&buffer, &mut io.stderr);
                return Err(e.into());
            }
        }

        if cancel.wait_timeout(policy.backoff(attempt)) {
            return Err(RuntimeError::Cancelled(
                "context cancelled while waiting to retry container run".to_owned(),
            ));
        }
    }
}

fn flush(buffer: &SharedBuffer, to: &mut OutputSink) {
    let contents = buffer.contents();
    if !contents.is_empty() {
        let _ = to.write_all(&contents);
        let _ = to.flush();
    }
}
