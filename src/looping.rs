//! The convergence loop: run iterations until the work is done, the
//! iteration cap is hit, or an error halts the run.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::io::agent::Agent;
use crate::io::gates::{GateReport, GateRunner};
use crate::iteration::{IterationContext, IterationOutcome, run_iteration};

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// Every task is done (or the agent declared the run complete).
    Complete,
    /// The iteration cap was reached with work remaining.
    MaxIterations,
    /// An iteration failed and the run was not in human-in-the-loop mode.
    Halted,
}

/// Final accounting for a run.
#[derive(Debug)]
pub struct LoopOutcome {
    pub stop: LoopStop,
    /// Iterations that actually ran (interrupted retries count once).
    pub iterations: u32,
    /// Gate report from the last completed iteration, if any.
    pub last_report: Option<GateReport>,
}

/// Drive the loop to completion.
///
/// In human-in-the-loop mode the operator confirms before every iteration
/// after the first; replies starting with `!` become interventions for the
/// upcoming prompt, and iteration errors pause for the next confirmation
/// instead of halting.
#[instrument(skip_all, fields(max_iterations = ctx.config.max_iterations, hitl = ctx.config.hitl))]
pub fn run_loop<A: Agent, G: GateRunner>(
    ctx: &IterationContext<'_, A, G>,
) -> Result<LoopOutcome> {
    let max_iterations = ctx.config.max_iterations;
    let mut prior_report: Option<GateReport> = None;
    let mut iteration: u32 = 0;

    loop {
        if iteration >= max_iterations {
            info!(iterations = iteration, "iteration cap reached");
            return Ok(LoopOutcome {
                stop: LoopStop::MaxIterations,
                iterations: iteration,
                last_report: prior_report,
            });
        }

        if ctx.config.hitl && iteration > 0 {
            let line = ctx
                .channel
                .request_line(&format!("iteration {} done, continue? [Y/n/!msg] ", iteration))?;
            let reply = line.trim();
            if reply.eq_ignore_ascii_case("n") || reply.eq_ignore_ascii_case("no") {
                info!("operator stopped the run");
                return Ok(LoopOutcome {
                    stop: LoopStop::Halted,
                    iterations: iteration,
                    last_report: prior_report,
                });
            }
            if let Some(message) = reply.strip_prefix('!') {
                let message = message.trim();
                if !message.is_empty() {
                    ctx.channel
                        .store(crate::intervene::Intervention::new(message));
                }
            }
        }

        let number = iteration + 1;
        info!(iteration = number, "starting iteration");
        match run_iteration(ctx, number, prior_report.as_ref()) {
            Ok(IterationOutcome::AlreadyComplete) => {
                return Ok(LoopOutcome {
                    stop: LoopStop::Complete,
                    iterations: iteration,
                    last_report: prior_report,
                });
            }
            Ok(IterationOutcome::Completed {
                run_complete,
                report,
            }) => {
                iteration = number;
                prior_report = Some(report);
                if run_complete {
                    return Ok(LoopOutcome {
                        stop: LoopStop::Complete,
                        iterations: iteration,
                        last_report: prior_report,
                    });
                }
            }
            // Retry under the same number with the captured message queued.
            Ok(IterationOutcome::Interrupted) => {
                info!(iteration = number, "iteration interrupted, retrying");
            }
            Err(e) => {
                if ctx.config.hitl {
                    warn!(err = %e, "iteration failed, pausing for operator");
                    iteration = number;
                } else {
                    warn!(err = %e, "iteration failed, halting");
                    return Err(e);
                }
            }
        }
    }
}
