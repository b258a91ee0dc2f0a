//! Retry controller: sequences the gates, the sandbox and normalization for
//! one request, bounded by an iteration budget.
//!
//! Every stage returns a [`StepOutcome`]. `Continue` moves to the next stage
//! of the same iteration, `Retry` abandons the iteration and feeds the failure
//! to the regenerator, and `Done` ends the request.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::cancel::{CancelScope, CancelToken};
use crate::core::budget::IterationBudget;
use crate::core::normalize::{normalize_table, normalize_value};
use crate::core::outcome::{ErrorKind, ExecutionOutcome, Failure, Success};
use crate::core::path::{PathResolver, strip_marker_lines};
use crate::core::safety::SafetyGate;
use crate::core::structure::StructuralValidator;
use crate::core::types::{
    CodeSubmission, DataContext, RESULT_DF, RESULT_VALUE, ReviewState, StepOutcome,
};
use crate::io::config::PipelineConfig;
use crate::io::regenerator::{CommandRegenerator, RegenerateRequest, Regenerator, Resubmit};
use crate::sandbox::{self, Bindings, Sandbox, SandboxRequest, SandboxRun};

/// Stages of one iteration, in execution order, plus the retry hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    SafetyCheck,
    StructuralCheck,
    Execute,
    Evaluate,
    Retry,
}

impl Stage {
    pub const ITERATION: [Stage; 5] = [
        Stage::Init,
        Stage::SafetyCheck,
        Stage::StructuralCheck,
        Stage::Execute,
        Stage::Evaluate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::SafetyCheck => "safety_check",
            Stage::StructuralCheck => "structural_check",
            Stage::Execute => "execute",
            Stage::Evaluate => "evaluate",
            Stage::Retry => "retry",
        }
    }
}

/// Per-request state threaded through the stages.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub budget: IterationBudget,
    /// Current iteration (1-based); 0 before the first `Init`.
    pub iteration: u32,
    pub submission: CodeSubmission,
    pub data: DataContext,
    pub review: ReviewState,
    pub data_path: Option<PathBuf>,
    /// Raw result of this iteration's sandbox run, consumed by `Evaluate`.
    pub run: Option<SandboxRun>,
    /// Most recent retryable failure.
    pub last_failure: Option<Failure>,
    pub executions: u32,
}

impl PipelineContext {
    pub fn new(submission: CodeSubmission, data: DataContext, max_iterations: u32) -> Self {
        Self {
            budget: IterationBudget::new(max_iterations),
            iteration: 0,
            submission,
            data,
            review: ReviewState::Pending,
            data_path: None,
            run: None,
            last_failure: None,
            executions: 0,
        }
    }
}

/// What happened in one iteration, handed to the observer callback.
#[derive(Debug, Clone)]
pub struct IterationReport<'a> {
    pub iteration: u32,
    /// Last stage the iteration reached.
    pub stage: Stage,
    /// Whether the sandbox ran during this iteration.
    pub executed: bool,
    /// `Retry(feedback)` or `Done(outcome)`.
    pub step: &'a StepOutcome,
}

/// Final result of a request plus counters for callers and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub outcome: ExecutionOutcome,
    pub iterations: u32,
    pub executions: u32,
}

pub struct RetryController<'c, S, R> {
    config: &'c PipelineConfig,
    data_root: PathBuf,
    safety: SafetyGate,
    structure: StructuralValidator,
    sandbox: S,
    regenerator: R,
}

impl<'c, S: Sandbox, R: Regenerator> RetryController<'c, S, R> {
    pub fn new(config: &'c PipelineConfig, sandbox: S, regenerator: R) -> Result<Self> {
        config.validate()?;
        let data_root = config.resolved_data_root()?;
        let structure =
            StructuralValidator::new(&config.data_handle, config.require_data_handle)
                .context("build structural validator")?;
        Ok(Self {
            config,
            data_root,
            safety: SafetyGate::new(&config.disallowed_patterns),
            structure,
            sandbox,
            regenerator,
        })
    }

    /// Run one request to completion.
    ///
    /// `Err` only for infrastructure failures; every failure the submitted
    /// code can cause ends up in the returned outcome.
    #[instrument(skip_all, fields(max_iterations = self.config.max_iterations, backend = ?self.config.backend))]
    pub fn run<F: FnMut(&IterationReport<'_>)>(
        &mut self,
        submission: CodeSubmission,
        data: DataContext,
        token: &CancelToken,
        mut on_iteration: F,
    ) -> Result<RunSummary> {
        info!("pipeline request started");
        let mut ctx = PipelineContext::new(submission, data, self.config.max_iterations);

        let outcome = loop {
            if token.is_cancelled() {
                break cancelled();
            }
            let executions_before = ctx.executions;
            let (stage, step) = self.run_iteration(&mut ctx, token)?;
            on_iteration(&IterationReport {
                iteration: ctx.iteration,
                stage,
                executed: ctx.executions > executions_before,
                step: &step,
            });
            match step {
                StepOutcome::Done(outcome) => break outcome,
                StepOutcome::Retry(failure) => {
                    warn!(
                        iteration = ctx.iteration,
                        error_type = failure.kind.as_str(),
                        message = %failure.message,
                        "iteration failed"
                    );
                    ctx.last_failure = Some(failure);
                    match self.step(Stage::Retry, &mut ctx, token)? {
                        StepOutcome::Continue => continue,
                        StepOutcome::Done(outcome) => break outcome,
                        StepOutcome::Retry(_) => {
                            return Err(anyhow!("retry stage cannot request another retry"));
                        }
                    }
                }
                StepOutcome::Continue => {
                    return Err(anyhow!("iteration ended without a verdict"));
                }
            }
        };

        info!(
            iterations = ctx.budget.used(),
            executions = ctx.executions,
            success = outcome.is_success(),
            "pipeline request finished"
        );
        Ok(RunSummary {
            outcome,
            iterations: ctx.budget.used(),
            executions: ctx.executions,
        })
    }

    /// Run the iteration stages until one of them returns `Retry` or `Done`.
    fn run_iteration(
        &mut self,
        ctx: &mut PipelineContext,
        token: &CancelToken,
    ) -> Result<(Stage, StepOutcome)> {
        for stage in Stage::ITERATION {
            let step = self.step(stage, ctx, token)?;
            debug!(iteration = ctx.iteration, stage = stage.as_str(), ?step, "stage finished");
            if step != StepOutcome::Continue {
                return Ok((stage, step));
            }
        }
        Err(anyhow!("evaluate stage produced no verdict"))
    }

    fn step(
        &mut self,
        stage: Stage,
        ctx: &mut PipelineContext,
        token: &CancelToken,
    ) -> Result<StepOutcome> {
        match stage {
            Stage::Init => Ok(self.init(ctx)),
            Stage::SafetyCheck => {
                let verdict = self.safety.review(&ctx.submission.text);
                Ok(self.fold_review(ctx, verdict, ErrorKind::SafetyViolation))
            }
            Stage::StructuralCheck => {
                let verdict = self.structure.review(&ctx.submission);
                Ok(self.fold_review(ctx, verdict, ErrorKind::StructuralDefect))
            }
            Stage::Execute => self.execute(ctx, token),
            Stage::Evaluate => Ok(self.evaluate(ctx)),
            Stage::Retry => self.retry(ctx, token),
        }
    }

    fn init(&self, ctx: &mut PipelineContext) -> StepOutcome {
        let Some(iteration) = ctx.budget.try_consume() else {
            return StepOutcome::Done(exhausted(ctx));
        };
        ctx.iteration = iteration;
        ctx.review = ReviewState::Pending;
        ctx.run = None;
        debug!(iteration, remaining = ctx.budget.remaining(), "iteration started");

        let resolver = PathResolver::new(&self.data_root, &self.config.path_marker);
        let path = match resolver.resolve(&ctx.data, &ctx.submission) {
            Ok(path) => path,
            Err(failure) => return settle(failure),
        };
        if !path.is_file() {
            return settle(Failure::new(
                ErrorKind::MissingDataPath,
                format!("data file not found: {}", path.display()),
            ));
        }
        ctx.data_path = Some(path);
        StepOutcome::Continue
    }

    fn fold_review(
        &self,
        ctx: &mut PipelineContext,
        verdict: ReviewState,
        kind: ErrorKind,
    ) -> StepOutcome {
        ctx.review = std::mem::take(&mut ctx.review).then(verdict);
        match ctx.review.revision_reason() {
            Some(reason) => settle(Failure::new(kind, reason)),
            None => StepOutcome::Continue,
        }
    }

    fn execute(&mut self, ctx: &mut PipelineContext, token: &CancelToken) -> Result<StepOutcome> {
        if !ctx.review.is_approved() {
            return Err(anyhow!("execute stage reached without an approved review"));
        }
        if token.is_cancelled() {
            return Ok(StepOutcome::Done(cancelled()));
        }
        let data_path = ctx
            .data_path
            .clone()
            .ok_or_else(|| anyhow!("execute stage reached without a data path"))?;
        let request = SandboxRequest {
            code: strip_marker_lines(&ctx.submission.text, &self.config.path_marker),
            data_path,
            data_handle: self.config.data_handle.clone(),
            output_limit_bytes: self.config.output_limit_bytes,
        };
        let scope = CancelScope::new(token, Some(self.config.timeout()));
        ctx.executions += 1;
        let run = self
            .sandbox
            .execute(&request, &scope)
            .with_context(|| format!("sandbox run for iteration {}", ctx.iteration))?;
        ctx.run = Some(run);
        Ok(StepOutcome::Continue)
    }

    fn evaluate(&self, ctx: &mut PipelineContext) -> StepOutcome {
        let Some(run) = ctx.run.take() else {
            return settle(Failure::new(ErrorKind::RuntimeFault, "sandbox produced no result"));
        };
        let failure = match run {
            SandboxRun::Completed {
                bindings,
                output,
                charts,
            } => match normalize_bindings(&bindings) {
                Ok(success) if !success.has_result() && self.config.require_result => {
                    Failure::new(
                        ErrorKind::StructuralDefect,
                        format!("code ran but bound neither `{RESULT_VALUE}` nor `{RESULT_DF}`"),
                    )
                }
                Ok(success) => {
                    return StepOutcome::Done(ExecutionOutcome::Success(Success {
                        stdout: Some(output.stdout),
                        stderr: Some(output.stderr),
                        charts,
                        ..success
                    }));
                }
                Err(failure) => failure,
            },
            SandboxRun::Faulted {
                exception, message, ..
            } => Failure::runtime_fault(exception, message),
            SandboxRun::TimedOut { .. } => Failure::new(
                ErrorKind::Timeout,
                format!("execution exceeded the {}s time limit", self.config.timeout_secs),
            ),
            SandboxRun::Cancelled => cancelled_failure(),
            SandboxRun::MissingDataPath { message } => {
                Failure::new(ErrorKind::MissingDataPath, message)
            }
        };
        settle(failure)
    }

    fn retry(&mut self, ctx: &mut PipelineContext, token: &CancelToken) -> Result<StepOutcome> {
        if ctx.budget.is_exhausted() {
            return Ok(StepOutcome::Done(exhausted(ctx)));
        }
        if token.is_cancelled() {
            return Ok(StepOutcome::Done(cancelled()));
        }
        let Some(feedback) = ctx.last_failure.as_ref() else {
            return Err(anyhow!("retry stage reached without a failure"));
        };
        let next = self.regenerator.regenerate(
            &RegenerateRequest {
                iteration: ctx.iteration,
                previous: &ctx.submission,
                feedback,
                data: &ctx.data,
                data_handle: &self.config.data_handle,
            },
            token,
        )?;
        match next {
            Some(submission) => {
                ctx.submission = submission;
                Ok(StepOutcome::Continue)
            }
            None if token.is_cancelled() => Ok(StepOutcome::Done(cancelled())),
            None => {
                info!(iteration = ctx.iteration, "regenerator declined to retry");
                Ok(StepOutcome::Done(ExecutionOutcome::Failure(feedback.clone())))
            }
        }
    }
}

fn normalize_bindings(bindings: &Bindings) -> Result<Success, Failure> {
    let value = bindings
        .value
        .as_ref()
        .map(|value| normalize_value(value, RESULT_VALUE))
        .transpose()?;
    let table = bindings
        .table
        .as_ref()
        .map(|table| normalize_table(table, RESULT_DF))
        .transpose()?;
    Ok(Success {
        value,
        table,
        ..Success::default()
    })
}

fn exhausted(ctx: &PipelineContext) -> ExecutionOutcome {
    ExecutionOutcome::Failure(Failure::budget_exhausted(
        ctx.budget.used(),
        ctx.last_failure.clone(),
    ))
}

/// Retry what another attempt could fix; end the request on the rest.
fn settle(failure: Failure) -> StepOutcome {
    if failure.kind.is_retryable() {
        StepOutcome::Retry(failure)
    } else {
        StepOutcome::Done(ExecutionOutcome::Failure(failure))
    }
}

fn cancelled_failure() -> Failure {
    Failure::new(ErrorKind::Cancelled, "request cancelled by caller")
}

fn cancelled() -> ExecutionOutcome {
    ExecutionOutcome::Failure(cancelled_failure())
}

/// Run one request with the configured backend and regenerator.
///
/// Without a regenerator command, failed iterations resubmit the same code.
pub fn run_pipeline(
    submission: CodeSubmission,
    data: DataContext,
    config: &PipelineConfig,
) -> Result<ExecutionOutcome> {
    run_pipeline_with_token(submission, data, config, &CancelToken::new())
}

/// Like [`run_pipeline`], abortable through `token`.
pub fn run_pipeline_with_token(
    submission: CodeSubmission,
    data: DataContext,
    config: &PipelineConfig,
    token: &CancelToken,
) -> Result<ExecutionOutcome> {
    let sandbox = sandbox::from_config(config);
    let regenerator: Box<dyn Regenerator> =
        match CommandRegenerator::from_config(&config.regenerator) {
            Some(command) => Box::new(command),
            None => Box::new(Resubmit),
        };
    let mut controller = RetryController::new(config, sandbox, regenerator)?;
    let summary = controller.run(submission, data, token, |_| {})?;
    Ok(summary.outcome)
}
