//! Choosing and running the kind of flow a mapping needs.

use std::collections::HashSet;

use tracing::{info, instrument, warn};

use super::strategy::{FlowContext, FlowStrategy};
use crate::errors::{CodeflowError, PatchError};
use crate::models::{short_sha, LastFlows};

/// What [`flow_code`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowOutcome {
    pub had_changes: bool,
    /// The head branch was rebuilt from an earlier flow after the changes
    /// did not apply on top of it.
    pub recreated_previous_flows: bool,
    /// The flows the new one was built on, after any unwinding.
    pub last_flows: LastFlows,
}

fn is_application_failure(error: &CodeflowError) -> bool {
    matches!(error, CodeflowError::Patch(PatchError::ApplicationFailed { .. }))
}

/// A flow whose changes still do not apply once recreation gave up is a
/// conflict for the caller to resolve.
fn escalate(ctx: &FlowContext<'_>, error: CodeflowError) -> CodeflowError {
    match error {
        CodeflowError::Patch(patch_error @ PatchError::ApplicationFailed { .. }) => {
            CodeflowError::UnresolvableConflict {
                branch: ctx.current_flow.work_branch_name(),
                files: patch_error.rejected_files(),
                source: Some(Box::new(patch_error)),
            }
        }
        other => other,
    }
}

/// Flow the current commit, picking the flow kind from the direction of
/// the last flow.
///
/// When the changes of a same-direction flow no longer apply, up to
/// `max_recreation_depth` previous flows are unwound and the flow is
/// recreated on top of the oldest of them. If that fails too, the flow ends
/// with [`CodeflowError::UnresolvableConflict`].
#[instrument(skip_all, fields(direction = %strategy.direction(), mapping = %ctx.mapping.name))]
pub async fn flow_code(
    strategy: &dyn FlowStrategy,
    ctx: &FlowContext<'_>,
    last_flows: &LastFlows,
    max_recreation_depth: usize,
) -> Result<FlowOutcome, CodeflowError> {
    let last_flow = &last_flows.last_flow;
    let outcome = |had_changes: bool, recreated: bool, flows: &LastFlows| FlowOutcome {
        had_changes,
        recreated_previous_flows: recreated,
        last_flows: flows.clone(),
    };

    if last_flow.source_sha() == ctx.current_flow.source_sha() {
        info!(sha = short_sha(ctx.current_flow.source_sha()), "commit was already flown");
        return Ok(outcome(false, false, last_flows));
    }

    ctx.ensure_not_cancelled()?;
    strategy.ensure_linearity(ctx, last_flows).await?;

    if last_flow.direction != strategy.direction() {
        info!(last_flow = %last_flow, "last flow went the other way");
        let had_changes = strategy.opposite_direction_flow(ctx, last_flows).await?;
        return Ok(outcome(had_changes, false, last_flows));
    }

    let mut error = match strategy.same_direction_flow(ctx, last_flows, false).await {
        Ok(had_changes) => return Ok(outcome(had_changes, false, last_flows)),
        Err(e) if is_application_failure(&e) => e,
        Err(e) => return Err(e),
    };

    let mut flows = last_flows.clone();
    let mut visited = HashSet::from([flows.last_flow.target_sha().to_string()]);
    for depth in 1..=max_recreation_depth {
        ctx.ensure_not_cancelled()?;
        warn!(depth, error = %error, "changes do not apply on top of the last flow, recreating it");

        let Some(previous) = strategy.unwind_previous_flow(ctx, &flows).await? else {
            info!("no earlier flow to recreate from");
            break;
        };
        if !visited.insert(previous.last_flow.target_sha().to_string()) {
            warn!(flow = %previous.last_flow, "unwinding went in circles");
            break;
        }

        match strategy.same_direction_flow(ctx, &previous, true).await {
            Ok(had_changes) => {
                info!(base = %previous.last_flow, "recreated the flow");
                return Ok(outcome(had_changes, true, &previous));
            }
            Err(e) if is_application_failure(&e) => {
                error = e;
                flows = previous;
            }
            Err(e) => return Err(e),
        }
    }
    Err(escalate(ctx, error))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::git::LocalGitRepo;
    use crate::mapping::SourceMapping;
    use crate::models::{Build, Codeflow, FlowDirection};

    #[derive(Default)]
    struct MockStrategy {
        calls: Mutex<Vec<String>>,
        /// Same-direction flows fail to apply until recreated this deep.
        failing_depth: usize,
        unwind_depth: usize,
        non_linear: bool,
    }

    impl MockStrategy {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        fn record(&self, call: String) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
        }
    }

    fn application_failed() -> CodeflowError {
        PatchError::ApplicationFailed {
            patch: "runtime.patch".into(),
            output: "error: patch failed: src/runtime/a.txt:1\nerror: src/runtime/a.txt: patch does not apply".into(),
            reverse: false,
        }
        .into()
    }

    #[async_trait]
    impl FlowStrategy for MockStrategy {
        fn direction(&self) -> FlowDirection {
            FlowDirection::Forward
        }

        async fn detect_crossing_flow(
            &self,
            _ctx: &FlowContext<'_>,
            _last_flow: &Codeflow,
            _last_backflow: Option<&Codeflow>,
            _last_forward_flow: &Codeflow,
        ) -> Result<Option<Codeflow>, CodeflowError> {
            Ok(None)
        }

        async fn ensure_linearity(&self, _ctx: &FlowContext<'_>, last_flows: &LastFlows) -> Result<(), CodeflowError> {
            if self.non_linear {
                return Err(CodeflowError::NonLinearCodeflow {
                    last_sha: last_flows.last_forward_flow.repo_sha.clone(),
                    current_sha: "x".into(),
                });
            }
            Ok(())
        }

        async fn same_direction_flow(
            &self,
            _ctx: &FlowContext<'_>,
            last_flows: &LastFlows,
            recreate: bool,
        ) -> Result<bool, CodeflowError> {
            self.record(format!("same:{}:{recreate}", last_flows.last_flow.repo_sha));
            let depth = self.calls().iter().filter(|c| c.starts_with("unwind")).count();
            if depth < self.failing_depth {
                return Err(application_failed());
            }
            Ok(true)
        }

        async fn opposite_direction_flow(&self, _ctx: &FlowContext<'_>, _last_flows: &LastFlows) -> Result<bool, CodeflowError> {
            self.record("opposite".into());
            Ok(true)
        }

        async fn unwind_previous_flow(
            &self,
            _ctx: &FlowContext<'_>,
            last_flows: &LastFlows,
        ) -> Result<Option<LastFlows>, CodeflowError> {
            let depth = self.calls().iter().filter(|c| c.starts_with("unwind")).count();
            self.record(format!("unwind:{}", last_flows.last_flow.repo_sha));
            if depth >= self.unwind_depth {
                return Ok(None);
            }
            let previous = Codeflow::forward(format!("repo{depth}"), format!("vmr{depth}"));
            Ok(Some(LastFlows {
                last_flow: previous.clone(),
                last_backflow: None,
                last_forward_flow: previous,
                crossing_flow: None,
            }))
        }
    }

    struct Fixture {
        mapping: SourceMapping,
        vmr: LocalGitRepo,
        repo: LocalGitRepo,
        build: Build,
        current: Codeflow,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                mapping: SourceMapping::new("runtime", "https://github.com/dotnet/runtime"),
                vmr: LocalGitRepo::new("/nonexistent/vmr"),
                repo: LocalGitRepo::new("/nonexistent/runtime"),
                build: Build {
                    id: 1,
                    commit: "current".into(),
                    repository: "https://github.com/dotnet/runtime".into(),
                    build_number: "1".into(),
                    package_version: None,
                    assets: Vec::new(),
                },
                current: Codeflow::forward("current", "vmr-head"),
                cancel: CancellationToken::new(),
            }
        }

        fn ctx(&self) -> FlowContext<'_> {
            FlowContext {
                mapping: &self.mapping,
                vmr: &self.vmr,
                repo: &self.repo,
                build: &self.build,
                current_flow: &self.current,
                target_branch: "main",
                head_branch: "main",
                cancel: &self.cancel,
            }
        }
    }

    fn forward_flows(repo_sha: &str) -> LastFlows {
        let flow = Codeflow::forward(repo_sha, "vmr-last");
        LastFlows {
            last_flow: flow.clone(),
            last_backflow: None,
            last_forward_flow: flow,
            crossing_flow: None,
        }
    }

    #[tokio::test]
    async fn test_already_flown_commit_is_a_no_op() {
        let fixture = Fixture::new();
        let strategy = MockStrategy::default();
        let outcome = flow_code(&strategy, &fixture.ctx(), &forward_flows("current"), 1).await.unwrap();
        assert!(!outcome.had_changes);
        assert!(strategy.calls().is_empty());
    }

    #[tokio::test]
    async fn test_flow_kind_follows_last_direction() {
        let fixture = Fixture::new();
        let strategy = MockStrategy::default();
        let outcome = flow_code(&strategy, &fixture.ctx(), &forward_flows("last"), 1).await.unwrap();
        assert!(outcome.had_changes);
        assert!(!outcome.recreated_previous_flows);
        assert_eq!(strategy.calls(), vec!["same:last:false".to_string()]);

        let strategy = MockStrategy::default();
        let backflow = Codeflow::backflow("vmr-last", "repo-last");
        let flows = LastFlows {
            last_flow: backflow.clone(),
            last_backflow: Some(backflow),
            last_forward_flow: Codeflow::forward("older", "vmr-older"),
            crossing_flow: None,
        };
        flow_code(&strategy, &fixture.ctx(), &flows, 1).await.unwrap();
        assert_eq!(strategy.calls(), vec!["opposite".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_flow_is_recreated() {
        let fixture = Fixture::new();
        let strategy = MockStrategy {
            failing_depth: 1,
            unwind_depth: 1,
            ..MockStrategy::default()
        };
        let outcome = flow_code(&strategy, &fixture.ctx(), &forward_flows("last"), 1).await.unwrap();
        assert!(outcome.recreated_previous_flows);
        assert_eq!(outcome.last_flows.last_flow.repo_sha, "repo0");
        assert_eq!(
            strategy.calls(),
            vec!["same:last:false".to_string(), "unwind:last".into(), "same:repo0:true".into()]
        );
    }

    #[tokio::test]
    async fn test_recreation_is_bounded() {
        let fixture = Fixture::new();
        let strategy = MockStrategy {
            failing_depth: 5,
            unwind_depth: 5,
            ..MockStrategy::default()
        };
        let err = flow_code(&strategy, &fixture.ctx(), &forward_flows("last"), 2).await.unwrap_err();
        assert!(matches!(err, CodeflowError::UnresolvableConflict { .. }), "{err:?}");
        assert_eq!(strategy.calls().iter().filter(|c| c.starts_with("unwind")).count(), 2);
    }

    #[tokio::test]
    async fn test_failed_recreation_is_an_unresolvable_conflict() {
        let fixture = Fixture::new();
        let strategy = MockStrategy {
            failing_depth: 5,
            unwind_depth: 5,
            ..MockStrategy::default()
        };
        let err = flow_code(&strategy, &fixture.ctx(), &forward_flows("last"), 1).await.unwrap_err();
        match err {
            CodeflowError::UnresolvableConflict { branch, files, source } => {
                assert_eq!(branch, fixture.current.work_branch_name());
                assert_eq!(files, vec!["src/runtime/a.txt"]);
                let source = source.map(|s| s.to_string()).unwrap_or_default();
                assert!(source.contains("patch does not apply"), "{source}");
            }
            other => panic!("expected an unresolvable conflict, got {other:?}"),
        }
        assert_eq!(
            strategy.calls(),
            vec!["same:last:false".to_string(), "unwind:last".into(), "same:repo0:true".into()]
        );
    }

    #[tokio::test]
    async fn test_nothing_to_unwind_is_an_unresolvable_conflict() {
        let fixture = Fixture::new();
        let strategy = MockStrategy {
            failing_depth: 1,
            ..MockStrategy::default()
        };
        let err = flow_code(&strategy, &fixture.ctx(), &forward_flows("last"), 1).await.unwrap_err();
        assert!(matches!(err, CodeflowError::UnresolvableConflict { source: Some(_), .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_non_linear_flow_is_rejected() {
        let fixture = Fixture::new();
        let strategy = MockStrategy {
            non_linear: true,
            ..MockStrategy::default()
        };
        let err = flow_code(&strategy, &fixture.ctx(), &forward_flows("last"), 1).await.unwrap_err();
        assert!(matches!(err, CodeflowError::NonLinearCodeflow { .. }));
        assert!(strategy.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_flow_stops() {
        let fixture = Fixture::new();
        fixture.cancel.cancel();
        let strategy = MockStrategy::default();
        let err = flow_code(&strategy, &fixture.ctx(), &forward_flows("last"), 1).await.unwrap_err();
        assert!(err.is_cancellation());
    }
}
