//! Reconstructing the last flows of a mapping from git history.
//!
//! The last forward flow is found through the source manifest in the VMR,
//! the last backflow through the `Source` element of the repository's
//! `Version.Details.xml`. In both cases the other side of the flow is the
//! commit that last changed the recording line.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::CodeflowConfig;
use crate::errors::{CodeflowError, ManifestError};
use crate::git::{GitObjectType, LocalGitRepo};
use crate::manifest::SourceManifest;
use crate::models::{short_sha, Codeflow, LastFlows};
use crate::version_files::{VersionDetails, VERSION_DETAILS_XML};

const SOURCE_ELEMENT: &str = "<Source";

pub struct LastFlowResolver {
    config: Arc<CodeflowConfig>,
}

impl LastFlowResolver {
    pub fn new(config: Arc<CodeflowConfig>) -> Self {
        Self { config }
    }

    /// The forward flow recorded in the source manifest at `vmr_ref`.
    pub async fn last_forward_flow(
        &self,
        vmr: &LocalGitRepo,
        vmr_ref: &str,
        mapping: &str,
    ) -> Result<Option<Codeflow>, CodeflowError> {
        let path = self.config.vmr.source_manifest.as_str();
        let Some(content) = vmr.file_at_ref(path, vmr_ref)? else {
            return Ok(None);
        };
        let manifest = SourceManifest::parse(&content)?;
        let Some(record) = manifest.repository(mapping) else {
            return Ok(None);
        };

        let repo_sha = record.commit_sha.clone();
        let vmr_sha = vmr
            .blame_line(path, |line| line.contains(repo_sha.as_str()), Some(vmr_ref))
            .await?;
        Ok(Some(Codeflow::forward(repo_sha, vmr_sha)))
    }

    /// The backflow recorded in the repository's `Version.Details.xml` at
    /// `repo_ref`.
    pub async fn last_backflow(&self, repo: &LocalGitRepo, repo_ref: &str) -> Result<Option<Codeflow>, CodeflowError> {
        let Some(content) = repo.file_at_ref(VERSION_DETAILS_XML, repo_ref)? else {
            return Ok(None);
        };
        let Some(source) = VersionDetails::parse(&content, VERSION_DETAILS_XML)?.source else {
            return Ok(None);
        };

        let vmr_sha = source.sha;
        let repo_sha = repo
            .blame_line(
                VERSION_DETAILS_XML,
                |line| line.contains(SOURCE_ELEMENT) && line.contains(vmr_sha.as_str()),
                Some(repo_ref),
            )
            .await?;
        Ok(Some(Codeflow::backflow(vmr_sha, repo_sha)))
    }

    /// Work out which of the recorded flows happened last.
    ///
    /// The flows are ordered by ancestry on the side the current flow
    /// originates from. Flows that cannot be ordered are an error.
    #[instrument(skip(self, vmr, repo, current), fields(current = %current))]
    pub async fn get_last_flows(
        &self,
        mapping: &str,
        vmr: &LocalGitRepo,
        vmr_ref: &str,
        repo: &LocalGitRepo,
        repo_ref: &str,
        current: &Codeflow,
    ) -> Result<LastFlows, CodeflowError> {
        let last_forward_flow = self
            .last_forward_flow(vmr, vmr_ref, mapping)
            .await?
            .ok_or_else(|| ManifestError::MappingNotFound(mapping.to_string()))?;
        let last_backflow = self.last_backflow(repo, repo_ref).await?;
        debug!(forward = %last_forward_flow, backflow = ?last_backflow.as_ref().map(ToString::to_string), "recorded flows");

        let Some(backflow) = last_backflow else {
            return Ok(LastFlows {
                last_flow: last_forward_flow.clone(),
                last_backflow: None,
                last_forward_flow,
                crossing_flow: None,
            });
        };

        let (compared, backward_sha, forward_sha) = if current.is_forward() {
            (repo, backflow.repo_sha.as_str(), last_forward_flow.repo_sha.as_str())
        } else {
            (vmr, backflow.vmr_sha.as_str(), last_forward_flow.vmr_sha.as_str())
        };

        for sha in [backward_sha, forward_sha] {
            if compared.object_type(sha)? != GitObjectType::Commit {
                return Err(CodeflowError::InvalidSynchronization(format!(
                    "failed to find commit {sha} in {}",
                    compared.path().display()
                )));
            }
        }

        let result = |last_flow: &Codeflow| LastFlows {
            last_flow: last_flow.clone(),
            last_backflow: Some(backflow.clone()),
            last_forward_flow: last_forward_flow.clone(),
            crossing_flow: None,
        };

        // A commit made by a backflow that was then flown back out.
        if backward_sha == forward_sha {
            return Ok(if current.is_forward() {
                result(&last_forward_flow)
            } else {
                result(&backflow)
            });
        }

        let is_forward_older = compared.is_ancestor(forward_sha, backward_sha)?;
        let is_backward_older = compared.is_ancestor(backward_sha, forward_sha)?;
        if is_forward_older == is_backward_older {
            return Err(CodeflowError::InvalidSynchronization(format!(
                "failed to determine which commit of {} is older ({backward_sha}, {forward_sha})",
                compared.path().display()
            )));
        }

        // A backflow from another VMR branch does not count as the last flow
        // of a forward flow into this one.
        if current.is_forward() && is_forward_older && !vmr.is_ancestor(&backflow.vmr_sha, &current.vmr_sha)? {
            warn!(
                backflow = short_sha(&backflow.vmr_sha),
                vmr = short_sha(&current.vmr_sha),
                "last backflow came from a different VMR branch, using the last forward flow"
            );
            return Ok(result(&last_forward_flow));
        }

        let last_flow = if is_backward_older { &last_forward_flow } else { &backflow };
        info!(last_flow = %last_flow, "determined last flow");
        Ok(result(last_flow))
    }
}
