//! The git-receive build entry point and its pipeline stages.

mod job;
mod metadata;
mod pipeline;
mod registry;
mod stacks;
mod wait;

pub use job::{BUILD_ARGS_FLAG, BuildJobSpec, build_job_name, parse_node_selector};
pub use pipeline::{BuildDeps, build, read_builder_key};
pub use stacks::{STACK_OVERRIDE_VAR, Stack, StackTable};
pub use wait::{ConditionOutcome, end_condition, progress, start_condition, wait_for_condition};

use crate::config::ReceiveConfig;
use crate::errors::BuildError;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Split one pre-receive input line into `(old, new, ref)`.
fn parse_ref_line(line: &str) -> Result<(String, String, String), BuildError> {
    let fields: Vec<&str> = line.split(' ').collect();
    if fields.len() != 3 {
        return Err(BuildError::PushInput {
            line: line.to_string(),
        });
    }
    Ok((
        fields[0].to_string(),
        fields[1].to_string(),
        fields[2].to_string(),
    ))
}

/// Run the git-receive hook: read `old new ref` lines from the hook's
/// stdin and run one build per pushed revision. Only pushes arriving via
/// `git-receive-pack` build; other verbs pass through.
pub async fn run<R>(cfg: &ReceiveConfig, deps: &BuildDeps, input: R) -> Result<(), BuildError>
where
    R: AsyncRead + Unpin,
{
    tracing::debug!("running git-receive hook");
    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        let (old_rev, new_rev, ref_name) = parse_ref_line(&line)?;
        tracing::debug!(old = %old_rev, new = %new_rev, refname = %ref_name, "read push line");

        if cfg.ssh_original_command.starts_with("git-receive-pack") {
            build(cfg, deps, &new_rev).await?;
        }
    }
    Ok(())
}
