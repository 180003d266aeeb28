//! FX-021: Shallow git clone through the command runner.

use super::exec_failure;
use crate::core::error::StageError;
use crate::core::types::PackageDescriptor;
use crate::exec::{CommandRequest, CommandRunner, Deadline};
use std::path::Path;

/// Build the clone command line for a descriptor.
pub fn clone_script(descriptor: &PackageDescriptor, dest: &Path) -> String {
    let url = descriptor.source_url.trim();
    let url = url.strip_prefix("git+").unwrap_or(url);
    let dest = dest.display().to_string();

    let mut args = vec!["git", "clone", "--quiet", "--depth", "1"];
    if let Some(git_ref) = descriptor.git_ref.as_deref() {
        args.push("--branch");
        args.push(git_ref);
    }
    args.push("--");
    args.push(url);
    args.push(&dest);
    shell_words::join(args)
}

/// Clone `descriptor.source_url` into `dest`.
pub fn clone(
    runner: &dyn CommandRunner,
    descriptor: &PackageDescriptor,
    dest: &Path,
    deadline: &Deadline,
) -> Result<(), StageError> {
    let script = clone_script(descriptor, dest);
    let request = CommandRequest::new(&script)
        .env("GIT_TERMINAL_PROMPT", "0")
        .timeout(deadline.remaining());

    let output = runner
        .run(&request)
        .map_err(|e| exec_failure(&descriptor.source_url, deadline, e))?;

    if !output.success() {
        return Err(StageError::fetch(
            &descriptor.source_url,
            format!(
                "git clone exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            ),
        ));
    }
    Ok(())
}
