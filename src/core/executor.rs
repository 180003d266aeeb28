//! FX-012: Interpreter: one install run per descriptor.
//!
//! validate → fetch → build → install, recording every state the run
//! passes through. With a state directory the run also appends provenance
//! events, keeps the build output, and saves an install receipt.

use super::error::StageError;
use super::installer::{self, DestinationResolver, StandardLayout};
use super::parser;
use super::state;
use super::types::*;
use crate::exec::{CommandRequest, CommandRunner, ExecError, ExecOutput, LocalShell};
use crate::fetch::{self, DefaultFetcher, SourceFetcher, SourceTree};
use crate::tripwire::eventlog;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Capabilities and settings for install runs.
pub struct RunConfig<'a> {
    pub prefix: &'a Path,
    pub state_dir: Option<&'a Path>,
    pub policy: &'a Policy,
    pub fetcher: &'a dyn SourceFetcher,
    pub runner: &'a dyn CommandRunner,
    pub resolver: &'a dyn DestinationResolver,
}

impl<'a> RunConfig<'a> {
    /// Default capabilities, no state directory.
    pub fn new(prefix: &'a Path, policy: &'a Policy) -> Self {
        Self {
            prefix,
            state_dir: None,
            policy,
            fetcher: &DefaultFetcher,
            runner: &LocalShell,
            resolver: &StandardLayout,
        }
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Installed(InstalledLayout),
    Failed { stage: Stage, cause: StageError },
}

/// Everything the driver learns from one run.
#[derive(Debug)]
pub struct RunReport {
    pub package: String,
    pub version: String,
    pub states: Vec<RunState>,
    pub outcome: RunOutcome,
    /// Where the fetched tree lived (or still lives, if retained)
    pub source_tree: Option<PathBuf>,
    pub source_retained: bool,
    pub duration: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, RunOutcome::Installed(_))
    }

    pub fn final_state(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Loaded)
    }

    pub fn layout(&self) -> Option<&InstalledLayout> {
        match &self.outcome {
            RunOutcome::Installed(layout) => Some(layout),
            RunOutcome::Failed { .. } => None,
        }
    }
}

/// Fetch the descriptor's sources into a scoped temporary tree.
pub fn fetch(
    fetcher: &dyn SourceFetcher,
    descriptor: &PackageDescriptor,
    timeout: Option<Duration>,
) -> Result<SourceTree, StageError> {
    fetch::acquire(fetcher, descriptor, timeout)
}

/// Run `build_command` inside the source tree.
pub fn build(
    runner: &dyn CommandRunner,
    source_root: &Path,
    descriptor: &PackageDescriptor,
    timeout: Option<Duration>,
) -> Result<ExecOutput, StageError> {
    let mut request = CommandRequest::new(&descriptor.build_command)
        .cwd(source_root)
        .env("FORMULARY_PACKAGE", &descriptor.name)
        .env("FORMULARY_VERSION", &descriptor.version)
        .timeout(timeout);
    if let Some(selection) = descriptor.build_environment.as_deref() {
        request = request.env("FORMULARY_BUILD_ENV", selection);
    }

    let output = match runner.run(&request) {
        Ok(out) => out,
        Err(ExecError::TimedOut(waited)) => {
            return Err(StageError::Timeout {
                stage: Stage::Building,
                limit: timeout.unwrap_or(waited),
            })
        }
        Err(e) => {
            return Err(StageError::Build {
                exit_code: -1,
                captured_output: e.to_string(),
            })
        }
    };

    if !output.success() {
        return Err(StageError::Build {
            exit_code: output.exit_code,
            captured_output: output.combined(),
        });
    }
    Ok(output)
}

/// Run one descriptor to completion.
pub fn run(descriptor: &PackageDescriptor, cfg: &RunConfig) -> RunReport {
    let start = Instant::now();
    let run_id = eventlog::generate_run_id();
    let mut progress = Progress::new(cfg, &descriptor.name);

    progress.log(ProvenanceEvent::RunStarted {
        package: descriptor.name.clone(),
        version: descriptor.version.clone(),
        run_id: run_id.clone(),
        formulary_version: env!("CARGO_PKG_VERSION").to_string(),
    });

    let mut tree: Option<SourceTree> = None;
    let result = drive(descriptor, cfg, &mut progress, &mut tree);

    let outcome = match result {
        Ok(layout) => {
            if cfg.policy.receipts {
                save_receipt(cfg, descriptor, &layout);
            }
            RunOutcome::Installed(layout)
        }
        Err((stage, cause)) => RunOutcome::Failed { stage, cause },
    };

    let (source_tree, source_retained) = match tree {
        Some(t) if cfg.policy.keep_source => (Some(t.keep()), true),
        Some(t) => {
            let path = t.path().to_path_buf();
            drop(t);
            (Some(path), false)
        }
        None => (None, false),
    };

    let files_installed = match &outcome {
        RunOutcome::Installed(layout) => u32::try_from(layout.files.len()).unwrap_or(u32::MAX),
        RunOutcome::Failed { .. } => 0,
    };
    let states = progress.states;
    let final_state = states.last().copied().unwrap_or(RunState::Loaded);

    if cfg.policy.tripwire {
        if let Some(dir) = cfg.state_dir {
            log_event(
                dir,
                &descriptor.name,
                ProvenanceEvent::RunCompleted {
                    package: descriptor.name.clone(),
                    version: descriptor.version.clone(),
                    run_id,
                    state: final_state,
                    files_installed,
                    total_seconds: start.elapsed().as_secs_f64(),
                },
            );
        }
    }

    RunReport {
        package: descriptor.name.clone(),
        version: descriptor.version.clone(),
        states,
        outcome,
        source_tree,
        source_retained,
        duration: start.elapsed(),
    }
}

/// Run independent descriptors; reports come back in input order.
pub fn run_many(descriptors: &[&PackageDescriptor], cfg: &RunConfig) -> Vec<RunReport> {
    if !cfg.policy.parallel_packages || descriptors.len() < 2 {
        return descriptors.iter().map(|d| run(d, cfg)).collect();
    }

    std::thread::scope(|scope| {
        let handles: Vec<_> = descriptors
            .iter()
            .map(|d| scope.spawn(move || run(d, cfg)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    })
}

fn drive(
    descriptor: &PackageDescriptor,
    cfg: &RunConfig,
    progress: &mut Progress,
    tree: &mut Option<SourceTree>,
) -> Result<InstalledLayout, (Stage, StageError)> {
    let violations = parser::describe(descriptor);
    if !violations.is_empty() {
        return Err(progress.fail(Stage::Validating, StageError::Validation { violations }));
    }

    // Fetch
    progress.enter(RunState::Fetching, Stage::Fetching);
    let source_root = match fetch(cfg.fetcher, descriptor, cfg.policy.fetch_timeout()) {
        Ok(t) => tree.insert(t).path().to_path_buf(),
        Err(e) => return Err(progress.fail(Stage::Fetching, e)),
    };
    progress.complete(RunState::Fetched, Stage::Fetching);

    // Build
    progress.enter(RunState::Building, Stage::Building);
    let built = build(cfg.runner, &source_root, descriptor, cfg.policy.build_timeout());
    keep_build_log(cfg, &descriptor.name, &built);
    if let Err(e) = built {
        return Err(progress.fail(Stage::Building, e));
    }
    progress.complete(RunState::Built, Stage::Building);

    // Install
    progress.enter(RunState::Installing, Stage::Installing);
    let layout = installer::install(
        descriptor,
        &source_root,
        cfg.prefix,
        cfg.resolver,
        cfg.policy.install,
    )
    .map_err(|e| progress.fail(Stage::Installing, e))?;
    progress.complete(RunState::Installed, Stage::Installing);

    Ok(layout)
}

fn keep_build_log(cfg: &RunConfig, package: &str, built: &Result<ExecOutput, StageError>) {
    let Some(dir) = cfg.state_dir else {
        return;
    };
    let output = match built {
        Ok(out) => out.combined(),
        Err(StageError::Build {
            captured_output, ..
        }) => captured_output.clone(),
        Err(_) => return,
    };
    if let Err(e) = eventlog::write_build_log(dir, package, &output) {
        eprintln!("warning: cannot write build log for {}: {}", package, e);
    }
}

fn log_event(state_dir: &Path, package: &str, event: ProvenanceEvent) {
    if let Err(e) = eventlog::append_event(state_dir, package, event) {
        eprintln!("warning: cannot append event for {}: {}", package, e);
    }
}

fn save_receipt(cfg: &RunConfig, descriptor: &PackageDescriptor, layout: &InstalledLayout) {
    let Some(dir) = cfg.state_dir else {
        return;
    };
    let receipt = state::new_receipt(descriptor, layout);
    if let Err(e) = state::save_receipt(dir, &receipt) {
        eprintln!(
            "warning: {} installed but receipt not saved: {}",
            descriptor.label(),
            e
        );
    }
}

/// State sequence plus stage events for one run.
struct Progress<'a> {
    state_dir: Option<&'a Path>,
    tripwire: bool,
    package: &'a str,
    states: Vec<RunState>,
    stage_start: Instant,
}

impl<'a> Progress<'a> {
    fn new(cfg: &RunConfig<'a>, package: &'a str) -> Self {
        Self {
            state_dir: cfg.state_dir,
            tripwire: cfg.policy.tripwire,
            package,
            states: vec![RunState::Loaded],
            stage_start: Instant::now(),
        }
    }

    fn log(&self, event: ProvenanceEvent) {
        if !self.tripwire {
            return;
        }
        if let Some(dir) = self.state_dir {
            log_event(dir, self.package, event);
        }
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.states.last().is_some_and(|s| s.can_advance_to(&next)),
            "illegal transition to {}",
            next
        );
        self.states.push(next);
    }

    fn enter(&mut self, next: RunState, stage: Stage) {
        self.advance(next);
        self.stage_start = Instant::now();
        self.log(ProvenanceEvent::StageStarted {
            package: self.package.to_string(),
            stage,
        });
    }

    fn complete(&mut self, next: RunState, stage: Stage) {
        self.log(ProvenanceEvent::StageCompleted {
            package: self.package.to_string(),
            stage,
            duration_seconds: self.stage_start.elapsed().as_secs_f64(),
        });
        self.advance(next);
    }

    fn fail(&mut self, stage: Stage, cause: StageError) -> (Stage, StageError) {
        self.log(ProvenanceEvent::StageFailed {
            package: self.package.to_string(),
            stage,
            error: cause.to_string(),
        });
        self.advance(RunState::Failed { stage });
        (stage, cause)
    }
}
