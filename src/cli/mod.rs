//! FX-017: CLI subcommands: init, validate, list, install, verify, status.

use crate::core::catalog::Catalog;
use crate::core::error::{CatalogError, StageError};
use crate::core::executor::{self, RunConfig, RunOutcome, RunReport};
use crate::core::installer::{DestinationResolver, StandardLayout};
use crate::core::types::{InstallPolicy, PackageDescriptor, Policy, ProvenanceEvent};
use crate::core::{parser, state};
use crate::fetch::{self, SourceKind};
use crate::tripwire::{drift, eventlog};
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new catalog
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate a catalog without fetching anything
    Validate {
        /// Path to formulary.yaml
        #[arg(short, long, default_value = "formulary.yaml")]
        file: PathBuf,
    },

    /// List every package revision in a catalog
    List {
        /// Path to formulary.yaml
        #[arg(short, long, default_value = "formulary.yaml")]
        file: PathBuf,
    },

    /// Fetch, build, and install one package
    Install {
        /// Package name
        name: String,

        /// Path to formulary.yaml
        #[arg(short, long, default_value = "formulary.yaml")]
        file: PathBuf,

        /// Installation prefix
        #[arg(long)]
        prefix: PathBuf,

        /// Revision to install (default: last declared)
        #[arg(long)]
        version: Option<String>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Retain the fetched source tree
        #[arg(long)]
        keep_source: bool,

        /// Restore touched files if install fails
        #[arg(long)]
        rollback: bool,

        /// Show what would be done without running
        #[arg(long)]
        dry_run: bool,
    },

    /// Detect changes to installed files (tripwire)
    Verify {
        /// Only this package
        name: Option<String>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Exit non-zero on any drift (for CI/cron)
        #[arg(long)]
        tripwire: bool,
    },

    /// Show installed packages from receipts
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Only this package
        #[arg(short, long)]
        name: Option<String>,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::List { file } => cmd_list(&file),
        Commands::Install {
            name,
            file,
            prefix,
            version,
            state_dir,
            keep_source,
            rollback,
            dry_run,
        } => cmd_install(&InstallArgs {
            file: &file,
            name: &name,
            version: version.as_deref(),
            prefix: &prefix,
            state_dir: &state_dir,
            keep_source,
            rollback,
            dry_run,
        }),
        Commands::Verify {
            name,
            state_dir,
            tripwire,
        } => cmd_verify(&state_dir, name.as_deref(), tripwire),
        Commands::Status { state_dir, name } => cmd_status(&state_dir, name.as_deref()),
    }
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let catalog_path = path.join("formulary.yaml");
    if catalog_path.exists() {
        return Err(format!("{} already exists", catalog_path.display()));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| format!("cannot create state dir: {}", e))?;

    let template = r#"version: "1.0"
name: my-catalog
description: "Managed by formulary"

policy:
  fetch_timeout_secs: 600
  build_timeout_secs: 1800
  install: no_rollback
  tripwire: true
  receipts: true

packages: []
#  - name: slang
#    version: "1"
#    source_url: https://github.com/bww/Slang.git
#    build_command: make
#    install:
#      - { source: bin/slang, destination: binary }
#      - { source: share/slang, destination: shared_resources }
"#;
    std::fs::write(&catalog_path, template)
        .map_err(|e| format!("cannot write {}: {}", catalog_path.display(), e))?;

    println!("Initialized formulary catalog at {}", path.display());
    println!("  Created: {}", catalog_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

/// Parse and validate a catalog file, returning errors if invalid.
fn parse_and_validate(file: &Path) -> Result<Catalog, String> {
    let parsed = parser::parse_catalog_file(file).map_err(|e| e.to_string())?;
    let errors = parser::validate_catalog(&parsed);
    if errors.is_empty() {
        return Ok(Catalog::new(parsed));
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err(CatalogError::Invalid {
        count: errors.len(),
    }
    .to_string())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let catalog = parse_and_validate(file)?;

    for descriptor in catalog.iter() {
        for dep in catalog.unknown_dependencies(descriptor) {
            println!(
                "  WARN: {} depends on '{}', which this catalog does not describe",
                descriptor.label(),
                dep
            );
        }
    }

    println!(
        "OK: {} ({} packages, {} revisions)",
        catalog.name,
        catalog.names().len(),
        catalog.len()
    );
    Ok(())
}

fn cmd_list(file: &Path) -> Result<(), String> {
    let catalog = parse_and_validate(file)?;
    if catalog.is_empty() {
        println!("No packages in {}.", catalog.name);
        return Ok(());
    }

    println!("{}:", catalog.name);
    for name in catalog.names() {
        let revisions = catalog.revisions(name);
        let latest = revisions.last().map(|d| d.version.as_str()).unwrap_or_default();
        for d in &revisions {
            let marker = if d.version == latest { "*" } else { " " };
            let deps = if d.dependencies.is_empty() {
                String::new()
            } else {
                let names: Vec<&str> = d.dependencies.iter().map(String::as_str).collect();
                format!(" (depends on: {})", names.join(", "))
            };
            println!("  {} {}  {}{}", marker, d.label(), d.source_url, deps);
        }
    }
    Ok(())
}

struct InstallArgs<'a> {
    file: &'a Path,
    name: &'a str,
    version: Option<&'a str>,
    prefix: &'a Path,
    state_dir: &'a Path,
    keep_source: bool,
    rollback: bool,
    dry_run: bool,
}

fn cmd_install(args: &InstallArgs) -> Result<(), String> {
    let catalog = parse_and_validate(args.file)?;
    let descriptor = catalog
        .select(args.name, args.version)
        .map_err(|e| e.to_string())?;

    let mut policy = catalog.policy.clone();
    if args.keep_source {
        policy.keep_source = true;
    }
    if args.rollback {
        policy.install = InstallPolicy::Rollback;
    }

    warn_missing_dependencies(args.state_dir, descriptor)?;

    if args.dry_run {
        print_plan(descriptor, args.prefix, &StandardLayout, &policy);
        println!("Dry run: nothing fetched, built, or installed.");
        return Ok(());
    }

    let cfg = RunConfig {
        state_dir: Some(args.state_dir),
        ..RunConfig::new(args.prefix, &policy)
    };
    println!("Installing {} into {}", descriptor.label(), args.prefix.display());
    let report = executor::run(descriptor, &cfg);
    print_report(&report)
}

/// Dependencies are declared, not resolved; flag the ones never installed.
fn warn_missing_dependencies(state_dir: &Path, descriptor: &PackageDescriptor) -> Result<(), String> {
    for dep in &descriptor.dependencies {
        if state::load_receipt(state_dir, dep)
            .map_err(|e| e.to_string())?
            .is_none()
        {
            eprintln!(
                "  WARN: {} depends on '{}', which has no install receipt",
                descriptor.label(),
                dep
            );
        }
    }
    Ok(())
}

/// Display what an install would do.
fn print_plan(
    descriptor: &PackageDescriptor,
    prefix: &Path,
    resolver: &dyn DestinationResolver,
    policy: &Policy,
) {
    println!("Plan: {}", descriptor.label());
    println!(
        "  fetch:   {} ({})",
        descriptor.source_url,
        describe_source(fetch::classify(&descriptor.source_url))
    );
    println!("  build:   {}", descriptor.build_command);
    for mapping in &descriptor.install {
        let dir = resolver.resolve(prefix, &descriptor.name, mapping.destination);
        println!(
            "  install: {} -> {} [{}]",
            mapping.source,
            dir.display(),
            mapping.destination
        );
    }
    let rollback = match policy.install {
        InstallPolicy::Rollback => "rollback",
        InstallPolicy::NoRollback => "no rollback",
    };
    println!(
        "  policy:  fetch {}s, build {}s, {}",
        policy.fetch_timeout_secs, policy.build_timeout_secs, rollback
    );
}

fn describe_source(kind: SourceKind) -> String {
    match kind {
        SourceKind::Git => "git clone".to_string(),
        SourceKind::Archive(format) => format!("archive, {:?}", format),
        SourceKind::LocalDir => "local directory".to_string(),
    }
}

/// Print a run report; failures become the command's error.
fn print_report(report: &RunReport) -> Result<(), String> {
    let trail: Vec<String> = report.states.iter().map(|s| s.to_string()).collect();
    println!("  {}", trail.join(" -> "));

    if report.source_retained {
        if let Some(tree) = &report.source_tree {
            println!("  Source kept at {}", tree.display());
        }
    }

    match &report.outcome {
        RunOutcome::Installed(layout) => {
            for f in &layout.files {
                println!("  + {}", f.path.display());
            }
            println!(
                "Installed {}@{}: {} file(s) ({:.1}s)",
                report.package,
                report.version,
                layout.files.len(),
                report.duration.as_secs_f64()
            );
            Ok(())
        }
        RunOutcome::Failed { stage, cause } => {
            println!(
                "FAILED: {{name: {}, version: {}, stage: {}, cause: {}: {}}}",
                report.package,
                report.version,
                stage,
                cause.kind(),
                cause
            );
            if let StageError::Build {
                captured_output, ..
            } = cause
            {
                if !captured_output.trim().is_empty() {
                    println!("--- build output ---");
                    print!("{}", captured_output);
                    if !captured_output.ends_with('\n') {
                        println!();
                    }
                }
            }
            Err(format!("{} failed during {}", report.package, stage))
        }
    }
}

fn cmd_verify(state_dir: &Path, name_filter: Option<&str>, tripwire_mode: bool) -> Result<(), String> {
    let receipts = state::list_receipts(state_dir).map_err(|e| e.to_string())?;

    let mut total_drift = 0;
    for receipt in receipts
        .iter()
        .filter(|r| name_filter.is_none_or(|n| r.name == n))
    {
        println!("Checking {}@{} ({} files)...", receipt.name, receipt.version, receipt.files.len());
        let findings = drift::detect_drift(receipt);

        if findings.is_empty() {
            println!("  No drift detected.");
            continue;
        }
        for f in &findings {
            println!("  DRIFTED: {} ({})", f.path, f.detail);
            println!("    Expected: {}", f.expected_hash);
            println!("    Actual:   {}", f.actual_hash);
            let logged = eventlog::append_event(
                state_dir,
                &receipt.name,
                ProvenanceEvent::DriftDetected {
                    package: f.package.clone(),
                    path: f.path.clone(),
                    expected_hash: f.expected_hash.clone(),
                    actual_hash: f.actual_hash.clone(),
                },
            );
            if let Err(e) = logged {
                eprintln!("warning: cannot append event for {}: {}", receipt.name, e);
            }
        }
        total_drift += findings.len();
    }

    if total_drift > 0 {
        println!();
        println!("Drift detected: {} file(s)", total_drift);
        if tripwire_mode {
            return Err(format!("{} drift finding(s)", total_drift));
        }
    } else {
        println!("No drift detected.");
    }

    Ok(())
}

fn cmd_status(state_dir: &Path, name_filter: Option<&str>) -> Result<(), String> {
    let receipts = state::list_receipts(state_dir).map_err(|e| e.to_string())?;

    let mut found = false;
    for receipt in receipts
        .iter()
        .filter(|r| name_filter.is_none_or(|n| r.name == n))
    {
        found = true;
        println!("Package: {}@{}", receipt.name, receipt.version);
        println!("  Source:    {}", receipt.source_url);
        println!("  Prefix:    {}", receipt.prefix.display());
        println!("  Installed: {}", receipt.installed_at);
        println!("  Generator: {}", receipt.generator);
        println!("  Files:     {}", receipt.files.len());
        for (path, entry) in &receipt.files {
            println!("    {} [{}] <- {}", path, entry.category, entry.source);
        }
        println!();
    }

    if !found {
        println!("No receipts found. Run `formulary install` first.");
    }

    Ok(())
}
