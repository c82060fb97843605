use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;
use serde::Serialize;

use crepo_store::{
    ExpirationReport, FileSystemRepository, FsSpaceProbe, InMemoryReferenceTracker,
    RepositoryConfig,
};
use crepo_types::{ClaimCoordinates, ContentClaim};

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let repo = open_repository(&cli.config)?;
    let format = cli.format;
    let result = match cli.command {
        Command::Init => cmd_init(&repo, format),
        Command::Stats => cmd_stats(&repo, format),
        Command::Import(args) => cmd_import(&repo, args, format),
        Command::Export(args) => cmd_export(&repo, args),
        Command::Cleanup => cmd_cleanup(&repo, format),
        Command::Expire => cmd_expire(&repo, format),
        Command::Purge(args) => cmd_purge(&repo, args),
    };
    repo.shutdown();
    result
}

/// One-shot commands run without background tasks; cleanup and expiration
/// are invoked explicitly.
fn open_repository(config_path: &Path) -> anyhow::Result<FileSystemRepository> {
    let config = RepositoryConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let repo = FileSystemRepository::initialize(
        &config,
        Arc::new(InMemoryReferenceTracker::new()),
        Arc::new(FsSpaceProbe),
        false,
    )
    .context("opening content repository")?;
    Ok(repo)
}

fn cmd_init(repo: &FileSystemRepository, format: OutputFormat) -> anyhow::Result<()> {
    let config = repo.config();
    if format == OutputFormat::Json {
        let containers: Vec<_> = config
            .containers
            .iter()
            .map(|(name, root)| (name.as_str(), root.display().to_string()))
            .collect();
        return print_json(&containers);
    }
    println!(
        "{} Initialized content repository ({} sections per container)",
        "✓".green().bold(),
        config.sections_per_container
    );
    for (name, root) in &config.containers {
        println!("  {} {}", name.yellow(), root.display().to_string().dimmed());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ContainerStats {
    name: String,
    root: String,
    capacity: u64,
    usable: u64,
    archived_files: u64,
    active_claims: usize,
}

fn collect_stats(repo: &FileSystemRepository) -> anyhow::Result<Vec<ContainerStats>> {
    repo.config()
        .containers
        .iter()
        .map(|(name, root)| -> anyhow::Result<ContainerStats> {
            Ok(ContainerStats {
                name: name.clone(),
                root: root.display().to_string(),
                capacity: repo.container_capacity(name)?,
                usable: repo.container_usable_space(name)?,
                archived_files: repo.archived_file_count(name)?,
                active_claims: repo.active_resource_claims(name).len(),
            })
        })
        .collect()
}

fn cmd_stats(repo: &FileSystemRepository, format: OutputFormat) -> anyhow::Result<()> {
    let stats = collect_stats(repo)?;
    if format == OutputFormat::Json {
        return print_json(&stats);
    }
    for s in &stats {
        let used_pct = if s.capacity == 0 {
            0.0
        } else {
            100.0 * (s.capacity - s.usable.min(s.capacity)) as f64 / s.capacity as f64
        };
        println!("{} {}", s.name.yellow().bold(), s.root.dimmed());
        println!(
            "  Capacity: {}  Usable: {}  ({:.1}% used)",
            human_bytes(s.capacity).bold(),
            human_bytes(s.usable).bold(),
            used_pct
        );
        println!(
            "  Resource claims: {} live, {} archived",
            s.active_claims.to_string().cyan(),
            s.archived_files.to_string().cyan()
        );
    }
    Ok(())
}

fn import_file(
    repo: &FileSystemRepository,
    path: &Path,
    loss_tolerant: bool,
) -> anyhow::Result<(ContentClaim, u64)> {
    let mut source =
        File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let claim = repo.create(loss_tolerant)?;
    match repo.import_from_reader(&mut source, &claim) {
        Ok(bytes) => Ok((claim, bytes)),
        Err(e) => {
            repo.decrement_claimant_count(claim.resource_claim());
            Err(e).with_context(|| format!("importing {}", path.display()))
        }
    }
}

fn cmd_import(
    repo: &FileSystemRepository,
    args: ImportArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let (claim, bytes) = import_file(repo, &args.file, args.loss_tolerant)?;
    let coordinates = claim.coordinates();
    if format == OutputFormat::Json {
        return print_json(&coordinates);
    }
    println!(
        "{} Imported {} from {}",
        "✓".green().bold(),
        human_bytes(bytes).bold(),
        args.file.display()
    );
    println!("  Container: {}", coordinates.container.yellow());
    println!("  Section:   {}", coordinates.section.yellow());
    println!("  Id:        {}", coordinates.id.cyan());
    println!("  Offset:    {}", coordinates.offset);
    println!("  Length:    {}", coordinates.length);
    Ok(())
}

fn export_claim(repo: &FileSystemRepository, args: &ExportArgs) -> anyhow::Result<u64> {
    let claim = ClaimCoordinates {
        container: args.container.clone(),
        section: args.section.clone(),
        id: args.id.clone(),
        offset: args.offset,
        length: args.length,
    }
    .to_content_claim()?;
    let bytes = repo
        .export_to_path(&claim, &args.dest, args.append)
        .with_context(|| format!("exporting {claim}"))?;
    Ok(bytes)
}

fn cmd_export(repo: &FileSystemRepository, args: ExportArgs) -> anyhow::Result<()> {
    let bytes = export_claim(repo, &args)?;
    println!(
        "{} Exported {} to {}",
        "✓".green().bold(),
        human_bytes(bytes).bold(),
        args.dest.display()
    );
    Ok(())
}

fn cmd_cleanup(repo: &FileSystemRepository, format: OutputFormat) -> anyhow::Result<()> {
    let report = repo.cleanup();
    if format == OutputFormat::Json {
        return print_json(&report);
    }
    let mark = if report.failed == 0 { "✓".green().bold() } else { "!".yellow().bold() };
    println!(
        "{} Cleanup scanned {} files: {} archived, {} removed, {} failed",
        mark, report.scanned, report.archived, report.removed, report.failed
    );
    Ok(())
}

#[derive(Debug, Serialize)]
struct ContainerExpiration {
    container: String,
    #[serde(flatten)]
    report: ExpirationReport,
}

fn cmd_expire(repo: &FileSystemRepository, format: OutputFormat) -> anyhow::Result<()> {
    if !repo.config().archive_enabled {
        if format == OutputFormat::Json {
            return print_json(&Vec::<ContainerExpiration>::new());
        }
        println!("Archiving is disabled; nothing to expire.");
        return Ok(());
    }

    let mut results = Vec::new();
    for name in repo.container_names() {
        let report = repo.run_expiration_now(&name)?;
        results.push(ContainerExpiration { container: name, report });
    }
    if format == OutputFormat::Json {
        return print_json(&results);
    }
    for r in &results {
        println!(
            "{} {}: {} expired, {} deleted for space, {} freed",
            "✓".green(),
            r.container.yellow(),
            r.report.deleted_expired,
            r.report.deleted_for_space,
            human_bytes(r.report.freed_bytes).bold()
        );
    }
    Ok(())
}

fn cmd_purge(repo: &FileSystemRepository, args: PurgeArgs) -> anyhow::Result<()> {
    if !args.yes {
        anyhow::bail!("purge deletes all content; pass --yes to confirm");
    }
    repo.purge()?;
    println!("{} Purged {} container(s)", "✓".green().bold(), repo.container_names().len());
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
