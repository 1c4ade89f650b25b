//! ovfimport CLI - Inspect, verify and rehearse imports of OVF/OVA packages.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ovfimport_core::manifest::{verify_package, LocalCheck};
use ovfimport_core::options;
use ovfimport_core::package::manifest_name;
use ovfimport_core::sim::Simulator;
use ovfimport_core::{
    CancelToken, DeploymentOptions, Deployer, Envelope, ImportConfig, Importer, Manifest,
    NetworkMapping, Overrides, Package, Progress, ProgressListener, StepOutcome, Target,
};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const BAR_TEMPLATE: &str =
    "{spinner:.green} {msg:20} [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Inspect, verify and rehearse imports of OVF/OVA packages.
#[derive(Parser)]
#[command(name = "ovfimport")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log debug detail to stderr (RUST_LOG overrides).
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the deployment options document for a package.
    Spec {
        /// Descriptor, directory or OVA archive.
        package: PathBuf,

        /// Include properties that are not user configurable.
        #[arg(long)]
        hidden: bool,

        /// List the legal values of every choice.
        #[arg(long)]
        verbose: bool,
    },

    /// Check package members against the package manifest.
    Verify {
        /// Descriptor, directory or OVA archive.
        package: PathBuf,
    },

    /// Rehearse a full import plus post-deploy steps against the simulator.
    Import {
        /// Descriptor, directory or OVA archive.
        package: PathBuf,

        /// Deployment options document ("-" reads stdin).
        #[arg(long)]
        options: Option<PathBuf>,

        /// Name of the imported entity.
        #[arg(long)]
        name: Option<String>,

        /// Verify server checksums against the manifest.
        #[arg(short = 'm', long)]
        verify_manifest: bool,

        /// Fail when the package has no manifest (implies --verify-manifest).
        #[arg(long)]
        require_manifest: bool,

        /// Allow overriding properties that are not user configurable.
        #[arg(long)]
        hidden: bool,

        /// Map a descriptor network to a target network (NAME=TARGET).
        #[arg(long = "network", value_parser = parse_network_mapping)]
        networks: Vec<NetworkMapping>,

        /// Power on the entity after import.
        #[arg(long)]
        power_on: bool,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        Commands::Spec {
            package,
            hidden,
            verbose,
        } => {
            print_spec(&package, hidden, verbose)?;
        }
        Commands::Verify { package } => {
            verify(&package)?;
        }
        Commands::Import {
            package,
            options,
            name,
            verify_manifest,
            require_manifest,
            hidden,
            networks,
            power_on,
            quiet,
        } => {
            let config = match (verify_manifest, require_manifest) {
                (_, true) => ImportConfig::strict(),
                (true, false) => ImportConfig::verified(),
                (false, false) => ImportConfig::default(),
            };
            let config = ImportConfig { hidden, ..config };
            let overrides = Overrides {
                name,
                network_mapping: networks,
                power_on: power_on.then_some(true),
                ..Overrides::default()
            };
            run_import(&package, options.as_deref(), &overrides, config, quiet)?;
        }
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    let level = if debug { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn parse_network_mapping(arg: &str) -> Result<NetworkMapping, String> {
    match arg.split_once('=') {
        Some((name, network)) if !name.is_empty() => Ok(NetworkMapping::new(name, network)),
        _ => Err(format!("expected NAME=TARGET, got '{arg}'")),
    }
}

fn read_envelope(package: &mut Package) -> Result<Envelope> {
    let descriptor = package.read_descriptor()?;
    Envelope::parse(&descriptor.text).with_context(|| format!("failed to parse {}", descriptor.name))
}

fn print_spec(path: &Path, hidden: bool, verbose: bool) -> Result<()> {
    let mut package = Package::open(path)?;
    let envelope = read_envelope(&mut package)?;
    let options = options::resolve(&envelope, hidden, verbose);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    options.to_writer_pretty(&mut out)?;
    writeln!(out)?;
    Ok(())
}

fn verify(path: &Path) -> Result<()> {
    let mut package = Package::open(path)?;
    let descriptor = package.read_descriptor()?;
    let manifest_member = package
        .archive()
        .open(&manifest_name(&descriptor.name))
        .context("package has no manifest")?;
    let manifest = Manifest::parse(manifest_member)?;

    let results = verify_package(package.archive(), &manifest)?;

    println!("Manifest Verification");
    println!("=====================");
    println!();
    let mut failed = 0;
    for (name, check) in &results {
        let status = match check {
            LocalCheck::Ok => "ok".to_string(),
            LocalCheck::Unsupported => "skipped (unsupported algorithm)".to_string(),
            LocalCheck::Missing => {
                failed += 1;
                "MISSING".to_string()
            }
            LocalCheck::Mismatch { actual } => {
                failed += 1;
                format!("MISMATCH (got {actual})")
            }
        };
        println!("  {name:<40} {status}");
    }
    println!();

    if failed > 0 {
        bail!("{failed} of {} manifest entries failed verification", results.len());
    }
    println!("All {} entries verified.", results.len());
    Ok(())
}

fn run_import(
    path: &Path,
    options_path: Option<&Path>,
    overrides: &Overrides,
    config: ImportConfig,
    quiet: bool,
) -> Result<()> {
    let mut package = Package::open(path)?;

    let mut options = match options_path {
        Some(file) => DeploymentOptions::from_path(file)?,
        None => {
            let envelope = read_envelope(&mut package)?;
            options::resolve(&envelope, config.hidden, false)
        }
    };
    options.apply(overrides);
    for note in options.validate() {
        warn!("{note}");
    }

    let sim = Simulator::new();
    for mapping in &options.network_mapping {
        if !mapping.network.is_empty() {
            sim.add_network(&mapping.network);
        }
    }

    let cancel = CancelToken::new();
    watch_signals(cancel.clone())?;

    let bars = ProgressBars::new(quiet);
    let locale = config.locale.clone();
    let outcome = Importer::new(&sim, Target::default(), config)
        .with_listener(&bars)
        .with_cancel(cancel.clone())
        .import(&mut package, &options)?;
    bars.finish();

    for warning in &outcome.warnings {
        warn!("{warning}");
    }
    info!(entity = %outcome.entity, name = %outcome.name, "import complete");

    println!();
    println!("Import");
    println!("------");
    println!("Name:      {}", outcome.name);
    println!("Entity:    {}", outcome.entity);
    println!("Verified:  {}", if outcome.verified { "yes" } else { "no" });

    if outcome.entity.kind != "VirtualMachine" {
        return Ok(());
    }

    let report = Deployer::new(&sim, locale, cancel).deploy(&outcome.entity, &options)?;
    println!();
    println!("Post-deploy");
    println!("-----------");
    for (step, result) in &report.steps {
        let label = match result {
            StepOutcome::Applied => "applied",
            StepOutcome::Skipped => "skipped",
        };
        println!("  {:<24} {label}", step.to_string());
    }
    if let Some(ip) = &report.ip {
        println!("IP:        {ip}");
    }

    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
fn watch_signals(token: CancelToken) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("failed to install signal handlers")?;
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            warn!(signal, "cancelling");
            token.cancel();
        }
    });
    Ok(())
}

/// One indicatif bar per transferred file.
struct ProgressBars {
    multi: Option<MultiProgress>,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl ProgressBars {
    fn new(quiet: bool) -> Self {
        Self {
            multi: (!quiet).then(MultiProgress::new),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn finish(&self) {
        let bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        for bar in bars.values() {
            if !bar.is_finished() {
                bar.finish();
            }
        }
    }
}

impl ProgressListener for ProgressBars {
    fn on_progress(&self, progress: &Progress) {
        let Some(multi) = &self.multi else {
            return;
        };
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        let bar = bars.entry(progress.file.clone()).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new(progress.total));
            let style = ProgressStyle::with_template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-");
            bar.set_style(style);
            bar.set_message(progress.file.clone());
            bar
        });

        bar.set_position(progress.transferred);
        if progress.done && !bar.is_finished() {
            bar.finish();
        }
    }
}
