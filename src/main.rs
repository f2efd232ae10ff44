//! pest-nsmc CLI - control files from model I/O files and null-space Monte Carlo runs.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use pest_nsmc::config::IoPair;
use pest_nsmc::{
    ControlFile, Covariance, DrawOptions, EngineState, LabeledMatrix, MonteCarlo, RunConfig,
    Serializable,
};

const MANIFEST_SCHEMA_VERSION: &str = "1";

#[derive(Debug, Parser)]
#[command(name = "pest-nsmc")]
#[command(version)]
#[command(about = "PEST template/instruction parsing and null-space Monte Carlo realizations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build a control file from template and instruction files
    Build {
        /// Template file, paired in order with --in
        #[arg(long = "tpl", required = true)]
        templates: Vec<PathBuf>,

        /// Model input file written from each template
        #[arg(long = "in", required = true)]
        model_inputs: Vec<PathBuf>,

        /// Instruction file, paired in order with --out
        #[arg(long = "ins", required = true)]
        instructions: Vec<PathBuf>,

        /// Model output file read by each instruction file
        #[arg(long = "out", required = true)]
        model_outputs: Vec<PathBuf>,

        /// Control file to write
        #[arg(long, default_value = "pest.pst")]
        pst: PathBuf,
    },

    /// Draw, optionally project, and write realized control files
    Run {
        /// Path to the run configuration file
        #[arg(short, long, default_value = "nsmc.toml")]
        config: PathBuf,
    },

    /// Show example run configuration
    Example,
}

#[derive(Debug, Serialize)]
struct Manifest {
    schema_version: String,
    num_reals: usize,
    seed: u64,
    epsilon: f64,
    nsing: Option<usize>,
    state: EngineState,
    pst_files: Vec<PathBuf>,
    parensemble: PathBuf,
    obsensemble: Option<PathBuf>,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")
}

fn pair_files(pest_files: &[PathBuf], model_files: &[PathBuf], flags: &str) -> Result<Vec<IoPair>> {
    if pest_files.len() != model_files.len() {
        bail!(
            "{flags} must be given the same number of times ({} vs {})",
            pest_files.len(),
            model_files.len()
        );
    }
    Ok(pest_files
        .iter()
        .zip(model_files)
        .map(|(pest_file, model_file)| IoPair {
            pest_file: pest_file.clone(),
            model_file: model_file.clone(),
        })
        .collect())
}

fn ensure_outdir(outdir: &Path) -> Result<()> {
    fs::create_dir_all(outdir)
        .with_context(|| format!("failed to create output directory: {}", outdir.display()))
}

fn write_manifest_json(outdir: &Path, manifest: &Manifest) -> Result<PathBuf> {
    let path = outdir.join("manifest.json");
    let payload = serde_json::to_string_pretty(manifest).context("failed to serialize manifest")?;
    fs::write(&path, payload)
        .with_context(|| format!("failed to write manifest: {}", path.display()))?;
    Ok(path)
}

fn build(
    templates: &[PathBuf],
    model_inputs: &[PathBuf],
    instructions: &[PathBuf],
    model_outputs: &[PathBuf],
    pst_path: &Path,
) -> Result<()> {
    let templates = pair_files(templates, model_inputs, "--tpl and --in")?;
    let instructions = pair_files(instructions, model_outputs, "--ins and --out")?;
    let pst = ControlFile::from_io_files(&templates, &instructions)
        .context("failed to build control file from model io files")?;
    pst.write(pst_path)
        .with_context(|| format!("failed to write control file: {}", pst_path.display()))?;
    info!(
        npar = pst.npar(),
        nobs = pst.nobs(),
        path = %pst_path.display(),
        "wrote control file"
    );
    Ok(())
}

fn run(config_path: &Path) -> Result<()> {
    let cfg = RunConfig::from_toml_file(config_path)
        .with_context(|| format!("failed to load run config: {}", config_path.display()))?;
    ensure_outdir(&cfg.outdir)?;

    let pst = ControlFile::from_io_files(&cfg.templates, &cfg.instructions)
        .context("failed to build control file from model io files")?;
    info!(npar = pst.npar(), nobs = pst.nobs(), "built control file");

    let mut mc = MonteCarlo::new(pst)?
        .with_seed(cfg.seed)
        .with_epsilon(cfg.epsilon)?
        .with_sigma_range(cfg.sigma_range)?;
    if let Some(parcov) = &cfg.parcov {
        let cov = Covariance::from_csv(parcov)
            .with_context(|| format!("failed to read parameter covariance: {}", parcov.display()))?;
        mc = mc.with_parcov(cov);
    }
    if let Some(jacobian) = &cfg.jacobian {
        let jco = LabeledMatrix::from_csv(jacobian)
            .with_context(|| format!("failed to read jacobian: {}", jacobian.display()))?;
        mc = mc.with_jacobian(&jco)?;
    }

    mc.draw(DrawOptions {
        num_reals: cfg.num_reals,
        par_file: cfg.par_file.clone(),
        obs: cfg.draw_obs,
        enforce_bounds: cfg.enforce_bounds,
        cov: None,
    })?;

    let mut nsing = None;
    if cfg.project {
        let resolved = match cfg.nsing {
            Some(n) => n,
            None => mc.get_nsing(None)?,
        };
        if resolved == mc.pst().npar_adj() {
            warn!(nsing = resolved, "no null space; projection collapses realizations onto the reference");
        }
        mc.project_parensemble(None, Some(resolved), true)?;
        nsing = Some(resolved);
    }

    let prefix = cfg.outdir.join(&cfg.prefix).display().to_string();
    let pst_files = mc.write_psts(&prefix)?;

    let parensemble = cfg.outdir.join("parensemble.csv");
    mc.parensemble()
        .write_csv(&parensemble)
        .with_context(|| format!("failed to write {}", parensemble.display()))?;

    let obsensemble = if mc.obsensemble().num_reals() > 0 {
        let path = cfg.outdir.join("obsensemble.csv");
        mc.obsensemble()
            .write_csv(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Some(path)
    } else {
        None
    };

    let manifest = Manifest {
        schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
        num_reals: mc.num_reals(),
        seed: cfg.seed,
        epsilon: cfg.epsilon,
        nsing,
        state: mc.state(),
        pst_files,
        parensemble,
        obsensemble,
    };
    let manifest_path = write_manifest_json(&cfg.outdir, &manifest)?;
    info!(
        num_reals = manifest.num_reals,
        outdir = %cfg.outdir.display(),
        manifest = %manifest_path.display(),
        "run complete"
    );
    Ok(())
}

fn print_example_config() {
    let example = r#"# pest-nsmc run configuration
# relative paths are taken from this file's directory

num_reals = 100
seed = 2016
epsilon = 1e-6
# nsing = 3
draw_obs = false
enforce_bounds = true
project = true
sigma_range = 4.0
prefix = "real_"
outdir = "output-pest-nsmc"

jacobian = "model.jco.csv"
# par_file = "calibrated.par"
# parcov = "prior.cov.csv"

[[templates]]
pest_file = "model.tpl"
model_file = "model.in"

[[instructions]]
pest_file = "model.ins"
model_file = "model.out"
"#;
    println!("{example}");
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Build {
            templates,
            model_inputs,
            instructions,
            model_outputs,
            pst,
        } => build(&templates, &model_inputs, &instructions, &model_outputs, &pst),
        Commands::Run { config } => run(&config),
        Commands::Example => {
            print_example_config();
            Ok(())
        }
    }
}
