use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use fuzzforge::config::ForgeConfig;
use fuzzforge::generate::ApiCatalog;
use fuzzforge::model::{ModelRepairer, OpenAiCompatibleModel};
use fuzzforge::pipeline::Forge;
use fuzzforge::report::CompilationReport;
use fuzzforge::sandbox::{DockerCli, SandboxController};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "fuzzforge",
    about = "Generate fuzz drivers with an LLM and keep only the ones that compile",
    version
)]
struct Cli {
    /// Path to a fuzzforge.toml configuration file
    #[arg(long, short = 'c', global = true, env = "FUZZFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build and run one driver in a fresh sandbox; exits with its status
    Run {
        driver: PathBuf,
        /// Reuse a caller-chosen container name
        #[arg(long)]
        container_name: Option<String>,
        /// Host file for the execution output
        #[arg(long)]
        output: Option<PathBuf>,
        /// Override the configured image
        #[arg(long)]
        image: Option<String>,
    },
    /// Compile check that treats missing coverage output as a failed build
    Probe { driver: PathBuf },
    /// Run the compile-repair loop over every driver in a directory
    Check {
        dir: PathBuf,
        /// File name pattern selecting drivers
        #[arg(long, default_value = "*.c")]
        pattern: String,
        /// Also write the report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Generate drivers from an API catalog and check each one
    Generate {
        catalog: PathBuf,
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print the diagnostic context of a saved execution output
    Extract { output: PathBuf },
    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json_logs);

    let config = ForgeConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!(version = env!("CARGO_PKG_VERSION"), "fuzzforge starting");

    match cli.command {
        Command::Run {
            driver,
            container_name,
            output,
            image,
        } => {
            let controller = controller(&config);
            let mut spec = config.sandbox_spec_for(&driver);
            spec.container_name = container_name;
            if let Some(output) = output {
                spec.output = output;
            }
            if let Some(image) = image {
                spec.image = image;
            }
            let record = controller
                .with_echo(true)
                .stage_and_run(&spec)
                .with_context(|| format!("Sandbox run failed for {}", driver.display()))?;
            if record.coverage_text.is_none() && spec.coverage_text.host.is_some() {
                info!("Coverage text was not produced");
            }
            println!("Output saved to {}", spec.output.display());
            match record.status {
                Some(0) => Ok(()),
                Some(code) => std::process::exit(code),
                None => std::process::exit(1),
            }
        }
        Command::Probe { driver } => {
            let spec = config.sandbox_spec_for(&driver);
            let probe = controller(&config)
                .compile_probe(&spec)
                .with_context(|| format!("Compile probe failed for {}", driver.display()))?;
            if probe.compiled {
                println!("{} {}", "compiled".green(), driver.display());
                Ok(())
            } else {
                println!("{} {}", "not compiled".red(), driver.display());
                std::process::exit(1)
            }
        }
        Command::Check {
            dir,
            pattern,
            report,
        } => {
            let model = OpenAiCompatibleModel::from_config(&config.model)?;
            let repairer = ModelRepairer::new(model);
            let forge = Forge::new(config.clone(), controller(&config))?;
            let result = forge.check_directory(&dir, &pattern, &repairer)?;
            finish(&result, report.as_deref())
        }
        Command::Generate { catalog, report } => {
            let catalog = ApiCatalog::from_file(&catalog)?;
            let model = OpenAiCompatibleModel::from_config(&config.model)?;
            let repairer = ModelRepairer::new(&model);
            let forge = Forge::new(config.clone(), controller(&config))?;
            let result = forge.generate_and_check(&catalog, &model, &repairer)?;
            finish(&result, report.as_deref())
        }
        Command::Extract { output } => {
            let text = std::fs::read_to_string(&output)
                .with_context(|| format!("Cannot read {}", output.display()))?;
            let ctx = config.repair.extractor()?.extract(&text);
            if ctx.matched {
                println!("{}", ctx.render());
            } else {
                println!("{}", "No failure marker found".green());
            }
            Ok(())
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn controller(config: &ForgeConfig) -> SandboxController {
    let runtime = Arc::new(DockerCli::new(config.sandbox.runtime.clone()));
    SandboxController::new(runtime).with_echo(config.sandbox.echo)
}

fn finish(report: &CompilationReport, json: Option<&Path>) -> Result<()> {
    println!("\n{}", report.render());
    if let Some(path) = json {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        println!("Report written to {}", path.display());
    }
    Ok(())
}

fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("fuzzforge={}", level)));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}
