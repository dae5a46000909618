//! Subcommand handlers for the epochal CLI.

use std::path::{Path, PathBuf};

use anyhow::Context;
use epochal_core::ParamGroups;
use epochal_core::persistence::load_json;
use epochal_train::{ControlConfig, LrSchedule, LrScheduler, LrSnapshot, load_config};
use serde::Serialize;
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Simulate an LR schedule and print the rates of every epoch
    Preview(PreviewArgs),
    /// Pretty-print every JSON state file under a saved state directory
    Inspect {
        /// State directory written by a training run
        dir: PathBuf,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct PreviewArgs {
    /// Configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of epochs to simulate
    #[arg(short, long, default_value_t = 10)]
    pub epochs: u32,

    /// Training steps per epoch
    #[arg(short, long, default_value_t = 100)]
    pub steps: usize,

    /// Epoch to start at, as when resuming a run
    #[arg(long, default_value_t = 1)]
    pub start_epoch: u32,

    /// Parameter group and its initial learning rate, as name=value (repeatable)
    #[arg(long = "lr", value_parser = parse_lr)]
    pub lr: Vec<(String, f64)>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Write the default configuration to a TOML file
    Init {
        #[arg(short, long, default_value = "epochal.toml")]
        path: PathBuf,
    },
    /// Show the resolved configuration (file, then EPOCHAL_* variables)
    Show {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

pub(crate) fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Preview(args) => handle_preview(&args),
        Commands::Inspect { dir } => handle_inspect(&dir),
        Commands::Config { action } => handle_config(action),
    }
}

fn parse_lr(s: &str) -> Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{s}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing parameter group name in '{s}'"));
    }
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid learning rate in '{s}': {e}"))?;
    Ok((name.to_string(), value))
}

/// Rates observed during one simulated epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct EpochPreview {
    pub epoch: u32,
    #[serde(flatten)]
    pub lrs: LrSnapshot,
}

/// Drive `config`'s schedule through `epochs` epochs of `steps` steps.
pub(crate) fn simulate(
    config: &ControlConfig,
    groups: &[(String, f64)],
    epochs: u32,
    steps: usize,
    start_epoch: u32,
) -> anyhow::Result<Vec<EpochPreview>> {
    let mut optimizer = if groups.is_empty() {
        ParamGroups::from_pairs([("default", 1.0)])
    } else {
        ParamGroups::from_pairs(groups.iter().map(|(name, lr)| (name.as_str(), *lr)))
    };
    let mut scheduler = LrScheduler::from_config(&config.scheduler, &optimizer)?;
    scheduler.initialize(&mut optimizer, start_epoch, None)?;
    info!(scheduler = scheduler.name(), epochs, steps, start_epoch, "Simulating LR schedule");

    let mut previews = Vec::with_capacity(epochs as usize);
    for _ in 0..epochs {
        let epoch = scheduler.current_epoch();
        scheduler.event_before_train_epoch(&mut optimizer, steps)?;
        for step in 0..steps {
            scheduler.event_after_train_step(&mut optimizer, step)?;
        }
        scheduler.event_after_train_epoch(&mut optimizer)?;

        let lrs = scheduler
            .last_epoch_lrs()
            .cloned()
            .with_context(|| format!("no LR data recorded for epoch {epoch}"))?;
        debug!(epoch, "Epoch simulated");
        previews.push(EpochPreview { epoch, lrs });
    }
    Ok(previews)
}

fn handle_preview(args: &PreviewArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref(), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    let previews = simulate(&config, &args.lr, args.epochs, args.steps, args.start_epoch)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&previews)?);
        return Ok(());
    }

    println!("{:>6}  {:<16} {:>14} {:>14}", "epoch", "group", "initial", "final");
    for preview in &previews {
        for (group, init) in &preview.lrs.init {
            let last = preview.lrs.last.get(group).copied().unwrap_or(f64::NAN);
            println!(
                "{:>6}  {:<16} {:>14.6e} {:>14.6e}",
                preview.epoch, group, init, last
            );
        }
    }
    Ok(())
}

/// Every `*.json` file under `dir`, sorted by path.
pub(crate) fn state_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!("State directory does not exist: {}", dir.display());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == "json")
        {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn handle_inspect(dir: &Path) -> anyhow::Result<()> {
    let files = state_files(dir)?;
    if files.is_empty() {
        println!("No state files found in {}", dir.display());
        return Ok(());
    }
    for path in files {
        let value: serde_json::Value = load_json(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?
            .with_context(|| format!("State file vanished: {}", path.display()))?;
        let relative = path.strip_prefix(dir).unwrap_or(&path);
        println!("== {}", relative.display());
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

fn handle_config(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { path } => {
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            let toml_str = toml::to_string_pretty(&ControlConfig::default())?;
            std::fs::write(&path, &toml_str)?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
        ConfigAction::Show { config } => {
            let config = load_config(config.as_deref(), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epochal_train::{ExponentialConfig, SchedulerConfig};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_parse_lr() {
        assert_eq!(parse_lr("head=0.5").unwrap(), ("head".to_string(), 0.5));
        assert_eq!(parse_lr(" body = 1e-3 ").unwrap(), ("body".to_string(), 1e-3));
        assert!(parse_lr("head").is_err());
        assert!(parse_lr("=0.1").is_err());
        assert!(parse_lr("head=fast").is_err());
    }

    #[test]
    fn test_simulate_exponential() {
        let config = ControlConfig {
            scheduler: SchedulerConfig::Exponential(ExponentialConfig { gamma: 0.5 }),
            ..Default::default()
        };
        let previews = simulate(&config, &[("head".into(), 1.0)], 3, 2, 1).unwrap();

        let finals: Vec<f64> = previews.iter().map(|p| p.lrs.last["head"]).collect();
        assert_eq!(finals, vec![1.0, 0.5, 0.25]);
        assert_eq!(previews[2].epoch, 3);
        assert_eq!(previews[0].lrs.steps["head"], vec![1.0, 1.0]);
    }

    #[test]
    fn test_simulate_from_start_epoch() {
        let config = ControlConfig {
            scheduler: SchedulerConfig::Exponential(ExponentialConfig { gamma: 0.5 }),
            ..Default::default()
        };
        let previews = simulate(&config, &[], 1, 1, 3).unwrap();
        assert_eq!(previews[0].epoch, 3);
        assert_eq!(previews[0].lrs.last["default"], 0.25);
    }

    #[test]
    fn test_state_files_are_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("early_stopper")).unwrap();
        std::fs::write(dir.path().join("early_stopper/internal_state.json"), "{}").unwrap();
        std::fs::write(dir.path().join("final_lr_dict.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "skip").unwrap();

        let files: Vec<PathBuf> = state_files(dir.path())
            .unwrap()
            .into_iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            files,
            vec![
                PathBuf::from("early_stopper/internal_state.json"),
                PathBuf::from("final_lr_dict.json"),
            ]
        );
        assert!(state_files(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_default_config_toml_roundtrip() {
        let toml_str = toml::to_string_pretty(&ControlConfig::default()).unwrap();
        let parsed: ControlConfig = epochal_core::config::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed, ControlConfig::default());
    }
}
