//! DMXFlow - command line front end
//!
//! Detects USB DMX interfaces, shows their status, sends test values and
//! edits the saved universe patch.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use dmxflow_core::{LogConfig, OutputConfig, PatchMap};
use dmxflow_output::{DeviceProbe, LoopbackBus, OutputPlugin, OutputRouter, UsbDmxOutput};

mod cli;
mod logging_setup;

use cli::{Cli, Command, ConfigAction, PatchAction};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig {
        level: cli.log_level.clone(),
        file_output: cli.log_dir.is_some(),
        log_dir: cli.log_dir.clone().unwrap_or_else(|| LogConfig::default().log_dir),
        ..LogConfig::default()
    };
    let _log_guard = logging_setup::init(&log_config)?;

    let config = OutputConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load output config")?;

    match cli.command {
        Command::List => list(&config, cli.loopback),
        Command::Info { output } => show_info(&config, cli.loopback, output),
        Command::Send {
            output,
            channel,
            value,
            hold_ms,
        } => send(&config, cli.loopback, output, channel, value, hold_ms),
        Command::Patch { file, action } => {
            let path = match file.or_else(default_patch_path) {
                Some(path) => path,
                None => bail!("No patch file given and no config directory available"),
            };
            patch(&config, cli.loopback, &path, action)
        }
        Command::Config { action } => config_command(&config, cli.config.as_deref(), action),
    }
}

/// The USB DMX plugin, on real hardware or on a loopback bus
fn build_plugin(config: &OutputConfig, loopback: Option<usize>) -> UsbDmxOutput {
    match loopback {
        Some(count) => {
            info!("Using {} loopback interface(s)", count);
            let bus: Arc<dyn DeviceProbe> = Arc::new(LoopbackBus::with_serial_devices(count));
            UsbDmxOutput::with_probes(config.clone(), vec![bus])
        }
        None => UsbDmxOutput::new(config.clone()),
    }
}

fn list(config: &OutputConfig, loopback: Option<usize>) -> Result<()> {
    let plugin = build_plugin(config, loopback);
    if plugin.output_count() == 0 {
        println!("No devices found");
        return Ok(());
    }
    for descriptor in plugin.outputs() {
        println!("{}", descriptor);
    }
    Ok(())
}

fn show_info(config: &OutputConfig, loopback: Option<usize>, output: Option<u32>) -> Result<()> {
    let plugin = build_plugin(config, loopback);
    print!("{}", plugin.info_text(output.map(|o| o - 1)));
    Ok(())
}

fn send(
    config: &OutputConfig,
    loopback: Option<usize>,
    output: u32,
    channel: u32,
    value: u8,
    hold_ms: u64,
) -> Result<()> {
    let mut plugin = build_plugin(config, loopback);
    let output = output - 1;
    if output as usize >= plugin.output_count() {
        bail!(
            "Output {} does not exist ({} output(s) found)",
            output + 1,
            plugin.output_count()
        );
    }

    plugin
        .open(output)
        .with_context(|| format!("Failed to open output {}", output + 1))?;
    plugin.write_channel(output, channel - 1, value);
    println!("Output {}: channel {} = {}", output + 1, channel, value);

    // Includes the settle delay before the first frame
    thread::sleep(config.settle_delay() + Duration::from_millis(hold_ms));
    print!("{}", plugin.info_text(Some(output)));

    if let Err(e) = plugin.close(output) {
        warn!("{}", e);
    }
    Ok(())
}

fn default_patch_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("DMXFlow").join("patch.ron"))
}

fn read_patch(config: &OutputConfig, path: &Path) -> Result<PatchMap> {
    if !path.exists() {
        return Ok(PatchMap::new(config.universes));
    }
    dmxflow_io::load_patch(path).with_context(|| format!("Failed to load patch {:?}", path))
}

fn write_patch(patch: &PatchMap, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    dmxflow_io::save_patch(patch, path).with_context(|| format!("Failed to save patch {:?}", path))
}

fn patch(
    config: &OutputConfig,
    loopback: Option<usize>,
    path: &Path,
    action: PatchAction,
) -> Result<()> {
    let mut router = OutputRouter::from_config(config);
    router.append_plugin(Box::new(build_plugin(config, loopback)));

    let rejected = router.load_patch_map(read_patch(config, path)?);
    for entry in rejected {
        warn!("Ignoring patch for universe {}", entry.universe + 1);
    }

    match action {
        PatchAction::Show => {
            print!("{}", router.plugin_status(None));
        }
        PatchAction::Set {
            universe,
            plugin,
            output,
        } => {
            router.set_patch(universe - 1, &plugin, output - 1)?;
            write_patch(router.patch_map(), path)?;
            print!("{}", router.plugin_status(None));
            println!("Saved to {}", path.display());
        }
        PatchAction::Save { path: destination } => {
            write_patch(router.patch_map(), &destination)?;
            println!("Saved to {}", destination.display());
        }
    }
    Ok(())
}

fn config_command(config: &OutputConfig, path: Option<&Path>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigAction::Init { force } => {
            let path = match path.map(Path::to_path_buf).or_else(OutputConfig::default_path) {
                Some(path) => path,
                None => bail!("No config path given and no config directory available"),
            };
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            OutputConfig::default()
                .save(&path)
                .with_context(|| format!("Failed to write {:?}", path))?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
