//! One-shot subcommands: `list`, `start`, `stop`, `config`
//!
//! Each command builds its own engine, refreshes once and prints to the
//! given writer. Diagnostics go to the log file, results to `out`.

use std::io::Write;
use std::path::Path;

use avdemon_app::config::{config_file, load_settings, save_settings, set_sdk_path};
use avdemon_app::{Dispatch, Engine, StopReport};
use avdemon_core::prelude::*;
use avdemon_daemon::CommandRunner;

use crate::output::{write_inventory, write_table, ImageRow, InventoryReport};

/// `avdemon list [--json]`
pub async fn list<R, W>(engine: &Engine<R>, json: bool, out: &mut W) -> Result<()>
where
    R: CommandRunner + Sync + 'static,
    W: Write,
{
    engine.refresh().await;
    let inventory = engine.snapshot();

    if json {
        let report = InventoryReport::from_inventory(&inventory);
        serde_json::to_writer_pretty(&mut *out, &report)?;
        writeln!(out)?;
    } else {
        write_inventory(out, &inventory)?;
    }
    Ok(())
}

/// `avdemon start <name>`: launch, wait for confirmation, print the result
pub async fn start<R, W>(engine: &Engine<R>, name: &str, out: &mut W) -> Result<()>
where
    R: CommandRunner + Sync + 'static,
    W: Write,
{
    engine.refresh().await;

    if engine.start(name).await? == Dispatch::Ignored {
        writeln!(out, "{} already has an operation in flight", name)?;
    }
    engine.settle().await;

    print_record(engine, name, out)
}

/// `avdemon stop <name>`: stop, wait for the settle pass, print the result
pub async fn stop<R, W>(engine: &Engine<R>, name: &str, out: &mut W) -> Result<StopReport>
where
    R: CommandRunner + Sync + 'static,
    W: Write,
{
    engine.refresh().await;

    let report = engine.stop(name).await?;
    match (report.dispatch, report.warning()) {
        (Dispatch::Ignored, _) => writeln!(out, "{} already has an operation in flight", name)?,
        (_, Some(warning)) => writeln!(out, "warning: {}", warning)?,
        (_, None) => {}
    }
    engine.settle().await;

    print_record(engine, name, out)?;
    Ok(report)
}

/// `avdemon config show`
pub fn config_show<W: Write>(config_dir: &Path, out: &mut W) -> Result<()> {
    let settings = load_settings(config_dir);
    let content = toml_string(&settings)?;
    writeln!(out, "# {}", config_file(config_dir).display())?;
    write!(out, "{}", content)?;
    Ok(())
}

/// `avdemon config set-sdk <path>`
pub fn config_set_sdk<W: Write>(config_dir: &Path, path: &Path, out: &mut W) -> Result<()> {
    let mut settings = load_settings(config_dir);
    set_sdk_path(&mut settings, path)?;
    save_settings(config_dir, &settings)?;

    if let Some(path) = &settings.sdk.path {
        writeln!(out, "Android SDK set to {}", path.display())?;
    }
    Ok(())
}

fn print_record<R, W>(engine: &Engine<R>, name: &str, out: &mut W) -> Result<()>
where
    R: CommandRunner + Sync + 'static,
    W: Write,
{
    let record = engine
        .store()
        .record(name)
        .ok_or_else(|| Error::image_not_found(name))?;
    write_table(out, &[ImageRow::from_record(&record)])?;
    Ok(())
}

fn toml_string(settings: &avdemon_app::Settings) -> Result<String> {
    toml::to_string_pretty(settings)
        .map_err(|e| Error::config(format!("Failed to serialize settings: {}", e)))
}
