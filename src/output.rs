//! Human and JSON renderings of the inventory

use std::io::{self, Write};

use serde::Serialize;

use avdemon_app::{AvdRecord, Inventory, InventoryStatus};
use avdemon_core::{AvdImage, LifecyclePhase, MetadataSource};

/// One image as printed by `list`, `start`, `stop` and the headless stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRow {
    pub name: String,
    pub display_name: String,
    pub device: String,
    pub api_level: String,
    pub target: String,
    pub metadata_source: MetadataSource,
    pub phase: LifecyclePhase,
    pub is_running: bool,
}

impl ImageRow {
    pub fn from_record(record: &AvdRecord) -> Self {
        Self {
            phase: record.phase(),
            is_running: record.is_running,
            ..Self::from_image(&record.image)
        }
    }

    /// Row for an image that has no record (placeholders)
    pub fn from_image(image: &AvdImage) -> Self {
        Self {
            name: image.name.clone(),
            display_name: image.display_name.clone(),
            device: image.device.clone(),
            api_level: image.api_level.clone(),
            target: image.target.clone(),
            metadata_source: image.metadata_source,
            phase: LifecyclePhase::Stopped,
            is_running: false,
        }
    }
}

/// `list --json` document
#[derive(Debug, Clone, Serialize)]
pub struct InventoryReport {
    pub status: InventoryStatus,
    pub images: Vec<ImageRow>,
    /// Set when `images` is empty because nothing was found or enumeration timed out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<ImageRow>,
}

impl InventoryReport {
    pub fn from_inventory(inventory: &Inventory) -> Self {
        Self {
            status: inventory.status,
            images: rows(inventory),
            placeholder: inventory.placeholder().as_ref().map(ImageRow::from_image),
        }
    }
}

/// Rows in name order
pub fn rows(inventory: &Inventory) -> Vec<ImageRow> {
    inventory.records.values().map(ImageRow::from_record).collect()
}

/// Render `rows` as an aligned text table
pub fn write_table<W: Write>(out: &mut W, rows: &[ImageRow]) -> io::Result<()> {
    const HEADERS: [&str; 5] = ["NAME", "DEVICE", "API", "TARGET", "STATE"];

    let cells: Vec<[String; 5]> = rows
        .iter()
        .map(|row| {
            [
                row.name.clone(),
                row.device.clone(),
                row.api_level.clone(),
                row.target.clone(),
                row.phase.to_string(),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(str::len);
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.chars().count());
        }
    }

    write_line(out, &HEADERS.map(String::from), &widths)?;
    for row in &cells {
        write_line(out, row, &widths)?;
    }
    Ok(())
}

fn write_line<W: Write>(out: &mut W, cells: &[String; 5], widths: &[usize; 5]) -> io::Result<()> {
    let line = cells
        .iter()
        .zip(widths.iter())
        .map(|(cell, width)| format!("{:<width$}", cell, width = width))
        .collect::<Vec<_>>()
        .join("  ");
    writeln!(out, "{}", line.trim_end())
}

/// Human-readable inventory: the table, or the placeholder hint when empty
pub fn write_inventory<W: Write>(out: &mut W, inventory: &Inventory) -> io::Result<()> {
    if let Some(placeholder) = inventory.placeholder() {
        writeln!(
            out,
            "{} ({}): {}",
            placeholder.display_name, placeholder.device, placeholder.target
        )?;
        return Ok(());
    }
    write_table(out, &rows(inventory))
}
