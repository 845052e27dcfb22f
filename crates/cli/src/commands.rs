//! Command implementations

use crate::config::CliConfig;
use crate::usb::{CdcBackend, UsbMonitor, UsbRegistry};
use anyhow::{Context, Result, anyhow};
use board::{
    Board, BoardEvent, BoardManager, Capability, CallbackResult, Firmware, Identity,
    UploadFlags, VendorBackend, MODELS,
};
use pool::{Pool, Task, TaskMessage};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub struct UploadOptions {
    pub reset_after: bool,
    pub wait: bool,
    pub nocheck: bool,
}

fn create_manager(config: &CliConfig) -> Result<BoardManager> {
    let context = rusb::Context::new().context("Failed to initialize libusb")?;
    let registry = UsbRegistry::default();

    let monitor = UsbMonitor::new(context, config.usb.filters.clone(), registry.clone())
        .context("Failed to start USB monitor")?;
    let backends: Vec<Arc<dyn VendorBackend>> = vec![Arc::new(CdcBackend::new(registry))];

    let manager = BoardManager::new(Box::new(monitor), backends, config.manager.manager_config());
    manager.refresh().context("Failed to enumerate boards")?;

    Ok(manager)
}

/// Pick the first online board matching `id` (any board when `None`)
fn get_board(manager: &BoardManager, id: Option<&str>) -> Result<Board> {
    let identity: Identity = id.unwrap_or("").parse()?;

    manager.find(&identity).ok_or_else(|| match id {
        Some(id) => anyhow!("Board '{}' not found", id),
        None => anyhow!("No board available"),
    })
}

fn describe(board: &Board) -> String {
    format!(
        "{} {} ({})",
        board.identity(),
        board.model_desc().unwrap_or("(unknown)"),
        board.capabilities()
    )
}

pub fn list(config: &CliConfig) -> Result<()> {
    let manager = create_manager(config)?;

    manager.list(|board, _| {
        println!("{}", describe(board));
        Ok(CallbackResult::Keep)
    })?;

    Ok(())
}

pub fn monitor(config: &CliConfig) -> Result<()> {
    let manager = create_manager(config)?;

    manager.list(|board, _| {
        println!("add {}", describe(board));
        Ok(CallbackResult::Keep)
    })?;

    manager.register_callback(|board, event| {
        let action = match event {
            BoardEvent::Added => "add",
            BoardEvent::Changed => "change",
            BoardEvent::Disappeared => "miss",
            BoardEvent::Dropped => "remove",
        };
        println!("{} {}", action, describe(board));
        Ok(CallbackResult::Keep)
    });

    manager.wait(|_| Ok(false), None)?;
    Ok(())
}

pub fn upload(
    config: &CliConfig,
    file: &Path,
    id: Option<&str>,
    options: UploadOptions,
) -> Result<()> {
    // Test the file before doing anything else
    Firmware::load(file).with_context(|| format!("Cannot load {}", file.display()))?;

    let manager = create_manager(config)?;
    let board = get_board(&manager, id)?;

    let mut wait = options.wait;
    if !board.has_capability(Capability::Upload) {
        if wait {
            println!("Waiting for device...\n  (hint: press button to reboot)");
        } else {
            println!("Triggering board reboot");
            board.reboot()?;
        }
    }

    loop {
        let timeout = (!wait).then(|| config.upload.reboot_delay());
        if board.wait_for(Capability::Upload, false, timeout)? {
            break;
        }
        println!("Reboot didn't work, press button manually");
        wait = true;
    }

    // The file may have been rebuilt while we waited
    let firmware = Firmware::load(file).with_context(|| format!("Cannot load {}", file.display()))?;

    let model = board
        .model()
        .filter(|m| m.is_valid())
        .ok_or_else(|| anyhow!("Unknown board model"))?;
    println!("Model: {}", model.desc);
    println!("Firmware: {}", file.display());
    println!(
        "Usage: {:.1}% ({} bytes)",
        firmware.size() as f64 / model.code_size as f64 * 100.0,
        firmware.size()
    );

    let flags = if options.nocheck {
        UploadFlags::NO_CHECK
    } else {
        UploadFlags::empty()
    };
    let pool = Pool::new(config.pool.pool_config());

    let target = board.clone();
    let task = Task::new(format!("upload {}", board.identity()), move |ctx| {
        target.upload(&firmware, flags, |done, total| {
            ctx.report_progress("Uploading", done as u64, total as u64);
        })
    });
    task.set_pool(&pool)?;
    task.add_listener(print_progress);

    println!("Uploading firmware...");
    task.start()?;
    task.join()?;
    println!();

    if options.reset_after {
        println!("Sending reset command");
        board.reset()?;
    } else {
        println!("Firmware uploaded, reset the board to use it");
    }

    Ok(())
}

fn print_progress(msg: &TaskMessage) {
    match msg {
        TaskMessage::Progress { action, value, max } if *max > 0 => {
            print!("\r{}... {}%", action, value * 100 / max);
            let _ = std::io::stdout().flush();
        }
        TaskMessage::Log(line) => println!("{}", line),
        TaskMessage::Status(status) => debug!("Upload task {}", status),
        TaskMessage::Progress { .. } => {}
    }
}

pub fn reset(config: &CliConfig, id: Option<&str>) -> Result<()> {
    let manager = create_manager(config)?;
    let board = get_board(&manager, id)?;

    println!("Sending reset command");
    board.reset()?;
    Ok(())
}

pub fn reboot(config: &CliConfig, id: Option<&str>) -> Result<()> {
    let manager = create_manager(config)?;
    let board = get_board(&manager, id)?;

    println!("Triggering board reboot");
    board.reboot()?;
    Ok(())
}

pub fn identify(file: &Path) -> Result<()> {
    let firmware =
        Firmware::load(file).with_context(|| format!("Cannot load {}", file.display()))?;

    match firmware.identify() {
        Some(model) => println!("{}: {} ({})", firmware.name(), model.desc, model.name),
        None => println!("{}: unknown", firmware.name()),
    }
    Ok(())
}

pub fn models() -> Result<()> {
    for model in MODELS {
        println!(
            "{:<12} {:<12} {:>7} bytes  {}",
            model.name, model.mcu, model.code_size, model.desc
        );
    }
    Ok(())
}
