//! owfs CLI - Work with 1-Wire file systems in simulated device images.
//!
//! Usage:
//!   owfs --image <image.json> <command> [args...]
//!
//! Examples:
//!   owfs --image bus.json new --kind eprom --pages 64   # Add a blank EPROM
//!   owfs --image bus.json format                        # Write an empty root
//!   owfs --image bus.json put notes.txt NOTE.001        # Copy a file in
//!   owfs --image bus.json --dir SUB ls                  # List a subdirectory
//!   owfs --image bus.json append LOG.100 entry.bin      # Append to an add file

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, info, LevelFilter};

use owfs_core::device::SimDevice;
use owfs_core::{
    load_image, save_image, AddMode, Bus, EepromBank, EpromBank, ErrorKind, ListEntry,
    MemoryBank, RomId, Session, SessionConfig, SimBus,
};

/// 1-Wire file system CLI
#[derive(Parser, Debug)]
#[command(name = "owfs")]
#[command(about = "Manage 1-Wire file systems in a device image")]
struct Args {
    /// JSON image holding the simulated devices
    #[arg(short, long)]
    image: PathBuf,

    /// JSON session configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial number of the device to use (first device by default)
    #[arg(short, long)]
    device: Option<RomId>,

    /// Directory to work in
    #[arg(long)]
    dir: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a blank device to the image, creating the image if needed
    New {
        #[arg(long, value_enum, default_value_t = Kind::Eeprom)]
        kind: Kind,
        #[arg(long, default_value_t = 32)]
        pages: usize,
        /// Serial number; derived from the device count when omitted
        #[arg(long)]
        rom: Option<RomId>,
    },
    /// Write an empty root directory
    Format,
    /// List the directory
    Ls,
    /// Create a subdirectory
    Mkdir { path: String },
    /// Remove an empty subdirectory
    Rmdir { path: String },
    /// Copy a local file onto the device, replacing its contents
    Put { local: PathBuf, name: String },
    /// Copy a file off the device (to stdout without a local path)
    Get { name: String, local: Option<PathBuf> },
    /// Delete a file
    Rm { name: String },
    /// Rename a file within its directory
    Mv { from: String, to: String },
    /// Set the attribute of a file (0/1) or directory (0/2)
    Attrib { path: String, value: u8 },
    /// Append a local file to an add file (extension 100)
    Append { name: String, local: PathBuf },
    /// Seal an add file
    Terminate { name: String },
    /// Show the devices on the bus and the state of the selected one
    Info,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Eeprom,
    Eprom,
}

fn init_logging(verbose: bool) {
    let mut builder = pretty_env_logger::formatted_builder();
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    if verbose {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();
}

/// Add a blank device to the image at `path`.
fn new_device(
    path: &Path,
    kind: Kind,
    pages: usize,
    rom: Option<RomId>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut bus = if path.exists() {
        load_image(path)?
    } else {
        SimBus::new()
    };
    let serial = bus.devices().len() as u8 + 1;
    let device: SimDevice = match kind {
        Kind::Eeprom => {
            let rom = rom.unwrap_or(RomId::new([0x0C, serial, 0, 0, 0, 0, 0, 0]));
            EepromBank::new(rom, pages).into()
        }
        Kind::Eprom => {
            let rom = rom.unwrap_or(RomId::new([0x0B, serial, 0, 0, 0, 0, 0, 0]));
            EpromBank::new(rom, pages).into()
        }
    };
    let rom = device.rom();
    if bus.device(&rom).is_some() {
        return Err(format!("device {} is already in the image", rom).into());
    }
    bus.attach(device);
    save_image(path, &bus)?;
    eprintln!("Added {:?} device {} with {} pages", kind, rom, pages);
    Ok(())
}

/// Open `name`, creating it when it does not exist yet.
fn open_or_create(
    session: &mut Session<SimBus>,
    rom: &RomId,
    name: &str,
) -> Result<usize, Box<dyn std::error::Error>> {
    match session.open_file(rom, name) {
        Ok(handle) => Ok(handle),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let (handle, max) = session.create_file(rom, name)?;
            debug!("created {} ({} bytes available)", name, max);
            Ok(handle)
        }
        Err(e) => Err(e.into()),
    }
}

fn list(session: &mut Session<SimBus>, rom: &RomId) -> Result<(), Box<dyn std::error::Error>> {
    println!("Directory of {}", session.current_path());
    for entry in session.list_directory(rom)? {
        match &entry {
            ListEntry::Record(file) if file.entry.is_directory() => {
                let flag = if file.is_hidden() { "H" } else { " " };
                println!("  {:<8} {} <DIR>    page {:3}", entry.to_string(), flag, file.start_page);
            }
            ListEntry::Record(file) => {
                let flag = if file.is_read_only() { "R" } else { " " };
                println!(
                    "  {:<8} {} {:3} pages page {:3}",
                    entry.to_string(),
                    flag,
                    file.num_pages,
                    file.start_page
                );
            }
            _ => println!("  {}", entry),
        }
    }
    Ok(())
}

fn show_info(session: &mut Session<SimBus>, rom: &RomId) -> Result<(), Box<dyn std::error::Error>> {
    for device in session.bus().devices() {
        let bank = device.bank();
        let marker = if device.rom() == *rom { "*" } else { " " };
        println!(
            "{} {} {:<20} {:3} pages",
            marker,
            device.rom(),
            bank.description(),
            bank.number_pages()
        );
    }
    let bitmap = session.read_bitmap(rom)?;
    println!(
        "{} pages used, {} free, {} bytes writable",
        bitmap.count_set(),
        bitmap.count_free(),
        bitmap.max_writable_bytes()
    );
    Ok(())
}

fn run(
    session: &mut Session<SimBus>,
    rom: &RomId,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::New { .. } => return Err("new does not run against a loaded image".into()),
        Command::Format => {
            session.format(rom)?;
            eprintln!("Formatted {}", rom);
        }
        Command::Ls => list(session, rom)?,
        Command::Mkdir { path } => session.create_dir(rom, &path)?,
        Command::Rmdir { path } => session.remove_dir(rom, &path)?,
        Command::Put { local, name } => {
            let data = std::fs::read(&local)?;
            let handle = open_or_create(session, rom, &name)?;
            session.write_file(rom, handle, &data)?;
            session.close_file(handle)?;
            eprintln!("Wrote {} bytes to {}", data.len(), name);
        }
        Command::Get { name, local } => {
            let handle = session.open_file(rom, &name)?;
            let data = session.read_file(rom, handle)?;
            session.close_file(handle)?;
            match local {
                Some(path) => std::fs::write(path, &data)?,
                None => std::io::stdout().write_all(&data)?,
            }
        }
        Command::Rm { name } => session.delete_file(rom, &name)?,
        Command::Mv { from, to } => {
            let handle = session.open_file(rom, &from)?;
            session.rename_file(rom, handle, &to)?;
            session.close_file(handle)?;
        }
        Command::Attrib { path, value } => session.set_attribute(rom, &path, value)?,
        Command::Append { name, local } => {
            let data = std::fs::read(&local)?;
            let handle = open_or_create(session, rom, &name)?;
            session.write_add_file(rom, handle, AddMode::Append, &data)?;
            session.close_file(handle)?;
            eprintln!("Appended {} bytes to {}", data.len(), name);
        }
        Command::Terminate { name } => {
            let pages = session.terminate_add_file(rom, &name)?;
            eprintln!("Terminated {} ({} pages)", name, pages);
        }
        Command::Info => show_info(session, rom)?,
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Command::New { kind, pages, rom } = args.command {
        return new_device(&args.image, kind, pages, rom);
    }

    let config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    let bus = load_image(&args.image)?;
    let mut session = Session::with_config(bus, config);

    let rom = match args.device {
        Some(rom) => rom,
        None => *session
            .bus_mut()
            .search()?
            .first()
            .ok_or("the image holds no devices")?,
    };
    session.select_device(&rom)?;
    if let Some(dir) = &args.dir {
        session.change_directory(&rom, dir)?;
    }

    run(&mut session, &rom, args.command)?;

    if session.is_job_open(&rom) {
        session.commit_program_job(&rom)?;
        info!("committed program job on {}", rom);
    }
    save_image(&args.image, session.bus())?;
    Ok(())
}
