use anyhow::{Context, Result};
use clap::{Args, Parser};
use pinguino_upload::board::BoardDescriptor;
use pinguino_upload::device_ids;
use pinguino_upload::protocol::{read_device_id, read_flash_range, read_version, reset};
use pinguino_upload::session::{Connector, LogSink, UploadSession};
use pinguino_upload::usb::{DeviceFilter, UsbBootloader, UsbConnector};
use std::io::Write;
use std::path::PathBuf;

// Bootloader addresses are 24 bits wide.
const ADDRESS_SPACE_END: u32 = 0x100_0000;

#[derive(Parser, Debug)]
#[command(name = "pinguino-upload", version)]
enum Opt {
    /// List all attached bootloaders (USB ID 04d8:feaa)
    List {
        #[command(flatten)]
        spec: DeviceSpec,
    },

    /// Show the bootloader version and processor of a device
    Info {
        #[command(flatten)]
        spec: DeviceSpec,
    },

    /// Erase the device and write a HEX file to it, then start the application
    Upload {
        #[command(flatten)]
        spec: DeviceSpec,

        #[command(flatten)]
        board: BoardArgs,

        file: PathBuf,
    },

    /// Read a range of flash into a raw binary file
    Read {
        #[command(flatten)]
        spec: DeviceSpec,

        /// First address to read (decimal or 0x-prefixed hex)
        #[arg(long, value_parser = parse_number)]
        start: u32,

        /// Number of bytes to read
        #[arg(long, value_parser = parse_number)]
        length: u32,

        file: PathBuf,
    },

    /// Leave the bootloader and start the application
    Reset {
        #[command(flatten)]
        spec: DeviceSpec,
    },
}

#[derive(Args, Debug)]
struct DeviceSpec {
    /// USB bus number
    #[arg(short, long)]
    bus: Option<u8>,

    /// USB device address on the bus
    #[arg(short, long)]
    address: Option<u8>,
}

impl DeviceSpec {
    fn connector(&self) -> Result<UsbConnector> {
        UsbConnector::new(DeviceFilter {
            bus: self.bus,
            address: self.address,
        })
        .map_err(Into::into)
    }

    fn open(&self) -> Result<UsbBootloader> {
        Ok(self.connector()?.connect()?)
    }
}

/// Board the image was compiled for, as reported by the build system.
#[derive(Args, Debug)]
struct BoardArgs {
    /// Processor name, e.g. 18f2550 or 18f26j50
    #[arg(short, long = "proc")]
    processor: String,

    /// First address of user flash
    #[arg(long, value_parser = parse_number)]
    memstart: u32,

    /// End of user flash (exclusive)
    #[arg(long, value_parser = parse_number)]
    memend: u32,
}

impl BoardArgs {
    fn descriptor(&self) -> Result<BoardDescriptor> {
        anyhow::ensure!(
            self.memstart < self.memend,
            "memstart ({:#x}) must be below memend ({:#x})",
            self.memstart,
            self.memend
        );
        anyhow::ensure!(
            self.memend <= ADDRESS_SPACE_END,
            "memend ({:#x}) is past the end of the 24-bit address space",
            self.memend
        );
        Ok(BoardDescriptor::new(&self.processor, self.memstart, self.memend))
    }
}

fn parse_number(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("PINGUINO_UPLOAD_LOG", "info")
            .write_style("PINGUINO_UPLOAD_LOG_STYLE"),
    )
    .init();

    match Opt::parse() {
        Opt::List { spec } => list(&spec)?,
        Opt::Info { spec } => {
            let mut dev = spec.open()?;

            let version = read_version(&mut dev)?;
            let device_id = read_device_id(&mut dev)?;
            println!("Bootloader version: {version}");
            println!("Device ID: {device_id:#06x}");
            println!(
                "Processor: {}",
                device_ids::lookup(device_id).unwrap_or("UNKNOWN")
            );
        }
        Opt::Upload { spec, board, file } => {
            let board = board.descriptor()?;
            let mut connector = spec.connector()?;

            let mut session = UploadSession::new(&board, LogSink);
            session
                .upload_file(&mut connector, &file)
                .with_context(|| format!("uploading {} to {board}", file.display()))?;
        }
        Opt::Read {
            spec,
            start,
            length,
            file: path,
        } => {
            let mut dev = spec.open()?;

            let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
            read_flash_range(&mut dev, start, length, &mut file)?;
            file.flush()?;
        }
        Opt::Reset { spec } => reset(&mut spec.open()?)?,
    };

    Ok(())
}

fn list(spec: &DeviceSpec) -> Result<()> {
    for dev in spec.connector()?.list()? {
        println!("{dev}");
    }
    Ok(())
}
