use crate::board::BoardDescriptor;
use crate::device_ids;
use crate::hex_file::{self, HexFormatError, MemoryImage};
use crate::programmer;
use crate::protocol::{self, Transport};
use log::{debug, info, warn};
use std::fmt::Display;
use std::path::Path;
use std::sync::mpsc::Sender;
use thiserror::Error;

/// Append-only destination for human-readable progress lines.
pub trait StatusSink {
    fn status(&mut self, line: &str);
}

impl StatusSink for Vec<String> {
    fn status(&mut self, line: &str) {
        self.push(line.to_owned());
    }
}

/// Lets a session run on a worker thread while another thread displays its progress. Lines sent
/// after the receiver hangs up are dropped.
impl StatusSink for Sender<String> {
    fn status(&mut self, line: &str) {
        let _ = self.send(line.to_owned());
    }
}

/// Forwards every line to `log::info!`.
#[derive(Copy, Clone, Debug, Default)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn status(&mut self, line: &str) {
        info!("{line}");
    }
}

/// Finds the bootloader and hands out an exclusive, claimed handle to it. The handle releases the
/// device when dropped.
pub trait Connector {
    type Handle: Transport;

    fn connect(&mut self) -> Result<Self::Handle, DeviceError>;
}

/// Where a session is, or where it stopped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    DeviceSearch,
    DeviceOpen,
    Identify,
    VersionCheck,
    Erasing,
    Writing,
    Resetting,
    Done,
    DeviceNotFound,
    OpenFailed,
    ProcMismatch,
    Aborted,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// One upload of one image to one device.
pub struct UploadSession<'a, S: StatusSink> {
    board: &'a BoardDescriptor,
    sink: S,
    state: SessionState,
}

impl<'a, S: StatusSink> UploadSession<'a, S> {
    pub fn new(board: &'a BoardDescriptor, sink: S) -> Self {
        Self {
            board,
            sink,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Parse the HEX file at `path` and upload it. A file that cannot be read or parsed fails the
    /// session before any device is looked for.
    pub fn upload_file(
        &mut self,
        connector: &mut impl Connector,
        path: impl AsRef<Path>,
    ) -> Result<(), UploadError> {
        let path = path.as_ref();

        let image = match hex_file::load(path, self.board) {
            Ok(image) => image,
            Err(e) => {
                self.sink.status(&format!("Cannot use {}: {e}", path.display()));
                self.state = SessionState::Aborted;
                return Err(e.into());
            }
        };

        self.upload(connector, &image)?;
        self.sink
            .status(&format!("{} successfully uploaded", path.display()));
        Ok(())
    }

    /// Run the session for an already-parsed image. On return the device handle has been
    /// released, and if erasing started the device has been sent exactly one reset.
    pub fn upload(
        &mut self,
        connector: &mut impl Connector,
        image: &MemoryImage,
    ) -> Result<(), UploadError> {
        let result = self.run(connector, image);

        if let Err(e) = &result {
            self.state = match e {
                UploadError::Device(
                    DeviceError::NotFound
                    | DeviceError::MultipleDevices
                    | DeviceError::Enumeration(_),
                ) => SessionState::DeviceNotFound,
                UploadError::Device(_) => SessionState::OpenFailed,
                UploadError::ProcMismatch { .. } | UploadError::UnknownProcessor { .. } => {
                    SessionState::ProcMismatch
                }
                _ => SessionState::Aborted,
            };
            self.sink.status(&format!("Upload failed: {e}"));
        }

        result
    }

    fn run(
        &mut self,
        connector: &mut impl Connector,
        image: &MemoryImage,
    ) -> Result<(), UploadError> {
        self.enter(SessionState::DeviceSearch);
        let mut device = connector.connect().inspect_err(|e| {
            if matches!(e, DeviceError::NotFound) {
                self.sink.status("Pinguino not found");
                self.sink
                    .status("Is your device connected and/or in bootloader mode?");
            }
        })?;
        self.enter(SessionState::DeviceOpen);
        self.sink.status("Pinguino found");

        self.identify(&mut device)?;

        self.enter(SessionState::VersionCheck);
        let version = protocol::read_version(&mut device)?;
        self.sink.status(&format!("Pinguino bootloader v{version}"));

        // Every path from here on resets the device exactly once.
        let flashed = self.flash(&mut device, image);

        self.enter(SessionState::Resetting);
        self.sink.status("Resetting ...");
        let reset = protocol::reset(&mut device);

        match (flashed, reset) {
            (Err(e), Err(reset_err)) => {
                warn!("Reset after failed upload also failed: {reset_err}");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(reset_err)) => Err(reset_err.into()),
            (Ok(()), Ok(())) => {
                self.enter(SessionState::Done);
                Ok(())
            }
        }
    }

    fn identify(&mut self, device: &mut impl Transport) -> Result<(), UploadError> {
        self.enter(SessionState::Identify);

        let device_id = protocol::read_device_id(device)?;
        let Some(name) = device_ids::lookup(device_id) else {
            self.sink.status(&format!(
                "Compiled for {} but device ID {device_id:#06x} is unknown",
                self.board.processor
            ));
            return Err(UploadError::UnknownProcessor {
                expected: self.board.processor.clone(),
                device_id,
            });
        };

        if !self.board.matches_processor(name) {
            self.sink.status(&format!(
                "Compiled for {} but device has {name}",
                self.board.processor
            ));
            return Err(UploadError::ProcMismatch {
                expected: self.board.processor.clone(),
                actual: name,
            });
        }

        self.sink.status(&format!("{name} (id={device_id:#x})"));
        Ok(())
    }

    fn flash(
        &mut self,
        device: &mut impl Transport,
        image: &MemoryImage,
    ) -> Result<(), UploadError> {
        self.enter(SessionState::Erasing);
        self.sink.status("Erasing ...");
        programmer::erase(device, image, self.board)?;

        self.enter(SessionState::Writing);
        self.sink.status("Writing ...");
        let written = programmer::write(device, image)?;
        self.sink.status(&format!("{written} bytes written"));

        Ok(())
    }

    fn enter(&mut self, state: SessionState) {
        debug!("Upload session: {} -> {}", self.state, state);
        self.state = state;
    }
}

/// Failures finding or opening the bootloader.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DeviceError {
    #[error("no bootloader found")]
    NotFound,

    #[error("multiple bootloaders found; select one by bus and address")]
    MultipleDevices,

    #[error("could not open device")]
    OpenFailed(#[source] rusb::Error),

    #[error("could not claim bootloader interface")]
    ClaimFailed(#[source] rusb::Error),

    #[error("USB error while enumerating devices")]
    Enumeration(#[source] rusb::Error),
}

/// Every way an upload session can end other than success.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UploadError {
    #[error("cannot read HEX file")]
    File(#[source] std::io::Error),

    #[error("invalid HEX file")]
    HexFormat(#[from] HexFormatError),

    #[error("device unavailable")]
    Device(#[from] DeviceError),

    #[error("image was built for {expected} but the device is a {actual}")]
    ProcMismatch {
        expected: String,
        actual: &'static str,
    },

    #[error("image was built for {expected} but device ID {device_id:#06x} is not recognised")]
    UnknownProcessor { expected: String, device_id: u16 },

    #[error("image needs {blocks} erase blocks, more than the bootloader can erase")]
    Capacity { blocks: u32 },

    #[error(
        "image {start:#06x}..{end:#06x} does not sit at the board's flash {memstart:#06x}..{memend:#06x}"
    )]
    ImageOutOfRange {
        start: u32,
        end: u32,
        memstart: u32,
        memend: u32,
    },

    #[error("bootloader communication failed")]
    Protocol(#[from] protocol::Error),
}

impl From<hex_file::Error> for UploadError {
    fn from(e: hex_file::Error) -> Self {
        match e {
            hex_file::Error::FormatError(e) => UploadError::HexFormat(e),
            hex_file::Error::IoError(e) => UploadError::File(e),
        }
    }
}

impl From<programmer::Error> for UploadError {
    fn from(e: programmer::Error) -> Self {
        match e {
            programmer::Error::Capacity { blocks } => UploadError::Capacity { blocks },
            programmer::Error::ImageOutOfRange {
                start,
                end,
                memstart,
                memend,
            } => UploadError::ImageOutOfRange {
                start,
                end,
                memstart,
                memend,
            },
            programmer::Error::Protocol(e) => UploadError::Protocol(e),
        }
    }
}
