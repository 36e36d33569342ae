use byteorder::{ByteOrder, LE};
use log::{debug, trace};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::Display;
use std::io::Write;
use std::time::Duration;
use thiserror::Error;

/// Every command and response is exactly one full-speed bulk packet.
pub const PACKET_SIZE: usize = 64;
const HEADER_SIZE: usize = 5;
/// Largest read or write payload that fits after the header.
pub const MAX_PAYLOAD: usize = PACKET_SIZE - HEADER_SIZE;
const MAX_ADDRESS: u32 = 0x00ff_ffff;

/// Per-transfer timeout. A transfer that exceeds it is fatal; nothing is retried.
pub const TIMEOUT: Duration = Duration::from_millis(1200);

/// The 2-byte device ID lives at the top of the configuration space.
pub const DEVICE_ID_ADDRESS: u32 = 0x3f_fffe;
const DEVICE_REVISION_MASK: u16 = 0x001f;

// Response layout for READ_VERSION.
const VERSION_MINOR_OFFSET: usize = 2;
const VERSION_MAJOR_OFFSET: usize = 3;

/// Half-duplex access to the bootloader's bulk endpoints. Implementations own the endpoint
/// addresses; the protocol only ever has one transfer outstanding.
pub trait Transport {
    /// Send one packet on the OUT endpoint. Returns the number of bytes the device accepted.
    fn write_packet(&mut self, packet: &[u8], timeout: Duration) -> rusb::Result<usize>;

    /// Receive one packet from the IN endpoint into `buf`. Returns the number of bytes read.
    fn read_packet(&mut self, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write_packet(&mut self, packet: &[u8], timeout: Duration) -> rusb::Result<usize> {
        (**self).write_packet(packet, timeout)
    }

    fn read_packet(&mut self, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        (**self).read_packet(buf, timeout)
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum Opcode {
    ReadVersion = 0x00,
    ReadFlash = 0x01,
    WriteFlash = 0x02,
    EraseFlash = 0x03,
    Reset = 0xff,
}

/// A bootloader command. Packet layout:
///
/// | byte  | field                          |
/// |-------|--------------------------------|
/// | 0     | opcode                         |
/// | 1     | payload length or block count  |
/// | 2..=4 | address, 24-bit little-endian  |
/// | 5..   | payload                        |
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Command<'a> {
    Version,
    ReadFlash { address: u32, len: u8 },
    WriteFlash { address: u32, data: &'a [u8] },
    Erase { address: u32, blocks: u8 },
    Reset,
}

impl<'a> Command<'a> {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Version => Opcode::ReadVersion,
            Command::ReadFlash { .. } => Opcode::ReadFlash,
            Command::WriteFlash { .. } => Opcode::WriteFlash,
            Command::Erase { .. } => Opcode::EraseFlash,
            Command::Reset => Opcode::Reset,
        }
    }

    /// Lay the command out in a zero-padded packet. Fails without side effects if the payload
    /// or address cannot be represented.
    pub fn encode(&self) -> Result<[u8; PACKET_SIZE], ProtocolError> {
        let (len, address, data): (u8, u32, &[u8]) = match *self {
            Command::Version | Command::Reset => (0, 0, &[]),
            Command::ReadFlash { address, len } => {
                if len as usize > MAX_PAYLOAD {
                    return Err(ProtocolError::PayloadTooLarge { len: len as usize });
                }
                (len, address, &[])
            }
            Command::WriteFlash { address, data } => {
                if data.len() > MAX_PAYLOAD {
                    return Err(ProtocolError::PayloadTooLarge { len: data.len() });
                }
                (data.len() as u8, address, data)
            }
            Command::Erase { address, blocks } => (blocks, address, &[]),
        };

        if address > MAX_ADDRESS {
            return Err(ProtocolError::AddressOutOfRange(address));
        }

        let mut packet = [0u8; PACKET_SIZE];
        packet[0] = self.opcode().into();
        packet[1] = len;
        LE::write_u24(&mut packet[2..HEADER_SIZE], address);
        packet[HEADER_SIZE..HEADER_SIZE + data.len()].copy_from_slice(data);
        Ok(packet)
    }

    /// Interpret a command packet as sent on the wire.
    pub fn decode(packet: &'a [u8]) -> Result<Self, ProtocolError> {
        if packet.len() < PACKET_SIZE {
            return Err(ProtocolError::ResponseTooShort {
                expected: PACKET_SIZE,
                actual: packet.len(),
            });
        }

        let opcode =
            Opcode::try_from(packet[0]).map_err(|e| ProtocolError::UnknownOpcode(e.number))?;
        let len = packet[1];
        let address = LE::read_u24(&packet[2..HEADER_SIZE]);

        Ok(match opcode {
            Opcode::ReadVersion => Command::Version,
            Opcode::ReadFlash => Command::ReadFlash { address, len },
            Opcode::WriteFlash => {
                if len as usize > MAX_PAYLOAD {
                    return Err(ProtocolError::PayloadTooLarge { len: len as usize });
                }
                Command::WriteFlash {
                    address,
                    data: &packet[HEADER_SIZE..HEADER_SIZE + len as usize],
                }
            }
            Opcode::EraseFlash => Command::Erase {
                address,
                blocks: len,
            },
            Opcode::Reset => Command::Reset,
        })
    }
}

/// Bootloader firmware version.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Ask the bootloader for its version.
pub fn read_version(device: &mut impl Transport) -> Result<Version, Error> {
    send(device, &Command::Version, "requesting bootloader version")?;
    let response = receive(
        device,
        VERSION_MAJOR_OFFSET + 1,
        "reading bootloader version",
    )?;

    Ok(Version {
        major: response[VERSION_MAJOR_OFFSET],
        minor: response[VERSION_MINOR_OFFSET],
    })
}

/// Read up to [MAX_PAYLOAD] bytes of flash starting at `address`.
pub fn read_flash(device: &mut impl Transport, address: u32, len: u8) -> Result<Vec<u8>, Error> {
    send(
        device,
        &Command::ReadFlash { address, len },
        "requesting flash read",
    )?;
    let response = receive(device, HEADER_SIZE + len as usize, "reading flash")?;

    Ok(response[HEADER_SIZE..HEADER_SIZE + len as usize].to_vec())
}

/// Read `len` bytes of flash starting at `start` into `out`, one packet at a time.
pub fn read_flash_range(
    device: &mut impl Transport,
    start: u32,
    len: u32,
    out: &mut impl Write,
) -> Result<(), Error> {
    let end = start
        .checked_add(len)
        .filter(|&end| end <= MAX_ADDRESS + 1)
        .ok_or(ProtocolError::AddressOutOfRange(start.saturating_add(len)))?;

    let mut address = start;
    while address < end {
        let chunk = (end - address).min(MAX_PAYLOAD as u32) as u8;
        let data = read_flash(device, address, chunk)?;
        out.write_all(&data)?;
        address += chunk as u32;
    }

    Ok(())
}

/// Program up to [MAX_PAYLOAD] bytes at `address`. The region must already be erased. The
/// device answers with a status packet, which is read and discarded.
pub fn write_flash(device: &mut impl Transport, address: u32, data: &[u8]) -> Result<(), Error> {
    send(
        device,
        &Command::WriteFlash { address, data },
        "sending flash data",
    )?;
    receive(device, 0, "reading write acknowledgement")?;

    trace!("Wrote {} bytes at {address:#08x}", data.len());
    Ok(())
}

/// Erase `blocks` erase blocks starting at `address`. Block size depends on the processor
/// family. No response is awaited.
pub fn erase_flash(device: &mut impl Transport, address: u32, blocks: u8) -> Result<(), Error> {
    send(
        device,
        &Command::Erase { address, blocks },
        "erasing flash",
    )?;

    debug!("Erased {blocks} blocks from {address:#08x}");
    Ok(())
}

/// Leave the bootloader and start the application. No response is awaited.
pub fn reset(device: &mut impl Transport) -> Result<(), Error> {
    send(device, &Command::Reset, "resetting device")
}

/// Read the processor's device ID with the revision bits cleared, ready for
/// [lookup](crate::device_ids::lookup).
pub fn read_device_id(device: &mut impl Transport) -> Result<u16, Error> {
    let raw = LE::read_u16(&read_flash(device, DEVICE_ID_ADDRESS, 2)?);
    debug!(
        "Raw device ID {raw:#06x} (revision {})",
        raw & DEVICE_REVISION_MASK
    );

    Ok(raw & !DEVICE_REVISION_MASK)
}

fn send(device: &mut impl Transport, command: &Command, action: &'static str) -> Result<(), Error> {
    let packet = command.encode()?;
    trace!("Sending {command:?}");

    match device.write_packet(&packet, TIMEOUT) {
        Ok(n) if n == PACKET_SIZE => Ok(()),
        Ok(n) => Err(ProtocolError::WriteIncomplete {
            expected: PACKET_SIZE,
            actual: n,
            action,
        }
        .into()),
        Err(rusb::Error::Timeout) => Err(ProtocolError::WriteIncomplete {
            expected: PACKET_SIZE,
            actual: 0,
            action,
        }
        .into()),
        Err(e) => Err(Error::DeviceIoError { source: e, action }),
    }
}

/// Read one response packet, failing if it is shorter than `min_size`.
fn receive(
    device: &mut impl Transport,
    min_size: usize,
    action: &'static str,
) -> Result<[u8; PACKET_SIZE], Error> {
    let mut response = [0u8; PACKET_SIZE];

    match device.read_packet(&mut response, TIMEOUT) {
        Err(rusb::Error::Timeout) => Err(ProtocolError::ReadTimeout { action }.into()),
        Err(e) => Err(Error::DeviceIoError { source: e, action }),
        Ok(n) if n < min_size => Err(ProtocolError::ResponseTooShort {
            expected: min_size,
            actual: n,
        }
        .into()),
        Ok(n) => {
            trace!("Raw response: {:02x?}", &response[..n]);
            Ok(response)
        }
    }
}

/// All errors (protocol and I/O) that can happen while talking to the bootloader.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("bootloader protocol error")]
    ProtocolError(#[from] ProtocolError),

    #[error("USB transfer error while {action}")]
    DeviceIoError {
        source: rusb::Error,
        action: &'static str,
    },

    #[error("file I/O error")]
    FileIoError(#[from] std::io::Error),
}

/// Failure modes that are not plain USB errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("device accepted {actual} of {expected} bytes while {action}")]
    WriteIncomplete {
        expected: usize,
        actual: usize,
        action: &'static str,
    },

    #[error("timed out waiting for the device while {action}")]
    ReadTimeout { action: &'static str },

    #[error("packet from device was {actual} bytes, expected at least {expected}")]
    ResponseTooShort { expected: usize, actual: usize },

    #[error("payload of {len} bytes does not fit in a packet (max {max})", max = MAX_PAYLOAD)]
    PayloadTooLarge { len: usize },

    #[error("address {0:#x} does not fit in 24 bits")]
    AddressOutOfRange(u32),

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
}
