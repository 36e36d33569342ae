use crate::board::{BoardDescriptor, FlashFamily};
use crate::hex_file::{IMAGE_ALIGN, MemoryImage};
use crate::protocol::{self, Transport};
use log::{debug, info};
use thiserror::Error;

/// Writes are issued in chunks that end on this address boundary.
pub const WRITE_BLOCK_SIZE: u32 = 32;

// The 64-byte family's erase command covers at most 255 blocks from its start address, and a
// second call picks up at the next 16 KiB window.
const MAX_BLOCKS_PER_ERASE: u32 = 255;
const SECOND_ERASE_OFFSET: u32 = 0x4000;
const MAX_BLOCKS_64: u32 = 511;

/// A single ERASE_FLASH command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EraseOp {
    pub address: u32,
    pub blocks: u8,
}

/// Work out which erase commands clear room for `image` on `board`.
///
/// The block count is `1 + used / block_size`, so an image ending exactly on a block boundary
/// also erases the following block. An empty image needs no erase at all.
///
/// The image must start at `board.memstart` and may only run past `board.memend` by the padding
/// up to the next [IMAGE_ALIGN] boundary; otherwise the writes would land outside the erased
/// region.
pub fn erase_plan(image: &MemoryImage, board: &BoardDescriptor) -> Result<Vec<EraseOp>, Error> {
    let flash_len = board.memend.saturating_sub(board.memstart);
    let flash_end = board.memstart + flash_len.div_ceil(IMAGE_ALIGN) * IMAGE_ALIGN;
    if image.memstart() != board.memstart || image.end_address() > flash_end {
        return Err(Error::ImageOutOfRange {
            start: image.memstart(),
            end: image.end_address(),
            memstart: board.memstart,
            memend: board.memend,
        });
    }

    if image.is_empty() {
        return Ok(vec![]);
    }

    let family = board.family();
    let block_size = family.erase_block_size();
    let blocks = 1 + image.len() as u32 / block_size;

    let calls = match family {
        FlashFamily::Block1024 => {
            let device_blocks = (board.memend - board.memstart).div_ceil(block_size);
            vec![(board.memstart, blocks.min(device_blocks))]
        }
        FlashFamily::Block64 => {
            if blocks > MAX_BLOCKS_64 {
                return Err(Error::Capacity { blocks });
            }
            if blocks <= MAX_BLOCKS_PER_ERASE {
                vec![(board.memstart, blocks)]
            } else {
                vec![
                    (board.memstart, MAX_BLOCKS_PER_ERASE),
                    (
                        board.memstart + SECOND_ERASE_OFFSET,
                        blocks - MAX_BLOCKS_PER_ERASE,
                    ),
                ]
            }
        }
    };

    // Each call's count has to fit the one-byte length field.
    calls
        .into_iter()
        .map(|(address, count)| {
            u8::try_from(count)
                .map(|count| EraseOp {
                    address,
                    blocks: count,
                })
                .map_err(|_| Error::Capacity { blocks })
        })
        .collect()
}

/// Iterator over `(address, bytes)` write commands covering an image. Every chunk but the first
/// starts on a [WRITE_BLOCK_SIZE] boundary; a short trailing chunk is still emitted.
pub struct WriteChunks<'a> {
    image: &'a MemoryImage,
    address: u32,
}

impl<'a> Iterator for WriteChunks<'a> {
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let end = self.image.end_address();
        if self.address >= end {
            return None;
        }

        let start = self.address;
        let stop = ((start / WRITE_BLOCK_SIZE + 1) * WRITE_BLOCK_SIZE).min(end);
        self.address = stop;

        Some((start, self.image.slice(start, stop)))
    }
}

pub fn write_chunks(image: &MemoryImage) -> WriteChunks<'_> {
    WriteChunks {
        image,
        address: image.memstart(),
    }
}

/// Erase the region `image` will occupy. Fails before sending anything if the bootloader cannot
/// erase that much.
pub fn erase(
    device: &mut impl Transport,
    image: &MemoryImage,
    board: &BoardDescriptor,
) -> Result<(), Error> {
    let plan = erase_plan(image, board)?;
    debug!("Erase plan for {board}: {plan:?}");

    for op in plan {
        protocol::erase_flash(device, op.address, op.blocks)?;
    }

    Ok(())
}

/// Write every byte of `image`, in address order. Returns the number of bytes written.
pub fn write(device: &mut impl Transport, image: &MemoryImage) -> Result<usize, Error> {
    let mut written = 0;

    for (address, data) in write_chunks(image) {
        protocol::write_flash(device, address, data)?;
        written += data.len();

        if written % 1024 == 0 {
            debug!("Written {written}/{} bytes", image.len());
        }
    }

    info!(
        "Wrote {written} bytes to {:#06x}..{:#06x}",
        image.memstart(),
        image.end_address()
    );
    Ok(written)
}

/// Erase then write. The first failure stops the sequence.
pub fn program(
    device: &mut impl Transport,
    image: &MemoryImage,
    board: &BoardDescriptor,
) -> Result<(), Error> {
    erase(device, image, board)?;
    write(device, image)?;
    Ok(())
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
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

    #[error("programming failed")]
    Protocol(#[from] protocol::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, PACKET_SIZE};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<Vec<u8>>,
        fail_on_packet: Option<usize>,
    }

    impl Recorder {
        fn commands(&self) -> Vec<Command<'_>> {
            self.sent.iter().map(|p| Command::decode(p).unwrap()).collect()
        }
    }

    impl Transport for Recorder {
        fn write_packet(&mut self, packet: &[u8], _timeout: Duration) -> rusb::Result<usize> {
            if self.fail_on_packet == Some(self.sent.len()) {
                return Err(rusb::Error::Pipe);
            }
            self.sent.push(packet.to_vec());
            Ok(packet.len())
        }

        fn read_packet(&mut self, buf: &mut [u8], _timeout: Duration) -> rusb::Result<usize> {
            buf.fill(0);
            Ok(PACKET_SIZE)
        }
    }

    fn image_up_to(board: &BoardDescriptor, max_address: u32) -> MemoryImage {
        MemoryImage::from_bytes(
            board.memstart,
            vec![0u8; (max_address - board.memstart) as usize],
        )
    }

    #[test]
    fn small_image_single_erase() {
        let board = BoardDescriptor::new("18f2550", 0x2000, 0x10000);
        let image = image_up_to(&board, 0x2800);
        assert_eq!(
            erase_plan(&image, &board).unwrap(),
            vec![EraseOp {
                address: 0x2000,
                blocks: 33
            }]
        );

        let mut device = Recorder::default();
        erase(&mut device, &image, &board).unwrap();
        assert_eq!(
            device.commands(),
            vec![Command::Erase {
                address: 0x2000,
                blocks: 33
            }]
        );
    }

    #[test]
    fn large_image_splits_erase() {
        let board = BoardDescriptor::new("18f4550", 0x0c00, 0x10000);
        let image = image_up_to(&board, board.memstart + 399 * 64);
        assert_eq!(
            erase_plan(&image, &board).unwrap(),
            vec![
                EraseOp {
                    address: 0x0c00,
                    blocks: 255
                },
                EraseOp {
                    address: 0x4c00,
                    blocks: 145
                },
            ]
        );
    }

    #[test]
    fn split_threshold() {
        let board = BoardDescriptor::new("18f4550", 0x0000, 0x10000);
        // 254 * 64 bytes -> 255 blocks, still one call.
        assert_eq!(erase_plan(&image_up_to(&board, 254 * 64), &board).unwrap().len(), 1);
        assert_eq!(erase_plan(&image_up_to(&board, 255 * 64), &board).unwrap().len(), 2);
    }

    #[test]
    fn too_many_blocks_is_capacity_error() {
        let board = BoardDescriptor::new("18f4550", 0x0000, 0x20000);
        assert!(matches!(
            erase_plan(&image_up_to(&board, 511 * 64), &board),
            Err(Error::Capacity { blocks: 512 })
        ));
        // 511 blocks leaves 256 for the second call, which the length byte cannot carry.
        assert!(matches!(
            erase_plan(&image_up_to(&board, 510 * 64), &board),
            Err(Error::Capacity { blocks: 511 })
        ));

        let mut device = Recorder::default();
        let image = image_up_to(&board, 600 * 64);
        assert!(program(&mut device, &image, &board).is_err());
        assert!(device.sent.is_empty());
    }

    #[test]
    fn j_family_uses_kilobyte_blocks() {
        let board = BoardDescriptor::new("18f26j50", 0x0c00, 0x10000);
        let image = image_up_to(&board, 0x0c00 + 3 * 1024 + 64);
        assert_eq!(
            erase_plan(&image, &board).unwrap(),
            vec![EraseOp {
                address: 0x0c00,
                blocks: 4
            }]
        );
    }

    #[test]
    fn j_family_clamps_to_device_size() {
        let board = BoardDescriptor::new("18f26j50", 0x0000, 0x2000);
        let image = image_up_to(&board, 0x2000);
        assert_eq!(
            erase_plan(&image, &board).unwrap(),
            vec![EraseOp {
                address: 0x0000,
                blocks: 8
            }]
        );
    }

    #[test]
    fn image_elsewhere_than_board_is_rejected() {
        let board = BoardDescriptor::new("18f2550", 0x0c00, 0x8000);
        let image = MemoryImage::from_bytes(0x2000, vec![0x11; 64]);

        assert!(matches!(
            erase_plan(&image, &board),
            Err(Error::ImageOutOfRange {
                start: 0x2000,
                end: 0x2040,
                memstart: 0x0c00,
                memend: 0x8000,
            })
        ));

        let mut device = Recorder::default();
        assert!(program(&mut device, &image, &board).is_err());
        assert!(device.sent.is_empty());
    }

    #[test]
    fn image_past_memend_is_rejected_beyond_padding() {
        let board = BoardDescriptor::new("18f2550", 0x0c00, 0x0c50);
        // 0x50 bytes of flash pad to 0x80.
        assert!(erase_plan(&MemoryImage::from_bytes(0x0c00, vec![0; 0x50]), &board).is_ok());
        assert!(matches!(
            erase_plan(&MemoryImage::from_bytes(0x0c00, vec![0; 0x81]), &board),
            Err(Error::ImageOutOfRange { end: 0x0cc0, .. })
        ));
    }

    #[test]
    fn empty_image_is_not_erased() {
        let board = BoardDescriptor::new("18f2550", 0x2000, 0x8000);
        let image = MemoryImage::from_bytes(0x2000, vec![]);
        assert!(erase_plan(&image, &board).unwrap().is_empty());
        assert_eq!(write_chunks(&image).count(), 0);
    }

    #[test]
    fn chunks_follow_write_blocks() {
        let image = MemoryImage::from_bytes(0x2000, (0..64).collect());
        let chunks: Vec<_> = write_chunks(&image).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], (0x2000, &image.as_bytes()[..32]));
        assert_eq!(chunks[1], (0x2020, &image.as_bytes()[32..]));
    }

    #[test]
    fn unaligned_start_and_trailing_partial_chunk() {
        let image = MemoryImage::from_bytes(0x2010, vec![0xab; 64]);
        let chunks: Vec<_> = write_chunks(&image)
            .map(|(address, data)| (address, data.len()))
            .collect();
        assert_eq!(chunks, vec![(0x2010, 16), (0x2020, 32), (0x2040, 16)]);
    }

    #[test]
    fn program_erases_then_writes_everything() {
        let board = BoardDescriptor::new("18f2550", 0x2000, 0x8000);
        let bytes: Vec<u8> = (0..128).map(|i| i as u8).collect();
        let image = MemoryImage::from_bytes(board.memstart, bytes.clone());

        let mut device = Recorder::default();
        program(&mut device, &image, &board).unwrap();

        let commands = device.commands();
        assert_eq!(
            commands[0],
            Command::Erase {
                address: 0x2000,
                blocks: 3
            }
        );

        let mut written = Vec::new();
        let mut expected_address = 0x2000;
        for command in &commands[1..] {
            match command {
                Command::WriteFlash { address, data } => {
                    assert_eq!(*address, expected_address);
                    assert_eq!(data.len(), WRITE_BLOCK_SIZE as usize);
                    expected_address += data.len() as u32;
                    written.extend_from_slice(data);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(written, bytes);
    }

    #[test]
    fn write_failure_stops_sequence() {
        let board = BoardDescriptor::new("18f2550", 0x2000, 0x8000);
        let image = MemoryImage::from_bytes(board.memstart, vec![0; 256]);

        let mut device = Recorder {
            fail_on_packet: Some(3),
            ..Default::default()
        };
        let err = program(&mut device, &image, &board).unwrap_err();

        assert!(matches!(
            err,
            Error::Protocol(protocol::Error::DeviceIoError {
                source: rusb::Error::Pipe,
                ..
            })
        ));
        assert_eq!(device.sent.len(), 3);
    }
}
