use std::fmt::Display;

const MICROCHIP_VID: u16 = 0x04d8;
const PINGUINO_PID: u16 = 0xfeaa;

/// USB identity the bootloader enumerates with, regardless of the processor on the board.
pub const BOOTLOADER_ID: UsbId = UsbId {
    vid: MICROCHIP_VID,
    pid: PINGUINO_PID,
};

/// Microchip 8-bit USB parts, keyed by device ID with the revision bits cleared.
///
/// 0x1200 is 18f4550; older tables also listed it as 18f4450. IDs must be unique, which the const
/// check below enforces.
const DEVICE_CATALOG: &[(u16, &str)] = &[
    (0x4740, "18f13k50"),
    (0x4700, "18lf13k50"),
    (0x4760, "18f14k50"),
    (0x4720, "18f14k50"),
    (0x2420, "18f2450"),
    (0x1260, "18f2455"),
    (0x2a60, "18f2458"),
    (0x4c00, "18f24j50"),
    (0x4cc0, "18lf24j50"),
    (0x1240, "18f2550"),
    (0x2a40, "18f2553"),
    (0x4c20, "18f25j50"),
    (0x4ce0, "18lf25j50"),
    (0x4c40, "18f26j50"),
    (0x4d00, "18lf26j50"),
    (0x1220, "18f4455"),
    (0x2a20, "18f4458"),
    (0x4c60, "18f44j50"),
    (0x4d20, "18lf44j50"),
    (0x1200, "18f4550"),
    (0x2a00, "18f4553"),
    (0x4c80, "18f45j50"),
    (0x4d40, "18lf45j50"),
    (0x4ca0, "18f46j50"),
    (0x4d60, "18f46j50"),
    (0x4100, "18f65j50"),
    (0x1560, "18f66j50"),
    (0x4160, "18f66j55"),
    (0x4180, "18f67j50"),
    (0x41a0, "18f85j50"),
    (0x41e0, "18f86j50"),
    (0x1f40, "18f86j55"),
    (0x4220, "18f87j50"),
];

const fn has_duplicate_ids(table: &[(u16, &str)]) -> bool {
    let mut i = 0;
    while i < table.len() {
        let mut j = i + 1;
        while j < table.len() {
            if table[i].0 == table[j].0 {
                return true;
            }
            j += 1;
        }
        i += 1;
    }
    false
}

const _: () = assert!(
    !has_duplicate_ids(DEVICE_CATALOG),
    "device catalog has duplicate IDs"
);

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// Whether a USB device is a board sitting in the bootloader.
pub fn is_bootloader(id: UsbId) -> bool {
    id == BOOTLOADER_ID
}

/// Find the processor name for a device ID read from the chip. `device_id` must already have
/// its revision bits masked off.
pub fn lookup(device_id: u16) -> Option<&'static str> {
    DEVICE_CATALOG
        .iter()
        .find(|(id, _)| *id == device_id)
        .map(|(_, name)| *name)
}
