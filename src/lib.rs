/// Describe the target board and derive its flash erase geometry.
pub mod board;

/// Map chip device IDs to processor names and recognise the bootloader's USB identity.
pub mod device_ids;

/// Load and validate Intel HEX files into a flat flash image.
pub mod hex_file;

/// Encode bootloader command packets and exchange them over bulk endpoints.
pub mod protocol;

/// Erase and write a flash image through the bootloader.
pub mod programmer;

/// Run a complete upload: find, identify, erase, write, reset.
pub mod session;

/// Find and open bootloaders with libusb.
pub mod usb;
