use std::fmt::Display;

/// Erase granularity of a processor family's program flash.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashFamily {
    /// x550-style parts, erased in 64-byte rows.
    Block64,
    /// x6j50-style parts, erased in 1024-byte pages.
    Block1024,
}

impl FlashFamily {
    pub fn erase_block_size(self) -> u32 {
        match self {
            FlashFamily::Block64 => 64,
            FlashFamily::Block1024 => 1024,
        }
    }
}

/// The board a firmware image was built for, as supplied by the build system.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BoardDescriptor {
    /// Processor name as it appears in the device catalog, e.g. `18f2550`.
    pub processor: String,
    /// First address of user flash (just past the bootloader).
    pub memstart: u32,
    /// End of user flash, exclusive.
    pub memend: u32,
}

impl BoardDescriptor {
    pub fn new(processor: impl Into<String>, memstart: u32, memend: u32) -> Self {
        Self {
            processor: processor.into(),
            memstart,
            memend,
        }
    }

    /// The J-series parts are the only ones with 1024-byte erase pages, and all of them carry a
    /// `j` in their name.
    pub fn family(&self) -> FlashFamily {
        if self.processor.to_ascii_lowercase().contains('j') {
            FlashFamily::Block1024
        } else {
            FlashFamily::Block64
        }
    }

    pub fn contains(&self, address: u32) -> bool {
        (self.memstart..self.memend).contains(&address)
    }

    pub fn matches_processor(&self, name: &str) -> bool {
        self.processor.eq_ignore_ascii_case(name)
    }
}

impl Display for BoardDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} [{:#06x}..{:#06x})",
            self.processor, self.memstart, self.memend
        )
    }
}
