// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The engine in steer.

pub mod bitmap;
pub mod device;
pub mod extract;
pub mod field;
pub mod profile;
pub mod ptype;
pub mod rss;
pub mod rule;
pub mod segment;

use serde::Deserialize;
use serde::Serialize;

/// A hardware classification block (stage). Each block owns its own
/// profile list and extraction capabilities.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Block {
    /// Switch filtering.
    Sw = 0,
    /// Access-control lists. Extracts direction metadata ahead of any
    /// protocol field.
    Acl = 1,
    /// Flow director (exact-match steering).
    Fd = 2,
    /// Receive-side scaling hash configuration.
    Rss = 3,
}

impl Block {
    pub const COUNT: usize = 4;

    pub const ALL: [Block; Block::COUNT] =
        [Block::Sw, Block::Acl, Block::Fd, Block::Rss];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Per-block extraction capabilities, as reported by the device.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BlockCaps {
    /// Number of field-vector words the block can extract.
    pub fv_words: u8,
    /// The block requires the field vector laid out in reverse.
    pub reverse: bool,
}

/// Extraction capabilities for every classification block.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ClassifierCaps {
    pub sw: BlockCaps,
    pub acl: BlockCaps,
    pub fd: BlockCaps,
    pub rss: BlockCaps,
}

impl ClassifierCaps {
    pub fn block(&self, blk: Block) -> BlockCaps {
        match blk {
            Block::Sw => self.sw,
            Block::Acl => self.acl,
            Block::Fd => self.fd,
            Block::Rss => self.rss,
        }
    }
}

impl Default for ClassifierCaps {
    fn default() -> Self {
        Self {
            sw: BlockCaps { fv_words: 48, reverse: false },
            acl: BlockCaps { fv_words: 32, reverse: true },
            fd: BlockCaps { fv_words: 24, reverse: false },
            rss: BlockCaps { fv_words: 24, reverse: false },
        }
    }
}
