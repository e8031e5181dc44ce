//! Placement of the per-port command structures inside the command memory.
//!
//! One contiguous region starting at `AHCI_BASE` holds everything the HBA
//! fetches for all 32 ports:
//!
//! | offset                          | size  | contents                         |
//! |---------------------------------|-------|----------------------------------|
//! | `port * 1K`                     | 1 KiB | command list (32 headers)        |
//! | `32K + port * 256`              | 256 B | received-FIS area                |
//! | `40K + port * 8K + slot * 256`  | 256 B | command table for `slot`         |

use super::{AhciError, CMD_SLOTS};
use crate::memory::MemoryMapper;
use x86_64::{PhysAddr, VirtAddr};

pub const COMMAND_LIST_SIZE: usize = 1024;
pub const RECEIVED_FIS_SIZE: usize = 256;
pub const COMMAND_TABLE_SIZE: usize = 256;

const RECEIVED_FIS_AREA: usize = 32 << 10;
const COMMAND_TABLE_AREA: usize = 40 << 10;

/// Bytes of command memory needed for all 32 ports.
pub const COMMAND_MEMORY_SIZE: usize = COMMAND_TABLE_AREA + CMD_SLOTS * CMD_SLOTS * COMMAND_TABLE_SIZE;

/// Offsets, relative to the command memory base, of one port's structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLayout {
    pub command_list: usize,
    pub received_fis: usize,
    pub command_tables: usize,
}

impl PortLayout {
    /// `port` has to be below 32; the command memory has room for no more.
    pub const fn for_port(port: u8) -> Self {
        debug_assert!((port as usize) < CMD_SLOTS);
        let port = port as usize;
        Self {
            command_list: port * COMMAND_LIST_SIZE,
            received_fis: RECEIVED_FIS_AREA + port * RECEIVED_FIS_SIZE,
            command_tables: COMMAND_TABLE_AREA + port * CMD_SLOTS * COMMAND_TABLE_SIZE,
        }
    }

    pub const fn command_header(&self, slot: usize) -> usize {
        self.command_list + slot * (COMMAND_LIST_SIZE / CMD_SLOTS)
    }

    pub const fn command_table(&self, slot: usize) -> usize {
        self.command_tables + slot * COMMAND_TABLE_SIZE
    }

    /// One past the last byte this port uses.
    pub const fn end(&self) -> usize {
        self.command_table(CMD_SLOTS)
    }
}

/// A physically contiguous, mapped block of memory the HBA can bus-master.
#[derive(Debug, Clone, Copy)]
pub struct DmaRegion {
    phys: PhysAddr,
    virt: VirtAddr,
    len: usize,
}

impl DmaRegion {
    /// # Safety
    ///
    /// `virt..virt + len` must be mapped, writable and backed by the physical
    /// range starting at `phys`. Nothing but the AHCI stack may use it.
    pub const unsafe fn new(phys: PhysAddr, virt: VirtAddr, len: usize) -> Self {
        Self { phys, virt, len }
    }

    /// Maps `COMMAND_MEMORY_SIZE` bytes at `phys`.
    ///
    /// # Safety
    ///
    /// The physical range must be RAM reserved for the AHCI stack.
    pub unsafe fn map(mapper: &mut impl MemoryMapper, phys: PhysAddr) -> Result<Self, AhciError> {
        let virt = mapper.map(phys, COMMAND_MEMORY_SIZE)?;
        Ok(unsafe { Self::new(phys, virt, COMMAND_MEMORY_SIZE) })
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn phys(&self, offset: usize) -> u64 {
        debug_assert!(offset < self.len);
        self.phys.as_u64() + offset as u64
    }

    pub fn virt(&self, offset: usize) -> VirtAddr {
        debug_assert!(offset < self.len);
        self.virt + offset as u64
    }
}
