use core::fmt::{self, Display, Formatter};

// SATA
pub const SATA_SIG_ATA: u32 = 0x00000101;
pub const SATA_SIG_ATAPI: u32 = 0xEB140101;
pub const SATA_SIG_SEMB: u32 = 0xC33C0101;
pub const SATA_SIG_PM: u32 = 0x96690101;

// AHCI
pub const AHCI_BASE: u64 = 0x400000;

// HBA
pub const HBA_PORT_IPM_ACTIVE: u8 = 1;
pub const HBA_PORT_DET_PRESENT: u8 = 3;
pub const HBA_GHC_AE: u32 = 1 << 31;
pub const HBA_PXCMD_ST: u32 = 0x0001;
pub const HBA_PXCMD_FRE: u32 = 0x0010;
pub const HBA_PXCMD_FR: u32 = 0x4000;
pub const HBA_PXCMD_CR: u32 = 0x8000;
pub const HBA_PXIS_TFES: u32 = 0x40000000;

// ATA
pub const ATA_DEV_BUSY: u8 = 0x80;
pub const ATA_DEV_DRQ: u8 = 0x08;
pub const ATA_CMD_READ_DMA_EX: u8 = 0x25;

// FIS
pub const FIS_TYPE_REG_H2D: u8 = 0x27;

// Misc.
pub const CMD_SLOTS: usize = 32;
pub const SECTOR_SIZE: usize = 512;
pub const PRDT_ENTRIES: usize = 8;
/// Sectors covered by every PRDT entry but the last (8 KiB).
pub const SECTORS_PER_PRDT: u16 = 16;
/// Largest transfer one command table can describe.
pub const MAX_SECTORS_PER_COMMAND: u16 = PRDT_ENTRIES as u16 * SECTORS_PER_PRDT;

pub mod ahci;
pub mod layout;

/// What sits behind an AHCI port.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    None = 0,
    Sata = 1,
    EnclosureBridge = 2,
    PortMultiplier = 3,
    Atapi = 4,
}

impl DeviceKind {
    /// Decodes a port's SATA status and signature registers.
    ///
    /// Anything other than an established, active link is `None`, whatever the
    /// signature says. An unrecognised signature is treated as a plain SATA disk.
    pub const fn from_registers(ssts: u32, sig: u32) -> Self {
        let ipm = ((ssts >> 8) & 0x0F) as u8;
        let det = (ssts & 0x0F) as u8;

        if det != HBA_PORT_DET_PRESENT || ipm != HBA_PORT_IPM_ACTIVE {
            return DeviceKind::None;
        }

        match sig {
            SATA_SIG_ATAPI => DeviceKind::Atapi,
            SATA_SIG_SEMB => DeviceKind::EnclosureBridge,
            SATA_SIG_PM => DeviceKind::PortMultiplier,
            _ => DeviceKind::Sata,
        }
    }
}

impl Display for DeviceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::None => "No",
            DeviceKind::Sata => "SATA",
            DeviceKind::Atapi => "SATAPI",
            DeviceKind::EnclosureBridge => "SEMB",
            DeviceKind::PortMultiplier => "PM",
        })
    }
}

/// Which polling loop ran out of budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStage {
    EngineStop,
    EngineStart,
    Completion,
}

/// Errors reported by the AHCI stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AhciError {
    /// Every one of the 32 command slots is active or issued.
    NoFreeCommandSlot,
    /// BSY/DRQ never dropped; the command was not issued.
    PortHung,
    /// The device set TFES in the port's interrupt status.
    TaskFileError,
    Timeout(WaitStage),
    /// Zero, or more than one command table can describe.
    InvalidSectorCount(u16),
    BufferTooSmall { needed: usize, actual: usize },
    /// The port has not been rebased since the controller was mapped.
    NotInitialized,
    PortNotImplemented(u8),
    /// The BAR is zero or decodes I/O space.
    InvalidBar(u32),
    MappingFailed,
    /// A buffer has no physical address the HBA can reach.
    AddressTranslation,
}

impl Display for AhciError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFreeCommandSlot => f.write_str("cannot find free command slot"),
            Self::PortHung => f.write_str("port hung"),
            Self::TaskFileError => f.write_str("disk read error"),
            Self::Timeout(WaitStage::EngineStop) => f.write_str("timed out stopping the command engine"),
            Self::Timeout(WaitStage::EngineStart) => f.write_str("timed out starting the command engine"),
            Self::Timeout(WaitStage::Completion) => f.write_str("timed out waiting for command completion"),
            Self::InvalidSectorCount(n) => write!(f, "invalid sector count {}", n),
            Self::BufferTooSmall { needed, actual } => {
                write!(f, "buffer too small ({} < {} bytes)", actual, needed)
            }
            Self::NotInitialized => f.write_str("port not initialized"),
            Self::PortNotImplemented(n) => write!(f, "port {} not implemented", n),
            Self::InvalidBar(bar) => write!(f, "invalid base address {:#010x}", bar),
            Self::MappingFailed => f.write_str("unable to map memory"),
            Self::AddressTranslation => f.write_str("buffer has no physical address"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINK_UP: u32 = 0x123;

    #[test]
    fn signatures() {
        assert_eq!(DeviceKind::from_registers(LINK_UP, 0x0000_0101), DeviceKind::Sata);
        assert_eq!(DeviceKind::from_registers(LINK_UP, 0xEB14_0101), DeviceKind::Atapi);
        assert_eq!(DeviceKind::from_registers(LINK_UP, 0xC33C_0101), DeviceKind::EnclosureBridge);
        assert_eq!(DeviceKind::from_registers(LINK_UP, 0x9669_0101), DeviceKind::PortMultiplier);
        assert_eq!(DeviceKind::from_registers(LINK_UP, 0xDEAD_BEEF), DeviceKind::Sata);
    }

    #[test]
    fn link_state_gates_the_signature() {
        let signatures = [SATA_SIG_ATA, SATA_SIG_ATAPI, SATA_SIG_SEMB, SATA_SIG_PM, 0];
        for sig in signatures {
            for det in 0..16u32 {
                for ipm in 0..16u32 {
                    let ssts = (ipm << 8) | det;
                    let kind = DeviceKind::from_registers(ssts, sig);
                    if det != 3 || ipm != 1 {
                        assert_eq!(kind, DeviceKind::None, "ssts={ssts:#x} sig={sig:#x}");
                    } else {
                        assert_ne!(kind, DeviceKind::None);
                    }
                }
            }
        }
    }

    #[test]
    fn speed_bits_are_ignored() {
        // SPD (bits 7:4) reports Gen3; only DET and IPM matter.
        assert_eq!(DeviceKind::from_registers(0x133, SATA_SIG_ATA), DeviceKind::Sata);
    }

    #[test]
    fn error_messages() {
        assert_eq!(format!("{}", AhciError::PortHung), "port hung");
        assert_eq!(format!("{}", AhciError::TaskFileError), "disk read error");
        assert_eq!(format!("{}", AhciError::NoFreeCommandSlot), "cannot find free command slot");
        assert_eq!(
            format!("{}", AhciError::BufferTooSmall { needed: 1024, actual: 512 }),
            "buffer too small (512 < 1024 bytes)"
        );
        assert_eq!(
            format!("{}", AhciError::Timeout(WaitStage::Completion)),
            "timed out waiting for command completion"
        );
    }

    #[test]
    fn command_capacity() {
        assert_eq!(MAX_SECTORS_PER_COMMAND, 128);
    }
}
