use crate::PortIo;
use alloc::vec::Vec;
use core::fmt::{self, Display, Formatter};
use log::{error, info, warn};

pub const PCI_CONFIG_ADDR: u16 = 0xCF8;
pub const PCI_CONFIG_DATA: u16 = 0xCFC;

/// Offset of BAR0 in a type 0 configuration header.
pub const PCI_BAR0: u8 = 0x10;
pub const PCI_COMMAND: u8 = 0x04;

/// Enumeration stops recording devices past this many.
pub const MAX_PCI_DEVICES: usize = 128;

/// A function found on the PCI bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDevice {
    pub bus: u8,
    pub device: u8,
    pub func: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    /// Raw BAR0 as read during the scan.
    pub base_address: u32,
}

impl PciDevice {
    pub fn new(bus: u8, device: u8, func: u8, vendor_id: u16, device_id: u16, base_address: u32) -> Self {
        Self { bus, device, func, vendor_id, device_id, base_address }
    }
}

impl Display for PciDevice {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "Bus: {} | Device: {} | Function: {} | Vendor ID: {:#06x} | Device ID: {:#06x} | BAR0: {:#010x}",
            self.bus, self.device, self.func, self.vendor_id, self.device_id, self.base_address
        )
    }
}

/// Builds the value written to `PCI_CONFIG_ADDR` to select a dword of configuration space.
pub const fn config_address(bus: u8, device: u8, func: u8, offset: u8) -> u32 {
    (1 << 31)
        | ((bus as u32) << 16)
        | (((device & 0x1F) as u32) << 11)
        | (((func & 0x07) as u32) << 8)
        | ((offset as u32) & 0xFC)
}

pub fn pci_config_read(io: &mut impl PortIo, bus: u8, device: u8, func: u8, offset: u8) -> u32 {
    io.write_long(PCI_CONFIG_ADDR, config_address(bus, device, func, offset));
    io.read_long(PCI_CONFIG_DATA)
}

pub fn pci_config_write(io: &mut impl PortIo, bus: u8, device: u8, func: u8, offset: u8, value: u32) {
    io.write_long(PCI_CONFIG_ADDR, config_address(bus, device, func, offset));
    io.write_long(PCI_CONFIG_DATA, value);
}

pub fn read_pci(io: &mut impl PortIo, pci_device: &PciDevice, offset: u8) -> u32 {
    pci_config_read(io, pci_device.bus, pci_device.device, pci_device.func, offset)
}

pub fn write_pci(io: &mut impl PortIo, pci_device: &PciDevice, offset: u8, value: u32) {
    pci_config_write(io, pci_device.bus, pci_device.device, pci_device.func, offset, value)
}

/// Reads BAR `bar` (0..=5) of a device.
pub fn read_bar(io: &mut impl PortIo, pci_device: &PciDevice, bar: u8) -> Option<u32> {
    if bar > 5 {
        error!("(PCI) Bar no. {} is greater than 5!", bar);
        return None;
    }
    Some(read_pci(io, pci_device, PCI_BAR0 + bar * 4))
}

/// Walks every bus/device/function triple and records the ones that answer.
///
/// Order is bus-major, then device, then function. Triples whose vendor ID
/// reads back as `0xFFFF` are absent and never recorded. The result is a
/// snapshot: nothing is cached between calls.
pub fn enumerate_pci(io: &mut impl PortIo) -> Vec<PciDevice> {
    let mut res: Vec<PciDevice> = Vec::new();
    if res.try_reserve(MAX_PCI_DEVICES).is_err() {
        error!("(PCI) Failed to allocate memory for the PCI device list!");
        return res;
    }

    info!("(PCI) Starting PCI enumeration...");

    'scan: for bus in 0..=255u8 {
        for device in 0..32u8 {
            for func in 0..8u8 {
                let id = pci_config_read(io, bus, device, func, 0x00);
                let vendor_id = (id & 0xFFFF) as u16;
                let device_id = (id >> 16) as u16;

                if vendor_id == 0xFFFF {
                    continue;
                }

                if res.len() >= MAX_PCI_DEVICES {
                    error!("(PCI) Exceeded maximum number of PCI devices ({})!", MAX_PCI_DEVICES);
                    break 'scan;
                }

                let base_address = pci_config_read(io, bus, device, func, PCI_BAR0);
                if base_address == 0 {
                    warn!("(PCI) Base address for device {}:{}:{} is invalid.", bus, device, func);
                }

                res.push(PciDevice::new(bus, device, func, vendor_id, device_id, base_address));
            }
        }
    }

    info!("(PCI) PCI enumeration finished. {} devices found.", res.len());
    return res;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Configuration space behind the 0xCF8/0xCFC mechanism. Unpopulated
    /// dwords read back as all ones, like an empty slot.
    #[derive(Default)]
    pub(crate) struct FakeConfigSpace {
        latch: u32,
        dwords: HashMap<u32, u32>,
        pub(crate) reads: usize,
    }

    impl FakeConfigSpace {
        pub(crate) fn add_device(&mut self, bus: u8, device: u8, func: u8, vendor_id: u16, device_id: u16, bar0: u32) {
            self.set(bus, device, func, 0x00, ((device_id as u32) << 16) | vendor_id as u32);
            self.set(bus, device, func, PCI_BAR0, bar0);
            self.set(bus, device, func, PCI_COMMAND, 0);
        }

        pub(crate) fn set(&mut self, bus: u8, device: u8, func: u8, offset: u8, value: u32) {
            self.dwords.insert(config_address(bus, device, func, offset), value);
        }

        pub(crate) fn get(&self, bus: u8, device: u8, func: u8, offset: u8) -> u32 {
            self.dwords
                .get(&config_address(bus, device, func, offset))
                .copied()
                .unwrap_or(u32::MAX)
        }
    }

    impl PortIo for FakeConfigSpace {
        fn read_byte(&mut self, _port: u16) -> u8 {
            0xFF
        }

        fn write_byte(&mut self, _port: u16, _value: u8) {}

        fn read_long(&mut self, port: u16) -> u32 {
            assert_eq!(port, PCI_CONFIG_DATA);
            self.reads += 1;
            self.dwords.get(&self.latch).copied().unwrap_or(u32::MAX)
        }

        fn write_long(&mut self, port: u16, value: u32) {
            match port {
                PCI_CONFIG_ADDR => self.latch = value,
                PCI_CONFIG_DATA => {
                    self.dwords.insert(self.latch, value);
                }
                other => panic!("unexpected port {other:#x}"),
            }
        }
    }

    #[test]
    fn config_address_layout() {
        assert_eq!(config_address(0, 0, 0, 0), 0x8000_0000);
        assert_eq!(config_address(1, 2, 3, 0x10), 0x8000_0000 | (1 << 16) | (2 << 11) | (3 << 8) | 0x10);
        // Low two bits of the offset are not part of the address.
        assert_eq!(config_address(0, 0, 0, 0x13), config_address(0, 0, 0, 0x10));
    }

    #[test]
    fn empty_bus_yields_nothing() {
        let mut io = FakeConfigSpace::default();
        assert!(enumerate_pci(&mut io).is_empty());
        // Every triple is probed exactly once.
        assert_eq!(io.reads, 256 * 32 * 8);
    }

    #[test]
    fn records_present_functions_in_scan_order() {
        let mut io = FakeConfigSpace::default();
        io.add_device(3, 0, 0, 0x1234, 0x0001, 0xFEB0_0000);
        io.add_device(0, 31, 2, 0x8086, 0x2922, 0xFEBF_1000);
        io.add_device(0, 1, 0, 0x1AF4, 0x1000, 0xC000_0001);

        let devices = enumerate_pci(&mut io);
        let triples: Vec<_> = devices.iter().map(|d| (d.bus, d.device, d.func)).collect();
        assert_eq!(triples, vec![(0, 1, 0), (0, 31, 2), (3, 0, 0)]);

        let ahci = devices[1];
        assert_eq!(ahci.vendor_id, 0x8086);
        assert_eq!(ahci.device_id, 0x2922);
        assert_eq!(ahci.base_address, 0xFEBF_1000);
    }

    #[test]
    fn absent_vendor_never_reported() {
        let mut io = FakeConfigSpace::default();
        // Device ID answers but vendor reads as 0xFFFF.
        io.set(0, 4, 0, 0x00, 0x1234_FFFF);
        io.add_device(0, 5, 0, 0x10EC, 0x8139, 0xC001);

        let devices = enumerate_pci(&mut io);
        assert_eq!(devices.len(), 1);
        assert!(devices.iter().all(|d| d.vendor_id != 0xFFFF));
    }

    #[test]
    fn stops_at_device_limit() {
        let mut io = FakeConfigSpace::default();
        for n in 0..(MAX_PCI_DEVICES as u16 + 10) {
            io.add_device((n / 8) as u8, 0, (n % 8) as u8, 0x1000 + n, 0x1, 0);
        }
        let devices = enumerate_pci(&mut io);
        assert_eq!(devices.len(), MAX_PCI_DEVICES);
        assert_eq!(devices.last().map(|d| d.vendor_id), Some(0x1000 + MAX_PCI_DEVICES as u16 - 1));
    }

    #[test]
    fn bar_reads_are_bounded() {
        let mut io = FakeConfigSpace::default();
        io.add_device(0, 2, 0, 0x8086, 0x2922, 0xFEBD_0000);
        io.set(0, 2, 0, 0x24, 0xFEBF_0000);
        let dev = PciDevice::new(0, 2, 0, 0x8086, 0x2922, 0xFEBD_0000);

        assert_eq!(read_bar(&mut io, &dev, 0), Some(0xFEBD_0000));
        assert_eq!(read_bar(&mut io, &dev, 5), Some(0xFEBF_0000));
        assert_eq!(read_bar(&mut io, &dev, 6), None);
    }

    #[test]
    fn config_writes_go_through_the_latch() {
        let mut io = FakeConfigSpace::default();
        io.add_device(0, 2, 0, 0x8086, 0x2922, 0);
        let dev = PciDevice::new(0, 2, 0, 0x8086, 0x2922, 0);

        write_pci(&mut io, &dev, PCI_COMMAND, 0x6);
        assert_eq!(io.get(0, 2, 0, PCI_COMMAND), 0x6);
        assert_eq!(read_pci(&mut io, &dev, PCI_COMMAND), 0x6);
    }
}
