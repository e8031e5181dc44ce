#![cfg_attr(not(test), no_std)]
#![allow(clippy::needless_return)]

extern crate alloc;

pub mod command_line;
pub mod config;
pub mod disks;
pub mod logging;
pub mod memory;
pub mod pci;

#[cfg(target_arch = "x86_64")]
use x86_64::instructions::port::Port;

/// Raw x86 port I/O, as used for PCI configuration access.
///
/// Reads and writes are synchronous and their side effects are visible as soon
/// as the call returns.
pub trait PortIo {
    fn read_byte(&mut self, port: u16) -> u8;
    fn write_byte(&mut self, port: u16, value: u8);
    fn read_long(&mut self, port: u16) -> u32;
    fn write_long(&mut self, port: u16, value: u32);
}

/// Port I/O through the `in`/`out` instructions.
#[cfg(target_arch = "x86_64")]
pub struct X86PortIo {
    _private: (),
}

#[cfg(target_arch = "x86_64")]
impl X86PortIo {
    /// # Safety
    ///
    /// The caller must be running with I/O privilege (ring 0 or a permissive
    /// IOPL) and must not hand out another `X86PortIo` that touches the same
    /// ports concurrently.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(target_arch = "x86_64")]
impl PortIo for X86PortIo {
    fn read_byte(&mut self, port: u16) -> u8 {
        unsafe { Port::<u8>::new(port).read() }
    }

    fn write_byte(&mut self, port: u16, value: u8) {
        unsafe { Port::<u8>::new(port).write(value) }
    }

    fn read_long(&mut self, port: u16) -> u32 {
        unsafe { Port::<u32>::new(port).read() }
    }

    fn write_long(&mut self, port: u16, value: u32) {
        unsafe { Port::<u32>::new(port).write(value) }
    }
}
