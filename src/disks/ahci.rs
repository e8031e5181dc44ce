use super::layout::{COMMAND_LIST_SIZE, DmaRegion, PortLayout, RECEIVED_FIS_SIZE};
use super::*;
use crate::{
    PortIo,
    config::AhciConfig,
    memory::MemoryMapper,
    pci::{PCI_COMMAND, PciDevice, read_bar, read_pci, write_pci},
};
use alloc::vec::Vec;
use bitfield::bitfield;
use core::mem::{offset_of, size_of};
use core::ptr;
use core::sync::atomic::{Ordering, fence};
use log::{debug, error, info, warn};
use spin::Mutex;
use volatile::Volatile;
use x86_64::{PhysAddr, VirtAddr};

/// Bytes mapped for one controller: generic host control plus 32 port blocks.
pub const HBA_MEM_SIZE: usize = size_of::<HbaMemHdr>() + CMD_SLOTS * size_of::<HbaPort>();

/// Command FIS length in dwords, as stored in the command header.
const FIS_REG_H2D_DWORDS: u8 = (size_of::<FisRegH2D>() / 4) as u8;

/// Offset of the PRDT inside a command table.
const PRDT_OFFSET: usize = offset_of!(CommandTable, prdt_entry);

/// Bytes one PRDT entry may cover.
const PRDT_ENTRY_BYTES: usize = SECTORS_PER_PRDT as usize * SECTOR_SIZE;

const PAGE_SIZE: u64 = 4096;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FisRegH2D {
    pub fis_type: u8,
    pub pmc: PmC,
    pub command: u8,
    pub featurel: u8,
    pub lba0: u8,
    pub lba1: u8,
    pub lba2: u8,
    pub device: u8,
    pub lba3: u8,
    pub lba4: u8,
    pub lba5: u8,
    pub featureh: u8,
    pub countl: u8,
    pub counth: u8,
    pub icc: u8,
    pub control: u8,
    pub rsv1: [u8; 4],
}

bitfield! {
    #[derive(Clone, Copy, Default)]
    #[repr(transparent)]
    pub struct PmC(u8);
    impl Debug;
    pub u8, pmport, set_pmport: 3, 0;
    pub c, set_c: 7;
}

impl FisRegH2D {
    /// READ DMA EXT of `count` sectors starting at the 48-bit LBA `starth:startl`.
    ///
    /// Only the low 16 bits of `starth` fit in the FIS.
    pub fn read_dma_ext(startl: u32, starth: u32, count: u16) -> Self {
        let mut pmc = PmC::default();
        pmc.set_c(true);

        Self {
            fis_type: FIS_TYPE_REG_H2D,
            pmc,
            command: ATA_CMD_READ_DMA_EX,
            featurel: 0,
            lba0: startl as u8,
            lba1: (startl >> 8) as u8,
            lba2: (startl >> 16) as u8,
            device: 1 << 6,
            lba3: (startl >> 24) as u8,
            lba4: starth as u8,
            lba5: (starth >> 8) as u8,
            featureh: 0,
            countl: (count & 0xFF) as u8,
            counth: (count >> 8) as u8,
            icc: 0,
            control: 0,
            rsv1: [0; 4],
        }
    }

    pub fn lba(&self) -> u64 {
        u64::from_le_bytes([self.lba0, self.lba1, self.lba2, self.lba3, self.lba4, self.lba5, 0, 0])
    }

    pub fn count(&self) -> u16 {
        u16::from_le_bytes([self.countl, self.counth])
    }
}

/// Per-port register block. THIS STRUCT IS VOLATILE!
#[repr(C)]
#[allow(dead_code)]
pub struct HbaPort {
    clb: Volatile<u32>,
    clbu: Volatile<u32>,
    fb: Volatile<u32>,
    fbu: Volatile<u32>,
    is: Volatile<u32>,
    ie: Volatile<u32>,
    cmd: Volatile<u32>,
    rsv0: u32,
    tfd: Volatile<u32>,
    sig: Volatile<u32>,
    ssts: Volatile<u32>,
    sctl: Volatile<u32>,
    serr: Volatile<u32>,
    sact: Volatile<u32>,
    ci: Volatile<u32>,
    sntf: Volatile<u32>,
    fbs: Volatile<u32>,
    rsv1: [u32; 11],
    vendor: [u32; 4],
}

impl HbaPort {
    /// Reports what is attached, from SSTS and SIG only.
    pub fn classify(&self) -> DeviceKind {
        DeviceKind::from_registers(self.ssts.read(), self.sig.read())
    }

    fn reg(&self, reg: PortReg) -> &Volatile<u32> {
        match reg {
            PortReg::Clb => &self.clb,
            PortReg::Clbu => &self.clbu,
            PortReg::Fb => &self.fb,
            PortReg::Fbu => &self.fbu,
            PortReg::Is => &self.is,
            PortReg::Cmd => &self.cmd,
            PortReg::Tfd => &self.tfd,
            PortReg::Sig => &self.sig,
            PortReg::Ssts => &self.ssts,
            PortReg::Sact => &self.sact,
            PortReg::Ci => &self.ci,
        }
    }

    fn reg_mut(&mut self, reg: PortReg) -> &mut Volatile<u32> {
        match reg {
            PortReg::Clb => &mut self.clb,
            PortReg::Clbu => &mut self.clbu,
            PortReg::Fb => &mut self.fb,
            PortReg::Fbu => &mut self.fbu,
            PortReg::Is => &mut self.is,
            PortReg::Cmd => &mut self.cmd,
            PortReg::Tfd => &mut self.tfd,
            PortReg::Sig => &mut self.sig,
            PortReg::Ssts => &mut self.ssts,
            PortReg::Sact => &mut self.sact,
            PortReg::Ci => &mut self.ci,
        }
    }
}

/// The port registers the driver reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortReg {
    Clb,
    Clbu,
    Fb,
    Fbu,
    Is,
    Cmd,
    Tfd,
    Sig,
    Ssts,
    Sact,
    Ci,
}

/// Access to one port's registers. `HbaPort` is the memory-mapped block;
/// anything else has to honour the same write semantics (IS and SERR are
/// write-1-to-clear, writing 1 to a CI bit issues that slot).
pub trait PortRegisters {
    fn read_reg(&self, reg: PortReg) -> u32;
    fn write_reg(&mut self, reg: PortReg, value: u32);

    fn set_bits(&mut self, reg: PortReg, bits: u32) {
        let value = self.read_reg(reg);
        self.write_reg(reg, value | bits);
    }

    fn clear_bits(&mut self, reg: PortReg, bits: u32) {
        let value = self.read_reg(reg);
        self.write_reg(reg, value & !bits);
    }
}

impl PortRegisters for HbaPort {
    fn read_reg(&self, reg: PortReg) -> u32 {
        self.reg(reg).read()
    }

    fn write_reg(&mut self, reg: PortReg, value: u32) {
        self.reg_mut(reg).write(value);
    }
}

impl<T: PortRegisters + ?Sized> PortRegisters for &mut T {
    fn read_reg(&self, reg: PortReg) -> u32 {
        (**self).read_reg(reg)
    }

    fn write_reg(&mut self, reg: PortReg, value: u32) {
        (**self).write_reg(reg, value);
    }
}

/// Generic host control registers. THIS STRUCT IS VOLATILE!
#[repr(C)]
#[allow(dead_code)]
pub struct HbaMemHdr {
    cap: Volatile<u32>,
    ghc: Volatile<u32>,
    is: Volatile<u32>,
    pi: Volatile<u32>,
    vs: Volatile<u32>,
    ccc_ctl: Volatile<u32>,
    ccc_pts: Volatile<u32>,
    em_loc: Volatile<u32>,
    em_ctl: Volatile<u32>,
    cap2: Volatile<u32>,
    bohc: Volatile<u32>,
    rsv: [u8; 0xA0 - 0x2C],
    vendor: [u8; 0x100 - 0xA0],
}

#[repr(C)]
#[allow(dead_code)]
pub struct CommandHeader {
    pub cflawp: CflAwp,
    pub rbcpmp: RbcPmp,
    /// Number of PRDT entries the HBA will walk.
    pub prdtl: u16,
    /// Bytes transferred, written back by the HBA.
    pub prdbc: Volatile<u32>,
    pub ctba: u32,
    pub ctbau: u32,
    rsv1: [u32; 4],
}

bitfield! {
    #[derive(Clone, Copy, Default)]
    #[repr(transparent)]
    pub struct CflAwp(u8);
    impl Debug;
    pub u8, cfl, set_cfl: 4, 0;
    pub a, set_a: 5;
    pub w, set_w: 6;
    pub p, set_p: 7;
}

bitfield! {
    #[derive(Clone, Copy, Default)]
    #[repr(transparent)]
    pub struct RbcPmp(u8);
    impl Debug;
    pub r, set_r: 0;
    pub b, set_b: 1;
    pub c, set_c: 2;
    pub u8, pmp, set_pmp: 7, 4;
}

#[repr(C)]
#[allow(dead_code)]
pub struct PrdtEntry {
    pub dba: u32,
    pub dbau: u32,
    rsv0: u32,
    pub dbci: DbcI,
}

bitfield! {
    #[derive(Clone, Copy, Default)]
    #[repr(transparent)]
    pub struct DbcI(u32);
    impl Debug;
    /// Byte count minus one.
    pub u32, dbc, set_dbc: 21, 0;
    pub i, set_i: 31;
}

#[repr(C)]
#[allow(dead_code)]
pub struct CommandTable {
    cfis: [u8; 64],
    acmd: [u8; 16],
    rsv0: [u8; 48],
    pub prdt_entry: [PrdtEntry; PRDT_ENTRIES],
}

const _: () = {
    assert!(size_of::<FisRegH2D>() == 20);
    assert!(size_of::<HbaPort>() == 0x80);
    assert!(offset_of!(HbaPort, tfd) == 0x20);
    assert!(offset_of!(HbaPort, sig) == 0x24);
    assert!(offset_of!(HbaPort, ssts) == 0x28);
    assert!(offset_of!(HbaPort, sact) == 0x34);
    assert!(offset_of!(HbaPort, ci) == 0x38);
    assert!(size_of::<HbaMemHdr>() == 0x100);
    assert!(offset_of!(HbaMemHdr, pi) == 0x0C);
    assert!(size_of::<CommandHeader>() == COMMAND_LIST_SIZE / CMD_SLOTS);
    assert!(offset_of!(CommandHeader, ctba) == 8);
    assert!(size_of::<PrdtEntry>() == 16);
    assert!(PRDT_OFFSET == 0x80);
    assert!(size_of::<CommandTable>() == layout::COMMAND_TABLE_SIZE);
};

impl CommandTable {
    /// Describes `count` sectors of `buf` as a PRDT and returns the number of
    /// entries written.
    ///
    /// An entry covers at most 16 sectors and ends early wherever the next
    /// page of `buf` is not physically adjacent to the last one. A buffer
    /// that needs more entries than the table holds is `AddressTranslation`.
    ///
    /// The caller has checked `count` against `MAX_SECTORS_PER_COMMAND` and
    /// `buf` against the transfer size.
    pub fn build_prdt(
        &mut self,
        translate: impl Fn(VirtAddr) -> Option<PhysAddr>,
        count: u16,
        buf: &mut [u16],
    ) -> Result<u16, AhciError> {
        let total = count as usize * SECTOR_SIZE;
        let base = VirtAddr::from_ptr(buf.as_mut_ptr());
        let mut offset = 0;
        let mut entries = 0;

        while offset < total {
            let Some(entry) = self.prdt_entry.get_mut(entries) else {
                error!("(AHCI) Buffer is too scattered for {} PRDT entries!", PRDT_ENTRIES);
                return Err(AhciError::AddressTranslation);
            };

            let start = base + offset as u64;
            let phys = translate(start).ok_or(AhciError::AddressTranslation)?;
            let limit = (total - offset).min(PRDT_ENTRY_BYTES);

            let mut len = 0;
            while len < limit {
                let virt = start + len as u64;
                if len > 0 && translate(virt) != Some(phys + len as u64) {
                    break;
                }
                let to_page_end = (PAGE_SIZE - virt.as_u64() % PAGE_SIZE) as usize;
                len += to_page_end.min(limit - len);
            }

            entry.dba = phys.as_u64() as u32;
            entry.dbau = (phys.as_u64() >> 32) as u32;
            entry.dbci.set_dbc(len as u32 - 1);
            entry.dbci.set_i(true);

            offset += len;
            entries += 1;
        }

        Ok(entries as u16)
    }

    pub fn set_command_fis(&mut self, fis: FisRegH2D) {
        unsafe { ptr::write_unaligned(self.cfis.as_mut_ptr() as *mut FisRegH2D, fis) };
    }

    pub fn command_fis(&self) -> FisRegH2D {
        unsafe { ptr::read_unaligned(self.cfis.as_ptr() as *const FisRegH2D) }
    }
}

/// Lowest clear bit of a SACT | CI snapshot.
pub fn find_free_slot(slots: u32) -> Option<u8> {
    let free = (!slots).trailing_zeros();
    if free as usize >= CMD_SLOTS {
        return None;
    }
    Some(free as u8)
}

/// Polls `done` up to `limit` times. Returns whether it ever held.
fn spin_until(limit: u32, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..limit {
        if done() {
            return true;
        }
        core::hint::spin_loop();
    }
    done()
}

/// Software's view of a port's command engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Stopped,
    Rebasing,
    Running,
}

pub struct AhciPort<R = &'static mut HbaPort> {
    number: u8,
    regs: R,
    config: AhciConfig,
    state: PortState,
    dma: Option<DmaRegion>,
}

impl<R: PortRegisters> AhciPort<R> {
    pub fn new(number: u8, regs: R, config: AhciConfig) -> Self {
        Self { number, regs, config, state: PortState::Stopped, dma: None }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn classify(&self) -> DeviceKind {
        DeviceKind::from_registers(self.regs.read_reg(PortReg::Ssts), self.regs.read_reg(PortReg::Sig))
    }

    /// Clears ST and FRE, then waits for FR and CR to drop.
    pub fn stop_cmd(&mut self) -> Result<(), AhciError> {
        self.regs.clear_bits(PortReg::Cmd, HBA_PXCMD_ST);
        self.regs.clear_bits(PortReg::Cmd, HBA_PXCMD_FRE);
        self.state = PortState::Stopped;

        let regs = &self.regs;
        if !spin_until(self.config.engine_timeout, || {
            regs.read_reg(PortReg::Cmd) & (HBA_PXCMD_FR | HBA_PXCMD_CR) == 0
        }) {
            error!("(AHCI) Port {} command engine did not stop!", self.number);
            return Err(AhciError::Timeout(WaitStage::EngineStop));
        }
        Ok(())
    }

    /// Waits for CR to drop, then sets FRE and ST. CR itself is left for the
    /// HBA to raise.
    pub fn start_cmd(&mut self) -> Result<(), AhciError> {
        if self.dma.is_none() {
            error!("(AHCI) Port {} has no command list to run!", self.number);
            return Err(AhciError::NotInitialized);
        }

        let regs = &self.regs;
        if !spin_until(self.config.engine_timeout, || regs.read_reg(PortReg::Cmd) & HBA_PXCMD_CR == 0) {
            error!("(AHCI) Port {} command engine is still running!", self.number);
            return Err(AhciError::Timeout(WaitStage::EngineStart));
        }

        self.regs.set_bits(PortReg::Cmd, HBA_PXCMD_FRE);
        self.regs.set_bits(PortReg::Cmd, HBA_PXCMD_ST);
        self.state = PortState::Running;
        Ok(())
    }

    /// Points the port at its command list, FIS area and command tables
    /// inside `dma`, zeroing all of them, and restarts the command engine.
    pub fn rebase(&mut self, dma: DmaRegion) -> Result<(), AhciError> {
        if self.number as usize >= CMD_SLOTS {
            return Err(AhciError::PortNotImplemented(self.number));
        }

        let layout = PortLayout::for_port(self.number);
        if dma.len() < layout.end() {
            error!("(AHCI) Command memory too small for port {}!", self.number);
            return Err(AhciError::MappingFailed);
        }

        info!("(AHCI) Rebasing port {}", self.number);
        self.stop_cmd()?;
        self.state = PortState::Rebasing;

        let clb = dma.phys(layout.command_list);
        self.regs.write_reg(PortReg::Clb, clb as u32);
        self.regs.write_reg(PortReg::Clbu, (clb >> 32) as u32);
        unsafe { ptr::write_bytes(dma.virt(layout.command_list).as_mut_ptr::<u8>(), 0, COMMAND_LIST_SIZE) };

        let fb = dma.phys(layout.received_fis);
        self.regs.write_reg(PortReg::Fb, fb as u32);
        self.regs.write_reg(PortReg::Fbu, (fb >> 32) as u32);
        unsafe { ptr::write_bytes(dma.virt(layout.received_fis).as_mut_ptr::<u8>(), 0, RECEIVED_FIS_SIZE) };

        debug!("(AHCI) Command list base: {:#x}, FIS base: {:#x}", clb, fb);

        for slot in 0..CMD_SLOTS {
            let ctba = dma.phys(layout.command_table(slot));
            let header = command_header(&dma, &layout, slot);
            header.prdtl = PRDT_ENTRIES as u16;
            header.ctba = ctba as u32;
            header.ctbau = (ctba >> 32) as u32;
            unsafe {
                ptr::write_bytes(
                    dma.virt(layout.command_table(slot)).as_mut_ptr::<u8>(),
                    0,
                    size_of::<CommandTable>(),
                )
            };
        }

        self.dma = Some(dma);
        self.start_cmd()
    }

    /// Reads `count` sectors starting at LBA `starth:startl` into `buf`.
    ///
    /// One command is in flight at a time; the call spins until it completes,
    /// fails, or runs out of budget.
    ///
    /// On `Timeout(Completion)` the port is stopped so the HBA drops the
    /// command, and it has to be rebased before the next read. If the engine
    /// does not stop either, the device may still write into `buf` after this
    /// returns: do not free or reuse `buf` until the port has been rebased.
    pub fn read(
        &mut self,
        mapper: &impl MemoryMapper,
        startl: u32,
        starth: u32,
        count: u16,
        buf: &mut [u16],
    ) -> Result<(), AhciError> {
        let dma = match (self.state, self.dma) {
            (PortState::Running, Some(dma)) => dma,
            _ => return Err(AhciError::NotInitialized),
        };
        if count == 0 || count > MAX_SECTORS_PER_COMMAND {
            return Err(AhciError::InvalidSectorCount(count));
        }
        let needed = count as usize * SECTOR_SIZE;
        if buf.len() * 2 < needed {
            return Err(AhciError::BufferTooSmall { needed, actual: buf.len() * 2 });
        }

        self.regs.write_reg(PortReg::Is, u32::MAX);

        let busy_slots = self.regs.read_reg(PortReg::Sact) | self.regs.read_reg(PortReg::Ci);
        let slot = match find_free_slot(busy_slots) {
            Some(slot) => slot as usize,
            None => {
                warn!("(AHCI) Cannot find free command list entry on port {}!", self.number);
                return Err(AhciError::NoFreeCommandSlot);
            }
        };

        let layout = PortLayout::for_port(self.number);
        let table = command_table(&dma, &layout, slot);
        unsafe { ptr::write_bytes((&mut *table as *mut CommandTable).cast::<u8>(), 0, size_of::<CommandTable>()) };
        let prdtl = table.build_prdt(|virt| mapper.translate(virt), count, buf)?;
        table.set_command_fis(FisRegH2D::read_dma_ext(startl, starth, count));

        let header = command_header(&dma, &layout, slot);
        header.cflawp.set_cfl(FIS_REG_H2D_DWORDS);
        header.cflawp.set_w(false);
        header.prdtl = prdtl;
        header.prdbc.write(0);

        let regs = &self.regs;
        let busy = (ATA_DEV_BUSY | ATA_DEV_DRQ) as u32;
        if !spin_until(self.config.busy_spin_limit, || regs.read_reg(PortReg::Tfd) & busy == 0) {
            error!("(AHCI) Port {} is hung!", self.number);
            return Err(AhciError::PortHung);
        }

        // The command table has to reach memory before the HBA fetches it.
        fence(Ordering::SeqCst);
        let bit = 1u32 << slot;
        self.regs.write_reg(PortReg::Ci, bit);

        let mut spins = 0u32;
        while self.regs.read_reg(PortReg::Ci) & bit != 0 {
            if self.regs.read_reg(PortReg::Is) & HBA_PXIS_TFES != 0 {
                error!("(AHCI) Read disk error on port {}!", self.number);
                return Err(AhciError::TaskFileError);
            }
            if spins >= self.config.completion_timeout {
                error!("(AHCI) Port {} slot {} never completed!", self.number, slot);
                // Clearing ST makes the HBA drop everything in CI.
                if let Err(e) = self.stop_cmd() {
                    error!("(AHCI) Port {} may still be writing to the buffer: {}", self.number, e);
                }
                return Err(AhciError::Timeout(WaitStage::Completion));
            }
            spins += 1;
            core::hint::spin_loop();
        }

        if self.regs.read_reg(PortReg::Is) & HBA_PXIS_TFES != 0 {
            error!("(AHCI) Read disk error on port {}!", self.number);
            return Err(AhciError::TaskFileError);
        }

        fence(Ordering::SeqCst);
        Ok(())
    }
}

// The region owns no Rust memory; the returned borrow only lives as long as
// the caller's view of it.
fn command_header<'a>(dma: &'a DmaRegion, layout: &PortLayout, slot: usize) -> &'a mut CommandHeader {
    unsafe { &mut *dma.virt(layout.command_header(slot)).as_mut_ptr::<CommandHeader>() }
}

fn command_table<'a>(dma: &'a DmaRegion, layout: &PortLayout, slot: usize) -> &'a mut CommandTable {
    unsafe { &mut *dma.virt(layout.command_table(slot)).as_mut_ptr::<CommandTable>() }
}

/// A mapped AHCI controller. Each port sits behind its own lock, held for a
/// whole rebase or read.
pub struct AhciController {
    pub pci_device: PciDevice,
    abar: VirtAddr,
    config: AhciConfig,
    ports: Vec<Mutex<AhciPort>>,
}

impl AhciController {
    /// # Safety
    ///
    /// `abar` must map `HBA_MEM_SIZE` bytes of this controller's registers,
    /// uncached, for the rest of the kernel's life, and no other
    /// `AhciController` may be built over the same registers.
    pub unsafe fn from_abar(pci_device: PciDevice, abar: VirtAddr, config: AhciConfig) -> Self {
        let port_regs = (abar + size_of::<HbaMemHdr>() as u64).as_mut_ptr::<HbaPort>();
        let port_regs: &'static mut [HbaPort] = unsafe { core::slice::from_raw_parts_mut(port_regs, CMD_SLOTS) };

        let ports = port_regs
            .iter_mut()
            .enumerate()
            .map(|(n, regs)| Mutex::new(AhciPort::new(n as u8, regs, config)))
            .collect();

        Self { pci_device, abar, config, ports }
    }

    fn hdr(&self) -> &HbaMemHdr {
        unsafe { &*self.abar.as_ptr::<HbaMemHdr>() }
    }

    fn hdr_mut(&mut self) -> &mut HbaMemHdr {
        unsafe { &mut *self.abar.as_mut_ptr::<HbaMemHdr>() }
    }

    pub fn ports_implemented(&self) -> u32 {
        self.hdr().pi.read()
    }

    /// The start of the register block read as if it were a port's registers.
    pub fn as_port_view(&self) -> &HbaPort {
        unsafe { &*self.abar.as_ptr::<HbaPort>() }
    }

    /// Turns on memory decoding and bus mastering, and puts the HBA in AHCI mode.
    pub fn enable(&mut self, io: &mut impl PortIo) {
        let command = read_pci(io, &self.pci_device, PCI_COMMAND);
        write_pci(io, &self.pci_device, PCI_COMMAND, command | 0x6);

        let ghc = self.hdr().ghc.read();
        self.hdr_mut().ghc.write(ghc | HBA_GHC_AE);
        info!("(AHCI) GHC: {:#010x}", self.hdr().ghc.read());
    }

    pub fn port(&self, n: u8) -> Result<&Mutex<AhciPort>, AhciError> {
        if n as usize >= CMD_SLOTS || self.ports_implemented() & (1 << n) == 0 {
            return Err(AhciError::PortNotImplemented(n));
        }
        Ok(&self.ports[n as usize])
    }

    /// Classifies every implemented port.
    pub fn probe_ports(&self) -> Vec<(u8, DeviceKind)> {
        let pi = self.ports_implemented();
        let mut found = Vec::new();

        for n in 0..CMD_SLOTS as u8 {
            if pi & (1 << n) == 0 {
                continue;
            }
            let kind = self.ports[n as usize].lock().classify();
            info!("(AHCI) {} drive found at port {}", kind, n);
            found.push((n, kind));
        }

        found
    }

    /// Enables the controller, maps the command memory at
    /// `config.command_memory_base` and rebases every port with a drive
    /// behind it. Returns the ports that came up.
    ///
    /// # Safety
    ///
    /// `config.command_memory_base` must be the start of `COMMAND_MEMORY_SIZE`
    /// bytes of RAM reserved for this controller.
    pub unsafe fn bring_up(
        &mut self,
        io: &mut impl PortIo,
        mapper: &mut impl MemoryMapper,
    ) -> Result<Vec<(u8, DeviceKind)>, AhciError> {
        self.enable(io);
        let dma = unsafe { DmaRegion::map(mapper, PhysAddr::new(self.config.command_memory_base))? };

        let mut up = Vec::new();
        for (n, kind) in self.probe_ports() {
            if kind == DeviceKind::None {
                continue;
            }
            match self.rebase_port(n, dma) {
                Ok(()) => up.push((n, kind)),
                Err(e) => warn!("(AHCI) Port {} did not come up: {}", n, e),
            }
        }

        Ok(up)
    }

    pub fn rebase_port(&self, n: u8, dma: DmaRegion) -> Result<(), AhciError> {
        self.port(n)?.lock().rebase(dma)
    }

    pub fn read(
        &self,
        n: u8,
        mapper: &impl MemoryMapper,
        startl: u32,
        starth: u32,
        count: u16,
        buf: &mut [u16],
    ) -> Result<(), AhciError> {
        self.port(n)?.lock().read(mapper, startl, starth, count, buf)
    }

    /// True on success, false on fail.
    ///
    /// After a failed read the same rules as `AhciPort::read` apply to `buf`.
    pub fn read_sectors(&self, n: u8, mapper: &impl MemoryMapper, lba: u64, count: u16, buf: &mut [u16]) -> bool {
        if lba >> 48 != 0 {
            error!("(AHCI) LBA {:#x} does not fit in 48 bits!", lba);
            return false;
        }

        match self.read(n, mapper, lba as u32, (lba >> 32) as u32, count, buf) {
            Ok(()) => true,
            Err(e) => {
                error!("(AHCI) read_sectors failed: port={}, lba={}, count={}: {}", n, lba, count, e);
                false
            }
        }
    }
}

/// Reads the controller BAR and maps the register block behind it.
pub fn map_controller(
    io: &mut impl PortIo,
    mapper: &mut impl MemoryMapper,
    pci_device: PciDevice,
    config: AhciConfig,
) -> Result<AhciController, AhciError> {
    let bar = read_bar(io, &pci_device, config.controller_bar).ok_or(AhciError::InvalidBar(0))?;
    if bar & 1 != 0 || bar & !0xF == 0 {
        return Err(AhciError::InvalidBar(bar));
    }

    let mut base = (bar & !0xF) as u64;
    // 64-bit memory BAR: the next BAR holds the upper half.
    if (bar >> 1) & 0b11 == 0b10 {
        if let Some(upper) = read_bar(io, &pci_device, config.controller_bar.saturating_add(1)) {
            base |= (upper as u64) << 32;
        }
    }

    let abar = mapper.map(PhysAddr::new(base), HBA_MEM_SIZE)?;
    debug!("(AHCI) ABAR {:#x} mapped at {:#x}", base, abar.as_u64());

    Ok(unsafe { AhciController::from_abar(pci_device, abar, config) })
}

/// Keeps the devices whose mapped register block classifies as something
/// other than `DeviceKind::None`, in scan order.
pub fn filter_ahci(
    io: &mut impl PortIo,
    mapper: &mut impl MemoryMapper,
    devices: &[PciDevice],
    config: AhciConfig,
) -> Vec<PciDevice> {
    let mut res: Vec<PciDevice> = Vec::new();
    if res.try_reserve(devices.len()).is_err() {
        error!("(AHCI) Failed to allocate memory for the AHCI device list!");
        return res;
    }

    for dev in devices {
        match map_controller(io, mapper, *dev, config) {
            Ok(controller) => {
                let kind = controller.as_port_view().classify();
                debug!("(AHCI) {}:{}.{} classifies as {}", dev.bus, dev.device, dev.func, kind);
                if kind != DeviceKind::None {
                    res.push(*dev);
                }
            }
            Err(e) => debug!("(AHCI) Skipping {}:{}.{}: {}", dev.bus, dev.device, dev.func, e),
        }
    }

    info!("(AHCI) {} of {} PCI devices look like AHCI controllers", res.len(), devices.len());
    return res;
}
