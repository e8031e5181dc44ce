use crate::disks::AhciError;
use log::error;
use x86_64::{
    PhysAddr, VirtAddr,
    structures::paging::{
        FrameAllocator, Mapper, Page, PageTableFlags, PhysFrame, Size4KiB, Translate,
    },
};

/// The memory-mapping service the storage stack runs on.
pub trait MemoryMapper {
    /// Makes `size` bytes of physical memory starting at `phys` addressable and
    /// returns the virtual address of `phys`.
    fn map(&mut self, phys: PhysAddr, size: usize) -> Result<VirtAddr, AhciError>;

    /// Physical address behind `virt`, as a bus master would see it.
    fn translate(&self, virt: VirtAddr) -> Option<PhysAddr>;
}

/// Identity-maps device memory into the active page tables, uncached.
pub struct PageTableMapper<M, A> {
    mapper: M,
    frame_allocator: A,
}

impl<M, A> PageTableMapper<M, A>
where
    M: Mapper<Size4KiB> + Translate,
    A: FrameAllocator<Size4KiB>,
{
    pub fn new(mapper: M, frame_allocator: A) -> Self {
        Self { mapper, frame_allocator }
    }
}

impl<M, A> MemoryMapper for PageTableMapper<M, A>
where
    M: Mapper<Size4KiB> + Translate,
    A: FrameAllocator<Size4KiB>,
{
    fn map(&mut self, phys: PhysAddr, size: usize) -> Result<VirtAddr, AhciError> {
        if size == 0 {
            return Err(AhciError::MappingFailed);
        }

        let start = VirtAddr::try_new(phys.as_u64()).map_err(|_| AhciError::MappingFailed)?;
        let end = VirtAddr::try_new(phys.as_u64() + size as u64 - 1).map_err(|_| AhciError::MappingFailed)?;
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_CACHE;

        let pages = Page::<Size4KiB>::range_inclusive(Page::containing_address(start), Page::containing_address(end));
        for page in pages {
            let frame = PhysFrame::containing_address(PhysAddr::new(page.start_address().as_u64()));
            match self.mapper.translate_page(page) {
                Ok(mapped) if mapped == frame => continue,
                Ok(mapped) => {
                    error!(
                        "(MEM) {:#x} is already mapped to {:#x}!",
                        page.start_address().as_u64(),
                        mapped.start_address().as_u64()
                    );
                    return Err(AhciError::MappingFailed);
                }
                Err(_) => {}
            }

            match unsafe { self.mapper.map_to(page, frame, flags, &mut self.frame_allocator) } {
                Ok(flush) => flush.flush(),
                Err(e) => {
                    error!("(MEM) Unable to map {:#x}: {:?}", page.start_address().as_u64(), e);
                    return Err(AhciError::MappingFailed);
                }
            }
        }

        Ok(start)
    }

    fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.mapper.translate_addr(virt)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::boxed::Box;
    use x86_64::structures::paging::{OffsetPageTable, PageTable};

    /// Memory where virtual and physical addresses coincide, as on the
    /// kernel's identity-mapped low memory.
    pub(crate) struct IdentityMapper;

    impl MemoryMapper for IdentityMapper {
        fn map(&mut self, phys: PhysAddr, _size: usize) -> Result<VirtAddr, AhciError> {
            Ok(VirtAddr::new(phys.as_u64()))
        }

        fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
            Some(PhysAddr::new(virt.as_u64()))
        }
    }

    struct NoFrames;

    unsafe impl FrameAllocator<Size4KiB> for NoFrames {
        fn allocate_frame(&mut self) -> Option<PhysFrame> {
            None
        }
    }

    /// Hands out heap page tables. With a zero physical offset their frame is
    /// their own address.
    struct LeakedFrames;

    unsafe impl FrameAllocator<Size4KiB> for LeakedFrames {
        fn allocate_frame(&mut self) -> Option<PhysFrame> {
            let table: &'static mut PageTable = Box::leak(Box::new(PageTable::new()));
            PhysFrame::from_start_address(PhysAddr::new(table as *mut PageTable as u64)).ok()
        }
    }

    fn empty_tables() -> PageTableMapper<OffsetPageTable<'static>, NoFrames> {
        let level_4: &'static mut PageTable = Box::leak(Box::new(PageTable::new()));
        let mapper = unsafe { OffsetPageTable::new(level_4, VirtAddr::new(0)) };
        PageTableMapper::new(mapper, NoFrames)
    }

    /// Tables where `page` already points at `frame`. The TLB is never
    /// touched since nothing here runs on the tables.
    fn tables_with(page: u64, frame: u64) -> PageTableMapper<OffsetPageTable<'static>, LeakedFrames> {
        let level_4: &'static mut PageTable = Box::leak(Box::new(PageTable::new()));
        let mut mapper = unsafe { OffsetPageTable::new(level_4, VirtAddr::new(0)) };
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(page));
        let frame = PhysFrame::containing_address(PhysAddr::new(frame));
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        unsafe { mapper.map_to(page, frame, flags, &mut LeakedFrames) }.unwrap().ignore();
        PageTableMapper::new(mapper, LeakedFrames)
    }

    #[test]
    fn zero_sized_mapping_is_refused() {
        let mut mapper = empty_tables();
        assert_eq!(mapper.map(PhysAddr::new(0xFEBF_0000), 0), Err(AhciError::MappingFailed));
    }

    #[test]
    fn unmapped_addresses_do_not_translate() {
        let mapper = empty_tables();
        assert_eq!(mapper.translate(VirtAddr::new(0x40_0000)), None);
    }

    #[test]
    fn frame_exhaustion_is_a_mapping_failure() {
        // An empty level 4 table needs fresh frames for the lower levels.
        let mut mapper = empty_tables();
        assert_eq!(mapper.map(PhysAddr::new(0xFEBF_0000), 0x1100), Err(AhciError::MappingFailed));
    }

    #[test]
    fn page_mapped_elsewhere_is_not_reused() {
        let mut mapper = tables_with(0xFEBF_0000, 0x1234_5000);
        assert_eq!(mapper.map(PhysAddr::new(0xFEBF_0000), 0x1000), Err(AhciError::MappingFailed));
        // The existing mapping is left alone.
        assert_eq!(mapper.translate(VirtAddr::new(0xFEBF_0010)), Some(PhysAddr::new(0x1234_5010)));
    }

    #[test]
    fn existing_identity_mapping_is_reused() {
        let mut mapper = tables_with(0xFEBF_0000, 0xFEBF_0000);
        assert_eq!(mapper.map(PhysAddr::new(0xFEBF_0080), 0x80), Ok(VirtAddr::new(0xFEBF_0080)));
        assert_eq!(mapper.translate(VirtAddr::new(0xFEBF_0100)), Some(PhysAddr::new(0xFEBF_0100)));
    }
}
