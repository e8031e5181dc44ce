/// Tunables for the AHCI stack.
///
/// The spin budgets count polling iterations, not wall-clock time. Each
/// iteration is at least one uncached MMIO read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AhciConfig {
    /// Budget for the command engine to report FR/CR clear on stop, and CR clear before start.
    pub engine_timeout: u32,
    /// Budget for BSY/DRQ to drop before a command is issued.
    pub busy_spin_limit: u32,
    /// Budget for the issued command's CI bit to clear.
    pub completion_timeout: u32,
    /// BAR index holding the controller's register block.
    pub controller_bar: u8,
    /// Physical base of the command lists, received-FIS areas and command tables.
    pub command_memory_base: u64,
}

impl AhciConfig {
    pub const fn new() -> Self {
        Self {
            engine_timeout: 1_000_000,
            busy_spin_limit: 1_000_000,
            completion_timeout: 10_000_000,
            controller_bar: 0,
            command_memory_base: crate::disks::AHCI_BASE,
        }
    }
}

impl Default for AhciConfig {
    fn default() -> Self {
        Self::new()
    }
}
