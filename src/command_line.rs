use crate::{
    PortIo,
    config::AhciConfig,
    disks::ahci::filter_ahci,
    memory::MemoryMapper,
    pci::enumerate_pci,
};
use core::fmt::{self, Write};

/// Runs one shell line, writing its output to `out`.
pub fn process_command(
    command: &str,
    io: &mut impl PortIo,
    mapper: &mut impl MemoryMapper,
    out: &mut impl Write,
) -> fmt::Result {
    match command.split_whitespace().next() {
        None => Ok(()),
        Some("help") => {
            writeln!(out, "Available commands:")?;
            writeln!(out, "help -- Shows this message.")?;
            writeln!(out, "lsdisks -- Lists the AHCI controllers with a drive attached.")
        }
        Some("lsdisks") => lsdisks(io, mapper, out),
        Some(other) => writeln!(out, "Unknown command: {}", other),
    }
}

fn lsdisks(io: &mut impl PortIo, mapper: &mut impl MemoryMapper, out: &mut impl Write) -> fmt::Result {
    let devices = enumerate_pci(io);
    writeln!(out, "Gotten disk list, checking type.")?;

    let disks = filter_ahci(io, mapper, &devices, AhciConfig::default());
    if disks.is_empty() {
        return writeln!(out, "No disks found.");
    }

    for disk in &disks {
        writeln!(out, "{:#06x}", disk.device_id)?;
    }
    Ok(())
}
