//! Memory seam between the core and the embedder.
//!
//! Translation, paging, and device routing live behind [`CpuBus`]; a failed
//! access comes back as the guest [`Fault`] to deliver. The helpers here add
//! the segmentation layer the core owns: effective-address formation, limit
//! and canonical checks, alignment checks, and the stack convention.

use quartz_x86::{Addr, Seg, Width};

use crate::exceptions::Fault;
use crate::mode::CpuMode;
use crate::state::CpuState;

pub trait CpuBus {
    fn read_u8(&mut self, vaddr: u64) -> Result<u8, Fault>;
    fn read_u16(&mut self, vaddr: u64) -> Result<u16, Fault>;
    fn read_u32(&mut self, vaddr: u64) -> Result<u32, Fault>;
    fn read_u64(&mut self, vaddr: u64) -> Result<u64, Fault>;

    fn write_u8(&mut self, vaddr: u64, val: u8) -> Result<(), Fault>;
    fn write_u16(&mut self, vaddr: u64, val: u16) -> Result<(), Fault>;
    fn write_u32(&mut self, vaddr: u64, val: u32) -> Result<(), Fault>;
    fn write_u64(&mut self, vaddr: u64, val: u64) -> Result<(), Fault>;

    /// Fetch up to 15 bytes of instruction stream at `vaddr`. Returns the
    /// window and how many leading bytes are valid; a window truncated by a
    /// translation fault is fine as long as at least one byte landed. Only a
    /// fault on the very first byte is an error.
    fn fetch(&mut self, vaddr: u64, max_len: usize) -> Result<([u8; 15], usize), Fault>;

    fn io_read(&mut self, port: u16, size: u32) -> Result<u64, Fault>;
    fn io_write(&mut self, port: u16, size: u32, val: u64) -> Result<(), Fault>;
}

/// Width-dispatching bus read, zero-extended to 64 bits.
pub fn bus_read(bus: &mut dyn CpuBus, vaddr: u64, width: Width) -> Result<u64, Fault> {
    Ok(match width {
        Width::W8 => u64::from(bus.read_u8(vaddr)?),
        Width::W16 => u64::from(bus.read_u16(vaddr)?),
        Width::W32 => u64::from(bus.read_u32(vaddr)?),
        Width::W64 => bus.read_u64(vaddr)?,
    })
}

pub fn bus_write(bus: &mut dyn CpuBus, vaddr: u64, width: Width, val: u64) -> Result<(), Fault> {
    match width {
        Width::W8 => bus.write_u8(vaddr, val as u8),
        Width::W16 => bus.write_u16(vaddr, val as u16),
        Width::W32 => bus.write_u32(vaddr, val as u32),
        Width::W64 => bus.write_u64(vaddr, val),
    }
}

/// Upper bound (exclusive) of the canonical low half in 4-level paging.
const CANONICAL_LIMIT: u64 = 1 << 47;

pub(crate) fn canonical(vaddr: u64) -> bool {
    let sign = vaddr & (1 << 63) != 0;
    if sign {
        vaddr >= !(CANONICAL_LIMIT - 1)
    } else {
        vaddr < CANONICAL_LIMIT
    }
}

fn segment_violation(seg: Seg) -> Fault {
    if seg == Seg::Ss {
        Fault::ss0()
    } else {
        Fault::gp0()
    }
}

/// Forms the linear address for an access of `len` bytes at `seg:offset`,
/// applying the canonical check (long mode) or the limit check (legacy
/// modes).
pub fn linear(state: &CpuState, seg: Seg, offset: u64, len: u32) -> Result<u64, Fault> {
    let len = u64::from(len);
    if state.mode() == CpuMode::Long64 {
        // Only FS and GS keep a base in 64-bit mode.
        let base = match seg {
            Seg::Fs | Seg::Gs => state.segment(seg).base,
            _ => 0,
        };
        let vaddr = base.wrapping_add(offset);
        let last = vaddr.wrapping_add(len - 1);
        if !canonical(vaddr) || !canonical(last) {
            return Err(segment_violation(seg));
        }
        Ok(vaddr)
    } else {
        let desc = state.segment(seg);
        let last_offset = offset.wrapping_add(len - 1);
        if last_offset < offset || last_offset > u64::from(desc.limit) {
            return Err(segment_violation(seg));
        }
        Ok(desc.base.wrapping_add(offset))
    }
}

/// Segmented data read with alignment enforcement.
pub fn read_mem(
    state: &CpuState,
    bus: &mut dyn CpuBus,
    seg: Seg,
    offset: u64,
    width: Width,
) -> Result<u64, Fault> {
    check_alignment(state, offset, width)?;
    let vaddr = linear(state, seg, offset, width.bytes() as u32)?;
    bus_read(bus, vaddr, width)
}

/// Segmented data write with alignment enforcement.
pub fn write_mem(
    state: &CpuState,
    bus: &mut dyn CpuBus,
    seg: Seg,
    offset: u64,
    width: Width,
    val: u64,
) -> Result<(), Fault> {
    check_alignment(state, offset, width)?;
    let vaddr = linear(state, seg, offset, width.bytes() as u32)?;
    bus_write(bus, vaddr, width, val)
}

fn check_alignment(state: &CpuState, offset: u64, width: Width) -> Result<(), Fault> {
    if state.alignment_check_enabled() && offset % u64::from(width.bytes()) != 0 {
        return Err(Fault::ac0());
    }
    Ok(())
}

/// Mask applied to effective-address arithmetic in the current mode.
#[must_use]
pub fn addr_mask(state: &CpuState) -> u64 {
    match state.mode() {
        CpuMode::Long64 => u64::MAX,
        CpuMode::Real | CpuMode::Virtual8086 => 0xFFFF,
        _ => {
            if state.cs().db {
                0xFFFF_FFFF
            } else {
                0xFFFF
            }
        }
    }
}

/// Computes the effective address of a memory operand. RIP-relative and
/// scale/index arithmetic wrap at the address width.
#[must_use]
pub fn resolve_addr(state: &CpuState, addr: &Addr) -> u64 {
    let mut ea = addr.disp as u64;
    if let Some(base) = addr.base {
        ea = ea.wrapping_add(state.read64(base.index()));
    }
    if let Some(index) = addr.index {
        ea = ea.wrapping_add(state.read64(index.index()).wrapping_mul(u64::from(addr.scale)));
    }
    ea & addr_mask(state)
}

/// Width of stack operations in the current mode: RSP in 64-bit mode,
/// otherwise the SS default size.
#[must_use]
pub fn stack_width(state: &CpuState) -> Width {
    if state.mode().is_long64() {
        Width::W64
    } else if state.ss().db {
        Width::W32
    } else {
        Width::W16
    }
}

pub(crate) fn sp_mask(state: &CpuState) -> u64 {
    match stack_width(state) {
        Width::W64 => u64::MAX,
        Width::W32 => 0xFFFF_FFFF,
        _ => 0xFFFF,
    }
}

const RSP: usize = 4;

/// Pushes one `width`-sized value. RSP moves only if the store succeeds.
pub fn push(
    state: &mut CpuState,
    bus: &mut dyn CpuBus,
    width: Width,
    val: u64,
) -> Result<(), Fault> {
    let mask = sp_mask(state);
    let sp = state.read64(RSP);
    let new_sp = sp.wrapping_sub(u64::from(width.bytes())) & mask | (sp & !mask);
    write_mem(state, bus, Seg::Ss, new_sp & mask, width, val)?;
    state.write64(RSP, new_sp);
    Ok(())
}

/// Pops one `width`-sized value. RSP moves only if the load succeeds.
pub fn pop(state: &mut CpuState, bus: &mut dyn CpuBus, width: Width) -> Result<u64, Fault> {
    let mask = sp_mask(state);
    let sp = state.read64(RSP);
    let val = read_mem(state, bus, Seg::Ss, sp & mask, width)?;
    let new_sp = sp.wrapping_add(u64::from(width.bytes())) & mask | (sp & !mask);
    state.write64(RSP, new_sp);
    Ok(val)
}

/// Identity-mapped memory bus used by unit tests. Accesses past the end of
/// the backing store surface as page faults carrying the offending address.
#[derive(Debug, Clone)]
pub struct FlatTestBus {
    mem: Vec<u8>,
}

impl FlatTestBus {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self { mem: vec![0; size] }
    }

    pub fn load(&mut self, addr: u64, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();
        self.mem[start..end].copy_from_slice(data);
    }

    #[must_use]
    pub fn slice(&self, addr: u64, len: usize) -> &[u8] {
        let start = addr as usize;
        let end = start + len;
        &self.mem[start..end]
    }

    fn byte(&self, vaddr: u64) -> Result<u8, Fault> {
        self.mem
            .get(vaddr as usize)
            .copied()
            .ok_or_else(|| Fault::page(vaddr, 0))
    }

    fn byte_mut(&mut self, vaddr: u64) -> Result<&mut u8, Fault> {
        self.mem
            .get_mut(vaddr as usize)
            .ok_or_else(|| Fault::page(vaddr, 0x2))
    }
}

impl CpuBus for FlatTestBus {
    fn read_u8(&mut self, vaddr: u64) -> Result<u8, Fault> {
        self.byte(vaddr)
    }

    fn read_u16(&mut self, vaddr: u64) -> Result<u16, Fault> {
        let lo = u16::from(self.byte(vaddr)?);
        let hi = u16::from(self.byte(vaddr.wrapping_add(1))?);
        Ok(lo | hi << 8)
    }

    fn read_u32(&mut self, vaddr: u64) -> Result<u32, Fault> {
        let mut v = 0u32;
        for i in 0..4 {
            v |= u32::from(self.byte(vaddr.wrapping_add(i))?) << (i * 8);
        }
        Ok(v)
    }

    fn read_u64(&mut self, vaddr: u64) -> Result<u64, Fault> {
        let mut v = 0u64;
        for i in 0..8 {
            v |= u64::from(self.byte(vaddr.wrapping_add(i))?) << (i * 8);
        }
        Ok(v)
    }

    fn write_u8(&mut self, vaddr: u64, val: u8) -> Result<(), Fault> {
        *self.byte_mut(vaddr)? = val;
        Ok(())
    }

    fn write_u16(&mut self, vaddr: u64, val: u16) -> Result<(), Fault> {
        self.write_u8(vaddr, val as u8)?;
        self.write_u8(vaddr.wrapping_add(1), (val >> 8) as u8)
    }

    fn write_u32(&mut self, vaddr: u64, val: u32) -> Result<(), Fault> {
        for i in 0..4 {
            self.write_u8(vaddr.wrapping_add(i), (val >> (i * 8)) as u8)?;
        }
        Ok(())
    }

    fn write_u64(&mut self, vaddr: u64, val: u64) -> Result<(), Fault> {
        for i in 0..8 {
            self.write_u8(vaddr.wrapping_add(i), (val >> (i * 8)) as u8)?;
        }
        Ok(())
    }

    fn fetch(&mut self, vaddr: u64, max_len: usize) -> Result<([u8; 15], usize), Fault> {
        let mut buf = [0u8; 15];
        let want = max_len.min(15);
        let mut got = 0;
        while got < want {
            match self.byte(vaddr.wrapping_add(got as u64)) {
                Ok(b) => {
                    buf[got] = b;
                    got += 1;
                }
                Err(fault) if got == 0 => return Err(fault),
                Err(_) => break,
            }
        }
        Ok((buf, got))
    }

    fn io_read(&mut self, _port: u16, size: u32) -> Result<u64, Fault> {
        // Open bus.
        Ok(match size {
            1 => 0xFF,
            2 => 0xFFFF,
            _ => 0xFFFF_FFFF,
        })
    }

    fn io_write(&mut self, _port: u16, _size: u32, _val: u64) -> Result<(), Fault> {
        Ok(())
    }
}
