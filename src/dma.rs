//! DMA controller for the VIF1 (ch1) and GIF (ch2) channels: normal-mode
//! block transfers and chain-mode DMAtag walking (REFE/CNT/NEXT/REF/REFS/
//! CALL/RET/END).
//!
//! The engine only decides *what bytes move from where*; it does not know
//! what a VIF1 command stream or a GIFtag is. [`Dma::process_pending_transfers`]
//! hands each drained channel its raw payload bytes as one buffer per
//! started transfer, and the caller (the top-level runtime) routes channel 1
//! to the VIF1 parser and channel 2 to the GIF arbiter's PATH3 queue.

use bitflags::bitflags;

use crate::error::{Ps2Error, Result};
use crate::io::DmacGlobalRegisters;
use crate::memory::{dmac, GuestMemory};

bitflags! {
    /// The CHCR bits this engine cares about; the remaining bits (DIR, ASP,
    /// TAG) are channel-direction/stall-control fields the core never reads.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Chcr: u32 {
        const MOD = 1 << 2;
        const TIE = 1 << 7;
        const STR = 1 << 8;
    }
}

const STR_BIT: u32 = Chcr::STR.bits();
const TIE_BIT: u32 = Chcr::TIE.bits();
const MOD_BIT: u32 = Chcr::MOD.bits();

/// Safety valve against a malformed chain looping forever; real PS2 chains
/// never approach this.
const MAX_CHAIN_TAGS: usize = 1 << 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct DmaChannel {
    pub chcr: u32,
    pub madr: u32,
    pub qwc: u32,
    pub tadr: u32,
    pub asr: [u32; 2],
    pub sadr: u32,
    /// Shadow of "a transfer is currently started", tracked separately from
    /// the raw CHCR bits so that a write with STR=1 while DMAE=0 can be
    /// retried later: the write still bumps `dma_start_count` but does not
    /// latch `started`, so the *next* STR=1 write (even with the same CHCR
    /// value) is still seen as a rising edge.
    started: bool,
    asr_depth: u8,
}

impl DmaChannel {
    fn chcr_flags(&self) -> Chcr {
        Chcr::from_bits_truncate(self.chcr)
    }

    pub fn str(&self) -> bool {
        self.chcr_flags().contains(Chcr::STR)
    }

    fn tie(&self) -> bool {
        self.chcr_flags().contains(Chcr::TIE)
    }

    fn chain_mode(&self) -> bool {
        self.chcr_flags().contains(Chcr::MOD)
    }

    fn asr_push(&mut self, addr: u32) {
        if (self.asr_depth as usize) < self.asr.len() {
            self.asr[self.asr_depth as usize] = addr;
            self.asr_depth += 1;
        }
    }

    fn asr_pop(&mut self) -> u32 {
        if self.asr_depth == 0 {
            return 0;
        }
        self.asr_depth -= 1;
        self.asr[self.asr_depth as usize]
    }

    fn terminate(&mut self, channel: u8, globals: &mut DmacGlobalRegisters) {
        self.chcr &= !STR_BIT;
        self.qwc = 0;
        self.started = false;
        globals.raise_channel_status(channel);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagId {
    Refe,
    Cnt,
    Next,
    Ref,
    Refs,
    Call,
    Ret,
    End,
}

impl TagId {
    fn decode(raw: u32) -> Result<TagId> {
        Ok(match raw & 0x7 {
            0 => TagId::Refe,
            1 => TagId::Cnt,
            2 => TagId::Next,
            3 => TagId::Ref,
            4 => TagId::Refs,
            5 => TagId::Call,
            6 => TagId::Ret,
            7 => TagId::End,
            other => return Err(Ps2Error::dma_config(0, format!("reserved DMAtag id {other}"))),
        })
    }
}

fn read_bytes(memory: &GuestMemory, addr: u32, len: u32) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len as usize);
    for i in 0..len {
        out.push(memory.read8(addr.wrapping_add(i))?);
    }
    Ok(out)
}

/// The DMAC: per-channel register state for VIF1 (ch1) and GIF (ch2), plus
/// the channel-independent global registers.
#[derive(Debug, Clone, Default)]
pub struct Dma {
    pub vif1: DmaChannel,
    pub gif: DmaChannel,
    pub globals: DmacGlobalRegisters,
    pub dma_start_count: u64,
}

/// One channel's worth of payload bytes drained by a single
/// `process_pending_transfers` call.
pub struct DrainedTransfer {
    pub channel: u8,
    pub data: Vec<u8>,
}

impl Dma {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel_mut(&mut self, channel: u8) -> Option<&mut DmaChannel> {
        match channel {
            dmac::VIF1_CHANNEL => Some(&mut self.vif1),
            dmac::GIF_CHANNEL => Some(&mut self.gif),
            _ => None,
        }
    }

    /// Writes a channel's CHCR, detecting the STR rising edge described in
    /// §4.2. `dma_start_count` advances on every rising edge regardless of
    /// `D_CTRL.DMAE`; the transfer is only queued to start when DMAE is set.
    pub fn write_chcr(&mut self, channel: u8, value: u32) {
        let dmae = self.globals.dmae();
        let Some(ch) = self.channel_mut(channel) else { return };
        let requesting_str = value & STR_BIT != 0;
        if requesting_str && !ch.started {
            self.dma_start_count += 1;
            ch.chcr = value;
            if dmae {
                ch.started = true;
            }
        } else if !requesting_str {
            ch.chcr = value;
            ch.started = false;
        } else {
            ch.chcr = value;
        }
    }

    pub fn write_register(&mut self, channel: u8, offset: u32, value: u32) {
        if offset == dmac::CHCR_OFF {
            self.write_chcr(channel, value);
            return;
        }
        let Some(ch) = self.channel_mut(channel) else { return };
        match offset {
            dmac::MADR_OFF => ch.madr = value,
            dmac::QWC_OFF => ch.qwc = value & 0xFFFF,
            dmac::TADR_OFF => ch.tadr = value,
            dmac::ASR0_OFF => ch.asr[0] = value,
            dmac::ASR1_OFF => ch.asr[1] = value,
            dmac::SADR_OFF => ch.sadr = value,
            _ => {}
        }
    }

    pub fn read_register(&self, channel: u8, offset: u32) -> u32 {
        let ch = match channel {
            dmac::VIF1_CHANNEL => &self.vif1,
            dmac::GIF_CHANNEL => &self.gif,
            _ => return 0,
        };
        match offset {
            dmac::CHCR_OFF => ch.chcr,
            dmac::MADR_OFF => ch.madr,
            dmac::QWC_OFF => ch.qwc,
            dmac::TADR_OFF => ch.tadr,
            dmac::ASR0_OFF => ch.asr[0],
            dmac::ASR1_OFF => ch.asr[1],
            dmac::SADR_OFF => ch.sadr,
            _ => 0,
        }
    }

    /// Drains every channel with a started transfer, VIF1 before GIF per
    /// §5's ordering guarantee, returning each channel's collected payload
    /// bytes. Errors from a single channel are logged and that channel's
    /// transfer is dropped; other channels still drain.
    pub fn process_pending_transfers(&mut self, memory: &GuestMemory) -> Vec<DrainedTransfer> {
        let mut out = Vec::new();
        for channel in [dmac::VIF1_CHANNEL, dmac::GIF_CHANNEL] {
            let started = self.channel_mut(channel).map(|c| c.started).unwrap_or(false);
            if !started {
                continue;
            }
            match self.drain_channel(channel, memory) {
                Ok(data) => out.push(DrainedTransfer { channel, data }),
                Err(e) => crate::error::log_and_continue(&e),
            }
        }
        out
    }

    fn drain_channel(&mut self, channel: u8, memory: &GuestMemory) -> Result<Vec<u8>> {
        let chain = self.channel_mut(channel).unwrap().chain_mode();
        if chain {
            self.drain_chain(channel, memory)
        } else {
            self.drain_normal(channel, memory)
        }
    }

    fn drain_normal(&mut self, channel: u8, memory: &GuestMemory) -> Result<Vec<u8>> {
        let ch = self.channel_mut(channel).unwrap();
        if ch.qwc == 0 {
            ch.terminate(channel, &mut self.globals);
            return Err(Ps2Error::dma_config(channel, "STR with QWC=0 in normal mode"));
        }
        let madr = ch.madr;
        let len = ch.qwc * 16;
        let data = read_bytes(memory, madr, len)?;
        self.channel_mut(channel).unwrap().terminate(channel, &mut self.globals);
        Ok(data)
    }

    fn drain_chain(&mut self, channel: u8, memory: &GuestMemory) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for _ in 0..MAX_CHAIN_TAGS {
            let ch = self.channel_mut(channel).unwrap();
            let tadr = ch.tadr;
            let tie = ch.tie();

            let lo = memory.read64(tadr)?;
            let hi = memory.read64(tadr.wrapping_add(8))?;
            let qwc = (lo & 0xFFFF) as u32;
            let id = TagId::decode((lo >> 28) as u32)?;
            let irq = (lo >> 31) & 1 != 0;
            let tag_addr = hi as u32;

            let payload_addr = tadr.wrapping_add(16);
            let len = qwc * 16;

            let (bytes, next_tadr, natural_end) = match id {
                TagId::Refe => (read_bytes(memory, tag_addr, len)?, tadr, true),
                TagId::Cnt => {
                    let data = read_bytes(memory, payload_addr, len)?;
                    (data, payload_addr.wrapping_add(len), false)
                }
                TagId::Next => (read_bytes(memory, payload_addr, len)?, tag_addr, false),
                TagId::Ref | TagId::Refs => {
                    (read_bytes(memory, tag_addr, len)?, payload_addr, false)
                }
                TagId::Call => {
                    let data = read_bytes(memory, payload_addr, len)?;
                    let ret_addr = payload_addr.wrapping_add(len);
                    self.channel_mut(channel).unwrap().asr_push(ret_addr);
                    (data, tag_addr, false)
                }
                TagId::Ret => {
                    let data = read_bytes(memory, payload_addr, len)?;
                    let ret_addr = self.channel_mut(channel).unwrap().asr_pop();
                    (data, ret_addr, false)
                }
                TagId::End => (read_bytes(memory, payload_addr, len)?, tadr, true),
            };

            out.extend_from_slice(&bytes);

            let ch = self.channel_mut(channel).unwrap();
            let stop = natural_end || (tie && irq);
            if stop {
                ch.terminate(channel, &mut self.globals);
                return Ok(out);
            }
            ch.tadr = next_tadr;
        }
        Err(Ps2Error::dma_config(channel, "chain exceeded maximum tag count"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_qword(mem: &mut GuestMemory, addr: u32, lo: u64, hi: u64) {
        mem.write64(addr, lo).unwrap();
        mem.write64(addr + 8, hi).unwrap();
    }

    fn fill(mem: &mut GuestMemory, addr: u32, byte: u8, len: u32) {
        for i in 0..len {
            mem.write8(addr + i, byte).unwrap();
        }
    }

    #[test]
    fn normal_mode_transfers_qwc_times_16_bytes() {
        let mut mem = GuestMemory::new();
        fill(&mut mem, 0x1000, 0xAB, 32);
        let mut dma = Dma::new();
        dma.globals.d_ctrl = 1;
        dma.write_register(dmac::GIF_CHANNEL, dmac::MADR_OFF, 0x1000);
        dma.write_register(dmac::GIF_CHANNEL, dmac::QWC_OFF, 2);
        dma.write_chcr(dmac::GIF_CHANNEL, STR_BIT);
        let drained = dma.process_pending_transfers(&mem);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].channel, dmac::GIF_CHANNEL);
        assert_eq!(drained[0].data.len(), 32);
        assert!(!dma.gif.str());
    }

    #[test]
    fn dmae_gate_blocks_start_until_enabled_scenario5() {
        let mut mem = GuestMemory::new();
        fill(&mut mem, 0x2000, 0xCD, 16);
        let mut dma = Dma::new();
        dma.write_register(dmac::GIF_CHANNEL, dmac::MADR_OFF, 0x2000);
        dma.write_register(dmac::GIF_CHANNEL, dmac::QWC_OFF, 1);

        dma.write_chcr(dmac::GIF_CHANNEL, STR_BIT);
        assert_eq!(dma.process_pending_transfers(&mem).len(), 0);
        assert_eq!(dma.dma_start_count, 1);

        dma.globals.d_ctrl = 1;
        dma.write_chcr(dmac::GIF_CHANNEL, STR_BIT);
        let drained = dma.process_pending_transfers(&mem);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].data.len(), 16);
    }

    #[test]
    fn chain_call_ret_end_concatenates_payloads_in_order() {
        let mut mem = GuestMemory::new();
        // CALL pushes TADR+16+QWC*16 as the return address, so place RET
        // far away and END exactly where that return address lands.
        let base = 0x4000u32;
        let t0 = base;
        let t1 = base + 0x100;
        let t2 = t0 + 32; // CALL's pushed return address (TADR+16+qwc*16 with TADR=t0, qwc=1)

        write_qword(&mut mem, t0, 1 | (5u64 << 28), t1 as u64); // CALL -> t1
        fill(&mut mem, t0 + 16, 0x11, 16);

        write_qword(&mut mem, t1, 1 | (6u64 << 28), 0); // RET
        fill(&mut mem, t1 + 16, 0x22, 16);

        write_qword(&mut mem, t2, 1 | (7u64 << 28), 0); // END
        fill(&mut mem, t2 + 16, 0x33, 16);

        let mut dma = Dma::new();
        dma.globals.d_ctrl = 1;
        dma.write_register(dmac::GIF_CHANNEL, dmac::TADR_OFF, t0);
        dma.write_chcr(dmac::GIF_CHANNEL, STR_BIT | MOD_BIT);

        let drained = dma.process_pending_transfers(&mem);
        assert_eq!(drained.len(), 1);
        let data = &drained[0].data;
        assert_eq!(data.len(), 48);
        assert!(data[0..16].iter().all(|&b| b == 0x11));
        assert!(data[16..32].iter().all(|&b| b == 0x22));
        assert!(data[32..48].iter().all(|&b| b == 0x33));
    }

    #[test]
    fn tie_with_irq_bit_stops_chain_early() {
        let mut mem = GuestMemory::new();
        let t0 = 0x5000u32;
        let t1 = 0x5100u32;
        // TAG0 = NEXT, qwc=1, irq bit set, addr=t1
        write_qword(&mut mem, t0, 1 | (2u64 << 28) | (1u64 << 31), t1 as u64);
        fill(&mut mem, t0 + 16, 0x77, 16);
        // TAG1 = END (would never be reached because TIE stops us at TAG0)
        write_qword(&mut mem, t1, 1 | (7u64 << 28), 0);
        fill(&mut mem, t1 + 16, 0x88, 16);

        let mut dma = Dma::new();
        dma.globals.d_ctrl = 1;
        dma.write_register(dmac::VIF1_CHANNEL, dmac::TADR_OFF, t0);
        dma.write_chcr(dmac::VIF1_CHANNEL, STR_BIT | MOD_BIT | TIE_BIT);

        let drained = dma.process_pending_transfers(&mem);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].data.len(), 16);
        assert!(drained[0].data.iter().all(|&b| b == 0x77));
    }
}
