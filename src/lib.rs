//! PS2 static-recompilation runtime host: the emulated hardware environment
//! offline-translated R5900 code executes against. Owns guest memory, the
//! DMA/VIF1/GIF/GS/VU1/audio front ends, and the recompiled-function
//! registry; wires them together the way a host frame tick does.

#![allow(clippy::too_many_arguments)]

pub mod audio;
pub mod config;
pub mod dma;
pub mod elf;
pub mod error;
pub mod gif_arbiter;
pub mod gs;
pub mod io;
pub mod logging;
pub mod memory;
pub mod registry;
pub mod traits;
pub mod vif1;
pub mod vu1;

use std::path::Path;

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

use audio::AudioScheduler;
use config::RuntimeConfig;
use dma::{Dma, DrainedTransfer};
use elf::LoadedElf;
use error::{Ps2Error, Result};
use gif_arbiter::GifArbiter;
use gs::{GsContext, GsPacketProcessor};
use memory::{dmac, GuestMemory, GS_PRIV_BASE, GS_PRIV_END};
use registry::{FunctionRegistry, R5900Context, RecompiledFn};
use traits::{PacketSink, PathId, Vu1Start};
use vif1::Vif1Parser;
use vu1::Vu1Interpreter;

/// Records the next `MSCAL`/`MSCALF` target without running it inline: VIF1's
/// `process` already holds `&mut self.vu1` (as `Vu1Memory`) and `&mut
/// self.gif` (as the `PacketSink` for DIRECT/DIRECTHL) for the duration of
/// the call, and starting VU1 needs both of those plus `&mut self.gs` at
/// once — a second simultaneous borrow the type system can't grant. Running
/// the kick once `process` returns sidesteps that without unsafe code.
#[derive(Default)]
struct MscalRecorder {
    pending: Option<(u32, u32)>,
}

impl Vu1Start for MscalRecorder {
    fn mscal(&mut self, pc: u32, itop: u32) {
        self.pending = Some((pc, itop));
    }
}

/// Everything a recompiled function or stub can reach through its `runtime`
/// argument: guest memory, the DMA/VIF1/GIF/GS/VU1 front ends, the audio
/// scheduler, and the function registry used for indirect calls.
pub struct Runtime {
    pub memory: GuestMemory,
    pub dma: Dma,
    pub vif1: Vif1Parser,
    pub gif: GifArbiter,
    pub gs: GsContext,
    pub vu1: Vu1Interpreter,
    pub audio: AudioScheduler,
    pub registry: FunctionRegistry,
    pub config: RuntimeConfig,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Runtime {
            memory: GuestMemory::new(),
            dma: Dma::new(),
            vif1: Vif1Parser::new(),
            gif: GifArbiter::new(),
            gs: GsContext::new(),
            vu1: Vu1Interpreter::new(),
            audio: AudioScheduler::new(),
            registry: FunctionRegistry::new(),
            config,
        }
    }

    /// Loads `bytes` as a PS2 ELF into guest memory at its physical
    /// addresses, then calls [`Runtime::apply_game_overrides`] with the
    /// resolved entry point.
    pub fn load_elf(&mut self, elf_path: &str, bytes: &[u8]) -> Result<LoadedElf> {
        let loaded = elf::load_elf(bytes, &mut self.memory)?;
        self.apply_game_overrides(elf_path, loaded.entry)?;
        Ok(loaded)
    }

    /// Hook a game-specific override crate calls into before the guest
    /// thread starts, rebinding addresses in [`Runtime::registry`]. The
    /// default implementation only logs the entry point; real override
    /// manifests are an external collaborator (see `registry::FunctionRegistry`
    /// for the string-name binding path config-driven overrides use).
    pub fn apply_game_overrides(&mut self, elf_path: &str, entry: u32) -> Result<()> {
        log::info!(target: "ps2", "loaded {elf_path}, entry point {entry:#010x}");
        Ok(())
    }

    /// Invokes the recompiled function (or stub) registered at `addr`, if
    /// any, passing it a raw pointer to RDRAM, `ctx`, and `self` per the
    /// canonical three-argument calling convention. Returns whether an
    /// address was found.
    pub fn call(&mut self, ctx: &mut R5900Context, addr: u32) -> bool {
        let Some(f): Option<RecompiledFn> = self.registry.lookup(addr) else {
            return false;
        };
        let rdram_ptr = self.memory.rdram_mut().as_mut_ptr();
        let ctx_ptr: *mut R5900Context = ctx;
        let runtime_ptr: *mut Runtime = self;
        f(rdram_ptr, ctx_ptr, runtime_ptr);
        true
    }

    /// One host-driven tick: drains every channel with a started DMA
    /// transfer (VIF1 before GIF), routes VIF1's stream through the VIF1
    /// parser and the GIF channel's payload straight to the arbiter's
    /// PATH3, runs any microprogram VIF1's `MSCAL`/`MSCALF` started, then
    /// drains the arbiter into the GS front end in ascending path-priority
    /// order. Call once per host frame, or whenever a consumer needs pending
    /// transfers flushed.
    pub fn pump(&mut self) {
        let transfers: ArrayVec<DrainedTransfer, 2> =
            self.dma.process_pending_transfers(&self.memory).into_iter().collect();

        for transfer in transfers {
            match transfer.channel {
                dmac::VIF1_CHANNEL => self.drive_vif1(&transfer.data),
                dmac::GIF_CHANNEL => self.gif.submit(PathId::Path3, &transfer.data),
                _ => {}
            }
        }

        self.gif.drain(&mut GsPacketProcessor { gs: &mut self.gs });
    }

    fn drive_vif1(&mut self, data: &[u8]) {
        let mut mscal = MscalRecorder::default();
        if let Err(e) = self.vif1.process(data, &mut self.vu1, &mut self.gif, &mut mscal) {
            error::log_and_continue(&e);
        }
        if let Some((pc, itop)) = mscal.pending {
            self.vu1.execute(&mut self.gs, &mut self.gif, pc, itop, self.config.max_vu1_cycles_per_kick);
        }
    }

    /// Reads a 32-bit memory-mapped I/O register. Unmodelled offsets
    /// (unimplemented VIF0/VIF1 control registers, INTC) read back as zero,
    /// matching the GS privileged register file's own unknown-offset policy.
    pub fn read_io(&self, addr: u32) -> u32 {
        if (GS_PRIV_BASE..GS_PRIV_END).contains(&addr) {
            return self.gs.priv_regs.read32(addr - GS_PRIV_BASE);
        }
        if (dmac::CHANNEL_BASE..dmac::CHANNEL_END).contains(&addr) {
            let rel = addr - dmac::CHANNEL_BASE;
            let channel = (rel / dmac::CHANNEL_STRIDE) as u8;
            return self.dma.read_register(channel, rel % dmac::CHANNEL_STRIDE);
        }
        match addr {
            dmac::D_CTRL => self.dma.globals.d_ctrl,
            dmac::D_STAT => self.dma.globals.d_stat,
            dmac::D_PCR => self.dma.globals.d_pcr,
            dmac::D_SQWC => self.dma.globals.d_sqwc,
            dmac::D_RBSR => self.dma.globals.d_rbsr,
            dmac::D_RBOR => self.dma.globals.d_rbor,
            _ => 0,
        }
    }

    /// Writes a 32-bit memory-mapped I/O register, triggering the
    /// side-effectful ones: a DMA channel's `CHCR` (rising-edge `STR`
    /// detection), `D_STAT` (write-one-to-clear/toggle), and VIF1's
    /// `FBRST`.
    pub fn write_io(&mut self, addr: u32, value: u32) {
        if (GS_PRIV_BASE..GS_PRIV_END).contains(&addr) {
            self.gs.priv_regs.write32(addr - GS_PRIV_BASE, value);
            return;
        }
        if (dmac::CHANNEL_BASE..dmac::CHANNEL_END).contains(&addr) {
            let rel = addr - dmac::CHANNEL_BASE;
            let channel = (rel / dmac::CHANNEL_STRIDE) as u8;
            self.dma.write_register(channel, rel % dmac::CHANNEL_STRIDE, value);
            return;
        }
        match addr {
            dmac::D_CTRL => self.dma.globals.d_ctrl = value,
            dmac::D_STAT => self.dma.globals.write_d_stat(value),
            dmac::D_PCR => self.dma.globals.d_pcr = value,
            dmac::D_SQWC => self.dma.globals.d_sqwc = value,
            dmac::D_RBSR => self.dma.globals.d_rbsr = value,
            dmac::D_RBOR => self.dma.globals.d_rbor = value,
            dmac::VIF1_FBRST => self.vif1.write_fbrst(value),
            _ => {}
        }
    }

    /// Takes the rasterizer bridge's front buffer: the primitives the host
    /// renderer thread should draw this frame.
    pub fn take_frame(&mut self) -> Vec<gs::Primitive> {
        self.gs.bridge.swap_and_take_front()
    }

    /// Dumps a debugging snapshot (RDRAM, VU1 data memory and PC, GIF tag
    /// count) to `path`. Not a save state: nothing here is ever loaded back
    /// to resume emulation, it exists purely to diff two runs offline.
    pub fn dump_state(&self, path: &Path) -> Result<()> {
        let snapshot = RuntimeSnapshot {
            rdram: self.memory.rdram().to_vec(),
            vu1_data: self.vu1.data.to_vec(),
            vu1_pc: self.vu1.state.pc,
            gif_tags_processed: self.gs.gif_tags_processed,
        };
        let bytes = bincode::serialize(&snapshot)
            .map_err(|e| Ps2Error::io("dump_state", e.to_string()))?;
        std::fs::write(path, bytes).map_err(|e| Ps2Error::io("dump_state", e.to_string()))
    }
}

#[derive(Serialize, Deserialize)]
struct RuntimeSnapshot {
    rdram: Vec<u8>,
    vu1_data: Vec<u8>,
    vu1_pc: u32,
    gif_tags_processed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory::gs_priv;
    use registry::GprLaneExt;

    #[test]
    fn write_io_chcr_gates_on_dmae_through_the_runtime_facade() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let gif_chcr_addr = dmac::CHANNEL_BASE + dmac::CHANNEL_STRIDE * dmac::GIF_CHANNEL as u32 + dmac::CHCR_OFF;
        let gif_qwc_addr = dmac::CHANNEL_BASE + dmac::CHANNEL_STRIDE * dmac::GIF_CHANNEL as u32 + dmac::QWC_OFF;

        rt.write_io(gif_qwc_addr, 1);
        rt.write_io(gif_chcr_addr, 1 << 8); // STR=1, D_CTRL.DMAE still 0
        rt.pump();
        assert_eq!(rt.dma.dma_start_count, 1);
        assert!(rt.gif.is_empty());

        rt.write_io(dmac::D_CTRL, 1);
        rt.write_io(gif_qwc_addr, 1);
        rt.write_io(gif_chcr_addr, 1 << 8);
        rt.pump();
        assert_eq!(rt.dma.dma_start_count, 2);
    }

    #[test]
    fn write_io_reaches_gs_privileged_registers() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        rt.write_io(GS_PRIV_BASE + gs_priv::DISPFB1, 0xAABB_CCDD);
        assert_eq!(rt.read_io(GS_PRIV_BASE + gs_priv::DISPFB1), 0xAABB_CCDD);
    }

    #[test]
    fn fbrst_write_routes_to_vif1() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        rt.vif1.regs.cycle.wl = 3;
        rt.write_io(dmac::VIF1_FBRST, 0x1); // RST clears the cycle register
        assert_eq!(rt.vif1.regs.cycle.wl, 0);
    }

    #[test]
    fn call_reports_whether_an_address_is_registered() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        let mut ctx = R5900Context::new();
        assert!(!rt.call(&mut ctx, 0x1000));

        fn stub(_rdram: *mut u8, ctx: *mut R5900Context, _runtime: *mut Runtime) {
            unsafe { (*ctx).set_return_u32(42) };
        }
        rt.registry.register(0x1000, stub).unwrap();
        assert!(rt.call(&mut ctx, 0x1000));
        assert_eq!(ctx.r[2].as_u32(0), 42);
    }

    #[test]
    fn dump_state_round_trips_through_bincode() {
        let mut rt = Runtime::new(RuntimeConfig::default());
        rt.memory.write8(0x1000, 0x7F).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        rt.dump_state(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let snapshot: RuntimeSnapshot = bincode::deserialize(&bytes).unwrap();
        assert_eq!(snapshot.rdram[0x1000], 0x7F);
    }
}
