//! VU1 micro-coprocessor interpreter: dual-issue upper/lower 64-bit bundles
//! out of a 16 KiB code bank, addressing a 16 KiB data bank, sufficient to
//! run the lower-pipeline and float-arithmetic instructions a static
//! recompilation needs to drive XGKICK and basic microprogram flow control.
//!
//! Bit-exact VU opcode encoding is not reverse-engineered from PS2 hardware
//! here (the donor's original source declares `execUpper`/`execLower` but
//! ships no opcode table); the encoding below is this crate's own, chosen to
//! keep the §4.5 instruction list's semantics and the `VF[0]`/`VI[0]`/`PC`
//! invariants exact. See DESIGN.md for the encoding layout.

use crate::gs::GsContext;
use crate::traits::{PacketSink, PathId};

pub const VU1_CODE_SIZE: usize = 16 * 1024;
pub const VU1_DATA_SIZE: usize = 16 * 1024;
const BUNDLE_SIZE: u32 = 8;

/// Live VU1 register file.
#[derive(Debug, Clone)]
pub struct Vu1State {
    pub vf: [[f32; 4]; 32],
    pub vi: [u16; 16],
    pub acc: [f32; 4],
    pub q: f32,
    pub p: f32,
    pub i: f32,
    pub pc: u32,
    pub mac: u32,
    pub clip: u32,
    pub status: u32,
    pub ebit: bool,
    pub itop: u32,
    pub xitop: u32,
    /// VIF1's TOPS/ITOPS double-buffer pointers, latched in ahead of a
    /// microprogram run so XTOP/XITOP can read them.
    pub tops: u16,
    pub itops: u16,
}

impl Default for Vu1State {
    fn default() -> Self {
        let mut vf = [[0.0f32; 4]; 32];
        vf[0] = [0.0, 0.0, 0.0, 1.0];
        Vu1State {
            vf,
            vi: [0; 16],
            acc: [0.0; 4],
            q: 0.0,
            p: 0.0,
            i: 0.0,
            pc: 0,
            mac: 0,
            clip: 0,
            status: 0,
            ebit: false,
            itop: 0,
            xitop: 0,
            tops: 0,
            itops: 0,
        }
    }
}

impl Vu1State {
    fn enforce_constants(&mut self) {
        self.vf[0] = [0.0, 0.0, 0.0, 1.0];
        self.vi[0] = 0;
    }
}

fn apply_dest_mask(dst: &mut [f32; 4], result: [f32; 4], mask: u8) {
    if mask & 0x8 != 0 {
        dst[0] = result[0];
    }
    if mask & 0x4 != 0 {
        dst[1] = result[1];
    }
    if mask & 0x2 != 0 {
        dst[2] = result[2];
    }
    if mask & 0x1 != 0 {
        dst[3] = result[3];
    }
}

fn sign_extend_11(bits: u32) -> i32 {
    ((bits << 21) as i32) >> 21
}

/// The VU1 interpreter: register file plus its private 16 KiB code and data
/// banks. GS VRAM and the arbiter are reached only through the injected
/// [`PacketSink`], matching the capability-injection pattern the VIF1 parser
/// and DMA engine already use.
pub struct Vu1Interpreter {
    pub state: Vu1State,
    pub code: Box<[u8]>,
    pub data: Box<[u8]>,
}

impl Default for Vu1Interpreter {
    fn default() -> Self {
        Vu1Interpreter {
            state: Vu1State::default(),
            code: vec![0u8; VU1_CODE_SIZE].into_boxed_slice(),
            data: vec![0u8; VU1_DATA_SIZE].into_boxed_slice(),
        }
    }
}

impl crate::vif1::Vu1Memory for Vu1Interpreter {
    fn code_mut(&mut self) -> &mut [u8] {
        &mut self.code
    }
    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Vu1Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a microprogram at `start_pc`, resetting `EBIT` and clearing
    /// `VF[0]` per §4.5.
    pub fn execute(
        &mut self,
        gs: &mut GsContext,
        gif: &mut impl PacketSink,
        start_pc: u32,
        itop: u32,
        max_cycles: u32,
    ) {
        self.state.pc = start_pc % self.code.len().max(1) as u32;
        self.state.ebit = false;
        self.state.itop = itop;
        self.state.vf[0] = [0.0, 0.0, 0.0, 1.0];
        self.run(gs, gif, max_cycles);
    }

    /// Continues a microprogram from the current `PC`, preserving it.
    pub fn resume(&mut self, gs: &mut GsContext, gif: &mut impl PacketSink, itop: u32, max_cycles: u32) {
        self.state.ebit = false;
        self.state.itop = itop;
        self.run(gs, gif, max_cycles);
    }

    fn run(&mut self, gs: &mut GsContext, gif: &mut impl PacketSink, max_cycles: u32) {
        for _ in 0..max_cycles {
            if self.state.pc as usize + 8 > self.code.len() {
                break;
            }
            let pc = self.state.pc as usize;
            let lower = u32::from_le_bytes(self.code[pc..pc + 4].try_into().unwrap());
            let upper = u32::from_le_bytes(self.code[pc + 4..pc + 8].try_into().unwrap());

            let e_bit = (upper >> 30) & 1 != 0;
            let loi = (lower >> 31) & 1 != 0;

            if loi {
                self.state.i = f32::from_bits(upper);
            } else {
                self.exec_upper(upper);
            }
            self.exec_lower(lower & 0x7FFF_FFFF, gs, gif);

            self.state.enforce_constants();

            let next = self.state.pc + BUNDLE_SIZE;
            self.state.pc = if next as usize >= self.code.len() { 0 } else { next };

            if self.state.ebit {
                break;
            }
            if e_bit {
                self.state.ebit = true;
            }
        }
    }

    fn exec_upper(&mut self, instr: u32) {
        let op = (instr >> 25) & 0x1F;
        let mask = ((instr >> 21) & 0xF) as u8;
        let ft = ((instr >> 16) & 0x1F) as usize;
        let fs = ((instr >> 11) & 0x1F) as usize;
        let fd = ((instr >> 6) & 0x1F) as usize;
        let bc = ((instr >> 4) & 0x3) as usize;

        let s = self.state.vf[fs];
        let t = self.state.vf[ft];
        let tb = [t[bc]; 4];

        let lanewise = |a: [f32; 4], b: [f32; 4], f: fn(f32, f32) -> f32| {
            [f(a[0], b[0]), f(a[1], b[1]), f(a[2], b[2]), f(a[3], b[3])]
        };

        match op {
            0 => {} // NOP
            1 => self.write_fd(fd, mask, lanewise(s, t, |a, b| a + b)),
            2 => self.write_fd(fd, mask, lanewise(s, tb, |a, b| a + b)),
            3 => self.write_fd(fd, mask, lanewise(s, t, |a, b| a - b)),
            4 => self.write_fd(fd, mask, lanewise(s, tb, |a, b| a - b)),
            5 => self.write_fd(fd, mask, lanewise(s, t, |a, b| a * b)),
            6 => self.write_fd(fd, mask, lanewise(s, tb, |a, b| a * b)),
            7 => {
                let r = lanewise(s, t, |a, b| a * b);
                let r = lanewise(self.state.acc, r, |a, b| a + b);
                self.write_fd(fd, mask, r);
            }
            8 => {
                let r = lanewise(s, tb, |a, b| a * b);
                let r = lanewise(self.state.acc, r, |a, b| a + b);
                self.write_fd(fd, mask, r);
            }
            9 => {
                let r = lanewise(s, t, |a, b| a * b);
                let r = lanewise(self.state.acc, r, |a, b| a - b);
                self.write_fd(fd, mask, r);
            }
            10 => {
                let r = lanewise(s, tb, |a, b| a * b);
                let r = lanewise(self.state.acc, r, |a, b| a - b);
                self.write_fd(fd, mask, r);
            }
            11 => self.write_fd(fd, mask, lanewise(s, t, f32::max)),
            12 => self.write_fd(fd, mask, lanewise(s, tb, f32::max)),
            13 => self.write_fd(fd, mask, lanewise(s, t, f32::min)),
            14 => self.write_fd(fd, mask, lanewise(s, tb, f32::min)),
            15 => self.write_fd(fd, mask, [s[0].abs(), s[1].abs(), s[2].abs(), s[3].abs()]),
            16 => self.write_fd(fd, mask, s.map(|v| f32::from_bits(v.trunc() as i32 as u32))),
            17 => self.write_fd(fd, mask, s.map(|v| f32::from_bits((v * 16.0).trunc() as i32 as u32))),
            18 => self.write_fd(fd, mask, s.map(|v| f32::from_bits((v * 4096.0).trunc() as i32 as u32))),
            19 => self.write_fd(fd, mask, s.map(|v| f32::from_bits((v * 32768.0).trunc() as i32 as u32))),
            20 => self.write_fd(fd, mask, s.map(|v| v.to_bits() as i32 as f32)),
            21 => self.write_fd(fd, mask, s.map(|v| v.to_bits() as i32 as f32 / 16.0)),
            22 => self.write_fd(fd, mask, s.map(|v| v.to_bits() as i32 as f32 / 4096.0)),
            23 => self.write_fd(fd, mask, s.map(|v| v.to_bits() as i32 as f32 / 32768.0)),
            24 => {
                // OPMULA: ACC (xyz) = cross(fs, ft); the classic VU helper
                // for computing normals/cross products ahead of a dot.
                self.state.acc[0] = s[1] * t[2];
                self.state.acc[1] = s[2] * t[0];
                self.state.acc[2] = s[0] * t[1];
            }
            25 => {
                let cross =
                    [s[1] * t[2], s[2] * t[0], s[0] * t[1], self.state.acc[3]];
                let r = lanewise(self.state.acc, cross, |a, b| a - b);
                self.write_fd(fd, mask, r);
            }
            26 => self.exec_clip(s, t[3]),
            _ => {}
        }
    }

    fn write_fd(&mut self, fd: usize, mask: u8, result: [f32; 4]) {
        if fd == 0 {
            return;
        }
        apply_dest_mask(&mut self.state.vf[fd], result, mask);
    }

    /// CLIP judges `fs.{x,y,z}` against `|w|` and shifts six new judgement
    /// bits into the clip flags history, matching the real VU's rolling
    /// 24-bit (4-bundle) clip window in spirit if not in exact bit count.
    fn exec_clip(&mut self, fs: [f32; 4], w: f32) {
        let aw = w.abs();
        let mut bits = 0u32;
        bits |= (fs[0] > aw) as u32;
        bits |= ((fs[0] < -aw) as u32) << 1;
        bits |= ((fs[1] > aw) as u32) << 2;
        bits |= ((fs[1] < -aw) as u32) << 3;
        bits |= ((fs[2] > aw) as u32) << 4;
        bits |= ((fs[2] < -aw) as u32) << 5;
        self.state.clip = (self.state.clip << 6) | bits;
    }

    fn exec_lower(&mut self, instr: u32, gs: &mut GsContext, gif: &mut impl PacketSink) {
        let op = (instr >> 26) & 0x3F;
        let r1 = ((instr >> 16) & 0x1F) as usize;
        let r2 = ((instr >> 11) & 0x1F) as usize;
        let r3 = ((instr >> 6) & 0x1F) as usize;
        let imm11 = sign_extend_11(instr & 0x7FF);
        let mask = ((instr >> 21) & 0xF) as u8;

        match op {
            0 => {} // NOP
            1 => {
                // B: unconditional relative branch, offset in bundles.
                self.state.pc = self.state.pc.wrapping_add((imm11 * BUNDLE_SIZE as i32) as u32);
            }
            2 => {
                // BAL: branch and link; r1 receives the return bundle index.
                self.set_vi(r1, ((self.state.pc + BUNDLE_SIZE) / BUNDLE_SIZE) as u16);
                self.state.pc = self.state.pc.wrapping_add((imm11 * BUNDLE_SIZE as i32) as u32);
            }
            3 => {
                // JR: jump to the byte address held (as a qword index) in r1.
                self.state.pc = (self.state.vi[r1] as u32) * BUNDLE_SIZE;
            }
            4 => {
                self.set_vi(r2, ((self.state.pc + BUNDLE_SIZE) / BUNDLE_SIZE) as u16);
                self.state.pc = (self.state.vi[r1] as u32) * BUNDLE_SIZE;
            }
            5 => {
                let v = self.state.vi[r2].wrapping_add(self.state.vi[r3]);
                self.set_vi(r1, v);
            }
            6 => {
                let v = self.state.vi[r2].wrapping_sub(self.state.vi[r3]);
                self.set_vi(r1, v);
            }
            7 => {
                let v = self.state.vi[r2].wrapping_add(imm11 as u16);
                self.set_vi(r1, v);
            }
            8 => {
                let v = self.state.vi[r2].wrapping_add((instr & 0x7FF) as u16);
                self.set_vi(r1, v);
            }
            9 => self.load_quad(r1, r2, imm11, mask),
            10 => self.store_quad(r1, r2, imm11),
            11 => {
                self.load_quad(r1, r2, 0, mask);
                self.state.vi[r2] = self.state.vi[r2].wrapping_add(1);
            }
            12 => {
                self.store_quad(r1, r2, 0);
                self.state.vi[r2] = self.state.vi[r2].wrapping_add(1);
            }
            13 => self.set_vi(r1, self.state.tops),
            14 => self.set_vi(r1, self.state.itops),
            15 => {
                let lane = self.state.vf[r2][0];
                self.set_vi(r1, lane.to_bits() as u16);
            }
            16 => {
                let v = self.state.vi[r2] as i16 as f32;
                apply_dest_mask(&mut self.state.vf[r1], [v, v, v, v], mask);
            }
            17 => {} // WAITQ: Q is produced synchronously, nothing to wait on.
            18 => {
                let fs = self.state.vf[r1][0];
                let ft = self.state.vf[r2][0];
                self.state.q = fs / ft;
            }
            19 => {
                let fs = self.state.vf[r1][0];
                let ft = self.state.vf[r2][0];
                self.state.q = fs / ft.abs().sqrt();
            }
            20 => self.xgkick(r1, gs, gif),
            _ => {}
        }
    }

    fn set_vi(&mut self, reg: usize, value: u16) {
        if reg != 0 {
            self.state.vi[reg] = value;
        }
    }

    fn load_quad(&mut self, ft: usize, base: usize, offset: i32, mask: u8) {
        let addr = ((self.state.vi[base] as i32 + offset) as u32 as usize % (VU1_DATA_SIZE / 16)) * 16;
        let mut lanes = [0.0f32; 4];
        for (i, lane) in lanes.iter_mut().enumerate() {
            let off = addr + i * 4;
            *lane = f32::from_bits(u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap()));
        }
        if ft != 0 {
            apply_dest_mask(&mut self.state.vf[ft], lanes, if mask == 0 { 0xF } else { mask });
        }
    }

    fn store_quad(&mut self, fs: usize, base: usize, offset: i32) {
        let addr = ((self.state.vi[base] as i32 + offset) as u32 as usize % (VU1_DATA_SIZE / 16)) * 16;
        for (i, lane) in self.state.vf[fs].iter().enumerate() {
            let off = addr + i * 4;
            self.data[off..off + 4].copy_from_slice(&lane.to_bits().to_le_bytes());
        }
    }

    /// Streams VU1 data memory starting at `VI[is] * 16` into the GIF
    /// arbiter's PATH1 as one packet, walking GIFtags until EOP and wrapping
    /// the 16 KiB data bank as a ring per §4.5.
    fn xgkick(&mut self, is: usize, _gs: &mut GsContext, gif: &mut impl PacketSink) {
        let mem_len = self.data.len();
        let mut pos = (self.state.vi[is] as usize * 16) % mem_len;
        let mut out = Vec::new();

        const MAX_TAGS: usize = 1 << 16;
        for _ in 0..MAX_TAGS {
            let tag_bytes = read_wrapped(&self.data, pos, 16);
            out.extend_from_slice(&tag_bytes);
            pos = (pos + 16) % mem_len;

            let lo = u64::from_le_bytes(tag_bytes[0..8].try_into().unwrap());
            let nloop = (lo & 0x7FFF) as u32;
            let eop = lo & (1 << 15) != 0;
            let flg = ((lo >> 58) & 0x3) as u8;
            let nreg_raw = ((lo >> 60) & 0xF) as u8;
            let nreg = if nreg_raw == 0 { 16 } else { nreg_raw } as u32;

            let payload_len = match flg {
                0 => (nreg * nloop * 16) as usize,
                1 => {
                    let total = nreg * nloop;
                    let bytes = total as usize * 8;
                    if total % 2 == 1 {
                        bytes + 8
                    } else {
                        bytes
                    }
                }
                2 => nloop as usize * 16,
                _ => 0,
            };

            if payload_len > 0 {
                let payload = read_wrapped(&self.data, pos, payload_len);
                out.extend_from_slice(&payload);
                pos = (pos + payload_len) % mem_len;
            }

            if eop || nloop == 0 {
                break;
            }
        }

        gif.submit(PathId::Path1, &out);
    }
}

fn read_wrapped(buf: &[u8], start: usize, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let n = buf.len();
    for i in 0..len {
        out.push(buf[(start + i) % n]);
    }
    out
}
