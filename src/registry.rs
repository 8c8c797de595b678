//! The recompiled-function ABI and registry: the boundary the offline
//! MIPS→host translator hands its output across, and the calling
//! convention every CRT/POSIX/Sony stub shares with it.

use std::collections::HashMap;

use crate::error::{Ps2Error, Result};
use crate::Runtime;

/// One 128-bit R5900 GPR, stored as raw bytes with explicit lane accessors
/// rather than a SIMD intrinsic type — translated code only ever touches a
/// scalar lane of it.
pub type R5900GprLane = [u8; 16];

pub trait GprLaneExt {
    fn as_u32(&self, lane: usize) -> u32;
    fn as_u64(&self, lane: usize) -> u64;
    fn set_u32(&mut self, lane: usize, value: u32);
    fn set_u64(&mut self, lane: usize, value: u64);
}

impl GprLaneExt for R5900GprLane {
    fn as_u32(&self, lane: usize) -> u32 {
        let off = lane * 4;
        u32::from_le_bytes(self[off..off + 4].try_into().unwrap())
    }

    fn as_u64(&self, lane: usize) -> u64 {
        let off = lane * 8;
        u64::from_le_bytes(self[off..off + 8].try_into().unwrap())
    }

    fn set_u32(&mut self, lane: usize, value: u32) {
        let off = lane * 4;
        self[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn set_u64(&mut self, lane: usize, value: u64) {
        let off = lane * 8;
        self[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }
}

/// Register state a recompiled function or stub reads its arguments from and
/// writes its return value to. `r[4..=7]` are a0..a3, `r[2]` is v0, `r[31]`
/// is ra, matching the MIPS o32-derived convention the offline translator
/// emits calls with.
pub struct R5900Context {
    pub r: [R5900GprLane; 32],
    pub pc: u32,
    pub hi: u64,
    pub lo: u64,
    pub f: [f32; 32],
}

impl Default for R5900Context {
    fn default() -> Self {
        R5900Context { r: [[0u8; 16]; 32], pc: 0, hi: 0, lo: 0, f: [0.0; 32] }
    }
}

impl R5900Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg_u32(&self, index: usize) -> u32 {
        self.r[4 + index].as_u32(0)
    }

    pub fn set_return_u32(&mut self, value: u32) {
        self.r[2].set_u32(0, value);
    }

    pub fn return_address(&self) -> u32 {
        self.r[31].as_u32(0)
    }
}

/// Signature every translated function and every CRT/POSIX/Sony stub shares.
/// `runtime` gives a stub access to the rest of the guest hardware (DMA
/// kickoff, the audio scheduler, the registry itself for indirect calls).
pub type RecompiledFn = fn(rdram: *mut u8, ctx: *mut R5900Context, runtime: *mut Runtime);

/// Maps guest code addresses to host functions. Populated by the offline
/// translator's generated catalogue, by the CRT/POSIX/Sony stub table, and
/// by game-specific overrides that rebind an address after the fact.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<u32, RecompiledFn>,
    named: HashMap<String, RecompiledFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` at `addr`. Rejects a second registration at the same
    /// address so overrides must go through [`FunctionRegistry::rebind`]
    /// and accidental double registration is caught early.
    pub fn register(&mut self, addr: u32, f: RecompiledFn) -> Result<()> {
        if self.functions.contains_key(&addr) {
            return Err(Ps2Error::override_registration(format!(
                "address {addr:#010x} is already registered"
            )));
        }
        self.functions.insert(addr, f);
        Ok(())
    }

    /// Unconditionally replaces whatever is registered at `addr`. Used by
    /// `applyGameOverrides` to shadow a translated function or stub.
    pub fn rebind(&mut self, addr: u32, f: RecompiledFn) {
        self.functions.insert(addr, f);
    }

    pub fn lookup(&self, addr: u32) -> Option<RecompiledFn> {
        self.functions.get(&addr).copied()
    }

    /// Registers `f` under a string name so override manifests (config
    /// files, CLI flags) can bind a handler without a function pointer.
    pub fn register_named(&mut self, name: impl Into<String>, f: RecompiledFn) {
        self.named.insert(name.into(), f);
    }

    /// Resolves `name` and rebinds it at `addr`, failing with
    /// `OverrideRegistrationError` if the name is unknown.
    pub fn bind_address_handler(&mut self, addr: u32, name: &str) -> Result<()> {
        let f = *self
            .named
            .get(name)
            .ok_or_else(|| Ps2Error::override_registration(format!("unknown handler name \"{name}\"")))?;
        self.rebind(addr, f);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_rdram: *mut u8, _ctx: *mut R5900Context, _runtime: *mut Runtime) {}
    fn other(_rdram: *mut u8, _ctx: *mut R5900Context, _runtime: *mut Runtime) {}

    #[test]
    fn duplicate_register_is_rejected() {
        let mut reg = FunctionRegistry::new();
        reg.register(0x1000, noop).unwrap();
        let err = reg.register(0x1000, other).unwrap_err();
        assert!(matches!(err, Ps2Error::OverrideRegistrationError { .. }));
    }

    #[test]
    fn rebind_shadows_existing_entry() {
        let mut reg = FunctionRegistry::new();
        reg.register(0x2000, noop).unwrap();
        reg.rebind(0x2000, other);
        assert_eq!(reg.lookup(0x2000), Some(other as RecompiledFn));
    }

    #[test]
    fn named_handler_resolves_by_string() {
        let mut reg = FunctionRegistry::new();
        reg.register_named("sceCdSync_stub", noop);
        reg.bind_address_handler(0x3000, "sceCdSync_stub").unwrap();
        assert_eq!(reg.lookup(0x3000), Some(noop as RecompiledFn));
    }

    #[test]
    fn unresolved_handler_name_errors() {
        let mut reg = FunctionRegistry::new();
        let err = reg.bind_address_handler(0x4000, "does_not_exist").unwrap_err();
        assert!(matches!(err, Ps2Error::OverrideRegistrationError { .. }));
    }

    #[test]
    fn gpr_lane_accessors_round_trip() {
        let mut lane: R5900GprLane = [0u8; 16];
        lane.set_u32(0, 0xDEAD_BEEF);
        lane.set_u32(1, 1);
        assert_eq!(lane.as_u32(0), 0xDEAD_BEEF);
        lane.set_u64(1, 0x1122_3344_5566_7788);
        assert_eq!(lane.as_u64(1), 0x1122_3344_5566_7788);
    }
}
