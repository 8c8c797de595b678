//! Capability traits injected at construction instead of raw callback
//! function pointers, so ownership between the DMA engine, VIF1 parser, VU1
//! interpreter and GIF arbiter stays explicit.

/// GIF arbitration path. Ordering priority is the discriminant value:
/// PATH1 < PATH2 < PATH3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathId {
    Path1 = 1,
    Path2 = 2,
    Path3 = 3,
}

/// A destination for a fully-formed GIF packet (GIFtag plus payload).
/// Implemented by the GIF arbiter; consumed by the DMA engine (PATH3), the
/// VIF1 parser (PATH2 DIRECT/DIRECTHL) and the VU1 interpreter (PATH1
/// XGKICK).
pub trait PacketSink {
    fn submit(&mut self, path: PathId, data: &[u8]);
}

/// A `PacketSink` that additionally distinguishes VIF1's DIRECTHL from a
/// plain DIRECT: the spec's GIF arbiter packet carries a `path2_directhl_flag`
/// (spec.md §3) because a DIRECTHL packet must stall behind any pending
/// PATH3 IMAGE packet rather than draining ahead of it (spec.md §4.4).
/// Sinks that don't care about the distinction (test mocks, anything that
/// isn't the real arbiter) get the plain PATH2 behaviour for free.
pub trait GifPath2Sink: PacketSink {
    fn submit_direct_hl(&mut self, data: &[u8]) {
        self.submit(PathId::Path2, data);
    }
}

/// Starts a VU1 microprogram. Implemented by whatever owns the VU1
/// interpreter; invoked by the VIF1 parser on MSCAL/MSCALF.
pub trait Vu1Start {
    fn mscal(&mut self, pc: u32, itop: u32);
}
