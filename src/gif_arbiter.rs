//! PATH1/PATH2/PATH3 arbitration in front of the GS. Not concurrent by
//! design: only the guest thread ever touches a `GifArbiter`.

use std::collections::VecDeque;

use crate::traits::{GifPath2Sink, PacketSink, PathId};

/// Invoked once per queued packet on [`GifArbiter::drain`].
pub trait GifPacketProcessor {
    fn process_packet(&mut self, path: PathId, data: &[u8]);
}

struct QueuedPacket {
    path: PathId,
    data: Vec<u8>,
}

fn tag_flg(data: &[u8]) -> Option<u8> {
    if data.len() < 16 {
        return None;
    }
    let lo = u64::from_le_bytes(data[0..8].try_into().unwrap());
    Some(((lo >> 58) & 0x3) as u8)
}

fn is_image_tag(data: &[u8]) -> bool {
    tag_flg(data) == Some(2)
}

#[derive(Default)]
pub struct GifArbiter {
    queue: Vec<QueuedPacket>,
    path3_masked: bool,
    masked_queue: VecDeque<Vec<u8>>,
    stalled_direct_hl: VecDeque<Vec<u8>>,
}

impl GifArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `MSKPATH3`: while masked, PATH3 submissions are redirected to a held
    /// FIFO; clearing the mask flushes that FIFO, in order, before the next
    /// drain.
    pub fn set_path3_mask(&mut self, masked: bool) {
        self.path3_masked = masked;
        if !masked {
            while let Some(data) = self.masked_queue.pop_front() {
                self.queue.push(QueuedPacket { path: PathId::Path3, data });
            }
        }
    }

    pub fn path3_masked(&self) -> bool {
        self.path3_masked
    }

    fn has_path3_image_pending(&self) -> bool {
        self.queue.iter().any(|p| p.path == PathId::Path3 && is_image_tag(&p.data))
            || self.masked_queue.iter().any(|d| is_image_tag(d))
    }

    fn enqueue(&mut self, path: PathId, data: &[u8]) {
        if path == PathId::Path3 && self.path3_masked {
            self.masked_queue.push_back(data.to_vec());
        } else {
            self.queue.push(QueuedPacket { path, data: data.to_vec() });
        }
    }

    /// Stable-sorts queued packets by path id ascending (PATH1 < PATH2 <
    /// PATH3, FIFO within a path), then hands each to `processor`.
    pub fn drain(&mut self, processor: &mut impl GifPacketProcessor) {
        if !self.has_path3_image_pending() {
            while let Some(data) = self.stalled_direct_hl.pop_front() {
                self.queue.push(QueuedPacket { path: PathId::Path2, data });
            }
        }
        self.queue.sort_by_key(|p| p.path);
        for pkt in self.queue.drain(..) {
            processor.process_packet(pkt.path, &pkt.data);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl PacketSink for GifArbiter {
    fn submit(&mut self, path: PathId, data: &[u8]) {
        self.enqueue(path, data);
    }
}

impl GifPath2Sink for GifArbiter {
    /// A DIRECTHL packet stalls behind any pending PATH3 IMAGE packet
    /// rather than draining ahead of it.
    fn submit_direct_hl(&mut self, data: &[u8]) {
        if self.has_path3_image_pending() {
            self.stalled_direct_hl.push_back(data.to_vec());
        } else {
            self.enqueue(PathId::Path2, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Vec<(PathId, Vec<u8>)>);
    impl GifPacketProcessor for Recorder {
        fn process_packet(&mut self, path: PathId, data: &[u8]) {
            self.0.push((path, data.to_vec()));
        }
    }

    fn packed_tag(nloop: u32, nreg: u8, eop: bool) -> Vec<u8> {
        let mut lo: u64 = nloop as u64 & 0x7FFF;
        if eop {
            lo |= 1 << 15;
        }
        lo |= (nreg as u64 & 0xF) << 60;
        let mut v = lo.to_le_bytes().to_vec();
        v.extend_from_slice(&0u64.to_le_bytes());
        v
    }

    #[test]
    fn drains_by_ascending_path_priority_regardless_of_submit_order() {
        let mut arb = GifArbiter::new();
        arb.submit(PathId::Path3, &packed_tag(0, 1, true));
        arb.submit(PathId::Path1, &packed_tag(0, 1, true));
        arb.submit(PathId::Path2, &packed_tag(0, 1, true));
        let mut rec = Recorder(Vec::new());
        arb.drain(&mut rec);
        let order: Vec<PathId> = rec.0.iter().map(|(p, _)| *p).collect();
        assert_eq!(order, vec![PathId::Path1, PathId::Path2, PathId::Path3]);
    }

    #[test]
    fn path3_mask_holds_and_flushes_in_order() {
        let mut arb = GifArbiter::new();
        arb.set_path3_mask(true);
        arb.submit(PathId::Path3, &packed_tag(0, 1, true));
        arb.submit(PathId::Path3, &packed_tag(0, 2, true));
        assert!(arb.is_empty());
        arb.set_path3_mask(false);
        assert!(!arb.is_empty());
        let mut rec = Recorder(Vec::new());
        arb.drain(&mut rec);
        assert_eq!(rec.0.len(), 2);
    }

    #[test]
    fn directhl_stalls_behind_pending_path3_image() {
        let mut arb = GifArbiter::new();
        let mut image_tag_lo: u64 = 1;
        image_tag_lo |= 1 << 15; // EOP
        image_tag_lo |= 2 << 58; // FLG = IMAGE
        let mut image_tag = image_tag_lo.to_le_bytes().to_vec();
        image_tag.extend_from_slice(&0u64.to_le_bytes());
        image_tag.extend_from_slice(&[0xAAu8; 16]);

        arb.submit(PathId::Path3, &image_tag);
        arb.submit_direct_hl(&packed_tag(0, 1, true));

        let mut rec = Recorder(Vec::new());
        arb.drain(&mut rec);
        // Only the PATH3 image packet drained; DIRECTHL stayed queued.
        assert_eq!(rec.0.len(), 1);
        assert_eq!(rec.0[0].0, PathId::Path3);
    }
}
