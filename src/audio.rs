//! PS2-ADPCM (VAG) decoding and the SPU2 sound-command scheduler: sample
//! bank, four-voice cap, BGM takeover and libsdv RPC parsing.

use std::collections::HashMap;

use crate::error::{Ps2Error, Result};
use crate::memory::RDRAM_MASK;

const RAM_MASK: u32 = 0x1FFF_FFFF;
const RAM_SIZE: u32 = 32 * 1024 * 1024;
const MAX_LOAD_ORDER_SAMPLES: usize = 32;
const MAX_CONCURRENT_VOICES: usize = 4;
const LOAD_ORDER_KEY_BASE: u32 = 0x0171_9740;
const LIBSD_CMD_SET_VOICE: u32 = 0x8010;
const SOUND_SID: u32 = 0x8000_0701;

fn clamp16(v: i32) -> i16 {
    v.clamp(-32768, 32767) as i16
}

fn sign_extend_4(nibble: u8) -> i8 {
    let s = nibble & 0x0F;
    if s & 8 != 0 {
        (s | 0xF0) as i8
    } else {
        s as i8
    }
}

/// A fully decoded VAG sample: 16-bit mono PCM plus its sample rate.
#[derive(Debug, Clone)]
pub struct DecodedSample {
    pub pcm: Vec<i16>,
    pub sample_rate: u32,
}

impl DecodedSample {
    fn is_bgm(&self) -> bool {
        self.pcm.len() > self.sample_rate as usize * 5
    }
}

/// Decodes a VAG-format PS2-ADPCM stream (`"VAGp"` header, 48-byte header
/// followed by 16-byte blocks of 28 4-bit samples each, 5-tap filter table).
pub fn decode_vag(data: &[u8]) -> Result<DecodedSample> {
    if data.len() < 48 {
        return Err(Ps2Error::vag_format("stream shorter than the 48-byte VAG header"));
    }

    let magic_be = u32::from_be_bytes(data[0..4].try_into().unwrap());
    let magic_le = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if magic_be != 0x5641_4770 && magic_le != 0x5641_4770 {
        return Err(Ps2Error::vag_format("missing \"VAGp\" magic"));
    }

    let data_size = u32::from_be_bytes(data[0x0c..0x10].try_into().unwrap());
    let mut sample_rate = u32::from_be_bytes(data[0x10..0x14].try_into().unwrap());
    if sample_rate == 0 {
        sample_rate = 44100;
    }

    let num_blocks = (data_size + 15) / 16;
    let mut pcm = Vec::with_capacity(num_blocks as usize * 28);

    let mut s1: i32 = 0;
    let mut s2: i32 = 0;
    let mut block_off = 48usize;

    for _ in 0..num_blocks {
        if block_off + 16 > data.len() {
            break;
        }
        let block = &data[block_off..block_off + 16];
        block_off += 16;

        let mut shift = block[0] & 0x0F;
        if shift > 12 {
            shift = 9;
        }
        let mut filter = (block[0] >> 4) & 0x07;
        if filter > 4 {
            filter = 0;
        }

        for sample_idx in 0..28usize {
            let byte = block[2 + sample_idx / 2];
            let nibble = if sample_idx & 1 != 0 { byte >> 4 } else { byte & 0x0F };
            let raw = sign_extend_4(nibble) as i32;
            let shifted = raw << (12 - shift);

            let filtered = match filter {
                0 => shifted,
                1 => shifted + (60 * s1 + 32) / 64,
                2 => shifted + (115 * s1 - 52 * s2 + 32) / 64,
                3 => shifted + (98 * s1 - 55 * s2 + 32) / 64,
                4 => shifted + (122 * s1 - 60 * s2 + 32) / 64,
                _ => shifted,
            };

            let clamped = clamp16(filtered);
            s2 = s1;
            s1 = clamped as i32;
            pcm.push(clamped);
        }
    }

    Ok(DecodedSample { pcm, sample_rate })
}

/// Host-side audio sink. Implemented by whatever plays sound for real
/// (cpal/rodio output stream, a test recorder, …); the scheduler only
/// decides *what* to play and when.
pub trait AudioSink {
    fn play(&mut self, voice: u32, pcm: &[i16], sample_rate: u32, pitch: f32, volume: f32);
    fn stop(&mut self, voice: u32);
    fn stop_all(&mut self);
    fn is_playing(&self, voice: u32) -> bool;
}

struct ActiveVoice {
    sample_key: u32,
    voice_id: u32,
}

/// The SPU2 sound scheduler: sample bank, voice cap and RPC parsing. Decoded
/// samples key off the guest address they were transferred from; load-order
/// samples additionally key off upload order for RPCs that address a voice
/// slot instead of an address.
pub struct AudioScheduler {
    sample_bank: HashMap<u32, DecodedSample>,
    load_order_samples: Vec<DecodedSample>,
    most_recent_sample_key: u32,
    active: Vec<ActiveVoice>,
    next_voice_id: u32,
    ready: bool,
}

impl Default for AudioScheduler {
    fn default() -> Self {
        AudioScheduler {
            sample_bank: HashMap::new(),
            load_order_samples: Vec::new(),
            most_recent_sample_key: 0,
            active: Vec::new(),
            next_voice_id: 0,
            ready: false,
        }
    }
}

impl AudioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    /// Decodes a VAG stream copied out of guest RDRAM at `src_addr` and
    /// stores it keyed by its masked physical address.
    pub fn on_vag_transfer(&mut self, rdram: &[u8], src_addr: u32, size_bytes: u32) -> Result<()> {
        if size_bytes < 48 {
            return Err(Ps2Error::vag_format("VAG transfer shorter than header"));
        }
        let phys = src_addr & RAM_MASK;
        if phys.checked_add(size_bytes).map_or(true, |end| end > RAM_SIZE) {
            return Err(Ps2Error::vag_format("VAG transfer exceeds RDRAM bounds"));
        }
        let slice = &rdram[phys as usize..(phys + size_bytes) as usize];
        let sample = decode_vag(slice)?;
        self.sample_bank.insert(phys, sample);
        self.most_recent_sample_key = phys;
        Ok(())
    }

    /// Decodes a VAG stream handed over directly (not via guest RDRAM), and
    /// additionally records it in load order for voice-index lookups.
    pub fn on_vag_transfer_from_buffer(&mut self, data: &[u8], key_addr: u32) -> Result<()> {
        let sample = decode_vag(data)?;
        let phys = key_addr & RAM_MASK;
        self.sample_bank.insert(phys, sample.clone());
        self.most_recent_sample_key = phys;
        self.load_order_samples.push(sample);
        if self.load_order_samples.len() > MAX_LOAD_ORDER_SAMPLES {
            self.load_order_samples.remove(0);
        }
        Ok(())
    }

    /// Parses a libsd sound-command RPC (SID `0x8000_0701`) and dispatches
    /// to [`AudioScheduler::play`] when it carries a voice-set command.
    pub fn on_sound_command(&mut self, sink: &mut impl AudioSink, sid: u32, rpc_num: u32, send_buf: &[u8]) {
        if sid != SOUND_SID {
            return;
        }
        let is_set_voice = rpc_num == LIBSD_CMD_SET_VOICE || (rpc_num & 0xFF00) == 0x8100;
        if !is_set_voice || send_buf.len() < 20 {
            return;
        }

        let mut voice_index: Option<u32> = None;
        for off in [4usize, 0usize] {
            if off + 4 <= send_buf.len() {
                let v = u32::from_le_bytes(send_buf[off..off + 4].try_into().unwrap());
                if v < 24 {
                    voice_index = Some(v);
                    break;
                }
            }
        }

        let mut sample_addr = 0u32;
        for off in (12..=24).step_by(4) {
            if off + 4 <= send_buf.len() {
                // Clamp into the 32 MiB RDRAM window before accepting the
                // candidate: an RPC buffer is attacker/game-controlled, and
                // an unmasked value would let a malformed loop pointer index
                // past the backing store once it reaches guest memory.
                let cand = u32::from_le_bytes(send_buf[off..off + 4].try_into().unwrap()) & RDRAM_MASK;
                if cand >= 0x1000 {
                    sample_addr = cand;
                    break;
                }
            }
        }
        if sample_addr == 0 {
            sample_addr = self.most_recent_sample_key;
        }

        let mut pitch = 1.0f32;
        if send_buf.len() >= 12 {
            let pitch_half = u16::from_be_bytes(send_buf[8..10].try_into().unwrap());
            if pitch_half != 0 {
                pitch = 4096.0 / pitch_half as f32;
            }
        }

        self.play(sink, sample_addr, pitch, 1.0, voice_index);
    }

    /// Resolves a sample by address (falling back to a load-order voice
    /// index, then to the most recently transferred sample) and hands it to
    /// [`AudioScheduler::play_decoded`].
    pub fn play(&mut self, sink: &mut impl AudioSink, sample_addr: u32, pitch: f32, volume: f32, voice_index: Option<u32>) {
        let (sample, key) = if let Some(sample) = self.sample_bank.get(&(sample_addr & RAM_MASK)) {
            (sample.clone(), sample_addr & RAM_MASK)
        } else if let Some(idx) = voice_index.filter(|&i| (i as usize) < self.load_order_samples.len()) {
            (self.load_order_samples[idx as usize].clone(), LOAD_ORDER_KEY_BASE + idx)
        } else if let Some(sample) = self.sample_bank.get(&self.most_recent_sample_key) {
            (sample.clone(), self.most_recent_sample_key)
        } else {
            return;
        };

        if sample.pcm.is_empty() {
            return;
        }
        let is_bgm = sample.is_bgm();
        self.play_decoded(sink, key, &sample, pitch, volume, is_bgm);
    }

    fn play_decoded(&mut self, sink: &mut impl AudioSink, sample_key: u32, sample: &DecodedSample, pitch: f32, volume: f32, is_bgm: bool) {
        if !self.ready || sample.pcm.is_empty() {
            return;
        }

        self.active.retain(|v| sink.is_playing(v.voice_id));

        if self.active.iter().any(|v| v.sample_key == sample_key && sink.is_playing(v.voice_id)) {
            return;
        }

        if is_bgm {
            for v in self.active.drain(..) {
                sink.stop(v.voice_id);
            }
        }

        while self.active.len() >= MAX_CONCURRENT_VOICES {
            let oldest = self.active.remove(0);
            sink.stop(oldest.voice_id);
        }

        let voice_id = self.next_voice_id;
        self.next_voice_id = self.next_voice_id.wrapping_add(1);
        sink.play(voice_id, &sample.pcm, sample.sample_rate, pitch, volume);
        self.active.push(ActiveVoice { sample_key, voice_id });
    }

    pub fn stop_all(&mut self, sink: &mut impl AudioSink) {
        for v in self.active.drain(..) {
            sink.stop(v.voice_id);
        }
        sink.stop_all();
    }
}

/// One command the scheduler hands to a host audio backend running on its
/// own thread. `ChannelAudioSink` is the `AudioSink` the scheduler is driven
/// with when the backend lives across a thread boundary (cpal/rodio output
/// callbacks, typically) rather than in-process; a bounded channel is a
/// simpler handoff than the mutex-guarded double buffer GS uses, since audio
/// commands are a stream of independent events rather than a single
/// coherent snapshot two sides must agree on.
#[derive(Debug, Clone)]
pub enum AudioCommand {
    Play { voice: u32, pcm: Vec<i16>, sample_rate: u32, pitch: f32, volume: f32 },
    Stop(u32),
    StopAll,
}

/// Forwards scheduler decisions to a bounded `crossbeam_channel` rather than
/// playing audio itself. `is_playing` is tracked locally since the receiving
/// end (the real backend thread) doesn't report back.
pub struct ChannelAudioSink {
    tx: crossbeam_channel::Sender<AudioCommand>,
    playing: std::collections::HashSet<u32>,
}

impl ChannelAudioSink {
    /// Builds a sink paired with the channel's receiving half, bounded at
    /// `capacity` commands so a stalled backend applies backpressure to the
    /// scheduler rather than growing without limit.
    pub fn new(capacity: usize) -> (Self, crossbeam_channel::Receiver<AudioCommand>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (ChannelAudioSink { tx, playing: std::collections::HashSet::new() }, rx)
    }
}

impl AudioSink for ChannelAudioSink {
    fn play(&mut self, voice: u32, pcm: &[i16], sample_rate: u32, pitch: f32, volume: f32) {
        if self
            .tx
            .try_send(AudioCommand::Play { voice, pcm: pcm.to_vec(), sample_rate, pitch, volume })
            .is_ok()
        {
            self.playing.insert(voice);
        }
    }

    fn stop(&mut self, voice: u32) {
        let _ = self.tx.try_send(AudioCommand::Stop(voice));
        self.playing.remove(&voice);
    }

    fn stop_all(&mut self) {
        let _ = self.tx.try_send(AudioCommand::StopAll);
        self.playing.clear();
    }

    fn is_playing(&self, voice: u32) -> bool {
        self.playing.contains(&voice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_vag(samples: &[u8], sample_rate: u32) -> Vec<u8> {
        let mut out = vec![0u8; 48];
        out[0..4].copy_from_slice(b"VAGp");
        let data_size = (samples.len() / 16 * 16) as u32;
        out[0x0c..0x10].copy_from_slice(&data_size.to_be_bytes());
        out[0x10..0x14].copy_from_slice(&sample_rate.to_be_bytes());
        out.extend_from_slice(samples);
        out
    }

    #[test]
    fn rejects_short_or_unmagicked_streams() {
        assert!(decode_vag(&[0u8; 10]).is_err());
        let mut bad = vec![0u8; 48];
        bad[0..4].copy_from_slice(b"NOPE");
        assert!(decode_vag(&bad).is_err());
    }

    #[test]
    fn decodes_one_silent_block_to_28_zero_samples() {
        let block = vec![0u8; 16]; // shift=0, filter=0, all nibbles 0
        let vag = make_vag(&block, 22050);
        let sample = decode_vag(&vag).unwrap();
        assert_eq!(sample.sample_rate, 22050);
        assert_eq!(sample.pcm.len(), 28);
        assert!(sample.pcm.iter().all(|&s| s == 0));
    }

    #[test]
    fn zero_sample_rate_defaults_to_44100() {
        let vag = make_vag(&[0u8; 16], 0);
        let sample = decode_vag(&vag).unwrap();
        assert_eq!(sample.sample_rate, 44100);
    }

    #[test]
    fn decode_length_matches_block_count_invariant() {
        let blocks = vec![0u8; 32]; // two blocks
        let vag = make_vag(&blocks, 44100);
        let sample = decode_vag(&vag).unwrap();
        let n = (vag.len() as u32 - 48 + 15) / 16;
        assert_eq!(sample.pcm.len(), (n * 28) as usize);
    }

    struct TestSink {
        played: Vec<u32>,
        stopped: Vec<u32>,
        playing: std::collections::HashSet<u32>,
    }
    impl TestSink {
        fn new() -> Self {
            TestSink { played: Vec::new(), stopped: Vec::new(), playing: Default::default() }
        }
    }
    impl AudioSink for TestSink {
        fn play(&mut self, voice: u32, _pcm: &[i16], _sample_rate: u32, _pitch: f32, _volume: f32) {
            self.played.push(voice);
            self.playing.insert(voice);
        }
        fn stop(&mut self, voice: u32) {
            self.stopped.push(voice);
            self.playing.remove(&voice);
        }
        fn stop_all(&mut self) {
            self.playing.clear();
        }
        fn is_playing(&self, voice: u32) -> bool {
            self.playing.contains(&voice)
        }
    }

    #[test]
    fn coalesces_replay_of_same_sample_while_still_playing() {
        let mut sched = AudioScheduler::new();
        sched.set_ready(true);
        let vag = make_vag(&vec![0x11u8; 16], 44100);
        sched.on_vag_transfer_from_buffer(&vag, 0x1000).unwrap();

        let mut sink = TestSink::new();
        sched.play(&mut sink, 0x1000, 1.0, 1.0, None);
        sched.play(&mut sink, 0x1000, 1.0, 1.0, None);
        assert_eq!(sink.played.len(), 1);
    }

    #[test]
    fn caps_concurrent_voices_at_four_fifo_eviction() {
        let mut sched = AudioScheduler::new();
        sched.set_ready(true);
        let mut sink = TestSink::new();
        for i in 0..5u32 {
            let vag = make_vag(&vec![(i + 1) as u8; 16], 44100);
            sched.on_vag_transfer_from_buffer(&vag, 0x2000 + i * 0x100).unwrap();
            sched.play(&mut sink, 0x2000 + i * 0x100, 1.0, 1.0, None);
        }
        assert_eq!(sink.played.len(), 5);
        assert_eq!(sink.stopped.len(), 1);
        assert_eq!(sink.stopped[0], 0); // the first voice id evicted
    }

    #[test]
    fn bgm_detection_stops_other_voices() {
        let mut sched = AudioScheduler::new();
        sched.set_ready(true);
        let mut sink = TestSink::new();

        let sfx = make_vag(&vec![1u8; 16], 44100);
        sched.on_vag_transfer_from_buffer(&sfx, 0x3000).unwrap();
        sched.play(&mut sink, 0x3000, 1.0, 1.0, None);
        assert_eq!(sink.playing.len(), 1);

        // > 5s of samples at 44100Hz triggers BGM classification.
        let blocks_needed = (44100 * 6 / 28) + 1;
        let bgm_blocks = vec![2u8; blocks_needed as usize * 16];
        let bgm = make_vag(&bgm_blocks, 44100);
        sched.on_vag_transfer_from_buffer(&bgm, 0x4000).unwrap();
        sched.play(&mut sink, 0x4000, 1.0, 1.0, None);

        assert_eq!(sink.playing.len(), 1);
        assert!(sink.stopped.contains(&0));
    }

    #[test]
    fn sound_command_rpc_resolves_voice_and_pitch() {
        let mut sched = AudioScheduler::new();
        sched.set_ready(true);
        let vag = make_vag(&vec![3u8; 16], 44100);
        sched.on_vag_transfer(&{
            let mut rdram = vec![0u8; 0x10000];
            rdram[0x5000..0x5000 + vag.len()].copy_from_slice(&vag);
            rdram
        }, 0x5000, vag.len() as u32).unwrap();

        let mut send = vec![0u8; 24];
        send[12..16].copy_from_slice(&0x5000u32.to_le_bytes());
        send[8..10].copy_from_slice(&4096u16.to_be_bytes()); // pitch ratio 1.0

        let mut sink = TestSink::new();
        sched.on_sound_command(&mut sink, 0x8000_0701, 0x8010, &send);
        assert_eq!(sink.played.len(), 1);
    }

    #[test]
    fn sound_command_masks_out_of_range_sample_address_candidates() {
        let mut sched = AudioScheduler::new();
        sched.set_ready(true);
        let vag = make_vag(&vec![3u8; 16], 44100);
        sched.on_vag_transfer_from_buffer(&vag, 0x5000).unwrap();

        // A garbage candidate far beyond the 32 MiB RDRAM window: masking
        // with RDRAM_MASK must bring it back to 0x5000 rather than being
        // used raw (which would index past the backing store once this
        // address reaches guest memory).
        let mut send = vec![0u8; 24];
        let garbage = 0x0200_5000u32;
        assert_eq!(garbage & RDRAM_MASK, 0x5000);
        send[12..16].copy_from_slice(&garbage.to_le_bytes());
        send[8..10].copy_from_slice(&4096u16.to_be_bytes());

        let mut sink = TestSink::new();
        sched.on_sound_command(&mut sink, 0x8000_0701, 0x8010, &send);
        assert_eq!(sink.played.len(), 1);
    }

    #[test]
    fn channel_sink_forwards_play_and_stop_commands() {
        let (mut sink, rx) = ChannelAudioSink::new(8);
        sink.play(3, &[1, 2, 3], 44100, 1.0, 1.0);
        assert!(sink.is_playing(3));
        sink.stop(3);
        assert!(!sink.is_playing(3));

        match rx.try_recv().unwrap() {
            AudioCommand::Play { voice, sample_rate, .. } => {
                assert_eq!(voice, 3);
                assert_eq!(sample_rate, 44100);
            }
            other => panic!("expected Play, got {other:?}"),
        }
        assert!(matches!(rx.try_recv().unwrap(), AudioCommand::Stop(3)));
    }

    #[test]
    fn channel_sink_drives_the_scheduler_like_any_other_sink() {
        let mut sched = AudioScheduler::new();
        sched.set_ready(true);
        let vag = make_vag(&vec![9u8; 16], 44100);
        sched.on_vag_transfer_from_buffer(&vag, 0x6000).unwrap();

        let (mut sink, rx) = ChannelAudioSink::new(8);
        sched.play(&mut sink, 0x6000, 1.0, 1.0, None);
        assert!(rx.try_recv().is_ok());
    }
}
