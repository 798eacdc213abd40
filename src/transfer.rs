//! mmap-based ring transfer (spec component C5, §4.5, §4.6).
//!
//! Kept free of timer/state-machine concerns - [`crate::scheduler::Engine`]
//! owns those - so these functions can be driven directly against
//! [`crate::device::mock::MockPcmDevice`] the way `diwic-alsa-rs`'s own
//! `direct::pcm` helpers are exercised against a raw region in its tests.

use crate::buffer::{BufferDescriptor, BufferHeader, BufferPool, Chunk, PoolEmpty};
use crate::device::{AvailOutcome, CommitOutcome, PcmDevice};
use crate::dll::Dll;
use crate::error::Result;
use crate::io::{publish, HostCallbacks, IoSlot, IoStatus};
use crate::timer::wall_clock_ns;

pub const NS_PER_SEC: f64 = 1_000_000_000.0;

/// `(tw, elapsed_s, safety_s, extra_s)` inputs to the deadline formula
/// (spec §4.5.1).
#[derive(Debug, Clone, Copy)]
pub struct DeadlineInputs {
    pub now_s: f64,
    /// Signed queue depth: `-delay` for playback, `delay - elapsed` for
    /// capture.
    pub sdelay: i64,
    pub rate: u32,
    pub elapsed_s: f64,
    pub safety_s: f64,
    /// `elapsed/rate` for capture, `0` for playback.
    pub extra_s: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct DeadlineOutcome {
    pub next_time_ns: u64,
    pub dt: f64,
    pub tw: f64,
}

/// `tw = now_s - sdelay/rate - safety`; feed `(tw, elapsed_s)` to the DLL;
/// `next_time = (tw + extra - safety) * NS` (spec §4.5.1, followed literally
/// even though `tw` reads more like an absolute phase than a small error -
/// that is what the source does and this module mirrors it rather than
/// "fixing" the formula).
pub fn compute_next_deadline(dll: &mut Dll, inputs: DeadlineInputs) -> DeadlineOutcome {
    let tw = inputs.now_s - (inputs.sdelay as f64 / inputs.rate as f64) - inputs.safety_s;
    let dt = dll.update(tw, inputs.elapsed_s);
    let next_time_s = (tw + inputs.extra_s - inputs.safety_s).max(0.0);
    DeadlineOutcome { next_time_ns: (next_time_s * NS_PER_SEC) as u64, dt, tw }
}

/// Result of one [`playback_write`] call (spec §4.5.2).
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOutcome {
    pub written: usize,
    pub started: bool,
    /// `mmap_commit` returned `PIPE`/`STRPIPE` - caller should run
    /// [`recover`] and treat this round's `written` as provisional.
    pub xrun: bool,
}

fn copy_into_ring<D: PcmDevice + ?Sized>(device: &mut D, dst_offset_frames: usize, frames: usize, frame_size: usize, src: &[u8], src_offset_bytes: usize) {
    let need = frames * frame_size;
    let dst = device.ring_bytes_mut(dst_offset_frames, frames);
    let src_len = src.len().max(1);
    let start = src_offset_bytes % src_len;
    if start + need <= src.len() {
        dst.copy_from_slice(&src[start..start + need]);
    } else {
        let first = src.len() - start;
        dst[..first].copy_from_slice(&src[start..]);
        dst[first..].copy_from_slice(&src[..need - first]);
    }
}

fn return_to_host<H: HostCallbacks>(io_slot: &IoSlot, callbacks: &mut H, d: BufferDescriptor) {
    let id = d.id;
    publish(io_slot, callbacks, IoStatus::Ok, Some(id));
    callbacks.reuse_buffer(0, id);
}

/// Playback write loop (spec §4.5.2). `silence_pad` is the number of
/// trailing frames to fill with silence if `ready` runs out inside the
/// current mmap window; `start` requests the device be started once any
/// frames have actually been written and it has not started yet.
pub fn playback_write<D: PcmDevice + ?Sized, H: HostCallbacks>(
    device: &mut D,
    pool: &mut BufferPool,
    io_slot: &IoSlot,
    callbacks: &mut H,
    frame_size: usize,
    silence_pad: usize,
    start: bool,
    already_started: bool,
) -> Result<WriteOutcome> {
    let mut total_written = 0usize;
    let mut remaining_silence = silence_pad;
    let mut started = already_started;

    loop {
        let (off, frames) = device.mmap_begin()?;
        if frames == 0 {
            break;
        }

        let mut cursor = off;
        let mut space = frames;
        let mut written_this_round = 0usize;

        while space > 0 {
            let mut head = match pool.take_ready() {
                Ok(d) => d,
                Err(PoolEmpty::NoData) => break,
            };
            let available_frames = head.chunk.size / frame_size;
            if available_frames == 0 {
                return_to_host(io_slot, callbacks, head);
                continue;
            }
            let take = available_frames.min(space);
            copy_into_ring(device, cursor, take, frame_size, &head.payload, head.chunk.offset);

            head.chunk.offset = (head.chunk.offset + take * frame_size) % head.payload.len().max(1);
            head.chunk.size -= take * frame_size;
            cursor += take;
            space -= take;
            written_this_round += take;

            if head.chunk.size == 0 {
                return_to_host(io_slot, callbacks, head);
            } else {
                pool.push_front_ready(head);
            }
        }

        if space > 0 && remaining_silence > 0 {
            let sil = remaining_silence.min(space);
            device.silence(cursor, sil)?;
            written_this_round += sil;
            remaining_silence -= sil;
        }

        match device.mmap_commit(off, written_this_round)? {
            CommitOutcome::Xrun => {
                total_written += written_this_round;
                return Ok(WriteOutcome { written: total_written, started, xrun: true });
            }
            CommitOutcome::Committed(_) => {}
        }

        total_written += written_this_round;

        if !started && start && total_written > 0 {
            device.start()?;
            started = true;
        }

        if written_this_round == 0 || (pool.ready_is_empty() && remaining_silence == 0) {
            break;
        }
    }

    Ok(WriteOutcome { written: total_written, started, xrun: false })
}

/// Capture push loop (spec §4.5.3). Transfers at most `max_frames` frames,
/// returning the number actually transferred (may be less if the device
/// ring ran dry).
pub fn capture_push<D: PcmDevice + ?Sized, H: HostCallbacks>(
    device: &mut D,
    pool: &mut BufferPool,
    io_slot: &IoSlot,
    callbacks: &mut H,
    max_frames: usize,
    frame_size: usize,
    samples_produced: u64,
) -> Result<usize> {
    let mut remaining = max_frames;
    let mut total = 0usize;

    while remaining > 0 {
        let (off, frames) = device.mmap_begin()?;
        if frames == 0 {
            break;
        }
        let take = frames.min(remaining);

        let mut d = match pool.take_free() {
            Ok(d) => d,
            Err(PoolEmpty::NoSpace) => {
                log::warn!("capture: no free descriptor, dropping {} frames", take);
                device.mmap_commit(off, take)?;
                remaining -= take;
                total += take;
                continue;
            }
        };

        let cap_frames = (d.capacity() / frame_size).max(1);
        let copy_frames = cap_frames.min(take);
        {
            let src = device.ring_bytes(off, copy_frames);
            d.payload[..copy_frames * frame_size].copy_from_slice(src);
        }
        d.chunk = Chunk { offset: 0, size: copy_frames * frame_size };
        d.header = BufferHeader { sequence: samples_produced + total as u64, pts: wall_clock_ns(), dts_offset: 0 };

        let id = d.id;
        if matches!(io_slot.get().0, IoStatus::HaveBuffer) {
            pool.push_ready(d);
        } else {
            publish(io_slot, callbacks, IoStatus::HaveBuffer, Some(id));
        }

        device.mmap_commit(off, copy_frames)?;
        remaining -= copy_frames;
        total += copy_frames;

        if copy_frames < take {
            // Descriptor capacity was the limiting factor, not the device
            // ring; the remainder becomes the next begin/commit round.
            continue;
        }
    }

    Ok(total)
}

/// Xrun recovery (spec §4.6): query status for telemetry, ask the device to
/// recover, re-seed the DLL, then re-prime (playback) or re-start
/// (capture).
pub fn recover<D: PcmDevice + ?Sized>(device: &mut D, dll: &mut Dll, threshold: usize, direction: crate::Direction) -> Result<()> {
    let status = device.status()?;
    log::warn!("xrun recovered, trigger_delta_frames={}", status.trigger_delta_frames);
    device.recover()?;
    dll.reseed();

    match direction {
        crate::Direction::Playback => {
            let (off, frames) = device.mmap_begin()?;
            let pad = frames.min(2 * threshold);
            if pad > 0 {
                device.silence(off, pad)?;
                device.mmap_commit(off, pad)?;
            }
            device.start()?;
        }
        crate::Direction::Capture => {
            device.start()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferDescriptor;
    use crate::device::mock::MockPcmDevice;
    use crate::device::{FormatRequest, SetFormatFlags};
    use crate::format::SampleFormat;
    use crate::Direction;

    struct Recorder {
        ready_calls: Vec<IoStatus>,
        reuse_calls: Vec<u64>,
    }

    impl HostCallbacks for Recorder {
        fn ready(&mut self, status: IoStatus) {
            self.ready_calls.push(status);
        }
        fn reuse_buffer(&mut self, _port: u32, id: u64) {
            self.reuse_calls.push(id);
        }
    }

    fn configured_mock(buffer: usize, period: usize) -> MockPcmDevice {
        let mut dev = MockPcmDevice::new(Direction::Playback).with_buffer_period(buffer, period);
        let req = FormatRequest { format: SampleFormat::S16LE, rate: 48_000, channels: 2 };
        dev.set_format(&req, SetFormatFlags::Nearest).unwrap();
        dev
    }

    #[test]
    fn playback_write_drains_one_descriptor_per_window_and_starts_device() {
        let mut dev = configured_mock(8192, 1024);
        let mut pool = BufferPool::new();
        let io_slot = IoSlot::new();
        let mut rec = Recorder { ready_calls: vec![], reuse_calls: vec![] };

        let frame_size = 4;
        let mut d = BufferDescriptor::new(1, 1024 * frame_size, frame_size);
        for (i, b) in d.payload.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        d.chunk = Chunk { offset: 0, size: 1024 * frame_size };
        pool.push_ready(d);

        let outcome = playback_write(&mut dev, &mut pool, &io_slot, &mut rec, frame_size, 0, true, false).unwrap();
        assert_eq!(outcome.written, 1024);
        assert!(outcome.started);
        assert!(dev.is_started());
        assert_eq!(dev.writes[0].offset_frames, 0);
        assert_eq!(rec.reuse_calls, vec![1]);
    }

    #[test]
    fn playback_write_pads_with_silence_when_ready_is_empty() {
        let mut dev = configured_mock(8192, 1024);
        let mut pool = BufferPool::new();
        let io_slot = IoSlot::new();
        let mut rec = Recorder { ready_calls: vec![], reuse_calls: vec![] };

        let outcome = playback_write(&mut dev, &mut pool, &io_slot, &mut rec, 4, 2048, true, false).unwrap();
        assert_eq!(outcome.written, 2048);
        assert!(dev.is_started());
        assert_eq!(dev.silences.iter().map(|(_, n)| n).sum::<usize>(), 2048);
    }

    #[test]
    fn capture_push_stamps_header_and_publishes_have_buffer() {
        let mut dev = MockPcmDevice::new(Direction::Capture).with_buffer_period(8192, 1024);
        let req = FormatRequest { format: SampleFormat::S16LE, rate: 48_000, channels: 2 };
        dev.set_format(&req, SetFormatFlags::Nearest).unwrap();

        let mut pool = BufferPool::new();
        pool.submit_free(BufferDescriptor::new(7, 4096 * 4, 4));
        let io_slot = IoSlot::new();
        let mut rec = Recorder { ready_calls: vec![], reuse_calls: vec![] };

        let n = capture_push(&mut dev, &mut pool, &io_slot, &mut rec, 1024, 4, 500).unwrap();
        assert_eq!(n, 1024);
        assert_eq!(io_slot.get().0, IoStatus::HaveBuffer);
        assert_eq!(io_slot.get().1, Some(7));
        assert_eq!(rec.ready_calls, vec![IoStatus::HaveBuffer]);
    }

    #[test]
    fn capture_push_drops_frames_when_no_free_descriptor() {
        let mut dev = MockPcmDevice::new(Direction::Capture).with_buffer_period(8192, 1024);
        let req = FormatRequest { format: SampleFormat::S16LE, rate: 48_000, channels: 2 };
        dev.set_format(&req, SetFormatFlags::Nearest).unwrap();
        let mut pool = BufferPool::new();
        let io_slot = IoSlot::new();
        let mut rec = Recorder { ready_calls: vec![], reuse_calls: vec![] };

        let n = capture_push(&mut dev, &mut pool, &io_slot, &mut rec, 1024, 4, 0).unwrap();
        assert_eq!(n, 1024);
        assert_eq!(io_slot.get().0, IoStatus::Ok);
    }

    #[test]
    fn recover_reseeds_dll_and_restarts_playback_with_silence() {
        let mut dev = configured_mock(8192, 1024);
        let mut dll = Dll::new(1024.0 / 48_000.0);
        dll.update(0.0, 1024.0 / 48_000.0);
        recover(&mut dev, &mut dll, 1024, Direction::Playback).unwrap();
        assert_eq!(dll.bandwidth(), crate::dll::BW_MAX);
        assert!(dev.is_started());
        assert_eq!(dev.recover_calls, 1);
    }
}
