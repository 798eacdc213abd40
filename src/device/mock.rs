//! A `PcmDevice` that needs no hardware (spec §9: "a mock implementation
//! satisfies the tests in §8 without a real sound card").
//!
//! Unlike the real backend, timing is not simulated - tests drive `avail`/
//! `delay` directly with [`MockPcmDevice::set_avail_delay`] and trigger
//! xruns with [`MockPcmDevice::fail_next_commit`], so §8's scenarios can
//! assert exact tick-by-tick behaviour without sleeping.

use super::{
    AvailOutcome, CommitOutcome, DeviceState, DeviceStatus, EnumCursor, FormatFilter, FormatRequest, NegotiatedFormat, ParamObject,
    PcmDevice, SetFormatFlags,
};
use crate::error::{EngineError, Result};
use crate::format::{self, SampleFormat};
use crate::Direction;

/// One ring write the mock recorded, for scenario assertions (spec §8
/// scenario 1: "first two ticks copy the exact bytes at ring offsets 0 and
/// 1024").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingWrite {
    pub offset_frames: usize,
    pub bytes: Vec<u8>,
}

pub struct MockPcmDevice {
    direction: Direction,
    supported_formats: Vec<SampleFormat>,
    rate_range: (u32, u32),
    channel_range: (u32, u32),
    forced_buffer_period: Option<(usize, usize)>,
    negotiated: Option<NegotiatedFormat>,

    ring: Vec<u8>,
    appl_ptr: usize,
    last_begin: Option<(usize, usize)>,

    state: DeviceState,
    started: bool,

    avail_delay_override: Option<(i64, i64)>,
    fail_next_avail_delay: bool,
    fail_next_commit: bool,

    pub writes: Vec<RingWrite>,
    pub silences: Vec<(usize, usize)>,
    pub recover_calls: usize,
    pub start_calls: usize,
    pub rewinds: Vec<usize>,
}

impl MockPcmDevice {
    pub fn new(direction: Direction) -> Self {
        MockPcmDevice {
            direction,
            supported_formats: vec![SampleFormat::S16LE],
            rate_range: (8_000, 192_000),
            channel_range: (1, 8),
            forced_buffer_period: None,
            negotiated: None,
            ring: Vec::new(),
            appl_ptr: 0,
            last_begin: None,
            state: DeviceState::Open,
            started: false,
            avail_delay_override: None,
            fail_next_avail_delay: false,
            fail_next_commit: false,
            writes: Vec::new(),
            silences: Vec::new(),
            recover_calls: 0,
            start_calls: 0,
            rewinds: Vec::new(),
        }
    }

    /// Pretend the hardware reports buffer size `buffer_frames` and period
    /// `period_frames` regardless of what was requested, the way a real
    /// device would clamp to its own capabilities.
    pub fn with_buffer_period(mut self, buffer_frames: usize, period_frames: usize) -> Self {
        self.forced_buffer_period = Some((buffer_frames, period_frames));
        self
    }

    pub fn set_avail_delay(&mut self, avail: i64, delay: i64) {
        self.avail_delay_override = Some((avail, delay));
    }

    pub fn fail_next_avail_delay(&mut self) {
        self.fail_next_avail_delay = true;
    }

    pub fn fail_next_commit(&mut self) {
        self.fail_next_commit = true;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn appl_ptr(&self) -> usize {
        self.appl_ptr
    }

    fn frame_size(&self) -> usize {
        self.negotiated.as_ref().map(|n| n.frame_size).unwrap_or(1)
    }

    fn buffer_frames(&self) -> usize {
        self.negotiated.as_ref().map(|n| n.buffer_frames).unwrap_or(0)
    }
}

impl PcmDevice for MockPcmDevice {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn enumerate_formats(&self, filter: Option<&FormatFilter>, cursor: EnumCursor, enumerate_channel_maps: bool) -> Vec<ParamObject> {
        let params: Vec<ParamObject> = self
            .supported_formats
            .iter()
            .map(|&sample_format| ParamObject {
                format: sample_format,
                rate_min: self.rate_range.0,
                rate_max: self.rate_range.1,
                rate_pref: 48_000,
                channels_min: self.channel_range.0,
                channels_max: self.channel_range.1,
                channels_pref: 2,
                positions: enumerate_channel_maps.then(|| format::sanitize_channel_map(&format::default_layout(2))),
            })
            .collect();
        super::filter_params(params, filter, cursor)
    }

    fn set_format(&mut self, request: &FormatRequest, flags: SetFormatFlags) -> Result<NegotiatedFormat> {
        let format_ok = self.supported_formats.contains(&request.format);
        let rate_ok = request.rate >= self.rate_range.0 && request.rate <= self.rate_range.1;
        let channels_ok = request.channels >= self.channel_range.0 && request.channels <= self.channel_range.1;

        if !format_ok {
            return Err(EngineError::invalid_argument("set_format", "unsupported sample format"));
        }

        let exact = rate_ok && channels_ok;
        if !exact && flags == SetFormatFlags::Exact {
            log::warn!(
                "set_format: requested rate={} channels={} not available and NEAREST not requested",
                request.rate,
                request.channels
            );
            return Err(EngineError::invalid_argument("set_format", "requested rate/channels unavailable, NEAREST not set"));
        }

        let rate = request.rate.clamp(self.rate_range.0, self.rate_range.1);
        let channels = request.channels.clamp(self.channel_range.0, self.channel_range.1);
        let frame_size = channels as usize * request.format.bytes().unwrap_or(2) as usize;

        let (buffer_frames, period_frames) = self.forced_buffer_period.unwrap_or((8192, 1024));

        let negotiated = NegotiatedFormat { format: request.format, rate, channels, frame_size, buffer_frames, period_frames };

        self.ring = vec![0u8; buffer_frames * frame_size];
        self.appl_ptr = 0;
        self.negotiated = Some(negotiated.clone());
        self.state = DeviceState::Prepared;
        Ok(negotiated)
    }

    fn negotiated(&self) -> Option<&NegotiatedFormat> {
        self.negotiated.as_ref()
    }

    fn avail_delay(&mut self) -> Result<AvailOutcome> {
        if self.fail_next_avail_delay {
            self.fail_next_avail_delay = false;
            self.state = DeviceState::XRun;
            return Ok(AvailOutcome::Xrun);
        }
        let (avail, delay) = self.avail_delay_override.unwrap_or((0, 0));
        Ok(AvailOutcome::Ready { avail, delay })
    }

    fn status(&mut self) -> Result<DeviceStatus> {
        Ok(DeviceStatus { state: self.state, hw_ptr: self.appl_ptr as i64, trigger_delta_frames: 0 })
    }

    fn mmap_begin(&mut self) -> Result<(usize, usize)> {
        let buffer_frames = self.buffer_frames();
        if buffer_frames == 0 {
            return Err(EngineError::device("mmap_begin", -1, "device not configured"));
        }
        let offset = self.appl_ptr % buffer_frames;
        let frames = buffer_frames - offset;
        self.last_begin = Some((offset, frames));
        Ok((offset, frames))
    }

    fn ring_bytes_mut(&mut self, offset: usize, frames: usize) -> &mut [u8] {
        let fs = self.frame_size();
        &mut self.ring[offset * fs..(offset + frames) * fs]
    }

    fn ring_bytes(&self, offset: usize, frames: usize) -> &[u8] {
        let fs = self.frame_size();
        &self.ring[offset * fs..(offset + frames) * fs]
    }

    fn mmap_commit(&mut self, offset: usize, frames: usize) -> Result<CommitOutcome> {
        if self.fail_next_commit {
            self.fail_next_commit = false;
            self.state = DeviceState::XRun;
            return Ok(CommitOutcome::Xrun);
        }
        let fs = self.frame_size();
        let bytes = self.ring[offset * fs..(offset + frames) * fs].to_vec();
        self.writes.push(RingWrite { offset_frames: offset, bytes });
        self.appl_ptr += frames;
        if self.state == DeviceState::Prepared && self.started {
            self.state = DeviceState::Running;
        }
        Ok(CommitOutcome::Committed(frames))
    }

    fn silence(&mut self, offset: usize, frames: usize) -> Result<()> {
        let fs = self.frame_size();
        for b in &mut self.ring[offset * fs..(offset + frames) * fs] {
            *b = 0;
        }
        self.silences.push((offset, frames));
        Ok(())
    }

    fn recover(&mut self) -> Result<()> {
        self.recover_calls += 1;
        self.state = DeviceState::Prepared;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.start_calls += 1;
        self.started = true;
        self.state = DeviceState::Running;
        Ok(())
    }

    fn rewind(&mut self, frames: usize) -> Result<()> {
        self.rewinds.push(frames);
        self.appl_ptr = self.appl_ptr.saturating_sub(frames);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        self.state = DeviceState::Setup;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ChannelPosition, SampleFormat};

    #[test]
    fn enumerate_formats_reports_sanitized_positions_when_gated_on() {
        let m = MockPcmDevice::new(Direction::Playback);
        let params = m.enumerate_formats(None, EnumCursor::default(), true);
        let positions = params[0].positions.as_ref().expect("positions populated");
        assert_eq!(positions, &vec![ChannelPosition::FL, ChannelPosition::FR]);
    }

    #[test]
    fn enumerate_formats_omits_positions_when_gated_off() {
        let m = MockPcmDevice::new(Direction::Playback);
        let params = m.enumerate_formats(None, EnumCursor::default(), false);
        assert!(params[0].positions.is_none());
    }

    #[test]
    fn fresh_device_starts_open_and_not_started() {
        let m = MockPcmDevice::new(Direction::Playback);
        assert_eq!(m.state(), DeviceState::Open);
        assert!(!m.is_started());
    }

    #[test]
    fn set_format_exact_match_round_trips_requested_values() {
        let mut m = MockPcmDevice::new(Direction::Playback).with_buffer_period(8192, 1024);
        let req = FormatRequest { format: SampleFormat::S16LE, rate: 48_000, channels: 2 };
        let neg = m.set_format(&req, SetFormatFlags::Nearest).unwrap();
        assert_eq!(neg.rate, 48_000);
        assert_eq!(neg.channels, 2);
        assert_eq!(neg.frame_size, 4);
    }

    #[test]
    fn set_format_rejects_out_of_range_without_nearest() {
        let mut m = MockPcmDevice::new(Direction::Playback);
        let req = FormatRequest { format: SampleFormat::S16LE, rate: 1_000_000, channels: 2 };
        assert!(m.set_format(&req, SetFormatFlags::Exact).is_err());
    }

    #[test]
    fn mmap_begin_wraps_at_buffer_end() {
        let mut m = MockPcmDevice::new(Direction::Playback).with_buffer_period(2048, 1024);
        let req = FormatRequest { format: SampleFormat::S16LE, rate: 48_000, channels: 2 };
        m.set_format(&req, SetFormatFlags::Nearest).unwrap();
        let (off1, _) = m.mmap_begin().unwrap();
        assert_eq!(off1, 0);
        m.mmap_commit(0, 1024).unwrap();
        let (off2, frames2) = m.mmap_begin().unwrap();
        assert_eq!(off2, 1024);
        assert_eq!(frames2, 1024);
        m.mmap_commit(1024, 1024).unwrap();
        let (off3, _) = m.mmap_begin().unwrap();
        assert_eq!(off3, 0); // wrapped
    }
}
