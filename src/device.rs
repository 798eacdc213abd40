//! Device session and the device-layer contract (spec component C2, §6.4).
//!
//! `PcmDevice` is "function-pointer vtables of the device layer ... model as
//! a trait / interface with the methods in §6.4" (spec §9): [`device::alsa`]
//! is the real backend (grounded in `diwic-alsa-rs`'s `PCM`/`HwParams`/
//! `SwParams` for negotiation, and its `direct::pcm` module for the mmap
//! bypass); [`device::mock`] "satisfies the tests in §8 without a real
//! sound card".

pub mod alsa;
pub mod mock;

use crate::error::Result;
use crate::format::{ChannelPosition, SampleFormat};
use crate::Direction;

/// `NEAREST?` flag on `set_format` (spec §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetFormatFlags {
    /// Fail unless the device accepts the request exactly.
    Exact,
    /// Accept the device's nearest match and echo it back.
    Nearest,
}

/// A host's format request (spec §4.1 "Given a requested `(format, rate,
/// channels)`").
#[derive(Debug, Clone, Copy)]
pub struct FormatRequest {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u32,
}

/// What the device actually committed to (spec §3 "chosen format").
#[derive(Debug, Clone)]
pub struct NegotiatedFormat {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u32,
    pub frame_size: usize,
    /// `B`, frames.
    pub buffer_frames: usize,
    /// `P`, frames.
    pub period_frames: usize,
}

/// Optional filter applied by `enumerate_formats` (spec §4.1 "The caller
/// supplies an optional filter pod").
#[derive(Debug, Clone, Default)]
pub struct FormatFilter {
    pub format: Option<SampleFormat>,
    pub rate_range: Option<(u32, u32)>,
    pub channel_range: Option<(u32, u32)>,
}

impl FormatFilter {
    fn accepts(&self, p: &ParamObject) -> bool {
        if let Some(f) = self.format {
            if f != p.format {
                return false;
            }
        }
        if let Some((lo, hi)) = self.rate_range {
            if p.rate_max < lo || p.rate_min > hi {
                return false;
            }
        }
        if let Some((lo, hi)) = self.channel_range {
            if p.channels_max < lo || p.channels_min > hi {
                return false;
            }
        }
        true
    }
}

/// One enumerated parameter tuple (spec §4.1): `(media=audio, subtype=raw,
/// format, rate range + preferred, channel range + preferred, [positions])`.
/// `media`/`subtype` aren't modeled as fields since this crate only ever
/// enumerates raw audio formats (spec §1 scope).
#[derive(Debug, Clone)]
pub struct ParamObject {
    pub format: SampleFormat,
    pub rate_min: u32,
    pub rate_max: u32,
    pub rate_pref: u32,
    pub channels_min: u32,
    pub channels_max: u32,
    pub channels_pref: u32,
    pub positions: Option<Vec<ChannelPosition>>,
}

/// Restartable enumeration page (spec §4.1 "restartable by (seq, start,
/// num) pagination"). `seq` is not separately tracked here: the underlying
/// format table is static for a given device session, so `start`/`num`
/// alone are enough to make enumeration restartable; a `seq` field is kept
/// so callers that pass one through from a wire protocol have somewhere to
/// round-trip it.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnumCursor {
    pub seq: u32,
    pub start: usize,
    pub num: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Open,
    Setup,
    Prepared,
    Running,
    XRun,
    Paused,
    Suspended,
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceStatus {
    pub state: DeviceState,
    pub hw_ptr: i64,
    /// `trigger_tstamp` vs. now, converted to frames - the xrun magnitude
    /// (spec §4.6 step 1).
    pub trigger_delta_frames: i64,
}

/// Result of `mmap_commit` (spec §4.5.2 step 4: `PIPE`/`STRPIPE` are
/// recoverable, anything else fatal and returned as an `Err`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(usize),
    Xrun,
}

/// Result of an `avail`/`avail_delay` query (spec §4.4 step 3: "recover from
/// xrun if needed").
#[derive(Debug, Clone, Copy)]
pub enum AvailOutcome {
    Ready { avail: i64, delay: i64 },
    Xrun,
}

/// The device-layer contract the engine requires (spec §6.4).
pub trait PcmDevice {
    fn direction(&self) -> Direction;

    /// `enumerate_channel_maps` gates whether `positions` is populated via
    /// `format::sanitize_channel_map` (spec §4.1 "positions (if a channel
    /// map query is enabled)").
    fn enumerate_formats(&self, filter: Option<&FormatFilter>, cursor: EnumCursor, enumerate_channel_maps: bool) -> Vec<ParamObject>;

    /// `hw_params_any/set_access(mmap-interleaved)/set_period_wakeup(off)/
    /// set_format/set_channels_near/set_rate_near/set_period_size_near/
    /// set_buffer_size_near/commit`, followed by `sw_params` with
    /// `tstamp_mode=enable`, `start_threshold=MAX`, `period_event=off`
    /// (spec §4.1).
    fn set_format(&mut self, request: &FormatRequest, flags: SetFormatFlags) -> Result<NegotiatedFormat>;

    fn negotiated(&self) -> Option<&NegotiatedFormat>;

    fn avail_delay(&mut self) -> Result<AvailOutcome>;

    fn status(&mut self) -> Result<DeviceStatus>;

    /// Begin a transfer window; returns `(ring_offset_frames,
    /// contiguous_frames)` (spec §4 glossary "mmap begin/commit").
    fn mmap_begin(&mut self) -> Result<(usize, usize)>;

    /// Byte view into the window most recently returned by `mmap_begin`,
    /// for the caller to write into (playback).
    fn ring_bytes_mut(&mut self, offset: usize, frames: usize) -> &mut [u8];

    /// Byte view for the caller to read from (capture).
    fn ring_bytes(&self, offset: usize, frames: usize) -> &[u8];

    fn mmap_commit(&mut self, offset: usize, frames: usize) -> Result<CommitOutcome>;

    /// `areas_silence`: zero-fill `frames` frames at `offset` using the
    /// device-native silence routine (spec §4.5.2 step 3).
    fn silence(&mut self, offset: usize, frames: usize) -> Result<()>;

    /// Prepare + silent continuation (spec §4.6 step 2).
    fn recover(&mut self) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn rewind(&mut self, frames: usize) -> Result<()>;

    fn stop(&mut self) -> Result<()>;
}

pub(crate) fn filter_params(params: Vec<ParamObject>, filter: Option<&FormatFilter>, cursor: EnumCursor) -> Vec<ParamObject> {
    let filtered: Vec<ParamObject> = match filter {
        Some(f) => params.into_iter().filter(|p| f.accepts(p)).collect(),
        None => params,
    };
    filtered.into_iter().skip(cursor.start).take(if cursor.num == 0 { usize::MAX } else { cursor.num }).collect()
}
