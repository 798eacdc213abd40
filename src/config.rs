//! Configuration surface (spec §6.5).
//!
//! Loading these from a file or IPC request is the host's job (spec §1
//! Non-goals); this module only gives the options a typed home, the way
//! the ambient-stack rule requires even though the feature itself (a
//! config-file parser) is out of scope.

use crate::Direction;

/// Options the host resolves and hands to [`crate::scheduler::Engine::open`]
/// (spec §6.5).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Opaque device name (e.g. an ALSA device string like `"hw:0,0"`).
    pub device: String,
    pub direction: Direction,
    /// Fallback threshold (frames) used when no host override is present
    /// on the shared position (spec §4.4 step 1).
    pub min_latency: u32,
    pub rate: u32,
    pub channels: u32,
    pub format: crate::format::SampleFormat,
    /// Preferred target (frames); `None` lets the device layer pick.
    pub period_size: Option<u32>,
    pub buffer_size: Option<u32>,
    /// Feature gate for channel-map enumeration (spec §4.1 Open Question):
    /// the source disables it (`if (false)`) and falls back to default
    /// ranges; exposed here as a real toggle rather than hard-coded either
    /// way.
    pub enumerate_channel_maps: bool,
    /// Deadline bias (spec §4.5.1 Open Question: `safety` is initialized to
    /// `0.0` and never updated upstream, left as a knob for future callers).
    pub safety_seconds: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            device: "default".to_string(),
            direction: Direction::Playback,
            min_latency: 1024,
            rate: 48_000,
            channels: 2,
            format: crate::format::SampleFormat::S16LE,
            period_size: Some(1024),
            buffer_size: None,
            enumerate_channel_maps: true,
            safety_seconds: 0.0,
        }
    }
}
