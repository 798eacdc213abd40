//! Format tables (spec component C1).
//!
//! Bidirectional maps between the host's abstract sample format / channel
//! position IDs and the device's native codes, plus default channel-layout
//! inference and the channel-map sanitizer required by §4.1.
//!
//! Grounded in `diwic-alsa-rs`'s `pcm::Format` (native format constants) and
//! `chmap::ChmapPosition` (native channel position constants); this module
//! is the abstract, device-independent counterpart the engine reasons about
//! before a `device::PcmDevice` translates it to whatever the backend wants.

use std::fmt;

/// Abstract sample encodings the engine knows about (spec C1, "F" in the
/// `enum_format` tuple). `Unknown` is the sentinel returned for anything a
/// `device::PcmDevice` reports that this table has no entry for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    Unknown,
    U8,
    S16LE,
    S24LE,
    S32LE,
    FloatLE,
}

impl SampleFormat {
    /// All encodings this table knows, in ascending preference order for
    /// format negotiation (`Unknown` excluded).
    pub const ALL: &'static [SampleFormat] = &[
        SampleFormat::U8,
        SampleFormat::S16LE,
        SampleFormat::S24LE,
        SampleFormat::S32LE,
        SampleFormat::FloatLE,
    ];

    /// Bytes per sample, per channel. `Unknown` has no defined size.
    pub fn bytes(self) -> Option<u32> {
        match self {
            SampleFormat::Unknown => None,
            SampleFormat::U8 => Some(1),
            SampleFormat::S16LE => Some(2),
            SampleFormat::S24LE => Some(4), // ALSA's S24_LE is 4-byte-aligned
            SampleFormat::S32LE => Some(4),
            SampleFormat::FloatLE => Some(4),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            SampleFormat::Unknown => "unknown",
            SampleFormat::U8 => "u8",
            SampleFormat::S16LE => "s16le",
            SampleFormat::S24LE => "s24le",
            SampleFormat::S32LE => "s32le",
            SampleFormat::FloatLE => "float_le",
        };
        f.write_str(s)
    }
}

/// Channel position codes (spec C1 channel-map tables). Mirrors the subset
/// of `SND_CHMAP_*` constants the default WAVE/ALSA layouts use.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChannelPosition {
    Unknown,
    FL,
    FR,
    RL,
    RR,
    FC,
    LFE,
    SL,
    SR,
}

impl ChannelPosition {
    /// Bit index used to break ties when filling unknown slots from a
    /// default mask ("lowest-bit position not yet used", §4.1). Order here
    /// is the canonical WAVE channel-mask bit order.
    fn bit(self) -> u32 {
        match self {
            ChannelPosition::FL => 0,
            ChannelPosition::FR => 1,
            ChannelPosition::FC => 2,
            ChannelPosition::LFE => 3,
            ChannelPosition::RL => 4,
            ChannelPosition::RR => 5,
            ChannelPosition::SL => 6,
            ChannelPosition::SR => 7,
            ChannelPosition::Unknown => u32::MAX,
        }
    }
}

/// Default channel layouts for 1–8 channels (spec C1 / §8 Boundaries),
/// matching conventional WAVE/ALSA defaults:
/// mono; FL FR; +LFE; FL FR RL RR; +FC; +LFE; 7→+SL SR FC; 8→+LFE.
pub fn default_layout(channels: usize) -> Vec<ChannelPosition> {
    use ChannelPosition::*;
    match channels {
        0 => vec![],
        1 => vec![FC], // "mono" - conventionally mapped to the center position
        2 => vec![FL, FR],
        3 => vec![FL, FR, LFE],
        4 => vec![FL, FR, RL, RR],
        5 => vec![FL, FR, RL, RR, FC],
        6 => vec![FL, FR, RL, RR, FC, LFE],
        7 => vec![FL, FR, RL, RR, SL, SR, FC],
        8 => vec![FL, FR, RL, RR, SL, SR, FC, LFE],
        n => {
            // Beyond the conventional table: repeat the 8ch default and pad
            // the rest with Unknown, which sanitize_channel_map will then
            // fill from the bitmask in channel order.
            let mut v = default_layout(8);
            v.resize(n, Unknown);
            v
        }
    }
}

/// Sanitize a channel-map candidate (spec §4.1):
///
/// (a) out-of-range codes become `Unknown` (not applicable here since the
///     type itself cannot represent an out-of-range code, but a caller
///     passing a sentinel value from an FFI boundary should map it to
///     `Unknown` before calling this);
/// (b) a position used more than once: every occurrence of it becomes
///     `Unknown`;
/// (c) remaining `Unknown` slots are filled from the default mask for this
///     channel count, lowest unused bit first.
///
/// Idempotent: `sanitize_channel_map(&sanitize_channel_map(x)) ==
/// sanitize_channel_map(x)`.
pub fn sanitize_channel_map(input: &[ChannelPosition]) -> Vec<ChannelPosition> {
    let n = input.len();
    let mut out = input.to_vec();

    // (b) collapse duplicates (Unknown never counts as a duplicate of itself)
    for i in 0..n {
        if out[i] == ChannelPosition::Unknown {
            continue;
        }
        let mut dup = false;
        for j in 0..n {
            if i != j && out[j] == out[i] {
                dup = true;
                break;
            }
        }
        if dup {
            for j in 0..n {
                if out[j] == out[i] {
                    out[j] = ChannelPosition::Unknown;
                }
            }
        }
    }

    // (c) fill remaining Unknown slots from the default mask, lowest bit first
    let defaults = default_layout(n);
    let mut used: Vec<ChannelPosition> = out.iter().copied().filter(|&p| p != ChannelPosition::Unknown).collect();
    let mut candidates: Vec<ChannelPosition> = defaults
        .into_iter()
        .filter(|p| *p != ChannelPosition::Unknown && !used.contains(p))
        .collect();
    candidates.sort_by_key(|p| p.bit());
    let mut candidates = candidates.into_iter();

    for slot in out.iter_mut() {
        if *slot == ChannelPosition::Unknown {
            if let Some(next) = candidates.next() {
                *slot = next;
                used.push(next);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChannelPosition::*;

    #[test]
    fn mono_default_is_center() {
        assert_eq!(default_layout(1), vec![FC]);
    }

    #[test]
    fn eight_channel_default_matches_spec() {
        assert_eq!(default_layout(8), vec![FL, FR, RL, RR, SL, SR, FC, LFE]);
    }

    #[test]
    fn sanitize_collapses_duplicates_and_fills_from_default() {
        // input from spec §8 scenario 6
        let input = vec![FL, FR, FR, Unknown, FC];
        let out = sanitize_channel_map(&input);
        assert_eq!(out.len(), input.len());
        // no duplicates
        for p in &out {
            if *p == Unknown {
                continue;
            }
            assert_eq!(out.iter().filter(|&&x| x == *p).count(), 1);
        }
        // no Unknown left (5ch default has enough distinct positions)
        assert!(!out.contains(&Unknown));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let input = vec![FL, FL, RR, Unknown, FC, LFE, Unknown, SL];
        let once = sanitize_channel_map(&input);
        let twice = sanitize_channel_map(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn sanitize_preserves_length() {
        let input = vec![Unknown; 6];
        assert_eq!(sanitize_channel_map(&input).len(), 6);
    }

    #[test]
    fn sanitize_output_never_has_duplicates() {
        let input = vec![FC, FC, FC, FC];
        let out = sanitize_channel_map(&input);
        let known: Vec<_> = out.iter().copied().filter(|&p| p != Unknown).collect();
        let mut dedup = known.clone();
        dedup.dedup();
        assert_eq!(known.len(), dedup.len());
    }
}
