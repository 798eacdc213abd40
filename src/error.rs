//! Error kinds surfaced across the host/engine boundary (spec §7).
//!
//! `xrun` and the `no-data`/`no-space` handshake conditions are deliberately
//! *not* variants here: xruns are recovered locally (see [`crate::transfer`])
//! and only ever reach the host as a log line, while empty `ready`/`free`
//! pools drive the `NEED_BUFFER`/silence-fill handshake through
//! [`crate::io`] rather than through `Result`.

use std::borrow::Cow;

/// Errors that can cross the host/engine boundary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Unknown format, refused rate/channel count, or a `set_format` that
    /// came back non-`NEAREST` without the caller asking for `NEAREST`.
    #[error("invalid argument in '{func}': {detail}")]
    InvalidArgument { func: Cow<'static, str>, detail: Cow<'static, str> },

    /// A non-recoverable return from the device layer (anything other than
    /// `PIPE`/`STRPIPE` on commit, or a failed open/hw_params/sw_params).
    #[error("device error in '{func}' (code {code}): {detail}")]
    Device { func: Cow<'static, str>, code: i32, detail: Cow<'static, str> },

    /// Failed descriptor allocation.
    #[error("out of memory allocating {0} buffer descriptor(s)")]
    OutOfMemory(usize),

    /// A host request arrived for a state transition the engine does not
    /// support from its current state (e.g. `start()` before `set_format`).
    #[error("illegal state transition: {0}")]
    IllegalState(Cow<'static, str>),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn invalid_argument(func: &'static str, detail: impl Into<Cow<'static, str>>) -> Self {
        EngineError::InvalidArgument { func: Cow::Borrowed(func), detail: detail.into() }
    }

    pub fn device(func: &'static str, code: i32, detail: impl Into<Cow<'static, str>>) -> Self {
        EngineError::Device { func: Cow::Borrowed(func), code, detail: detail.into() }
    }

    pub fn illegal_state(detail: impl Into<Cow<'static, str>>) -> Self {
        EngineError::IllegalState(detail.into())
    }
}
