use thiserror::Error;

/// Reported by the frame reader when a read would pass the captured length.
///
/// Truncation is not a failure of the decoder: the parser catches it and
/// returns whatever it had decoded so far.
#[derive(Debug, Clone, Copy, Error)]
#[error("frame truncated: need {needed} bytes, captured {actual}")]
pub struct Truncated {
    pub needed: usize,
    pub actual: usize,
}
