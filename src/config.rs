use std::time::Duration;

/// Default maximum declared frame length in bytes.
///
/// Protocol ids are short path-like strings; anything beyond this is a
/// misbehaving or hostile peer trying to make us buffer unbounded data.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024;

/// Default number of rejected proposals before a listener aborts the stream.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default deadline for one complete negotiation handshake.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for establishing a transport connection.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables for negotiation and dialing.
///
/// All fields have working defaults; construct with `Config::default()` and
/// override what you need.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum declared frame length the codec will accept.
    pub max_frame_len: usize,

    /// Rejected proposals a listener tolerates before failing the stream.
    pub max_attempts: u32,

    /// Deadline for a single stream's negotiation handshake.
    pub negotiation_timeout: Duration,

    /// Deadline for the transport-level connect of a dial.
    pub dial_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}
