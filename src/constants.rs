//! Protocol constants and configuration values

/// Default AMI TCP port.
pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Default FastAGI TCP port.
pub const DEFAULT_FASTAGI_PORT: u16 = 4573;

/// Socket read buffer size used by the Tokio driver (64KB).
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Prefix of the greeting line AMI sends right after connect. The rest
/// of the line is the protocol version.
pub const AMI_BANNER_PREFIX: &str = "Asterisk Call Manager/";

/// Sentinel terminating the payload of a `Response: Follows`. May be
/// glued to the last payload line without a line break.
pub const END_COMMAND_SENTINEL: &str = "--END COMMAND--";

/// Prefix of the line terminating a 520 multi-line usage body.
pub const END_OF_USAGE_PREFIX: &str = "520 End of proper usage";

/// AMI line terminator (output side; LF is tolerated on input).
pub const AMI_EOL: &str = "\r\n";

/// AGI line terminator (output side; CRLF is tolerated on input).
pub const AGI_EOL: &str = "\n";

/// Prefix of every AGI environment variable name.
pub const AGI_ENV_PREFIX: &str = "agi_";
