use std::time::Duration;

/// 16 MB, enough for a base64 file upload of roughly 12 MB.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Close sessions that send nothing for this long. `None` waits forever.
    pub idle_timeout: Option<Duration>,
    pub max_line_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}
