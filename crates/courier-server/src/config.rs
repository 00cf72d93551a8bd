use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use courier_gateway::GatewayConfig;
use courier_gateway::config::DEFAULT_MAX_LINE_BYTES;

/// Process configuration, read from `COURIER_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub file_dir: PathBuf,
    pub gateway: GatewayConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let idle_secs: u64 = parse(&var("COURIER_IDLE_TIMEOUT_SECS", "0"), "COURIER_IDLE_TIMEOUT_SECS")?;
        let max_line_bytes: usize = parse(
            &var("COURIER_MAX_LINE_BYTES", &DEFAULT_MAX_LINE_BYTES.to_string()),
            "COURIER_MAX_LINE_BYTES",
        )?;

        Ok(Self {
            host: var("COURIER_HOST", "0.0.0.0"),
            port: parse(&var("COURIER_PORT", "5555"), "COURIER_PORT")?,
            db_path: PathBuf::from(var("COURIER_DB_PATH", "courier.db")),
            file_dir: PathBuf::from(var("COURIER_FILE_DIR", "./courier-files")),
            gateway: GatewayConfig {
                idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
                max_line_bytes,
            },
        })
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}

fn parse<T>(value: &str, key: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{} has invalid value '{}'", key, value))
}
