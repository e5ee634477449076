//! Client configuration.
//!
//! Everything the library needs is carried in an explicit [`ClientConfig`];
//! nothing here reads the process environment. The binary maps CLI flags and
//! `RBUILD_*` environment variables onto these types.

use crate::archive::ProcessStage;
use crate::error::{BuildError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default HTTPS port for build agents
pub const DEFAULT_PORT: u16 = 443;

/// Delay between upload acceptance and the first status poll
pub const DEFAULT_GRACE_DELAY: Duration = Duration::from_secs(2);

/// Idle timeout for the whole session
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// zstd level used for loopback endpoints (not bandwidth bound)
pub const LOCAL_COMPRESSION_LEVEL: u8 = 3;

/// zstd level used for remote endpoints (best ratio)
pub const REMOTE_COMPRESSION_LEVEL: u8 = 19;

/// Agent CA trusted when nothing else is configured, provisioned at build
/// time through `RBUILD_BUILTIN_CA_PEM`.
pub const BUILTIN_CA_PEM: Option<&str> = option_env!("RBUILD_BUILTIN_CA_PEM");

/// Remote build agent address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]:port` or `https://host[:port][/]`.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let without_scheme = match trimmed.split_once("://") {
            Some(("https", rest)) => rest,
            Some((scheme, _)) => {
                return Err(BuildError::Configuration(format!(
                    "unsupported endpoint scheme '{}' (only https is supported)",
                    scheme
                )))
            }
            None => trimmed,
        };
        let authority_str = without_scheme.trim_end_matches('/');
        if authority_str.is_empty() {
            return Err(BuildError::Configuration("empty endpoint".to_string()));
        }

        let authority: http::uri::Authority = authority_str.parse().map_err(|e| {
            BuildError::Configuration(format!("invalid endpoint '{}': {}", input, e))
        })?;

        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = authority.port_u16().unwrap_or(DEFAULT_PORT);

        Ok(Self { host, port })
    }

    /// `host:port` form used for the `:authority` pseudo-header and for
    /// socket address resolution.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn is_loopback(&self) -> bool {
        matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Which certificate authorities the TLS layer trusts.
///
/// With a pinned or development CA only the chain is checked, not the host
/// name: build agents are often ephemeral machines without stable DNS names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustPolicy {
    /// PEM-encoded CA certificate(s)
    PinnedCa(String),
    /// CA certificate read from a locally issued development CA file
    DevelopmentCa(PathBuf),
    /// CA pinning disabled, public web roots with hostname verification
    PublicRoots,
}

impl TrustPolicy {
    /// Build a policy from the raw CA setting and the local-CA switch, falling
    /// back to [`BUILTIN_CA_PEM`] when no CA is configured.
    ///
    /// `ca_cert` may be PEM text, a path to a PEM file, or `false` to turn
    /// pinning off. The local-CA switch wins over everything else.
    pub fn from_settings(ca_cert: Option<&str>, use_local_ca: bool) -> Result<Self> {
        Self::from_settings_with_default(ca_cert, use_local_ca, BUILTIN_CA_PEM)
    }

    /// Same as [`TrustPolicy::from_settings`] with an explicit default CA.
    pub fn from_settings_with_default(
        ca_cert: Option<&str>,
        use_local_ca: bool,
        default_ca: Option<&str>,
    ) -> Result<Self> {
        if use_local_ca {
            return Ok(TrustPolicy::DevelopmentCa(default_development_ca_path()?));
        }

        match ca_cert.map(str::trim) {
            None | Some("") => match default_ca.map(str::trim) {
                Some(pem) if !pem.is_empty() => Ok(TrustPolicy::PinnedCa(pem.to_string())),
                _ => Err(BuildError::Configuration(
                    "no CA certificate configured and this build bundles no agent CA \
                     (set RBUILD_CA_CERT, or RBUILD_CA_CERT=false to use public roots)"
                        .to_string(),
                )),
            },
            Some("false") => Ok(TrustPolicy::PublicRoots),
            Some(value) if value.starts_with("-----BEGIN") => {
                Ok(TrustPolicy::PinnedCa(value.to_string()))
            }
            Some(path) => {
                let pem = std::fs::read_to_string(path)
                    .map_err(|e| BuildError::file_io(PathBuf::from(path), e))?;
                Ok(TrustPolicy::PinnedCa(pem))
            }
        }
    }
}

/// `~/.cache/rbuild/dev-ca.pem` (platform cache dir)
pub fn default_development_ca_path() -> Result<PathBuf> {
    let cache = dirs::cache_dir().ok_or_else(|| {
        BuildError::Configuration("Cannot determine cache directory".to_string())
    })?;
    Ok(cache.join("rbuild").join("dev-ca.pem"))
}

/// zstd level selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    /// Fast for loopback endpoints, best ratio otherwise
    #[default]
    Auto,
    Level(u8),
}

impl CompressionLevel {
    pub fn resolve(self, endpoint: &Endpoint) -> u8 {
        match self {
            CompressionLevel::Level(level) => level,
            CompressionLevel::Auto if endpoint.is_loopback() => LOCAL_COMPRESSION_LEVEL,
            CompressionLevel::Auto => REMOTE_COMPRESSION_LEVEL,
        }
    }
}

impl std::str::FromStr for CompressionLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(CompressionLevel::Auto);
        }
        match s.parse::<u8>() {
            Ok(level @ 1..=22) => Ok(CompressionLevel::Level(level)),
            _ => Err(format!(
                "invalid compression level '{}' (expected 1-22 or auto)",
                s
            )),
        }
    }
}

/// Configuration threaded into a [`crate::RemoteBuild`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub trust: TrustPolicy,
    pub compression: CompressionLevel,
    /// `None` disables the idle watchdog
    pub idle_timeout: Option<Duration>,
    pub grace_delay: Duration,
    pub archiver: ProcessStage,
    /// Overrides the zstd stage entirely (level is then ignored)
    pub compressor: Option<ProcessStage>,
}

impl ClientConfig {
    pub fn new(endpoint: Endpoint, trust: TrustPolicy) -> Self {
        Self {
            endpoint,
            trust,
            compression: CompressionLevel::Auto,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            grace_delay: DEFAULT_GRACE_DELAY,
            archiver: ProcessStage::new("tar"),
            compressor: None,
        }
    }

    /// The compressor stage that will actually run.
    pub fn compressor_stage(&self) -> ProcessStage {
        match &self.compressor {
            Some(stage) => stage.clone(),
            None => ProcessStage::zstd(self.compression.resolve(&self.endpoint)),
        }
    }
}
