use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use rbuild::{
    ArtifactRecord, ArtifactSink, BuildRequest, ClientConfig, CompressionLevel, Endpoint,
    JobHeaders, ProjectInfo, RemoteBuild, TrustPolicy,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "rbuild")]
#[command(about = "Run a build on a remote build agent and download the artifacts", long_about = None)]
#[command(version)]
struct Cli {
    /// Project directory to upload
    #[arg(default_value = ".")]
    project_dir: PathBuf,

    /// Build agent address (host[:port] or https://host[:port])
    #[arg(short, long, env = "RBUILD_ENDPOINT")]
    endpoint: String,

    /// Generated project info file shipped with the workspace
    #[arg(long)]
    info_file: PathBuf,

    /// Build resources directory (default: <project>/build)
    #[arg(long)]
    build_resources: Option<PathBuf>,

    /// Where artifacts are written (default: <project>/dist)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Extra job header, name=value (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// CA certificate (PEM text or path), or "false" to disable pinning
    #[arg(long, env = "RBUILD_CA_CERT", hide_env_values = true)]
    ca_cert: Option<String>,

    /// Trust the locally issued development CA instead
    #[arg(long, env = "RBUILD_USE_LOCAL_CA")]
    use_local_ca: bool,

    /// zstd level 1-22, or "auto" (fast for localhost, best otherwise)
    #[arg(long, env = "RBUILD_ZSTD_LEVEL", default_value = "auto")]
    zstd_level: CompressionLevel,

    /// Seconds between job acceptance and the first status poll
    #[arg(long, default_value_t = 2.0)]
    grace_delay: f64,

    /// Session idle timeout in seconds (0 disables)
    #[arg(long, default_value_t = 600)]
    idle_timeout: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig> {
        let endpoint = Endpoint::parse(&self.endpoint)?;
        let trust = TrustPolicy::from_settings(self.ca_cert.as_deref(), self.use_local_ca)?;

        let mut config = ClientConfig::new(endpoint, trust);
        config.compression = self.zstd_level;
        config.grace_delay = Duration::try_from_secs_f64(self.grace_delay)
            .context("invalid --grace-delay")?;
        config.idle_timeout = match self.idle_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Ok(config)
    }

    fn build_request(&self) -> Result<BuildRequest> {
        let mut headers = JobHeaders::new();
        for pair in &self.headers {
            let (name, value) = JobHeaders::parse_pair(pair)?;
            headers.insert(name, value);
        }

        Ok(BuildRequest {
            project_dir: self.project_dir.clone(),
            build_resources_dir: self
                .build_resources
                .clone()
                .unwrap_or_else(|| self.project_dir.join("build")),
            output_dir: self
                .output
                .clone()
                .unwrap_or_else(|| self.project_dir.join("dist")),
            headers,
        })
    }
}

/// Info file given on the command line.
struct StaticProjectInfo(PathBuf);

#[async_trait]
impl ProjectInfo for StaticProjectInfo {
    async fn info_file(&self) -> rbuild::Result<PathBuf> {
        Ok(self.0.clone())
    }
}

/// Reports each artifact as it lands.
struct LogSink;

#[async_trait]
impl ArtifactSink for LogSink {
    async fn artifact_created(&self, record: ArtifactRecord) -> rbuild::Result<()> {
        match (&record.target, &record.arch) {
            (Some(target), Some(arch)) => tracing::info!(
                "Artifact {} ({}, {})",
                record.file.display(),
                target,
                arch
            ),
            (Some(target), None) => {
                tracing::info!("Artifact {} ({})", record.file.display(), target)
            }
            _ => tracing::info!("Artifact {}", record.file.display()),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.client_config()?;
    let request = cli.build_request()?;
    let project = StaticProjectInfo(cli.info_file.clone());

    tracing::info!(
        "Uploading {} to {}",
        request.project_dir.display(),
        config.endpoint
    );

    let outcome = RemoteBuild::new(config)
        .run(&request, &project, &LogSink)
        .await
        .context("Remote build failed")?;

    tracing::info!(
        "Job {} finished, {} artifact(s) in {}",
        outcome.job_id,
        outcome.artifacts,
        request.output_dir.display()
    );
    Ok(())
}
