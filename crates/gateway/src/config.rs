use anyhow::Context as _;
use clap::Parser;
use serde::{Deserialize, Serialize, Serializer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::mcp::{BridgeProduct, builtin_products, validate_products};

const DEFAULT_BIND: &str = "127.0.0.1:3001";
const DEFAULT_BACKEND_TARGET: &str = "http://localhost:7777";
const DEFAULT_JSON_LIMIT: &str = "25mb";

/// CLI arguments for the dev gateway.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "devgw")]
#[command(
    version,
    about = "Local dev gateway: MCP tool-name bridge, reverse proxies, uploads and story saves"
)]
pub struct CliArgs {
    /// Path to a gateway config file (YAML).
    #[arg(short = 'c', long = "config", env = "DEVGW_CONFIG")]
    pub config: Option<PathBuf>,

    /// HTTP bind address (ip:port). Defaults to 127.0.0.1:3001.
    #[arg(short = 'b', long, env = "DEVGW_BIND")]
    pub bind: Option<String>,

    /// Log level. Supports tracing filter syntax.
    #[arg(
        short = 'l',
        long = "log-level",
        env = "DEVGW_LOG",
        default_value = "info"
    )]
    pub log_level: String,

    /// Upstream MCP host (`example.com`, or a full origin such as `http://127.0.0.1:9000`).
    #[arg(long = "upstream-host", env = "KAMUI_CODE_URL")]
    pub upstream_host: Option<String>,

    /// Default `Authorization` value sent upstream when the caller sends none.
    #[arg(long = "upstream-auth", env = "MCP_AUTH", hide_env_values = true)]
    pub upstream_auth: Option<String>,

    /// Origin of the local backend behind `/backend`.
    #[arg(long = "backend-target", env = "BACKEND_TARGET")]
    pub backend_target: Option<String>,

    /// Print the resolved configuration as YAML and exit.
    #[arg(long = "print-effective-config")]
    pub print_effective_config: bool,
}

/// Optional overrides read from the YAML config file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub upstream_host: Option<String>,
    #[serde(default)]
    pub upstream_auth: Option<String>,
    #[serde(default)]
    pub backend_target: Option<String>,
    #[serde(default)]
    pub upload: FileUploadConfig,
    #[serde(default)]
    pub static_dir: Option<String>,
    #[serde(default)]
    pub public_dir: Option<String>,
    #[serde(default)]
    pub saves_dir: Option<String>,
    #[serde(default)]
    pub mcp_config_path: Option<String>,
    #[serde(default)]
    pub json_limit: Option<String>,
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Replaces the built-in product table when present.
    #[serde(default)]
    pub bridges: Option<Vec<BridgeProduct>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub field_name: Option<String>,
}

impl FileConfig {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let mut cfg: Self = serde_yaml::from_str(text).context("parse YAML config")?;
        cfg.expand_env().context("expand ${VAR} references")?;
        Ok(cfg)
    }

    fn expand_env(&mut self) -> anyhow::Result<()> {
        for field in [
            &mut self.bind,
            &mut self.upstream_host,
            &mut self.upstream_auth,
            &mut self.backend_target,
            &mut self.upload.url,
            &mut self.upload.api_key,
            &mut self.upload.field_name,
            &mut self.static_dir,
            &mut self.public_dir,
            &mut self.saves_dir,
            &mut self.mcp_config_path,
            &mut self.json_limit,
            &mut self.public_base_url,
        ] {
            if let Some(value) = field.as_mut() {
                *value = devgw_env::expand_env_string(value).map_err(anyhow::Error::msg)?;
            }
        }
        Ok(())
    }
}

/// Settings for the outbound uploader behind `POST /upload`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfig {
    pub url: Option<String>,
    #[serde(serialize_with = "redacted")]
    pub api_key: Option<String>,
    pub field_name: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            field_name: "media".to_string(),
        }
    }
}

/// Resolved, immutable gateway configuration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub upstream_host: Option<String>,
    #[serde(serialize_with = "redacted")]
    pub upstream_auth: Option<String>,
    pub backend_target: String,
    pub upload: UploadConfig,
    pub static_dir: PathBuf,
    pub public_dir: PathBuf,
    pub saves_dir: PathBuf,
    pub mcp_config_path: PathBuf,
    pub json_limit: usize,
    /// Prefix for media URLs handed back by the story loader.
    pub public_base_url: String,
    pub bridges: Vec<BridgeProduct>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let bind: SocketAddr = SocketAddr::from(([127, 0, 0, 1], 3001));
        Self {
            bind,
            upstream_host: None,
            upstream_auth: None,
            backend_target: DEFAULT_BACKEND_TARGET.to_string(),
            upload: UploadConfig::default(),
            static_dir: PathBuf::from("static"),
            public_dir: PathBuf::from("public"),
            saves_dir: PathBuf::from("saves"),
            mcp_config_path: PathBuf::from("mcp/config.json"),
            json_limit: 25 * 1024 * 1024,
            public_base_url: format!("http://localhost:{}", bind.port()),
            bridges: builtin_products(),
        }
    }
}

fn redacted<S: Serializer>(value: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(_) => s.serialize_str("<redacted>"),
        None => s.serialize_none(),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl GatewayConfig {
    /// Merge built-in defaults, the YAML file and the environment/CLI (in increasing precedence).
    ///
    /// `env` is consulted only for settings that have no CLI flag.
    pub fn resolve(
        args: &CliArgs,
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let bind_raw = non_blank(args.bind.clone())
            .or(non_blank(file.bind))
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind: SocketAddr = bind_raw
            .parse()
            .with_context(|| format!("invalid bind address '{bind_raw}'"))?;

        let json_limit_raw = env("JSON_LIMIT")
            .or(non_blank(file.json_limit))
            .unwrap_or_else(|| DEFAULT_JSON_LIMIT.to_string());
        let json_limit = parse_byte_size(&json_limit_raw)
            .with_context(|| format!("invalid JSON_LIMIT '{json_limit_raw}'"))?;

        let bridges = file.bridges.unwrap_or_else(builtin_products);
        validate_products(&bridges).context("validate bridges")?;

        let path_setting = |key: &str, file_value: Option<String>, default: &str| -> PathBuf {
            PathBuf::from(
                env(key)
                    .or(non_blank(file_value))
                    .unwrap_or_else(|| default.to_string()),
            )
        };

        Ok(Self {
            bind,
            upstream_host: non_blank(args.upstream_host.clone()).or(non_blank(file.upstream_host)),
            upstream_auth: non_blank(args.upstream_auth.clone()).or(non_blank(file.upstream_auth)),
            backend_target: non_blank(args.backend_target.clone())
                .or(non_blank(file.backend_target))
                .unwrap_or_else(|| DEFAULT_BACKEND_TARGET.to_string()),
            upload: UploadConfig {
                url: env("UPLOAD_URL").or(non_blank(file.upload.url)),
                api_key: env("UPLOAD_API_KEY")
                    .or_else(|| env("API_KEY"))
                    .or(non_blank(file.upload.api_key)),
                field_name: env("UPLOAD_FIELD_NAME")
                    .or(non_blank(file.upload.field_name))
                    .unwrap_or_else(|| "media".to_string()),
            },
            static_dir: path_setting("DEVGW_STATIC_DIR", file.static_dir, "static"),
            public_dir: path_setting("DEVGW_PUBLIC_DIR", file.public_dir, "public"),
            saves_dir: path_setting("DEVGW_SAVES_DIR", file.saves_dir, "saves"),
            mcp_config_path: path_setting(
                "CLAUDE_MCP_CONFIG_PATH",
                file.mcp_config_path,
                "mcp/config.json",
            ),
            json_limit,
            public_base_url: env("PUBLIC_BASE_URL")
                .or(non_blank(file.public_base_url))
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or_else(|| format!("http://localhost:{}", bind.port())),
            bridges,
        })
    }

    /// Read the config file named by `--config` (if any) and resolve against the process env.
    pub fn load(args: &CliArgs) -> anyhow::Result<Self> {
        let file = match &args.config {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(args, file, devgw_env::non_empty)
    }

    /// Origin used for upstream MCP calls, without a trailing slash.
    pub fn upstream_base(&self) -> Option<String> {
        let host = self.upstream_host.as_deref()?.trim().trim_end_matches('/');
        if host.is_empty() {
            return None;
        }
        if host.contains("://") {
            Some(host.to_string())
        } else {
            Some(format!("https://{host}"))
        }
    }

    pub fn default_auth_header(&self) -> Option<axum::http::HeaderValue> {
        let raw = self.upstream_auth.as_deref()?;
        axum::http::HeaderValue::from_str(raw).ok().map(|mut v| {
            v.set_sensitive(true);
            v
        })
    }
}

fn read_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    FileConfig::from_yaml(&text).with_context(|| format!("load config: {}", path.display()))
}

/// Parse sizes such as `25mb`, `512kb`, `1gb` or a plain byte count (1 kb = 1024 bytes).
pub fn parse_byte_size(raw: &str) -> anyhow::Result<usize> {
    let s = raw.trim().to_ascii_lowercase();
    let (digits, multiplier) = if let Some(n) = s.strip_suffix("gb") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("kb") {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix('b') {
        (n, 1)
    } else {
        (s.as_str(), 1)
    };
    let n: usize = digits
        .trim()
        .parse()
        .with_context(|| format!("not a byte size: '{raw}'"))?;
    n.checked_mul(multiplier)
        .with_context(|| format!("byte size overflows: '{raw}'"))
}
