//! Server configuration resolved from environment variables, with CLI overrides
//! applied by the binary. Unparseable values fall back to defaults.

use std::env;
use std::path::PathBuf;

use tracing::warn;

/// Which indexing sink the server wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    Memory,
    None,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub http_port: u16,
    pub storage_root: PathBuf,
    pub admin_role: String,
    pub cache_max_age_secs: u64,
    /// Header carrying the caller identity verified by the upstream authenticator.
    pub identity_header: String,
    /// Header carrying the caller's comma-separated role claims.
    pub roles_header: String,
    pub index_mode: IndexMode,
    pub public_base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            http_port: 7979,
            storage_root: PathBuf::from("blobs"),
            admin_role: "admin".to_string(),
            cache_max_age_secs: 3600,
            identity_header: "x-auth-user".to_string(),
            roles_header: "x-auth-roles".to_string(),
            index_mode: IndexMode::Memory,
            public_base_url: None,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env_string(name) {
        Some(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(target: "startup", "ignoring unparseable {}='{}', using default", name, raw);
                default
            }
        },
        None => default,
    }
}

fn parse_index_mode(raw: &str) -> Option<IndexMode> {
    match raw.to_ascii_lowercase().as_str() {
        "memory" | "mem" => Some(IndexMode::Memory),
        "none" | "off" | "noop" => Some(IndexMode::None),
        _ => None,
    }
}

impl ServerConfig {
    /// Build a configuration from `BLOBHOUSE_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        let index_mode = match env_string("BLOBHOUSE_INDEX") {
            Some(raw) => parse_index_mode(&raw).unwrap_or_else(|| {
                warn!(target: "startup", "unknown BLOBHOUSE_INDEX='{}', using memory", raw);
                IndexMode::Memory
            }),
            None => d.index_mode,
        };
        Self {
            bind_addr: env_string("BLOBHOUSE_BIND").unwrap_or(d.bind_addr),
            http_port: env_parsed("BLOBHOUSE_HTTP_PORT", d.http_port),
            storage_root: env_string("BLOBHOUSE_STORAGE_ROOT").map(PathBuf::from).unwrap_or(d.storage_root),
            admin_role: env_string("BLOBHOUSE_ADMIN_ROLE").unwrap_or(d.admin_role),
            cache_max_age_secs: env_parsed("BLOBHOUSE_CACHE_MAX_AGE", d.cache_max_age_secs),
            identity_header: env_string("BLOBHOUSE_IDENTITY_HEADER").map(|s| s.to_ascii_lowercase()).unwrap_or(d.identity_header),
            roles_header: env_string("BLOBHOUSE_ROLES_HEADER").map(|s| s.to_ascii_lowercase()).unwrap_or(d.roles_header),
            index_mode,
            public_base_url: env_string("BLOBHOUSE_PUBLIC_BASE_URL").map(|s| s.trim_end_matches('/').to_string()),
        }
    }

    /// Apply `--port <n>` and `--root <dir>` overrides from the command line.
    pub fn apply_args(mut self, args: &[String]) -> Self {
        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            let next = args.get(i + 1);
            match (flag, next) {
                ("--port", Some(v)) => {
                    match v.parse::<u16>() {
                        Ok(p) => self.http_port = p,
                        Err(_) => warn!(target: "startup", "ignoring invalid --port '{}'", v),
                    }
                    i += 1;
                }
                ("--root", Some(v)) => {
                    self.storage_root = PathBuf::from(v);
                    i += 1;
                }
                _ => {}
            }
            i += 1;
        }
        self
    }

    pub fn cache_control(&self) -> String {
        format!("public, max-age={}", self.cache_max_age_secs)
    }
}
