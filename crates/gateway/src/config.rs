use std::{env, ffi::OsString, path::PathBuf};

/// Gateway runtime configuration, read from the environment.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Origins allowed for CORS and WebSocket upgrades.
    pub allowed_origins: Vec<String>,
    pub data_dir: PathBuf,
    pub sessions_dir: Option<PathBuf>,
    /// Worker binary plus arguments, e.g. `codex app-server`.
    pub worker_binary: PathBuf,
    pub worker_args: Vec<OsString>,
    pub log_filter: String,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(4310);

        let mut allowed_origins = Vec::new();
        if let Ok(origin) = env::var("WEB_ORIGIN") {
            if !origin.trim().is_empty() {
                allowed_origins.push(origin.trim().to_string());
            }
        }
        if let Ok(list) = env::var("CORS_ALLOWLIST") {
            for origin in list.split(',') {
                let origin = origin.trim();
                if !origin.is_empty() && !allowed_origins.iter().any(|o| o == origin) {
                    allowed_origins.push(origin.to_string());
                }
            }
        }
        if allowed_origins.is_empty() {
            allowed_origins.push(format!("http://localhost:{port}"));
            allowed_origins.push(format!("http://127.0.0.1:{port}"));
        }

        let data_dir = env::var("GATEWAY_DATA_DIR").map(PathBuf::from).unwrap_or_else(|_| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("agent-gateway")
        });

        let sessions_dir = env::var("CODEX_SESSIONS_DIR").ok().map(PathBuf::from);

        let worker_binary = env::var("WORKER_BINARY")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("codex"));
        let worker_args = env::var("WORKER_ARGS")
            .map(|raw| raw.split_whitespace().map(OsString::from).collect())
            .unwrap_or_else(|_| vec![OsString::from("app-server")]);

        let log_filter = env::var("LOG_LEVEL")
            .or_else(|_| env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info".to_string());

        Self {
            host,
            port,
            allowed_origins,
            data_dir,
            sessions_dir,
            worker_binary,
            worker_args,
            log_filter,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("gateway.db")
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|allowed| allowed == origin)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4310,
            allowed_origins: vec!["http://localhost:4310".to_string()],
            data_dir: PathBuf::from("."),
            sessions_dir: None,
            worker_binary: PathBuf::from("codex"),
            worker_args: vec![OsString::from("app-server")],
            log_filter: "info".to_string(),
        }
    }
}
