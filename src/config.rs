use std::env;

/// Process-wide configuration, read once at startup from the environment
/// variables enumerated in the gateway's external-interface contract.
///
/// Every field has a documented default; a missing or unparsable variable
/// falls back to that default, with a `tracing::warn!` the same way the
/// original server fell back to built-in defaults when its config file was
/// absent.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub ws_port: u16,
    pub ws_tls: bool,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,

    pub proxy_port: u16,

    pub cam_user: String,
    pub cam_pass: String,
    pub rtsp_path: String,

    pub out_dir: String,

    pub auto_capture: bool,
    pub require_auth: bool,

    pub hello_wait_ms: u64,
    pub capture_timeout_ms: u64,

    pub storage_mode: StorageMode,
    pub storage_concurrency: usize,
    pub storage_delete_local: bool,

    pub use_device_tz_offset: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Local,
    S3,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ws_port: 7443,
            ws_tls: false,
            tls_cert: None,
            tls_key: None,

            proxy_port: 8554,

            cam_user: "admin".to_string(),
            cam_pass: String::new(),
            rtsp_path: "/stream2".to_string(),

            out_dir: default_out_dir(),

            auto_capture: true,
            require_auth: false,

            hello_wait_ms: 2000,
            capture_timeout_ms: 45_000,

            storage_mode: StorageMode::Local,
            storage_concurrency: 2,
            storage_delete_local: true,

            use_device_tz_offset: false,
        }
    }
}

fn default_out_dir() -> String {
    std::env::temp_dir()
        .join("hyphen-rtsp-tunnel")
        .join("snapshots")
        .to_string_lossy()
        .into_owned()
}

impl AppConfig {
    /// Load configuration from the environment, falling back field-by-field
    /// to [`AppConfig::default`].
    pub fn load() -> Self {
        let defaults = AppConfig::default();

        let cfg = Self {
            ws_port: env_parse("WS_PORT", defaults.ws_port),
            ws_tls: env_bool("WS_TLS", defaults.ws_tls),
            tls_cert: env::var("TLS_CERT").ok(),
            tls_key: env::var("TLS_KEY").ok(),

            proxy_port: env_parse("PROXY_PORT", defaults.proxy_port),

            cam_user: env::var("CAM_USER").unwrap_or(defaults.cam_user),
            cam_pass: env::var("CAM_PASS").unwrap_or(defaults.cam_pass),
            rtsp_path: env::var("RTSP_PATH").unwrap_or(defaults.rtsp_path),

            out_dir: env::var("OUT_DIR").unwrap_or(defaults.out_dir),

            auto_capture: env_bool("AUTO_CAPTURE", defaults.auto_capture),
            require_auth: env_bool("REQUIRE_AUTH", defaults.require_auth),

            hello_wait_ms: env_parse("HELLO_WAIT_MS", defaults.hello_wait_ms),
            capture_timeout_ms: env_parse("CAPTURE_TIMEOUT_MS", defaults.capture_timeout_ms),

            storage_mode: match env::var("STORAGE_MODE").as_deref() {
                Ok("s3") => StorageMode::S3,
                Ok("local") => StorageMode::Local,
                Ok(other) => {
                    tracing::warn!("unknown STORAGE_MODE={other}, falling back to local");
                    StorageMode::Local
                }
                Err(_) => defaults.storage_mode,
            },
            storage_concurrency: env_parse("STORAGE_CONCURRENCY", defaults.storage_concurrency),
            storage_delete_local: env_bool("STORAGE_DELETE_LOCAL", defaults.storage_delete_local),

            use_device_tz_offset: env_bool("USE_DEVICE_TZ_OFFSET", defaults.use_device_tz_offset),
        };

        if cfg.ws_tls && (cfg.tls_cert.is_none() || cfg.tls_key.is_none()) {
            tracing::warn!("WS_TLS=1 but TLS_CERT/TLS_KEY are not both set; TLS will fail to start");
        }

        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("invalid value for {key}={raw:?}, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => matches!(raw.as_str(), "1" | "true" | "TRUE" | "on" | "ON"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.ws_port, 7443);
        assert_eq!(cfg.proxy_port, 8554);
        assert_eq!(cfg.cam_user, "admin");
        assert_eq!(cfg.rtsp_path, "/stream2");
        assert!(cfg.auto_capture);
        assert!(!cfg.require_auth);
        assert_eq!(cfg.hello_wait_ms, 2000);
        assert_eq!(cfg.capture_timeout_ms, 45_000);
        assert_eq!(cfg.storage_concurrency, 2);
    }

    #[test]
    fn env_bool_accepts_common_truthy_forms() {
        std::env::set_var("RTSP_TUNNEL_TEST_BOOL", "on");
        assert!(env_bool("RTSP_TUNNEL_TEST_BOOL", false));
        std::env::set_var("RTSP_TUNNEL_TEST_BOOL", "0");
        assert!(!env_bool("RTSP_TUNNEL_TEST_BOOL", true));
        std::env::remove_var("RTSP_TUNNEL_TEST_BOOL");
    }
}
