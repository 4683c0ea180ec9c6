use ebb_protocol::ServoProfileKind;

/// Process configuration, read once at startup from the environment.
/// Mirrors the `env::var(...).ok().and_then(...).unwrap_or(default)`
/// convention the teacher uses for `UwbHubConfig::default()`.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub default_device: Option<String>,
    pub autoconnect: bool,
    pub servo_profile: ServoProfileKind,
    pub model: String,
    pub speed_pen_up_ips: f64,
    pub speed_pen_down_ips: f64,
    pub static_root: String,
    pub heartbeat_fail_threshold: u32,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        let servo_profile = match env_var("SERVO_PROFILE").as_deref() {
            Some("narrow_band") => ServoProfileKind::NarrowBand,
            _ => ServoProfileKind::Standard,
        };

        Self {
            host: env_var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8080),
            default_device: env_var("EBB_PORT"),
            autoconnect: env_parse("EBB_AUTOCONNECT", false),
            servo_profile,
            model: env_var("AXIDRAW_MODEL").unwrap_or_else(|| "V3".to_string()),
            speed_pen_up_ips: env_parse("SPEED_PENUP_IPS", 0.5),
            speed_pen_down_ips: env_parse("SPEED_PENDOWN_IPS", 0.25),
            static_root: env_var("STATIC_ROOT").unwrap_or_else(|| "./public".to_string()),
            heartbeat_fail_threshold: env_parse("HEARTBEAT_FAIL_THRESHOLD", 2),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }
}
