//! Process-wide configuration.

use {
    crate::address::BusKind,
    error_reporter::Report,
    serde::Deserialize,
    std::{env::var, path::Path, sync::OnceLock, time::Duration},
};

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// The timeout of method calls.
    pub call_timeout: Duration,
    /// The number of signals buffered per subscription.
    pub signal_queue_capacity: usize,
    pub negotiate_unix_fd: bool,
    /// The bus opened by the default connection.
    pub default_bus: BusKind,
    /// Whether the default connection falls back to the system bus.
    pub fallback_to_system: bool,
    /// The maximum size of incoming messages.
    pub max_message_size: usize,
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Returns the process settings.
///
/// If [init] has not been called, the compiled-in defaults are installed.
pub fn get() -> &'static Settings {
    SETTINGS.get_or_init(Settings::default)
}

/// Loads the process settings.
///
/// If `config` is `None`, the file named by `$BUSLANE_CONFIG` is used, then
/// `$XDG_CONFIG_HOME/buslane/config.toml` if it exists. Errors are logged and the
/// defaults are used instead. Calling this function after the settings have been
/// installed has no effect.
pub fn init(config: Option<&str>) {
    SETTINGS.get_or_init(|| {
        let path_str;
        let path = match config {
            Some(c) => c,
            None => {
                if let Ok(c) = var("BUSLANE_CONFIG") {
                    path_str = c;
                } else {
                    let config_home = match var("XDG_CONFIG_HOME") {
                        Ok(h) => h,
                        Err(_) => match var("HOME") {
                            Ok(v) => format!("{v}/.config"),
                            Err(_) => return Settings::default(),
                        },
                    };
                    let path = format!("{config_home}/buslane/config.toml");
                    if !Path::new(&path).exists() {
                        return Settings::default();
                    }
                    path_str = path;
                }
                &path_str
            }
        };
        let c = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                log::error!("Could not read {path}: {}", Report::new(e));
                log::warn!("Using default config");
                return Settings::default();
            }
        };
        deserialize(&c)
    });
}

impl Default for Settings {
    fn default() -> Self {
        deserialize("")
    }
}

impl Settings {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        let desired = toml::from_str::<TomlSettings>(s)?;
        Ok(resolve(desired))
    }
}

fn merge(target: &mut TomlSettings, mut source: TomlSettings) {
    macro_rules! opt {
        ($($ident:ident).+) => {
            let v = source.$($ident).+.take();
            if target.$($ident).+.is_none() {
                target.$($ident).+ = v;
            }
        };
    }
    opt!(call_timeout_ms);
    opt!(signal_queue_capacity);
    opt!(negotiate_unix_fd);
    opt!(default_bus);
    opt!(fallback_to_system);
    opt!(max_message_size);
}

const DEFAULT_TOML: &str = include_str!("default.toml");

fn deserialize(s: &str) -> Settings {
    let desired = toml::from_str::<TomlSettings>(s).unwrap_or_else(|e| {
        log::error!("Could not deserialize settings: {}", Report::new(e));
        log::warn!("Falling back to default settings");
        TomlSettings::default()
    });
    resolve(desired)
}

fn resolve(mut desired: TomlSettings) -> Settings {
    match toml::from_str::<TomlSettings>(DEFAULT_TOML) {
        Ok(default) => merge(&mut desired, default),
        Err(e) => log::error!("Built-in settings are invalid: {}", Report::new(e)),
    }
    Settings {
        call_timeout: Duration::from_millis(desired.call_timeout_ms.unwrap_or(25_000)),
        signal_queue_capacity: desired.signal_queue_capacity.unwrap_or(256).max(1),
        negotiate_unix_fd: desired.negotiate_unix_fd.unwrap_or(true),
        default_bus: desired.default_bus.unwrap_or(BusKind::Session),
        fallback_to_system: desired.fallback_to_system.unwrap_or(false),
        max_message_size: desired
            .max_message_size
            .unwrap_or(buslane_wire::MAX_MESSAGE_LEN)
            .min(buslane_wire::MAX_MESSAGE_LEN),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct TomlSettings {
    call_timeout_ms: Option<u64>,
    signal_queue_capacity: Option<usize>,
    negotiate_unix_fd: Option<bool>,
    default_bus: Option<BusKind>,
    fallback_to_system: Option<bool>,
    max_message_size: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_deserializes() {
        let s = Settings::default();
        assert_eq!(s.call_timeout, Duration::from_secs(25));
        assert_eq!(s.signal_queue_capacity, 256);
        assert!(s.negotiate_unix_fd);
        assert_eq!(s.default_bus, BusKind::Session);
        assert!(!s.fallback_to_system);
        assert_eq!(s.max_message_size, 128 << 20);
    }

    #[test]
    fn overrides_are_merged() {
        let s = Settings::from_toml(
            r#"
            call-timeout-ms = 500
            default-bus = "system"
            "#,
        )
        .unwrap();
        assert_eq!(s.call_timeout, Duration::from_millis(500));
        assert_eq!(s.default_bus, BusKind::System);
        assert_eq!(s.signal_queue_capacity, 256);
    }

    #[test]
    fn invalid_falls_back() {
        assert!(Settings::from_toml("signal-queue-capacity = \"x\"").is_err());
        assert_eq!(deserialize("unknown-key = 1"), Settings::default());
    }
}
