//! Parsing of D-Bus server addresses.

use {
    crate::Error,
    serde::Deserialize,
    std::{env::var, fmt, str::FromStr},
};

const SYSTEM_BUS_DEFAULT: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// One of the standard buses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::Session => f.write_str("session"),
            BusKind::System => f.write_str("system"),
        }
    }
}

impl FromStr for BusKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            _ => Err(Error::Address(format!("unknown bus `{s}`"))),
        }
    }
}

/// A transport a client can connect to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    /// A socket in the file system.
    Path(String),
    /// A socket in the abstract namespace.
    Abstract(String),
}

/// Parses an address into its transports, in order of preference.
///
/// Transports a client cannot connect to, such as `tcp:` or `unix:dir=`, are skipped.
/// Fails if no usable transport remains.
pub fn parse(address: &str) -> Result<Vec<Transport>, Error> {
    let mut transports = vec![];
    for part in address.split(';').filter(|p| !p.is_empty()) {
        let Some((kind, params)) = part.split_once(':') else {
            return Err(Error::Address(format!("missing transport in `{part}`")));
        };
        let mut path = None;
        let mut abstract_ = None;
        let mut listen_only = false;
        for kv in params.split(',').filter(|p| !p.is_empty()) {
            let Some((k, v)) = kv.split_once('=') else {
                return Err(Error::Address(format!("malformed key-value pair `{kv}`")));
            };
            let v = unescape(v)?;
            match k {
                "path" => path = Some(v),
                "abstract" => abstract_ = Some(v),
                "dir" | "tmpdir" | "runtime" => listen_only = true,
                _ => {}
            }
        }
        if kind != "unix" {
            log::debug!("Skipping unsupported transport `{kind}`");
            continue;
        }
        match (path, abstract_) {
            (Some(p), None) => transports.push(Transport::Path(p)),
            (None, Some(a)) => transports.push(Transport::Abstract(a)),
            (None, None) if listen_only => {
                log::debug!("Skipping listen-only address `{part}`");
            }
            _ => {
                return Err(Error::Address(format!(
                    "`{part}` must contain exactly one of path or abstract"
                )))
            }
        }
    }
    if transports.is_empty() {
        return Err(Error::Address(format!(
            "`{address}` contains no usable transport"
        )));
    }
    Ok(transports)
}

fn unescape(v: &str) -> Result<String, Error> {
    let bytes = v.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            let Some(b) = hex else {
                return Err(Error::Address(format!("invalid escape in `{v}`")));
            };
            out.push(b);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| Error::Address(format!("`{v}` is not valid UTF-8")))
}

/// The address of a standard bus, taken from the environment.
pub fn bus_address(kind: BusKind) -> Result<String, Error> {
    match kind {
        BusKind::Session => {
            if let Ok(a) = var("DBUS_SESSION_BUS_ADDRESS") {
                return Ok(a);
            }
            match var("XDG_RUNTIME_DIR") {
                Ok(dir) => Ok(format!("unix:path={dir}/bus")),
                Err(_) => Err(Error::Address(
                    "neither DBUS_SESSION_BUS_ADDRESS nor XDG_RUNTIME_DIR is set".to_string(),
                )),
            }
        }
        BusKind::System => {
            Ok(var("DBUS_SYSTEM_BUS_ADDRESS").unwrap_or_else(|_| SYSTEM_BUS_DEFAULT.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transports() {
        let t = parse("unix:path=/run/user/1000/bus").unwrap();
        assert_eq!(t, [Transport::Path("/run/user/1000/bus".into())]);
        let t = parse("tcp:host=localhost,port=1;unix:abstract=/tmp/dbus-x%2cy,guid=01").unwrap();
        assert_eq!(t, [Transport::Abstract("/tmp/dbus-x,y".into())]);
        let t = parse("unix:path=/a;unix:path=/b").unwrap();
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(parse("").is_err());
        assert!(parse("unix").is_err());
        assert!(parse("unix:path").is_err());
        assert!(parse("unix:path=/a,abstract=b").is_err());
        assert!(parse("unix:path=%zz").is_err());
        assert!(parse("unix:dir=/tmp").is_err());
    }

    #[test]
    fn bus_kinds() {
        assert_eq!("system".parse::<BusKind>().unwrap(), BusKind::System);
        assert!("other".parse::<BusKind>().is_err());
        assert_eq!(BusKind::Session.to_string(), "session");
    }
}
