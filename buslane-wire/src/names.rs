//! Validation of object paths and of bus, interface, member and error names.

use {
    crate::Error,
    std::{
        borrow::Borrow,
        fmt::{self, Display, Formatter},
        ops::Deref,
    },
};

const MAX_NAME_LEN: usize = 255;

/// A validated object path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Validates `path` and wraps it.
    pub fn new(path: impl Into<String>) -> Result<Self, Error> {
        let path = path.into();
        if !is_valid_object_path(&path) {
            return Err(Error::InvalidObjectPath(path));
        }
        Ok(Self(path))
    }

    /// Wraps a path that is known to be valid.
    pub fn from_static_unchecked(path: &'static str) -> Self {
        debug_assert!(is_valid_object_path(path));
        Self(path.to_string())
    }

    /// The root path `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Returns whether `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &ObjectPath) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// Returns the parent path, or `None` for the root.
    pub fn parent(&self) -> Option<ObjectPath> {
        if self.is_root() {
            return None;
        }
        let idx = self.0.rfind('/').unwrap_or(0);
        match idx {
            0 => Some(Self::root()),
            n => Some(Self(self.0[..n].to_string())),
        }
    }

    /// Appends a single segment.
    pub fn join(&self, segment: &str) -> Result<ObjectPath, Error> {
        match self.is_root() {
            true => Self::new(format!("/{segment}")),
            false => Self::new(format!("{}/{segment}", self.0)),
        }
    }

    /// Returns the first path segment of `descendant` below `self`.
    pub fn child_segment<'a>(&self, descendant: &'a ObjectPath) -> Option<&'a str> {
        if !self.is_ancestor_of(descendant) {
            return None;
        }
        let rest = match self.is_root() {
            true => &descendant.0[1..],
            false => &descendant.0[self.0.len() + 1..],
        };
        rest.split('/').next()
    }
}

impl Display for ObjectPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Deref for ObjectPath {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ObjectPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for ObjectPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&String> for ObjectPath {
    type Error = Error;

    fn try_from(value: &String) -> Result<Self, Self::Error> {
        Self::new(value.as_str())
    }
}

impl TryFrom<&ObjectPath> for ObjectPath {
    type Error = Error;

    fn try_from(value: &ObjectPath) -> Result<Self, Self::Error> {
        Ok(value.clone())
    }
}

pub fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/').all(|segment| {
        !segment.is_empty()
            && segment
                .bytes()
                .all(|c| c.is_ascii_alphanumeric() || c == b'_')
    })
}

fn dotted(name: &str, element: impl Fn(&str) -> bool) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let mut count = 0;
    for segment in name.split('.') {
        if !element(segment) {
            return false;
        }
        count += 1;
    }
    count >= 2
}

fn identifier(segment: &str, extra: u8) -> bool {
    let mut bytes = segment.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == b'_' || first == extra)
        && bytes.all(|c| c.is_ascii_alphanumeric() || c == b'_' || c == extra)
}

/// Validates a unique connection name such as `:1.42`.
pub fn is_valid_unique_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(':') else {
        return false;
    };
    name.len() <= MAX_NAME_LEN
        && dotted(rest, |s| {
            !s.is_empty()
                && s.bytes()
                    .all(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'-')
        })
}

/// Validates a well-known name such as `org.freedesktop.DBus`.
///
/// Hyphens are accepted as the D-Bus specification still allows them in bus names.
pub fn is_valid_well_known_name(name: &str) -> bool {
    !name.starts_with(':') && dotted(name, |s| identifier(s, b'-'))
}

pub fn is_valid_bus_name(name: &str) -> bool {
    is_valid_unique_name(name) || is_valid_well_known_name(name)
}

pub fn is_valid_interface_name(name: &str) -> bool {
    dotted(name, |s| identifier(s, b'_'))
}

pub fn is_valid_error_name(name: &str) -> bool {
    is_valid_interface_name(name)
}

pub fn is_valid_member_name(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN && identifier(name, b'_')
}

pub fn validate_bus_name(name: &str) -> Result<(), Error> {
    match is_valid_bus_name(name) {
        true => Ok(()),
        false => Err(Error::InvalidBusName(name.to_string())),
    }
}

pub fn validate_well_known_name(name: &str) -> Result<(), Error> {
    match is_valid_well_known_name(name) {
        true => Ok(()),
        false => Err(Error::InvalidBusName(name.to_string())),
    }
}

pub fn validate_interface_name(name: &str) -> Result<(), Error> {
    match is_valid_interface_name(name) {
        true => Ok(()),
        false => Err(Error::InvalidInterfaceName(name.to_string())),
    }
}

pub fn validate_member_name(name: &str) -> Result<(), Error> {
    match is_valid_member_name(name) {
        true => Ok(()),
        false => Err(Error::InvalidMemberName(name.to_string())),
    }
}

pub fn validate_error_name(name: &str) -> Result<(), Error> {
    match is_valid_error_name(name) {
        true => Ok(()),
        false => Err(Error::InvalidErrorName(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_paths() {
        for valid in ["/", "/a", "/org/freedesktop/DBus", "/a_b/C9"] {
            assert!(is_valid_object_path(valid), "{valid}");
        }
        for invalid in ["", "a", "/a/", "//", "/a//b", "/a-b", "/ä"] {
            assert!(!is_valid_object_path(invalid), "{invalid}");
        }
    }

    #[test]
    fn path_relations() {
        let root = ObjectPath::root();
        let a = ObjectPath::new("/a").unwrap();
        let ab = ObjectPath::new("/a/b").unwrap();
        let abc = ObjectPath::new("/abc").unwrap();
        assert!(root.is_ancestor_of(&a));
        assert!(a.is_ancestor_of(&ab));
        assert!(!a.is_ancestor_of(&abc));
        assert!(!a.is_ancestor_of(&a));
        assert_eq!(ab.parent(), Some(a.clone()));
        assert_eq!(a.parent(), Some(root.clone()));
        assert_eq!(root.parent(), None);
        assert_eq!(root.child_segment(&ab), Some("a"));
        assert_eq!(a.child_segment(&ab), Some("b"));
        assert_eq!(root.join("x").unwrap().as_str(), "/x");
        assert_eq!(a.join("x").unwrap().as_str(), "/a/x");
    }

    #[test]
    fn bus_names() {
        assert!(is_valid_well_known_name("org.freedesktop.DBus"));
        assert!(is_valid_well_known_name("org.example_1.x-y"));
        assert!(!is_valid_well_known_name("org"));
        assert!(!is_valid_well_known_name("org..x"));
        assert!(!is_valid_well_known_name("org.1x"));
        assert!(!is_valid_well_known_name(&format!("a.{}", "b".repeat(254))));
        assert!(is_valid_unique_name(":1.42"));
        assert!(!is_valid_unique_name(":1"));
        assert!(!is_valid_unique_name("1.42"));
        assert!(is_valid_bus_name(":1.42"));
    }

    #[test]
    fn interface_and_member_names() {
        assert!(is_valid_interface_name("org.example.interface"));
        assert!(!is_valid_interface_name("org.example-x.interface"));
        assert!(!is_valid_interface_name("interface"));
        assert!(is_valid_member_name("upper"));
        assert!(is_valid_member_name("_Get2"));
        assert!(!is_valid_member_name("2get"));
        assert!(!is_valid_member_name("a.b"));
        assert!(!is_valid_member_name(""));
        assert!(is_valid_error_name("org.freedesktop.DBus.Error.Failed"));
    }
}
