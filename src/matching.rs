//! Match rules and the registry that maps incoming signals to subscribers.

use {
    crate::{
        error::{Error, ERR_MATCH_RULE_INVALID},
        signal::SignalQueue,
    },
    ahash::AHashMap,
    buslane_wire::{
        names::{is_valid_bus_name, is_valid_interface_name, is_valid_member_name, is_valid_unique_name},
        Message, MessageType, ObjectPath, Value,
    },
    indexmap::IndexMap,
    isnt::std_1::primitive::IsntStrExt,
    std::{
        collections::BTreeMap,
        fmt::{self, Display, Formatter, Write},
        str::FromStr,
        collections::hash_map::Entry,
        sync::Arc,
    },
    tokio::sync::watch,
};

const MAX_ARG: u8 = 63;

/// A filter selecting messages routed to this connection.
///
/// Rules are installed on the bus with `AddMatch` and evaluated locally to route
/// received signals to subscribers. The `Display` implementation produces the
/// canonical form used to deduplicate rules.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchRule {
    kind: Option<MessageType>,
    sender: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    path: Option<ObjectPath>,
    path_namespace: Option<ObjectPath>,
    destination: Option<String>,
    args: BTreeMap<u8, String>,
    arg_paths: BTreeMap<u8, String>,
    arg0_namespace: Option<String>,
}

fn invalid(msg: String) -> Error {
    Error::custom(ERR_MATCH_RULE_INVALID, msg)
}

impl MatchRule {
    pub fn new() -> Self {
        Self::default()
    }

    /// A rule matching signals.
    pub fn signal() -> Self {
        Self::new().kind(MessageType::Signal)
    }

    /// A rule matching a single signal of an interface.
    pub fn for_signal(interface: &str, member: &str) -> Self {
        Self::signal().interface(interface).member(member)
    }

    pub fn kind(mut self, kind: MessageType) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_string());
        self
    }

    pub fn member(mut self, member: &str) -> Self {
        self.member = Some(member.to_string());
        self
    }

    pub fn path(mut self, path: ObjectPath) -> Self {
        self.path = Some(path);
        self
    }

    /// Matches the path and all of its descendants.
    pub fn path_namespace(mut self, path: ObjectPath) -> Self {
        self.path_namespace = Some(path);
        self
    }

    pub fn destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_string());
        self
    }

    /// Requires the string argument at `idx` to equal `value`.
    pub fn arg(mut self, idx: u8, value: &str) -> Self {
        self.args.insert(idx, value.to_string());
        self
    }

    /// Requires the string or object path argument at `idx` to be path-related to `value`.
    pub fn arg_path(mut self, idx: u8, value: &str) -> Self {
        self.arg_paths.insert(idx, value.to_string());
        self
    }

    /// Requires the first argument to be a bus name in the namespace `namespace`.
    pub fn arg0_namespace(mut self, namespace: &str) -> Self {
        self.arg0_namespace = Some(namespace.to_string());
        self
    }

    pub fn get_sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn get_interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn get_member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn get_path(&self) -> Option<&ObjectPath> {
        self.path.as_ref()
    }

    /// The sender if it is a well-known name that has to be resolved to its owner.
    pub(crate) fn well_known_sender(&self) -> Option<&str> {
        self.sender
            .as_deref()
            .filter(|s| !s.starts_with(':') && *s != crate::bus::DBUS_NAME)
    }

    /// Checks the names used by the rule.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(s) = &self.sender {
            if !is_valid_bus_name(s) {
                return Err(invalid(format!("invalid sender `{s}`")));
            }
        }
        if let Some(i) = &self.interface {
            if !is_valid_interface_name(i) {
                return Err(invalid(format!("invalid interface `{i}`")));
            }
        }
        if let Some(m) = &self.member {
            if !is_valid_member_name(m) {
                return Err(invalid(format!("invalid member `{m}`")));
            }
        }
        if let Some(d) = &self.destination {
            if !is_valid_unique_name(d) {
                return Err(invalid(format!("destination `{d}` is not a unique name")));
            }
        }
        if self.path.is_some() && self.path_namespace.is_some() {
            return Err(invalid("path and path_namespace are mutually exclusive".into()));
        }
        if let Some(idx) = self.args.keys().chain(self.arg_paths.keys()).find(|i| **i > MAX_ARG) {
            return Err(invalid(format!("argument index {idx} is out of range")));
        }
        if self.arg0_namespace.is_some() && (self.args.contains_key(&0) || self.arg_paths.contains_key(&0)) {
            return Err(invalid("arg0namespace conflicts with another arg0 condition".into()));
        }
        Ok(())
    }

    /// Returns whether `msg` matches the rule.
    ///
    /// A well-known sender only matches messages sent under that name. Use
    /// subscriptions to match messages sent by the current owner.
    pub fn matches(&self, msg: &Message) -> bool {
        self.matches_with_owner(msg, None)
    }

    fn matches_with_owner(&self, msg: &Message, owner: Option<&str>) -> bool {
        if let Some(kind) = self.kind {
            if msg.kind() != kind {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            let actual = msg.sender();
            if actual != Some(sender) && (owner.is_none() || actual != owner) {
                return false;
            }
        }
        if self.interface.is_some() && msg.interface() != self.interface.as_deref() {
            return false;
        }
        if self.member.is_some() && msg.member() != self.member.as_deref() {
            return false;
        }
        if self.destination.is_some() && msg.destination() != self.destination.as_deref() {
            return false;
        }
        if let Some(path) = &self.path {
            if msg.path() != Some(path) {
                return false;
            }
        }
        if let Some(ns) = &self.path_namespace {
            match msg.path() {
                Some(p) if p == ns || ns.is_ancestor_of(p) => {}
                _ => return false,
            }
        }
        let body = msg.body();
        for (idx, value) in &self.args {
            match body.get(*idx as usize) {
                Some(Value::String(s)) if s == value => {}
                _ => return false,
            }
        }
        for (idx, value) in &self.arg_paths {
            let actual = match body.get(*idx as usize) {
                Some(Value::String(s)) => s.as_str(),
                Some(Value::ObjectPath(p)) => p.as_str(),
                _ => return false,
            };
            if !paths_related(actual, value) {
                return false;
            }
        }
        if let Some(ns) = &self.arg0_namespace {
            match body.first() {
                Some(Value::String(s))
                    if s == ns
                        || (s.starts_with(ns.as_str()) && s.as_bytes().get(ns.len()) == Some(&b'.')) => {}
                _ => return false,
            }
        }
        true
    }
}

fn paths_related(a: &str, b: &str) -> bool {
    a == b || (a.ends_with('/') && b.starts_with(a)) || (b.ends_with('/') && a.starts_with(b))
}

fn write_value(f: &mut Formatter<'_>, v: &str) -> fmt::Result {
    f.write_char('\'')?;
    for (i, part) in v.split('\'').enumerate() {
        if i > 0 {
            f.write_str("'\\''")?;
        }
        f.write_str(part)?;
    }
    f.write_char('\'')
}

impl Display for MatchRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut pair = |f: &mut Formatter<'_>, key: &str, value: &str| {
            if !first {
                f.write_char(',')?;
            }
            first = false;
            f.write_str(key)?;
            f.write_char('=')?;
            write_value(f, value)
        };
        if let Some(kind) = self.kind {
            pair(f, "type", kind.as_str())?;
        }
        if let Some(v) = &self.sender {
            pair(f, "sender", v)?;
        }
        if let Some(v) = &self.interface {
            pair(f, "interface", v)?;
        }
        if let Some(v) = &self.member {
            pair(f, "member", v)?;
        }
        if let Some(v) = &self.path {
            pair(f, "path", v)?;
        }
        if let Some(v) = &self.path_namespace {
            pair(f, "path_namespace", v)?;
        }
        if let Some(v) = &self.destination {
            pair(f, "destination", v)?;
        }
        for (idx, v) in &self.args {
            pair(f, &format!("arg{idx}"), v)?;
        }
        for (idx, v) in &self.arg_paths {
            pair(f, &format!("arg{idx}path"), v)?;
        }
        if let Some(v) = &self.arg0_namespace {
            pair(f, "arg0namespace", v)?;
        }
        Ok(())
    }
}

fn split_pairs(s: &str) -> Result<Vec<(String, String)>, Error> {
    let mut pairs = vec![];
    let mut chars = s.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            return Ok(pairs);
        }
        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(c) => key.push(c),
                None => return Err(invalid(format!("`{key}` has no value"))),
            }
        }
        let mut value = String::new();
        let mut quoted = false;
        loop {
            match chars.next() {
                None => break,
                Some('\'') => quoted = !quoted,
                Some('\\') if !quoted && chars.peek() == Some(&'\'') => {
                    chars.next();
                    value.push('\'');
                }
                Some(',') if !quoted => break,
                Some(c) => value.push(c),
            }
        }
        if quoted {
            return Err(invalid(format!("unterminated quote in the value of `{key}`")));
        }
        pairs.push((key.trim().to_string(), value));
    }
}

impl FromStr for MatchRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rule = MatchRule::new();
        for (key, value) in split_pairs(s)? {
            match &*key {
                "type" => {
                    let kind = match &*value {
                        "method_call" => MessageType::MethodCall,
                        "method_return" => MessageType::MethodReturn,
                        "error" => MessageType::Error,
                        "signal" => MessageType::Signal,
                        _ => return Err(invalid(format!("unknown message type `{value}`"))),
                    };
                    rule.kind = Some(kind);
                }
                "sender" => rule.sender = Some(value),
                "interface" => rule.interface = Some(value),
                "member" => rule.member = Some(value),
                "path" => rule.path = Some(ObjectPath::new(value)?),
                "path_namespace" => rule.path_namespace = Some(ObjectPath::new(value)?),
                "destination" => rule.destination = Some(value),
                "arg0namespace" => rule.arg0_namespace = Some(value),
                k if k.starts_with("arg") => {
                    let rest = &k[3..];
                    let (digits, path) = match rest.strip_suffix("path") {
                        Some(d) => (d, true),
                        None => (rest, false),
                    };
                    let idx = match digits.parse::<u8>() {
                        Ok(i) if digits.is_not_empty() && i <= MAX_ARG => i,
                        _ => return Err(invalid(format!("unknown key `{k}`"))),
                    };
                    match path {
                        true => rule.arg_paths.insert(idx, value),
                        false => rule.args.insert(idx, value),
                    };
                }
                k => return Err(invalid(format!("unknown key `{k}`"))),
            }
        }
        rule.validate()?;
        Ok(rule)
    }
}

/// What a new subscriber has to do before its rule is active on the bus.
pub(crate) enum Install {
    /// The rule is already installed.
    Ready,
    /// The caller has to send `AddMatch` for this rule and report the outcome.
    Add(String),
    /// Another subscriber is installing the rule. The receiver yields the outcome.
    Wait(String, watch::Receiver<Option<bool>>),
}

struct Rule {
    refs: usize,
    /// `None` while `AddMatch` is in flight, then whether it succeeded.
    installed: watch::Sender<Option<bool>>,
}

struct Subscriber {
    rule: MatchRule,
    canonical: String,
    owner: Option<String>,
    queue: Arc<SignalQueue>,
}

/// The subscriptions of a connection.
///
/// Rules are reference counted by their canonical form so that each distinct rule is
/// installed on the bus once.
#[derive(Default)]
pub(crate) struct MatchRegistry {
    next_id: u64,
    rules: AHashMap<String, Rule>,
    subscribers: IndexMap<u64, Subscriber>,
}

impl MatchRegistry {
    /// Adds a subscriber. Returns its id and how its rule gets installed.
    ///
    /// A rule whose previous installation failed is handed out for installation again.
    pub fn subscribe(&mut self, rule: MatchRule, queue: Arc<SignalQueue>) -> (u64, Install) {
        self.next_id += 1;
        let id = self.next_id;
        let canonical = rule.to_string();
        let install = match self.rules.entry(canonical.clone()) {
            Entry::Vacant(e) => {
                e.insert(Rule {
                    refs: 1,
                    installed: watch::Sender::new(None),
                });
                Install::Add(canonical.clone())
            }
            Entry::Occupied(mut e) => {
                let rule = e.get_mut();
                rule.refs += 1;
                let state = *rule.installed.borrow();
                match state {
                    Some(true) => Install::Ready,
                    Some(false) => {
                        rule.installed.send_replace(None);
                        Install::Add(canonical.clone())
                    }
                    None => Install::Wait(canonical.clone(), rule.installed.subscribe()),
                }
            }
        };
        self.subscribers.insert(
            id,
            Subscriber {
                rule,
                canonical,
                owner: None,
                queue,
            },
        );
        (id, install)
    }

    /// Records the outcome of `AddMatch` and wakes subscribers waiting for it.
    pub fn finish_install(&mut self, canonical: &str, installed: bool) {
        if let Some(rule) = self.rules.get(canonical) {
            rule.installed.send_replace(Some(installed));
        }
    }

    /// `None` if the rule has no subscribers, otherwise its installation state.
    pub fn install_state(&self, canonical: &str) -> Option<Option<bool>> {
        self.rules.get(canonical).map(|r| *r.installed.borrow())
    }

    /// Removes a subscriber. Returns the rule to remove if it has no users left.
    pub fn unsubscribe(&mut self, id: u64) -> Option<String> {
        let sub = self.subscribers.shift_remove(&id)?;
        let rule = self.rules.get_mut(&sub.canonical)?;
        rule.refs -= 1;
        if rule.refs > 0 {
            return None;
        }
        self.rules.remove(&sub.canonical);
        Some(sub.canonical)
    }

    pub fn set_owner(&mut self, id: u64, owner: String) {
        if let Some(sub) = self.subscribers.get_mut(&id) {
            sub.owner = Some(owner);
        }
    }

    pub fn name_owner_changed(&mut self, name: &str, new_owner: &str) {
        for sub in self.subscribers.values_mut() {
            if sub.rule.sender.as_deref() == Some(name) {
                sub.owner = new_owner.is_not_empty().then(|| new_owner.to_string());
            }
        }
    }

    /// The queues of all subscribers matching `msg`, in subscription order.
    pub fn matching(&self, msg: &Message) -> Vec<Arc<SignalQueue>> {
        self.subscribers
            .values()
            .filter(|s| s.rule.matches_with_owner(msg, s.owner.as_deref()))
            .map(|s| s.queue.clone())
            .collect()
    }

    /// The number of distinct rules with subscribers.
    #[cfg(test)]
    pub fn installed(&self) -> usize {
        self.rules.len()
    }

    /// Removes all subscribers and returns their queues.
    pub fn clear(&mut self) -> Vec<Arc<SignalQueue>> {
        self.rules.clear();
        self.subscribers.drain(..).map(|(_, s)| s.queue).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(path: &str, iface: &str, member: &str) -> Message {
        Message::signal(ObjectPath::new(path).unwrap(), iface, member).with_sender(":1.7")
    }

    #[test]
    fn canonical_form() {
        let rule = MatchRule::for_signal("org.example.I", "Changed")
            .sender("org.example")
            .path(ObjectPath::new("/a").unwrap())
            .arg(1, "it's");
        assert_eq!(
            rule.to_string(),
            "type='signal',sender='org.example',interface='org.example.I',member='Changed',path='/a',arg1='it'\\''s'"
        );
        let parsed: MatchRule = rule.to_string().parse().unwrap();
        assert_eq!(parsed, rule);
    }

    #[test]
    fn parses_unquoted_values() {
        let rule: MatchRule = "member=Foo, type='signal',arg2path=/x/".parse().unwrap();
        assert_eq!(rule, MatchRule::signal().member("Foo").arg_path(2, "/x/"));
        assert!("bogus='x'".parse::<MatchRule>().is_err());
        assert!("arg64='x'".parse::<MatchRule>().is_err());
        assert!("member='x".parse::<MatchRule>().is_err());
        assert!("path='/a',path_namespace='/b'".parse::<MatchRule>().is_err());
    }

    #[test]
    fn matches_header_fields() {
        let rule = MatchRule::for_signal("org.example.I", "Changed");
        assert!(rule.matches(&signal("/", "org.example.I", "Changed")));
        assert!(!rule.matches(&signal("/", "org.example.I", "Other")));
        assert!(!rule.matches(&signal("/", "org.example.J", "Changed")));
        let rule = MatchRule::signal().path_namespace(ObjectPath::new("/a").unwrap());
        assert!(rule.matches(&signal("/a", "x.y", "Z")));
        assert!(rule.matches(&signal("/a/b", "x.y", "Z")));
        assert!(!rule.matches(&signal("/ab", "x.y", "Z")));
        let rule = MatchRule::signal().sender(":1.8");
        assert!(!rule.matches(&signal("/", "x.y", "Z")));
    }

    #[test]
    fn matches_arguments() {
        let msg = signal("/", "x.y", "Z").with_args(("org.example.Foo".to_string(), "/a/b".to_string()));
        assert!(MatchRule::new().arg(0, "org.example.Foo").matches(&msg));
        assert!(!MatchRule::new().arg(0, "org.example").matches(&msg));
        assert!(MatchRule::new().arg0_namespace("org.example").matches(&msg));
        assert!(!MatchRule::new().arg0_namespace("org.ex").matches(&msg));
        assert!(MatchRule::new().arg_path(1, "/a/").matches(&msg));
        assert!(!MatchRule::new().arg_path(1, "/a").matches(&msg));
        assert!(!MatchRule::new().arg(5, "x").matches(&msg));
    }

    #[test]
    fn rules_are_reference_counted() {
        let mut registry = MatchRegistry::default();
        let rule = MatchRule::for_signal("org.example.I", "Changed");
        let mut ids = vec![];
        let mut adds = 0;
        for _ in 0..3 {
            let (id, install) = registry.subscribe(rule.clone(), Arc::new(SignalQueue::new(4)));
            adds += matches!(install, Install::Add(_)) as usize;
            ids.push(id);
        }
        assert_eq!(adds, 1);
        assert_eq!(registry.installed(), 1);
        let removes: Vec<_> = ids.into_iter().filter_map(|id| registry.unsubscribe(id)).collect();
        assert_eq!(removes, [rule.to_string()]);
        assert_eq!(registry.installed(), 0);
    }

    #[test]
    fn well_known_senders_use_the_owner() {
        let mut registry = MatchRegistry::default();
        let rule = MatchRule::signal().sender("org.example");
        let (id, _) = registry.subscribe(rule, Arc::new(SignalQueue::new(4)));
        let msg = signal("/", "x.y", "Z");
        assert!(registry.matching(&msg).is_empty());
        registry.set_owner(id, ":1.7".into());
        assert_eq!(registry.matching(&msg).len(), 1);
        registry.name_owner_changed("org.example", "");
        assert!(registry.matching(&msg).is_empty());
    }

    #[test]
    fn later_subscribers_wait_for_the_installation() {
        let mut registry = MatchRegistry::default();
        let rule = MatchRule::for_signal("org.example.I", "Changed");
        let canonical = rule.to_string();
        let (_, first) = registry.subscribe(rule.clone(), Arc::new(SignalQueue::new(4)));
        assert!(matches!(first, Install::Add(ref c) if *c == canonical));
        let (_, second) = registry.subscribe(rule.clone(), Arc::new(SignalQueue::new(4)));
        let Install::Wait(_, outcome) = second else {
            panic!("second subscriber did not wait");
        };
        assert_eq!(*outcome.borrow(), None);
        assert_eq!(registry.install_state(&canonical), Some(None));
        registry.finish_install(&canonical, true);
        assert_eq!(*outcome.borrow(), Some(true));
        let (_, third) = registry.subscribe(rule, Arc::new(SignalQueue::new(4)));
        assert!(matches!(third, Install::Ready));
    }

    #[test]
    fn failed_installations_are_retried() {
        let mut registry = MatchRegistry::default();
        let rule = MatchRule::for_signal("org.example.I", "Changed");
        let canonical = rule.to_string();
        let (first, _) = registry.subscribe(rule.clone(), Arc::new(SignalQueue::new(4)));
        let (_, second) = registry.subscribe(rule.clone(), Arc::new(SignalQueue::new(4)));
        let Install::Wait(_, outcome) = second else {
            panic!("second subscriber did not wait");
        };
        registry.finish_install(&canonical, false);
        assert_eq!(*outcome.borrow(), Some(false));
        assert_eq!(registry.unsubscribe(first), None);
        let (_, third) = registry.subscribe(rule, Arc::new(SignalQueue::new(4)));
        assert!(matches!(third, Install::Add(_)));
        assert_eq!(registry.install_state(&canonical), Some(None));
    }
}
