//! An in-process message bus for tests.
//!
//! The broker runs on its own thread with a current-thread runtime so that blocking
//! and cooperative clients can use it alike. It implements the parts of
//! `org.freedesktop.DBus` the library uses and routes messages by destination and
//! match rule. Unix fd passing is declined.

#![allow(dead_code)]

use {
    buslane::{
        wire::{frame_length, MessageType},
        Connection, ConnectionBuilder, MatchRule, Message, ObjectPath,
    },
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        num::NonZeroU32,
        os::unix::net::UnixStream as StdUnixStream,
        sync::{
            atomic::{AtomicUsize, Ordering::Relaxed},
            Arc,
        },
        thread::JoinHandle,
        time::Duration,
    },
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{unix::OwnedReadHalf, UnixStream},
        sync::mpsc::{self, UnboundedSender},
    },
};

const DBUS: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
struct State {
    next_client: u32,
    serial: u32,
    clients: HashMap<String, UnboundedSender<Vec<u8>>>,
    names: HashMap<String, String>,
    rules: Vec<(String, MatchRule)>,
    /// Every message sent by a client to another client, in order.
    routed: Vec<Message>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    add_match: AtomicUsize,
    remove_match: AtomicUsize,
}

pub struct Broker {
    shared: Arc<Shared>,
    streams: Option<UnboundedSender<StdUnixStream>>,
    thread: Option<JoinHandle<()>>,
}

impl Broker {
    pub fn start() -> Self {
        init_logger();
        let shared = Arc::new(Shared::default());
        let (send, mut recv) = mpsc::unbounded_channel::<StdUnixStream>();
        let thread = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                rt.block_on(async move {
                    while let Some(stream) = recv.recv().await {
                        tokio::spawn(client(stream, shared.clone()));
                    }
                });
            })
        };
        Self {
            shared,
            streams: Some(send),
            thread: Some(thread),
        }
    }

    /// Returns the client end of a new connection to the broker.
    pub fn socket(&self) -> StdUnixStream {
        let (client, server) = StdUnixStream::pair().unwrap();
        self.streams.as_ref().unwrap().send(server).unwrap();
        client
    }

    pub fn builder(&self) -> ConnectionBuilder {
        ConnectionBuilder::stream(self.socket()).timeout(Duration::from_secs(5))
    }

    pub async fn connect(&self) -> Connection {
        self.builder().build().await.unwrap()
    }

    pub fn connect_blocking(&self) -> Connection {
        self.builder().build_blocking().unwrap()
    }

    pub fn add_match_count(&self) -> usize {
        self.shared.add_match.load(Relaxed)
    }

    pub fn remove_match_count(&self) -> usize {
        self.shared.remove_match.load(Relaxed)
    }

    /// The number of match rules currently installed by all clients.
    pub fn rule_count(&self) -> usize {
        self.shared.state.lock().rules.len()
    }

    /// Messages clients have sent to each other so far.
    pub fn routed(&self) -> Vec<Message> {
        self.shared.state.lock().routed.clone()
    }

    /// Writes `bytes` to the connection of `unique_name` as they are.
    pub fn send_raw(&self, unique_name: &str, bytes: Vec<u8>) {
        let state = self.shared.state.lock();
        state.clients[unique_name].send(bytes).unwrap();
    }

    /// Closes the broker side of the connection of `unique_name`.
    pub fn disconnect(&self, unique_name: &str) {
        self.shared.unregister(unique_name);
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.streams.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn authenticate(
    read: &mut OwnedReadHalf,
    write: &UnboundedSender<Vec<u8>>,
    buf: &mut Vec<u8>,
) -> bool {
    let mut nul = false;
    loop {
        if !nul && !buf.is_empty() {
            if buf[0] != 0 {
                return false;
            }
            buf.remove(0);
            nul = true;
        }
        if nul {
            if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = buf.drain(..pos + 2).collect();
                let line = String::from_utf8_lossy(&line[..pos]).into_owned();
                let reply: &[u8] = if line.starts_with("AUTH EXTERNAL") {
                    b"OK 0123456789abcdef0123456789abcdef\r\n"
                } else if line == "BEGIN" {
                    return true;
                } else {
                    b"ERROR\r\n"
                };
                if write.send(reply.to_vec()).is_err() {
                    return false;
                }
                continue;
            }
        }
        let mut chunk = [0u8; 4096];
        match read.read(&mut chunk).await {
            Ok(0) | Err(_) => return false,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

async fn client(stream: StdUnixStream, shared: Arc<Shared>) {
    stream.set_nonblocking(true).unwrap();
    let stream = UnixStream::from_std(stream).unwrap();
    let (mut read, mut write) = stream.into_split();
    let (send, mut recv) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(bytes) = recv.recv().await {
            if write.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });
    let mut buf = vec![];
    if !authenticate(&mut read, &send, &mut buf).await {
        return;
    }
    let name = shared.register(send);
    'outer: loop {
        loop {
            let len = match frame_length(&buf) {
                Ok(Some(len)) if buf.len() >= len => len,
                Ok(_) => break,
                Err(_) => break 'outer,
            };
            let frame: Vec<u8> = buf.drain(..len).collect();
            match Message::decode(&frame, vec![]) {
                Ok(msg) => shared.handle(&name, msg),
                Err(_) => break 'outer,
            }
        }
        let mut chunk = [0u8; 4096];
        match read.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    shared.unregister(&name);
}

fn dbus_path() -> ObjectPath {
    ObjectPath::new(DBUS_PATH).unwrap()
}

impl State {
    fn serial(&mut self) -> NonZeroU32 {
        self.serial += 1;
        NonZeroU32::new(self.serial).unwrap()
    }

    fn owner(&self, name: &str) -> Option<String> {
        if name.starts_with(':') {
            return self.clients.contains_key(name).then(|| name.to_string());
        }
        self.names.get(name).cloned()
    }

    fn deliver(&self, to: &str, msg: &Message, serial: NonZeroU32) {
        if let Some(client) = self.clients.get(to) {
            let (bytes, _) = msg.encode(serial).unwrap();
            let _ = client.send(bytes);
        }
    }

    fn reply(&mut self, msg: Message) {
        let msg = msg.with_sender(DBUS);
        let serial = self.serial();
        if let Some(to) = msg.destination().map(|d| d.to_string()) {
            self.deliver(&to, &msg, serial);
        }
    }

    fn broadcast(&self, msg: &Message, serial: NonZeroU32) {
        let mut targets: Vec<&str> = vec![];
        for (client, rule) in &self.rules {
            if targets.contains(&client.as_str()) {
                continue;
            }
            let rule = match rule.get_sender() {
                Some(s) if !s.starts_with(':') && s != DBUS => match self.names.get(s) {
                    Some(owner) => rule.clone().sender(owner),
                    None => continue,
                },
                _ => rule.clone(),
            };
            if rule.matches(msg) {
                targets.push(client);
            }
        }
        for target in targets {
            self.deliver(target, msg, serial);
        }
    }

    fn name_owner_changed(&mut self, name: &str, old: &str, new: &str) {
        let msg = Message::signal(dbus_path(), DBUS, "NameOwnerChanged")
            .with_sender(DBUS)
            .with_args((name.to_string(), old.to_string(), new.to_string()));
        let serial = self.serial();
        self.broadcast(&msg, serial);
    }
}

impl Shared {
    fn register(&self, send: UnboundedSender<Vec<u8>>) -> String {
        let mut state = self.state.lock();
        state.next_client += 1;
        let name = format!(":1.{}", state.next_client);
        state.clients.insert(name.clone(), send);
        name
    }

    fn unregister(&self, name: &str) {
        let mut state = self.state.lock();
        if state.clients.remove(name).is_none() {
            return;
        }
        state.rules.retain(|(c, _)| c != name);
        let owned: Vec<String> = state
            .names
            .iter()
            .filter(|(_, o)| *o == name)
            .map(|(n, _)| n.clone())
            .collect();
        for n in owned {
            state.names.remove(&n);
            state.name_owner_changed(&n, name, "");
        }
    }

    fn handle(&self, me: &str, msg: Message) {
        let msg = msg.with_sender(me);
        if msg.destination() == Some(DBUS) {
            self.bus_method(me, msg);
            return;
        }
        let mut state = self.state.lock();
        let Some(serial) = NonZeroU32::new(msg.serial()) else {
            return;
        };
        state.routed.push(msg.clone());
        match msg.destination() {
            Some(dest) => match state.owner(dest) {
                Some(to) => state.deliver(&to, &msg, serial),
                None if msg.kind() == MessageType::MethodCall && msg.expects_reply() => {
                    let reply = Message::error(
                        &msg,
                        "org.freedesktop.DBus.Error.ServiceUnknown",
                        &format!("The name {dest} is not owned"),
                    );
                    state.reply(reply);
                }
                None => {}
            },
            None if msg.kind() == MessageType::Signal => state.broadcast(&msg, serial),
            None => {}
        }
    }

    fn bus_method(&self, me: &str, msg: Message) {
        let mut state = self.state.lock();
        let member = msg.member().unwrap_or_default().to_string();
        let reply = match &*member {
            "Hello" => Message::method_return(&msg).with_args((me.to_string(),)),
            "RequestName" => {
                let (name, flags) = msg.args::<(String, u32)>().unwrap();
                let code: u32 = match state.names.get(&name).cloned() {
                    None => {
                        state.names.insert(name.clone(), me.to_string());
                        state.name_owner_changed(&name, "", me);
                        1
                    }
                    Some(owner) if owner == me => 4,
                    Some(_) if flags & 4 != 0 => 3,
                    Some(_) => 2,
                };
                Message::method_return(&msg).with_args((code,))
            }
            "ReleaseName" => {
                let (name,) = msg.args::<(String,)>().unwrap();
                let code: u32 = match state.names.get(&name).cloned() {
                    Some(owner) if owner == me => {
                        state.names.remove(&name);
                        state.name_owner_changed(&name, me, "");
                        1
                    }
                    Some(_) => 3,
                    None => 2,
                };
                Message::method_return(&msg).with_args((code,))
            }
            "GetNameOwner" => {
                let (name,) = msg.args::<(String,)>().unwrap();
                match state.owner(&name) {
                    Some(owner) => Message::method_return(&msg).with_args((owner,)),
                    None => Message::error(
                        &msg,
                        "org.freedesktop.DBus.Error.NameHasNoOwner",
                        &format!("Could not get the owner of {name}"),
                    ),
                }
            }
            "NameHasOwner" => {
                let (name,) = msg.args::<(String,)>().unwrap();
                let has = state.owner(&name).is_some();
                Message::method_return(&msg).with_args((has,))
            }
            "ListNames" => {
                let mut names = vec![DBUS.to_string()];
                names.extend(state.clients.keys().cloned());
                names.extend(state.names.keys().cloned());
                Message::method_return(&msg).with_args((names,))
            }
            "AddMatch" => {
                self.add_match.fetch_add(1, Relaxed);
                let (rule,) = msg.args::<(String,)>().unwrap();
                match rule.parse::<MatchRule>() {
                    Ok(rule) => {
                        state.rules.push((me.to_string(), rule));
                        Message::method_return(&msg)
                    }
                    Err(_) => Message::error(
                        &msg,
                        "org.freedesktop.DBus.Error.MatchRuleInvalid",
                        "Invalid match rule",
                    ),
                }
            }
            "RemoveMatch" => {
                self.remove_match.fetch_add(1, Relaxed);
                let (rule,) = msg.args::<(String,)>().unwrap();
                let pos = state
                    .rules
                    .iter()
                    .position(|(c, r)| c == me && r.to_string() == rule);
                match pos {
                    Some(pos) => {
                        state.rules.remove(pos);
                        Message::method_return(&msg)
                    }
                    None => Message::error(
                        &msg,
                        "org.freedesktop.DBus.Error.MatchRuleNotFound",
                        "The rule is not installed",
                    ),
                }
            }
            _ => Message::error(
                &msg,
                "org.freedesktop.DBus.Error.UnknownMethod",
                &format!("Unknown method {member}"),
            ),
        };
        if msg.expects_reply() {
            state.reply(reply);
        }
    }
}

/// Polls `f` until it returns true or a second has passed.
pub fn wait_until(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Like [wait_until] without blocking the runtime.
pub async fn eventually(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
