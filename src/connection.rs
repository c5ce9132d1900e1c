use {
    crate::{
        address::{self, BusKind, Transport},
        auth,
        bus::{self, RequestNameFlags},
        error::RemoteError,
        matching::{Install, MatchRegistry, MatchRule},
        server::{self, ObjectTable},
        settings,
        signal::{SignalQueue, SignalStream},
        socket::{self, BlockingReader, BlockingWriter, Frame, FrameBuffer, Undecodable},
        Error,
    },
    ahash::AHashMap,
    buslane_wire::{Args, Flags, Message, MessageType, ObjectPath},
    error_reporter::Report,
    parking_lot::{Condvar, Mutex, MutexGuard},
    pin_project::pin_project,
    std::{
        collections::VecDeque,
        future::Future,
        mem,
        net::Shutdown,
        num::NonZeroU32,
        os::unix::net::UnixStream,
        pin::Pin,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering::Relaxed},
            Arc, OnceLock, Weak,
        },
        task::{Context, Poll},
        time::{Duration, Instant},
    },
    tokio::{
        sync::{
            mpsc::{self, UnboundedReceiver},
            oneshot,
        },
        task::JoinHandle,
        time::Sleep,
    },
};

/// How a connection performs I/O.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Calls block the calling thread until the reply arrives.
    Blocking,
    /// A driver task owns the socket and calls are futures.
    Cooperative,
}

/// A connection to a message bus.
///
/// Connections are cheap to clone. Once the last clone has been dropped, the connection
/// is closed, all pending calls fail with [Error::Disconnected] and all signal streams
/// end.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
    _holder: Arc<Holder>,
}

struct Holder(Arc<Shared>);

impl Drop for Holder {
    fn drop(&mut self) {
        self.0.kill();
    }
}

pub(crate) enum Slot {
    Async(oneshot::Sender<Result<Message, Error>>),
    Blocking(Option<Result<Message, Error>>),
}

pub(crate) struct State {
    next_serial: u32,
    pub pending: AHashMap<NonZeroU32, Slot>,
    pub objects: ObjectTable,
    pub matches: MatchRegistry,
    /// Well-known names owned by this connection and the flags they were requested with.
    pub names: AHashMap<String, RequestNameFlags>,
    tasks: Vec<JoinHandle<()>>,
    /// A thread of a blocking connection is reading from the socket.
    reading: bool,
}

impl State {
    fn new() -> Self {
        Self {
            next_serial: 1,
            pending: Default::default(),
            objects: Default::default(),
            matches: Default::default(),
            names: Default::default(),
            tasks: vec![],
            reading: false,
        }
    }
}

enum Io {
    Cooperative {
        queue: mpsc::UnboundedSender<Frame>,
    },
    Blocking {
        reader: Mutex<BlockingReader>,
        writer: Mutex<BlockingWriter>,
        outgoing: Mutex<VecDeque<Frame>>,
        control: UnixStream,
    },
}

pub(crate) struct Shared {
    id: u64,
    mode: Mode,
    pub state: Mutex<State>,
    /// Signalled whenever the reader of a blocking connection steps down and whenever
    /// a match rule installation finishes.
    wakeup: Condvar,
    killed: AtomicBool,
    unique_name: OnceLock<String>,
    unix_fd: bool,
    pub timeout: Duration,
    pub queue_capacity: usize,
    io: Io,
}

impl Shared {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Relaxed)
    }

    pub fn unique_name(&self) -> &str {
        self.unique_name.get().map(|s| &**s).unwrap_or_default()
    }

    pub fn require_mode(&self, mode: Mode) -> Result<(), Error> {
        if self.mode == mode {
            return Ok(());
        }
        let msg = match mode {
            Mode::Blocking => "blocking operation on a cooperative connection",
            Mode::Cooperative => "async operation on a blocking connection",
        };
        Err(Error::Misuse(msg.to_string()))
    }

    pub fn kill(&self) {
        if self.killed.swap(true, Relaxed) {
            return;
        }
        let (pending, queues, tasks, objects) = {
            let mut state = self.state.lock();
            (
                mem::take(&mut state.pending),
                state.matches.clear(),
                mem::take(&mut state.tasks),
                mem::take(&mut state.objects),
            )
        };
        for task in tasks {
            task.abort();
        }
        if let Io::Blocking { control, .. } = &self.io {
            let _ = control.shutdown(Shutdown::Both);
        }
        for (_, slot) in pending {
            if let Slot::Async(send) = slot {
                let _ = send.send(Err(Error::Disconnected));
            }
        }
        for queue in queues {
            queue.close();
        }
        drop(objects);
        self.wakeup.notify_all();
    }

    fn next_serial(state: &mut State) -> NonZeroU32 {
        loop {
            let serial = state.next_serial;
            state.next_serial = state.next_serial.wrapping_add(1);
            if let Some(serial) = NonZeroU32::new(serial) {
                if !state.pending.contains_key(&serial) {
                    return serial;
                }
            }
        }
    }

    fn encode(&self, msg: &Message, serial: NonZeroU32) -> Result<Frame, Error> {
        let (bytes, fds) = msg.encode(serial)?;
        if !fds.is_empty() && !self.unix_fd {
            return Err(Error::Misuse(
                "unix fd passing has not been negotiated".to_string(),
            ));
        }
        Ok(Frame { bytes, fds })
    }

    fn enqueue(&self, frame: Frame) -> Result<(), Error> {
        match &self.io {
            Io::Cooperative { queue } => queue.send(frame).map_err(|_| Error::Disconnected),
            Io::Blocking { outgoing, .. } => {
                outgoing.lock().push_back(frame);
                self.flush_blocking()
            }
        }
    }

    /// Sends a message without waiting for a reply.
    pub fn send(&self, msg: &Message) -> Result<NonZeroU32, Error> {
        if self.is_killed() {
            return Err(Error::Disconnected);
        }
        let serial = Self::next_serial(&mut self.state.lock());
        let frame = self.encode(msg, serial)?;
        self.enqueue(frame)?;
        Ok(serial)
    }

    fn start_call(&self, msg: &Message, slot: Slot) -> Result<NonZeroU32, Error> {
        if self.is_killed() {
            return Err(Error::Disconnected);
        }
        let serial = {
            let mut state = self.state.lock();
            let serial = Self::next_serial(&mut state);
            state.pending.insert(serial, slot);
            serial
        };
        let res = self
            .encode(msg, serial)
            .and_then(|frame| self.enqueue(frame));
        if let Err(e) = res {
            self.state.lock().pending.remove(&serial);
            return Err(e);
        }
        Ok(serial)
    }

    pub fn call<T>(
        self: &Arc<Self>,
        msg: &Message,
        timeout: Option<Duration>,
        decode: fn(Message) -> Result<T, Error>,
    ) -> CallFuture<T> {
        let (send, recv) = oneshot::channel();
        let mut call = PendingCall {
            shared: Arc::downgrade(self),
            serial: None,
        };
        let res = self
            .require_mode(Mode::Cooperative)
            .and_then(|_| self.start_call(msg, Slot::Async(send)));
        let recv = match res {
            Ok(serial) => {
                call.serial = Some(serial);
                recv
            }
            Err(e) => {
                let (send, recv) = oneshot::channel();
                let _ = send.send(Err(e));
                recv
            }
        };
        CallFuture {
            call,
            recv,
            timeout,
            sleep: None,
            decode,
        }
    }

    /// Calls a method on a blocking connection.
    ///
    /// One thread at a time reads from the socket. Other callers park on the condvar
    /// and recheck their slot whenever the reader steps down. The reader role is not
    /// reentrant: calling this from a method handler of the same connection times out.
    pub fn call_blocking(
        self: &Arc<Self>,
        msg: &Message,
        timeout: Option<Duration>,
    ) -> Result<Message, Error> {
        self.require_mode(Mode::Blocking)?;
        let serial = self.start_call(msg, Slot::Blocking(None))?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        let res = loop {
            match state.pending.get_mut(&serial) {
                Some(Slot::Blocking(res)) => {
                    if let Some(res) = res.take() {
                        break res;
                    }
                }
                _ => break Err(Error::Disconnected),
            }
            if self.is_killed() {
                break Err(Error::Disconnected);
            }
            if deadline.is_some_and(|d| d <= Instant::now()) {
                break Err(Error::Timeout);
            }
            if state.reading {
                self.park(&mut state, deadline);
                continue;
            }
            if let Err(e) = self.read_as_reader(&mut state, deadline) {
                break Err(e);
            }
        };
        state.pending.remove(&serial);
        res
    }

    fn park(&self, state: &mut MutexGuard<'_, State>, deadline: Option<Instant>) -> bool {
        match deadline {
            Some(d) => !self.wakeup.wait_until(state, d).timed_out(),
            None => {
                self.wakeup.wait(state);
                true
            }
        }
    }

    /// Takes the reader role, reads one message with the state lock released and
    /// wakes all parked threads afterwards.
    fn read_as_reader(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, State>,
        deadline: Option<Instant>,
    ) -> Result<bool, Error> {
        state.reading = true;
        let res = MutexGuard::unlocked(state, || self.read_one(deadline));
        state.reading = false;
        self.wakeup.notify_all();
        res
    }

    fn read_one(self: &Arc<Self>, deadline: Option<Instant>) -> Result<bool, Error> {
        let Io::Blocking { reader, .. } = &self.io else {
            return Ok(false);
        };
        let res = reader.lock().read_message(deadline);
        match res {
            Ok(None) => Ok(false),
            Ok(Some(msg)) => {
                match msg {
                    Ok(msg) => self.dispatch(msg),
                    Err(bad) => self.reject(bad),
                }
                self.flush_blocking()?;
                Ok(true)
            }
            Err(e) => {
                if !self.is_killed() {
                    log::error!("Could not read from the bus: {}", Report::new(&e));
                }
                self.kill();
                Err(Error::Disconnected)
            }
        }
    }

    /// Writes all queued frames of a blocking connection.
    ///
    /// Only the writing half is locked, so this never waits for a blocked reader.
    pub fn flush_blocking(&self) -> Result<(), Error> {
        let Io::Blocking {
            writer, outgoing, ..
        } = &self.io
        else {
            return Ok(());
        };
        let mut writer = writer.lock();
        loop {
            let Some(frame) = outgoing.lock().pop_front() else {
                return Ok(());
            };
            if let Err(e) = writer.write_frame(&frame) {
                log::error!("Could not write to the bus: {}", Report::new(&e));
                self.kill();
                return Err(e);
            }
        }
    }

    /// Reads and dispatches at most one message of a blocking connection.
    ///
    /// If another thread is reading, waits for it to step down instead. Returns
    /// `false` if nothing happened before the deadline.
    pub fn process_blocking(self: &Arc<Self>, deadline: Option<Instant>) -> Result<bool, Error> {
        self.require_mode(Mode::Blocking)?;
        let mut state = self.state.lock();
        if self.is_killed() {
            return Err(Error::Disconnected);
        }
        if state.reading {
            return Ok(self.park(&mut state, deadline));
        }
        self.read_as_reader(&mut state, deadline)
    }

    /// Logs a message that could not be decoded and answers it if it was a call.
    fn reject(self: &Arc<Self>, bad: Undecodable) {
        log::warn!("Dropping an invalid message: {}", Report::new(&bad.error));
        if let Some(header) = bad.header {
            server::reject_call(self, header, bad.error);
        }
    }

    fn resolve(&self, serial: NonZeroU32, res: Result<Message, Error>) {
        let mut state = self.state.lock();
        let slot = state.pending.remove(&serial);
        match slot {
            None => log::debug!("Dropping reply to unknown or retired serial {serial}"),
            Some(Slot::Async(send)) => {
                drop(state);
                let _ = send.send(res);
            }
            Some(Slot::Blocking(_)) => {
                state.pending.insert(serial, Slot::Blocking(Some(res)));
            }
        }
    }

    pub fn dispatch(self: &Arc<Self>, msg: Message) {
        match msg.kind() {
            MessageType::MethodReturn | MessageType::Error => {
                let Some(serial) = msg.reply_serial() else {
                    return;
                };
                let res = match msg.kind() {
                    MessageType::Error => Err(Error::from_remote(RemoteError::from_message(&msg))),
                    _ => Ok(msg),
                };
                self.resolve(serial, res);
            }
            MessageType::Signal => self.dispatch_signal(msg),
            MessageType::MethodCall => server::handle_call(self, msg),
        }
    }

    fn dispatch_signal(&self, msg: Message) {
        let queues = {
            let mut state = self.state.lock();
            if msg.sender() == Some(bus::DBUS_NAME) && msg.interface() == Some(bus::DBUS_INTERFACE)
            {
                match msg.member() {
                    Some("NameLost") => {
                        if let Ok((name,)) = msg.args::<(String,)>() {
                            state.names.remove(&name);
                        }
                    }
                    Some("NameOwnerChanged") => {
                        if let Ok((name, _, new)) = msg.args::<(String, String, String)>() {
                            state.matches.name_owner_changed(&name, &new);
                        }
                    }
                    _ => {}
                }
            }
            state.matches.matching(&msg)
        };
        for queue in queues {
            queue.push(msg.clone());
        }
    }

    async fn read_task(self: Arc<Self>, stream: Arc<tokio::net::UnixStream>, max: usize) {
        let mut buf = FrameBuffer::new(max);
        loop {
            match socket::read_message(&stream, &mut buf).await {
                Ok(Ok(msg)) => self.dispatch(msg),
                Ok(Err(bad)) => self.reject(bad),
                Err(e) => {
                    if !self.is_killed() {
                        log::error!("Could not read from the bus: {}", Report::new(e));
                    }
                    break;
                }
            }
            if self.is_killed() {
                return;
            }
        }
        self.kill();
    }

    async fn write_task(
        self: Arc<Self>,
        stream: Arc<tokio::net::UnixStream>,
        mut queue: UnboundedReceiver<Frame>,
    ) {
        while let Some(frame) = queue.recv().await {
            if let Err(e) = socket::write_frame(&stream, &frame).await {
                log::error!("Could not write to the bus: {}", Report::new(e));
                break;
            }
        }
        self.kill();
    }

    fn subscription(
        self: &Arc<Self>,
        rule: &MatchRule,
    ) -> (u64, Arc<SignalQueue>, Install) {
        let queue = Arc::new(SignalQueue::new(self.queue_capacity));
        let (id, install) = self.state.lock().matches.subscribe(rule.clone(), queue.clone());
        (id, queue, install)
    }

    fn finish_install(&self, canonical: &str, installed: bool) {
        self.state.lock().matches.finish_install(canonical, installed);
        self.wakeup.notify_all();
    }

    fn install_failed(&self) -> Error {
        match self.is_killed() {
            true => Error::Disconnected,
            false => Error::failed("The match rule could not be installed"),
        }
    }

    /// Waits for another thread to finish installing a match rule.
    fn wait_installed_blocking(&self, canonical: &str) -> Result<(), Error> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();
        loop {
            match state.matches.install_state(canonical) {
                Some(Some(true)) => return Ok(()),
                Some(None) if !self.is_killed() => {}
                _ => return Err(self.install_failed()),
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            self.wakeup.wait_until(&mut state, deadline);
        }
    }

    pub async fn subscribe<T>(
        self: &Arc<Self>,
        rule: MatchRule,
        decode: fn(Message) -> Result<T, Error>,
    ) -> Result<SignalStream<T>, Error> {
        self.require_mode(Mode::Cooperative)?;
        rule.validate()?;
        if self.is_killed() {
            return Err(Error::Disconnected);
        }
        let (id, queue, install) = self.subscription(&rule);
        let mut stream = SignalStream::new(Arc::downgrade(self), id, queue, decode);
        let installed = match install {
            Install::Ready => Ok(()),
            Install::Add(canonical) => {
                let mut guard = InstallGuard {
                    shared: self,
                    canonical: Some(canonical.clone()),
                };
                let msg = bus::bus_call("AddMatch").with_args((canonical,));
                let res = self.call(&msg, Some(self.timeout), Ok).await.map(drop);
                guard.finish(res.is_ok());
                res
            }
            Install::Wait(_, mut installed) => {
                match installed.wait_for(|s| s.is_some()).await.map(|s| *s) {
                    Ok(Some(true)) => Ok(()),
                    _ => Err(self.install_failed()),
                }
            }
        };
        if let Err(e) = installed {
            log::error!("Could not add a match rule: {}", Report::new(&e));
            stream.abandon();
            return Err(e);
        }
        if let Some(sender) = rule.well_known_sender() {
            let msg = bus::bus_call("GetNameOwner").with_args((sender.to_string(),));
            match self.call(&msg, Some(self.timeout), |m| m.args::<(String,)>().map_err(Into::into)).await {
                Ok((owner,)) => self.state.lock().matches.set_owner(id, owner),
                Err(e) => log::debug!("{sender} has no owner yet: {}", Report::new(e)),
            }
        }
        Ok(stream)
    }

    pub fn subscribe_blocking<T>(
        self: &Arc<Self>,
        rule: MatchRule,
        decode: fn(Message) -> Result<T, Error>,
    ) -> Result<SignalStream<T>, Error> {
        self.require_mode(Mode::Blocking)?;
        rule.validate()?;
        if self.is_killed() {
            return Err(Error::Disconnected);
        }
        let (id, queue, install) = self.subscription(&rule);
        let mut stream = SignalStream::new(Arc::downgrade(self), id, queue, decode);
        let installed = match install {
            Install::Ready => Ok(()),
            Install::Add(canonical) => {
                let msg = bus::bus_call("AddMatch").with_args((canonical.clone(),));
                let res = self.call_blocking(&msg, Some(self.timeout)).map(drop);
                self.finish_install(&canonical, res.is_ok());
                res
            }
            Install::Wait(canonical, _) => self.wait_installed_blocking(&canonical),
        };
        if let Err(e) = installed {
            log::error!("Could not add a match rule: {}", Report::new(&e));
            stream.abandon();
            return Err(e);
        }
        if let Some(sender) = rule.well_known_sender() {
            let msg = bus::bus_call("GetNameOwner").with_args((sender.to_string(),));
            let owner = self
                .call_blocking(&msg, Some(self.timeout))
                .and_then(|m| m.args::<(String,)>().map_err(Into::into));
            match owner {
                Ok((owner,)) => self.state.lock().matches.set_owner(id, owner),
                Err(e) => log::debug!("{sender} has no owner yet: {}", Report::new(e)),
            }
        }
        Ok(stream)
    }

    /// Removes a subscription. Sends `RemoveMatch` if it was the last user of its rule.
    pub fn unsubscribe(&self, id: u64, remove_match: bool) {
        let remove = self.state.lock().matches.unsubscribe(id);
        if let (Some(rule), true) = (remove, remove_match) {
            if self.is_killed() {
                return;
            }
            let msg = bus::bus_call("RemoveMatch")
                .with_args((rule,))
                .with_flags(Flags::NO_REPLY_EXPECTED);
            if let Err(e) = self.send(&msg) {
                log::debug!("Could not remove a match rule: {}", Report::new(e));
            }
        }
    }
}

/// Marks a match rule installation as failed unless it finished.
///
/// Covers subscribe futures that are dropped while `AddMatch` is in flight.
struct InstallGuard<'a> {
    shared: &'a Shared,
    canonical: Option<String>,
}

impl InstallGuard<'_> {
    fn finish(&mut self, installed: bool) {
        if let Some(canonical) = self.canonical.take() {
            self.shared.finish_install(&canonical, installed);
        }
    }
}

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        self.finish(false);
    }
}

/// A value that can be converted into an object path.
pub trait IntoObjectPath {
    fn into_object_path(self) -> Result<ObjectPath, Error>;
}

impl IntoObjectPath for ObjectPath {
    fn into_object_path(self) -> Result<ObjectPath, Error> {
        Ok(self)
    }
}

impl IntoObjectPath for &ObjectPath {
    fn into_object_path(self) -> Result<ObjectPath, Error> {
        Ok(self.clone())
    }
}

impl IntoObjectPath for &str {
    fn into_object_path(self) -> Result<ObjectPath, Error> {
        Ok(ObjectPath::new(self)?)
    }
}

impl IntoObjectPath for String {
    fn into_object_path(self) -> Result<ObjectPath, Error> {
        Ok(ObjectPath::new(self)?)
    }
}

pub(crate) fn decode_args<R: Args>(msg: Message) -> Result<R, Error> {
    Ok(R::from_body(msg.into_body())?)
}

fn method_call(
    destination: &str,
    path: impl IntoObjectPath,
    interface: &str,
    member: &str,
) -> Result<Message, Error> {
    Ok(Message::method_call(path.into_object_path()?, member)
        .with_destination(destination)
        .with_interface(interface))
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl Connection {
    /// Opens a cooperative connection to the session bus.
    pub async fn session() -> Result<Self, Error> {
        ConnectionBuilder::session().build().await
    }

    /// Opens a cooperative connection to the system bus.
    pub async fn system() -> Result<Self, Error> {
        ConnectionBuilder::system().build().await
    }

    /// Opens a blocking connection to the session bus.
    pub fn session_blocking() -> Result<Self, Error> {
        ConnectionBuilder::session().build_blocking()
    }

    /// Opens a blocking connection to the system bus.
    pub fn system_blocking() -> Result<Self, Error> {
        ConnectionBuilder::system().build_blocking()
    }

    fn from_shared(shared: Arc<Shared>) -> Self {
        Self {
            _holder: Arc::new(Holder(shared.clone())),
            shared,
        }
    }

    /// A process-unique identifier of the connection.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The unique name assigned by the bus.
    pub fn unique_name(&self) -> &str {
        self.shared.unique_name()
    }

    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_killed()
    }

    /// Closes the connection.
    ///
    /// Pending calls fail with [Error::Disconnected] and signal streams end.
    pub fn close(&self) {
        self.shared.kill();
    }

    /// Sends a message without waiting for a reply and returns its serial.
    pub fn send(&self, msg: &Message) -> Result<NonZeroU32, Error> {
        self.shared.send(msg)
    }

    /// Emits a signal.
    pub fn send_signal(
        &self,
        path: impl IntoObjectPath,
        interface: &str,
        member: &str,
        args: impl Args,
    ) -> Result<(), Error> {
        let msg = Message::signal(path.into_object_path()?, interface, member).with_args(args);
        self.send(&msg).map(drop)
    }

    /// Calls a method and returns a future that resolves to the reply.
    ///
    /// The call is sent immediately. Dropping the future retires the call and a late
    /// reply is discarded.
    pub fn call_message(&self, msg: &Message) -> CallFuture<Message> {
        self.shared.call(msg, Some(self.shared.timeout), Ok)
    }

    /// Like [Self::call_message] but with an explicit timeout. `None` waits forever.
    pub fn call_message_with_timeout(
        &self,
        msg: &Message,
        timeout: Option<Duration>,
    ) -> CallFuture<Message> {
        self.shared.call(msg, timeout, Ok)
    }

    /// Calls a method and decodes the reply body.
    pub fn call<R: Args>(
        &self,
        destination: &str,
        path: impl IntoObjectPath,
        interface: &str,
        member: &str,
        args: impl Args,
    ) -> CallFuture<R> {
        let msg = method_call(destination, path, interface, member).map(|m| m.with_args(args));
        match msg {
            Ok(msg) => self
                .shared
                .call(&msg, Some(self.shared.timeout), decode_args::<R>),
            Err(e) => CallFuture::failed(e),
        }
    }

    /// Calls a method without expecting a reply.
    pub fn call_no_reply(
        &self,
        destination: &str,
        path: impl IntoObjectPath,
        interface: &str,
        member: &str,
        args: impl Args,
    ) -> Result<(), Error> {
        let msg = method_call(destination, path, interface, member)?
            .with_args(args)
            .with_flags(Flags::NO_REPLY_EXPECTED);
        self.send(&msg).map(drop)
    }

    /// Calls a method on a blocking connection using the connection timeout.
    pub fn call_message_blocking(&self, msg: &Message) -> Result<Message, Error> {
        self.shared.call_blocking(msg, Some(self.shared.timeout))
    }

    /// Like [Self::call_message_blocking] but with an explicit timeout.
    pub fn call_message_blocking_with_timeout(
        &self,
        msg: &Message,
        timeout: Option<Duration>,
    ) -> Result<Message, Error> {
        self.shared.call_blocking(msg, timeout)
    }

    /// Calls a method on a blocking connection and decodes the reply body.
    pub fn call_blocking<R: Args>(
        &self,
        destination: &str,
        path: impl IntoObjectPath,
        interface: &str,
        member: &str,
        args: impl Args,
    ) -> Result<R, Error> {
        let msg = method_call(destination, path, interface, member)?.with_args(args);
        decode_args(self.call_message_blocking(&msg)?)
    }

    /// Reads and dispatches one incoming message of a blocking connection.
    ///
    /// Incoming method calls are answered and signals are queued for their streams.
    /// Returns `false` if no message arrived within `timeout`.
    pub fn process_blocking(&self, timeout: Option<Duration>) -> Result<bool, Error> {
        self.shared
            .process_blocking(timeout.map(|t| Instant::now() + t))
    }

    /// Writes all queued messages of a blocking connection.
    pub fn flush_blocking(&self) -> Result<(), Error> {
        self.shared.require_mode(Mode::Blocking)?;
        self.shared.flush_blocking()
    }

    /// Subscribes to messages matching `rule`.
    ///
    /// The match rule is installed on the bus before this function returns.
    pub async fn subscribe(&self, rule: MatchRule) -> Result<SignalStream<Message>, Error> {
        self.shared.subscribe(rule, Ok).await
    }

    /// Like [Self::subscribe] for blocking connections.
    pub fn subscribe_blocking(&self, rule: MatchRule) -> Result<SignalStream<Message>, Error> {
        self.shared.subscribe_blocking(rule, Ok)
    }
}

enum Target {
    Bus(BusKind),
    Address(String),
    Stream(UnixStream),
}

/// Configures and opens a [Connection].
pub struct ConnectionBuilder {
    target: Target,
    timeout: Duration,
    signal_queue_capacity: usize,
    negotiate_unix_fd: bool,
    max_message_size: usize,
}

impl ConnectionBuilder {
    fn new(target: Target) -> Self {
        let settings = settings::get();
        Self {
            target,
            timeout: settings.call_timeout,
            signal_queue_capacity: settings.signal_queue_capacity,
            negotiate_unix_fd: settings.negotiate_unix_fd,
            max_message_size: settings.max_message_size,
        }
    }

    pub fn session() -> Self {
        Self::new(Target::Bus(BusKind::Session))
    }

    pub fn system() -> Self {
        Self::new(Target::Bus(BusKind::System))
    }

    pub fn bus(kind: BusKind) -> Self {
        Self::new(Target::Bus(kind))
    }

    /// Connects to a D-Bus address such as `unix:path=/run/user/1000/bus`.
    pub fn address(address: &str) -> Self {
        Self::new(Target::Address(address.to_string()))
    }

    /// Uses an already connected stream.
    pub fn stream(stream: UnixStream) -> Self {
        Self::new(Target::Stream(stream))
    }

    /// The timeout of method calls.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn signal_queue_capacity(mut self, capacity: usize) -> Self {
        self.signal_queue_capacity = capacity.max(1);
        self
    }

    pub fn negotiate_unix_fd(mut self, negotiate: bool) -> Self {
        self.negotiate_unix_fd = negotiate;
        self
    }

    fn connect(target: Target) -> Result<UnixStream, Error> {
        let address = match target {
            Target::Stream(s) => return Ok(s),
            Target::Bus(kind) => address::bus_address(kind)?,
            Target::Address(a) => a,
        };
        let mut last = None;
        for transport in address::parse(&address)? {
            match connect_transport(&transport) {
                Ok(s) => return Ok(s),
                Err(e) => {
                    log::debug!("Could not connect to {transport:?}: {}", Report::new(&e));
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::Address(address)))
    }

    fn shared(&self, mode: Mode, unix_fd: bool, io: Io) -> Arc<Shared> {
        Arc::new(Shared {
            id: NEXT_ID.fetch_add(1, Relaxed),
            mode,
            state: Mutex::new(State::new()),
            wakeup: Condvar::new(),
            killed: Default::default(),
            unique_name: OnceLock::new(),
            unix_fd,
            timeout: self.timeout,
            queue_capacity: self.signal_queue_capacity,
            io,
        })
    }

    /// Opens a cooperative connection.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn build(mut self) -> Result<Connection, Error> {
        let target = mem::replace(&mut self.target, Target::Address(String::new()));
        let stream = Self::connect(target)?;
        stream.set_nonblocking(true)?;
        let mut stream = tokio::net::UnixStream::from_std(stream)?;
        let uid = nix::unistd::getuid().as_raw();
        let authenticated = auth::authenticate(&mut stream, uid, self.negotiate_unix_fd).await?;
        let stream = Arc::new(stream);
        let (send, recv) = mpsc::unbounded_channel();
        let shared = self.shared(
            Mode::Cooperative,
            authenticated.unix_fd,
            Io::Cooperative { queue: send },
        );
        let conn = Connection::from_shared(shared.clone());
        {
            let read = tokio::spawn(shared.clone().read_task(stream.clone(), self.max_message_size));
            let write = tokio::spawn(shared.clone().write_task(stream, recv));
            let mut state = shared.state.lock();
            state.tasks.push(read);
            state.tasks.push(write);
        }
        let msg = bus::bus_call("Hello");
        let (name,) = shared
            .call(&msg, Some(self.timeout), decode_args::<(String,)>)
            .await?;
        log::debug!("Connected to the bus as {name}");
        let _ = shared.unique_name.set(name);
        Ok(conn)
    }

    /// Opens a blocking connection.
    pub fn build_blocking(mut self) -> Result<Connection, Error> {
        let target = mem::replace(&mut self.target, Target::Address(String::new()));
        let mut stream = Self::connect(target)?;
        stream.set_nonblocking(false)?;
        let uid = nix::unistd::getuid().as_raw();
        let authenticated = auth::authenticate_blocking(&mut stream, uid, self.negotiate_unix_fd)?;
        let control = stream.try_clone()?;
        let writer = BlockingWriter::new(stream.try_clone()?);
        let io = Io::Blocking {
            reader: Mutex::new(BlockingReader::new(stream, self.max_message_size)),
            writer: Mutex::new(writer),
            outgoing: Default::default(),
            control,
        };
        let shared = self.shared(Mode::Blocking, authenticated.unix_fd, io);
        let conn = Connection::from_shared(shared.clone());
        let msg = bus::bus_call("Hello");
        let (name,) = decode_args::<(String,)>(shared.call_blocking(&msg, Some(self.timeout))?)?;
        log::debug!("Connected to the bus as {name}");
        let _ = shared.unique_name.set(name);
        Ok(conn)
    }
}

fn connect_transport(transport: &Transport) -> Result<UnixStream, Error> {
    match transport {
        Transport::Path(p) => Ok(UnixStream::connect(p)?),
        #[cfg(target_os = "linux")]
        Transport::Abstract(name) => {
            use std::os::{linux::net::SocketAddrExt, unix::net::SocketAddr};
            let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
            Ok(UnixStream::connect_addr(&addr)?)
        }
        #[cfg(not(target_os = "linux"))]
        Transport::Abstract(_) => Err(Error::Address(
            "abstract sockets are only supported on Linux".to_string(),
        )),
    }
}

/// An in-flight method call.
///
/// Dropping this object retires the call.
struct PendingCall {
    shared: Weak<Shared>,
    serial: Option<NonZeroU32>,
}

impl PendingCall {
    fn retire(&mut self) {
        if let Some(serial) = self.serial.take() {
            if let Some(shared) = self.shared.upgrade() {
                shared.state.lock().pending.remove(&serial);
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.retire();
    }
}

/// A future representing a method call response.
#[must_use = "dropping the future cancels the call"]
#[pin_project]
pub struct CallFuture<T> {
    call: PendingCall,
    #[pin]
    recv: oneshot::Receiver<Result<Message, Error>>,
    timeout: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
    decode: fn(Message) -> Result<T, Error>,
}

impl<T> CallFuture<T> {
    pub(crate) fn failed(e: Error) -> Self {
        let (send, recv) = oneshot::channel();
        let _ = send.send(Err(e));
        Self {
            call: PendingCall {
                shared: Weak::new(),
                serial: None,
            },
            recv,
            timeout: None,
            sleep: None,
            decode: |_| Err(Error::Disconnected),
        }
    }

    /// The serial of the call, or `None` if it could not be sent or has completed.
    pub fn serial(&self) -> Option<NonZeroU32> {
        self.call.serial
    }

    /// Converts the reply with `f`.
    pub(crate) fn map<U>(self, f: fn(Message) -> Result<U, Error>) -> CallFuture<U> {
        CallFuture {
            call: self.call,
            recv: self.recv,
            timeout: self.timeout,
            sleep: self.sleep,
            decode: f,
        }
    }
}

impl<T> Future for CallFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(res) = this.recv.poll(cx) {
            this.call.serial = None;
            let res = res.unwrap_or(Err(Error::Disconnected));
            return Poll::Ready(res.and_then(*this.decode));
        }
        if let Some(timeout) = *this.timeout {
            let sleep = this
                .sleep
                .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
            if sleep.as_mut().poll(cx).is_ready() {
                this.call.retire();
                return Poll::Ready(Err(Error::Timeout));
            }
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serials_wrap_and_skip_pending() {
        let mut state = State::new();
        state.next_serial = u32::MAX;
        assert_eq!(Shared::next_serial(&mut state).get(), u32::MAX);
        assert_eq!(Shared::next_serial(&mut state).get(), 1);
        let two = NonZeroU32::new(2).unwrap();
        state.pending.insert(two, Slot::Blocking(None));
        assert_eq!(Shared::next_serial(&mut state).get(), 3);

        let max = NonZeroU32::new(u32::MAX).unwrap();
        state.pending.insert(max, Slot::Blocking(None));
        state.next_serial = u32::MAX;
        assert_eq!(Shared::next_serial(&mut state).get(), 1);
        assert_eq!(Shared::next_serial(&mut state).get(), 3);
    }
}
