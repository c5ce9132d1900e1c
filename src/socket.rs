//! Framed message I/O on unix sockets, including fd passing.

use {
    crate::Error,
    buslane_wire::{frame_length, Fd, Header, Message},
    nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags},
    std::{
        collections::VecDeque,
        io::{self, IoSlice, IoSliceMut},
        os::{
            fd::{AsRawFd, RawFd},
            unix::net::UnixStream,
        },
        time::Instant,
    },
    tokio::io::Interest,
};

const READ_CHUNK: usize = 64 * 1024;
/// The maximum number of fds the kernel passes with a single message.
const MAX_FDS: usize = 253;

/// An encoded message together with the fds that accompany it.
pub(crate) struct Frame {
    pub bytes: Vec<u8>,
    pub fds: Vec<Fd>,
}

/// A descriptor received with `SCM_RIGHTS`. It is closed on drop.
struct ReceivedFd(RawFd);

impl AsRawFd for ReceivedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for ReceivedFd {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.0);
    }
}

/// A complete frame that could not be decoded.
pub(crate) struct Undecodable {
    /// The header, if the header itself was valid.
    pub header: Option<Header>,
    pub error: Error,
}

/// Accumulates received bytes and fds and splits them into messages.
pub(crate) struct FrameBuffer {
    buf: Vec<u8>,
    fds: VecDeque<Fd>,
    scratch: Vec<u8>,
    max_message_size: usize,
}

impl FrameBuffer {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: vec![],
            fds: VecDeque::new(),
            scratch: vec![0; READ_CHUNK],
            max_message_size,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Takes the next complete message out of the buffer.
    ///
    /// The outer error means that the stream can no longer be framed. The inner error
    /// means that a single message could not be decoded and has been discarded.
    pub fn next_message(&mut self) -> Result<Option<Result<Message, Undecodable>>, Error> {
        let Some(total) = frame_length(&self.buf)? else {
            return Ok(None);
        };
        if total > self.max_message_size {
            return Err(buslane_wire::Error::MessageTooLong(total).into());
        }
        if self.buf.len() < total {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..total).collect();
        let header = match Message::peek_header(&frame) {
            Ok(h) => h,
            Err(e) => {
                return Ok(Some(Err(Undecodable {
                    header: None,
                    error: e.into(),
                })))
            }
        };
        let n = (header.unix_fds as usize).min(self.fds.len());
        let fds = self.fds.drain(..n).collect();
        Ok(Some(Message::decode(&frame, fds).map_err(|e| Undecodable {
            header: Some(header),
            error: e.into(),
        })))
    }

    /// Performs a single `recvmsg` on `fd`. Returns the number of bytes read.
    fn recv_from(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut cmsg = nix::cmsg_space!([RawFd; MAX_FDS]);
        let (bytes, received) = {
            let mut iov = [IoSliceMut::new(&mut self.scratch)];
            let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg), MsgFlags::MSG_CMSG_CLOEXEC)?;
            let mut received = vec![];
            for c in msg.cmsgs() {
                if let ControlMessageOwned::ScmRights(fds) = c {
                    received.extend(fds);
                }
            }
            (msg.bytes, received)
        };
        for raw in received {
            self.fds.push_back(Fd::new(ReceivedFd(raw)));
        }
        self.buf.extend_from_slice(&self.scratch[..bytes]);
        Ok(bytes)
    }
}

fn send_to(fd: RawFd, bytes: &[u8], fds: &[Fd]) -> io::Result<usize> {
    let iov = [IoSlice::new(bytes)];
    let raw: Vec<RawFd> = fds.iter().map(|f| f.as_raw_fd()).collect();
    let rights = [ControlMessage::ScmRights(&raw)];
    let cmsgs: &[ControlMessage<'_>] = match raw.is_empty() {
        true => &[],
        false => &rights,
    };
    Ok(sendmsg::<()>(fd, &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None)?)
}

/// The write half of a blocking connection.
pub(crate) struct BlockingWriter {
    stream: UnixStream,
}

impl BlockingWriter {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        let fd = self.stream.as_raw_fd();
        let mut pos = 0;
        let mut fds = &frame.fds[..];
        while pos < frame.bytes.len() {
            match send_to(fd, &frame.bytes[pos..], fds) {
                Ok(n) => {
                    pos += n;
                    fds = &[];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// The read half of a blocking connection.
pub(crate) struct BlockingReader {
    stream: UnixStream,
    buf: FrameBuffer,
}

impl BlockingReader {
    pub fn new(stream: UnixStream, max_message_size: usize) -> Self {
        Self {
            stream,
            buf: FrameBuffer::new(max_message_size),
        }
    }

    /// Reads until a message is available or `deadline` passes.
    ///
    /// Returns `None` on timeout.
    pub fn read_message(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Option<Result<Message, Undecodable>>, Error> {
        loop {
            if let Some(msg) = self.buf.next_message()? {
                return Ok(Some(msg));
            }
            let timeout = match deadline {
                None => None,
                Some(d) => match d.checked_duration_since(Instant::now()) {
                    Some(t) if !t.is_zero() => Some(t),
                    _ => return Ok(None),
                },
            };
            self.stream.set_read_timeout(timeout)?;
            match self.buf.recv_from(self.stream.as_raw_fd()) {
                Ok(0) => return Err(Error::Disconnected),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Reads the next message from an async socket.
pub(crate) async fn read_message(
    stream: &tokio::net::UnixStream,
    buf: &mut FrameBuffer,
) -> Result<Result<Message, Undecodable>, Error> {
    let fd = stream.as_raw_fd();
    loop {
        if let Some(msg) = buf.next_message()? {
            return Ok(msg);
        }
        let n = stream
            .async_io(Interest::READABLE, || buf.recv_from(fd))
            .await?;
        if n == 0 {
            return Err(Error::Disconnected);
        }
    }
}

/// Writes a frame to an async socket.
pub(crate) async fn write_frame(stream: &tokio::net::UnixStream, frame: &Frame) -> Result<(), Error> {
    let fd = stream.as_raw_fd();
    let mut pos = 0;
    let mut fds = &frame.fds[..];
    while pos < frame.bytes.len() {
        let n = stream
            .async_io(Interest::WRITABLE, || send_to(fd, &frame.bytes[pos..], fds))
            .await?;
        pos += n;
        fds = &[];
    }
    Ok(())
}
