//! The client side of the SASL handshake.

use {
    crate::Error,
    std::{
        fmt::Write as _,
        io::{Read, Write},
    },
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

const MAX_LINE_LEN: usize = 16 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    WaitingForOk,
    WaitingForAgree,
    Done,
}

/// The result of an authentication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Authenticated {
    pub guid: String,
    pub unix_fd: bool,
}

/// A line-level state machine of the `EXTERNAL` mechanism.
pub struct Sasl {
    state: State,
    negotiate_unix_fd: bool,
    guid: String,
    unix_fd: bool,
}

/// What the client has to do after receiving a line.
#[derive(Debug, PartialEq, Eq)]
pub struct Step {
    pub send: Vec<u8>,
    pub done: bool,
}

impl Sasl {
    pub fn new(negotiate_unix_fd: bool) -> Self {
        Self {
            state: State::WaitingForOk,
            negotiate_unix_fd,
            guid: String::new(),
            unix_fd: false,
        }
    }

    /// The bytes that start the handshake.
    pub fn start(uid: u32) -> Vec<u8> {
        let mut hex = String::new();
        for b in uid.to_string().bytes() {
            let _ = write!(hex, "{b:02x}");
        }
        format!("\0AUTH EXTERNAL {hex}\r\n").into_bytes()
    }

    /// Processes one line sent by the server, without the trailing `\r\n`.
    pub fn feed(&mut self, line: &str) -> Result<Step, Error> {
        let (cmd, arg) = line.split_once(' ').unwrap_or((line, ""));
        match (self.state, cmd) {
            (State::WaitingForOk, "OK") => {
                self.guid = arg.to_string();
                if self.negotiate_unix_fd {
                    self.state = State::WaitingForAgree;
                    return Ok(Step {
                        send: b"NEGOTIATE_UNIX_FD\r\n".to_vec(),
                        done: false,
                    });
                }
                Ok(self.begin())
            }
            (State::WaitingForOk, "REJECTED") => Err(Error::Auth(format!(
                "the server rejected EXTERNAL authentication (supported: {arg})"
            ))),
            (State::WaitingForAgree, "AGREE_UNIX_FD") => {
                self.unix_fd = true;
                Ok(self.begin())
            }
            (State::WaitingForAgree, "ERROR") => {
                log::debug!("The server does not support unix fd passing: {arg}");
                Ok(self.begin())
            }
            (State::Done, _) => Err(Error::Auth("authentication already finished".into())),
            (_, _) => Err(Error::Auth(format!("unexpected server response `{line}`"))),
        }
    }

    fn begin(&mut self) -> Step {
        self.state = State::Done;
        Step {
            send: b"BEGIN\r\n".to_vec(),
            done: true,
        }
    }

    pub fn finish(self) -> Authenticated {
        Authenticated {
            guid: self.guid,
            unix_fd: self.unix_fd,
        }
    }
}

fn line(buf: Vec<u8>) -> Result<String, Error> {
    String::from_utf8(buf).map_err(|_| Error::Auth("server sent a non-UTF-8 line".into()))
}

/// Performs the handshake on a blocking stream.
pub fn authenticate_blocking<S: Read + Write>(
    stream: &mut S,
    uid: u32,
    negotiate_unix_fd: bool,
) -> Result<Authenticated, Error> {
    let mut sasl = Sasl::new(negotiate_unix_fd);
    stream.write_all(&Sasl::start(uid))?;
    loop {
        // Reads byte by byte so that nothing after the final line is consumed.
        let mut buf = vec![];
        loop {
            let mut b = [0];
            if stream.read(&mut b)? == 0 {
                return Err(Error::Disconnected);
            }
            if b[0] == b'\n' && buf.last() == Some(&b'\r') {
                buf.pop();
                break;
            }
            buf.push(b[0]);
            if buf.len() > MAX_LINE_LEN {
                return Err(Error::Auth("server line is too long".into()));
            }
        }
        let step = sasl.feed(&line(buf)?)?;
        stream.write_all(&step.send)?;
        if step.done {
            return Ok(sasl.finish());
        }
    }
}

/// Performs the handshake on an async stream.
pub async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    uid: u32,
    negotiate_unix_fd: bool,
) -> Result<Authenticated, Error> {
    let mut sasl = Sasl::new(negotiate_unix_fd);
    stream.write_all(&Sasl::start(uid)).await?;
    loop {
        let mut buf = vec![];
        loop {
            let b = match stream.read_u8().await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(Error::Disconnected)
                }
                Err(e) => return Err(e.into()),
            };
            if b == b'\n' && buf.last() == Some(&b'\r') {
                buf.pop();
                break;
            }
            buf.push(b);
            if buf.len() > MAX_LINE_LEN {
                return Err(Error::Auth("server line is too long".into()));
            }
        }
        let step = sasl.feed(&line(buf)?)?;
        stream.write_all(&step.send).await?;
        if step.done {
            return Ok(sasl.finish());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_encodes_uid_digits() {
        assert_eq!(Sasl::start(1000), b"\0AUTH EXTERNAL 31303030\r\n");
        assert_eq!(Sasl::start(0), b"\0AUTH EXTERNAL 30\r\n");
    }

    #[test]
    fn with_fd_negotiation() {
        let mut sasl = Sasl::new(true);
        let step = sasl.feed("OK 1234deadbeef").unwrap();
        assert_eq!(step.send, b"NEGOTIATE_UNIX_FD\r\n");
        assert!(!step.done);
        let step = sasl.feed("AGREE_UNIX_FD").unwrap();
        assert_eq!(step.send, b"BEGIN\r\n");
        assert!(step.done);
        let auth = sasl.finish();
        assert_eq!(auth.guid, "1234deadbeef");
        assert!(auth.unix_fd);
    }

    #[test]
    fn fd_negotiation_refused() {
        let mut sasl = Sasl::new(true);
        sasl.feed("OK abc").unwrap();
        assert!(sasl.feed("ERROR not supported").unwrap().done);
        assert!(!sasl.finish().unix_fd);
    }

    #[test]
    fn without_fd_negotiation() {
        let mut sasl = Sasl::new(false);
        let step = sasl.feed("OK abc").unwrap();
        assert_eq!(step.send, b"BEGIN\r\n");
        assert!(step.done);
    }

    #[test]
    fn rejected() {
        let mut sasl = Sasl::new(true);
        assert!(matches!(
            sasl.feed("REJECTED DBUS_COOKIE_SHA1"),
            Err(Error::Auth(_))
        ));
        let mut sasl = Sasl::new(true);
        assert!(matches!(sasl.feed("DATA"), Err(Error::Auth(_))));
    }

    #[test]
    fn blocking_driver() {
        let (mut client, mut server) = std::os::unix::net::UnixStream::pair().unwrap();
        let t = std::thread::spawn(move || {
            let mut buf = [0; 64];
            let n = server.read(&mut buf).unwrap();
            assert!(buf[..n].starts_with(b"\0AUTH EXTERNAL "));
            server.write_all(b"OK 00ff\r\n").unwrap();
            let n = server.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"BEGIN\r\n");
        });
        let auth = authenticate_blocking(&mut client, 1000, false).unwrap();
        assert_eq!(auth.guid, "00ff");
        t.join().unwrap();
    }
}
