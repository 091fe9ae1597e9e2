//! Text + file-descriptor channel over a UNIX socketpair
//!
//! Every control message is one newline-terminated ASCII line, sent with a
//! single `sendmsg`. Lines that hand over a connection attach exactly one
//! descriptor as SCM_RIGHTS. The kernel never merges stream data across an
//! ancillary boundary, so a received descriptor always belongs to the line
//! whose first bytes it arrived with.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, recvmsg,
    sendmsg, socketpair,
};

/// Receiving (and sending) end of a binder control channel
///
/// `recv_line` needs exclusive access for its internal buffer; concurrent
/// senders use [`FdChannel::sender`] clones instead.
pub struct FdChannel {
    stream: UnixStream,
    buf: Vec<u8>,
    /// Descriptor received ahead of its line completing
    fd_slot: Option<OwnedFd>,
}

/// Send-only clone of a channel, cheap to hand to other threads
pub struct FdSender {
    stream: UnixStream,
}

impl FdChannel {
    /// Create a connected pair, one end per process
    pub fn pair() -> io::Result<(FdChannel, FdChannel)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;
        Ok((
            FdChannel::from_stream(UnixStream::from(a)),
            FdChannel::from_stream(UnixStream::from(b)),
        ))
    }

    pub fn from_stream(stream: UnixStream) -> FdChannel {
        FdChannel {
            stream,
            buf: Vec::with_capacity(4096),
            fd_slot: None,
        }
    }

    /// Wrap an inherited descriptor (the child side of the pair)
    ///
    /// # Safety
    ///
    /// `fd` must be an open UNIX stream socket owned by the caller and not
    /// used anywhere else.
    pub unsafe fn from_raw_fd(fd: RawFd) -> FdChannel {
        FdChannel::from_stream(unsafe { UnixStream::from_raw_fd(fd) })
    }

    /// A send-only handle sharing the same socket
    pub fn sender(&self) -> io::Result<FdSender> {
        Ok(FdSender {
            stream: self.stream.try_clone()?,
        })
    }

    /// Give up the channel and keep the raw socket, e.g. to inherit it into
    /// a child process
    pub fn into_stream(self) -> UnixStream {
        self.stream
    }

    pub fn send(&self, text: &str, fd: Option<BorrowedFd<'_>>) -> io::Result<()> {
        send_on(&self.stream, text, fd)
    }

    /// Read the next line; `None` on EOF. The descriptor, if any, is the one
    /// the peer attached to this line.
    pub fn recv_line(&mut self) -> io::Result<Option<(String, Option<OwnedFd>)>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let text = String::from_utf8_lossy(&line).into_owned();
                return Ok(Some((text, self.fd_slot.take())));
            }

            let mut chunk = [0u8; 4096];
            let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
            let (n, received_fd) = {
                let mut iov = [IoSliceMut::new(&mut chunk)];
                let msg = recvmsg::<()>(
                    self.stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::empty(),
                )
                .map_err(io::Error::from)?;

                let mut received_fd: Option<OwnedFd> = None;
                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        for fd in fds {
                            // take ownership so extras are closed, not leaked
                            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                            if received_fd.is_none() {
                                received_fd = Some(owned);
                            }
                        }
                    }
                }
                (msg.bytes, received_fd)
            };
            if let Some(fd) = received_fd
                && self.fd_slot.is_none()
            {
                self.fd_slot = Some(fd);
            }
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

impl FdSender {
    pub fn send(&self, text: &str, fd: Option<BorrowedFd<'_>>) -> io::Result<()> {
        send_on(&self.stream, text, fd)
    }

    pub fn try_clone(&self) -> io::Result<FdSender> {
        Ok(FdSender {
            stream: self.stream.try_clone()?,
        })
    }
}

fn send_on(stream: &UnixStream, text: &str, fd: Option<BorrowedFd<'_>>) -> io::Result<()> {
    let mut line = String::with_capacity(text.len() + 1);
    line.push_str(text);
    if !line.ends_with('\n') {
        line.push('\n');
    }

    let iov = [IoSlice::new(line.as_bytes())];
    let raw;
    let cmsgs: &[ControlMessage<'_>] = match fd {
        Some(fd) => {
            raw = [fd.as_raw_fd()];
            &[ControlMessage::ScmRights(&raw)]
        }
        None => &[],
    };

    let mut sent = sendmsg::<()>(
        stream.as_fd().as_raw_fd(),
        &iov,
        cmsgs,
        MsgFlags::empty(),
        None,
    )
    .map_err(io::Error::from)?;

    // short writes only need the remaining bytes, the rights went with the
    // first segment
    while sent < line.len() {
        let iov = [IoSlice::new(&line.as_bytes()[sent..])];
        sent += sendmsg::<()>(
            stream.as_fd().as_raw_fd(),
            &iov,
            &[],
            MsgFlags::empty(),
            None,
        )
        .map_err(io::Error::from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn text_roundtrip() {
        let (tx, mut rx) = FdChannel::pair().unwrap();
        tx.send("listen tcp:127.0.0.1:2514", None).unwrap();
        tx.send("reset", None).unwrap();

        let (line, fd) = rx.recv_line().unwrap().unwrap();
        assert_eq!(line, "listen tcp:127.0.0.1:2514");
        assert!(fd.is_none());
        let (line, _) = rx.recv_line().unwrap().unwrap();
        assert_eq!(line, "reset");
    }

    #[test]
    fn fd_arrives_with_its_line() {
        let (tx, mut rx) = FdChannel::pair().unwrap();

        // pass one end of another socketpair through the channel
        let (mut probe_a, probe_b) = UnixStream::pair().unwrap();
        tx.send("newconn 01ARZ test:addr", Some(probe_b.as_fd()))
            .unwrap();

        let (line, fd) = rx.recv_line().unwrap().unwrap();
        assert_eq!(line, "newconn 01ARZ test:addr");
        let fd = fd.expect("descriptor should ride along");

        // prove the received fd is really the probe socket
        let mut received = UnixStream::from(fd);
        probe_a.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        received.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn eof_returns_none() {
        let (tx, mut rx) = FdChannel::pair().unwrap();
        drop(tx);
        assert!(rx.recv_line().unwrap().is_none());
    }
}
