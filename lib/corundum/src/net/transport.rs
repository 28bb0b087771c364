use crate::shared::{ErrorType, ProtoError, ProtoResult};
use flux::logging;
use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{
    recv, recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, SockFlag, SockType, UnixAddr,
};
use std::io::{IoSlice, IoSliceMut, Read};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Upper bound on the number of descriptors attached to a single frame.
pub const MAX_FDS_PER_FRAME: usize = 8;

/// Datagram-framed endpoint over a connected SOCK_SEQPACKET socket. Frames
/// preserve message boundaries and carry up to [`MAX_FDS_PER_FRAME`]
/// descriptors as SCM_RIGHTS ancillary data, delivered atomically with their
/// payload.
pub struct Transport {
    stream: UnixStream,
    log: logging::Logger,
}

impl Transport {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(stream: UnixStream, log: L) -> Transport {
        Transport {
            stream,
            log: logging::child(log),
        }
    }

    /// Wraps a descriptor handed over by the supervisor.
    #[inline]
    pub fn from_fd<'a, L: Into<Option<&'a logging::Logger>>>(fd: OwnedFd, log: L) -> Transport {
        Transport::new(UnixStream::from(fd), log)
    }

    /// Creates a connected transport pair.
    pub fn pair() -> ProtoResult<(Transport, Transport)> {
        let (near, far) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;

        // Both ends come straight out of socketpair(2) and are owned here.
        let near = unsafe { UnixStream::from_raw_fd(near) };
        let far = unsafe { UnixStream::from_raw_fd(far) };

        Ok((Transport::new(near, None), Transport::new(far, None)))
    }

    /// Writes one frame: the whole payload plus the supplied descriptors in a
    /// single send. Used for requests and replies alike.
    pub fn send(&self, buf: &[u8], fds: &[RawFd]) -> ProtoResult<()> {
        debug_assert!(fds.len() <= MAX_FDS_PER_FRAME);

        let iov = [IoSlice::new(buf)];

        let scm;
        let cmsgs: &[ControlMessage] = if fds.is_empty() {
            &[]
        } else {
            scm = [ControlMessage::ScmRights(fds)];
            &scm
        };

        let sent = loop {
            match sendmsg::<UnixAddr>(
                self.stream.as_raw_fd(),
                &iov,
                cmsgs,
                MsgFlags::empty(),
                None,
            ) {
                Ok(sent) => break sent,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        };

        if sent != buf.len() {
            logging::warn!(self.log, "short frame send";
                           "expected" => buf.len(),
                           "sent" => sent);
            return Err(ProtoError::Fatal(ErrorType::Truncated));
        }

        Ok(())
    }

    /// Reads one frame of at most `max_size` bytes carrying at most `max_fds`
    /// descriptors. A zero-length frame with no descriptors is a clean close.
    /// Oversized payloads and over-delivered descriptors terminate the
    /// connection; every descriptor received with a bad frame is closed
    /// before the error is returned.
    pub fn receive(&self, max_size: usize, max_fds: usize) -> ProtoResult<(Vec<u8>, Vec<OwnedFd>)> {
        debug_assert!(max_fds <= MAX_FDS_PER_FRAME);

        let mut buf = vec![0u8; max_size];
        let mut cmsg_buf = cmsg_space!([RawFd; MAX_FDS_PER_FRAME]);

        let (received, flags, fds) = {
            let mut iov = [IoSliceMut::new(&mut buf)];

            let msg = loop {
                match recvmsg::<UnixAddr>(
                    self.stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                ) {
                    Ok(msg) => break msg,
                    Err(Errno::EINTR) => continue,
                    Err(errno) => return Err(errno.into()),
                }
            };

            let mut fds = Vec::new();
            for cmsg in msg.cmsgs() {
                if let ControlMessageOwned::ScmRights(received) = cmsg {
                    for fd in received {
                        // recvmsg delivered ownership of the descriptor.
                        fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
            }

            (msg.bytes, msg.flags, fds)
        };

        if received == 0 && fds.is_empty() {
            return Err(ProtoError::Disconnect);
        }

        if flags.contains(MsgFlags::MSG_TRUNC) {
            logging::warn!(self.log, "frame payload exceeds request ceiling"; "max_size" => max_size);
            return Err(ProtoError::Fatal(ErrorType::SizeMismatch));
        }

        if flags.contains(MsgFlags::MSG_CTRUNC) || fds.len() > max_fds {
            logging::warn!(self.log, "frame carries more descriptors than the operation admits";
                           "max_fds" => max_fds,
                           "received" => fds.len());
            return Err(ProtoError::Fatal(ErrorType::TooManyFds));
        }

        buf.truncate(received);
        Ok((buf, fds))
    }

    /// Reads exactly `len` bytes. Only used for the out-of-band tail of an
    /// oversized inline command, which the peer writes as plain stream data.
    pub fn receive_bytes(&self, len: usize) -> ProtoResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.receive_exact(&mut buf)?;
        Ok(buf)
    }

    /// Fills `buf` exactly from the connection.
    pub fn receive_exact(&self, buf: &mut [u8]) -> ProtoResult<()> {
        (&self.stream).read_exact(buf)?;
        Ok(())
    }

    /// Consumes and discards `len` pending bytes without buffering them.
    /// Whole messages are consumed even when they exceed the scratch space.
    pub fn drain_bytes(&self, len: usize) -> ProtoResult<()> {
        let mut scratch = [0u8; 4096];
        let mut remaining = len;

        while remaining > 0 {
            let consumed = loop {
                match recv(self.stream.as_raw_fd(), &mut scratch, MsgFlags::MSG_TRUNC) {
                    Ok(consumed) => break consumed,
                    Err(Errno::EINTR) => continue,
                    Err(errno) => return Err(errno.into()),
                }
            };

            if consumed == 0 {
                return Err(ProtoError::Fatal(ErrorType::Truncated));
            }

            remaining = remaining.saturating_sub(consumed);
        }

        Ok(())
    }

    /// Releases the underlying descriptor.
    #[inline]
    pub fn into_fd(self) -> OwnedFd {
        OwnedFd::from(self.stream)
    }
}
