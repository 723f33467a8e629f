//! Framed stream transport: strictly sequential request/response over any
//! byte stream (TCP, Unix socket, named pipe). Grounded on
//! `exp/nbd/orbblk/src/bin/nbdsrv.rs` and `nbdclient.rs`'s header-then-payload
//! read/write sequencing, generalized from NBD's fixed command set to the
//! five-message schema in `wire.rs`.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::cancel::CancelToken;
use crate::error::ProxyError;
use crate::wire::*;

const POLL_SLICE_MS: u16 = 100;

/// A stream-backed proxy endpoint. `S` is any duplex byte stream that also
/// exposes a raw fd so blocking reads can be interrupted by `terminate_requested`.
pub struct StreamClient<S> {
    stream: S,
    cancel: CancelToken,
}

impl<S: Read + Write + AsRawFd> StreamClient<S> {
    pub fn new(stream: S, cancel: CancelToken) -> Self {
        Self { stream, cancel }
    }

    fn wait_readable(&self) -> Result<(), ProxyError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(ProxyError::Cancelled);
            }
            let fd: RawFd = self.stream.as_raw_fd();
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
            let timeout = PollTimeout::from(POLL_SLICE_MS);
            match poll(&mut fds, timeout) {
                Ok(0) => continue, // slice expired, recheck cancellation
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(ProxyError::Io(e.into())),
            }
        }
    }

    fn read_exact_cancellable(&mut self, buf: &mut [u8]) -> Result<(), ProxyError> {
        if buf.is_empty() {
            return Ok(());
        }
        self.wait_readable()?;
        self.stream.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ProxyError::Reset
            } else {
                ProxyError::Io(e)
            }
        })
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), ProxyError> {
        self.stream.write_all(buf).map_err(|e| {
            if matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
            ) {
                ProxyError::Reset
            } else {
                ProxyError::Io(e)
            }
        })
    }

    pub fn info(&mut self, authoritative_size: Option<u64>) -> Result<InfoResponse, ProxyError> {
        self.write_all(bytemuck::bytes_of(&MessageHeader { code: MSG_INFO.into() }))?;

        let mut raw = [0u8; std::mem::size_of::<InfoResponse>()];
        self.read_exact_cancellable(&mut raw)?;
        let resp: InfoResponse = *bytemuck::from_bytes(&raw);

        let alignment = resp.req_alignment.get();
        if alignment.wrapping_sub(1) > MAX_ALIGNMENT_MASK {
            return Err(ProxyError::UnsupportedAlignment(alignment));
        }
        if resp.file_size.get() == 0 && authoritative_size.is_none() {
            return Err(ProxyError::ZeroFileSize);
        }

        Ok(resp)
    }

    pub fn read(&mut self, offset: u64, length: u64, out: &mut [u8]) -> Result<usize, ProxyError> {
        debug_assert!(out.len() as u64 >= length);

        self.write_all(bytemuck::bytes_of(&MessageHeader { code: MSG_READ.into() }))?;
        self.write_all(bytemuck::bytes_of(&ReadRequestTail {
            offset: offset.into(),
            length: length.into(),
        }))?;

        let mut raw = [0u8; std::mem::size_of::<ReadResponseHeader>()];
        self.read_exact_cancellable(&mut raw)?;
        let header: ReadResponseHeader = *bytemuck::from_bytes(&raw);

        if header.errno.get() != 0 {
            return Err(ProxyError::Protocol(format!(
                "proxy READ failed with errno {}",
                header.errno.get()
            )));
        }

        let resp_len = header.length.get();
        if resp_len > out.len() as u64 {
            return Err(ProxyError::Protocol(format!(
                "proxy READ response length {resp_len} exceeds caller buffer {}",
                out.len()
            )));
        }

        self.read_exact_cancellable(&mut out[..resp_len as usize])?;
        Ok(resp_len as usize)
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize, ProxyError> {
        self.write_all(bytemuck::bytes_of(&MessageHeader { code: MSG_WRITE.into() }))?;
        self.write_all(bytemuck::bytes_of(&WriteRequestTail {
            offset: offset.into(),
            length: (data.len() as u64).into(),
        }))?;
        self.write_all(data)?;

        let mut raw = [0u8; std::mem::size_of::<WriteResponseHeader>()];
        self.read_exact_cancellable(&mut raw)?;
        let header: WriteResponseHeader = *bytemuck::from_bytes(&raw);

        if header.errno.get() != 0 {
            return Err(ProxyError::Protocol(format!(
                "proxy WRITE failed with errno {}",
                header.errno.get()
            )));
        }

        Ok(header.length.get() as usize)
    }

    /// Sends `CONNECT` with the caller-chosen endpoint name and returns the
    /// raw response; the caller maps `object_ptr` to a transport-appropriate
    /// endpoint handle (spec.md Open Question 2) and must swap its own
    /// internal endpoint if one is returned.
    pub fn connect(&mut self, flags: u64, name: &[u8]) -> Result<ConnectResponseHeader, ProxyError> {
        self.write_all(bytemuck::bytes_of(&MessageHeader { code: MSG_CONNECT.into() }))?;
        self.write_all(bytemuck::bytes_of(&ConnectRequestTail {
            flags: flags.into(),
            length: (name.len() as u64).into(),
        }))?;
        self.write_all(name)?;

        let mut raw = [0u8; std::mem::size_of::<ConnectResponseHeader>()];
        self.read_exact_cancellable(&mut raw)?;
        Ok(*bytemuck::from_bytes(&raw))
    }

    /// Fire-and-forget shutdown hint: no response is read.
    pub fn close(&mut self) {
        let _ = self.write_all(bytemuck::bytes_of(&MessageHeader { code: MSG_CLOSE.into() }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A Cursor has no real fd; tests instead exercise the framing logic via
    // an in-memory duplex pipe built from `nix::unistd::pipe` pairs.
    struct DuplexPipe {
        read_fd: std::os::fd::OwnedFd,
        write_fd: std::os::fd::OwnedFd,
    }

    impl Read for DuplexPipe {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            nix::unistd::read(&self.read_fd, buf).map_err(|e| e.into())
        }
    }

    impl Write for DuplexPipe {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            nix::unistd::write(&self.write_fd, buf).map_err(|e| e.into())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl AsRawFd for DuplexPipe {
        fn as_raw_fd(&self) -> RawFd {
            self.read_fd.as_raw_fd()
        }
    }

    fn mock_read_response(write_fd: &std::os::fd::OwnedFd, payload: &[u8]) {
        let header = ReadResponseHeader {
            errno: 0u64.into(),
            length: (payload.len() as u64).into(),
        };
        nix::unistd::write(write_fd, bytemuck::bytes_of(&header)).unwrap();
        nix::unistd::write(write_fd, payload).unwrap();
    }

    #[test]
    fn read_consumes_exact_framing() {
        // client -> server pipe carries the request; server -> client carries
        // the response. Use two pipe pairs to keep the directions distinct,
        // then wire a `DuplexPipe` view for the client that reads from the
        // server->client pipe and writes to the client->server pipe.
        let (c2s_r, c2s_w) = nix::unistd::pipe().unwrap();
        let (s2c_r, s2c_w) = nix::unistd::pipe().unwrap();

        let mut client = StreamClient::new(
            DuplexPipe { read_fd: s2c_r, write_fd: c2s_w },
            CancelToken::new(),
        );

        let payload = vec![0xCDu8; 512];
        let server_payload = payload.clone();
        let server_thread = std::thread::spawn(move || {
            let mut req_header = [0u8; std::mem::size_of::<MessageHeader>()];
            nix::unistd::read(&c2s_r, &mut req_header).unwrap();
            let mut tail = [0u8; std::mem::size_of::<ReadRequestTail>()];
            nix::unistd::read(&c2s_r, &mut tail).unwrap();
            let tail: ReadRequestTail = *bytemuck::from_bytes(&tail);
            assert_eq!(tail.offset.get(), 0x1000);
            assert_eq!(tail.length.get(), 0x200);
            mock_read_response(&s2c_w, &server_payload);
        });

        let mut buf = vec![0u8; 512];
        let n = client.read(0x1000, 0x200, &mut buf).unwrap();
        server_thread.join().unwrap();

        assert_eq!(n, 512);
        assert!(buf.iter().all(|&b| b == 0xCD));
    }

    #[test]
    fn oversized_response_is_protocol_error() {
        let (c2s_r, c2s_w) = nix::unistd::pipe().unwrap();
        let (s2c_r, s2c_w) = nix::unistd::pipe().unwrap();

        let mut client = StreamClient::new(
            DuplexPipe { read_fd: s2c_r, write_fd: c2s_w },
            CancelToken::new(),
        );

        let server_thread = std::thread::spawn(move || {
            let mut req_header = [0u8; std::mem::size_of::<MessageHeader>()];
            nix::unistd::read(&c2s_r, &mut req_header).unwrap();
            let mut tail = [0u8; std::mem::size_of::<ReadRequestTail>()];
            nix::unistd::read(&c2s_r, &mut tail).unwrap();
            let header = ReadResponseHeader { errno: 0u64.into(), length: 99u64.into() };
            nix::unistd::write(&s2c_w, bytemuck::bytes_of(&header)).unwrap();
        });

        let mut buf = vec![0u8; 4];
        let err = client.read(0, 4, &mut buf).unwrap_err();
        server_thread.join().unwrap();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }
}
