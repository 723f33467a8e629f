//! Proxy Protocol Client (C3): the five-message wire protocol used to
//! delegate block I/O to an external server, over either a framed stream or
//! a shared-memory rendezvous (spec.md §4.3).

pub mod cancel;
pub mod error;
pub mod shm;
pub mod stream;
pub mod wire;

pub use cancel::CancelToken;
pub use error::ProxyError;
pub use shm::{ShmChannel, ShmClient, ShmServerHandle};
pub use stream::StreamClient;
pub use wire::{ConnectResponseHeader, InfoResponse};

use std::io::{Read, Write};
use std::os::fd::AsRawFd;

/// Transport-agnostic view over a proxy session, used by `vb-core`'s backing
/// store so the dispatcher doesn't need to know which transport a given
/// proxy-backed device uses.
pub trait ProxyClient: Send {
    fn info(&mut self, authoritative_size: Option<u64>) -> Result<InfoResponse, ProxyError>;
    fn read(&mut self, offset: u64, length: u64, out: &mut [u8]) -> Result<usize, ProxyError>;
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize, ProxyError>;
    fn close(&mut self);
}

impl<S: Read + Write + AsRawFd + Send> ProxyClient for StreamClient<S> {
    fn info(&mut self, authoritative_size: Option<u64>) -> Result<InfoResponse, ProxyError> {
        StreamClient::info(self, authoritative_size)
    }

    fn read(&mut self, offset: u64, length: u64, out: &mut [u8]) -> Result<usize, ProxyError> {
        StreamClient::read(self, offset, length, out)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize, ProxyError> {
        StreamClient::write(self, offset, data)
    }

    fn close(&mut self) {
        StreamClient::close(self)
    }
}

impl ProxyClient for ShmClient {
    fn info(&mut self, authoritative_size: Option<u64>) -> Result<InfoResponse, ProxyError> {
        ShmClient::info(self, authoritative_size)
    }

    fn read(&mut self, offset: u64, length: u64, out: &mut [u8]) -> Result<usize, ProxyError> {
        ShmClient::read(self, offset, length, out)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize, ProxyError> {
        ShmClient::write(self, offset, data)
    }

    fn close(&mut self) {
        // Shared-memory sessions have no fire-and-forget CLOSE framing of
        // their own; the owning backing store simply drops the channel.
    }
}
