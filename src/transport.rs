//! Framed TCP connections.
//!
//! A [`Connection`] carries one message type in length-prefixed frames.
//! Receives are bounded by a deadline; bytes of a frame that arrive before a
//! timeout stay buffered for the next call, so timing out never
//! desynchronizes the stream.

use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use wheelwright_proto::{encode_frame, FrameBuffer, WireMessage};

use crate::error::{Result, WorkerError};
use crate::process;

const READ_CHUNK: usize = 64 * 1024;

/// A TCP stream speaking frames of `M`.
#[derive(Debug)]
pub struct Connection<M> {
    stream: TcpStream,
    buffer: FrameBuffer,
    _message: PhantomData<fn() -> M>,
}

impl<M: WireMessage> Connection<M> {
    /// Connect to `addr` (`host:port`), trying each resolved address in turn.
    pub fn connect(addr: &str) -> Result<Self> {
        let mut last_err = None;
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect(candidate) {
                Ok(stream) => return Self::from_stream(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(WorkerError::Io(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve to any address", addr),
            )
        })))
    }

    /// Wrap an established stream
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            buffer: FrameBuffer::new(),
            _message: PhantomData,
        })
    }

    /// Write one message
    pub fn send(&mut self, msg: &M) -> Result<()> {
        let frame = encode_frame(msg)?;
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` when the deadline passes with no complete frame; a
    /// zero timeout only returns what is already buffered. Fails with
    /// [`WorkerError::Interrupted`] once the process has been signalled.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<M>> {
        let deadline = Instant::now() + timeout;
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some(body) = self.buffer.next_frame()? {
                return Ok(Some(M::decode(&body)?));
            }

            if process::interrupted() {
                return Err(WorkerError::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(process::INTERRUPT_CHECK);
            self.stream.set_read_timeout(Some(wait))?;

            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(WorkerError::ConnectionClosed),
                Ok(n) => self.buffer.extend(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send a last message, allowing at most `linger` for it to go out, then
    /// close the connection. Failures are ignored.
    pub fn close_with(mut self, msg: &M, linger: Duration) {
        let linger = linger.max(Duration::from_millis(1));
        if self.stream.set_write_timeout(Some(linger)).is_ok() {
            if let Err(e) = self.send(msg) {
                tracing::debug!(error = %e, tag = msg.tag(), "Farewell not delivered");
            }
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Close immediately, discarding anything unsent or unread
    pub fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
