//! Zero-copy socket-to-socket forwarding over kernel pipes
//!
//! Payload bytes never enter user space: each relay direction owns a
//! `SpliceBuffer` that moves data socket → pipe → socket with splice(2).
//! A buffer holds at most one pipe, leased from the shared `PipePool`
//! while it is non-empty, so the buffered payload per direction is
//! bounded by the kernel pipe capacity.

use parking_lot::Mutex;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::TcpStream;

/// Upper bound per splice() call.
const MAX_SPLICE: usize = 1 << 30;

/// What to do with a pipe handed back to the pool. `Reuse` requires the
/// pipe to be empty; anything in an unknown state must be destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutAction {
    Reuse,
    Destroy,
}

#[derive(Debug)]
pub struct PipePair {
    read: OwnedFd,
    write: OwnedFd,
}

impl PipePair {
    fn new() -> io::Result<Self> {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            write: unsafe { OwnedFd::from_raw_fd(fds[1]) },
        })
    }
}

/// Free list of pipe pairs, avoiding pipe2()/close() churn while relaying.
#[derive(Debug, Default)]
pub struct PipePool {
    free: Mutex<Vec<PipePair>>,
}

impl PipePool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self) -> io::Result<PipePair> {
        if let Some(pipe) = self.free.lock().pop() {
            return Ok(pipe);
        }
        PipePair::new()
    }

    pub fn put(&self, pipe: PipePair, action: PutAction) {
        match action {
            PutAction::Reuse => self.free.lock().push(pipe),
            PutAction::Destroy => drop(pipe),
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveResult {
    /// Bytes were moved from the socket into the pipe.
    Ok(usize),
    /// The socket has no data; read readiness was consumed.
    SocketBlocking,
    /// The peer closed its sending side.
    SocketClosed,
    /// The pipe is full; stop reading until the other side drains it.
    PipeFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// The pipe was drained completely.
    Ok,
    /// Some bytes went out, the rest is still buffered.
    Partial,
    /// The socket cannot take more; write readiness was consumed.
    SocketBlocking,
}

enum Received {
    Data(usize),
    Closed,
    PipeFull,
}

pub struct SpliceBuffer {
    pool: Arc<PipePool>,
    pipe: Option<PipePair>,
    size: usize,
    pub received_bytes: u64,
    pub sent_bytes: u64,
}

impl SpliceBuffer {
    pub fn new(pool: Arc<PipePool>) -> Self {
        Self {
            pool,
            pipe: None,
            size: 0,
            received_bytes: 0,
            sent_bytes: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Moves pending socket data into the pipe, leasing one on demand.
    ///
    /// An EAGAIN while the buffer is non-empty means the *pipe* is full;
    /// in that case the socket's cached read readiness must survive, so
    /// the closure reports it as a distinct success value instead of
    /// letting `try_io` clear the readiness.
    pub fn receive_from(&mut self, socket: &TcpStream) -> io::Result<ReceiveResult> {
        let pipe_wr = match self.pipe.as_ref() {
            Some(pipe) => pipe.write.as_raw_fd(),
            None => {
                let pipe = self.pool.get()?;
                let fd = pipe.write.as_raw_fd();
                self.pipe = Some(pipe);
                fd
            }
        };
        let socket_fd = socket.as_raw_fd();
        let held = self.size;

        let result = socket.try_io(Interest::READABLE, || {
            match splice(socket_fd, pipe_wr, MAX_SPLICE) {
                Ok(0) => Ok(Received::Closed),
                Ok(n) => Ok(Received::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && held > 0 => {
                    Ok(Received::PipeFull)
                }
                Err(e) => Err(e),
            }
        });

        match result {
            Ok(Received::Data(n)) => {
                self.size += n;
                self.received_bytes += n as u64;
                Ok(ReceiveResult::Ok(n))
            }
            Ok(Received::Closed) => {
                if self.size == 0 {
                    if let Some(pipe) = self.pipe.take() {
                        self.pool.put(pipe, PutAction::Reuse);
                    }
                }
                Ok(ReceiveResult::SocketClosed)
            }
            Ok(Received::PipeFull) => Ok(ReceiveResult::PipeFull),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReceiveResult::SocketBlocking),
            Err(e) => Err(e),
        }
    }

    /// Moves buffered pipe data out to the socket. Precondition: the
    /// buffer is non-empty.
    pub fn send_to(&mut self, socket: &TcpStream) -> io::Result<SendResult> {
        debug_assert!(self.size > 0);
        let pipe_rd = match &self.pipe {
            Some(pipe) => pipe.read.as_raw_fd(),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "send from empty splice buffer",
                ))
            }
        };
        let socket_fd = socket.as_raw_fd();
        let size = self.size;

        let result = socket.try_io(Interest::WRITABLE, || match splice(pipe_rd, socket_fd, size) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "splice to socket returned zero",
            )),
            Ok(n) => Ok(n),
            Err(e) => Err(e),
        });

        match result {
            Ok(n) => {
                self.size -= n;
                self.sent_bytes += n as u64;
                if self.size == 0 {
                    if let Some(pipe) = self.pipe.take() {
                        self.pool.put(pipe, PutAction::Reuse);
                    }
                    Ok(SendResult::Ok)
                } else {
                    Ok(SendResult::Partial)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(SendResult::SocketBlocking),
            Err(e) => Err(e),
        }
    }
}

impl Drop for SpliceBuffer {
    fn drop(&mut self) {
        if let Some(pipe) = self.pipe.take() {
            let action = if self.size == 0 {
                PutAction::Reuse
            } else {
                PutAction::Destroy
            };
            self.pool.put(pipe, action);
        }
    }
}

fn splice(from: RawFd, to: RawFd, len: usize) -> io::Result<usize> {
    let n = unsafe {
        libc::splice(
            from,
            std::ptr::null_mut(),
            to,
            std::ptr::null_mut(),
            len,
            libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), async {
            listener.accept().await.map(|(s, _)| s)
        });
        (connected.unwrap(), accepted.unwrap())
    }

    #[tokio::test]
    async fn moves_bytes_between_sockets() {
        let (mut client, from_client) = socket_pair().await;
        let (to_server, mut server) = socket_pair().await;
        let pool = PipePool::new();
        let mut buffer = SpliceBuffer::new(pool.clone());

        client.write_all(b"hello splice").await.unwrap();
        from_client.ready(Interest::READABLE).await.unwrap();
        assert_eq!(
            buffer.receive_from(&from_client).unwrap(),
            ReceiveResult::Ok(12)
        );
        assert_eq!(buffer.size(), 12);
        assert_eq!(buffer.received_bytes, 12);

        to_server.ready(Interest::WRITABLE).await.unwrap();
        assert_eq!(buffer.send_to(&to_server).unwrap(), SendResult::Ok);
        assert!(buffer.is_empty());
        assert_eq!(buffer.sent_bytes, 12);

        let mut read = [0u8; 12];
        server.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"hello splice");

        // drained pipe went back to the free list
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn detects_peer_close() {
        let (client, from_client) = socket_pair().await;
        let pool = PipePool::new();
        let mut buffer = SpliceBuffer::new(pool.clone());

        drop(client);
        from_client.ready(Interest::READABLE).await.unwrap();
        assert_eq!(
            buffer.receive_from(&from_client).unwrap(),
            ReceiveResult::SocketClosed
        );
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn empty_socket_reports_blocking() {
        let (client, from_client) = socket_pair().await;
        let pool = PipePool::new();
        let mut buffer = SpliceBuffer::new(pool);

        // no data written and no readiness observed yet
        assert_eq!(
            buffer.receive_from(&from_client).unwrap(),
            ReceiveResult::SocketBlocking
        );
        drop(client);
    }

    #[tokio::test]
    async fn non_empty_buffer_is_destroyed_not_reused() {
        let (mut client, from_client) = socket_pair().await;
        let pool = PipePool::new();

        client.write_all(b"stuck").await.unwrap();
        from_client.ready(Interest::READABLE).await.unwrap();

        let mut buffer = SpliceBuffer::new(pool.clone());
        assert_eq!(
            buffer.receive_from(&from_client).unwrap(),
            ReceiveResult::Ok(5)
        );
        drop(buffer);
        assert_eq!(pool.idle(), 0);
    }
}
