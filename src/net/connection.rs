//! Connection (C6): owns one socket and pins all of its I/O and session
//! callbacks to one worker. The ET-read-until-
//! EAGAIN loop and the "copy then dispatch" write path are its algorithm.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::fix::codec::Codec;
use crate::fix::frame::FrameDecoder;
use crate::net::reactor::{EventMask, ReactorHandle};
use crate::net::worker_pool::WorkerPool;

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

struct WriteState {
    pending: Vec<u8>,
    write_armed: bool,
}

/// One TCP connection. `on_frame` is invoked (on this connection's pinned
/// worker) for every complete FIX frame the decoder extracts; `on_closed`
/// fires once, on I/O error or peer close.
pub struct Connection {
    pub fd: RawFd,
    pub thread_index: usize,
    decoder: Mutex<FrameDecoder>,
    write_state: Mutex<WriteState>,
    reactor: ReactorHandle,
}

impl Connection {
    pub fn new(
        fd: RawFd,
        thread_index: usize,
        reactor: ReactorHandle,
        max_buffer_size: usize,
        max_body_length: usize,
    ) -> Arc<Self> {
        set_nonblocking(fd);
        Arc::new(Self {
            fd,
            thread_index,
            decoder: Mutex::new(FrameDecoder::new(max_buffer_size, max_body_length)),
            write_state: Mutex::new(WriteState {
                pending: Vec::new(),
                write_armed: false,
            }),
            reactor,
        })
    }

    /// Registers this connection's fd with the reactor and routes reads
    /// through `worker_pool` onto `thread_index`.
    pub fn start(
        self: &Arc<Self>,
        worker_pool: Arc<WorkerPool>,
        on_frame: impl FnMut(&Arc<Connection>, Vec<u8>) + Send + 'static,
        on_closed: impl FnMut(&Arc<Connection>, &str) + Send + 'static,
    ) {
        let conn = self.clone();
        let pool_for_read = worker_pool.clone();
        let on_frame = Arc::new(Mutex::new(on_frame));
        let on_closed = Arc::new(Mutex::new(on_closed));
        self.reactor.add_fd(
            self.fd,
            Box::new(move |_fd| {
                let conn = conn.clone();
                let conn_for_closure = conn.clone();
                let on_frame = on_frame.clone();
                let on_closed = on_closed.clone();
                pool_for_read.enqueue_to(conn.thread_index, move || {
                    let mut on_frame = on_frame.lock();
                    let mut on_closed = on_closed.lock();
                    conn_for_closure.drain_read(&mut *on_frame, &mut *on_closed);
                });
            }),
        );
    }

    /// Reads in an ET loop until `EAGAIN`, feeding the Frame Decoder and
    /// invoking `on_frame` for each complete frame.
    fn drain_read(
        self: &Arc<Self>,
        on_frame: &mut (dyn FnMut(&Arc<Connection>, Vec<u8>) + Send),
        on_closed: &mut (dyn FnMut(&Arc<Connection>, &str) + Send),
    ) {
        let mut buf = [0u8; 65536];
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n > 0 {
                let mut decoder = self.decoder.lock();
                if decoder.append(&buf[..n as usize]).is_err() {
                    drop(decoder);
                    on_closed(self, "frame buffer overflow");
                    return;
                }
                loop {
                    match decoder.next_message() {
                        Ok(Some(frame)) => {
                            drop(decoder);
                            on_frame(self, frame);
                            decoder = self.decoder.lock();
                        }
                        Ok(None) => break,
                        Err(e) => {
                            drop(decoder);
                            on_closed(self, &format!("frame decode error: {e}"));
                            return;
                        }
                    }
                }
            } else if n == 0 {
                on_closed(self, "peer closed connection");
                return;
            } else {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return;
                }
                on_closed(self, &format!("read error: {err}"));
                return;
            }
        }
    }

    /// Copies `bytes` then dispatches a task that writes directly if the
    /// pending buffer is empty, or appends and arms write-readiness.
    pub fn send(self: &Arc<Self>, bytes: Vec<u8>, worker_pool: &WorkerPool) {
        let conn = self.clone();
        worker_pool.enqueue_to(self.thread_index, move || {
            conn.do_send(bytes);
        });
    }

    fn do_send(self: &Arc<Self>, bytes: Vec<u8>) {
        let mut state = self.write_state.lock();
        if state.pending.is_empty() {
            drop(state);
            self.write_now(bytes);
        } else {
            state.pending.extend_from_slice(&bytes);
            if !state.write_armed {
                state.write_armed = true;
                self.reactor.modify_fd(self.fd, EventMask::READ | EventMask::WRITE, {
                    let conn = self.clone();
                    Some(Box::new(move |_fd| conn.on_writable()))
                });
            }
        }
    }

    fn write_now(self: &Arc<Self>, bytes: Vec<u8>) {
        let written = unsafe { libc::write(self.fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if written < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::WouldBlock {
                warn!(fd = self.fd, error = %err, "write failed");
            }
            let mut state = self.write_state.lock();
            state.pending.extend_from_slice(&bytes);
            if !state.write_armed {
                state.write_armed = true;
                let conn = self.clone();
                self.reactor
                    .modify_fd(self.fd, EventMask::READ | EventMask::WRITE, Some(Box::new(move |_fd| conn.on_writable())));
            }
        } else if (written as usize) < bytes.len() {
            let mut state = self.write_state.lock();
            state.pending.extend_from_slice(&bytes[written as usize..]);
            if !state.write_armed {
                state.write_armed = true;
                let conn = self.clone();
                self.reactor
                    .modify_fd(self.fd, EventMask::READ | EventMask::WRITE, Some(Box::new(move |_fd| conn.on_writable())));
            }
        }
    }

    fn on_writable(self: &Arc<Self>) {
        let mut state = self.write_state.lock();
        while !state.pending.is_empty() {
            let written = unsafe {
                libc::write(self.fd, state.pending.as_ptr() as *const libc::c_void, state.pending.len())
            };
            if written < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return;
                }
                warn!(fd = self.fd, error = %err, "write failed while draining buffer");
                return;
            }
            state.pending.drain(..written as usize);
        }
        state.write_armed = false;
        self.reactor.modify_fd(self.fd, EventMask::READ, None);
    }

    pub fn close(&self) {
        debug!(fd = self.fd, "closing connection");
        self.reactor.remove_fd(self.fd);
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Shared codec instance; stateless, so one per process is enough.
pub fn shared_codec() -> &'static Codec {
    static CODEC: std::sync::OnceLock<Codec> = std::sync::OnceLock::new();
    CODEC.get_or_init(Codec::default)
}
