//! Listening sockets and the accept loop (spec §5), adapted from the teacher's `Listener`.

use std::io;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error};

use crate::error::{Error, Result};

const LISTEN_BACKLOG: u32 = 1024;

pub struct Listener {
    pub address: String,
    listener: TcpListener,
}

impl Listener {
    pub fn new(address: String, reuseport: bool) -> Result<Self> {
        let addr = address.parse()?;
        let sock = TcpSocket::new_v4()?;
        #[cfg(unix)]
        {
            if reuseport {
                sock.set_reuseport(true)?;
            }
            // The client always sends the first data after connecting; defer the accept
            // until there's something to read so a recv task doesn't wake up for nothing.
            #[cfg(target_os = "linux")]
            unsafe {
                let optval: libc::c_int = 1;
                let ret = libc::setsockopt(
                    sock.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::TCP_DEFER_ACCEPT,
                    &optval as *const _ as *const libc::c_void,
                    std::mem::size_of_val(&optval) as libc::socklen_t,
                );
                if ret != 0 {
                    return Err(Error::from(io::Error::last_os_error()));
                }
            }
        }
        sock.bind(addr)?;
        let listener = sock.listen(LISTEN_BACKLOG)?;
        Ok(Self { address, listener })
    }

    /// Accept the next connection, transparently retrying on the handful of errno values
    /// that are recoverable (out of descriptors, interrupted syscall, etc). Returns `None`
    /// only once the listening socket itself has been closed.
    pub async fn accept(&self) -> Option<TcpStream> {
        loop {
            match self.listener.accept().await {
                Ok((sock, remote_addr)) => {
                    debug!(server = %self.address, %remote_addr, "accepted connection");
                    return Some(sock);
                }
                Err(e) => {
                    if cfg!(unix) {
                        match e.raw_os_error().unwrap_or(0) {
                            libc::ECONNABORTED
                            | libc::EMFILE
                            | libc::ENFILE
                            | libc::ENOBUFS
                            | libc::ENOMEM
                            | libc::EPROTO
                            | libc::EINTR => {
                                error!(%e, server = %self.address, "accept error, retrying");
                                continue;
                            }
                            libc::EBADF => return None,
                            _ => panic!("unrecoverable accept error on {}: {}", self.address, e),
                        }
                    }
                    return None;
                }
            }
        }
    }
}
