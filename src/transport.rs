//! TLS/plaintext transport unification (spec §4.6), adapted from the teacher's
//! `TransportTls` wrapper. Differs from the teacher's version in one respect: the teacher
//! pumps TLS directly against a borrowed `TcpStream` reader/writer; here the backend owns the
//! plaintext on both sides (the `RecvBuffer` decrypted bytes land in, and the `Writer` chain
//! encrypted bytes are read from), since the backend — not a per-connection protocol struct —
//! drives the handshake and socket I/O loop.

use std::io;

use rustls::{ClientConnection, Connection, IoState, Reader, ServerConnection, Writer as RustlsWriter};

pub enum Transport {
    Plain,
    TlsClient(ClientConnection),
    TlsServer(ServerConnection),
}

impl Transport {
    pub const fn plain() -> Self {
        Self::Plain
    }

    pub fn tls_client(conn: ClientConnection) -> Self {
        Self::TlsClient(conn)
    }

    pub fn tls_server(conn: ServerConnection) -> Self {
        Self::TlsServer(conn)
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, Transport::Plain)
    }

    pub fn wants_write(&self) -> bool {
        match self {
            Transport::Plain => false,
            Transport::TlsClient(c) => c.wants_write(),
            Transport::TlsServer(c) => c.wants_write(),
        }
    }

    pub fn wants_read(&self) -> bool {
        match self {
            Transport::Plain => false,
            Transport::TlsClient(c) => c.wants_read(),
            Transport::TlsServer(c) => c.wants_read(),
        }
    }

    pub fn is_handshaking(&self) -> bool {
        match self {
            Transport::Plain => false,
            Transport::TlsClient(c) => c.is_handshaking(),
            Transport::TlsServer(c) => c.is_handshaking(),
        }
    }

    /// Feed raw bytes read off the socket into the TLS state machine's ciphertext buffer.
    pub fn read_tls(&mut self, rd: &mut dyn io::Read) -> io::Result<usize> {
        match self {
            Transport::Plain => panic!("not a tls connection"),
            Transport::TlsClient(c) => c.read_tls(rd),
            Transport::TlsServer(c) => c.read_tls(rd),
        }
    }

    /// Drain pending ciphertext the TLS state machine wants written to the socket.
    pub fn write_tls(&mut self, wr: &mut dyn io::Write) -> io::Result<usize> {
        match self {
            Transport::Plain => panic!("not a tls connection"),
            Transport::TlsClient(c) => c.write_tls(wr),
            Transport::TlsServer(c) => c.write_tls(wr),
        }
    }

    pub fn process_new_packets(&mut self) -> Result<IoState, rustls::Error> {
        match self {
            Transport::Plain => panic!("not a tls connection"),
            Transport::TlsClient(c) => c.process_new_packets(),
            Transport::TlsServer(c) => c.process_new_packets(),
        }
    }

    /// A reader over decrypted plaintext, ready after `process_new_packets` reports bytes
    /// are available.
    pub fn reader(&mut self) -> Reader {
        match self {
            Transport::Plain => panic!("not a tls connection"),
            Transport::TlsClient(c) => c.reader(),
            Transport::TlsServer(c) => c.reader(),
        }
    }

    /// A writer that buffers plaintext for TLS to encrypt on the next `write_tls` pass.
    pub fn writer(&mut self) -> RustlsWriter {
        match self {
            Transport::Plain => panic!("not a tls connection"),
            Transport::TlsClient(c) => c.writer(),
            Transport::TlsServer(c) => c.writer(),
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Plain
    }
}
