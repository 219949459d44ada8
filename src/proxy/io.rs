//! A boxed `AsyncRead + AsyncWrite` trait object so the connection manager
//! can treat a plain `TcpStream`, a client-facing `TlsStream` (interception),
//! and a server-facing `TlsStream` (upstream dial) uniformly, without the
//! teacher's fuller `transport::stream::Socket` abstraction (which also
//! carries connection-info extensions and logging-mode state this proxy's
//! flow model already covers via `Flow`/`HttpRequest::is_secure`).

use tokio::io::{AsyncRead, AsyncWrite};

pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub type BoxedIo = Box<dyn Io>;
