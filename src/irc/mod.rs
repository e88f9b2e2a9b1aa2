pub mod codec;
pub mod message;
pub mod session;
pub mod supervisor;

use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe alias for the byte streams sessions and transfers run over
/// (plain TCP or TLS).
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}
