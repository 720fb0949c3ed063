//! The socket layer: non-blocking socket wrapper and the buffered
//! line/byte stream adapter.

mod socket;
mod stream;

pub(crate) use socket::SENDFILE_BLOCKSIZE;
pub use socket::Socket;
pub use stream::{BufferedStream, LineStep, ReadStep};
