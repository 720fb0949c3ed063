//! Listener setup and the accept loop.

use crate::conn::ConnTask;
use crate::proto::Handler;
use skein_runtime::net::Socket;
use skein_runtime::op::{Op, Outcome};
use skein_runtime::task::{Coroutine, Step, from_fn};
use skein_types::Error;
use std::net::SocketAddr;
use std::rc::Rc;
use tracing::{debug, warn};

/// Open a listening socket on `addr` with a standard backlog.
pub fn listen(addr: SocketAddr) -> Result<Socket, Error> {
    let sock = if addr.is_ipv4() {
        Socket::stream_v4()
    } else {
        Socket::stream_v6()
    }
    .map_err(|e| Error::socket(&e))?;
    sock.set_reuse_address(true).map_err(|e| Error::socket(&e))?;
    sock.bind(addr).map_err(|e| Error::socket(&e))?;
    sock.listen(128).map_err(|e| Error::socket(&e))?;
    Ok(sock)
}

/// The accept loop: park on `Accept` forever, spawn one detached
/// connection task per accepted socket. Returns cleanly when the
/// listener is closed.
pub fn serve(listener: Socket, handler: Rc<dyn Handler>) -> impl Coroutine {
    from_fn(move |_cx, input| match input {
        Ok(Outcome::Started) | Ok(Outcome::Spawned(_)) => {
            Ok(Step::Yield(listener.accept().no_timeout()))
        }
        Ok(Outcome::Accepted(conn, peer)) => {
            debug!(%peer, "accepted");
            Ok(Step::Yield(Op::spawn_detached(ConnTask::new(
                conn,
                handler.clone(),
            ))))
        }
        Ok(other) => {
            debug_assert!(false, "unexpected outcome {other:?}");
            Ok(Step::Yield(listener.accept().no_timeout()))
        }
        // Listener closed: orderly shutdown.
        Err(Error::ConnectionClosed) => Ok(Step::unit()),
        Err(err) => {
            // Transient accept failures (e.g. a connection aborted
            // before accept) do not take the server down.
            warn!(%err, "accept failed");
            Ok(Step::Yield(listener.accept().no_timeout()))
        }
    })
}
