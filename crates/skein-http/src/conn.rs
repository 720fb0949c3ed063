//! Per-connection task: read request heads, invoke the handler, write
//! responses, honor keep-alive.

use crate::proto::{
    Body, Handler, HttpVersion, Request, Response, parse_header_line, parse_request_line,
};
use skein_runtime::net::{BufferedStream, LineStep, Socket};
use skein_runtime::op::Outcome;
use skein_runtime::task::{Coroutine, Resume, Step, TaskCx};
use skein_types::Error;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Request heads larger than this are answered with a 400.
const HEAD_LINE_LIMIT: usize = 8 * 1024;

static CONN_SEQ: AtomicU64 = AtomicU64::new(0);

enum State {
    RequestLine,
    Headers,
    /// Head bytes are in flight; the body follows.
    SendHead { body: Option<Body>, keep_alive: bool },
    /// Body bytes (or file) are in flight.
    SendBody { keep_alive: bool },
    Closing,
    Finished,
}

/// One accepted connection, driven as a coroutine.
pub struct ConnTask {
    sock: Socket,
    stream: BufferedStream,
    handler: Rc<dyn Handler>,
    state: State,
    head: Option<(String, String, HttpVersion)>,
    headers: Vec<(String, String)>,
    conn_id: u64,
    served: u64,
}

impl ConnTask {
    pub fn new(sock: Socket, handler: Rc<dyn Handler>) -> Self {
        let stream = sock.makefile().with_limit(HEAD_LINE_LIMIT);
        ConnTask {
            sock,
            stream,
            handler,
            state: State::RequestLine,
            head: None,
            headers: Vec::new(),
            conn_id: CONN_SEQ.fetch_add(1, Ordering::Relaxed),
            served: 0,
        }
    }

    /// Build the request, run the handler, start writing the head.
    fn dispatch(&mut self) -> Result<Step, Error> {
        let (method, target, version) = self.head.take().expect("request line parsed");
        let req = Request {
            method,
            target,
            version,
            headers: std::mem::take(&mut self.headers),
        };
        trace!(conn = self.conn_id, method = %req.method, target = %req.target, "request");

        // Bodies are not consumed; answering and closing keeps the
        // stream in sync.
        let keep_alive = req.wants_keep_alive() && req.content_length().unwrap_or(0) == 0;
        let resp = match self.handler.handle(&req) {
            Ok(resp) => resp,
            Err(err) => {
                warn!(conn = self.conn_id, %err, "handler failed");
                Response::new(500, "Internal Server Error")
                    .with_body(Body::Bytes(b"internal server error".to_vec()))
            }
        };
        let head = resp.render_head(req.version, keep_alive);
        self.served += 1;
        self.state = State::SendHead {
            body: Some(resp.body),
            keep_alive,
        };
        Ok(Step::Yield(self.sock.send_all(head)))
    }

    /// Minimal error response; always closes the connection after.
    fn refuse(&mut self, status: u16, reason: &str) -> Result<Step, Error> {
        debug!(conn = self.conn_id, status, "refusing request");
        let resp = Response::new(status, reason)
            .with_body(Body::Bytes(format!("{status} {reason}").into_bytes()));
        let head = resp.render_head(HttpVersion::H11, false);
        self.state = State::SendHead {
            body: Some(resp.body),
            keep_alive: false,
        };
        Ok(Step::Yield(self.sock.send_all(head)))
    }
}

impl Coroutine for ConnTask {
    fn resume(&mut self, _cx: &mut TaskCx<'_>, input: Resume) -> Result<Step, Error> {
        let mut input = Some(input);
        loop {
            match &mut self.state {
                State::RequestLine | State::Headers => {
                    if let Some(inp) = input.take() {
                        match inp {
                            Ok(Outcome::Started) => {}
                            Ok(Outcome::Bytes(bytes)) => self.stream.feed(&bytes),
                            Ok(other) => {
                                debug_assert!(false, "unexpected outcome {other:?}");
                            }
                            // Peer went away, or went idle past the
                            // socket deadline: nothing left to answer.
                            Err(Error::ConnectionClosed | Error::Timeout) => {
                                self.state = State::Closing;
                                continue;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    match self.stream.read_line() {
                        Ok(LineStep::Line(line)) => match &self.state {
                            State::RequestLine => {
                                if line == b"\r\n" || line == b"\n" {
                                    // Stray blank line between requests.
                                    continue;
                                }
                                match parse_request_line(&line) {
                                    Some(head) => {
                                        self.head = Some(head);
                                        self.state = State::Headers;
                                    }
                                    None => return self.refuse(400, "Bad Request"),
                                }
                            }
                            _ => {
                                if line == b"\r\n" || line == b"\n" {
                                    return self.dispatch();
                                }
                                match parse_header_line(&line) {
                                    Some(header) => self.headers.push(header),
                                    None => return self.refuse(400, "Bad Request"),
                                }
                            }
                        },
                        Ok(LineStep::More(op)) => return Ok(Step::Yield(op)),
                        Err(Error::Protocol(reason)) => {
                            debug!(conn = self.conn_id, reason = %reason, "oversized head");
                            return self.refuse(400, "Bad Request");
                        }
                        Err(err) => return Err(err),
                    }
                }
                State::SendHead { .. } => {
                    if let Some(inp) = input.take() {
                        inp?;
                    }
                    let State::SendHead { body, keep_alive } =
                        std::mem::replace(&mut self.state, State::RequestLine)
                    else {
                        unreachable!();
                    };
                    match body {
                        Some(Body::Bytes(bytes)) if !bytes.is_empty() => {
                            self.state = State::SendBody { keep_alive };
                            return Ok(Step::Yield(self.sock.send_all(bytes)));
                        }
                        Some(Body::File(file, len)) => {
                            self.state = State::SendBody { keep_alive };
                            let op = self
                                .sock
                                .sendfile(file, Some(0), Some(len))
                                .map_err(|e| Error::socket(&e))?;
                            return Ok(Step::Yield(op));
                        }
                        _ => {
                            if keep_alive {
                                self.state = State::RequestLine;
                            } else {
                                self.state = State::Closing;
                            }
                        }
                    }
                }
                State::SendBody { keep_alive } => {
                    let keep = *keep_alive;
                    if let Some(inp) = input.take() {
                        inp?;
                    }
                    if keep {
                        self.state = State::RequestLine;
                    } else {
                        self.state = State::Closing;
                    }
                }
                State::Closing => {
                    self.state = State::Finished;
                    return Ok(Step::Yield(self.sock.close()));
                }
                State::Finished => {
                    let _ = input.take();
                    debug!(conn = self.conn_id, served = self.served, "connection done");
                    return Ok(Step::unit());
                }
            }
        }
    }
}
