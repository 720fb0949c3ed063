//! Readiness-based proactor backend on top of mio.
//!
//! Per socket: a read queue (`Recv`, `Accept`) and a write queue
//! (`Send`, `SendAll`, `Connect`, `SendFile`) of pending operations.
//! Sockets register lazily on the first submitted operation and
//! deregister once both queues drain. On a readiness event, queued
//! operations are popped in order and attempted until one would block —
//! mio is edge-triggered, so stopping earlier could miss the edge.

use super::attempt::{Attempt, attempt};
use super::{Completion, PollOutput, Proactor};
use crate::net::Socket;
use crate::op::{Direction, OpKind};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use skein_types::{Error, TaskId};
use slab::Slab;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Duration;
use tracing::trace;

struct Pending {
    task: TaskId,
    kind: OpKind,
}

struct Entry {
    sock: Socket,
    read_q: VecDeque<Pending>,
    write_q: VecDeque<Pending>,
    /// Interest currently registered with the OS, if any.
    interest: Option<Interest>,
}

pub struct PollProactor {
    poll: Poll,
    events: Events,
    /// Slab key doubles as the mio token.
    entries: Slab<Entry>,
    /// Where each waiting task's operation is parked.
    by_task: HashMap<TaskId, (usize, Direction)>,
    /// Partially complete operations to re-attempt on the next pass
    /// (only used when `ops_greedy` is off).
    retry: Vec<(usize, Direction)>,
    ops_greedy: bool,
    pending: usize,
}

impl PollProactor {
    pub fn new(ops_greedy: bool) -> io::Result<Self> {
        Ok(PollProactor {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            entries: Slab::new(),
            by_task: HashMap::new(),
            retry: Vec::new(),
            ops_greedy,
            pending: 0,
        })
    }

    fn enqueue(&mut self, task: TaskId, kind: OpKind, sock: &Socket) -> io::Result<()> {
        let Some(dir) = kind.direction() else {
            unreachable!("{} has no proactor queue", kind.name());
        };
        let token = match sock.token() {
            Some(t) => t,
            None => {
                let t = self.entries.insert(Entry {
                    sock: sock.clone(),
                    read_q: VecDeque::new(),
                    write_q: VecDeque::new(),
                    interest: None,
                });
                sock.set_token(Some(t));
                t
            }
        };
        let entry = &mut self.entries[token];
        match dir {
            Direction::Read => entry.read_q.push_back(Pending { task, kind }),
            Direction::Write => entry.write_q.push_back(Pending { task, kind }),
        }
        self.by_task.insert(task, (token, dir));
        self.pending += 1;
        self.sync_interest(token)
    }

    /// Reconcile the OS registration with the queue state: register on
    /// first demand, reregister when the interest set changes,
    /// deregister and drop the entry once both queues are empty.
    fn sync_interest(&mut self, token: usize) -> io::Result<()> {
        let Some(entry) = self.entries.get(token) else {
            return Ok(());
        };
        let mut wanted = None;
        if !entry.read_q.is_empty() {
            wanted = Some(Interest::READABLE);
        }
        if !entry.write_q.is_empty() {
            wanted = Some(wanted.map_or(Interest::WRITABLE, |i: Interest| i | Interest::WRITABLE));
        }
        let current = entry.interest;
        let fd = entry.sock.raw_fd();

        match (wanted, current) {
            (None, registered) => {
                let entry = self.entries.remove(token);
                if registered.is_some()
                    && let Some(fd) = fd
                {
                    self.poll.registry().deregister(&mut SourceFd(&fd))?;
                }
                entry.sock.set_token(None);
                Ok(())
            }
            (Some(w), None) => {
                let Some(fd) = fd else {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
                };
                self.poll
                    .registry()
                    .register(&mut SourceFd(&fd), Token(token), w)?;
                self.entries[token].interest = Some(w);
                Ok(())
            }
            (Some(w), Some(c)) if w != c => {
                let Some(fd) = fd else {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
                };
                self.poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Token(token), w)?;
                self.entries[token].interest = Some(w);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Drive one queue until its head would block.
    fn service(&mut self, token: usize, dir: Direction, out: &mut PollOutput) {
        let mut aborted: Option<Socket> = None;
        loop {
            let Some(entry) = self.entries.get_mut(token) else {
                return;
            };
            let q = match dir {
                Direction::Read => &mut entry.read_q,
                Direction::Write => &mut entry.write_q,
            };
            let Some(head) = q.front_mut() else {
                break;
            };
            match attempt(&mut head.kind) {
                Attempt::Complete(outcome) => {
                    let task = head.task;
                    q.pop_front();
                    self.pending -= 1;
                    self.by_task.remove(&task);
                    out.completions.push(Completion {
                        task,
                        result: Ok(outcome),
                    });
                }
                Attempt::Fail(err) => {
                    let task = head.task;
                    q.pop_front();
                    self.pending -= 1;
                    self.by_task.remove(&task);
                    let hard = matches!(err, Error::Socket { .. });
                    out.completions.push(Completion {
                        task,
                        result: Err(err),
                    });
                    if hard {
                        // A hard OS error closes the socket; everything
                        // else pending on it is cancelled.
                        aborted = Some(entry.sock.clone());
                        break;
                    }
                }
                Attempt::Progress => {
                    out.progressed.push(head.task);
                    if self.ops_greedy {
                        continue;
                    }
                    self.retry.push((token, dir));
                    break;
                }
                Attempt::WouldBlock => break,
            }
        }
        if let Some(sock) = aborted {
            self.teardown(&sock, out);
            return;
        }
        if let Err(err) = self.sync_interest(token) {
            trace!(token, %err, "interest sync failed");
        }
    }

    /// Fail everything pending on `sock`, deregister it, destroy the fd.
    fn teardown(&mut self, sock: &Socket, out: &mut PollOutput) {
        if let Some(token) = sock.token()
            && self.entries.contains(token)
        {
            let entry = self.entries.remove(token);
            if entry.interest.is_some()
                && let Some(fd) = entry.sock.raw_fd()
            {
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            }
            for p in entry.read_q.into_iter().chain(entry.write_q) {
                self.by_task.remove(&p.task);
                self.pending -= 1;
                out.completions.push(Completion {
                    task: p.task,
                    result: Err(Error::ConnectionClosed),
                });
            }
        }
        sock.set_token(None);
        sock.mark_closed();
    }
}

impl Proactor for PollProactor {
    fn submit(&mut self, task: TaskId, mut kind: OpKind, run_first: bool, out: &mut PollOutput) {
        let Some(sock) = kind.socket().cloned() else {
            unreachable!("{} is not a socket operation", kind.name());
        };
        if sock.is_closed() {
            out.completions.push(Completion {
                task,
                result: Err(Error::ConnectionClosed),
            });
            return;
        }
        if run_first {
            match attempt(&mut kind) {
                Attempt::Complete(outcome) => {
                    out.completions.push(Completion {
                        task,
                        result: Ok(outcome),
                    });
                    return;
                }
                Attempt::Fail(err) => {
                    let hard = matches!(err, Error::Socket { .. });
                    out.completions.push(Completion {
                        task,
                        result: Err(err),
                    });
                    if hard {
                        self.teardown(&sock, out);
                    }
                    return;
                }
                // Partial progress still parks the operation; the
                // deadline is armed by the scheduler after this returns.
                Attempt::Progress | Attempt::WouldBlock => {}
            }
        }
        if let Err(err) = self.enqueue(task, kind, &sock) {
            out.completions.push(Completion {
                task,
                result: Err(Error::socket(&err)),
            });
        }
    }

    fn cancel(&mut self, task: TaskId) -> bool {
        let Some((token, dir)) = self.by_task.remove(&task) else {
            return false;
        };
        let Some(entry) = self.entries.get_mut(token) else {
            return false;
        };
        let q = match dir {
            Direction::Read => &mut entry.read_q,
            Direction::Write => &mut entry.write_q,
        };
        let before = q.len();
        q.retain(|p| p.task != task);
        let removed = q.len() != before;
        if removed {
            self.pending -= 1;
        }
        if let Err(err) = self.sync_interest(token) {
            trace!(token, %err, "interest sync failed");
        }
        removed
    }

    fn close_socket(&mut self, sock: &Socket, out: &mut PollOutput) {
        self.teardown(sock, out);
    }

    fn run(&mut self, timeout: Duration, out: &mut PollOutput) -> io::Result<()> {
        // Re-attempt partially complete operations from the last pass.
        let retries = std::mem::take(&mut self.retry);
        for (token, dir) in retries {
            self.service(token, dir, out);
        }

        match self.poll.poll(&mut self.events, Some(timeout)) {
            // A signal interrupting the poll is not an error; the
            // scheduler simply comes around again.
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            other => other?,
        }

        let fired: Vec<(usize, bool, bool)> = self
            .events
            .iter()
            .map(|ev| {
                let hup = ev.is_error() || ev.is_read_closed() || ev.is_write_closed();
                (
                    ev.token().0,
                    ev.is_readable() || hup,
                    ev.is_writable() || hup,
                )
            })
            .collect();
        for (token, readable, writable) in fired {
            if readable {
                self.service(token, Direction::Read, out);
            }
            if writable {
                self.service(token, Direction::Write, out);
            }
        }
        Ok(())
    }

    fn pending(&self) -> usize {
        self.pending
    }
}
