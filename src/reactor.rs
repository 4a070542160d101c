//! Readiness events and the event-loop seam.
//!
//! The mux never waits on descriptors itself. It publishes per-fd interest
//! through a [`Registrar`] and consumes readiness events delivered by
//! whoever runs the loop. [`PollReactor`] is a minimal `poll(2)` loop that
//! satisfies the contract for single-threaded deployments; tests substitute
//! a recording registrar and deliver events by hand.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

bitflags! {
    /// Readiness interest and event bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Events: u8 {
        /// The descriptor has bytes to read (or EOF/hangup to observe).
        const READ  = 0b001;
        /// The descriptor can accept writes.
        const WRITE = 0b010;
        /// The descriptor is in an error state.
        const ERROR = 0b100;
    }
}

/// Interest sink the mux publishes to.
///
/// Implementations take `&self`; a real reactor shares its table with the
/// polling side, a test registrar just records.
pub trait Registrar {
    /// Replace the interest set for `fd`. Registers the fd on first use.
    fn update(&self, fd: RawFd, interest: Events);

    /// Forget `fd` entirely. Called right before the fd is closed.
    fn remove(&self, fd: RawFd);
}

/// Shared fd -> interest table behind the poll reactor.
type InterestTable = Arc<Mutex<HashMap<RawFd, Events>>>;

struct PollRegistrar {
    table: InterestTable,
}

impl Registrar for PollRegistrar {
    fn update(&self, fd: RawFd, interest: Events) {
        self.table.lock().insert(fd, interest);
    }

    fn remove(&self, fd: RawFd) {
        self.table.lock().remove(&fd);
    }
}

/// A `poll(2)`-based event loop.
pub struct PollReactor {
    table: InterestTable,
}

impl PollReactor {
    /// Create a reactor with an empty registration table.
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The registrar handle to hand to the mux.
    pub fn registrar(&self) -> Arc<dyn Registrar> {
        Arc::new(PollRegistrar {
            table: self.table.clone(),
        })
    }

    /// Number of registered descriptors.
    pub fn registered(&self) -> usize {
        self.table.lock().len()
    }

    /// Wait up to `timeout_ms` (-1 = forever) and deliver pending events.
    ///
    /// Returns the number of descriptors that fired. `on_event` receives
    /// each ready fd with its event set; READ/WRITE are masked by the
    /// registered interest, ERROR is always delivered.
    pub fn poll_once(
        &self,
        timeout_ms: i32,
        mut on_event: impl FnMut(RawFd, Events),
    ) -> io::Result<usize> {
        let snapshot: Vec<(RawFd, Events)> = self
            .table
            .lock()
            .iter()
            .map(|(fd, interest)| (*fd, *interest))
            .collect();

        let mut pollfds: Vec<libc::pollfd> = snapshot
            .iter()
            .map(|(fd, interest)| {
                let mut events: libc::c_short = 0;
                if interest.contains(Events::READ) {
                    events |= libc::POLLIN;
                }
                if interest.contains(Events::WRITE) {
                    events |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd: *fd,
                    events,
                    revents: 0,
                }
            })
            .collect();

        let ret = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let mut fired = 0;
        for (pfd, (fd, interest)) in pollfds.iter().zip(snapshot.iter()) {
            let mut events = Events::empty();
            // A hangup is delivered as a readable event so the stream's
            // read path observes the EOF and runs its close sequence.
            if pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0 {
                events |= Events::READ;
            }
            if pfd.revents & libc::POLLOUT != 0 {
                events |= Events::WRITE;
            }
            events &= *interest;
            if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                events |= Events::ERROR;
            }
            if !events.is_empty() {
                fired += 1;
                on_event(*fd, events);
            }
        }
        Ok(fired)
    }
}

impl Default for PollReactor {
    fn default() -> Self {
        Self::new()
    }
}
