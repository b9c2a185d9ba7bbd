use std::time::Duration;
#[cfg(test)] use mockall::automock;
use tokio::time::Instant;
use tracing::trace;

/// The event-notification side of a [crate::channel::Channel]: the channel tells its reactor which
///  events it is interested in, and the reactor's owner calls the channel's `on_readable`,
///  `on_writable` and `on_timer` when those events occur.
///
/// Read and write interest are persistent: once registered, the corresponding event is reported
///  every time the socket is ready until the interest is deregistered. The timer is one-shot, and
///  there is at most one timer per channel - scheduling a timer replaces a previously scheduled one.
#[cfg_attr(test, automock)]
pub trait Reactor: Send + 'static {
    fn register_read(&mut self);
    fn deregister_read(&mut self);

    fn register_write(&mut self);
    fn deregister_write(&mut self);

    fn schedule_timer(&mut self, after: Duration);
    fn cancel_timer(&mut self);
}

/// A [Reactor] that only records registrations. It is the bookkeeping part of
///  [crate::channel::event_loop::EventLoop], which waits for the registered events.
#[derive(Debug, Default)]
pub struct Registrations {
    read: bool,
    write: bool,
    timer_deadline: Option<Instant>,
}

impl Registrations {
    pub fn is_read_registered(&self) -> bool {
        self.read
    }

    pub fn is_write_registered(&self) -> bool {
        self.write
    }

    pub fn timer_deadline(&self) -> Option<Instant> {
        self.timer_deadline
    }

    /// to be called by the event loop before it dispatches an expired timer: the timer is
    ///  one-shot, so it is no longer pending once it fired
    pub fn on_timer_expired(&mut self) {
        self.timer_deadline = None;
    }
}

impl Reactor for Registrations {
    fn register_read(&mut self) {
        self.read = true;
    }

    fn deregister_read(&mut self) {
        self.read = false;
    }

    fn register_write(&mut self) {
        self.write = true;
    }

    fn deregister_write(&mut self) {
        self.write = false;
    }

    fn schedule_timer(&mut self, after: Duration) {
        trace!("scheduling timer in {:?}", after);
        self.timer_deadline = Some(Instant::now() + after);
    }

    fn cancel_timer(&mut self) {
        self.timer_deadline = None;
    }
}
