// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Named duplex byte channel between the real-time and non-real-time domains.
//!
//! A [`DuplexChannel`] is a pair of framed SPSC queues, one per direction,
//! split into a [`RtEndpoint`] and a [`HostEndpoint`]. Each endpoint sends on
//! one queue and receives on the other, so the two domains never share a lock.
//!
//! Framing is per call: a `send` of N elements is received as one chunk of N
//! elements by a non-blocking `receive` with room for it. Both ends must agree
//! on the element type out of band.
//!
//! ```
//! use uacbridge_rt::{ChannelError, DuplexChannel};
//!
//! let (mut rt, mut host) = DuplexChannel::new("demo", 4096, false)?.split();
//! rt.send(&[0.5f32; 64])?;
//!
//! let mut buf = [0.0f32; 256];
//! assert_eq!(host.receive(&mut buf)?, 64);
//! assert_eq!(host.receive(&mut buf), Err(ChannelError::WouldBlock));
//! # Ok::<(), ChannelError>(())
//! ```

use crate::byte_queue::{ByteQueue, Consumer, Producer, PushError, HEADER_LEN};
use crate::stop::StopSignal;
use bytemuck::Pod;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Default byte capacity per direction.
pub const DEFAULT_CAPACITY: usize = 65536 * 128;

/// Smallest accepted byte capacity per direction.
pub const MIN_CAPACITY: usize = 64;

/// How long a blocked endpoint sleeps before re-checking its condition.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Root under which host endpoints are addressed.
pub const DEFAULT_REGISTRY_ROOT: &str = "/run/uacbridge/xddp";

/// Prefix applied to channel names to form the transport name.
pub const TRANSPORT_PREFIX: &str = "p_";

const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Invalid channel name: {0:?}")]
    InvalidName(String),
    #[error("Channel capacity of {0} bytes is below the minimum")]
    CapacityTooSmall(usize),
    #[error("Channel already exists: {0}")]
    AlreadyExists(String),
    #[error("No channel at {0}")]
    NotFound(String),
    #[error("Channel endpoint already open: {0}")]
    InUse(String),
    #[error("Operation would block")]
    WouldBlock,
    #[error("Message of {0} bytes can never fit in the channel")]
    TooLarge(usize),
    #[error("Channel closed by peer")]
    Closed,
}

/// Scheduling domain an endpoint lives in.
pub trait Domain {
    const LABEL: &'static str;
}

/// Marker for the hard real-time side.
#[derive(Debug)]
pub struct RealTime;

/// Marker for the general-purpose side.
#[derive(Debug)]
pub struct NonRealTime;

impl Domain for RealTime {
    const LABEL: &'static str = "rt";
}

impl Domain for NonRealTime {
    const LABEL: &'static str = "nrt";
}

pub type RtEndpoint = Endpoint<RealTime>;
pub type HostEndpoint = Endpoint<NonRealTime>;

/// Tracks how long a blocking operation has been waiting.
struct WaitBudget {
    timeout: Option<Duration>,
    started: Option<Instant>,
}

impl WaitBudget {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            started: None,
        }
    }

    fn expired(&mut self) -> bool {
        match self.timeout {
            None => false,
            Some(timeout) => self.started.get_or_insert_with(Instant::now).elapsed() >= timeout,
        }
    }
}

/// One side of a [`DuplexChannel`].
///
/// Non-blocking by default unless the channel was created blocking. A blocking
/// operation waits until it completes, the peer disconnects, the observed
/// [`StopSignal`] is raised, or the optional timeout expires.
pub struct Endpoint<D> {
    name: Arc<str>,
    tx: Producer,
    rx: Consumer,
    blocking: bool,
    timeout: Option<Duration>,
    poll_interval: Duration,
    stop: Option<StopSignal>,
    _domain: PhantomData<D>,
}

impl<D: Domain> Endpoint<D> {
    fn new(name: Arc<str>, tx: Producer, rx: Consumer, blocking: bool) -> Self {
        Self {
            name,
            tx,
            rx,
            blocking,
            timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop: None,
            _domain: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn set_blocking(&mut self, blocking: bool) {
        trace!("{}[{}]: blocking={}", self.name, D::LABEL, blocking);
        self.blocking = blocking;
    }

    /// Upper bound on any single blocking operation. `None` waits forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval.max(Duration::from_micros(100));
    }

    /// Abort blocking waits once `stop` is raised.
    pub fn observe(&mut self, stop: StopSignal) {
        self.stop = Some(stop);
    }

    /// Bytes queued toward this endpoint, framing included.
    pub fn pending_bytes(&self) -> usize {
        self.rx.queue().used()
    }

    /// True once the peer endpoint has been dropped.
    pub fn is_peer_closed(&self) -> bool {
        self.tx.queue().is_consumer_closed() || self.rx.queue().is_producer_closed()
    }

    fn stop_raised(&self) -> bool {
        self.stop.as_ref().is_some_and(StopSignal::is_raised)
    }

    /// Send `data` as one message. All or nothing.
    ///
    /// Fails with [`ChannelError::WouldBlock`] when a non-blocking endpoint
    /// lacks room, or when a blocking wait is cut short.
    pub fn send<T: Pod>(&mut self, data: &[T]) -> Result<(), ChannelError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.is_empty() {
            return Ok(());
        }

        let mut budget = WaitBudget::new(self.timeout);
        loop {
            match self.tx.push(bytes) {
                Ok(()) => return Ok(()),
                Err(PushError::TooLarge) => return Err(ChannelError::TooLarge(bytes.len())),
                Err(PushError::Disconnected) => return Err(ChannelError::Closed),
                Err(PushError::Full) => {
                    if !self.blocking || self.stop_raised() || budget.expired() {
                        return Err(ChannelError::WouldBlock);
                    }
                    self.tx.queue().wait_writable(self.poll_interval);
                }
            }
        }
    }

    pub fn send_value<T: Pod>(&mut self, value: &T) -> Result<(), ChannelError> {
        self.send(std::slice::from_ref(value))
    }

    /// Receive into `dst`, returning the number of elements received.
    ///
    /// Non-blocking: returns at most one message (or the rest of one), and
    /// [`ChannelError::WouldBlock`] immediately when nothing is queued.
    ///
    /// Blocking: accumulates across messages until `dst` is full. Returns a
    /// short count if the peer disconnects, the stop signal is raised, or the
    /// timeout expires after some data arrived.
    pub fn receive<T: Pod>(&mut self, dst: &mut [T]) -> Result<usize, ChannelError> {
        let element = std::mem::size_of::<T>();
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(dst);
        if bytes.is_empty() {
            return Ok(0);
        }

        if !self.blocking {
            let count = self.rx.pop_into(bytes);
            if count > 0 {
                return Ok(count / element);
            }
            return Err(self.empty_error());
        }

        let mut filled = 0;
        let mut budget = WaitBudget::new(self.timeout);
        while filled < bytes.len() {
            let count = self.rx.pop_into(&mut bytes[filled..]);
            if count > 0 {
                filled += count;
                continue;
            }
            if self.rx.queue().is_producer_closed() && self.rx.is_drained() {
                break;
            }
            if self.stop_raised() || budget.expired() {
                break;
            }
            self.rx.queue().wait_readable(self.poll_interval);
        }

        match filled {
            0 => Err(self.empty_error()),
            filled => Ok(filled / element),
        }
    }

    pub fn receive_value<T: Pod>(&mut self, dst: &mut T) -> Result<usize, ChannelError> {
        self.receive(std::slice::from_mut(dst))
    }

    fn empty_error(&self) -> ChannelError {
        if self.rx.queue().is_producer_closed() && self.rx.is_drained() {
            ChannelError::Closed
        } else {
            ChannelError::WouldBlock
        }
    }
}

impl Endpoint<RealTime> {
    /// Run `f` with blocking enabled and every wait capped at `timeout`, then
    /// restore the previous mode and timeout.
    ///
    /// A blocked real-time endpoint stalls the audio deadline, so blocking on
    /// this side is only ever scoped to a short, bounded wait.
    pub fn with_blocking<R>(&mut self, timeout: Duration, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = (self.blocking, self.timeout);
        self.blocking = true;
        self.timeout = Some(timeout);
        let result = f(self);
        (self.blocking, self.timeout) = previous;
        result
    }
}

impl<D: Domain> std::fmt::Debug for Endpoint<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("domain", &D::LABEL)
            .field("blocking", &self.blocking)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A named, bounded, bidirectional channel.
pub struct DuplexChannel {
    name: Arc<str>,
    capacity: usize,
    rt: RtEndpoint,
    host: HostEndpoint,
}

impl DuplexChannel {
    /// Create a channel with `capacity` bytes per direction.
    ///
    /// The capacity is rounded up to a power of two. `blocking` sets the
    /// initial mode of both endpoints.
    pub fn new(name: &str, capacity: usize, blocking: bool) -> Result<Self, ChannelError> {
        validate_name(name)?;
        if capacity < MIN_CAPACITY {
            return Err(ChannelError::CapacityTooSmall(capacity));
        }

        let to_host = ByteQueue::new(capacity);
        let to_rt = ByteQueue::new(capacity);
        let capacity = to_host.capacity();
        let name: Arc<str> = Arc::from(name);

        let rt = Endpoint::new(
            Arc::clone(&name),
            Producer::new(Arc::clone(&to_host)),
            Consumer::new(Arc::clone(&to_rt)),
            blocking,
        );
        let host = Endpoint::new(
            Arc::clone(&name),
            Producer::new(to_rt),
            Consumer::new(to_host),
            blocking,
        );

        debug!(
            "Created channel {} ({} bytes per direction, blocking={})",
            name, capacity, blocking
        );
        Ok(Self {
            name,
            capacity,
            rt,
            host,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes per direction, framing included.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest single message payload this channel can ever carry.
    pub fn max_message_bytes(&self) -> usize {
        self.capacity - HEADER_LEN
    }

    pub fn split(self) -> (RtEndpoint, HostEndpoint) {
        (self.rt, self.host)
    }
}

fn validate_name(name: &str) -> Result<(), ChannelError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ChannelError::InvalidName(name.to_string()))
    }
}

/// Hands out channels by name and their host endpoints by path.
///
/// The real-time side creates a channel and keeps its [`RtEndpoint`]; the
/// host endpoint is parked here until the non-real-time side opens it at
/// [`path_for`](Self::path_for). Each host endpoint can be opened once.
pub struct ChannelRegistry {
    root: PathBuf,
    hosts: Mutex<HashMap<String, Option<HostEndpoint>>>,
}

impl ChannelRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path at which the host endpoint of `name` is addressed.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", TRANSPORT_PREFIX, name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hosts.lock().contains_key(name)
    }

    /// Create and register a channel, returning its real-time endpoint.
    pub fn create(
        &self,
        name: &str,
        capacity: usize,
        blocking: bool,
    ) -> Result<RtEndpoint, ChannelError> {
        let mut hosts = self.hosts.lock();
        if hosts.contains_key(name) {
            return Err(ChannelError::AlreadyExists(name.to_string()));
        }

        let (rt, host) = DuplexChannel::new(name, capacity, blocking)?.split();
        hosts.insert(name.to_string(), Some(host));
        info!(
            "Registered channel {} at {}",
            name,
            self.path_for(name).display()
        );
        Ok(rt)
    }

    /// Take the host endpoint addressed by `path`.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<HostEndpoint, ChannelError> {
        let path = path.as_ref();
        let not_found = || ChannelError::NotFound(path.display().to_string());

        let name = path
            .strip_prefix(&self.root)
            .ok()
            .and_then(|rest| rest.to_str())
            .and_then(|rest| rest.strip_prefix(TRANSPORT_PREFIX))
            .ok_or_else(not_found)?;

        let mut hosts = self.hosts.lock();
        match hosts.get_mut(name) {
            None => Err(not_found()),
            Some(slot) => slot
                .take()
                .ok_or_else(|| ChannelError::InUse(name.to_string())),
        }
    }

    /// Forget `name`, closing its host endpoint if it was never opened.
    pub fn release(&self, name: &str) -> bool {
        self.hosts.lock().remove(name).is_some()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_ROOT)
    }
}
