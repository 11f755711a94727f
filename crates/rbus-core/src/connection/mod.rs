//! Connection engine.
//!
//! A [`Connection`] multiplexes method calls, replies and signals over one
//! authenticated stream. It is a cheap cloneable handle; every clone drives
//! the same socket.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!  send/call ───> │ RingQueue    │ ──> sender task ──> socket
//!                 └──────────────┘
//!  socket ──> reader task ─┬─> replies ──> PendingMap ──> PendingReply / callback
//!                          └─> calls, signals ──> worker pool ──> handlers
//! ```
//!
//! # Invariants
//!
//! - Serials are never 0 and increase monotonically per connection.
//! - A call is registered in the pending table before its message is
//!   queued, so its reply can never arrive unmatched.
//! - After disconnect every pending call has resolved with
//!   `org.freedesktop.DBus.Local.Disconnected` and no new call is accepted.
//! - Messages queued before an explicit disconnect are still written.

mod bus_proxy;
mod dispatch;
mod io;
mod pending;
mod transport;
mod worker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::time::Duration;

pub use dispatch::{Interface, MethodError, MethodHandler, SignalHandler, SignalHandlerId};
pub use pending::{PendingReply, ReplyCallback};
pub use transport::BusStream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::dispatch::{ObjectRegistry, Resolved, SignalRegistry};
use self::pending::{reply_result, PendingCall};
use self::worker::WorkerPool;
use crate::address::BusAddress;
use crate::auth::{client_handshake, ClientAuth, Keyring, Mechanisms};
use crate::bus::{errors, signals, LOCAL_INTERFACE, LOCAL_PATH};
use crate::config::ConnectionConfig;
use crate::error::{BusError, BusResult};
use crate::match_rule::MatchRule;
use crate::ring::{PendingMap, RingQueue};
use crate::wire::{Flags, Message, MessageType, Value};

/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a bus or peer connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    guid: Option<String>,
    serial: AtomicU32,
    connected: AtomicBool,
    outgoing: Mutex<RingQueue<Message>>,
    outgoing_ready: Notify,
    pending: Mutex<PendingMap<PendingCall>>,
    pending_errors: Mutex<VecDeque<Message>>,
    objects: RwLock<ObjectRegistry>,
    signals: RwLock<SignalRegistry>,
    workers: WorkerPool,
    shutdown: CancellationToken,
    unique_name: OnceLock<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("unique_name", &self.unique_name())
            .field("guid", &self.inner.guid)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Connection {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Opens a peer-to-peer connection to `address` with default settings.
    ///
    /// No `Hello` is sent; use [`Connection::connect_bus`] for a bus daemon.
    pub async fn connect(address: &str) -> BusResult<Self> {
        Self::connect_with_config(address, ConnectionConfig::default()).await
    }

    /// Opens a connection to the first reachable alternative of `address`.
    pub async fn connect_with_config(address: &str, config: ConnectionConfig) -> BusResult<Self> {
        let mechanisms = Mechanisms::from_names(config.auth_mechanisms.iter().map(String::as_str))?;
        let mut last_error = None;
        for alternative in BusAddress::parse_list(address)? {
            match Self::open(&alternative, &config, mechanisms).await {
                Ok((stream, guid)) => {
                    if let Some(expected) = alternative.guid() {
                        if expected != guid {
                            warn!(%expected, %guid, "server guid differs from address");
                        }
                    }
                    return Ok(Self::start(stream, config, Some(guid)));
                },
                Err(e) => {
                    debug!(address = %alternative, error = %e, "address alternative failed");
                    last_error = Some(e);
                },
            }
        }
        Err(last_error.unwrap_or(BusError::Disconnected))
    }

    /// Connects to a bus daemon and registers with `Hello`.
    pub async fn connect_bus(address: &str) -> BusResult<Self> {
        Self::connect_bus_with_config(address, ConnectionConfig::default()).await
    }

    /// [`Connection::connect_bus`] with explicit settings.
    pub async fn connect_bus_with_config(address: &str, config: ConnectionConfig) -> BusResult<Self> {
        let connection = Self::connect_with_config(address, config).await?;
        if let Err(e) = connection.hello().await {
            connection.disconnect().await;
            return Err(e);
        }
        Ok(connection)
    }

    /// Wraps an already authenticated stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_stream<S>(stream: S, config: ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(stream, config, None)
    }

    async fn open(
        address: &BusAddress,
        config: &ConnectionConfig,
        mechanisms: Mechanisms,
    ) -> BusResult<(BusStream, String)> {
        let endpoint = address.endpoint()?;
        let mut stream = BusStream::connect(&endpoint).await?;
        let keyring = config
            .keyring_dir
            .as_ref()
            .map_or_else(Keyring::for_current_user, Keyring::new);
        let auth = ClientAuth::new(mechanisms).with_keyring(keyring);
        let guid = client_handshake(&mut stream, auth).await?;
        info!(address = %address, %guid, "connected");
        Ok((stream, guid))
    }

    fn start<S>(stream: S, config: ConnectionConfig, guid: Option<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let inner = Arc::new(Inner {
            workers: WorkerPool::spawn(config.worker_threads),
            outgoing: Mutex::new(RingQueue::new(config.queue_capacity)),
            pending: Mutex::new(PendingMap::new(config.pending_capacity)),
            config,
            guid,
            serial: AtomicU32::new(1),
            connected: AtomicBool::new(true),
            outgoing_ready: Notify::new(),
            pending_errors: Mutex::new(VecDeque::new()),
            objects: RwLock::new(ObjectRegistry::default()),
            signals: RwLock::new(SignalRegistry::default()),
            shutdown: CancellationToken::new(),
            unique_name: OnceLock::new(),
            tasks: Mutex::new(Vec::new()),
        });
        let connection = Self { inner };
        let (reader, writer) = tokio::io::split(stream);
        let read_task = tokio::spawn(io::read_loop(connection.clone(), reader));
        let write_task = tokio::spawn(io::write_loop(connection.clone(), writer));
        lock(&connection.inner.tasks).extend([read_task, write_task]);
        connection
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Returns `true` until the connection is closed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Unique name assigned by the bus, once `Hello` has completed.
    #[must_use]
    pub fn unique_name(&self) -> Option<&str> {
        self.inner.unique_name.get().map(String::as_str)
    }

    /// Guid the server presented during authentication.
    #[must_use]
    pub fn server_guid(&self) -> Option<&str> {
        self.inner.guid.as_deref()
    }

    /// Settings in effect.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Pops the oldest Error that could not be matched to a call, including
    /// the one recorded on disconnect.
    #[must_use]
    pub fn take_error(&self) -> Option<BusError> {
        lock(&self.inner.pending_errors)
            .pop_front()
            .and_then(|message| reply_result(message).err())
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn next_serial(&self) -> u32 {
        loop {
            let serial = self.inner.serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }

    /// Queues a message without waiting for a reply. Returns its serial.
    pub fn send(&self, message: Message) -> BusResult<u32> {
        self.enqueue(message, None)
    }

    fn enqueue(&self, mut message: Message, call: Option<PendingCall>) -> BusResult<u32> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        message.validate()?;
        let serial = self.next_serial();
        message.set_serial(serial);
        if let Some(call) = call {
            lock(&self.inner.pending).put(serial, call);
            if !self.is_connected() {
                // Lost a race with disconnect, which already drained the table.
                if let Some(call) = lock(&self.inner.pending).remove(serial) {
                    call.resolve(Err(BusError::Disconnected), &self.inner.workers);
                }
                return Err(BusError::Disconnected);
            }
        }
        lock(&self.inner.outgoing).add(message);
        self.inner.outgoing_ready.notify_one();
        Ok(serial)
    }

    fn check_call(message: &Message) -> BusResult<()> {
        if message.message_type() != MessageType::MethodCall {
            return Err(BusError::invalid_message("only method calls have replies"));
        }
        if message.flags().contains(Flags::NO_REPLY_EXPECTED) {
            return Err(BusError::invalid_message(
                "call is flagged NO_REPLY_EXPECTED; use send",
            ));
        }
        Ok(())
    }

    /// Sends a method call and waits for its reply with the default timeout.
    pub async fn call(&self, message: Message) -> BusResult<Message> {
        self.call_with_timeout(message, self.inner.config.reply_timeout())
            .await
    }

    /// Sends a method call and waits up to `timeout` for its reply.
    ///
    /// On timeout the call is forgotten and a late reply is treated as
    /// unmatched.
    pub async fn call_with_timeout(&self, message: Message, timeout: Duration) -> BusResult<Message> {
        let reply = self.call_async(message)?;
        let serial = reply.serial();
        if let Ok(result) = tokio::time::timeout(timeout, reply).await {
            result
        } else {
            lock(&self.inner.pending).remove(serial);
            debug!(serial, "call timed out");
            Err(BusError::NoReply {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        }
    }

    /// Sends a method call and returns a handle to its future reply.
    pub fn call_async(&self, message: Message) -> BusResult<PendingReply> {
        Self::check_call(&message)?;
        let (sender, receiver) = oneshot::channel();
        let serial = self.enqueue(message, Some(PendingCall::Channel(sender)))?;
        Ok(PendingReply::new(serial, receiver))
    }

    /// Sends a method call; `callback` runs on a worker with the reply.
    pub fn call_with_callback<F>(&self, message: Message, callback: F) -> BusResult<u32>
    where
        F: FnOnce(BusResult<Message>) + Send + 'static,
    {
        Self::check_call(&message)?;
        self.enqueue(message, Some(PendingCall::Callback(Box::new(callback))))
    }

    /// Emits a signal.
    pub fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> BusResult<u32> {
        let signal = Message::signal(path, interface, member)?.with_body(body)?;
        self.send(signal)
    }

    // ========================================================================
    // Objects and signal handlers
    // ========================================================================

    /// Exports `interface` at `path`.
    pub fn export(&self, path: &str, interface: Interface) -> BusResult<()> {
        let name = interface.name().to_string();
        self.inner
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .export(path, interface)?;
        debug!(path, interface = %name, "exported object");
        Ok(())
    }

    /// Removes every interface exported at `path`.
    pub fn unexport(&self, path: &str) -> bool {
        self.inner
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unexport(path)
    }

    /// Runs `handler` for every inbound message matching `rule`.
    ///
    /// This is local only; see [`Connection::add_match`] to also ask the bus
    /// to route matching signals here.
    pub fn add_signal_handler<F>(&self, rule: MatchRule, handler: F) -> SignalHandlerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner
            .signals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add(rule, Arc::new(handler))
    }

    /// Removes a signal handler. Returns `false` if it was not registered.
    pub fn remove_signal_handler(&self, id: SignalHandlerId) -> bool {
        self.take_signal_handler(id).is_some()
    }

    fn take_signal_handler(&self, id: SignalHandlerId) -> Option<MatchRule> {
        self.inner
            .signals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Registers `rule` with the bus and subscribes `handler` to it.
    pub async fn add_match<F>(&self, rule: MatchRule, handler: F) -> BusResult<SignalHandlerId>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.add_match_rule(&rule).await?;
        Ok(self.add_signal_handler(rule, handler))
    }

    /// Undoes [`Connection::add_match`].
    pub async fn remove_match(&self, id: SignalHandlerId) -> BusResult<bool> {
        match self.take_signal_handler(id) {
            Some(rule) => {
                self.remove_match_rule(&rule).await?;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    fn handle_incoming(&self, message: Message) {
        match message.message_type() {
            MessageType::MethodReturn | MessageType::Error => self.handle_reply(message),
            MessageType::MethodCall => {
                let connection = self.clone();
                let queued = self
                    .inner
                    .workers
                    .submit("method-call", move || connection.answer_call(&message));
                if !queued {
                    debug!("dropping method call after shutdown");
                }
            },
            MessageType::Signal => self.deliver_signal(message),
        }
    }

    fn handle_reply(&self, message: Message) {
        let Some(serial) = message.reply_serial() else {
            return;
        };
        let call = lock(&self.inner.pending).remove(serial);
        match call {
            Some(call) => call.resolve(reply_result(message), &self.inner.workers),
            None if message.message_type() == MessageType::Error => {
                debug!(serial, error = ?message.error_name(), "unmatched error reply");
                lock(&self.inner.pending_errors).push_back(message);
            },
            None => debug!(serial, "unmatched method return"),
        }
    }

    fn answer_call(&self, call: &Message) {
        let resolved = self
            .inner
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(call);
        let reply = match resolved {
            Resolved::Reply(reply) => reply,
            Resolved::Handler {
                handler,
                interface,
                out_signature,
            } => dispatch::run_handler(call, &handler, &interface, &out_signature),
        };
        if call.expects_reply() {
            if let Err(e) = self.send(reply) {
                debug!(error = %e, "failed to queue reply");
            }
        }
    }

    fn deliver_signal(&self, message: Message) {
        let handlers = self
            .inner
            .signals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .matching(&message);
        if handlers.is_empty() {
            return;
        }
        let message = Arc::new(message);
        for handler in handlers {
            let message = Arc::clone(&message);
            self.inner
                .workers
                .submit("signal-handler", move || handler(&message));
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Fails a call whose message could not be written.
    fn fail_send(&self, serial: u32, reason: &str) {
        if let Some(call) = lock(&self.inner.pending).remove(serial) {
            call.resolve(
                Err(BusError::method_error(
                    errors::FAILED,
                    format!("Message Failed to Send: {reason}"),
                )),
                &self.inner.workers,
            );
        }
    }

    /// Marks the connection closed and releases everything waiting on it.
    fn close(&self) {
        if !self.inner.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(unique_name = ?self.unique_name(), "connection closed");

        let calls = lock(&self.inner.pending).drain();
        for (serial, call) in calls {
            debug!(serial, "failing pending call on disconnect");
            call.resolve(
                Err(BusError::method_error(errors::DISCONNECTED, "Disconnected")),
                &self.inner.workers,
            );
        }
        lock(&self.inner.pending_errors).push_back(Message::error_for_serial(
            0,
            errors::DISCONNECTED,
            "Disconnected",
        ));
        if let Ok(signal) = Message::signal(LOCAL_PATH, LOCAL_INTERFACE, signals::DISCONNECTED) {
            self.deliver_signal(signal);
        }

        self.inner.shutdown.cancel();
        self.inner.workers.shutdown();
    }

    /// Closes the connection after flushing queued messages, then waits for
    /// the I/O tasks and workers to finish.
    pub async fn disconnect(&self) {
        self.close();
        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "connection task join failed");
            }
        }
        self.inner.workers.join().await;
    }
}
