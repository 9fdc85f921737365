//! WebSocket Transportation.
//!
//! A background thread owns the connection for the whole life of the
//! transport: it connects, reads messages into a one-slot response channel,
//! writes what callers hand it, and reconnects after a fixed delay whenever
//! the link drops. Callers stay synchronous and only block while a message is
//! handed over (send timeout) and while a `read` reply is awaited
//! (response timeout).
//!
//! Every request purges the response slot before it is sent. An unsolicited
//! push that lands in the slot just before a request is therefore lost; this
//! is accepted behaviour.

use std::{
    net::{TcpStream, ToSocketAddrs},
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};
use serde::Serialize;
use serde_json::Value;
use tungstenite::{Message, WebSocket};

use super::{Ack, Action, ConnectionState, Transport};
use crate::constants::defaults;
use crate::error::{Error, Result};

/// One open persistent socket.
pub trait SocketLink: Send {
    fn send(&mut self, text: &str) -> Result<()>;
    /// `Ok(None)` if nothing arrived within `timeout`.
    fn recv(&mut self, timeout: Duration) -> Result<Option<String>>;
    fn close(&mut self);
}

/// Opens [`SocketLink`]s; called again on every reconnect.
pub trait Connector: Send + 'static {
    fn connect(&self, url: &str, timeout: Duration) -> Result<Box<dyn SocketLink>>;
}

/// `tungstenite` client over a plain TCP stream.
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str, timeout: Duration) -> Result<Box<dyn SocketLink>> {
        let uri: tungstenite::http::Uri = url
            .parse()
            .map_err(|e| Error::Configuration(format!("invalid url {:?}: {}", url, e)))?;
        let host = uri
            .host()
            .ok_or_else(|| Error::Configuration(format!("no host in {:?}", url)))?;
        let addr = (host, uri.port_u16().unwrap_or(80))
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Connection(format!("cannot resolve {}", host)))?;

        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| Error::Connection(format!("connect to {}: {}", addr, e)))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;

        let (socket, _) = tungstenite::client(url, stream)
            .map_err(|e| Error::Connection(format!("handshake with {} failed: {}", url, e)))?;
        Ok(Box::new(WsLink { socket }))
    }
}

struct WsLink {
    socket: WebSocket<TcpStream>,
}

impl SocketLink for WsLink {
    fn send(&mut self, text: &str) -> Result<()> {
        self.socket
            .send(Message::text(text.to_owned()))
            .map_err(|e| Error::Connection(e.to_string()))
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<String>> {
        // a zero read timeout means "block forever" to the OS
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket.get_ref().set_read_timeout(Some(timeout))?;
        match self.socket.read() {
            Ok(Message::Text(text)) => Ok(Some(text.as_str().to_owned())),
            Ok(Message::Binary(data)) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            Ok(Message::Close(_)) => Err(Error::Connection("connection closed by peer".into())),
            Ok(_) => Ok(None),
            Err(tungstenite::Error::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(Error::Connection(e.to_string())),
        }
    }

    fn close(&mut self) {
        let _ = self.socket.close(None);
        let _ = self.socket.flush();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// Bound for one connect attempt, and for the initial wait in
    /// [`SocketTransport::connect`].
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub response_timeout: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// How long the background thread blocks on a read before it checks
    /// for outgoing messages and the stop flag.
    pub poll_interval: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            connect_timeout: Duration::from_millis(defaults::WS_TIMEOUT_MS),
            send_timeout: Duration::from_millis(defaults::WS_TIMEOUT_MS),
            response_timeout: Duration::from_millis(defaults::WS_TIMEOUT_MS),
            reconnect_delay: Duration::from_millis(defaults::WS_RECONNECT_DELAY_MS),
            poll_interval: Duration::from_millis(defaults::WS_POLL_INTERVAL_MS),
        }
    }
}

/// JSON request, `{"cmd": <verb>, ...}`.
#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
enum Command<'a> {
    Read {
        id: u8,
        num: u8,
    },
    Write {
        id: u8,
        num: usize,
        value: &'a [u8],
    },
    Status {
        status: u8,
    },
    Vacuum {
        status: u8,
    },
    Speed {
        speed: u8,
    },
    Angle {
        id: usize,
        angle: u8,
    },
    Angles {
        angles: &'a [u8],
    },
    #[serde(rename = "IK5")]
    Ik5 { pos: [i16; 3] },
    #[serde(rename = "IK6")]
    Ik6 { pos: [i16; 3], vec56: [i8; 3] },
    #[serde(rename = "IK7")]
    Ik7 {
        pos: [i16; 3],
        vec56: [i8; 3],
        vec67: [i8; 3],
    },
    Ping,
}

impl Command<'_> {
    /// Only `read` waits for the device to answer.
    fn expects_reply(&self) -> bool {
        matches!(self, Command::Read { .. })
    }
}

impl<'a> From<&'a Action> for Command<'a> {
    fn from(action: &'a Action) -> Self {
        match action {
            Action::Status(status) => Command::Status { status: *status },
            Action::Vacuum(status) => Command::Vacuum { status: *status },
            Action::Speed(speed) => Command::Speed { speed: *speed },
            Action::Angle { joint, angle } => Command::Angle {
                id: *joint,
                angle: *angle,
            },
            Action::Angles(angles) => Command::Angles { angles },
            Action::Ik5 { pos } => Command::Ik5 { pos: *pos },
            Action::Ik6 { pos, vec56 } => Command::Ik6 {
                pos: *pos,
                vec56: *vec56,
            },
            Action::Ik7 { pos, vec56, vec67 } => Command::Ik7 {
                pos: *pos,
                vec56: *vec56,
                vec67: *vec67,
            },
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Shared {
    state: Mutex<ConnectionState>,
    changed: Condvar,
    stop: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Shared {
            state: Mutex::new(ConnectionState::Connecting),
            changed: Condvar::new(),
            stop: AtomicBool::new(false),
        }
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set(&self, next: ConnectionState) {
        let mut state = lock(&self.state);
        if *state != next {
            log::debug!("WebSocket state {:?} -> {:?}", *state, next);
            *state = next;
            self.changed.notify_all();
        }
    }

    /// Block until connected or stopped, at most `timeout`.
    fn wait_settled(&self, timeout: Duration) -> ConnectionState {
        let state = lock(&self.state);
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| {
                !matches!(s, ConnectionState::Connected | ConnectionState::Stopped)
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *state
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

struct Outgoing {
    text: String,
    done: Sender<Result<()>>,
}

struct Worker<C> {
    url: String,
    connector: C,
    shared: Arc<Shared>,
    options: SocketOptions,
    outbound: Receiver<Outgoing>,
    slot: Sender<String>,
    /// Lets the worker evict the message it is about to replace.
    slot_rx: Receiver<String>,
}

impl<C: Connector> Worker<C> {
    fn run(self) {
        while !self.shared.stopping() {
            log::debug!("Connecting to WebSocket: {}", self.url);
            match self.connector.connect(&self.url, self.options.connect_timeout) {
                Ok(mut link) => {
                    self.shared.set(ConnectionState::Connected);
                    if let Err(e) = self.serve(link.as_mut()) {
                        log::warn!("WebSocket connection error: {}", e);
                    }
                    link.close();
                }
                Err(e) => log::debug!("WebSocket connect failed: {}", e),
            }
            if self.shared.stopping() {
                break;
            }
            self.shared.set(ConnectionState::Reconnecting);
            self.fail_pending();
            self.backoff();
        }
        self.fail_pending();
        self.shared.set(ConnectionState::Stopped);
    }

    fn serve(&self, link: &mut dyn SocketLink) -> Result<()> {
        while !self.shared.stopping() {
            while let Ok(out) = self.outbound.try_recv() {
                log::debug!("Sending WebSocket command: {}", out.text);
                let sent = link.send(&out.text);
                let failure = sent.as_ref().err().map(|e| e.to_string());
                let _ = out.done.send(sent);
                if let Some(reason) = failure {
                    return Err(Error::Connection(reason));
                }
            }
            if let Some(message) = link.recv(self.options.poll_interval)? {
                log::debug!("Received: {}", message);
                self.deliver(message);
            }
        }
        Ok(())
    }

    /// One slot, newest message wins.
    fn deliver(&self, message: String) {
        if let Err(TrySendError::Full(message)) = self.slot.try_send(message) {
            let _ = self.slot_rx.try_recv();
            let _ = self.slot.try_send(message);
        }
    }

    fn fail_pending(&self) {
        while let Ok(out) = self.outbound.try_recv() {
            let _ = out
                .done
                .send(Err(Error::Connection("WebSocket not connected".into())));
        }
    }

    fn backoff(&self) {
        let deadline = Instant::now() + self.options.reconnect_delay;
        while !self.shared.stopping() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            thread::sleep(remaining.min(self.options.poll_interval));
        }
    }
}

pub struct SocketTransport {
    url: String,
    options: SocketOptions,
    shared: Arc<Shared>,
    outbound: Sender<Outgoing>,
    responses: Receiver<String>,
    /// Held across purge + send + wait, one exchange at a time.
    in_flight: Mutex<()>,
    worker: Option<JoinHandle<()>>,
}

impl SocketTransport {
    /// The arm's WebSocket endpoint.
    pub fn endpoint(host: &str, port: u16) -> String {
        format!("ws://{}:{}/ws", host, port)
    }

    pub fn connect(url: impl Into<String>, options: SocketOptions) -> Result<Self> {
        Self::with_connector(url, WsConnector, options)
    }

    /// Start the background connection and wait until it is up.
    pub fn with_connector<C: Connector>(
        url: impl Into<String>,
        connector: C,
        options: SocketOptions,
    ) -> Result<Self> {
        let url = url.into();
        let shared = Arc::new(Shared::new());
        let (outbound, outbound_rx) = unbounded();
        let (slot, responses) = bounded(1);

        let worker = Worker {
            url: url.clone(),
            connector,
            shared: shared.clone(),
            options: options.clone(),
            outbound: outbound_rx,
            slot,
            slot_rx: responses.clone(),
        };
        let handle = thread::Builder::new()
            .name("arm7bot-ws".into())
            .spawn(move || worker.run())?;

        let mut transport = SocketTransport {
            url,
            options,
            shared,
            outbound,
            responses,
            in_flight: Mutex::new(()),
            worker: Some(handle),
        };

        log::info!("Connecting to WebSocket: {}", transport.url);
        let state = transport.shared.wait_settled(transport.options.connect_timeout);
        match state {
            ConnectionState::Connected => {
                log::info!("WebSocket connected successfully");
                Ok(transport)
            }
            _ => {
                transport.shutdown();
                Err(Error::Connection(format!(
                    "Failed to connect to WebSocket server at {}",
                    transport.url
                )))
            }
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stop the background thread and release the connection.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("WebSocket thread panicked");
            }
        }
        self.shared.set(ConnectionState::Stopped);
    }

    fn exchange(&self, command: &Command<'_>) -> Result<Option<String>> {
        let _in_flight = lock(&self.in_flight);

        let state = self.shared.state();
        if state != ConnectionState::Connected {
            return Err(Error::Connection(format!(
                "WebSocket not connected ({:?})",
                state
            )));
        }
        let text = serde_json::to_string(command)?;

        let stale = self.responses.try_iter().count();
        if stale > 0 {
            log::debug!("Discarded {} stale message(s)", stale);
        }

        let (done, sent) = bounded(1);
        self.outbound
            .send(Outgoing { text, done })
            .map_err(|_| Error::Connection("WebSocket thread has stopped".into()))?;
        match sent.recv_timeout(self.options.send_timeout) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(Error::Connection(format!(
                    "Failed to send WebSocket command: {}",
                    e
                )));
            }
            Err(_) => {
                return Err(Error::Connection(
                    "Failed to send WebSocket command: timed out".into(),
                ));
            }
        }

        if !command.expects_reply() {
            return Ok(None);
        }
        match self.responses.recv_timeout(self.options.response_timeout) {
            Ok(reply) => {
                log::debug!("WebSocket response: {}", reply);
                Ok(Some(reply))
            }
            Err(RecvTimeoutError::Timeout) => {
                Err(Error::Timeout("WebSocket response timeout".into()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Connection("WebSocket thread has stopped".into()))
            }
        }
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Transport for SocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn read_register(&mut self, address: u8, count: u8) -> Result<Vec<u8>> {
        let reply = self
            .exchange(&Command::Read {
                id: address,
                num: count,
            })?
            .ok_or_else(|| Error::Protocol("read returned no reply".into()))?;
        let values = parse_register_values(&reply)?;
        if values.len() != count as usize {
            log::warn!(
                "Asked for {} registers at {}, got {}",
                count,
                address,
                values.len()
            );
        }
        Ok(values)
    }

    fn write_register(&mut self, address: u8, values: &[u8]) -> Result<Ack> {
        self.exchange(&Command::Write {
            id: address,
            num: values.len(),
            value: values,
        })?;
        Ok(Ack::Sent)
    }

    fn send_action(&mut self, action: &Action) -> Result<Ack> {
        self.exchange(&Command::from(action))?;
        Ok(Ack::Sent)
    }

    fn check_alarm(&mut self, address: u8, window: Duration) -> Result<()> {
        if window.is_zero() {
            return Ok(());
        }
        let _in_flight = lock(&self.in_flight);
        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match self.responses.recv_timeout(remaining) {
                Ok(message) => match alarm_reason(&message) {
                    Some(reason) => {
                        log::warn!("Device alarm for register {}: {}", address, reason);
                        return Err(Error::Range { address, reason });
                    }
                    None => log::debug!("Ignoring {} while waiting for alarm", message),
                },
                Err(RecvTimeoutError::Timeout) => return Ok(()),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Connection("WebSocket thread has stopped".into()));
                }
            }
        }
    }

    fn ping(&mut self) -> Result<Ack> {
        self.exchange(&Command::Ping)?;
        Ok(Ack::Sent)
    }
}

/// Interpret a reply to `read` as register bytes.
///
/// Accepted shapes: `{"data": [..]}`, `{"status": [..]}`,
/// `{"status": "1,2,3"}`, `{"status": 7}`, and the same values bare or as
/// non-JSON text. Numbers may be JSON numbers or numeric strings.
pub fn parse_register_values(reply: &str) -> Result<Vec<u8>> {
    let value: Value =
        serde_json::from_str(reply).unwrap_or_else(|_| Value::String(reply.trim().to_owned()));
    let field = match &value {
        Value::Object(map) => map
            .get("data")
            .or_else(|| map.get("status"))
            .ok_or_else(|| Error::Protocol(format!("no data or status in reply: {}", reply)))?,
        other => other,
    };
    values_of(field)
        .ok_or_else(|| Error::Protocol(format!("uninterpretable register reply: {}", reply)))
}

fn values_of(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Array(items) => items.iter().map(byte_of).collect(),
        Value::String(s) if s.contains(',') => {
            s.split(',').map(|part| part.trim().parse().ok()).collect()
        }
        other => byte_of(other).map(|b| vec![b]),
    }
}

fn byte_of(value: &Value) -> Option<u8> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `Some(reason)` if `message` is a device error or alarm report.
fn alarm_reason(message: &str) -> Option<String> {
    let value: Value = serde_json::from_str(message).ok()?;
    let map = value.as_object()?;
    if let Some(error) = map.get("error") {
        return Some(match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    let status = map.get("status")?.as_str()?;
    if status.eq_ignore_ascii_case("error") || status.eq_ignore_ascii_case("alarm") {
        let reason = map
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(status);
        return Some(reason.to_owned());
    }
    None
}
