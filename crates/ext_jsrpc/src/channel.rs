//! Reconnecting remote-call channel.
//!
//! State machine:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──open──▶ Registered
//!                               │                    │
//!                               └──close──▶ Reconnecting(n) ◀──close──┘
//!                                              │        │
//!                                  timer fires │        │ n == max
//!                                              ▼        ▼
//!                                         Connecting   GaveUp
//! ```
//!
//! Every socket gets an epoch when it is opened. Events from a socket whose
//! epoch is no longer current (replaced by `connect`, dropped by
//! `disconnect`) are ignored, so closing it never schedules a reconnect.
//! Timers carry their own sequence number and are superseded the same way.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use ext_intercept::net::{
    InitialListeners, MessageData, ReadyState, Socket, SocketEvent, SocketEventKind, SocketFactory,
    SocketListener,
};
use ext_intercept::{define_path, Exception, Function, Object, Realm, Value};

use crate::config::{ChannelConfig, ConfigPatch};
use crate::dispatch::Dispatcher;
use crate::protocol::{self, CallResponse, ProtocolFault, RemoteMessage};
use crate::JsrpcError;

/// Global property the channel API is published under.
pub const API_ROOT: &str = "__jsrpc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "attempt", rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Registered,
    /// Waiting to start reconnect attempt `n` (1-based).
    Reconnecting(u32),
    /// Attempt budget exhausted; only a manual `connect` leaves this state.
    GaveUp,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Registered => write!(f, "registered"),
            Self::Reconnecting(attempt) => write!(f, "reconnecting ({})", attempt),
            Self::GaveUp => write!(f, "gave up"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub connected: bool,
    pub state: ChannelState,
    pub config: ChannelConfig,
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone, Copy)]
enum TimerAction {
    /// Initial connect after the startup delay.
    Connect,
    Reconnect,
}

struct ChannelCore {
    config: ChannelConfig,
    state: ChannelState,
    attempts: u32,
    epoch: u64,
    socket: Option<Arc<dyn Socket>>,
    timer: Option<JoinHandle<()>>,
    timer_seq: u64,
}

impl ChannelCore {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.timer_seq += 1;
    }
}

struct ChannelInner {
    realm: Arc<Realm>,
    factory: Arc<dyn SocketFactory>,
    dispatcher: Dispatcher,
    core: Mutex<ChannelCore>,
}

/// Handle to one remote-call channel. Clones share the channel.
///
/// Socket events are delivered on the runtime driving the socket; realm
/// functions invoked by remote calls run synchronously inside that delivery.
#[derive(Clone)]
pub struct RemoteChannel {
    inner: Arc<ChannelInner>,
}

impl RemoteChannel {
    /// Create a disconnected channel. Nothing is opened until `connect`.
    ///
    /// `factory` is used for the channel's own socket; pass the native
    /// factory rather than the realm's so channel traffic is not captured.
    pub fn new(realm: Arc<Realm>, factory: Arc<dyn SocketFactory>, config: ChannelConfig) -> Self {
        let dispatcher = Dispatcher::new(realm.global().clone());
        Self {
            inner: Arc::new(ChannelInner {
                realm,
                factory,
                dispatcher,
                core: Mutex::new(ChannelCore {
                    config,
                    state: ChannelState::Disconnected,
                    attempts: 0,
                    epoch: 0,
                    socket: None,
                    timer: None,
                    timer_seq: 0,
                }),
            }),
        }
    }

    /// Connect now, optionally to a new url.
    ///
    /// Cancels any pending timer, closes the current socket without a
    /// reconnect, and resets the attempt counter.
    pub fn connect(&self, url: Option<&str>) {
        self.inner.connect_now(url);
    }

    /// Schedule `connect(None)` after `delay`. Requires a tokio runtime.
    pub fn connect_after(&self, delay: Duration) {
        self.inner.schedule(delay, TimerAction::Connect);
    }

    /// Close the socket and cancel any pending timer. Does not reconnect.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub fn state(&self) -> ChannelState {
        self.inner.core().state
    }

    pub fn status(&self) -> ChannelStatus {
        self.inner.status()
    }

    pub fn config(&self) -> ChannelConfig {
        self.inner.core().config.clone()
    }

    /// Apply a partial configuration. Takes effect on the next connect.
    pub fn update_config(&self, patch: ConfigPatch) {
        self.inner.update_config(patch);
    }

    /// Send a frame if the socket is open; otherwise drop it.
    pub fn send(&self, message: &RemoteMessage) -> Result<(), JsrpcError> {
        self.inner.send(message)
    }

    /// Bind `value` at a dotted path under the realm's global scope.
    pub fn register(&self, path: &str, value: Value) -> Result<(), JsrpcError> {
        self.inner.register(path, value)
    }

    /// Register a native closure as a callable at `path`.
    pub fn register_fn<F>(&self, path: &str, body: F) -> Result<(), JsrpcError>
    where
        F: Fn(&Value, &[Value]) -> Result<Value, Exception> + Send + Sync + 'static,
    {
        let name = path.rsplit('.').next().unwrap_or(path);
        self.register(path, Value::from(Function::new(name, body)))
    }

    /// Publish `getStatus`, `connect`, `disconnect`, `register` and
    /// `updateConfig` under [`API_ROOT`] in the realm.
    pub fn publish_api(&self) {
        self.inner.publish_api();
    }
}

impl fmt::Debug for RemoteChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteChannel")
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Channel internals
// ============================================================================

impl ChannelInner {
    fn core(&self) -> MutexGuard<'_, ChannelCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect_now(self: &Arc<Self>, url: Option<&str>) {
        let previous = {
            let mut core = self.core();
            if let Some(url) = url {
                core.config.url = url.to_string();
            }
            core.cancel_timer();
            core.attempts = 0;
            core.epoch += 1;
            core.socket.take()
        };
        if let Some(socket) = previous {
            socket.close(None, None);
        }
        self.open();
    }

    fn open(self: &Arc<Self>) {
        let (url, epoch) = {
            let mut core = self.core();
            core.epoch += 1;
            core.state = ChannelState::Connecting;
            (core.config.url.clone(), core.epoch)
        };
        info!(url = %url, "jsrpc connecting");

        let listeners: InitialListeners = SocketEventKind::ALL
            .into_iter()
            .map(|kind| {
                let weak = Arc::downgrade(self);
                let listener: SocketListener = Arc::new(move |event: &SocketEvent| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_event(epoch, event);
                    }
                });
                (kind, listener)
            })
            .collect();

        let socket = match self.factory.create_with_listeners(&url, &[], listeners) {
            Ok(socket) => socket,
            Err(e) => {
                error!(url = %url, error = %e, "jsrpc socket construction failed");
                let mut core = self.core();
                if core.epoch == epoch {
                    core.state = ChannelState::Disconnected;
                }
                return;
            }
        };

        let superseded = {
            let mut core = self.core();
            if core.epoch != epoch {
                true
            } else {
                // A socket that already closed has scheduled its own retry.
                if core.state == ChannelState::Connecting {
                    core.socket = Some(socket.clone());
                }
                false
            }
        };
        if superseded {
            socket.close(None, None);
            return;
        }
        // The driver may have opened the socket before it was stored.
        if socket.ready_state() == ReadyState::Open {
            self.on_open(epoch);
        }
    }

    fn disconnect(&self) {
        let socket = {
            let mut core = self.core();
            core.cancel_timer();
            core.epoch += 1;
            core.state = ChannelState::Disconnected;
            core.socket.take()
        };
        if let Some(socket) = socket {
            socket.close(None, None);
        }
        info!("jsrpc disconnected");
    }

    fn schedule(self: &Arc<Self>, delay: Duration, action: TimerAction) {
        let Ok(handle) = Handle::try_current() else {
            warn!(?action, "no runtime, jsrpc timer not scheduled");
            return;
        };

        let deadline = Instant::now() + delay;
        let mut core = self.core();
        core.cancel_timer();
        let seq = core.timer_seq;
        let weak = Arc::downgrade(self);
        core.timer = Some(handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let due = {
                let mut core = inner.core();
                if core.timer_seq == seq {
                    core.timer = None;
                    true
                } else {
                    false
                }
            };
            if due {
                match action {
                    TimerAction::Connect => inner.connect_now(None),
                    TimerAction::Reconnect => inner.open(),
                }
            }
        }));
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.core().epoch == epoch
    }

    fn on_event(self: &Arc<Self>, epoch: u64, event: &SocketEvent) {
        match event.kind {
            SocketEventKind::Open => self.on_open(epoch),
            SocketEventKind::Message => match &event.data {
                Some(MessageData::Text(text)) if self.is_current(epoch) => self.on_message(text),
                Some(MessageData::Binary(bytes)) => {
                    debug!(len = bytes.len(), "jsrpc binary frame ignored")
                }
                _ => {}
            },
            SocketEventKind::Error => {
                if self.is_current(epoch) {
                    warn!("jsrpc socket error");
                }
            }
            SocketEventKind::Close => self.on_close(epoch, event),
        }
    }

    /// Register once per connection. Runs from the open event, or from
    /// `open` when the event fired before the socket was stored.
    fn on_open(&self, epoch: u64) {
        let register = {
            let mut core = self.core();
            if core.epoch != epoch || core.state != ChannelState::Connecting || core.socket.is_none() {
                return;
            }
            core.attempts = 0;
            core.state = ChannelState::Registered;
            RemoteMessage::Register {
                group: core.config.group.clone(),
                name: core.config.name.clone(),
            }
        };
        info!("jsrpc connected");

        if let Err(e) = self.send(&register) {
            warn!(error = %e, "jsrpc register not sent");
            let mut core = self.core();
            if core.epoch == epoch && core.state == ChannelState::Registered {
                core.state = ChannelState::Connecting;
            }
            return;
        }
        let core = self.core();
        info!(group = %core.config.group, name = %core.config.name, "jsrpc registered");
    }

    fn on_message(&self, text: &str) {
        let response = match protocol::decode(text) {
            Ok(RemoteMessage::Call(call)) => {
                let allow_code = self.core().config.allow_code;
                debug!(id = %call.id, "jsrpc call");
                self.dispatcher.dispatch(&call, allow_code)
            }
            Ok(other) => {
                debug!(kind = other.kind(), "jsrpc frame ignored");
                return;
            }
            Err(ProtocolFault::BadCall { id, reason }) => {
                warn!(id = %id, reason = %reason, "jsrpc call rejected");
                CallResponse::fail(id, reason)
            }
            Err(fault @ ProtocolFault::Malformed(_)) => {
                warn!(error = %fault, "jsrpc frame dropped");
                return;
            }
        };

        if let Err(e) = self.send(&RemoteMessage::Response(response)) {
            warn!(error = %e, "jsrpc response dropped");
        }
    }

    fn on_close(self: &Arc<Self>, epoch: u64, event: &SocketEvent) {
        let retry = {
            let mut core = self.core();
            if core.epoch != epoch {
                return;
            }
            core.socket = None;
            if core.attempts < core.config.max_reconnect_attempts {
                core.attempts += 1;
                core.state = ChannelState::Reconnecting(core.attempts);
                Some((core.attempts, core.config.max_reconnect_attempts, core.config.reconnect_interval()))
            } else {
                core.state = ChannelState::GaveUp;
                None
            }
        };

        match retry {
            Some((attempt, max, delay)) => {
                info!(code = ?event.code, attempt, max, delay_ms = delay.as_millis() as u64, "jsrpc closed, reconnecting");
                self.schedule(delay, TimerAction::Reconnect);
            }
            None => {
                error!(code = ?event.code, "jsrpc reconnect attempts exhausted, giving up");
            }
        }
    }

    fn send(&self, message: &RemoteMessage) -> Result<(), JsrpcError> {
        let socket = self.core().socket.clone();
        let socket = match socket {
            Some(socket) if socket.ready_state() == ReadyState::Open => socket,
            _ => {
                warn!(kind = message.kind(), "jsrpc not connected, message dropped");
                return Err(JsrpcError::not_connected(format!("{} dropped", message.kind())));
            }
        };
        let frame = protocol::encode(message)?;
        socket.send(MessageData::Text(frame))?;
        Ok(())
    }

    fn status(&self) -> ChannelStatus {
        let (state, config, attempts, socket) = {
            let core = self.core();
            (core.state, core.config.clone(), core.attempts, core.socket.clone())
        };
        let open = socket.is_some_and(|socket| socket.ready_state() == ReadyState::Open);
        ChannelStatus {
            connected: open && state == ChannelState::Registered,
            state,
            config,
            reconnect_attempts: attempts,
        }
    }

    fn update_config(&self, patch: ConfigPatch) {
        let mut core = self.core();
        core.config.merge(patch);
        info!(url = %core.config.url, group = %core.config.group, name = %core.config.name, "jsrpc config updated");
    }

    fn register(&self, path: &str, value: Value) -> Result<(), JsrpcError> {
        define_path(self.realm.global(), path, value)?;
        info!(path = %path, "jsrpc function registered");
        Ok(())
    }

    fn publish_api(self: &Arc<Self>) {
        let api = Object::new();
        let weak = Arc::downgrade(self);

        api.set(
            "getStatus",
            api_fn(&weak, "getStatus", |this, _| {
                serde_json::to_value(this.status())
                    .map(Value::from)
                    .map_err(|e| Exception::new(e.to_string()))
            }),
        );
        api.set(
            "connect",
            api_fn(&weak, "connect", |this, args| {
                this.connect_now(args.first().and_then(Value::as_str));
                Ok(Value::Undefined)
            }),
        );
        api.set(
            "disconnect",
            api_fn(&weak, "disconnect", |this, _| {
                this.disconnect();
                Ok(Value::Undefined)
            }),
        );
        api.set(
            "register",
            api_fn(&weak, "register", |this, args| {
                let path = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| Exception::new("register expects a path"))?;
                match args.get(1) {
                    Some(function @ Value::Function(_)) => {
                        this.register(path, function.clone()).map_err(|e| Exception::new(e.to_string()))?;
                        Ok(Value::Bool(true))
                    }
                    _ => Err(Exception::new("register expects a function")),
                }
            }),
        );
        api.set(
            "updateConfig",
            api_fn(&weak, "updateConfig", |this, args| {
                let json = args.first().map(Value::to_json).unwrap_or_default();
                let patch: ConfigPatch = serde_json::from_value(json)
                    .map_err(|e| Exception::new(JsrpcError::config(e.to_string()).to_string()))?;
                this.update_config(patch);
                Ok(Value::Undefined)
            }),
        );

        self.realm.global().set(API_ROOT, api);
        info!(root = API_ROOT, "jsrpc API published");
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = core.timer.take() {
            timer.abort();
        }
        if let Some(socket) = core.socket.take() {
            socket.close(None, None);
        }
    }
}

fn api_fn<F>(weak: &Weak<ChannelInner>, name: &str, body: F) -> Function
where
    F: Fn(&Arc<ChannelInner>, &[Value]) -> Result<Value, Exception> + Send + Sync + 'static,
{
    let weak = weak.clone();
    Function::new(name, move |_, args| match weak.upgrade() {
        Some(this) => body(&this, args),
        None => Err(Exception::new("jsrpc channel is gone")),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ext_intercept::{resolve_callable, InterceptError};
    use ext_intercept::testing::{mock_realm, MockSocket, MockSocketFactory};
    use serde_json::{json, Value as Json};

    fn channel_with(config: ChannelConfig) -> (RemoteChannel, MockSocketFactory, Arc<Realm>) {
        let (realm, _) = mock_realm();
        let factory = MockSocketFactory::new();
        let channel = RemoteChannel::new(realm.clone(), Arc::new(factory.clone()), config);
        (channel, factory, realm)
    }

    fn test_config() -> ChannelConfig {
        ChannelConfig {
            url: "ws://controller.test/rpc".into(),
            reconnect_interval_ms: 1000,
            max_reconnect_attempts: 3,
            ..ChannelConfig::default()
        }
    }

    fn socket(factory: &MockSocketFactory) -> Arc<MockSocket> {
        factory.last().expect("channel socket alive")
    }

    fn frames(socket: &MockSocket) -> Vec<Json> {
        socket
            .sent_text()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    /// Opens each socket before construction returns, as a driver running
    /// on another worker thread can.
    struct EagerOpenFactory(MockSocketFactory);

    impl SocketFactory for EagerOpenFactory {
        fn create(&self, url: &str, protocols: &[String]) -> Result<Arc<dyn Socket>, InterceptError> {
            self.create_with_listeners(url, protocols, Vec::new())
        }

        fn create_with_listeners(
            &self,
            url: &str,
            protocols: &[String],
            listeners: InitialListeners,
        ) -> Result<Arc<dyn Socket>, InterceptError> {
            let socket = self.0.create_with_listeners(url, protocols, listeners)?;
            if let Some(remote) = self.0.last() {
                remote.open();
            }
            Ok(socket)
        }
    }

    async fn advance(ms: u64) {
        tokio::time::advance(Duration::from_millis(ms)).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_on_open() {
        let (channel, factory, _realm) = channel_with(test_config());
        assert_eq!(channel.state(), ChannelState::Disconnected);

        channel.connect(None);
        assert_eq!(channel.state(), ChannelState::Connecting);
        assert_eq!(factory.created(), 1);

        let remote = socket(&factory);
        assert_eq!(remote.url(), "ws://controller.test/rpc");
        remote.open();
        assert_eq!(channel.state(), ChannelState::Registered);
        assert_eq!(
            frames(&remote),
            vec![json!({"type": "register", "group": "default", "name": "astracrawler"})]
        );
        assert!(channel.status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_during_construction_still_registers() {
        let (realm, _) = mock_realm();
        let mock = MockSocketFactory::new();
        let channel = RemoteChannel::new(realm, Arc::new(EagerOpenFactory(mock.clone())), test_config());

        channel.connect(None);
        assert_eq!(channel.state(), ChannelState::Registered);
        assert_eq!(
            frames(&socket(&mock)),
            vec![json!({"type": "register", "group": "default", "name": "astracrawler"})]
        );

        // Reconnects go through the same path.
        socket(&mock).fail();
        advance(1000).await;
        assert_eq!(channel.state(), ChannelState::Registered);
        assert_eq!(mock.created(), 2);
        assert_eq!(frames(&socket(&mock)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_at_interval_then_gives_up() {
        let (channel, factory, _realm) = channel_with(test_config());
        channel.connect(None);
        socket(&factory).open();

        for attempt in 1..=3u32 {
            socket(&factory).fail();
            assert_eq!(channel.state(), ChannelState::Reconnecting(attempt));
            assert_eq!(channel.status().reconnect_attempts, attempt);

            advance(999).await;
            assert_eq!(factory.created(), attempt as usize);

            advance(1).await;
            assert_eq!(channel.state(), ChannelState::Connecting);
            assert_eq!(factory.created(), attempt as usize + 1);
        }

        socket(&factory).fail();
        assert_eq!(channel.state(), ChannelState::GaveUp);
        advance(60_000).await;
        assert_eq!(factory.created(), 4);
        assert!(!channel.status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_open_resets_attempts() {
        let (channel, factory, _realm) = channel_with(test_config());
        channel.connect(None);
        socket(&factory).fail();
        advance(1000).await;
        socket(&factory).fail();
        assert_eq!(channel.state(), ChannelState::Reconnecting(2));

        advance(1000).await;
        socket(&factory).open();
        assert_eq!(channel.status().reconnect_attempts, 0);
        socket(&factory).fail();
        assert_eq!(channel.state(), ChannelState::Reconnecting(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_dispatched_and_answered() {
        let (channel, factory, _realm) = channel_with(test_config());
        channel.register_fn("a.b.c", |_, _| Ok(Value::from(42))).unwrap();
        channel.connect(None);
        let remote = socket(&factory);
        remote.open();

        remote.receive(r#"{"type":"call","id":"1","functionName":"a.b.c"}"#);
        assert_eq!(
            frames(&remote).last().unwrap(),
            &json!({"type": "response", "id": "1", "success": true, "result": 42})
        );

        remote.receive(r#"{"type":"call","id":2,"functionName":"a.b.missing"}"#);
        let response = frames(&remote).last().unwrap().clone();
        assert_eq!(response["id"], "2");
        assert_eq!(response["success"], false);
        assert!(response["error"].as_str().unwrap().contains("a.b.missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registered_function_receives_args() {
        let (channel, factory, realm) = channel_with(test_config());
        channel
            .register_fn("tools.echo", |_, args| Ok(args.first().cloned().unwrap_or_default()))
            .unwrap();
        assert!(resolve_callable(realm.global(), "tools.echo").is_some());

        channel.connect(None);
        let remote = socket(&factory);
        remote.open();
        remote.receive(r#"{"type":"call","id":"e","functionName":"tools.echo","args":[{"x":5}]}"#);
        assert_eq!(frames(&remote).last().unwrap()["result"], json!({"x": 5}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames() {
        let (channel, factory, _realm) = channel_with(test_config());
        channel.connect(None);
        let remote = socket(&factory);
        remote.open();

        remote.receive("not json");
        remote.receive(r#"{"type":"call","functionName":"a"}"#);
        remote.receive(r#"{"type":"register","group":"g","name":"n"}"#);
        assert_eq!(frames(&remote).len(), 1);

        remote.receive(r#"{"type":"call","id":"7","functionName":5}"#);
        let response = frames(&remote).last().unwrap().clone();
        assert_eq!(response["id"], "7");
        assert_eq!(response["success"], false);
        assert_eq!(channel.state(), ChannelState::Registered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_closed_is_dropped() {
        let (channel, factory, _realm) = channel_with(test_config());
        let message = RemoteMessage::Response(CallResponse::ok("x", None));

        let err = channel.send(&message).unwrap_err();
        assert!(matches!(err, JsrpcError::NotConnected { .. }));

        channel.connect(None);
        assert!(channel.send(&message).is_err());
        let remote = socket(&factory);
        remote.open();
        // Only the register frame: nothing was queued.
        assert_eq!(frames(&remote).len(), 1);
        channel.send(&message).unwrap();
        assert_eq!(frames(&remote).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_connect_cancels_pending_reconnect() {
        let (channel, factory, _realm) = channel_with(test_config());
        channel.connect(None);
        socket(&factory).fail();
        assert_eq!(channel.state(), ChannelState::Reconnecting(1));

        channel.connect(Some("ws://other.test"));
        assert_eq!(factory.created(), 2);
        assert_eq!(socket(&factory).url(), "ws://other.test");
        assert_eq!(channel.status().reconnect_attempts, 0);
        assert_eq!(channel.config().url, "ws://other.test");

        advance(5000).await;
        assert_eq!(factory.created(), 2);
        assert_eq!(channel.state(), ChannelState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_connect_replaces_open_socket_without_reconnect() {
        let (channel, factory, _realm) = channel_with(test_config());
        channel.connect(None);
        let first = socket(&factory);
        first.open();

        channel.connect(None);
        assert_eq!(first.ready_state(), ReadyState::Closed);
        assert_eq!(channel.state(), ChannelState::Connecting);
        advance(5000).await;
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_everything() {
        let (channel, factory, _realm) = channel_with(test_config());
        channel.connect(None);
        let remote = socket(&factory);
        remote.open();

        channel.disconnect();
        assert_eq!(remote.ready_state(), ReadyState::Closed);
        assert_eq!(channel.state(), ChannelState::Disconnected);
        advance(10_000).await;
        assert_eq!(factory.created(), 1);

        channel.connect(None);
        socket(&factory).fail();
        channel.disconnect();
        advance(10_000).await;
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_after_startup_delay() {
        let (channel, factory, _realm) = channel_with(test_config());
        channel.connect_after(Duration::from_millis(500));
        advance(499).await;
        assert_eq!(factory.created(), 0);
        advance(1).await;
        assert_eq!(factory.created(), 1);

        channel.connect_after(Duration::from_millis(500));
        channel.disconnect();
        advance(1000).await;
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_construction_leaves_disconnected() {
        let (channel, factory, _realm) = channel_with(test_config());
        factory.refuse_connections(true);
        channel.connect(None);
        assert_eq!(channel.state(), ChannelState::Disconnected);
        advance(10_000).await;
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_code_calls_follow_config() {
        let (channel, factory, _realm) = channel_with(test_config());
        channel.connect(None);
        let remote = socket(&factory);
        remote.open();

        remote.receive(r#"{"type":"call","id":"c1","code":"[1, 2]"}"#);
        assert_eq!(frames(&remote).last().unwrap()["error"], "code execution is disabled");

        channel.update_config(ConfigPatch {
            allow_code: Some(true),
            ..ConfigPatch::default()
        });
        remote.receive(r#"{"type":"call","id":"c2","code":"[1, 2]"}"#);
        assert_eq!(frames(&remote).last().unwrap()["result"], json!([1, 2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_published_api() {
        let (channel, factory, realm) = channel_with(test_config());
        channel.publish_api();
        let call = |name: &str, args: &[Value]| {
            resolve_callable(realm.global(), &format!("{}.{}", API_ROOT, name))
                .unwrap()
                .call(&Value::Undefined, args)
        };

        call("updateConfig", &[Value::from(json!({"group": "farm", "maxReconnectAttempts": 1}))]).unwrap();
        assert_eq!(channel.config().group, "farm");
        assert_eq!(channel.config().max_reconnect_attempts, 1);

        call("connect", &[]).unwrap();
        socket(&factory).open();
        assert_eq!(frames(&socket(&factory))[0]["group"], "farm");

        let status = call("getStatus", &[]).unwrap().to_json();
        assert_eq!(status["connected"], true);
        assert_eq!(status["state"], json!({"kind": "registered"}));
        assert_eq!(status["reconnectAttempts"], 0);
        assert_eq!(status["config"]["group"], "farm");

        let f = Function::new("f", |_, _| Ok(Value::from("ok")));
        assert_eq!(call("register", &[Value::from("x.y"), Value::from(f)]).unwrap(), Value::Bool(true));
        assert!(call("register", &[Value::from("x.z"), Value::from(1)]).is_err());
        assert!(resolve_callable(realm.global(), "x.y").is_some());

        call("disconnect", &[]).unwrap();
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_call_may_disconnect_channel() {
        let (channel, factory, _realm) = channel_with(test_config());
        channel.publish_api();
        channel.connect(None);
        let remote = socket(&factory);
        remote.open();

        remote.receive(&format!(
            r#"{{"type":"call","id":"d","functionName":"{}.disconnect"}}"#,
            API_ROOT
        ));
        assert_eq!(channel.state(), ChannelState::Disconnected);
        // The response could not be sent once the socket closed.
        assert_eq!(frames(&remote).len(), 1);
    }

    #[test]
    fn test_state_display_and_serialization() {
        assert_eq!(ChannelState::Reconnecting(2).to_string(), "reconnecting (2)");
        assert_eq!(
            serde_json::to_value(ChannelState::Reconnecting(2)).unwrap(),
            json!({"kind": "reconnecting", "attempt": 2})
        );
        assert_eq!(serde_json::to_value(ChannelState::GaveUp).unwrap(), json!({"kind": "gave_up"}));
    }
}
