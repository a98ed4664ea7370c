//! Instrumentation context: owns every piece of capture state for one realm
//! and has an explicit attach/detach lifecycle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::buffer::{EventBuffer, InterceptedEvent};
use crate::hook::{HookCallback, HookTable, Interception, Invocation, ROOT_LABEL};
use crate::net::{
    CapturedFetch, CapturedHttpRequestFactory, CapturedSocketFactory, Connection, ConnectionLog,
};
use crate::realm::{Exception, Function, Object, Primitives, Realm, Value};
use crate::signature::{SignatureCapture, DEFAULT_SIGNATURE_CONTEXTS, DEFAULT_SIGNATURE_NAMES};
use crate::InterceptError;

/// Global property the capture API is published under.
pub const API_ROOT: &str = "__astra";

/// Which adapters `attach` installs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub websocket: bool,
    pub fetch: bool,
    pub xhr: bool,
    pub signatures: bool,
    pub publish_api: bool,
    pub signature_names: Vec<String>,
    pub signature_contexts: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            websocket: true,
            fetch: true,
            xhr: true,
            signatures: true,
            publish_api: true,
            signature_names: DEFAULT_SIGNATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            signature_contexts: DEFAULT_SIGNATURE_CONTEXTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Default)]
struct Attachment {
    original: Option<Primitives>,
    api: Option<Object>,
}

/// Capture state attached to one realm.
pub struct Instrumentation {
    realm: Arc<Realm>,
    config: CaptureConfig,
    buffer: Arc<EventBuffer>,
    hooks: Arc<HookTable>,
    connections: Arc<ConnectionLog>,
    signatures: SignatureCapture,
    attachment: Mutex<Attachment>,
}

impl Instrumentation {
    /// Install the configured adapters into `realm`.
    pub fn attach(realm: Arc<Realm>, config: CaptureConfig) -> Arc<Self> {
        let buffer = Arc::new(EventBuffer::new());
        let hooks = Arc::new(HookTable::new());
        let connections = Arc::new(ConnectionLog::new(buffer.clone()));
        let signatures = SignatureCapture::new(realm.global().clone(), hooks.clone(), buffer.clone());

        let original = realm.primitives();
        let mut captured = original.clone();
        if config.websocket {
            captured.websocket = Arc::new(CapturedSocketFactory::new(
                original.websocket.clone(),
                connections.clone(),
            ));
        }
        if config.fetch {
            captured.fetch = Arc::new(CapturedFetch::new(original.fetch.clone(), buffer.clone()));
        }
        if config.xhr {
            captured.xhr = Arc::new(CapturedHttpRequestFactory::new(
                original.xhr.clone(),
                buffer.clone(),
            ));
        }
        realm.replace_primitives(captured);

        let instrumentation = Arc::new(Self {
            realm,
            config,
            buffer,
            hooks,
            connections,
            signatures,
            attachment: Mutex::new(Attachment {
                original: Some(original),
                api: None,
            }),
        });

        if instrumentation.config.signatures {
            instrumentation.signatures.hook_common(
                &instrumentation.config.signature_names,
                &instrumentation.config.signature_contexts,
            );
        }
        if instrumentation.config.publish_api {
            instrumentation.publish_api();
        }

        info!(
            websocket = instrumentation.config.websocket,
            fetch = instrumentation.config.fetch,
            xhr = instrumentation.config.xhr,
            hooks = instrumentation.hooks.len(),
            "instrumentation attached"
        );
        instrumentation
    }

    fn attachment(&self) -> MutexGuard<'_, Attachment> {
        self.attachment.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restore every hook and primitive binding and remove the published API.
    ///
    /// Safe to call more than once.
    pub fn detach(&self) {
        let (original, api) = {
            let mut attachment = self.attachment();
            (attachment.original.take(), attachment.api.take())
        };
        let Some(original) = original else {
            return;
        };

        let restored = self.hooks.restore_all();
        self.realm.replace_primitives(original);
        if let Some(api) = api {
            let global = self.realm.global();
            if matches!(global.get(API_ROOT), Some(Value::Object(current)) if current.ptr_eq(&api)) {
                global.remove(API_ROOT);
            }
        }
        info!(hooks = restored, "instrumentation detached");
    }

    pub fn is_attached(&self) -> bool {
        self.attachment().original.is_some()
    }

    pub fn realm(&self) -> &Arc<Realm> {
        &self.realm
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn buffer(&self) -> &Arc<EventBuffer> {
        &self.buffer
    }

    pub fn hooks(&self) -> &Arc<HookTable> {
        &self.hooks
    }

    pub fn connection_log(&self) -> &Arc<ConnectionLog> {
        &self.connections
    }

    pub fn signatures(&self) -> &SignatureCapture {
        &self.signatures
    }

    pub fn events(&self) -> Vec<InterceptedEvent> {
        self.buffer.events()
    }

    /// Empty the event buffer and every connection's message history.
    pub fn clear_events(&self) {
        self.buffer.clear();
        self.connections.clear_messages();
    }

    pub fn messages(&self) -> Vec<InterceptedEvent> {
        self.connections.messages()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.connections.connections()
    }

    pub fn restore_hook(&self, name: &str) -> usize {
        self.hooks.restore(name)
    }

    pub fn hook_by_path(&self, path: &str) -> Result<(), InterceptError> {
        self.signatures.hook_by_path(path)
    }

    /// Re-run automatic signature hooking for functions defined since attach.
    pub fn hook_common(&self) -> usize {
        self.signatures
            .hook_common(&self.config.signature_names, &self.config.signature_contexts)
    }

    pub fn connection_messages(&self, id: u64) -> Vec<InterceptedEvent> {
        self.connections.connection_messages(id)
    }

    /// Hook a global function.
    ///
    /// Without `callback` the calls are recorded like signature functions.
    /// With one, `callback(original, ...args)` runs in place of the original;
    /// returning `undefined` falls through to the original.
    pub fn hook_function(&self, name: &str, callback: Option<Function>) -> Result<(), InterceptError> {
        let global = self.realm.global();
        match callback {
            None => self.signatures.hook(Some(global), name, ROOT_LABEL),
            Some(callback) => self
                .hooks
                .wrap(Some(global), name, ROOT_LABEL, delegate_to(callback)),
        }
    }

    /// Publish the capture API on the global object under [`API_ROOT`].
    pub fn publish_api(self: &Arc<Self>) {
        let api = Object::new();
        let weak = Arc::downgrade(self);

        api.set(
            "getInterceptedEvents",
            api_fn(&weak, "getInterceptedEvents", |this, _| to_value(&this.events())),
        );
        api.set(
            "clearInterceptedEvents",
            api_fn(&weak, "clearInterceptedEvents", |this, _| {
                this.clear_events();
                Ok(Value::Undefined)
            }),
        );
        api.set(
            "restoreHook",
            api_fn(&weak, "restoreHook", |this, args| {
                let name = string_arg(args, "restoreHook")?;
                Ok(Value::Bool(this.restore_hook(name) > 0))
            }),
        );
        api.set(
            "hookByPath",
            api_fn(&weak, "hookByPath", |this, args| {
                let path = string_arg(args, "hookByPath")?;
                Ok(Value::Bool(this.hook_by_path(path).is_ok()))
            }),
        );
        api.set(
            "hookCommon",
            api_fn(&weak, "hookCommon", |this, _| Ok(Value::from(this.hook_common()))),
        );
        api.set(
            "hookFunction",
            api_fn(&weak, "hookFunction", |this, args| {
                let name = string_arg(args, "hookFunction")?;
                let callback = args.get(1).and_then(Value::as_function).cloned();
                Ok(Value::Bool(this.hook_function(name, callback).is_ok()))
            }),
        );
        api.set(
            "getConnectionMessages",
            api_fn(&weak, "getConnectionMessages", |this, args| {
                let id = args
                    .first()
                    .and_then(Value::as_f64)
                    .filter(|id| *id >= 0.0 && id.fract() == 0.0)
                    .ok_or_else(|| Exception::new("getConnectionMessages expects a connection id"))?;
                to_value(&this.connection_messages(id as u64))
            }),
        );
        api.set(
            "getConnections",
            api_fn(&weak, "getConnections", |this, _| to_value(&this.connections())),
        );
        api.set(
            "getMessages",
            api_fn(&weak, "getMessages", |this, _| to_value(&this.messages())),
        );

        self.realm.global().set(API_ROOT, api.clone());
        self.attachment().api = Some(api);
    }
}

impl Drop for Instrumentation {
    fn drop(&mut self) {
        self.detach();
    }
}

fn api_fn<F>(weak: &Weak<Instrumentation>, name: &str, body: F) -> Function
where
    F: Fn(&Instrumentation, &[Value]) -> Result<Value, Exception> + Send + Sync + 'static,
{
    let weak = weak.clone();
    Function::new(name, move |_, args| match weak.upgrade() {
        Some(this) => body(&this, args),
        None => Err(Exception::new("instrumentation is detached")),
    })
}

fn delegate_to(callback: Function) -> HookCallback {
    Arc::new(
        move |invocation: &Invocation<'_>| -> Result<Interception, Exception> {
            let mut args = Vec::with_capacity(invocation.args().len() + 1);
            args.push(Value::Function(invocation.original().clone()));
            args.extend_from_slice(invocation.args());
            match callback.call(invocation.receiver(), &args)? {
                Value::Undefined => Ok(Interception::Fallthrough),
                value => Ok(Interception::Override(value)),
            }
        },
    )
}

fn string_arg<'a>(args: &'a [Value], op: &str) -> Result<&'a str, Exception> {
    args.first()
        .and_then(Value::as_str)
        .ok_or_else(|| Exception::new(format!("{} expects a string argument", op)))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, Exception> {
    serde_json::to_value(value).map(Value::from).map_err(|e| {
        warn!(error = %e, "capture API serialization failed");
        Exception::new(e.to_string())
    })
}

// ============================================================================
// Tests
// ============================================================================
