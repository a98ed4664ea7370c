//! Signature capture: wrap signing, hashing and token helpers and record
//! their arguments, result, timing and call stack.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

use crate::buffer::{EventBuffer, EventKind};
use crate::hook::{HookCallback, HookTable, Interception, Invocation, ROOT_LABEL};
use crate::path::{resolve, resolve_slot};
use crate::realm::{capture_stack, Exception, Object, Value};
use crate::InterceptError;

/// Function names looked up by automatic signature hooking.
pub const DEFAULT_SIGNATURE_NAMES: &[&str] = &[
    "sign",
    "signature",
    "generateSign",
    "createSign",
    "encrypt",
    "encryptData",
    "encryptParams",
    "token",
    "generateToken",
    "createToken",
    "getToken",
    "getSignature",
    "calcSignature",
    "hash",
    "hashParams",
    "hashData",
];

/// Containers searched by automatic signature hooking; `window` is the global object.
pub const DEFAULT_SIGNATURE_CONTEXTS: &[&str] =
    &["window", "crypto", "webpackJsonp", "__webpack_require__"];

/// Installs recording hooks on signature-like functions.
pub struct SignatureCapture {
    root: Object,
    hooks: Arc<HookTable>,
    buffer: Arc<EventBuffer>,
}

impl SignatureCapture {
    pub fn new(root: Object, hooks: Arc<HookTable>, buffer: Arc<EventBuffer>) -> Self {
        Self {
            root,
            hooks,
            buffer,
        }
    }

    /// Callback recording one `sign_call` per completed call.
    ///
    /// A throwing original is not recorded; its exception reaches the caller.
    pub fn recorder(&self, function: &str, context: &str) -> HookCallback {
        let buffer = self.buffer.clone();
        let function = function.to_string();
        let context = context.to_string();

        Arc::new(
            move |invocation: &Invocation<'_>| -> Result<Interception, Exception> {
                let stack = capture_stack();
                let started = Instant::now();
                let result = invocation.call_original()?;
                let execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;

                let args = Value::Array(invocation.args().to_vec()).to_json().to_string();
                let recorded_result = if result.is_primitive() {
                    result.to_json()
                } else {
                    Json::String(result.to_json().to_string())
                };
                buffer.push(buffer.event(
                    EventKind::SignCall,
                    format!("{}.{}", context, function),
                    json!({
                        "function": function,
                        "context": context,
                        "args": args,
                        "result": recorded_result,
                        "execution_time_ms": execution_time_ms,
                        "stack": stack,
                    }),
                ));
                Ok(Interception::Override(result))
            },
        )
    }

    /// Wrap `target[name]` with a recorder labelled `label`.
    pub fn hook(&self, target: Option<&Object>, name: &str, label: &str) -> Result<(), InterceptError> {
        self.hooks.wrap(target, name, label, self.recorder(name, label))
    }

    fn container(&self, label: &str) -> Option<Object> {
        if label == ROOT_LABEL {
            return Some(self.root.clone());
        }
        match resolve(&self.root, label)? {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Check every (context, name) pair and hook the callable ones.
    ///
    /// Returns the number of functions hooked.
    pub fn hook_common<N, C>(&self, names: &[N], contexts: &[C]) -> usize
    where
        N: AsRef<str>,
        C: AsRef<str>,
    {
        let mut hooked = 0;
        for label in contexts.iter().map(AsRef::as_ref) {
            let Some(container) = self.container(label) else {
                debug!(context = %label, "signature context absent");
                continue;
            };
            for name in names.iter().map(AsRef::as_ref) {
                if !matches!(container.get(name), Some(Value::Function(_))) {
                    continue;
                }
                if self.hook(Some(&container), name, label).is_ok() {
                    hooked += 1;
                }
            }
        }
        info!(count = hooked, "signature functions hooked");
        hooked
    }

    /// Hook the function at a dotted path from the root.
    ///
    /// The registration is labelled with the parent path, or `window` for a
    /// top-level function.
    pub fn hook_by_path(&self, path: &str) -> Result<(), InterceptError> {
        let Some((parent, name)) = resolve_slot(&self.root, path) else {
            warn!(path = %path, "hook path not found");
            return Err(InterceptError::path_not_found(path));
        };
        let label = match path.rsplit_once('.') {
            Some((prefix, _)) => prefix.to_string(),
            None => ROOT_LABEL.to_string(),
        };
        self.hook(Some(&parent), &name, &label)
    }
}

// ============================================================================
// Tests
// ============================================================================
