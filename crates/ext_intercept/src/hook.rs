//! Call interceptor: replace a function binding with a wrapper that routes
//! every call through a callback before (or instead of) the original.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::realm::{Exception, Function, Object, Value};
use crate::InterceptError;

/// Context label of bindings on the global object.
pub const ROOT_LABEL: &str = "window";

/// What a hook callback decided.
#[derive(Debug, Clone, PartialEq)]
pub enum Interception {
    /// Return this value without (further) involving the original.
    Override(Value),
    /// Call the original with the same receiver and arguments.
    Fallthrough,
}

/// One intercepted call, as seen by a hook callback.
pub struct Invocation<'a> {
    original: &'a Function,
    receiver: &'a Value,
    args: &'a [Value],
    outcome: RefCell<Option<Result<Value, Exception>>>,
}

impl<'a> Invocation<'a> {
    fn new(original: &'a Function, receiver: &'a Value, args: &'a [Value]) -> Self {
        Self {
            original,
            receiver,
            args,
            outcome: RefCell::new(None),
        }
    }

    pub fn original(&self) -> &Function {
        self.original
    }

    pub fn receiver(&self) -> &Value {
        self.receiver
    }

    pub fn args(&self) -> &[Value] {
        self.args
    }

    /// Call the original with the intercepted receiver and arguments.
    pub fn call_original(&self) -> Result<Value, Exception> {
        let result = self.original.call(self.receiver, self.args);
        *self.outcome.borrow_mut() = Some(result.clone());
        result
    }

    fn original_called(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    fn original_failed(&self) -> bool {
        matches!(*self.outcome.borrow(), Some(Err(_)))
    }

    /// Outcome of the original, calling it now if the callback never did.
    fn finish(&self) -> Result<Value, Exception> {
        let memo = self.outcome.borrow_mut().take();
        match memo {
            Some(result) => result,
            None => self.original.call(self.receiver, self.args),
        }
    }
}

/// Hook callback. `Err` is only propagated when it is the original's own exception.
pub type HookCallback =
    Arc<dyn Fn(&Invocation<'_>) -> Result<Interception, Exception> + Send + Sync>;

/// Bookkeeping for one wrapped (object, function) slot.
#[derive(Debug, Clone)]
pub struct HookRegistration {
    pub target: Object,
    pub function_name: String,
    pub original: Function,
    pub wrapper: Function,
    pub context_label: String,
}

impl HookRegistration {
    /// `label.name`, e.g. `window.sign`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.context_label, self.function_name)
    }

    fn answers_to(&self, name: &str) -> bool {
        if self.context_label == ROOT_LABEL && self.function_name == name {
            return true;
        }
        self.qualified_name() == name
    }

    fn is_installed(&self) -> bool {
        matches!(
            self.target.get(&self.function_name),
            Some(Value::Function(current)) if current.ptr_eq(&self.wrapper)
        )
    }
}

fn build_wrapper(name: &str, original: Function, callback: HookCallback) -> Function {
    let label = name.to_string();
    Function::new(name, move |receiver, args| {
        let invocation = Invocation::new(&original, receiver, args);
        match panic::catch_unwind(AssertUnwindSafe(|| callback(&invocation))) {
            Ok(Ok(Interception::Override(value))) => Ok(value),
            Ok(Ok(Interception::Fallthrough)) => invocation.finish(),
            Ok(Err(exception)) if invocation.original_failed() => Err(exception),
            Ok(Err(exception)) => {
                warn!(function = %label, error = %exception, "hook callback failed, falling through");
                invocation.finish()
            }
            Err(_) => {
                warn!(
                    function = %label,
                    original_called = invocation.original_called(),
                    "hook callback panicked, falling through"
                );
                invocation.finish()
            }
        }
    })
}

/// Table of installed hooks. At most one wrapper per (object, name).
#[derive(Default)]
pub struct HookTable {
    entries: Mutex<Vec<HookRegistration>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HookRegistration>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wrap `target[name]` so calls pass through `callback`.
    ///
    /// Re-wrapping a slot this table already wraps replaces the wrapper and
    /// keeps the first original. A missing target or non-callable property is
    /// logged and reported; nothing is changed.
    pub fn wrap(
        &self,
        target: Option<&Object>,
        name: &str,
        label: &str,
        callback: HookCallback,
    ) -> Result<(), InterceptError> {
        let Some(target) = target else {
            warn!(function = %name, context = %label, "hook target absent");
            return Err(InterceptError::target_absent(format!("{}.{}", label, name)));
        };

        let mut entries = self.lock();
        let existing = entries
            .iter()
            .position(|r| r.target.ptr_eq(target) && r.function_name == name);

        let original = match (existing, target.get(name)) {
            (Some(index), Some(Value::Function(current)))
                if current.ptr_eq(&entries[index].wrapper) =>
            {
                entries[index].original.clone()
            }
            (_, Some(Value::Function(current))) => current,
            _ => {
                warn!(function = %name, context = %label, "hook target is not callable");
                return Err(InterceptError::not_callable(format!("{}.{}", label, name)));
            }
        };

        if let Some(index) = existing {
            entries.remove(index);
        }

        let wrapper = build_wrapper(name, original.clone(), callback);
        target.set(name, wrapper.clone());
        entries.push(HookRegistration {
            target: target.clone(),
            function_name: name.to_string(),
            original,
            wrapper,
            context_label: label.to_string(),
        });

        info!(function = %name, context = %label, "hook installed");
        Ok(())
    }

    /// Restore the registration named `name`.
    ///
    /// A bare name only matches a global binding (label `window`); hooks on
    /// other objects are addressed by their qualified name, e.g. `crypto.sign`.
    /// Returns how many registrations were removed; restoring an unknown name is a no-op.
    pub fn restore(&self, name: &str) -> usize {
        let mut restored = 0;
        self.lock().retain(|registration| {
            if !registration.answers_to(name) {
                return true;
            }
            rebind(registration);
            restored += 1;
            false
        });
        if restored > 0 {
            info!(function = %name, count = restored, "hook restored");
        }
        restored
    }

    /// Restore every hook in the table.
    pub fn restore_all(&self) -> usize {
        let drained: Vec<HookRegistration> = self.lock().drain(..).collect();
        for registration in &drained {
            rebind(registration);
        }
        drained.len()
    }

    pub fn is_hooked(&self, target: &Object, name: &str) -> bool {
        self.lock()
            .iter()
            .any(|r| r.target.ptr_eq(target) && r.function_name == name)
    }

    pub fn registrations(&self) -> Vec<HookRegistration> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn rebind(registration: &HookRegistration) {
    // The page may have replaced our wrapper since; leave its binding alone.
    if registration.is_installed() {
        registration
            .target
            .set(registration.function_name.clone(), registration.original.clone());
    } else {
        debug!(
            function = %registration.qualified_name(),
            "wrapper no longer bound, dropping registration"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================
