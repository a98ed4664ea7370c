//! Turns inbound calls into responses.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use ext_intercept::{resolve_callable, Exception, Object, Value};

use crate::eval::{Evaluator, ExpressionEvaluator};
use crate::protocol::{CallRequest, CallResponse};

/// Executes calls against a global object.
///
/// Every call is answered: resolution failures, thrown exceptions and
/// panics inside realm functions all become failure responses.
pub struct Dispatcher {
    root: Object,
    evaluator: Arc<dyn Evaluator>,
    in_flight: Mutex<HashSet<String>>,
}

impl Dispatcher {
    pub fn new(root: Object) -> Self {
        Self::with_evaluator(root, Arc::new(ExpressionEvaluator))
    }

    pub fn with_evaluator(root: Object, evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            root,
            evaluator,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn dispatch(&self, call: &CallRequest, allow_code: bool) -> CallResponse {
        let accepted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(call.id.clone());
        if !accepted {
            warn!(id = %call.id, "duplicate call id rejected");
            return CallResponse::fail(&call.id, "duplicate call id");
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.execute(call, allow_code)?.try_to_json()
        }))
        .unwrap_or_else(|_| Err(Exception::new("remote call panicked")));

        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&call.id);

        match outcome {
            Ok(result) => {
                debug!(id = %call.id, "call succeeded");
                CallResponse::ok(&call.id, result)
            }
            Err(e) => {
                debug!(id = %call.id, error = %e.message, "call failed");
                CallResponse::fail(&call.id, e.message).with_stack(e.stack)
            }
        }
    }

    fn execute(&self, call: &CallRequest, allow_code: bool) -> Result<Value, Exception> {
        let code = call.code.as_deref().filter(|code| !code.is_empty());
        let path = call.function_path.as_deref().filter(|path| !path.is_empty());

        match (code, path) {
            (Some(_), Some(_)) => Err(Exception::new(
                "call must carry exactly one of code or functionName",
            )),
            (None, None) => Err(Exception::new("missing code or function_path")),
            (None, Some(path)) => {
                let function = resolve_callable(&self.root, path)
                    .ok_or_else(|| Exception::new(format!("function not found: {}", path)))?;
                let args: Vec<Value> = call
                    .args
                    .iter()
                    .flatten()
                    .cloned()
                    .map(Value::from)
                    .collect();
                function.call(&Value::Object(self.root.clone()), &args)
            }
            (Some(code), None) => {
                if !allow_code {
                    return Err(Exception::new("code execution is disabled"));
                }
                self.evaluator.evaluate(&self.root, code)
            }
        }
    }
}
