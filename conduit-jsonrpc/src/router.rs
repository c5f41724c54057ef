//! After JSON RPC messages have been decoded, those that represent method calls or notifications
//! need to be routed to the corresponding handler, and that handler invoked.  The logic to perform
//! this is called "routing", and is implemented in the [`Router`] type in this module.
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use serde_json::json;
use tracing::error;

use crate::error::panic_err_to_string;
use crate::handler::{self, ErasedHandler, InvocationRequest};
use crate::types::{self, ErrorDetails, ResponsePayload};

/// Type alias for the handlers map to simplify the type signature
type HandlersMap<S> = Arc<RwLock<HashMap<String, Arc<dyn ErasedHandler<S>>>>>;

/// Router inspired loosely by the `axum` crate router, but simplified and specialized for
/// JSON-RPC.
///
/// Clones share the same handler map, so a handler registered through one clone is visible to
/// connections that are already running with another.
#[derive(Clone)]
pub struct Router<S: Clone + Send + Sync + 'static = ()> {
    state: S,
    handlers: HandlersMap<S>,
}

impl Router {
    /// Create a new router that doesn't need any state.
    pub fn new_stateless() -> Router<()> {
        Router::new_with_state(())
    }
}

impl<S: Clone + Send + Sync + 'static> Router<S> {
    /// Create a new router whose handlers can access the provided shared state
    pub fn new_with_state(state: S) -> Self {
        Router {
            state,
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Return the current state in the router.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Register `handler` as the implementation of `method`, replacing any handler previously
    /// registered under that name.
    pub fn register_handler<H, HackT>(&self, method: impl Into<String>, handler: H)
    where
        H: handler::Handler<HackT, S> + 'static,
        HackT: Send + Sync + 'static,
    {
        let method = method.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.insert(method, handler::erase_handler(handler));
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(method)
    }

    /// Names of all registered methods, sorted
    pub fn methods(&self) -> Vec<String> {
        let mut methods = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        methods.sort();
        methods
    }

    fn lookup(&self, method: &str) -> Option<Arc<dyn ErasedHandler<S>>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    /// Run the handler for the request's method and produce its response payload.
    ///
    /// Unknown methods produce a `MethodNotFound` error, and a handler that panics produces an
    /// `InternalError`.  Whether the payload is sent anywhere is up to the caller.
    pub(crate) async fn handle_invocation(&self, request: InvocationRequest) -> ResponsePayload {
        let Some(handler) = self.lookup(&request.method) else {
            return ResponsePayload::error(ErrorDetails::method_not_found(
                types::METHOD_NOT_FOUND_MSG,
                json!(request.method),
            ));
        };

        let method = request.method.clone();
        match AssertUnwindSafe(handler.call(request, self.state.clone()))
            .catch_unwind()
            .await
        {
            Ok(payload) => payload,
            Err(panic) => {
                let message = panic_err_to_string(panic);
                error!(%method, %message, "Handler panicked");
                ResponsePayload::error(ErrorDetails::internal_error(
                    types::INTERNAL_ERROR_MSG,
                    json!(message),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Json, MethodName, Params, State};
    use crate::types::{ErrorCode, ErrorResponse, Id};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn invocation(method: &str, params: Option<serde_json::Value>) -> InvocationRequest {
        InvocationRequest {
            id: Id::from(1u64),
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn routes_by_method_name() {
        let router = Router::new_stateless();
        router.register_handler("first", || async { Json(1) });
        router.register_handler("second", || async { Json(2) });

        assert_eq!(
            router.handle_invocation(invocation("first", None)).await,
            ResponsePayload::success(json!(1))
        );
        assert_eq!(
            router.handle_invocation(invocation("second", None)).await,
            ResponsePayload::success(json!(2))
        );
        assert_eq!(router.methods(), vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn unknown_method_names_the_method() {
        let router = Router::new_stateless();

        assert_eq!(
            router.handle_invocation(invocation("nope", None)).await,
            ResponsePayload::error(ErrorDetails::method_not_found("Method not found", json!("nope")))
        );
    }

    #[tokio::test]
    async fn registration_replaces_and_is_shared_between_clones() {
        let router = Router::new_stateless();
        let running = router.clone();

        router.register_handler("which", || async { Json("old") });
        router.register_handler("which", || async { Json("new") });
        assert!(running.has_handler("which"));

        assert_eq!(
            running.handle_invocation(invocation("which", None)).await,
            ResponsePayload::success(json!("new"))
        );
    }

    #[tokio::test]
    async fn handlers_receive_state() {
        let router = Router::new_with_state(Arc::new(AtomicUsize::new(0)));
        router.register_handler(
            "count",
            |State(count): State<Arc<AtomicUsize>>, MethodName(method): MethodName| async move {
                count.fetch_add(1, Ordering::SeqCst);
                Json(method)
            },
        );

        router.handle_invocation(invocation("count", None)).await;
        router.handle_invocation(invocation("count", None)).await;
        assert_eq!(router.state().load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panics_become_internal_errors() {
        let router = Router::new_stateless();
        router.register_handler("explode", |Params(reason): Params<String>| async move {
            if !reason.is_empty() {
                panic!("exploded: {reason}");
            }
            Json(())
        });

        let payload = router
            .handle_invocation(invocation("explode", Some(json!("on purpose"))))
            .await;
        assert_matches!(
            payload,
            ResponsePayload::Error(ErrorResponse { error }) if error.code == ErrorCode::InternalError
                && error.data == Some(json!("exploded: on purpose"))
        );

        // The router is still usable afterwards
        assert_eq!(
            router.handle_invocation(invocation("explode", Some(json!("")))).await,
            ResponsePayload::success(json!(null))
        );
    }
}
