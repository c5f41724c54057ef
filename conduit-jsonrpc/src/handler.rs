//! The code that runs in response to a method call or notification is called a "handler".  All
//! such code implements [`Handler`], although it's not intended that most users will implement
//! that directly.
//!
//! Instead, [`Handler`] is implemented for `async` functions whose arguments are all extractors
//! (anything implementing [`FromRequest`]) and whose return type implements [`IntoResponse`].
//! This is the same approach `axum` takes for HTTP handlers:
//!
//! ```ignore
//! async fn echo(Params(EchoParams { message }): Params<EchoParams>) -> Json<EchoParams> {
//!     Json(EchoParams { message })
//! }
//! ```
//!
//! The dispatcher awaits each handler to completion before reading the next request, so a slow
//! handler holds up everything behind it.
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::types::{self, ErrorDetails, Id, JsonValue, ResponsePayload};

/// The parts of a decoded request that are available to extractors.
///
/// By the time one of these exists the request has already been validated.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub id: Id,
    pub method: String,
    pub params: Option<JsonValue>,
}

impl From<types::Request> for InvocationRequest {
    fn from(request: types::Request) -> Self {
        Self {
            id: request.id,
            method: request.method,
            params: request.params,
        }
    }
}

/// Inspired by axum's `FromRequest` trait.
///
/// Requests here are small, already-decoded JSON values, so unlike axum there is no distinction
/// between extractors that consume the body and those that don't.  Any extractor can appear in
/// any position.
pub trait FromRequest<S>: Sized {
    /// The error type that indicates the extraction of this type from the request failed for some
    /// reason.
    type Rejection: IntoResponse;

    /// Extract the implementor's type from the request.
    fn from_request(request: &InvocationRequest, state: &S) -> Result<Self, Self::Rejection>;
}

/// Deserialize the request params into `T`.
///
/// A request with no `params` member is treated as if it had `"params": null`, so use
/// `Params<Option<T>>` for methods whose params are optional.  If the params don't fit `T` the
/// handler is not called and the caller gets an `InvalidParams` error whose `data` is the reason.
#[derive(Debug, Clone)]
pub struct Params<T>(pub T);

impl<T: DeserializeOwned, S> FromRequest<S> for Params<T> {
    type Rejection = ErrorDetails;

    fn from_request(request: &InvocationRequest, _state: &S) -> Result<Self, Self::Rejection> {
        let params = request.params.clone().unwrap_or(JsonValue::Null);
        serde_json::from_value(params)
            .map(Params)
            .map_err(|e| ErrorDetails::invalid_params(types::INVALID_PARAMS_MSG, json!(e.to_string())))
    }
}

/// The request params exactly as received, `None` if the member was absent.
#[derive(Debug, Clone)]
pub struct RawParams(pub Option<JsonValue>);

impl<S> FromRequest<S> for RawParams {
    type Rejection = Infallible;

    fn from_request(request: &InvocationRequest, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(request.params.clone()))
    }
}

/// Extractor that exposes state to the handler.
#[derive(Debug, Clone)]
pub struct State<S: Clone>(pub S);

impl<S: Clone> FromRequest<S> for State<S> {
    type Rejection = Infallible;

    fn from_request(_request: &InvocationRequest, state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(state.clone()))
    }
}

/// Name of the method being invoked, for handlers registered under more than one name.
#[derive(Debug, Clone)]
pub struct MethodName(pub String);

impl<S> FromRequest<S> for MethodName {
    type Rejection = Infallible;

    fn from_request(request: &InvocationRequest, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(request.method.clone()))
    }
}

/// The request id, or `None` when invoked as a notification.
impl<S> FromRequest<S> for Option<Id> {
    type Rejection = Infallible;

    fn from_request(request: &InvocationRequest, _state: &S) -> Result<Self, Self::Rejection> {
        match &request.id {
            Id::Absent => Ok(None),
            id => Ok(Some(id.clone())),
        }
    }
}

/// Failure of a handler.
///
/// Handlers that care about the exact error the peer sees return [`ErrorDetails`], which is
/// forwarded verbatim.  Anything else, typically an [`anyhow::Error`], is reported as an internal
/// error with the error's text as the `data`.  An `anyhow::Error` that wraps an `ErrorDetails` is
/// unwrapped first, so `?` can be used freely inside handlers without losing structured errors.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Rpc(#[from] ErrorDetails),

    #[error(transparent)]
    Other(anyhow::Error),
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ErrorDetails>() {
            Ok(details) => HandlerError::Rpc(details),
            Err(err) => HandlerError::Other(err),
        }
    }
}

impl From<HandlerError> for ErrorDetails {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Rpc(details) => details,
            HandlerError::Other(err) => {
                ErrorDetails::internal_error(types::INTERNAL_ERROR_MSG, json!(format!("{err:#}")))
            }
        }
    }
}

/// Type implemented by anything that can be converted into a JSON RPC response.
pub trait IntoResponse {
    /// Convert the implementor's type into a JSON RPC response.
    fn into_response(self) -> ResponsePayload;
}

/// Handlers that return a result can be automatically converted into a response payload,
/// provided the success type implements [`Serialize`] and the error type converts into a
/// [`HandlerError`].
impl<T, E> IntoResponse for Result<T, E>
where
    T: Serialize,
    E: Into<HandlerError>,
{
    fn into_response(self) -> ResponsePayload {
        match self {
            Ok(value) => Json(value).into_response(),
            Err(e) => {
                let err: HandlerError = e.into();
                ResponsePayload::error(ErrorDetails::from(err))
            }
        }
    }
}

/// If a handler returns a `JsonValue`, we assume that it's infallible and this is a success
/// response
impl IntoResponse for JsonValue {
    fn into_response(self) -> ResponsePayload {
        ResponsePayload::success(self)
    }
}

impl IntoResponse for ErrorDetails {
    fn into_response(self) -> ResponsePayload {
        ResponsePayload::error(self)
    }
}

/// Handlers with nothing to say, typically the ones meant to be called as notifications, succeed
/// with a `null` result.
impl IntoResponse for () {
    fn into_response(self) -> ResponsePayload {
        ResponsePayload::success(JsonValue::Null)
    }
}

impl IntoResponse for Infallible {
    fn into_response(self) -> ResponsePayload {
        match self {}
    }
}

/// Return `T` in JSON as a success response.
///
/// In the unlikely event that serialization to JSON fails, this will instead produce an error
/// response.
#[derive(Debug, Clone)]
pub struct Json<T>(pub T);

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> ResponsePayload {
        match serde_json::to_value(self.0) {
            Ok(json) => ResponsePayload::success(json),
            Err(e) => ResponsePayload::error(ErrorDetails::internal_error(
                types::INTERNAL_ERROR_MSG,
                json!(format!(
                    "Error serializing {} to JSON: {e}",
                    std::any::type_name::<T>()
                )),
            )),
        }
    }
}

/// A handler for JSON-RPC methods and notifications.
///
/// You may implement it directly, but it's more likely that you'll use the existing
/// implementations on `async` functions.  The way that is accomplished is inspired by how Axum
/// implements its `Handler` trait.
///
/// A handler doesn't know whether it is being invoked as a method call or a notification.  It
/// always produces a response payload, and the dispatcher throws it away for notifications.
///
/// ## Type Parameters
///
/// - `HackT`: This is a hack to get around Rust's rules for trait implementation.  To `impl Trait`
///   with type parameters, those type parameters have to be constrained to the trait itself or the
///   implementing type.  When we make blanket impls for all async functions that take certain types
///   of args, those arg types need to be part of the trait signature.  This type parameter will be
///   erased once the handler is passed to the router, so try to ignore it mentally.
/// - `S`: The type of the state that is passed to the handler.  Even handlers that don't care
///   about state get the state parameter, so they have to all agree on the same state type.
pub trait Handler<HackT, S>: Clone + Send + Sync + Sized + 'static {
    type Future: Future<Output = ResponsePayload> + Send + 'static;

    /// Extract the handler's arguments from the request and run it.
    fn call(self, request: InvocationRequest, state: S) -> Self::Future;
}

impl<F, Fut, S, Res> Handler<(), S> for F
where
    F: FnOnce() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Res> + Send + 'static,
    S: Send + Sync + 'static,
    Res: IntoResponse + 'static,
{
    type Future = BoxFuture<'static, ResponsePayload>;

    fn call(self, _request: InvocationRequest, _state: S) -> Self::Future {
        async move { self().await.into_response() }.boxed()
    }
}

/// Invoke a macro for all supported argument lists.
///
/// Borrowed from axum's `all_the_tuples`, but there aren't many useful extractors so four is
/// plenty.
#[rustfmt::skip]
macro_rules! all_the_tuples {
    ($name:ident) => {
        $name!([], T1);
        $name!([T1], T2);
        $name!([T1, T2], T3);
        $name!([T1, T2, T3], T4);
    };
}

/// Generates the [`Handler`] impl for async functions taking extractors as arguments.
macro_rules! impl_handler {
    (
        [$($ty:ident),*], $last:ident
    ) => {
        #[allow(non_snake_case)]
        impl<F, Fut, S, Res, $($ty,)* $last> Handler<($($ty,)* $last,), S> for F
        where
            F: FnOnce($($ty,)* $last,) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            S: Send + Sync + 'static,
            Res: IntoResponse + 'static,
            $( $ty: FromRequest<S> + Send + 'static, )*
            $last: FromRequest<S> + Send + 'static,
        {
            type Future = BoxFuture<'static, ResponsePayload>;

            fn call(self, request: InvocationRequest, state: S) -> Self::Future {
                async move {
                    $(
                        let $ty = match $ty::from_request(&request, &state) {
                            Ok(value) => value,
                            Err(rejection) => return rejection.into_response(),
                        };
                    )*

                    let $last = match $last::from_request(&request, &state) {
                        Ok(value) => value,
                        Err(rejection) => return rejection.into_response(),
                    };

                    self($($ty,)* $last,).await.into_response()
                }
                .boxed()
            }
        }
    };
}

all_the_tuples!(impl_handler);

/// Dyn-compatible version of [`Handler`], which erases the `HackT` type parameter so handlers of
/// different signatures can live in the same map.
pub(crate) trait ErasedHandler<S>: Send + Sync + 'static {
    fn call(&self, request: InvocationRequest, state: S) -> BoxFuture<'static, ResponsePayload>;
}

struct HandlerWrapper<H, HackT> {
    handler: H,
    _hack: PhantomData<fn() -> HackT>,
}

impl<H, HackT, S> ErasedHandler<S> for HandlerWrapper<H, HackT>
where
    H: Handler<HackT, S>,
    HackT: 'static,
    S: 'static,
{
    fn call(&self, request: InvocationRequest, state: S) -> BoxFuture<'static, ResponsePayload> {
        self.handler.clone().call(request, state).boxed()
    }
}

pub(crate) fn erase_handler<H, HackT, S>(handler: H) -> Arc<dyn ErasedHandler<S>>
where
    H: Handler<HackT, S>,
    HackT: Send + Sync + 'static,
    S: 'static,
{
    Arc::new(HandlerWrapper {
        handler,
        _hack: PhantomData,
    })
}
