//! Handler traits.
//!
//! [`Handler`] is the connection driver's view: one `call` per request,
//! generic over the response body so the driver can stream anything that
//! implements `http_body::Body`. [`RequestHandler`] is the router's
//! object-safe flavour with a boxed future and the concrete
//! [`ResponseBody`]; [`route_fn`] adapts async closures to it.

use std::error::Error;
use std::future::Future;

use futures::future::LocalBoxFuture;
use http::{Request, Response};
use http_body::Body;

use crate::protocol::body::ReqBody;
use crate::protocol::ResponseBody;

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Anything that can turn a request into a response.
pub trait Handler {
    type RespBody: Body;
    type Error: Into<BoxError>;
    type Fut<'fut>: Future<Output = Result<Response<Self::RespBody>, Self::Error>>
    where
        Self: 'fut;

    fn call(&self, req: Request<ReqBody>) -> Self::Fut<'_>;
}

/// Wraps a closure as a [`Handler`].
#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

impl<RespBody, Err, F, Fut> Handler for HandlerFn<F>
where
    RespBody: Body,
    F: Fn(Request<ReqBody>) -> Fut,
    Err: Into<BoxError>,
    Fut: Future<Output = Result<Response<RespBody>, Err>>,
{
    type RespBody = RespBody;
    type Error = Err;
    type Fut<'fut> = Fut where Self: 'fut;

    fn call(&self, req: Request<ReqBody>) -> Self::Fut<'_> {
        (self.f)(req)
    }
}

pub fn make_handler<F, RespBody, Err, Ret>(f: F) -> HandlerFn<F>
where
    RespBody: Body,
    Err: Into<BoxError>,
    Ret: Future<Output = Result<Response<RespBody>, Err>>,
    F: Fn(Request<ReqBody>) -> Ret,
{
    HandlerFn { f }
}

/// Object-safe handler stored in the route table.
pub trait RequestHandler {
    fn invoke<'a>(&'a self, req: Request<ReqBody>) -> LocalBoxFuture<'a, Result<Response<ResponseBody>, BoxError>>;
}

struct RouteFn<F> {
    f: F,
}

impl<F, Fut> RequestHandler for RouteFn<F>
where
    F: Fn(Request<ReqBody>) -> Fut,
    Fut: Future<Output = Result<Response<ResponseBody>, BoxError>> + 'static,
{
    fn invoke<'a>(&'a self, req: Request<ReqBody>) -> LocalBoxFuture<'a, Result<Response<ResponseBody>, BoxError>> {
        Box::pin((self.f)(req))
    }
}

/// Adapts an async closure to a [`RequestHandler`].
pub fn route_fn<F, Fut>(f: F) -> impl RequestHandler
where
    F: Fn(Request<ReqBody>) -> Fut,
    Fut: Future<Output = Result<Response<ResponseBody>, BoxError>> + 'static,
{
    RouteFn { f }
}
