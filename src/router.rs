//! Regex-based request dispatch.
use std::future::Future;

use futures_util::future::BoxFuture;
use regex::Regex;

use crate::error::{Error, HttpError};
use crate::exchange::Exchange;
use crate::method::Method;

type RouteFuture = BoxFuture<'static, Result<Exchange, HttpError>>;
type RouteFn = Box<dyn Fn(Exchange) -> RouteFuture + Send + Sync>;

struct Route {
    methods: Vec<Method>,
    pattern: Regex,
    handler: RouteFn,
}

/// Dispatches exchanges to handlers by method and path pattern.
///
/// Routes are scanned in insertion order; the first entry whose method set
/// contains the request method and whose pattern matches the decoded path
/// wins. The winning route's captures are published to the scratch state:
/// `"match"` holds the full matched text and `"matches"` the captured
/// groups in order (as `Vec<String>`).
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

/// What [`Router::route`] did with an exchange.
#[derive(Debug)]
pub struct Routed {
    /// The exchange, processed by the matching handler if one was found.
    pub exchange: Exchange,
    /// Whether any route matched. When `false` the exchange is returned
    /// untouched so the caller can fall through to its own handling.
    pub found_route: bool,
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Router {
        Router { routes: Vec::new() }
    }

    /// Registers a route for a single method.
    pub fn add_route<F, R>(&mut self, method: Method, pattern: &str, handler: F) -> crate::Result<()>
    where
        F: Fn(Exchange) -> R + Send + Sync + 'static,
        R: Future<Output = Result<Exchange, HttpError>> + Send + 'static,
    {
        self.add_routes(vec![method], pattern, handler)
    }

    /// Registers a route matching any of `methods`.
    pub fn add_routes<F, R>(
        &mut self,
        methods: Vec<Method>,
        pattern: &str,
        handler: F,
    ) -> crate::Result<()>
    where
        F: Fn(Exchange) -> R + Send + Sync + 'static,
        R: Future<Output = Result<Exchange, HttpError>> + Send + 'static,
    {
        let pattern = Regex::new(pattern).map_err(Error::new_route)?;
        let handler: RouteFn = Box::new(move |exchange| Box::pin(handler(exchange)));
        self.routes.push(Route {
            methods,
            pattern,
            handler,
        });
        Ok(())
    }

    /// Routes an exchange to the first matching entry.
    pub async fn route(&self, mut exchange: Exchange) -> Result<Routed, HttpError> {
        for route in &self.routes {
            if !route.methods.contains(exchange.request.method()) {
                continue;
            }
            let Some(captures) = route.pattern.captures(exchange.request.path()) else {
                continue;
            };

            let full = captures
                .get(0)
                .map(|m| m.as_str().to_owned())
                .unwrap_or_default();
            let groups: Vec<String> = captures
                .iter()
                .skip(1)
                .map(|group| group.map(|m| m.as_str().to_owned()).unwrap_or_default())
                .collect();
            exchange.state.insert("match", full);
            exchange.state.insert("matches", groups);

            let exchange = (route.handler)(exchange).await?;
            return Ok(Routed {
                exchange,
                found_route: true,
            });
        }

        Ok(Routed {
            exchange,
            found_route: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use bytes::BytesMut;

    use super::Router;
    use crate::config::ServerConfig;
    use crate::error::HttpError;
    use crate::exchange::Exchange;
    use crate::method::Method;
    use crate::request::Request;
    use crate::response::Response;
    use crate::status::StatusCode;

    fn exchange_for(method: &str, path: &str) -> Exchange {
        let config = Arc::new(ServerConfig::default());
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut request = Request::new(config.clone(), peer);
        let mut response = Response::new(config);
        let wire = format!("{} {} HTTP/1.1\r\n\r\n", method, path);
        let mut buf = BytesMut::from(wire.as_bytes());
        request.parse(&mut buf, &mut response);
        Exchange::new(request, response, Arc::new(AtomicBool::new(false)))
    }

    #[tokio::test]
    async fn routes_by_method_and_pattern() {
        let mut router = Router::new();
        router
            .add_route(Method::Get, r"^/users/(\d+)$", |mut exchange: Exchange| async move {
                let id = exchange
                    .state
                    .get::<Vec<String>>("matches")
                    .and_then(|groups| groups.first().cloned())
                    .unwrap_or_default();
                exchange
                    .response
                    .set_status_with(StatusCode::Ok, id, "text/plain");
                Ok(exchange)
            })
            .unwrap();

        let routed = router.route(exchange_for("GET", "/users/42")).await.unwrap();
        assert!(routed.found_route);
        assert_eq!(routed.exchange.response.body(), b"42");
        assert_eq!(
            routed.exchange.state.get::<String>("match").map(String::as_str),
            Some("/users/42")
        );
    }

    #[tokio::test]
    async fn method_mismatch_falls_through() {
        let mut router = Router::new();
        router
            .add_route(Method::Post, r"^/users/(\d+)$", |exchange: Exchange| async move {
                Ok(exchange)
            })
            .unwrap();

        let routed = router.route(exchange_for("GET", "/users/42")).await.unwrap();
        assert!(!routed.found_route);
        assert!(!routed.exchange.response.is_valid());
    }

    #[tokio::test]
    async fn first_matching_route_wins() {
        let mut router = Router::new();
        router
            .add_route(Method::Get, r"^/files/.*$", |mut exchange: Exchange| async move {
                exchange
                    .response
                    .set_status_with(StatusCode::Ok, "wildcard", "text/plain");
                Ok(exchange)
            })
            .unwrap();
        router
            .add_route(Method::Get, r"^/files/exact$", |mut exchange: Exchange| async move {
                exchange
                    .response
                    .set_status_with(StatusCode::Ok, "exact", "text/plain");
                Ok(exchange)
            })
            .unwrap();

        let routed = router
            .route(exchange_for("GET", "/files/exact"))
            .await
            .unwrap();
        assert_eq!(routed.exchange.response.body(), b"wildcard");
    }

    #[tokio::test]
    async fn handler_errors_propagate() {
        let mut router = Router::new();
        router
            .add_route(Method::Get, r"^/private$", |_exchange: Exchange| async move {
                Err(HttpError::with_message(
                    StatusCode::Unauthorized,
                    "Access denied",
                ))
            })
            .unwrap();

        let err = router
            .route(exchange_for("GET", "/private"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::Unauthorized);
    }

    #[test]
    fn bad_patterns_are_rejected() {
        let mut router = Router::new();
        let result = router.add_route(Method::Get, r"^/(unclosed$", |exchange: Exchange| async move {
            Ok(exchange)
        });
        assert!(result.is_err());
    }
}
