//! Routing token extraction for sticky sessions
//!
//! Backends tag their session ids with a route suffix, e.g.
//! `JSESSIONID=8f2c1e.s1` belongs to the host registered with route `s1`.
//! The balancer only needs the suffix; everything else about the session is
//! the backend's business.

use crate::http::request::Request;

/// Pulls the routing token out of an inbound request.
pub trait RouteExtractor: Send + Sync {
    fn extract(&self, request: &Request) -> Option<String>;
}

impl<F> RouteExtractor for F
where
    F: Fn(&Request) -> Option<String> + Send + Sync,
{
    fn extract(&self, request: &Request) -> Option<String> {
        self(request)
    }
}

/// Reads the route from a session cookie, falling back to a matching path
/// parameter (`/app;jsessionid=8f2c1e.s1`).
#[derive(Debug, Clone)]
pub struct SessionCookieRoute {
    cookie_name: String,
    path_parameter: String,
}

impl SessionCookieRoute {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        let cookie_name = cookie_name.into();
        let path_parameter = cookie_name.to_ascii_lowercase();
        Self {
            cookie_name,
            path_parameter,
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    fn session_from_cookies<'a>(&self, request: &'a Request) -> Option<&'a str> {
        request
            .headers
            .get_all("Cookie")
            .flat_map(|header| header.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.cookie_name)
            .map(|(_, value)| value.trim_matches('"'))
    }

    fn session_from_path<'a>(&self, request: &'a Request) -> Option<&'a str> {
        let path = request.path.split('?').next().unwrap_or_default();
        path.split(';')
            .skip(1)
            .filter_map(|param| param.split_once('='))
            .find(|(name, _)| name.eq_ignore_ascii_case(&self.path_parameter))
            .map(|(_, value)| value)
    }
}

impl Default for SessionCookieRoute {
    fn default() -> Self {
        Self::new("JSESSIONID")
    }
}

impl RouteExtractor for SessionCookieRoute {
    fn extract(&self, request: &Request) -> Option<String> {
        let session = self
            .session_from_cookies(request)
            .or_else(|| self.session_from_path(request))?;

        let (_, route) = session.rsplit_once('.')?;
        (!route.is_empty()).then(|| route.to_string())
    }
}
