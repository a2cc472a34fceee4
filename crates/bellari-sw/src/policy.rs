//! Request classification for fetch interception.
//!
//! Classification runs the rules top to bottom and stops at the first hit:
//!
//! | # | rule                              | class        | strategy      |
//! |---|-----------------------------------|--------------|---------------|
//! | 1 | URL not same-origin               | `CrossOrigin`| passthrough   |
//! | 2 | path contains [`ADMIN_ROUTE_MARKER`] | `AdminRoute` | passthrough |
//! | 2 | method is not GET                 | `NonGet`     | passthrough   |
//! | 3 | navigation request                | `Navigation` | network first |
//! | 4 | anything else                     | `Asset`      | cache first   |

use bellari_net::Request;
use http::Method;
use url::{Origin, Url};

/// Paths containing this are admin routes and always go to the network.
pub const ADMIN_ROUTE_MARKER: &str = "/admin/";

/// What kind of request the worker is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    CrossOrigin,
    AdminRoute,
    NonGet,
    Navigation,
    Asset,
}

/// How a request class is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Do not intercept; the browser handles the request.
    Passthrough(PassthroughReason),
    /// Network, then the exact cache entry, then the offline fallback.
    NetworkFirst,
    /// Cache, then network. Network responses are not written back.
    CacheFirst,
}

/// Why a request was not intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughReason {
    CrossOrigin,
    AdminRoute,
    NonGet,
    /// No active worker controls the request.
    Uncontrolled,
}

impl RequestClass {
    pub fn strategy(self) -> Strategy {
        match self {
            RequestClass::CrossOrigin => Strategy::Passthrough(PassthroughReason::CrossOrigin),
            RequestClass::AdminRoute => Strategy::Passthrough(PassthroughReason::AdminRoute),
            RequestClass::NonGet => Strategy::Passthrough(PassthroughReason::NonGet),
            RequestClass::Navigation => Strategy::NetworkFirst,
            RequestClass::Asset => Strategy::CacheFirst,
        }
    }
}

/// Classifies requests relative to the worker's origin.
#[derive(Debug, Clone)]
pub struct InterceptPolicy {
    origin: Origin,
}

impl InterceptPolicy {
    pub fn new(origin: &Url) -> Self {
        Self {
            origin: origin.origin(),
        }
    }

    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin
    }

    pub fn classify(&self, request: &Request) -> RequestClass {
        if !self.is_same_origin(&request.url) {
            RequestClass::CrossOrigin
        } else if request.url.path().contains(ADMIN_ROUTE_MARKER) {
            RequestClass::AdminRoute
        } else if request.method != Method::GET {
            RequestClass::NonGet
        } else if request.is_navigation() {
            RequestClass::Navigation
        } else {
            RequestClass::Asset
        }
    }

    pub fn strategy(&self, request: &Request) -> Strategy {
        self.classify(request).strategy()
    }
}
