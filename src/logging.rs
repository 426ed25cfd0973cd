use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};

use rocket::{
    fairing::{Fairing, Info, Kind},
    http::StatusClass,
    request::{FromRequest, Outcome},
    Data, Orbit, Request, Response, Rocket,
};

/// A unique identifier for a particular request, used to correlate the
/// request and response log lines.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct RequestId(pub usize);

impl RequestId {
    /// Atomically get the next ID; wraps around on overflow.
    pub fn next() -> RequestId {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        RequestId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for &'r RequestId {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(req.local_cache(RequestId::next))
    }
}

/// Global request/response logging.
#[derive(Debug, Copy, Clone)]
pub struct LoggerFairing;

#[rocket::async_trait]
impl Fairing for LoggerFairing {
    fn info(&self) -> Info {
        Info {
            name: "Logger",
            kind: Kind::Liftoff | Kind::Request | Kind::Response | Kind::Shutdown,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        let config = rocket.config();
        let protocol = if config.tls_enabled() { "https" } else { "http" };
        info!(
            "Server launched on {protocol}://{}:{}",
            config.address, config.port
        );
    }

    async fn on_request(&self, req: &mut Request<'_>, _data: &mut Data<'_>) {
        let id = req.local_cache(RequestId::next);
        info!("->req{id} {} {}", req.method(), req.uri());
    }

    async fn on_response<'r>(&self, req: &'r Request<'_>, res: &mut Response<'r>) {
        let id = req.local_cache(RequestId::next);
        let code = res.status();
        let route = req
            .route()
            .map(|r| r.uri.to_string())
            .unwrap_or_else(|| "UNKNOWN ROUTE".to_string());
        let line = format!("<-rsp{id} {code} {route}");
        match code.class() {
            StatusClass::ServerError => error!("{line}"),
            StatusClass::ClientError => warn!("{line}"),
            _ => info!("{line}"),
        }
    }

    async fn on_shutdown(&self, _rocket: &Rocket<Orbit>) {
        warn!("Shutdown requested, stopping gracefully...");
    }
}
