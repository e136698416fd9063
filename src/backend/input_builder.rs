use crate::backend::RateLimitInput;
use actix_web::dev::ServiceRequest;
use actix_web::rt::time::Instant;
use actix_web::ResponseError;
use std::future::{ready, Ready};
use std::net::{AddrParseError, IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

type CustomFn = Box<dyn Fn(&ServiceRequest) -> Result<String, actix_web::Error>>;

pub type InputFuture = Ready<Result<RateLimitInput, actix_web::Error>>;

/// Utility to create an input function that produces a [RateLimitInput].
///
/// The key components are joined with `-`. You should take care to ensure that you are producing
/// unique keys per backend; with no components at all every request shares the empty key.
///
/// This will not be of any use if you want to perform an asynchronous operation to derive the key;
/// you should instead write your own input function.
pub struct InputFunctionBuilder {
    real_ip_key: bool,
    peer_ip_key: bool,
    path_key: bool,
    custom_key: Option<String>,
    custom_fn: Option<CustomFn>,
    timeout: Option<Duration>,
}

impl Default for InputFunctionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl InputFunctionBuilder {
    pub fn new() -> Self {
        Self {
            real_ip_key: false,
            peer_ip_key: false,
            path_key: false,
            custom_key: None,
            custom_fn: None,
            timeout: None,
        }
    }

    /// Adds the client's real IP to the rate limiting key.
    ///
    /// # Security
    ///
    /// This calls
    /// [ConnectionInfo::realip_remote_addr()](actix_web::dev::ConnectionInfo::realip_remote_addr)
    /// internally which is only suitable for Actix applications deployed behind a proxy that you
    /// control.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn real_ip_key(mut self) -> Self {
        self.real_ip_key = true;
        self
    }

    /// Adds the connection peer IP to the rate limiting key.
    ///
    /// This is suitable when clients connect directly to the Actix application.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn peer_ip_key(mut self) -> Self {
        self.peer_ip_key = true;
        self
    }

    /// Add the request path to the rate limiting key
    pub fn path_key(mut self) -> Self {
        self.path_key = true;
        self
    }

    /// Add a custom component to the rate limiting key
    pub fn custom_key(mut self, key: &str) -> Self {
        self.custom_key = Some(key.to_owned());
        self
    }

    /// Dynamically add a custom component to the rate limiting key
    pub fn custom_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Result<String, actix_web::Error> + 'static,
    {
        self.custom_fn = Some(Box::new(f));
        self
    }

    /// Give the backend at most `timeout` per request, counted from when the input is built.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> InputFuture + 'static {
        move |req| {
            ready((|| {
                let mut components = Vec::new();
                let info = req.connection_info();
                if let Some(custom) = &self.custom_key {
                    components.push(custom.clone());
                }
                if self.real_ip_key {
                    components.push(ip_key(info.realip_remote_addr())?)
                }
                if self.peer_ip_key {
                    components.push(ip_key(info.peer_addr())?)
                }
                if self.path_key {
                    components.push(req.path().to_owned());
                }
                if let Some(f) = &self.custom_fn {
                    components.push(f(req)?)
                }

                Ok(RateLimitInput {
                    key: components.join("-"),
                    deadline: self
                        .timeout
                        .and_then(|timeout| Instant::now().checked_add(timeout)),
                })
            })())
        }
    }
}

#[derive(Debug, Error)]
enum Error {
    #[error("Unable to parse remote IP address: {0}")]
    InvalidIp(
        #[source]
        #[from]
        AddrParseError,
    ),
    #[error("Remote IP address is unknown")]
    MissingIp,
}

impl ResponseError for Error {}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
fn ip_key(ip_str: Option<&str>) -> Result<String, Error> {
    let ip_str = ip_str.ok_or(Error::MissingIp)?;
    // Forwarded addresses may still carry a port
    let ip = match ip_str.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(e) => ip_str
            .parse::<SocketAddr>()
            .map(|addr| addr.ip())
            .map_err(|_| e)?,
    };
    Ok(match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return Ok(v4.to_string());
            }
            let segments = v6.segments();
            let subnet = Ipv6Addr::new(
                segments[0],
                segments[1],
                segments[2],
                segments[3],
                0,
                0,
                0,
                0,
            );
            format!("{}/64", subnet)
        }
    })
}
