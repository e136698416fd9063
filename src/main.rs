use actix_keyed_rate_limit::backend::any::AnyBackend;
use actix_keyed_rate_limit::backend::InputFunctionBuilder;
use actix_keyed_rate_limit::config::Settings;
use actix_keyed_rate_limit::RateLimiter;
use actix_web::{get, App, HttpRequest, HttpResponse, HttpServer, Responder};
use anyhow::Context;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Upper bound on the time spent in the rate limiter for a single request.
const LIMITER_TIMEOUT: Duration = Duration::from_millis(500);

#[get("/ping")]
async fn ping() -> impl Responder {
    HttpResponse::Ok().body("pong")
}

#[get("/hello")]
async fn hello(req: HttpRequest) -> impl Responder {
    let peer = req
        .connection_info()
        .peer_addr()
        .unwrap_or("unknown")
        .to_owned();
    HttpResponse::Ok().body(format!("hello, your ip: {peer}\n"))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let settings = Settings::from_env().context("Invalid configuration")?;
    let backend = AnyBackend::from_settings(&settings)
        .await
        .context("Unable to create the rate limiter")?;
    let fail_open = settings.rate_limit_fail_open;

    log::info!("Starting server on :{}", settings.port);
    HttpServer::new(move || {
        let input_fn = InputFunctionBuilder::new()
            .peer_ip_key()
            .timeout(LIMITER_TIMEOUT)
            .build();
        let limiter = RateLimiter::builder(backend.clone(), input_fn)
            .add_headers()
            .fail_open(fail_open)
            .build();
        App::new().service(ping).service(hello).wrap(limiter)
    })
    .bind(("0.0.0.0", settings.port))?
    .run()
    .await?;
    Ok(())
}
