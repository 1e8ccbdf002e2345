//! Liveness endpoint: `GET /health` answers `200 OK`, anything else `404`.

use std::convert::Infallible;

use acton_reactive::prelude::*;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

fn health_response(req: &Request<Incoming>) -> Response<Full<Bytes>> {
    let status = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => StatusCode::OK,
        _ => StatusCode::NOT_FOUND,
    };
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// Accepts connections on `listener` until `cancel` fires.
async fn serve(listener: TcpListener, cancel: CancellationToken) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        tokio::spawn(async move {
                            let service = service_fn(|req: Request<Incoming>| async move {
                                Ok::<_, Infallible>(health_response(&req))
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await
                            {
                                tracing::debug!("Health connection ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("Error accepting health connection: {:?}", e),
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Health server shutting down");
                break;
            }
        }
    }
}

#[acton_actor]
pub struct HealthState;

impl HealthState {
    pub async fn create(runtime: &mut ActorRuntime, config: &Config) -> anyhow::Result<ActorHandle> {
        let actor_config = ActorConfig::new(Ern::with_root("health-check")?, None, None)?
            .with_restart_policy(RestartPolicy::Permanent);

        let mut builder = runtime.new_actor_with_config::<Self>(actor_config);

        let cancel = CancellationToken::new();
        let cancel_for_loop = cancel.clone();
        let cancel_for_stop = cancel.clone();
        let addr = format!(
            "{}:{}",
            config.health_check_bind_address, config.health_check_port
        );

        builder.after_start(move |_actor| {
            let addr = addr.clone();
            let cancel = cancel_for_loop.clone();

            tokio::spawn(async move {
                match TcpListener::bind(&addr).await {
                    Ok(listener) => {
                        tracing::info!("Health check server listening on {}", addr);
                        serve(listener, cancel).await;
                    }
                    Err(e) => tracing::error!("Failed to bind health check server to {}: {}", addr, e),
                }
            });

            Reply::ready()
        });

        builder.before_stop(move |_| {
            cancel_for_stop.cancel();
            Reply::ready()
        });

        Ok(builder.start().await)
    }
}
