//! An HTTP endpoint for adding and removing a pod's rules by hand.
//!
//! `POST /tproxy` takes `action` (`add` or `remove`), `pod_ip`, and `pod_name` as form fields in
//! the body or the query string. It acts on the rule store directly and bypasses the work queue.

use anyhow::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    body::{Body, Incoming},
    header,
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::net::TcpListener;
use tproxy_controller_core::{remove_positions, RuleStore, RuleTag, SyncError};
use tracing::{debug, debug_span, info, instrument, warn, Instrument};


type ResponseBody = Full<Bytes>;

#[instrument(skip_all, fields(port = %addr.port()))]
pub async fn serve<S>(
    addr: SocketAddr,
    store: Arc<S>,
    shutdown: kubert::shutdown::Watch,
) -> Result<()>
where
    S: RuleStore + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Trigger server listening");

    let signaled = shutdown.signaled();
    tokio::pin!(signaled);
    loop {
        let (stream, client_addr) = tokio::select! {
            _release = &mut signaled => {
                debug!("Shutting down");
                return Ok(());
            }
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
        };

        let store = store.clone();
        tokio::spawn(
            async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    let store = store.clone();
                    async move { Ok::<_, Infallible>(handle(store.as_ref(), req).await) }
                });
                if let Err(error) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await
                {
                    debug!(%error, "Connection failed");
                }
            }
            .instrument(debug_span!("conn", client.addr = %client_addr)),
        );
    }
}

/// Serves a single trigger request.
pub async fn handle<S, B>(store: &S, req: Request<B>) -> Response<ResponseBody>
where
    S: RuleStore + ?Sized,
    B: Body,
    B::Error: std::fmt::Display,
{
    match req.uri().path() {
        "/healthz" => return text(StatusCode::OK, "OK\n"),
        "/tproxy" => {}
        _ => return text(StatusCode::NOT_FOUND, "Not found\n"),
    }

    if req.method() != Method::POST {
        return text(StatusCode::BAD_REQUEST, "Only POST requests accepted.\n");
    }

    let query = req.uri().query().map(str::to_string);
    let body = match req.into_body().collect().await {
        Ok(body) => body.to_bytes(),
        Err(error) => {
            debug!(%error, "Failed to read request body");
            return text(StatusCode::BAD_REQUEST, "Could not read form data\n");
        }
    };
    let form = Form::parse(&body, query.as_deref());

    let Some(action) = form.value("action") else {
        return text(
            StatusCode::BAD_REQUEST,
            "Missing form data: action (add/remove)\n",
        );
    };
    let Some(pod_ip) = form.value("pod_ip") else {
        return text(StatusCode::BAD_REQUEST, "Missing form data: pod_ip\n");
    };
    let Some(pod_name) = form.value("pod_name") else {
        return text(StatusCode::BAD_REQUEST, "Missing form data: pod_name\n");
    };
    let Ok(ip) = pod_ip.parse::<IpAddr>() else {
        return text(StatusCode::BAD_REQUEST, "Invalid form data: pod_ip\n");
    };

    let tag = RuleTag::for_workload(pod_name);
    if !tag.fits_comment() {
        return text(StatusCode::BAD_REQUEST, "Invalid form data: pod_name\n");
    }

    match action {
        "add" => {
            info!(%tag, %ip, "Adding rules on request");
            if let Err(error) = store.add(ip, &tag).await {
                warn!(%tag, %ip, %error, "Failed to add rules");
                return text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Error adding tproxy rule for pod ip {ip}, {pod_name}\n"),
                );
            }
        }
        "remove" => {
            info!(%tag, %ip, "Removing rules on request");
            if let Err(error) = remove(store, ip, &tag).await {
                warn!(%tag, %ip, %error, "Failed to remove rules");
                return text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Error removing tproxy rule for pod ip {ip}, {pod_name}\n"),
                );
            }
        }
        action => {
            return text(
                StatusCode::BAD_REQUEST,
                format!("Unsupported action: {action}\n"),
            )
        }
    }

    text(StatusCode::OK, "OK\n")
}

/// Removes the rules tagged for the pod whose source is `ip`.
async fn remove<S>(store: &S, ip: IpAddr, tag: &RuleTag) -> Result<usize, SyncError>
where
    S: RuleStore + ?Sized,
{
    let rules = store
        .inspect(tag)
        .await
        .map_err(|source| SyncError::Inspect {
            tag: tag.clone(),
            source,
        })?;
    let positions = rules
        .iter()
        .filter(|r| r.source.map_or(true, |s| s == ip))
        .map(|r| r.position)
        .collect::<Vec<_>>();
    remove_positions(store, tag, &positions).await
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(body.into()))
        .expect("response must be valid")
}

/// Form fields from the request body, falling back to the query string.
struct Form {
    body: Vec<(String, String)>,
    query: Vec<(String, String)>,
}

impl Form {
    fn parse(body: &[u8], query: Option<&str>) -> Self {
        let pairs = |input: &[u8]| {
            form_urlencoded::parse(input)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect::<Vec<_>>()
        };
        Self {
            body: pairs(body),
            query: query.map(|q| pairs(q.as_bytes())).unwrap_or_default(),
        }
    }

    /// Returns the first value for `name`. Empty values count as missing.
    fn value(&self, name: &str) -> Option<&str> {
        first(&self.body, name)
            .or_else(|| first(&self.query, name))
            .filter(|v| !v.is_empty())
    }
}

fn first<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}
