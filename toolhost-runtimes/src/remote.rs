//! Remote runtime: persistent SSE or WebSocket channel to a declared URL.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hyper::client::HttpConnector;
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::{Body, Client, Method, Request, Uri};
use hyper_rustls::HttpsConnector;
use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use toolhost_primitives::{RemoteTransportKind, ServerManifest};
use toolhost_transport::{CHANNEL_CAPACITY, ChannelTransport, HostRequestHandler};
use tracing::{debug, warn};
use url::Url;
use webpki_roots::TLS_SERVER_ROOTS;

use crate::context::RuntimeContext;
use crate::sse::SseParser;
use crate::{Launched, RuntimeError, RuntimeFlavour, RuntimeResult};

type HttpsClient = Client<HttpsConnector<HttpConnector>, Body>;

/// SSE event announcing the URL requests must be POSTed to.
const ENDPOINT_EVENT: &str = "endpoint";

fn build_https_client() -> HttpsClient {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(TLS_SERVER_ROOTS.iter().map(|anchor| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            anchor.subject,
            anchor.spki,
            anchor.name_constraints,
        )
    }));

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let mut http = HttpConnector::new();
    http.enforce_http(false);

    Client::builder().build::<_, Body>(HttpsConnector::from((http, Arc::new(config))))
}

pub(crate) async fn launch(
    manifest: &ServerManifest,
    ctx: &RuntimeContext,
) -> RuntimeResult<Launched> {
    let raw = manifest.remote_url().ok_or_else(|| RuntimeError::InvalidManifest {
        reason: "remote runtime needs remoteUrl".into(),
    })?;
    let url = Url::parse(raw).map_err(|err| RuntimeError::InvalidManifest {
        reason: format!("invalid remoteUrl `{raw}`: {err}"),
    })?;
    let label = manifest.id().to_string();

    match manifest.remote_transport() {
        RemoteTransportKind::Sse => {
            let transport = connect_sse(label, url, ctx.connect_timeout, ctx.host.clone()).await?;
            Ok(Launched::new(transport, RuntimeFlavour::Sse))
        }
        RemoteTransportKind::WebSocket => {
            let transport =
                connect_websocket(label, url, ctx.connect_timeout, ctx.host.clone()).await?;
            Ok(Launched::new(transport, RuntimeFlavour::WebSocket))
        }
    }
}

fn to_uri(url: &Url) -> RuntimeResult<Uri> {
    url.as_str()
        .parse::<Uri>()
        .map_err(|err| RuntimeError::connect(url.as_str(), err))
}

async fn connect_sse(
    label: String,
    url: Url,
    connect_timeout: Duration,
    host: Option<Arc<dyn HostRequestHandler>>,
) -> RuntimeResult<Arc<ChannelTransport>> {
    let client = build_https_client();
    let request = Request::builder()
        .method(Method::GET)
        .uri(to_uri(&url)?)
        .header(ACCEPT, "text/event-stream")
        .body(Body::empty())
        .map_err(|err| RuntimeError::connect(url.as_str(), err))?;

    let response = tokio::time::timeout(connect_timeout, client.request(request))
        .await
        .map_err(|_| RuntimeError::connect(url.as_str(), "timed out"))?
        .map_err(|err| RuntimeError::connect(url.as_str(), err))?;
    if !response.status().is_success() {
        return Err(RuntimeError::connect(
            url.as_str(),
            format!("status {}", response.status()),
        ));
    }

    let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

    let reader_label = label.clone();
    let mut body = response.into_body();
    let reader = tokio::spawn(async move {
        let mut parser = SseParser::new();
        let mut endpoint_tx = Some(endpoint_tx);
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(server_id = %reader_label, error = %err, "sse stream failed");
                    break;
                }
            };
            for event in parser.feed(&chunk) {
                if event.event == ENDPOINT_EVENT {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(event.data);
                    }
                } else if in_tx.send(event.data).await.is_err() {
                    return;
                }
            }
        }
        if let Some(event) = parser.finish() {
            if event.event != ENDPOINT_EVENT {
                let _ = in_tx.send(event.data).await;
            }
        }
        debug!(server_id = %reader_label, "sse stream ended");
    });

    let endpoint = match tokio::time::timeout(connect_timeout, endpoint_rx).await {
        Ok(Ok(endpoint)) => endpoint,
        Ok(Err(_)) => {
            reader.abort();
            return Err(RuntimeError::connect(url.as_str(), "stream ended before endpoint event"));
        }
        Err(_) => {
            reader.abort();
            return Err(RuntimeError::connect(url.as_str(), "no endpoint event"));
        }
    };
    let post_url = url
        .join(endpoint.trim())
        .map_err(|err| RuntimeError::connect(url.as_str(), err))?;
    let post_uri = to_uri(&post_url)?;
    debug!(server_id = %label, endpoint = %post_url, "sse channel established");

    let transport = ChannelTransport::spawn(label.clone(), out_tx, in_rx, host);
    transport.attach_task(reader);
    transport.attach_task(tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            let request = Request::builder()
                .method(Method::POST)
                .uri(post_uri.clone())
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(line));
            let request = match request {
                Ok(request) => request,
                Err(err) => {
                    warn!(server_id = %label, error = %err, "failed to build sse post");
                    continue;
                }
            };
            match client.request(request).await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    warn!(server_id = %label, status = %response.status(), "sse post rejected");
                }
                Err(err) => {
                    warn!(server_id = %label, error = %err, "sse post failed");
                }
            }
        }
    }));

    Ok(transport)
}

async fn connect_websocket(
    label: String,
    url: Url,
    connect_timeout: Duration,
    host: Option<Arc<dyn HostRequestHandler>>,
) -> RuntimeResult<Arc<ChannelTransport>> {
    let (stream, _) = tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
        .await
        .map_err(|_| RuntimeError::connect(url.as_str(), "timed out"))?
        .map_err(|err| RuntimeError::connect(url.as_str(), err))?;
    let (mut write, mut read) = stream.split();
    debug!(server_id = %label, url = %url, "websocket channel established");

    let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let transport = ChannelTransport::spawn(label.clone(), out_tx, in_rx, host);

    let writer_label = label.clone();
    transport.attach_task(tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if let Err(err) = write.send(Message::Text(line.into())).await {
                warn!(server_id = %writer_label, error = %err, "websocket send failed");
                break;
            }
        }
        let _ = write.close().await;
    }));

    transport.attach_task(tokio::spawn(async move {
        while let Some(message) = read.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text.to_string(),
                Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => {
                    warn!(server_id = %label, error = %err, "websocket read failed");
                    break;
                }
            };
            if in_tx.send(text).await.is_err() {
                break;
            }
        }
        debug!(server_id = %label, "websocket closed");
    }));

    Ok(transport)
}
