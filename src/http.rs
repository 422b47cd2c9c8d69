//! Thin HTTP control-plane surface.
//!
//! Exposes the coordinator's request kinds as small JSON `POST` endpoints,
//! each translating directly into one [`Msg`] and its `oneshot` reply.
//! This is intentionally a thin `hyper::Server`, not a full
//! router/permission/worker-task dispatch stack — see DESIGN.md for why
//! that heavier stack was not carried over. It exists to exercise the
//! admission/tag-commit handoff contract end to end.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{error, info};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::coordinator::{self, CoordinatorHandle, Msg};
use crate::layout;

/// A guard standing in for process-level client monitoring: its `Drop`
/// notifies the coordinator of handle death, firing whenever the future
/// holding it is dropped — whether because the request completed or
/// because the connection was cancelled.
struct ClientGuard {
    handle: coordinator::ClientHandle,
    coordinator: CoordinatorHandle,
}

impl ClientGuard {
    fn new(coordinator: CoordinatorHandle) -> Self {
        ClientGuard {
            handle: coordinator::next_handle(),
            coordinator,
        }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.coordinator.send(Msg::HandleDied(self.handle));
    }
}

fn json_response(status: StatusCode, body: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("building a response from a fixed status/body cannot fail")
}

fn ok_json(body: Value) -> Response<Body> {
    json_response(StatusCode::OK, body)
}

async fn read_json_body(req: Request<Body>) -> Result<Value, Response<Body>> {
    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return Err(json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": format!("failed to read body: {}", err)}),
            ))
        }
    };
    if bytes.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_slice(&bytes).map_err(|err| {
        json_response(
            StatusCode::BAD_REQUEST,
            json!({"error": format!("invalid json: {}", err)}),
        )
    })
}

async fn handle_get_tags(coordinator: CoordinatorHandle) -> Response<Body> {
    let (tx, rx) = oneshot::channel();
    coordinator.send(Msg::GetTags { reply: tx });
    match rx.await {
        Ok(tags) => ok_json(json!({"tags": tags})),
        Err(_) => internal_error(),
    }
}

async fn handle_get_vols(coordinator: CoordinatorHandle) -> Response<Body> {
    let (tx, rx) = oneshot::channel();
    coordinator.send(Msg::GetVols { reply: tx });
    match rx.await {
        Ok((volumes, root)) => {
            let volumes: Vec<Value> = volumes
                .into_iter()
                .map(|v| json!({"name": v.name, "free_bytes": v.free_bytes, "used_bytes": v.used_bytes}))
                .collect();
            ok_json(json!({"root": root.to_string_lossy(), "volumes": volumes}))
        }
        Err(_) => internal_error(),
    }
}

async fn handle_get_diskspace(coordinator: CoordinatorHandle) -> Response<Body> {
    let (tx, rx) = oneshot::channel();
    coordinator.send(Msg::GetDiskspace { reply: tx });
    match rx.await {
        Ok((free, used)) => ok_json(json!({"free": free, "used": used})),
        Err(_) => internal_error(),
    }
}

async fn handle_put_blob(coordinator: CoordinatorHandle, req: Request<Body>) -> Response<Body> {
    let body = match read_json_body(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let blob_name = match body.get("name").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            return json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": "missing or empty 'name'"}),
            )
        }
    };

    let guard = ClientGuard::new(coordinator.clone());
    let (tx, rx) = oneshot::channel();
    coordinator.send(Msg::PutBlob {
        handle: guard.handle,
        blob_name,
        reply: tx,
    });

    let response = match rx.await {
        Ok(Ok((local, url))) => ok_json(json!({
            "status": "ok",
            "local": local.to_string_lossy(),
            "url": url,
        })),
        Ok(Err(err)) => error_response(&err),
        Err(_) => internal_error(),
    };
    // Dropping here releases the admission slot as soon as the coordinator
    // hands back a path, not after the actual blob transfer. The put
    // listener the caller is handed off to is what would need to hold a
    // handle open for the slot to track the transfer itself; this control
    // plane only hands off the admission decision.
    drop(guard);
    response
}

async fn handle_get_blob(coordinator: CoordinatorHandle) -> Response<Body> {
    let guard = ClientGuard::new(coordinator.clone());
    let (tx, rx) = oneshot::channel();
    coordinator.send(Msg::GetBlob {
        handle: guard.handle,
        reply: tx,
    });

    let response = match rx.await {
        Ok(Ok(())) => ok_json(json!({"status": "ok"})),
        Ok(Err(err)) => error_response(&err),
        Err(_) => internal_error(),
    };
    // Same caveat as handle_put_blob: the slot is released on reply, not
    // on transfer completion, since the transfer happens on the separate
    // get listener this crate only hands the client off to.
    drop(guard);
    response
}

async fn handle_get_tag_timestamp(coordinator: CoordinatorHandle, req: Request<Body>) -> Response<Body> {
    let body = match read_json_body(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let tag_name = match body.get("tag_name").and_then(Value::as_str) {
        Some(name) => name.to_string(),
        None => {
            return json_response(StatusCode::BAD_REQUEST, json!({"error": "missing 'tag_name'"}))
        }
    };

    let (tx, rx) = oneshot::channel();
    coordinator.send(Msg::GetTagTimestamp { tag_name, reply: tx });
    match rx.await {
        Ok(Some((timestamp, volume))) => {
            ok_json(json!({"status": "ok", "timestamp": timestamp, "volume": volume}))
        }
        Ok(None) => json_response(StatusCode::NOT_FOUND, json!({"status": "notfound"})),
        Err(_) => internal_error(),
    }
}

async fn handle_get_tag_data(coordinator: CoordinatorHandle, req: Request<Body>) -> Response<Body> {
    let body = match read_json_body(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let (tag, timestamp, volume) = match extract_tag_timestamp_volume(&body) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    let objname = layout::pack_objname(&tag, timestamp);

    let (tx, rx) = oneshot::channel();
    coordinator.send(Msg::GetTagData {
        objname,
        volume,
        reply: tx,
    });
    match rx.await {
        Ok(Ok(data)) => ok_json(json!({
            "status": "ok",
            "data": String::from_utf8_lossy(&data),
        })),
        Ok(Err(_)) => json_response(StatusCode::NOT_FOUND, json!({"status": "error", "reason": "read_failed"})),
        Err(_) => internal_error(),
    }
}

async fn handle_put_tag_data(coordinator: CoordinatorHandle, req: Request<Body>) -> Response<Body> {
    let body = match read_json_body(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let tag = match body.get("tag").and_then(Value::as_str) {
        Some(tag) => tag.to_string(),
        None => return json_response(StatusCode::BAD_REQUEST, json!({"error": "missing 'tag'"})),
    };
    let timestamp = match body.get("timestamp").and_then(Value::as_u64) {
        Some(ts) => ts,
        None => return json_response(StatusCode::BAD_REQUEST, json!({"error": "missing 'timestamp'"})),
    };
    let data = match body.get("data").and_then(Value::as_str) {
        Some(data) => data.as_bytes().to_vec(),
        None => return json_response(StatusCode::BAD_REQUEST, json!({"error": "missing 'data'"})),
    };

    let objname = layout::pack_objname(&tag, timestamp);
    let (tx, rx) = oneshot::channel();
    coordinator.send(Msg::PutTagData {
        objname,
        data,
        reply: tx,
    });
    match rx.await {
        Ok(Ok(volume)) => ok_json(json!({"status": "ok", "volume": volume})),
        Ok(Err(err)) => error_response(&err),
        Err(_) => internal_error(),
    }
}

async fn handle_put_tag_commit(coordinator: CoordinatorHandle, req: Request<Body>) -> Response<Body> {
    let body = match read_json_body(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let tag = match body.get("tag").and_then(Value::as_str) {
        Some(tag) => tag.to_string(),
        None => return json_response(StatusCode::BAD_REQUEST, json!({"error": "missing 'tag'"})),
    };
    let timestamp = match body.get("timestamp").and_then(Value::as_u64) {
        Some(ts) => ts,
        None => return json_response(StatusCode::BAD_REQUEST, json!({"error": "missing 'timestamp'"})),
    };
    let commit_map: std::collections::HashMap<String, String> = match body.get("commit_map") {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect(),
        _ => {
            return json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": "missing 'commit_map'"}),
            )
        }
    };

    let objname = layout::pack_objname(&tag, timestamp);
    let (tx, rx) = oneshot::channel();
    coordinator.send(Msg::PutTagCommit {
        objname,
        commit_map,
        reply: tx,
    });
    match rx.await {
        Ok(Ok(url)) => ok_json(json!({"status": "ok", "url": url})),
        Ok(Err(err)) => error_response(&err),
        Err(_) => internal_error(),
    }
}

fn extract_tag_timestamp_volume(body: &Value) -> Result<(String, u64, String), Response<Body>> {
    let tag = body
        .get("tag")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| json_response(StatusCode::BAD_REQUEST, json!({"error": "missing 'tag'"})))?;
    let timestamp = body
        .get("timestamp")
        .and_then(Value::as_u64)
        .ok_or_else(|| json_response(StatusCode::BAD_REQUEST, json!({"error": "missing 'timestamp'"})))?;
    let volume = body
        .get("volume")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| json_response(StatusCode::BAD_REQUEST, json!({"error": "missing 'volume'"})))?;
    Ok((tag, timestamp, volume))
}

fn internal_error() -> Response<Body> {
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error": "coordinator did not reply"}),
    )
}

fn error_response(err: &crate::errors::NodeError) -> Response<Body> {
    use crate::errors::NodeError;
    let status = match err {
        NodeError::Full => StatusCode::SERVICE_UNAVAILABLE,
        NodeError::NotFound => StatusCode::NOT_FOUND,
        NodeError::Io { .. } | NodeError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        NodeError::ConfigMissing { .. } | NodeError::RootUnreadable(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = if status == StatusCode::SERVICE_UNAVAILABLE {
        json!({"status": "full"})
    } else {
        json!({"status": "error", "reason": err.to_string()})
    };
    json_response(status, body)
}

async fn route(coordinator: CoordinatorHandle, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/tags") => handle_get_tags(coordinator).await,
        (&Method::POST, "/vols") => handle_get_vols(coordinator).await,
        (&Method::POST, "/diskspace") => handle_get_diskspace(coordinator).await,
        (&Method::POST, "/blob/put") => handle_put_blob(coordinator, req).await,
        (&Method::POST, "/blob/get") => handle_get_blob(coordinator).await,
        (&Method::POST, "/tag/timestamp") => handle_get_tag_timestamp(coordinator, req).await,
        (&Method::POST, "/tag/data") => handle_get_tag_data(coordinator, req).await,
        (&Method::POST, "/tag/put") => handle_put_tag_data(coordinator, req).await,
        (&Method::POST, "/tag/commit") => handle_put_tag_commit(coordinator, req).await,
        _ => json_response(StatusCode::NOT_FOUND, json!({"error": "no such endpoint"})),
    };
    Ok(response)
}

/// Run an HTTP server binding `addr` that exposes the coordinator's
/// request surface. Runs until the process is terminated; bind failures
/// are fatal since a listener that never starts is equivalent to the
/// corresponding feature being silently disabled.
pub async fn serve(addr: SocketAddr, coordinator: CoordinatorHandle) {
    let make_svc = make_service_fn(move |_conn| {
        let coordinator = coordinator.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| route(coordinator.clone(), req)))
        }
    });

    info!("control-plane listening on {}", addr);
    if let Err(err) = Server::bind(&addr).serve(make_svc).await {
        error!("control-plane server error: {}", err);
    }
}
