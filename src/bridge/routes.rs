//! HTTP surface of the bridge:
//!
//! ```text
//! POST /api/:platform/live/start              { title?, description?, privacy? }
//! POST /api/:platform/live/chunk/:streamId    raw container bytes
//! POST /api/:platform/live/stop               { streamId }
//! GET  /api/:platform/live/streams
//! GET  /health
//! ```

use std::convert::Infallible;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::{Filter, Rejection, Reply};

use super::{Bridges, StartRequest};
use crate::error::BridgeError;

type JsonReply = WithStatus<Json>;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StopRequest {
    stream_id: Option<String>,
}

fn reply(status: StatusCode, body: Value) -> JsonReply {
    warp::reply::with_status(warp::reply::json(&body), status)
}

fn failure(status: StatusCode, message: impl Into<String>) -> JsonReply {
    reply(status, json!({ "success": false, "error": message.into() }))
}

fn bridge_failure(err: &BridgeError) -> JsonReply {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    failure(status, err.to_string())
}

fn unknown_platform(platform: &str) -> JsonReply {
    failure(StatusCode::NOT_FOUND, format!("unknown platform `{}`", platform))
}

fn parse_body<T: Default + for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        Ok(T::default())
    } else {
        serde_json::from_slice(body)
    }
}

fn start_stream(platform: String, body: Bytes, bridges: Bridges) -> JsonReply {
    let Some(manager) = bridges.get(&platform) else {
        return unknown_platform(&platform);
    };
    let request: StartRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(err) => return failure(StatusCode::BAD_REQUEST, format!("invalid start request: {}", err)),
    };

    match manager.start(&request) {
        Ok(started) => reply(
            StatusCode::OK,
            json!({
                "success": true,
                "streamId": started.stream_id,
                "destinationUrl": started.destination_url,
                "platform": started.platform,
                "createdAt": started.created_at.to_rfc3339(),
            }),
        ),
        Err(err) => {
            error!(%platform, "could not start stream: {}", err);
            bridge_failure(&err)
        }
    }
}

fn feed_chunk(platform: String, stream_id: String, body: Bytes, bridges: Bridges) -> JsonReply {
    let Some(manager) = bridges.get(&platform) else {
        return unknown_platform(&platform);
    };
    match manager.feed_chunk(&stream_id, body) {
        Ok(bytes) => reply(
            StatusCode::OK,
            json!({ "success": true, "received": true, "bytes": bytes }),
        ),
        Err(err) => bridge_failure(&err),
    }
}

async fn stop_stream(platform: String, body: Bytes, bridges: Bridges) -> JsonReply {
    let Some(manager) = bridges.get(&platform) else {
        return unknown_platform(&platform);
    };
    let request: StopRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(err) => return failure(StatusCode::BAD_REQUEST, format!("invalid stop request: {}", err)),
    };
    let Some(stream_id) = request.stream_id.filter(|id| !id.trim().is_empty()) else {
        return failure(StatusCode::BAD_REQUEST, "streamId is required");
    };

    match manager.stop(&stream_id).await {
        Ok(()) => {
            info!(%platform, stream = %stream_id, "stream stopped");
            reply(StatusCode::OK, json!({ "success": true, "streamId": stream_id }))
        }
        Err(err) => bridge_failure(&err),
    }
}

fn list_streams(platform: String, bridges: Bridges) -> JsonReply {
    match bridges.get(&platform) {
        Some(manager) => reply(
            StatusCode::OK,
            json!({ "success": true, "streams": manager.list() }),
        ),
        None => unknown_platform(&platform),
    }
}

/// Turn warp's own rejections into the JSON error body the routes use.
async fn handle_rejection(rejection: Rejection) -> Result<JsonReply, Infallible> {
    let (status, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "chunk too large".to_string())
    } else if rejection.find::<warp::reject::LengthRequired>().is_some() {
        (StatusCode::LENGTH_REQUIRED, "content-length is required".to_string())
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else {
        warn!("unhandled rejection: {:?}", rejection);
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    };
    Ok(failure(status, message))
}

pub fn routes(bridges: Bridges) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let max_chunk = bridges.max_chunk_bytes() as u64;
    let with_bridges = warp::any().map(move || bridges.clone());
    let live = warp::path("api")
        .and(warp::path::param::<String>())
        .and(warp::path("live"));

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| reply(StatusCode::OK, json!({ "status": "ok" })));

    let start = live
        .clone()
        .and(warp::path("start"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(64 * 1024))
        .and(warp::body::bytes())
        .and(with_bridges.clone())
        .map(start_stream);

    let chunk = live
        .clone()
        .and(warp::path("chunk"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(max_chunk))
        .and(warp::body::bytes())
        .and(with_bridges.clone())
        .map(feed_chunk);

    let chunk_without_id = live
        .clone()
        .and(warp::path("chunk"))
        .and(warp::path::end())
        .and(warp::post())
        .map(|_platform: String| failure(StatusCode::BAD_REQUEST, "streamId is required"));

    let stop = live
        .clone()
        .and(warp::path("stop"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(64 * 1024))
        .and(warp::body::bytes())
        .and(with_bridges.clone())
        .then(stop_stream);

    let streams = live
        .and(warp::path("streams"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_bridges)
        .map(list_streams);

    health
        .or(start)
        .unify()
        .or(chunk)
        .unify()
        .or(chunk_without_id)
        .unify()
        .or(stop)
        .unify()
        .or(streams)
        .unify()
        .recover(handle_rejection)
        .unify()
        .with(warp::trace::request())
}
