//! HTTP/WebSocket boundary
//!
//! One POST endpoint per input report accepts JSON records and appends
//! them to the input stream; one WebSocket endpoint per output report
//! forwards the report channel verbatim; `/brook-schema.json` serves the
//! configuration document frontends bootstrap from.

use brook_core::{BrookSchema, Value};
use brook_runtime::broker::Broker;
use brook_runtime::encoding::{decode_value, encode_value};
use brook_runtime::model::CompiledModel;
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket};
use warp::Filter;

pub struct ApiState {
    broker: Arc<dyn Broker>,
    schema: BrookSchema,
    inputs: HashSet<String>,
    outputs: HashSet<String>,
}

impl ApiState {
    pub fn new(model: &CompiledModel, broker: Arc<dyn Broker>) -> Arc<Self> {
        Arc::new(Self {
            broker,
            schema: model.schema.clone(),
            inputs: model
                .splitters
                .iter()
                .map(|s| s.input_stream.clone())
                .collect(),
            outputs: model
                .resolvers
                .iter()
                .map(|r| r.output_stream.clone())
                .collect(),
        })
    }
}

/// Serve the API until the process exits.
pub async fn serve(state: Arc<ApiState>, addr: SocketAddr) {
    info!("api listening on {}", addr);
    warp::serve(routes(state)).run(addr).await;
}

fn routes(
    state: Arc<ApiState>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let schema = {
        let state = state.clone();
        warp::path("brook-schema.json")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || warp::reply::json(&state.schema))
    };

    let ws = {
        let state = state.clone();
        warp::path::param::<String>()
            .and(warp::path::end())
            .and(warp::ws())
            .and_then(move |report: String, ws: warp::ws::Ws| {
                let state = state.clone();
                async move {
                    if !state.outputs.contains(&report) {
                        return Err(warp::reject::not_found());
                    }
                    Ok(ws
                        .on_upgrade(move |socket| stream_output(state, report, socket)))
                }
            })
    };

    let post_input = {
        let state = state.clone();
        warp::post()
            .and(warp::path::param::<String>())
            .and(warp::path::end())
            .and(warp::body::json())
            .and_then(move |report: String, body: serde_json::Value| {
                let state = state.clone();
                async move { add_report(state, report, body).await }
            })
    };

    let latest = {
        let state = state.clone();
        warp::get()
            .and(warp::path::param::<String>())
            .and(warp::path::end())
            .and_then(move |report: String| {
                let state = state.clone();
                async move { latest_report(state, report).await }
            })
    };

    schema.or(ws).or(post_input).or(latest)
}

/// POST /<input-report>: append one record to the input stream.
async fn add_report(
    state: Arc<ApiState>,
    report: String,
    body: serde_json::Value,
) -> Result<impl warp::Reply, warp::Rejection> {
    if !state.inputs.contains(&report) {
        return Err(warp::reject::not_found());
    }
    let serde_json::Value::Object(object) = body else {
        return Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({"detail": "body must be a JSON object"})),
            StatusCode::UNPROCESSABLE_ENTITY,
        ));
    };
    let fields: Vec<(String, String)> = object
        .into_iter()
        .map(|(key, value)| (key, encode_value(&Value::from(value))))
        .collect();
    match state.broker.append(&report, &fields).await {
        Ok(id) => {
            debug!("accepted {} record as {}", report, id);
            Ok(warp::reply::with_status(
                warp::reply::json(&serde_json::json!({"status": "accepted"})),
                StatusCode::ACCEPTED,
            ))
        }
        Err(e) => {
            warn!("append to '{}' failed: {}", report, e);
            Ok(warp::reply::with_status(
                warp::reply::json(&serde_json::json!({"detail": "broker unavailable"})),
                StatusCode::SERVICE_UNAVAILABLE,
            ))
        }
    }
}

/// GET /<output-report>: the most recent record, decoded.
async fn latest_report(
    state: Arc<ApiState>,
    report: String,
) -> Result<impl warp::Reply, warp::Rejection> {
    if !state.outputs.contains(&report) {
        return Err(warp::reject::not_found());
    }
    let record = match state.broker.last_entry(&report).await {
        Ok(record) => record,
        Err(e) => {
            warn!("reading latest '{}' failed: {}", report, e);
            return Ok(warp::reply::with_status(
                warp::reply::json(&serde_json::json!({"detail": "broker unavailable"})),
                StatusCode::SERVICE_UNAVAILABLE,
            ));
        }
    };
    let mut object = serde_json::Map::new();
    if let Some(record) = record {
        for (key, raw) in &record.fields {
            match decode_value(key, raw) {
                Ok(value) => {
                    object.insert(key.clone(), value.into());
                }
                Err(e) => debug!("skipping undecodable field '{}': {}", key, e),
            }
        }
    }
    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::Value::Object(object)),
        StatusCode::OK,
    ))
}

/// Forward the output channel to one WebSocket client, verbatim.
async fn stream_output(state: Arc<ApiState>, report: String, socket: WebSocket) {
    let mut channel = match state.broker.subscribe(&report).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!("subscribe to '{}' failed: {}", report, e);
            let _ = socket.close().await;
            return;
        }
    };
    info!("websocket client attached to '{}'", report);
    let (mut sink, mut client) = socket.split();
    loop {
        tokio::select! {
            payload = channel.recv() => {
                let Some(payload) = payload else { break };
                if sink.send(Message::text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = client.next() => {
                match incoming {
                    // Pings are answered by warp; anything else is ignored.
                    Some(Ok(message)) if !message.is_close() => continue,
                    _ => break,
                }
            }
        }
    }
    info!("websocket client detached from '{}'", report);
}
