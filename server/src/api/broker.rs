//! Admin endpoints of the message daemon

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;

use super::{error, ok};
use crate::broker::{Broker, Channel, Topic};
use crate::utils::names::{is_valid_channel_name, is_valid_topic_name};

type Params = Query<HashMap<String, String>>;

pub fn routes(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/stats", get(stats))
        .route("/create_topic", get(create_topic))
        .route("/delete_topic", get(delete_topic))
        .route("/create_channel", get(create_channel))
        .route("/delete_channel", get(delete_channel))
        .route("/pause_channel", get(pause_channel))
        .route("/unpause_channel", get(unpause_channel))
        .with_state(broker)
}

async fn ping() -> &'static str {
    "OK"
}

async fn stats(State(broker): State<Arc<Broker>>) -> Response {
    ok(broker.stats())
}

async fn create_topic(State(broker): State<Arc<Broker>>, Query(params): Params) -> Response {
    match topic_arg(&params) {
        Ok(topic) => {
            broker.get_or_create_topic(topic);
            ok(serde_json::Value::Null)
        }
        Err(response) => response,
    }
}

async fn delete_topic(State(broker): State<Arc<Broker>>, Query(params): Params) -> Response {
    match topic_arg(&params) {
        Ok(topic) => {
            if broker.delete_topic(topic) {
                ok(serde_json::Value::Null)
            } else {
                error(StatusCode::NOT_FOUND, "TOPIC_NOT_FOUND")
            }
        }
        Err(response) => response,
    }
}

async fn create_channel(State(broker): State<Arc<Broker>>, Query(params): Params) -> Response {
    match topic_channel_args(&params) {
        Ok((topic, channel)) => {
            broker.get_or_create_topic(topic).get_or_create_channel(channel);
            ok(serde_json::Value::Null)
        }
        Err(response) => response,
    }
}

async fn delete_channel(State(broker): State<Arc<Broker>>, Query(params): Params) -> Response {
    match existing_topic(&broker, &params) {
        Ok((topic, channel)) => {
            if topic.delete_channel(channel) {
                ok(serde_json::Value::Null)
            } else {
                error(StatusCode::NOT_FOUND, "CHANNEL_NOT_FOUND")
            }
        }
        Err(response) => response,
    }
}

async fn pause_channel(State(broker): State<Arc<Broker>>, Query(params): Params) -> Response {
    match existing_channel(&broker, &params) {
        Ok(channel) => {
            channel.pause();
            ok(serde_json::Value::Null)
        }
        Err(response) => response,
    }
}

async fn unpause_channel(State(broker): State<Arc<Broker>>, Query(params): Params) -> Response {
    match existing_channel(&broker, &params) {
        Ok(channel) => {
            channel.unpause();
            ok(serde_json::Value::Null)
        }
        Err(response) => response,
    }
}

// =============================================================================
// Argument helpers
// =============================================================================

fn topic_arg(params: &HashMap<String, String>) -> Result<&str, Response> {
    let Some(topic) = params.get("topic") else {
        return Err(error(StatusCode::INTERNAL_SERVER_ERROR, "MISSING_ARG_TOPIC"));
    };
    if !is_valid_topic_name(topic) {
        return Err(error(StatusCode::INTERNAL_SERVER_ERROR, "INVALID_ARG_TOPIC"));
    }
    Ok(topic)
}

fn topic_channel_args(params: &HashMap<String, String>) -> Result<(&str, &str), Response> {
    let topic = topic_arg(params)?;
    let Some(channel) = params.get("channel") else {
        return Err(error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "MISSING_ARG_CHANNEL",
        ));
    };
    if !is_valid_channel_name(channel) {
        return Err(error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INVALID_ARG_CHANNEL",
        ));
    }
    Ok((topic, channel))
}

fn existing_topic<'a>(
    broker: &Arc<Broker>,
    params: &'a HashMap<String, String>,
) -> Result<(Arc<Topic>, &'a str), Response> {
    let (topic_name, channel_name) = topic_channel_args(params)?;
    match broker.get_topic(topic_name) {
        Some(topic) => Ok((topic, channel_name)),
        None => Err(error(StatusCode::NOT_FOUND, "TOPIC_NOT_FOUND")),
    }
}

fn existing_channel(
    broker: &Arc<Broker>,
    params: &HashMap<String, String>,
) -> Result<Arc<Channel>, Response> {
    let (topic, channel_name) = existing_topic(broker, params)?;
    topic
        .get_channel(channel_name)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, "CHANNEL_NOT_FOUND"))
}
