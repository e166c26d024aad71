//! Admin and discovery endpoints of the lookup daemon

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use serde::Serialize;
use serde_json::json;

use super::{error, ok};
use crate::lookup::protocol::LookupContext;
use crate::lookup::registry::ProducerInfo;

type Params = Query<HashMap<String, String>>;

pub fn routes(ctx: Arc<LookupContext>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/lookup", get(lookup))
        .route("/topics", get(topics))
        .route("/nodes", get(nodes))
        .route("/delete_topic", get(delete_topic))
        .route("/delete_channel", get(delete_channel))
        .route("/info", get(info))
        .with_state(ctx)
}

async fn ping() -> &'static str {
    "OK"
}

/// Channels and active producers of one topic.
async fn lookup(State(ctx): State<Arc<LookupContext>>, Query(params): Params) -> Response {
    let Some(topic) = params.get("topic") else {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "MISSING_ARG_TOPIC");
    };
    if ctx.db.find_registrations("topic", topic, "").is_empty() {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "INVALID_ARG_TOPIC");
    }

    let channels: Vec<String> = ctx
        .db
        .find_registrations("channel", topic, "*")
        .into_iter()
        .map(|r| r.subkey)
        .collect();
    let producers: Vec<ProducerInfo> = ctx
        .db
        .find_producers("topic", topic, "")
        .iter()
        .map(|p| p.info.clone())
        .collect();
    ok(json!({
        "channels": channels,
        "producers": producers,
    }))
}

async fn topics(State(ctx): State<Arc<LookupContext>>) -> Response {
    let topics: Vec<String> = ctx
        .db
        .find_registrations("topic", "*", "")
        .into_iter()
        .map(|r| r.key)
        .collect();
    ok(json!({ "topics": topics }))
}

/// A producer and the topics it hosts.
#[derive(Serialize)]
struct ProducerTopics {
    address: String,
    tcp_port: u16,
    http_port: u16,
    version: String,
    topics: Vec<String>,
}

async fn nodes(State(ctx): State<Arc<LookupContext>>) -> Response {
    let producers: Vec<ProducerTopics> = ctx
        .db
        .find_producers("client", "", "")
        .iter()
        .map(|p| ProducerTopics {
            address: p.info.address.clone(),
            tcp_port: p.info.tcp_port,
            http_port: p.info.http_port,
            version: p.info.version.clone(),
            topics: ctx
                .db
                .lookup_registrations(&p.info.id)
                .into_iter()
                .filter(|r| r.category == "topic")
                .map(|r| r.key)
                .collect(),
        })
        .collect();
    ok(json!({ "producers": producers }))
}

async fn delete_topic(State(ctx): State<Arc<LookupContext>>, Query(params): Params) -> Response {
    let Some(topic) = params.get("topic") else {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "MISSING_ARG_TOPIC");
    };

    for registration in ctx.db.find_registrations("channel", topic, "*") {
        tracing::debug!(topic, channel = %registration.subkey, "Removing channel registration");
        ctx.db.remove_registration(&registration);
    }
    for registration in ctx.db.find_registrations("topic", topic, "") {
        tracing::debug!(topic, "Removing topic registration");
        ctx.db.remove_registration(&registration);
    }
    ok(serde_json::Value::Null)
}

async fn delete_channel(State(ctx): State<Arc<LookupContext>>, Query(params): Params) -> Response {
    let (Some(topic), Some(channel)) = (params.get("topic"), params.get("channel")) else {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "MISSING_ARG");
    };
    let registrations = ctx.db.find_registrations("channel", topic, channel);
    if registrations.is_empty() {
        return error(StatusCode::NOT_FOUND, "CHANNEL_NOT_FOUND");
    }
    for registration in registrations {
        tracing::debug!(topic, channel, "Removing channel registration");
        ctx.db.remove_registration(&registration);
    }
    ok(serde_json::Value::Null)
}

async fn info(State(ctx): State<Arc<LookupContext>>) -> Response {
    ok(json!({ "version": ctx.version }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::registry::{Producer, Registration, RegistrationDb};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn make_ctx() -> Arc<LookupContext> {
        Arc::new(LookupContext {
            db: RegistrationDb::new(Duration::from_secs(300)),
            address: "lookup.local".to_string(),
            tcp_port: 4160,
            http_port: 4161,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    fn seed_producer(ctx: &LookupContext) {
        let producer = Producer::new(ProducerInfo {
            id: "127.0.0.1:55555".to_string(),
            address: "broker1.local".to_string(),
            tcp_port: 4150,
            http_port: 4151,
            version: "0.1.0".to_string(),
        });
        ctx.db
            .add(Registration::new("client", "", ""), Arc::clone(&producer));
        ctx.db
            .add(Registration::new("topic", "events", ""), Arc::clone(&producer));
        ctx.db.add(
            Registration::new("channel", "events", "archive"),
            producer,
        );
    }

    async fn request(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_lookup_returns_channels_and_producers() {
        let ctx = make_ctx();
        seed_producer(&ctx);
        let router = routes(Arc::clone(&ctx));

        let (status, body) = request(router, "/lookup?topic=events").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["channels"][0], "archive");
        assert_eq!(body["data"]["producers"][0]["address"], "broker1.local");
    }

    #[tokio::test]
    async fn test_lookup_unknown_topic() {
        let ctx = make_ctx();
        let router = routes(ctx);
        let (status, body) = request(router, "/lookup?topic=missing").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status_txt"], "INVALID_ARG_TOPIC");
    }

    #[tokio::test]
    async fn test_topics_and_nodes() {
        let ctx = make_ctx();
        seed_producer(&ctx);
        let router = routes(Arc::clone(&ctx));

        let (_, body) = request(router.clone(), "/topics").await;
        assert_eq!(body["data"]["topics"][0], "events");

        let (_, body) = request(router, "/nodes").await;
        assert_eq!(body["data"]["producers"][0]["topics"][0], "events");
    }

    #[tokio::test]
    async fn test_delete_channel_and_topic() {
        let ctx = make_ctx();
        seed_producer(&ctx);
        let router = routes(Arc::clone(&ctx));

        let (status, _) =
            request(router.clone(), "/delete_channel?topic=events&channel=archive").await;
        assert_eq!(status, StatusCode::OK);
        assert!(ctx
            .db
            .find_registrations("channel", "events", "archive")
            .is_empty());

        let (status, _) = request(router.clone(), "/delete_topic?topic=events").await;
        assert_eq!(status, StatusCode::OK);
        assert!(ctx.db.find_registrations("topic", "events", "").is_empty());

        let (status, _) =
            request(router, "/delete_channel?topic=events&channel=archive").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_info_reports_version() {
        let ctx = make_ctx();
        let router = routes(ctx);
        let (_, body) = request(router, "/info").await;
        assert_eq!(body["data"]["version"], env!("CARGO_PKG_VERSION"));
    }
}
