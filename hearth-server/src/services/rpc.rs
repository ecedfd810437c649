//! HTTP handlers for the sync endpoint, the tool catalog and entity reads.

use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::{json, Value};
use tracing::error;

use hearth_core::dto::{SyncRequest, SyncResponse, ToolResponse};
use hearth_core::models::Entity;
use hearth_core::storage::{Gateway, StorageError};
use hearth_graph::{ToolContext, ToolDispatcher};

use crate::sync::SyncEngine;

pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub gateway: Arc<dyn Gateway>,
    /// Principal attributed to tool calls that carry no `X-User-Id` header.
    /// Authentication itself is middleware's problem, not ours.
    pub default_user: String,
}

fn error_body(kind: &str, message: impl Into<String>) -> Value {
    json!({ "error": { "kind": kind, "message": message.into() } })
}

/// One Inbetweenies exchange.
#[utoipa::path(
    post,
    path = "/v1/sync",
    request_body = SyncRequest,
    responses(
        (status = 200, description = "Sync exchange result", body = SyncResponse),
        (status = 400, description = "Unsupported protocol or stale cursor"),
    )
)]
pub(super) async fn sync(
    data: web::Data<AppState>,
    body: web::Json<SyncRequest>,
) -> HttpResponse {
    match data.engine.handle_sync(body.into_inner()).await {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(err) if err.is_client_error() => {
            HttpResponse::BadRequest().json(error_body("sync_rejected", err.to_string()))
        }
        Err(err) => {
            error!(error = %err, "sync exchange failed");
            HttpResponse::InternalServerError()
                .json(error_body("internal", err.to_string()))
        }
    }
}

/// The tool catalog: names, descriptions and argument schemas.
#[utoipa::path(
    get,
    path = "/v1/tools",
    responses((status = 200, description = "Catalog listing"))
)]
pub(super) async fn list_tools() -> HttpResponse {
    HttpResponse::Ok().json(ToolDispatcher::catalog_json())
}

/// Invokes one catalog tool. Tool-level failures still answer 200 with the
/// uniform envelope; only an unknown tool name is a 404.
#[utoipa::path(
    post,
    path = "/v1/tools/{name}",
    params(("name" = String, Path, description = "Catalog tool name")),
    responses(
        (status = 200, description = "Tool envelope", body = ToolResponse),
        (status = 404, description = "No such tool"),
    )
)]
pub(super) async fn call_tool(
    data: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<Value>,
    req: HttpRequest,
) -> HttpResponse {
    let name = path.into_inner();
    if !ToolDispatcher::is_known_tool(&name) {
        return HttpResponse::NotFound().json(error_body("unknown_tool", format!("`{name}`")));
    }
    let user_id = req
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(&data.default_user)
        .to_owned();
    let ctx = ToolContext { user_id, node_id: data.engine.node_id().to_owned() };
    let response = data
        .dispatcher
        .dispatch(&name, body.into_inner(), &ctx)
        .await;
    HttpResponse::Ok().json(response)
}

/// Current version of an entity.
#[utoipa::path(
    get,
    path = "/v1/entities/{id}",
    params(("id" = String, Path, description = "Entity id")),
    responses(
        (status = 200, description = "Current version", body = Entity),
        (status = 404, description = "Unknown entity"),
    )
)]
pub(super) async fn get_entity(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let id = path.into_inner();
    match data.gateway.get_current(&id).await {
        Ok(Some(entity)) => HttpResponse::Ok().json(entity),
        Ok(None) => HttpResponse::NotFound().json(error_body("not_found", id)),
        Err(err) => {
            error!(error = %err, "entity read failed");
            HttpResponse::InternalServerError().json(error_body("internal", err.to_string()))
        }
    }
}

/// One specific immutable version of an entity.
#[utoipa::path(
    get,
    path = "/v1/entities/{id}/versions/{version}",
    params(
        ("id" = String, Path, description = "Entity id"),
        ("version" = String, Path, description = "Version string"),
    ),
    responses(
        (status = 200, description = "The requested version", body = Entity),
        (status = 404, description = "Unknown entity or version"),
    )
)]
pub(super) async fn get_entity_version(
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (id, version) = path.into_inner();
    match data.gateway.get_version(&id, &version).await {
        Ok(entity) => HttpResponse::Ok().json(entity),
        Err(StorageError::NotFound(what, key)) => {
            HttpResponse::NotFound().json(error_body("not_found", format!("{what} {key}")))
        }
        Err(err) => {
            error!(error = %err, "entity version read failed");
            HttpResponse::InternalServerError().json(error_body("internal", err.to_string()))
        }
    }
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, description = "Node is serving"))
)]
pub(super) async fn health(data: web::Data<AppState>) -> HttpResponse {
    let head = data
        .gateway
        .head_sequence()
        .await
        .unwrap_or_default();
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "node_id": data.engine.node_id(),
        "head_sequence": head,
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use actix_web::{test, App};
    use hearth_core::dto::PROTOCOL_VERSION;
    use hearth_core::resolver::Resolver;
    use hearth_graph::{GraphIndex, NullSink};
    use hearth_storage::{InMemoryGateway, WriteGate};
    use pretty_assertions::assert_eq;

    fn state() -> web::Data<AppState> {
        let gateway = Arc::new(InMemoryGateway::new());
        let index = GraphIndex::new();
        let gate = Arc::new(WriteGate::new());
        let engine = Arc::new(SyncEngine::new(
            gateway.clone(),
            index.clone(),
            Resolver::default(),
            gate.clone(),
            "server",
        ));
        let dispatcher = Arc::new(ToolDispatcher::new(
            gateway.clone(),
            index,
            gate,
            Arc::new(NullSink),
        ));
        web::Data::new(AppState {
            engine,
            dispatcher,
            gateway,
            default_user: "server".into(),
        })
    }

    macro_rules! test_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state.clone())
                    .service(web::resource("/v1/sync").route(web::post().to(sync)))
                    .service(web::resource("/v1/tools").route(web::get().to(list_tools)))
                    .service(
                        web::resource("/v1/tools/{name}").route(web::post().to(call_tool)),
                    )
                    .service(
                        web::resource("/v1/entities/{id}").route(web::get().to(get_entity)),
                    )
                    .service(web::resource("/v1/health").route(web::get().to(health))),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn health_reports_head_sequence() {
        let app = test_app!(state());
        let resp = test::call_service(&app, test::TestRequest::get().uri("/v1/health").to_request())
            .await;
        assert!(resp.status().is_success());
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["head_sequence"], 0);
    }

    #[actix_web::test]
    async fn tool_calls_round_trip_through_http() {
        let state = state();
        let app = test_app!(state);

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/v1/tools/create_entity")
                .insert_header(("x-user-id", "alice"))
                .set_json(json!({ "type": "room", "name": "Kitchen", "content": {"floor": 1} }))
                .to_request(),
        )
        .await;
        assert!(resp.status().is_success());
        let body: ToolResponse = test::read_body_json(resp).await;
        assert!(body.success);
        let entity = &body.result.unwrap()["entity"];
        assert_eq!(entity["user_id"], "alice");

        // The created entity is readable through the convenience endpoint.
        let id = entity["id"].as_str().unwrap();
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri(&format!("/v1/entities/{id}"))
                .to_request(),
        )
        .await;
        assert!(resp.status().is_success());

        // Unknown tools are a routing-level 404, not an envelope error.
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/v1/tools/definitely_not_a_tool")
                .set_json(json!({}))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn sync_rejects_bad_protocol_with_400() {
        let app = test_app!(state());
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/v1/sync")
                .set_json(json!({
                    "protocol_version": "inbetweenies-v0",
                    "node_id": "node-a",
                    "user_id": "alice",
                    "since_sequence": 0,
                    "changes": [],
                }))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/v1/sync")
                .set_json(json!({
                    "protocol_version": PROTOCOL_VERSION,
                    "node_id": "node-a",
                    "user_id": "alice",
                    "since_sequence": 0,
                    "changes": [],
                }))
                .to_request(),
        )
        .await;
        assert!(resp.status().is_success());
    }
}
