//! This module contains the Hearth web services implementation.

use std::sync::Arc;

use actix_web::{dev::ServerHandle, web, App, HttpServer};
use tokio::task::JoinHandle;
use utoipa::OpenApi;

use hearth_core::dto::{
    ConflictDecision, ConflictNotice, SyncRequest, SyncResponse, ToolErrorBody, ToolResponse,
};
use hearth_core::models::{
    ChangeKind, ChangeRecord, Entity, EntityType, Relationship, RelationshipType, SourceType,
};
use hearth_core::storage::Gateway;
use hearth_graph::ToolDispatcher;

use crate::sync::SyncEngine;

mod rpc;

pub use rpc::AppState;

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("failed to bind service: {0}")]
    Bind(String),
    #[error("service failed: {0}")]
    Unknown(String),
}

#[derive(OpenApi)]
#[openapi(
    paths(
        rpc::sync,
        rpc::call_tool,
        rpc::list_tools,
        rpc::get_entity,
        rpc::get_entity_version,
        rpc::health,
    ),
    components(schemas(
        SyncRequest,
        SyncResponse,
        ConflictNotice,
        ConflictDecision,
        ChangeRecord,
        ChangeKind,
        Entity,
        EntityType,
        SourceType,
        Relationship,
        RelationshipType,
        ToolResponse,
        ToolErrorBody,
    ))
)]
pub struct ApiDoc;

pub struct ServicesBuilder {
    prefix: String,
    port: u16,
    bind: String,
    state: AppState,
}

impl ServicesBuilder {
    pub fn new(
        engine: Arc<SyncEngine>,
        dispatcher: Arc<ToolDispatcher>,
        gateway: Arc<dyn Gateway>,
        default_user: impl Into<String>,
    ) -> Self {
        Self {
            prefix: "v1".to_owned(),
            port: 4300,
            bind: "0.0.0.0".to_owned(),
            state: AppState { engine, dispatcher, gateway, default_user: default_user.into() },
        }
    }

    pub fn prefix(mut self, v: &str) -> Self {
        self.prefix = v.to_owned();
        self
    }

    pub fn bind(mut self, v: &str) -> Self {
        self.bind = v.to_owned();
        self
    }

    pub fn port(mut self, v: u16) -> Self {
        self.port = v;
        self
    }

    pub fn run(self) -> Result<(ServerHandle, JoinHandle<Result<(), ServiceError>>), ServiceError> {
        let state = web::Data::new(self.state);
        let prefix = self.prefix;
        let server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .service(
                    web::resource(format!("/{prefix}/sync"))
                        .route(web::post().to(rpc::sync)),
                )
                .service(
                    web::resource(format!("/{prefix}/tools"))
                        .route(web::get().to(rpc::list_tools)),
                )
                .service(
                    web::resource(format!("/{prefix}/tools/{{name}}"))
                        .route(web::post().to(rpc::call_tool)),
                )
                .service(
                    web::resource(format!("/{prefix}/entities/{{id}}"))
                        .route(web::get().to(rpc::get_entity)),
                )
                .service(
                    web::resource(format!("/{prefix}/entities/{{id}}/versions/{{version}}"))
                        .route(web::get().to(rpc::get_entity_version)),
                )
                .service(
                    web::resource(format!("/{prefix}/health"))
                        .route(web::get().to(rpc::health)),
                )
        })
        .bind((self.bind, self.port))
        .map_err(|err| ServiceError::Bind(err.to_string()))?
        .run();
        let handle = server.handle();
        let task = tokio::spawn(async move {
            server
                .await
                .map_err(|err| ServiceError::Unknown(err.to_string()))
        });
        Ok((handle, task))
    }
}
