//! REST handlers for server administration and the health probe.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{error::ApiResult, AppContext};
use crate::store::{ServerDraft, ServerFilter, ServerKind, ServerPatch, ServerRecord, ToolRow};

const DEFAULT_PAGE_LIMIT: u64 = 10;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub enabled: Option<bool>,
    pub server_type: Option<String>,
    pub page: Option<u64>,
    pub limit: Option<u64>,
    #[serde(default)]
    pub include_tools: bool,
}

#[derive(Debug, Deserialize)]
pub struct GetQuery {
    #[serde(default)]
    pub include_tools: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateQuery {
    /// Roll the row back if the initial connection fails.
    #[serde(default)]
    pub strict: bool,
}

#[derive(Serialize)]
pub struct Pagination {
    pub page: u64,
    pub limit: u64,
    pub total: u64,
    #[serde(rename = "totalPages")]
    pub total_pages: u64,
}

/// A persisted tool as shown in the REST surface; the `{server}__` prefix is
/// stripped from the rendered names.
#[derive(Serialize)]
pub struct ToolView {
    pub tool_name: String,
    pub display_name: String,
    pub tool_md5: String,
    pub description: String,
    pub created_at: String,
}

impl ToolView {
    fn from_row(row: ToolRow, server: &str) -> Self {
        let prefix = format!("{}__", server);
        let stripped = row
            .display_name
            .strip_prefix(&prefix)
            .unwrap_or(&row.display_name)
            .to_string();
        Self {
            tool_name: stripped.clone(),
            display_name: stripped,
            tool_md5: row.tool_md5,
            description: row.description,
            created_at: row.created_at,
        }
    }
}

#[derive(Serialize)]
pub struct ServerView {
    #[serde(flatten)]
    pub record: ServerRecord,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolView>>,
}

impl ServerView {
    fn render(ctx: &AppContext, record: ServerRecord, include_tools: bool) -> ApiResult<Self> {
        let connected = ctx.registry.is_connected(&record.name);
        let tools = if include_tools {
            let rows = ctx.store.list_tools_by_server(&record.name)?;
            Some(
                rows.into_iter()
                    .map(|row| ToolView::from_row(row, &record.name))
                    .collect(),
            )
        } else {
            None
        };
        Ok(Self {
            record,
            connected,
            connect_error: None,
            tools,
        })
    }
}

pub async fn list_servers(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let filter = ServerFilter {
        enabled: query.enabled,
        kind: query
            .server_type
            .as_deref()
            .map(ServerKind::parse)
            .transpose()?,
    };
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).max(1);

    let (records, total) = ctx.store.list_servers(&filter, page, limit)?;
    let views = records
        .into_iter()
        .map(|record| ServerView::render(&ctx, record, query.include_tools))
        .collect::<ApiResult<Vec<_>>>()?;

    Ok(Json(json!({
        "data": views,
        "pagination": Pagination {
            page,
            limit,
            total,
            total_pages: total.div_ceil(limit),
        },
    })))
}

pub async fn get_server(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
    Query(query): Query<GetQuery>,
) -> ApiResult<Json<Value>> {
    let record = ctx.store.get_server(id)?;
    let view = ServerView::render(&ctx, record, query.include_tools)?;
    Ok(Json(json!({ "data": view })))
}

pub async fn create_server(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<CreateQuery>,
    Json(draft): Json<ServerDraft>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let (record, connect_error) = ctx.registry.create_server(&draft, query.strict).await?;
    let mut view = ServerView::render(&ctx, record, false)?;
    view.connect_error = connect_error;
    Ok((StatusCode::CREATED, Json(json!({ "data": view }))))
}

pub async fn update_server(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
    Json(patch): Json<ServerPatch>,
) -> ApiResult<Json<Value>> {
    let record = ctx.registry.update_server(id, &patch).await?;
    let view = ServerView::render(&ctx, record, false)?;
    Ok(Json(json!({ "data": view })))
}

pub async fn delete_server(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let deleted = ctx.registry.delete_server(id).await?;
    Ok(Json(json!({
        "deleted_id": deleted.id,
        "deleted_server_name": deleted.name,
    })))
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "server": "dext",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
