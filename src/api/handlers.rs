//! API request handlers
//!
//! Every request carries an `auth` header whose literal value is the
//! request's owner; clone listings and destroys are scoped to it. Status and
//! resource metadata are not.

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use std::sync::Arc;

use super::types::*;
use crate::models::{PublicClone, ServerStatus};
use crate::service::Service;
use crate::{names, Error};

pub type AppState = Arc<Service>;

/// The authenticated owner of a request.
#[derive(Debug, Clone)]
pub struct Owner(pub String);

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

/// Rejects requests without an `auth` header and records its value as the
/// request owner.
pub async fn require_auth(mut req: Request, next: Next) -> Response {
    let owner = req
        .headers()
        .get("auth")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let Some(owner) = owner else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ApiError {
                error: "Unauthorized".to_string(),
                message: "auth header must be supplied".to_string(),
            }),
        )
            .into_response();
    };
    req.extensions_mut().insert(Owner(owner));
    next.run(req).await
}

// === Status ===

pub async fn get_status(State(service): State<AppState>) -> ApiResult<Json<ServerStatus>> {
    let status = service.server_status().await.map_err(to_api_error)?;
    Ok(Json(status))
}

// === Resources ===

async fn resource_detail(service: &Service, owner: &str, name: &str) -> crate::Result<ResourceDetail> {
    let resource = service.resource(name)?;
    let snaps = service
        .resource_snaps(owner, name)
        .await?
        .into_iter()
        .map(|(snap, clones)| SnapDetail { snap, clones })
        .collect();
    Ok(ResourceDetail {
        name: resource.name.clone(),
        alias: resource.alias.clone(),
        clone_pool: resource.clone_pool,
        snaps,
    })
}

pub async fn get_resources(
    State(service): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
) -> ApiResult<Json<Vec<ResourceDetail>>> {
    let mut resources = Vec::new();
    for r in service.resources() {
        resources.push(
            resource_detail(&service, &owner, &r.name)
                .await
                .map_err(to_api_error)?,
        );
    }
    resources.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(resources))
}

pub async fn get_resource(
    State(service): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(resource): Path<String>,
) -> ApiResult<Json<ResourceDetail>> {
    let detail = resource_detail(&service, &owner, &resource)
        .await
        .map_err(to_api_error)?;
    Ok(Json(detail))
}

// === Snaps ===

pub async fn get_snaps(
    State(service): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(resource): Path<String>,
) -> ApiResult<Json<Vec<SnapDetail>>> {
    let snaps = service
        .resource_snaps(&owner, &resource)
        .await
        .map_err(to_api_error)?
        .into_iter()
        .map(|(snap, clones)| SnapDetail { snap, clones })
        .collect();
    Ok(Json(snaps))
}

pub async fn get_snap(
    State(service): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path((resource, at)): Path<(String, String)>,
) -> ApiResult<Json<SnapDetail>> {
    let at = names::parse_wire_ts(&at).map_err(to_api_error)?;
    let snaps = service
        .resource_snaps(&owner, &resource)
        .await
        .map_err(to_api_error)?;
    let found = snaps
        .into_iter()
        .find(|(snap, _)| snap.created_at == at)
        .ok_or_else(|| {
            to_api_error(Error::NotFound(format!(
                "snap {resource}@{}",
                names::format_wire_ts(at)
            )))
        })?;
    Ok(Json(SnapDetail {
        snap: found.0,
        clones: found.1,
    }))
}

pub async fn post_clone_latest(
    State(service): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(resource): Path<String>,
) -> ApiResult<Json<PublicClone>> {
    let clone = service
        .clone_resource(&owner, &resource, None)
        .await
        .map_err(to_api_error)?;
    Ok(Json(clone))
}

pub async fn post_clone_at(
    State(service): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path((resource, at)): Path<(String, String)>,
) -> ApiResult<Json<PublicClone>> {
    let at = names::parse_wire_ts(&at).map_err(to_api_error)?;
    let clone = service
        .clone_resource(&owner, &resource, Some(at))
        .await
        .map_err(to_api_error)?;
    Ok(Json(clone))
}

// === Clones ===

pub async fn get_clones(
    State(service): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(resource): Path<String>,
) -> ApiResult<Json<Vec<PublicClone>>> {
    let clones = service
        .owned_clones(&owner, &resource)
        .await
        .map_err(to_api_error)?;
    Ok(Json(clones))
}

pub async fn delete_clones(
    State(service): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(resource): Path<String>,
) -> ApiResult<Json<DestroyedClones>> {
    let destroyed = service
        .destroy_owned_clones(&owner, &resource)
        .await
        .map_err(to_api_error)?;
    Ok(Json(DestroyedClones { destroyed }))
}

pub async fn delete_clone_at(
    State(service): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path((resource, at)): Path<(String, String)>,
) -> ApiResult<Json<ApiSuccess>> {
    let at = names::parse_wire_ts(&at).map_err(to_api_error)?;
    let name = service
        .destroy_owned_clone_at(&owner, &resource, at)
        .await
        .map_err(to_api_error)?;
    Ok(Json(ApiSuccess {
        message: format!("clone '{name}' destroyed"),
    }))
}

// === Claims ===

pub async fn post_claim(
    State(service): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(resource): Path<String>,
    Query(query): Query<ClaimQuery>,
) -> ApiResult<Json<PublicClone>> {
    let claim = service
        .claim(&resource, query.ttl, &owner)
        .await
        .map_err(to_api_error)?;
    Ok(Json(claim))
}

pub async fn delete_claim(
    State(service): State<AppState>,
    Path((resource, claim_id)): Path<(String, String)>,
) -> ApiResult<Json<ApiSuccess>> {
    service
        .expire_claim(&resource, &claim_id)
        .await
        .map_err(to_api_error)?;
    Ok(Json(ApiSuccess {
        message: format!("claim '{claim_id}' expired"),
    }))
}

// === Helpers ===

fn to_api_error(e: Error) -> (StatusCode, Json<ApiError>) {
    let (status, kind) = match &e {
        Error::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
        Error::ClaimUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "ClaimUnavailable"),
        Error::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "InvalidArgument"),
        Error::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, "Transient"),
        Error::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Config"),
        Error::Storage { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "Storage"),
        Error::Container(_) | Error::ContainerTimeout(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Container")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal"),
    };
    (
        status,
        Json(ApiError {
            error: kind.to_string(),
            message: e.to_string(),
        }),
    )
}
