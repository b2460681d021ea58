//! Settlement run handlers. All operations are scoped to the tenant's org.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use crate::dtos::{
    AccrualIdsRequest, ApproveRequest, CancelRequest, CreateSettlementRequest,
    ItemsAddedResponse, ItemsRemovedResponse, ListResponse, ListSettlementsQuery,
    MarkPaidRequest, SettlementResponse,
};
use crate::middleware::TenantContext;
use crate::services::{CreateRun, SettlementError};
use crate::startup::AppState;

#[tracing::instrument(skip(state, tenant, request), fields(org_id = %tenant.org_id))]
pub async fn create_settlement(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(request): Json<CreateSettlementRequest>,
) -> Result<(StatusCode, Json<SettlementResponse>), SettlementError> {
    request.validate()?;
    let period = request.period();

    let run = state
        .settlements
        .create_run(
            &tenant.org_id,
            CreateRun {
                supplier_id: request.supplier_id,
                currency: request.currency,
                period,
            },
            tenant.actor(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(run.into())))
}

#[tracing::instrument(skip(state, tenant, query), fields(org_id = %tenant.org_id))]
pub async fn list_settlements(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<ListSettlementsQuery>,
) -> Result<Json<ListResponse<SettlementResponse>>, SettlementError> {
    let runs = state
        .settlements
        .list_runs(&tenant.org_id, &query.into())
        .await?;
    Ok(Json(ListResponse::new(
        runs.into_iter().map(Into::into).collect(),
    )))
}

#[tracing::instrument(skip(state, tenant), fields(org_id = %tenant.org_id))]
pub async fn get_settlement(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(settlement_id): Path<String>,
) -> Result<Json<SettlementResponse>, SettlementError> {
    let run = state
        .settlements
        .get_run(&tenant.org_id, &settlement_id)
        .await?;
    Ok(Json(run.into()))
}

#[tracing::instrument(skip(state, tenant, request), fields(org_id = %tenant.org_id))]
pub async fn add_items(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(settlement_id): Path<String>,
    Json(request): Json<AccrualIdsRequest>,
) -> Result<Json<ItemsAddedResponse>, SettlementError> {
    request.validate()?;
    let change = state
        .settlements
        .add_items(
            &tenant.org_id,
            &settlement_id,
            &request.accrual_ids,
            tenant.actor(),
        )
        .await?;
    Ok(Json(change.into()))
}

#[tracing::instrument(skip(state, tenant, request), fields(org_id = %tenant.org_id))]
pub async fn remove_items(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(settlement_id): Path<String>,
    Json(request): Json<AccrualIdsRequest>,
) -> Result<Json<ItemsRemovedResponse>, SettlementError> {
    request.validate()?;
    let change = state
        .settlements
        .remove_items(
            &tenant.org_id,
            &settlement_id,
            &request.accrual_ids,
            tenant.actor(),
        )
        .await?;
    Ok(Json(change.into()))
}

#[tracing::instrument(skip(state, tenant, request), fields(org_id = %tenant.org_id))]
pub async fn approve(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(settlement_id): Path<String>,
    request: Option<Json<ApproveRequest>>,
) -> Result<Json<SettlementResponse>, SettlementError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let run = state
        .settlements
        .approve(
            &tenant.org_id,
            &settlement_id,
            tenant.actor(),
            request.approved_at,
        )
        .await?;
    Ok(Json(run.into()))
}

#[tracing::instrument(skip(state, tenant, request), fields(org_id = %tenant.org_id))]
pub async fn cancel(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(settlement_id): Path<String>,
    request: Option<Json<CancelRequest>>,
) -> Result<Json<SettlementResponse>, SettlementError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    request.validate()?;
    let run = state
        .settlements
        .cancel(
            &tenant.org_id,
            &settlement_id,
            tenant.actor(),
            request.reason,
        )
        .await?;
    Ok(Json(run.into()))
}

#[tracing::instrument(skip(state, tenant, request), fields(org_id = %tenant.org_id))]
pub async fn mark_paid(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(settlement_id): Path<String>,
    request: Option<Json<MarkPaidRequest>>,
) -> Result<Json<SettlementResponse>, SettlementError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    request.validate()?;
    let run = state
        .settlements
        .mark_paid(
            &tenant.org_id,
            &settlement_id,
            tenant.actor(),
            request.paid_at,
            request.payment_reference,
        )
        .await?;
    Ok(Json(run.into()))
}
