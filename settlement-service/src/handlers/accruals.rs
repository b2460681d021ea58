use axum::{
    extract::{Path, Query, State},
    Json,
};
use validator::Validate;

use crate::dtos::{
    AccrualResponse, AdjustAccrualRequest, ListAccrualsQuery, ListResponse,
    ReverseAccrualRequest,
};
use crate::middleware::TenantContext;
use crate::services::SettlementError;
use crate::startup::AppState;

#[tracing::instrument(skip(state, tenant, query), fields(org_id = %tenant.org_id))]
pub async fn list_accruals(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<ListAccrualsQuery>,
) -> Result<Json<ListResponse<AccrualResponse>>, SettlementError> {
    let accruals = state
        .accruals
        .list_accruals(&tenant.org_id, &query.into())
        .await?;
    Ok(Json(ListResponse::new(
        accruals.into_iter().map(Into::into).collect(),
    )))
}

#[tracing::instrument(skip(state, tenant), fields(org_id = %tenant.org_id))]
pub async fn get_accrual(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(accrual_id): Path<String>,
) -> Result<Json<AccrualResponse>, SettlementError> {
    let accrual = state
        .accruals
        .get_accrual(&tenant.org_id, &accrual_id)
        .await?;
    Ok(Json(accrual.into()))
}

#[tracing::instrument(skip(state, tenant, request), fields(org_id = %tenant.org_id))]
pub async fn adjust_accrual(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(accrual_id): Path<String>,
    Json(request): Json<AdjustAccrualRequest>,
) -> Result<Json<AccrualResponse>, SettlementError> {
    request.validate()?;
    let accrual = state
        .accruals
        .adjust(
            &tenant.org_id,
            &accrual_id,
            request.net_payable,
            request.reason,
            tenant.actor(),
        )
        .await?;
    Ok(Json(accrual.into()))
}

#[tracing::instrument(skip(state, tenant, request), fields(org_id = %tenant.org_id))]
pub async fn reverse_accrual(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(accrual_id): Path<String>,
    request: Option<Json<ReverseAccrualRequest>>,
) -> Result<Json<AccrualResponse>, SettlementError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    request.validate()?;
    let accrual = state
        .accruals
        .reverse(&tenant.org_id, &accrual_id, request.reason, tenant.actor())
        .await?;
    Ok(Json(accrual.into()))
}
