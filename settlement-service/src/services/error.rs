use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use service_core::error::AppError;
use thiserror::Error;

use crate::models::SettlementStatus;

/// Caller-facing settlement failures. Each carries a stable machine code;
/// none are retried internally.
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("An open settlement already exists for this supplier and currency: {settlement_id}")]
    OpenSettlementExists { settlement_id: String },

    #[error("Settlement not found")]
    SettlementNotFound,

    #[error("Settlement is {status}, expected draft")]
    SettlementNotDraft { status: SettlementStatus },

    #[error("Settlement has no line items")]
    SettlementEmpty,

    #[error("Settlement is already paid")]
    SettlementAlreadyPaid,

    #[error("Settlement is {status}, expected approved")]
    SettlementNotApproved { status: SettlementStatus },

    #[error("Accrual is not eligible for settlement: {accrual_id}")]
    AccrualNotEligible { accrual_id: String },

    #[error("Accrual is not in this settlement: {accrual_id}")]
    AccrualNotInThisSettlement { accrual_id: String },

    #[error("Accrual not found")]
    AccrualNotFound,

    #[error("Accrual is locked or not open for changes: {accrual_id}")]
    AccrualLocked { accrual_id: String },

    #[error("Accrual is already reversed: {accrual_id}")]
    AccrualAlreadyReversed { accrual_id: String },

    #[error(transparent)]
    App(#[from] AppError),
}

impl From<validator::ValidationErrors> for SettlementError {
    fn from(err: validator::ValidationErrors) -> Self {
        SettlementError::App(AppError::ValidationError(err))
    }
}

impl SettlementError {
    pub fn code(&self) -> &'static str {
        match self {
            SettlementError::OpenSettlementExists { .. } => "open_settlement_exists",
            SettlementError::SettlementNotFound => "settlement_not_found",
            SettlementError::SettlementNotDraft { .. } => "settlement_not_draft",
            SettlementError::SettlementEmpty => "settlement_empty",
            SettlementError::SettlementAlreadyPaid => "settlement_already_paid",
            SettlementError::SettlementNotApproved { .. } => "settlement_not_approved",
            SettlementError::AccrualNotEligible { .. } => "accrual_not_eligible",
            SettlementError::AccrualNotInThisSettlement { .. } => "accrual_not_in_this_settlement",
            SettlementError::AccrualNotFound => "accrual_not_found",
            SettlementError::AccrualLocked { .. } => "accrual_locked",
            SettlementError::AccrualAlreadyReversed { .. } => "accrual_already_reversed",
            SettlementError::App(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            SettlementError::SettlementNotFound | SettlementError::AccrualNotFound => {
                StatusCode::NOT_FOUND
            }
            SettlementError::App(err) => err.status_code(),
            _ => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for SettlementError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            code: &'static str,
        }

        let status = self.status_code();
        let code = self.code();
        match self {
            SettlementError::App(err) => err.into_response(),
            other => {
                tracing::info!(code = code, status = %status, "Settlement request rejected");
                (
                    status,
                    Json(ErrorResponse {
                        error: other.to_string(),
                        code,
                    }),
                )
                    .into_response()
            }
        }
    }
}
