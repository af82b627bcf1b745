//! Billing endpoints

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use shiftwise_billing::{EntitlementRecord, SessionVerification};
use shiftwise_shared::PlanKey;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Request to start a checkout. Fields arrive as strings and are validated
/// here so bad input gets a 400 with the standard error envelope instead of
/// the extractor's rejection.
#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub account_email: String,
    #[serde(default)]
    pub plan_key: String,
    /// Requested trial length in days; clamped server-side
    #[serde(default)]
    pub trial_days: u32,
}

impl CheckoutRequest {
    fn validate(&self) -> ApiResult<(Uuid, PlanKey)> {
        let account_id = Uuid::parse_str(&self.account_id)
            .map_err(|_| ApiError::BadRequest(format!("Invalid account id: {}", self.account_id)))?;
        let plan_key = PlanKey::parse(&self.plan_key)
            .ok_or_else(|| ApiError::BadRequest(format!("Unknown plan: {}", self.plan_key)))?;
        Ok((account_id, plan_key))
    }
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub redirect_url: String,
}

/// POST /billing/checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let (account_id, plan_key) = req.validate()?;

    let redirect_url = state
        .checkout
        .start_checkout(account_id, &req.account_email, plan_key, req.trial_days)
        .await?;

    Ok(Json(CheckoutResponse { redirect_url }))
}

/// POST /billing/webhook
///
/// Body must be the raw bytes Stripe sent; the signature covers them
/// exactly. Non-2xx responses make Stripe redeliver, which is our only
/// retry mechanism, so store failures propagate as 500s while signature
/// failures are terminal 400s.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::BadSignature)?;

    let event = state.webhooks.verify_event(&body, signature)?;
    state.webhooks.handle_event(event).await?;

    Ok(Json(json!({ "received": true })))
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: String,
}

/// GET /billing/session?session_id=
///
/// Manual verification path: the success-page redirect calls this so the
/// entitlement lands even when the webhook is delayed or lost.
pub async fn get_session(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Json<SessionVerification>> {
    let verification = state.reconciler.verify_session(&query.session_id).await?;
    Ok(Json(verification))
}

#[derive(Debug, Deserialize)]
pub struct EntitlementQuery {
    pub account_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct EntitlementResponse {
    pub has_paid_access: bool,
    pub records: Vec<EntitlementRecord>,
}

/// GET /billing/entitlement?account_id=
pub async fn get_entitlement(
    State(state): State<AppState>,
    Query(query): Query<EntitlementQuery>,
) -> ApiResult<Json<EntitlementResponse>> {
    let has_paid_access = state.store.has_paid_access(query.account_id).await?;
    let records = state.store.list_for_account(query.account_id).await?;

    Ok(Json(EntitlementResponse {
        has_paid_access,
        records,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(account_id: &str, plan_key: &str) -> CheckoutRequest {
        CheckoutRequest {
            account_id: account_id.to_string(),
            account_email: "owner@example.com".to_string(),
            plan_key: plan_key.to_string(),
            trial_days: 0,
        }
    }

    #[test]
    fn test_valid_request_parses() {
        let account_id = Uuid::new_v4();
        let req = request(&account_id.to_string(), "team");
        let (parsed_id, plan) = req.validate().unwrap();
        assert_eq!(parsed_id, account_id);
        assert_eq!(plan, PlanKey::Team);
    }

    #[test]
    fn test_unknown_plan_is_bad_request() {
        let req = request(&Uuid::new_v4().to_string(), "enterprise");
        assert!(matches!(req.validate(), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_missing_fields_are_bad_request() {
        // serde defaults leave empty strings, which must fail validation
        let req = request("", "");
        assert!(matches!(req.validate(), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_malformed_account_id_is_bad_request() {
        let req = request("not-a-uuid", "starter");
        assert!(matches!(req.validate(), Err(ApiError::BadRequest(_))));
    }
}
