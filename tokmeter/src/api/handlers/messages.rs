//! The metered proxy endpoint.
//!
//! A request moves through these stages:
//!
//! ```text
//! no x-api-key ──────────────────────────────────────────────→ 401, nothing recorded
//! x-api-key → resolve developer → forward ─┬─ transport error → error record, 500
//!                                          ├─ 200             → usage record, relay
//!                                          └─ other status    → relay, nothing recorded
//! ```
//!
//! The relayed response is the upstream status, headers and body bytes as received. Metering
//! happens on a background task, so a slow or failing telemetry backend is invisible here.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, instrument};

use crate::{
    AppState,
    errors::{Error, Result},
    identity::CallerIdentity,
    upstream::{API_KEY_HEADER, UpstreamResponse},
    usage::{UsageCounts, UsageRecord},
};

#[instrument(skip_all, fields(developer = tracing::field::Empty))]
pub async fn proxy_messages(State(state): State<AppState>, method: Method, headers: HeaderMap, body: Bytes) -> Result<Response> {
    let credential = headers
        .get(API_KEY_HEADER)
        .filter(|value| !value.is_empty())
        .ok_or(Error::MissingCredential)?;

    // A key that is not valid UTF-8 cannot match any slot but is still forwarded
    let developer = credential
        .to_str()
        .map(|key| state.identities.resolve(key))
        .unwrap_or(CallerIdentity::Unknown);
    tracing::Span::current().record("developer", tracing::field::display(developer));

    let upstream = match state.forwarder.forward(method, &headers, body).await {
        Ok(upstream) => upstream,
        Err(err) => {
            state.sink.record(UsageRecord::failure(developer, err.to_string(), err.elapsed));
            return Err(err.into());
        }
    };

    if upstream.status == StatusCode::OK {
        meter(&state, developer, &upstream);
    } else {
        debug!(status = upstream.status.as_u16(), "Relaying non-200 upstream response without metering");
    }

    Ok((upstream.status, upstream.headers, upstream.body).into_response())
}

fn meter(state: &AppState, developer: CallerIdentity, upstream: &UpstreamResponse) {
    let usage = UsageCounts::extract(&upstream.body);
    let cost = state.pricing.cost(&usage.model, usage.input_tokens, usage.output_tokens);
    debug!(
        model = %usage.model,
        family = %state.pricing.family_for(&usage.model),
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        cost_usd = %cost,
        "Metered upstream call"
    );
    state.sink.record(UsageRecord::success(developer, usage, cost, upstream.elapsed));
}
