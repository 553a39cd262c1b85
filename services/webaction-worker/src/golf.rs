//! golf / fetch_reservations, search_tee_times, book_tee_time
//! reservation lookup, tee-time search, and the book workflow

use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use relay_core::config::Stage;
use relay_core::course::CourseDefinition;
use relay_core::error::{Error, Result};
use relay_core::http_client::SafeHttpClient;
use relay_core::persistence::Store;
use relay_core::secrets::Claims;
use relay_core::web_action::{WebActionKind, WebActionPayload, WebActionResult};

/// Sentinel the upstream uses in place of an empty result set.
const NO_TEE_TIMES_SENTINEL: &str = "no tee times available";

fn auth_header(access_token: &str) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {access_token}")) {
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }
    headers
}

/// GET reservations, sort ascending by start time, keep the first four,
/// and render a formatted list.
pub async fn fetch_reservations(
    http: &SafeHttpClient,
    course: &CourseDefinition,
    golfer_id: &str,
    access_token: &str,
) -> Result<String> {
    let url = format!("{}?golferId={golfer_id}", course.get_action_url_or_err("fetch_reservations")?);

    let response = http.get(&url, auth_header(access_token)).await?;
    let body: Value = response.json()?;

    let mut items: Vec<Value> = body
        .get("reservations")
        .or(Some(&body))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    items.sort_by(|a, b| {
        let a_time = a.get("startTime").and_then(Value::as_str).unwrap_or("");
        let b_time = b.get("startTime").and_then(Value::as_str).unwrap_or("");
        a_time.cmp(b_time)
    });
    items.truncate(4);

    if items.is_empty() {
        return Ok("You have no upcoming reservations.".to_string());
    }

    let mut lines = vec!["Upcoming reservations:".to_string()];
    for item in &items {
        let start = item.get("startTime").and_then(Value::as_str).unwrap_or("unknown time");
        let course_name = item.get("course").and_then(Value::as_str).unwrap_or("unknown course");
        let players = item.get("players").and_then(Value::as_u64).unwrap_or(1);
        let confirmation = item.get("confirmation").and_then(Value::as_str).unwrap_or("n/a");
        let urgency = item.get("urgency").and_then(Value::as_str).unwrap_or("normal");
        lines.push(format!(
            "- {start} at {course_name} for {players} player(s), confirmation {confirmation} ({urgency})"
        ));
    }

    Ok(lines.join("\n"))
}

struct SearchParams {
    search_date: Option<String>,
    number_of_players: u8,
    start_search_time: Option<String>,
    end_search_time: Option<String>,
    auto_book: bool,
}

fn search_params(payload: &WebActionPayload, arguments: &std::collections::HashMap<String, Value>) -> SearchParams {
    SearchParams {
        search_date: arguments
            .get("search_date")
            .and_then(Value::as_str)
            .map(String::from),
        number_of_players: payload.number_of_players.unwrap_or(1),
        start_search_time: payload.start_search_time.clone(),
        end_search_time: payload.end_search_time.clone(),
        auto_book: payload.auto_book,
    }
}

/// Build the search URL, GET, filter by time window, and either auto-book
/// the first remaining slot or render a top-5 list.
pub async fn search_tee_times(
    http: &SafeHttpClient,
    store: &dyn Store,
    course: &CourseDefinition,
    message_id: &str,
    stage: Stage,
    payload: &WebActionPayload,
    arguments: &std::collections::HashMap<String, Value>,
    claims: Option<&Claims>,
    access_token: Option<&str>,
) -> Result<String> {
    let params = search_params(payload, arguments);

    let search_url = course.get_action_url_or_err("search_tee_times")?;
    let mut url = format!("{search_url}?players={}", params.number_of_players);
    if let Some(date) = &params.search_date {
        url.push_str(&format!("&date={date}"));
    }

    let started = std::time::Instant::now();
    let response = http.get(&url, reqwest::header::HeaderMap::new()).await;
    let response = match response {
        Ok(r) => r,
        Err(e) => {
            record_result(store, message_id, WebActionKind::Golf, &url, Err(e.to_string()), started.elapsed(), stage).await?;
            return Err(e);
        }
    };

    let text = response.text()?;
    let slots: Vec<Value> = if text.contains(NO_TEE_TIMES_SENTINEL) {
        Vec::new()
    } else {
        let body: Value = serde_json::from_str(&text)
            .map_err(|e| Error::External(format!("search response is not valid JSON: {e}")))?;
        body.get("teeTimes")
            .or(Some(&body))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
    };

    record_result(
        store,
        message_id,
        WebActionKind::Golf,
        &url,
        Ok((200, format!("{} slots found", slots.len()))),
        started.elapsed(),
        stage,
    )
    .await?;

    let filtered: Vec<Value> = slots
        .into_iter()
        .filter(|slot| {
            let time = slot.get("teeTime").and_then(Value::as_str).unwrap_or("");
            let after_start = params
                .start_search_time
                .as_deref()
                .map(|s| time >= s)
                .unwrap_or(true);
            let before_end = params
                .end_search_time
                .as_deref()
                .map(|e| time <= e)
                .unwrap_or(true);
            after_start && before_end
        })
        .collect();

    if params.auto_book && !filtered.is_empty() {
        if let (Some(claims), Some(access_token)) = (claims, access_token) {
            let slot = &filtered[0];
            return book_tee_time(
                http,
                store,
                course,
                message_id,
                stage,
                slot,
                params.number_of_players,
                claims,
                access_token,
            )
            .await;
        }
    }

    if filtered.is_empty() {
        return Ok("No tee times found matching your search.".to_string());
    }

    let mut lines = vec!["Available tee times:".to_string()];
    for slot in filtered.iter().take(5) {
        let time = slot.get("teeTime").and_then(Value::as_str).unwrap_or("unknown time");
        let price = slot.get("price").and_then(Value::as_f64).unwrap_or(0.0);
        lines.push(format!("- {time} (${price:.2})"));
    }

    Ok(lines.join("\n"))
}

/// Lock -> price -> reserve three-step atomic workflow.
#[allow(clippy::too_many_arguments)]
pub async fn book_tee_time(
    http: &SafeHttpClient,
    store: &dyn Store,
    course: &CourseDefinition,
    message_id: &str,
    stage: Stage,
    slot: &Value,
    number_of_players: u8,
    claims: &Claims,
    access_token: &str,
) -> Result<String> {
    let tee_sheet_id = slot
        .get("teeSheetId")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidPayload("search slot missing teeSheetId".to_string()))?;

    let email = claims
        .email
        .clone()
        .ok_or_else(|| Error::Unauthorized("JWT claims missing email".to_string()))?;
    let golfer_id = claims
        .golfer_id
        .clone()
        .ok_or_else(|| Error::Unauthorized("JWT claims missing golferId".to_string()))?;
    let acct = claims
        .acct
        .clone()
        .ok_or_else(|| Error::Unauthorized("JWT claims missing acct".to_string()))?;

    let session_id = Uuid::new_v4().to_string();

    // Step 1: lock.
    let lock_url = course.get_action_url_or_err("lock")?;
    let lock_body = serde_json::json!({
        "tee_sheet_ids": [tee_sheet_id],
        "email": email,
        "session_id": session_id,
        "golfer_id": golfer_id,
        "number_of_player": number_of_players,
        "class_code": "R",
    });
    let started = std::time::Instant::now();
    let lock_response = http
        .post_json(&lock_url, auth_header(access_token), &lock_body)
        .await;
    let lock_response = match lock_response {
        Ok(r) => r,
        Err(e) => {
            record_result(store, message_id, WebActionKind::Golf, &lock_url, Err(e.to_string()), started.elapsed(), stage).await?;
            return Err(e);
        }
    };
    let lock_json: Value = lock_response.json()?;
    let warning = lock_json.get("warning").and_then(Value::as_str).unwrap_or("");
    let error_message = lock_json.get("error").and_then(Value::as_str).unwrap_or("");

    if warning.contains("already have a reservation") {
        let err = Error::ReservationConflict(warning.to_string());
        record_result(store, message_id, WebActionKind::Golf, &lock_url, Err(err.to_string()), started.elapsed(), stage).await?;
        return Err(err);
    }
    if !error_message.is_empty() {
        let err = Error::LockFailure(error_message.to_string());
        record_result(store, message_id, WebActionKind::Golf, &lock_url, Err(err.to_string()), started.elapsed(), stage).await?;
        return Err(err);
    }
    record_result(store, message_id, WebActionKind::Golf, &lock_url, Ok((200, "locked".to_string())), started.elapsed(), stage).await?;

    // Step 2: price.
    let price_url = course.get_action_url_or_err("price")?;
    let price_body = serde_json::json!({
        "tee_sheet_id": tee_sheet_id,
        "acct": acct,
        "golfer_id": golfer_id,
        "rate_code": "N",
        "holes": 18,
        "number_of_player": number_of_players,
    });
    let started = std::time::Instant::now();
    let price_response = http
        .post_json(&price_url, auth_header(access_token), &price_body)
        .await;
    let price_response = match price_response {
        Ok(r) => r,
        Err(e) => {
            record_result(store, message_id, WebActionKind::Golf, &price_url, Err(e.to_string()), started.elapsed(), stage).await?;
            return Err(e);
        }
    };
    let price_json: Value = price_response.json()?;
    let transaction_id = price_json
        .get("transaction_id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::PricingFailure("pricing response missing transaction_id".to_string()))?
        .to_string();
    let total = price_json.get("total").and_then(Value::as_f64).unwrap_or(0.0);
    record_result(store, message_id, WebActionKind::Golf, &price_url, Ok((200, format!("total={total}"))), started.elapsed(), stage).await?;

    // Step 3: reserve, after the upstream's required settle time.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let reserve_url = course.get_action_url_or_err("reserve")?;
    let reserve_body = serde_json::json!({
        "locked_tee_times_session_id": session_id,
        "transaction_id": transaction_id,
        "email": email,
        "card_number": Value::Null,
        "card_expiry": Value::Null,
    });
    let started = std::time::Instant::now();
    let reserve_response = http
        .post_json(&reserve_url, auth_header(access_token), &reserve_body)
        .await;
    let reserve_response = match reserve_response {
        Ok(r) => r,
        Err(e) => {
            record_result(store, message_id, WebActionKind::Golf, &reserve_url, Err(e.to_string()), started.elapsed(), stage).await?;
            return Err(e);
        }
    };
    let reserve_json: Value = reserve_response.json()?;
    let reservation_result = reserve_json.get("reservation_result").and_then(Value::as_i64).unwrap_or(0);

    if reservation_result != 1 {
        let err = Error::ReservationFailed(format!(
            "reservation_result={reservation_result}"
        ));
        record_result(store, message_id, WebActionKind::Golf, &reserve_url, Err(err.to_string()), started.elapsed(), stage).await?;
        return Err(err);
    }

    let confirmation_key = reserve_json
        .get("confirmation_key")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let reservation_id = reserve_json
        .get("reservation_id")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let tee_time = slot.get("teeTime").and_then(Value::as_str).unwrap_or("unknown time");

    record_result(
        store,
        message_id,
        WebActionKind::Golf,
        &reserve_url,
        Ok((200, format!("confirmation={confirmation_key}"))),
        started.elapsed(),
        stage,
    )
    .await?;

    Ok(format!(
        "Tee time confirmed: {tee_time} at {} (confirmation {confirmation_key}, reservation {reservation_id}, holes 18, total ${total:.2})",
        course.name
    ))
}

async fn record_result(
    store: &dyn Store,
    message_id: &str,
    action: WebActionKind,
    url: &str,
    outcome: std::result::Result<(u16, String), String>,
    elapsed: Duration,
    stage: Stage,
) -> Result<()> {
    let result = match outcome {
        Ok((code, body)) => WebActionResult::success(message_id, action, url, code, body, elapsed.as_millis() as u64, stage),
        Err(message) => WebActionResult::failure(message_id, action, url, message, elapsed.as_millis() as u64, stage),
    };
    store.put_web_action_result(&result).await
}

trait CourseActionExt {
    fn get_action_url_or_err(&self, operation: &str) -> Result<String>;
}

impl CourseActionExt for CourseDefinition {
    fn get_action_url_or_err(&self, operation: &str) -> Result<String> {
        self.actions
            .get(operation)
            .map(|template| {
                if template.starts_with("http://") || template.starts_with("https://") {
                    template.clone()
                } else {
                    format!("{}/{}", self.origin.trim_end_matches('/'), template.trim_start_matches('/'))
                }
            })
            .ok_or_else(|| Error::ConfigNotFound(format!("course has no {operation} action")))
    }
}
