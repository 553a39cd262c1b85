//! weather / get_weather

use relay_core::error::{Error, Result};
use relay_core::http_client::SafeHttpClient;
use relay_core::web_action::WebActionPayload;

/// GET the forecast URL, select the first `2 * days` periods, and render a
/// day/night-paired notification string.
pub async fn run(http: &SafeHttpClient, payload: &WebActionPayload) -> Result<String> {
    let response = http.get(&payload.url, reqwest::header::HeaderMap::new()).await?;
    let body: serde_json::Value = response.json()?;

    let periods = body
        .get("properties")
        .and_then(|p| p.get("periods"))
        .and_then(|p| p.as_array())
        .cloned()
        .ok_or_else(|| Error::External("forecast response missing properties.periods".to_string()))?;

    let take = payload.weather_entry_count() as usize;
    let mut lines = Vec::new();
    for period in periods.into_iter().take(take) {
        let name = period.get("name").and_then(|v| v.as_str()).unwrap_or("Period");
        let temperature = period.get("temperature").and_then(|v| v.as_i64()).unwrap_or(0);
        let unit = period
            .get("temperatureUnit")
            .and_then(|v| v.as_str())
            .unwrap_or("F");
        let forecast = period
            .get("shortForecast")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        lines.push(format!("{name}: {temperature}{unit}, {forecast}"));
    }

    if lines.is_empty() {
        return Err(Error::External("forecast response had no periods".to_string()));
    }

    Ok(lines.join("\n"))
}
