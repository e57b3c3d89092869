use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{redirect, Client, StatusCode, Url};

use crate::config::EngineConfig;
use crate::errors::{EngineError, Result};

/// What the start flow learned about the endpoint before transfer.
#[derive(Debug, Clone, Copy)]
pub struct ProbeResult {
    pub total_bytes: Option<u64>,
    pub accepts_ranges: bool,
}

/// One shared client per engine. reqwest pools connections per host, which
/// gives chunked downloads of one host a shared pool for free. Redirects are
/// followed only within the https + allow-list policy.
pub fn build_client(config: &EngineConfig) -> Result<Client> {
    let allowlist: Vec<String> = config.host_allowlist.clone();
    let max_redirects = config.max_redirects;
    let policy = redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > max_redirects {
            return attempt.error("too many redirects");
        }
        let url = attempt.url();
        let allowed = url.scheme() == "https"
            && url
                .host_str()
                .map(|host| {
                    let normalized = host.to_ascii_lowercase();
                    allowlist.iter().any(|entry| *entry == normalized)
                })
                .unwrap_or(false);
        if allowed {
            attempt.follow()
        } else {
            attempt.error("redirect outside the host allow-list")
        }
    });

    Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(config.connect_timeout)
        .redirect(policy)
        .pool_max_idle_per_host(16)
        .tcp_nodelay(true)
        .build()
        .map_err(EngineError::Network)
}

/// URL policy for `add`: https only, host on the allow-list.
pub fn validate_url(config: &EngineConfig, raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|err| EngineError::Validation(format!("invalid url '{raw}': {err}")))?;
    if url.scheme() != "https" {
        return Err(EngineError::Validation(format!(
            "only https downloads are accepted: {raw}"
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| EngineError::Validation(format!("url has no host: {raw}")))?;
    if !config.host_allowed(host) {
        return Err(EngineError::Validation(format!(
            "host not on the allow-list: {host}"
        )));
    }
    Ok(url)
}

pub fn host_of(url: &Url) -> String {
    url.host_str().unwrap_or_default().to_ascii_lowercase()
}

/// Learn size and range support. HEAD first; servers that reject or
/// under-report fall back to a zero-range GET whose body is discarded.
pub async fn probe(client: &Client, url: &Url) -> Result<ProbeResult> {
    if let Some(result) = probe_head(client, url).await? {
        return Ok(result);
    }
    probe_zero_range(client, url).await
}

async fn probe_head(client: &Client, url: &Url) -> Result<Option<ProbeResult>> {
    let response = match client.head(url.clone()).send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!("head probe failed for {}: {}", url, err);
            return Ok(None);
        }
    };
    if !response.status().is_success() {
        return Ok(None);
    }

    let total_bytes = header_u64(&response, CONTENT_LENGTH.as_str());
    let accepts_ranges = response
        .headers()
        .get(ACCEPT_RANGES)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);

    if total_bytes.is_none() {
        // Let the ranged GET try to recover a size from Content-Range.
        return Ok(None);
    }
    Ok(Some(ProbeResult {
        total_bytes,
        accepts_ranges,
    }))
}

async fn probe_zero_range(client: &Client, url: &Url) -> Result<ProbeResult> {
    let response = client
        .get(url.clone())
        .header(RANGE, "bytes=0-0")
        .send()
        .await?;
    let status = response.status();
    let result = if status == StatusCode::PARTIAL_CONTENT {
        let total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range_total);
        ProbeResult {
            total_bytes: total,
            accepts_ranges: true,
        }
    } else if status == StatusCode::OK {
        ProbeResult {
            total_bytes: header_u64(&response, CONTENT_LENGTH.as_str()),
            accepts_ranges: false,
        }
    } else if status.is_success() {
        ProbeResult {
            total_bytes: None,
            accepts_ranges: false,
        }
    } else {
        return Err(EngineError::server(
            status,
            format!("probe rejected for {url}"),
        ));
    };
    // The one-byte body is dropped with the response.
    Ok(result)
}

fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

/// `Content-Range: bytes 0-0/12345` -> 12345. An unknown total (`*`) yields
/// `None`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (unit, rest) = value.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let (_range, total) = rest.rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}
