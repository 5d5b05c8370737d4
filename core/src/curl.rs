//! Debug rendering of a request as a shell `curl` command

use crate::transport::HttpRequest;

#[derive(Debug, thiserror::Error)]
pub enum CurlError {
    #[error("header {0} is not valid UTF-8")]
    NonUtf8Header(String),
    #[error("request body is not valid UTF-8")]
    NonUtf8Body,
}

/// Render `request` as `curl -X 'METHOD' [-d 'BODY'] [-H 'K: V']... 'URL'`
///
/// Headers are emitted sorted by name so the output is stable.
pub fn render_curl(request: &HttpRequest) -> Result<String, CurlError> {
    let mut parts = vec![
        "curl".to_string(),
        "-X".to_string(),
        quote(request.method.as_str()),
    ];

    if !request.body.is_empty() {
        let body = std::str::from_utf8(&request.body).map_err(|_| CurlError::NonUtf8Body)?;
        parts.push("-d".to_string());
        parts.push(quote(body));
    }

    let mut headers = Vec::with_capacity(request.headers.len());
    for (name, value) in &request.headers {
        let value = value
            .to_str()
            .map_err(|_| CurlError::NonUtf8Header(name.to_string()))?;
        headers.push(format!("{}: {}", name.as_str(), value));
    }
    headers.sort();

    for header in headers {
        parts.push("-H".to_string());
        parts.push(quote(&header));
    }

    parts.push(quote(request.url.as_str()));
    Ok(parts.join(" "))
}

/// Single-quote for POSIX shells
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
