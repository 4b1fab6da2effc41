//! Small HTTP client wrappers over `ureq`.

use std::fs::File;
use std::io;
use std::path::Path;

/// Error type for HTTP fetches.
#[derive(Debug)]
pub enum HttpError {
    /// Transport-level failure or non-success status.
    Request { url: String, message: String },
    /// Response body could not be read or written.
    Io { url: String, source: io::Error },
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::Request { url, message } => write!(f, "request to {url} failed: {message}"),
            HttpError::Io { url, source } => write!(f, "reading response from {url}: {source}"),
        }
    }
}

impl std::error::Error for HttpError {}

/// Fetch a URL and deserialize the JSON body.
pub fn get_json<T: serde::de::DeserializeOwned>(url: &str) -> Result<T, HttpError> {
    let response = ureq::get(url).call().map_err(|e| HttpError::Request {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    response.into_json().map_err(|source| HttpError::Io {
        url: url.to_string(),
        source,
    })
}

/// Stream a URL's body into a file.
pub fn save_to_file(url: &str, dest: &Path) -> Result<(), HttpError> {
    let response = ureq::get(url).call().map_err(|e| HttpError::Request {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    let mut reader = response.into_reader();
    let mut file = File::create(dest).map_err(|source| HttpError::Io {
        url: url.to_string(),
        source,
    })?;
    io::copy(&mut reader, &mut file).map_err(|source| HttpError::Io {
        url: url.to_string(),
        source,
    })?;
    Ok(())
}
