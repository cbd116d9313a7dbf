//! Input validation for request envelopes.
//!
//! Validation is authoritative at two trust boundaries: the dispatcher
//! (before anything is published) and worker ingestion (before the
//! capability is invoked). Both call [`validate_request`].

use http::Uri;
use serde::Deserialize;

use crate::envelope::{RequestEnvelope, WorkPayload};
use crate::error::{BridgeError, Result};

/// Default maximum translation text length, in characters.
pub const DEFAULT_MAX_TRANSLATION_CHARS: usize = 10_000;
/// Default maximum summarization text length, in characters.
pub const DEFAULT_MAX_SUMMARIZATION_CHARS: usize = 50_000;

/// Length limits for validated fields.
pub mod limits {
    /// Language codes are ISO 639-1 (two letters).
    pub const LANGUAGE_CODE_LENGTH: usize = 2;
    /// Maximum user id length.
    pub const MAX_USER_ID_LENGTH: usize = 128;
    /// Maximum callback URL length.
    pub const MAX_CALLBACK_URL_LENGTH: usize = 2048;
}

/// Error constants for validation failures.
pub mod errmsg {
    pub const USER_ID_EMPTY: &str = "user_id cannot be empty";
    pub const USER_ID_TOO_LONG: &str = "user_id exceeds maximum length";

    pub const TEXT_EMPTY: &str = "text cannot be empty";
    pub const TEXT_TOO_LONG: &str = "text exceeds maximum length";

    pub const LANGUAGE_INVALID: &str = "language code must be exactly 2 ASCII letters";

    pub const MAX_LENGTH_ZERO: &str = "max_length must be greater than zero";

    pub const CALLBACK_URL_TOO_LONG: &str = "callback_url exceeds maximum length";
    pub const CALLBACK_URL_INVALID: &str = "callback_url must be an absolute http(s) URI";
}

/// Per-operation text length ceilings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    /// Maximum translation text length in characters.
    pub max_translation_chars: usize,
    /// Maximum summarization text length in characters.
    pub max_summarization_chars: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_translation_chars: DEFAULT_MAX_TRANSLATION_CHARS,
            max_summarization_chars: DEFAULT_MAX_SUMMARIZATION_CHARS,
        }
    }
}

/// Validate a full request envelope.
pub fn validate_request(request: &RequestEnvelope, limits: &ValidationLimits) -> Result<()> {
    validate_user_id(&request.user_id)?;
    validate_payload(&request.payload, limits)?;
    if let Some(ref url) = request.callback_url {
        validate_callback_url(url)?;
    }
    Ok(())
}

/// Validate a user id.
///
/// Rules:
/// - Must not be empty or whitespace
/// - Maximum 128 bytes
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(BridgeError::validation("user_id", errmsg::USER_ID_EMPTY));
    }
    if user_id.len() > limits::MAX_USER_ID_LENGTH {
        return Err(BridgeError::validation(
            "user_id",
            format!(
                "{} (max: {}, got: {})",
                errmsg::USER_ID_TOO_LONG,
                limits::MAX_USER_ID_LENGTH,
                user_id.len()
            ),
        ));
    }
    Ok(())
}

/// Validate the domain fields of a request.
pub fn validate_payload(payload: &WorkPayload, limits: &ValidationLimits) -> Result<()> {
    match payload {
        WorkPayload::Translation {
            text,
            source_language,
            target_language,
        } => {
            validate_text(text, limits.max_translation_chars)?;
            validate_language_code("source_language", source_language)?;
            validate_language_code("target_language", target_language)?;
        }
        WorkPayload::Summarization {
            text, max_length, ..
        } => {
            validate_text(text, limits.max_summarization_chars)?;
            if *max_length == Some(0) {
                return Err(BridgeError::validation(
                    "max_length",
                    errmsg::MAX_LENGTH_ZERO,
                ));
            }
        }
    }
    Ok(())
}

/// Validate request text against a character ceiling.
///
/// Length is counted in Unicode scalar values, not bytes.
pub fn validate_text(text: &str, max_chars: usize) -> Result<()> {
    if text.trim().is_empty() {
        return Err(BridgeError::validation("text", errmsg::TEXT_EMPTY));
    }
    let len = text.chars().count();
    if len > max_chars {
        return Err(BridgeError::validation(
            "text",
            format!("{} (max: {}, got: {})", errmsg::TEXT_TOO_LONG, max_chars, len),
        ));
    }
    Ok(())
}

/// Validate a two-letter language code.
pub fn validate_language_code(field: &'static str, code: &str) -> Result<()> {
    if code.len() != limits::LANGUAGE_CODE_LENGTH
        || !code.chars().all(|c| c.is_ascii_alphabetic())
    {
        return Err(BridgeError::validation(
            field,
            format!("{} (got: {:?})", errmsg::LANGUAGE_INVALID, code),
        ));
    }
    Ok(())
}

/// Validate a callback URL.
///
/// Rules:
/// - Maximum 2048 bytes
/// - Must parse as a URI with an `http` or `https` scheme and an authority
pub fn validate_callback_url(url: &str) -> Result<()> {
    if url.len() > limits::MAX_CALLBACK_URL_LENGTH {
        return Err(BridgeError::validation(
            "callback_url",
            errmsg::CALLBACK_URL_TOO_LONG,
        ));
    }
    let uri: Uri = url
        .parse()
        .map_err(|_| BridgeError::validation("callback_url", errmsg::CALLBACK_URL_INVALID))?;
    let scheme_ok = matches!(uri.scheme_str(), Some("http") | Some("https"));
    if !scheme_ok || uri.authority().is_none() {
        return Err(BridgeError::validation(
            "callback_url",
            errmsg::CALLBACK_URL_INVALID,
        ));
    }
    Ok(())
}
