//! Central classification of API failures.
//!
//! Every failure coming out of [`ApiClient`](super::client::ApiClient) is an
//! [`ApiError`]. UI-facing code only ever sees its [`ErrorKind`], its stable
//! [`code`](ApiError::code) and the French [`user_message`](ApiError::user_message).

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Stable code for requests blocked by force-offline. Callers match on it to
/// skip alerts.
pub const OFFLINE_ERROR_CODE: &str = "OFFLINE_MODE";

const MSG_NETWORK: &str =
    "Impossible de se connecter au serveur. Vérifiez votre connexion internet.";
const MSG_AUTHENTICATION: &str = "Votre session a expiré. Veuillez vous reconnecter.";
const MSG_VALIDATION: &str = "Les informations envoyées sont invalides. Veuillez les vérifier.";
const MSG_SERVER: &str = "Le serveur rencontre un problème. Veuillez réessayer plus tard.";
const MSG_UNKNOWN: &str = "Une erreur inattendue s'est produite. Veuillez réessayer.";
const MSG_OFFLINE: &str =
    "Vous êtes hors ligne. Vos modifications seront envoyées dès le retour de la connexion.";
const MSG_BAD_CREDENTIALS: &str = "Email ou mot de passe incorrect.";

/// Backend phrasings of a failed login, matched case-insensitively.
const CREDENTIAL_FAILURE_PATTERNS: [&str; 4] = [
    "no active account found",
    "unable to log in with provided credentials",
    "invalid credentials",
    "invalid email or password",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    Authentication,
    Validation,
    Server,
    Unknown,
    Offline,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request blocked: offline mode is enabled")]
    Offline,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Authentication failed ({status})")]
    Authentication { status: u16, body: Option<Value> },
    #[error("Request rejected ({status})")]
    Validation { status: u16, body: Option<Value> },
    #[error("Server error ({status})")]
    Server { status: u16, body: Option<Value> },
    #[error("Unexpected error: {0}")]
    Unknown(String),
}

impl ApiError {
    /// Classify a non-success HTTP status and its (optional) JSON body.
    pub fn from_status(status: u16, body: Option<Value>) -> Self {
        match status {
            401 | 403 => ApiError::Authentication { status, body },
            400..=499 => ApiError::Validation { status, body },
            500..=599 => ApiError::Server { status, body },
            _ => ApiError::Unknown(format!("unexpected status {}", status)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Offline => ErrorKind::Offline,
            ApiError::Network(_) => ErrorKind::Network,
            ApiError::Authentication { .. } => ErrorKind::Authentication,
            ApiError::Validation { .. } => ErrorKind::Validation,
            ApiError::Server { .. } => ErrorKind::Server,
            ApiError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Offline => OFFLINE_ERROR_CODE,
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::Authentication => "AUTH_ERROR",
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Server => "SERVER_ERROR",
            ErrorKind::Unknown => "UNKNOWN_ERROR",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Authentication { status, .. }
            | ApiError::Validation { status, .. }
            | ApiError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Offline short-circuits are expected and never logged or alerted.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, ApiError::Offline)
    }

    /// Message shown to the user. Backend-provided text wins when present.
    pub fn user_message(&self) -> String {
        let backend = match self {
            ApiError::Authentication { body, .. }
            | ApiError::Validation { body, .. }
            | ApiError::Server { body, .. } => body.as_ref().and_then(backend_message),
            _ => None,
        };

        if let Some(message) = backend {
            if is_credential_failure(&message) {
                return MSG_BAD_CREDENTIALS.to_string();
            }
            return message;
        }

        match self.kind() {
            ErrorKind::Offline => MSG_OFFLINE,
            ErrorKind::Network => MSG_NETWORK,
            ErrorKind::Authentication => MSG_AUTHENTICATION,
            ErrorKind::Validation => MSG_VALIDATION,
            ErrorKind::Server => MSG_SERVER,
            ErrorKind::Unknown => MSG_UNKNOWN,
        }
        .to_string()
    }

    /// Log through the central path. Offline errors are skipped.
    pub fn report(&self, context: &str) {
        if self.is_reportable() {
            log::error!("{} failed [{}]: {}", context, self.code(), self);
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Unknown(format!("invalid response body: {}", err))
        } else if let Some(status) = err.status() {
            ApiError::from_status(status.as_u16(), None)
        } else {
            // No HTTP response was received.
            ApiError::Network(err.to_string())
        }
    }
}

/// Pull a human-readable message out of a backend error body.
///
/// Looks at `detail`, `message`, `error`, then `non_field_errors` and finally
/// the first field error of a validation body (`{"email": ["..."]}`).
fn backend_message(body: &Value) -> Option<String> {
    if let Some(text) = body.as_str() {
        return non_empty(text);
    }
    let object = body.as_object()?;

    for field in ["detail", "message", "error"] {
        if let Some(text) = object.get(field).and_then(first_text) {
            return Some(text);
        }
    }
    if let Some(text) = object.get("non_field_errors").and_then(first_text) {
        return Some(text);
    }
    object.values().find_map(first_text)
}

fn first_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(s),
        Value::Array(items) => items.iter().find_map(first_text),
        _ => None,
    }
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn is_credential_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    CREDENTIAL_FAILURE_PATTERNS.iter().any(|p| lower.contains(p))
}
