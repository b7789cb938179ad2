//! Auth slice.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub email: Option<String>,
    pub is_authenticated: bool,
    /// Refresh failed; the app is read-only until the next login.
    pub session_expired: bool,

    #[serde(skip)]
    pub loading: bool,
    #[serde(skip)]
    pub error: Option<String>,
}

impl AuthState {
    pub fn logged_in(email: &str) -> Self {
        Self {
            email: Some(email.to_string()),
            is_authenticated: true,
            ..Self::default()
        }
    }

    pub fn mark_session_expired(&mut self) {
        self.session_expired = true;
        self.is_authenticated = false;
    }
}
