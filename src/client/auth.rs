//! Authentication helpers.
//!
//! Sessions carry at most one credential; setting a new one replaces the
//! old. Only the `Authorization` header value is derived here.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Session authentication configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl Auth {
    /// Render the `Authorization` header value.
    pub fn header_value(&self) -> String {
        match self {
            Auth::Basic { username, password } => {
                let credentials = format!("{}:{}", username, password);
                format!("Basic {}", BASE64.encode(credentials.as_bytes()))
            }
            Auth::Bearer { token } => format!("Bearer {}", token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_auth_header() {
        let auth = Auth::Basic {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        // base64("user:pass")
        assert_eq!(auth.header_value(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn test_basic_auth_empty_password() {
        let auth = Auth::Basic {
            username: "user".to_string(),
            password: String::new(),
        };
        assert_eq!(auth.header_value(), "Basic dXNlcjo=");
    }

    #[test]
    fn test_bearer_header() {
        let auth = Auth::Bearer {
            token: "abc123".to_string(),
        };
        assert_eq!(auth.header_value(), "Bearer abc123");
    }
}
