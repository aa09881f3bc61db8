use chrono::{DateTime, Utc};

use crate::config::Config;

/// `Set-Cookie` attributes for the session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieSettings {
    /// Cookie name
    pub name: String,
    /// Explicit cookie path
    pub path: Option<String>,
    /// Request header to take the path from when `path` is unset
    pub path_header: Option<String>,
    /// Cookie domain
    pub domain: Option<String>,
    /// `Secure` flag
    pub secure: bool,
    /// `HttpOnly` flag
    pub httponly: bool,
    /// Emit `Expires`; a non-persistent cookie lasts until the browser closes
    pub persistent: bool,
    /// `SameSite` value
    pub samesite: Option<String>,
}

impl Default for CookieSettings {
    fn default() -> Self {
        Self {
            name: "session_id".to_string(),
            path: None,
            path_header: None,
            domain: None,
            secure: false,
            httponly: true,
            persistent: true,
            samesite: None,
        }
    }
}

impl CookieSettings {
    /// Read the cookie attributes under `tools.sessions.*`
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        Self {
            name: config.get_or("tools.sessions.name", defaults.name),
            path: config.get_opt("tools.sessions.path"),
            path_header: config.get_opt("tools.sessions.path_header"),
            domain: config.get_opt("tools.sessions.domain"),
            secure: config.get_or("tools.sessions.secure", defaults.secure),
            httponly: config.get_or("tools.sessions.httponly", defaults.httponly),
            persistent: config.get_or("tools.sessions.persistent", defaults.persistent),
            samesite: config.get_opt("tools.sessions.samesite"),
        }
    }

    /// Cookie path: explicit path, else the `path_header` value, else `/`
    #[must_use]
    pub fn resolve_path(&self, header_value: Option<&str>) -> String {
        self.path
            .clone()
            .or_else(|| header_value.filter(|v| !v.is_empty()).map(str::to_string))
            .unwrap_or_else(|| "/".to_string())
    }

    fn attributes(&self, out: &mut String) {
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.httponly {
            out.push_str("; HttpOnly");
        }
        if let Some(samesite) = &self.samesite {
            out.push_str("; SameSite=");
            out.push_str(samesite);
        }
    }
}

/// RFC 1123 date in GMT, as used by `Expires`
#[must_use]
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// `Set-Cookie` value carrying `id`
#[must_use]
pub fn set_cookie_header(
    settings: &CookieSettings,
    id: &str,
    timeout: chrono::Duration,
    path: &str,
    now: DateTime<Utc>,
) -> String {
    let mut out = format!("{}={}; Path={}", settings.name, id, path);
    if settings.persistent {
        out.push_str("; Expires=");
        out.push_str(&http_date(now + timeout));
    }
    settings.attributes(&mut out);
    out
}

/// `Set-Cookie` value that makes the client drop the cookie
#[must_use]
pub fn expired_cookie_header(
    settings: &CookieSettings,
    id: &str,
    path: &str,
    now: DateTime<Utc>,
) -> String {
    let mut out = format!(
        "{}={}; Path={}; Expires={}",
        settings.name,
        id,
        path,
        http_date(now - chrono::Duration::days(365))
    );
    settings.attributes(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_default_cookie() {
        let header = set_cookie_header(
            &CookieSettings::default(),
            "abc",
            chrono::Duration::minutes(60),
            "/",
            noon(),
        );
        assert_eq!(
            header,
            "session_id=abc; Path=/; Expires=Wed, 01 May 2024 13:00:00 GMT; HttpOnly"
        );
    }

    #[test]
    fn test_non_persistent_with_attributes() {
        let settings = CookieSettings {
            name: "sid".to_string(),
            domain: Some("example.org".to_string()),
            secure: true,
            httponly: false,
            persistent: false,
            samesite: Some("Lax".to_string()),
            ..CookieSettings::default()
        };
        let header = set_cookie_header(&settings, "x", chrono::Duration::minutes(1), "/app", noon());
        assert_eq!(header, "sid=x; Path=/app; Domain=example.org; Secure; SameSite=Lax");
    }

    #[test]
    fn test_path_resolution() {
        let mut settings = CookieSettings {
            path_header: Some("x-script-name".to_string()),
            ..CookieSettings::default()
        };
        assert_eq!(settings.resolve_path(Some("/mounted")), "/mounted");
        assert_eq!(settings.resolve_path(None), "/");
        settings.path = Some("/fixed".to_string());
        assert_eq!(settings.resolve_path(Some("/mounted")), "/fixed");
    }

    #[test]
    fn test_expired_cookie_is_in_the_past() {
        let header = expired_cookie_header(&CookieSettings::default(), "abc", "/", noon());
        assert!(header.starts_with("session_id=abc; Path=/; Expires=Tue, 02 May 2023"));
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.set("tools.sessions.name", "sid");
        config.set("tools.sessions.httponly", "false");
        config.set("tools.sessions.persistent", false);
        let settings = CookieSettings::from_config(&config);
        assert_eq!(settings.name, "sid");
        assert!(!settings.httponly);
        assert!(!settings.persistent);
    }
}
