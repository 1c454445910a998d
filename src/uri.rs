//! Connection URI: the fully-resolved shape the engine consumes.
//!
//! Covers the full set of libpq-style fields the engine needs, stripped of
//! pool-sizing knobs, which are an external collaborator's concern, not the
//! engine's.

use no_panic::no_panic;
use url::Url;

use crate::error::{Error, Result};

/// SSL connection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Don't use SSL.
    Disable,
    /// Try SSL, fall back to unencrypted if the server declines.
    #[default]
    Prefer,
    /// Require SSL; fail if the server declines.
    Require,
}

impl SslMode {
    pub(crate) fn parse(value: &str) -> Result<Self> {
        match value {
            "disable" => Ok(SslMode::Disable),
            "allow" | "prefer" => Ok(SslMode::Prefer),
            "require" | "verify-ca" | "verify-full" => Ok(SslMode::Require),
            other => Err(Error::Config(format!("invalid sslmode: {other}"))),
        }
    }
}

/// A fully-resolved PostgreSQL connection target.
///
/// Produced by [`resolve`] from a URL, a `DBI:Pg:...` DSN, or a service-file
/// entry, each normalized to this same shape before the engine sees it.
#[derive(Debug, Clone)]
pub struct ConnectionUri {
    /// Hostname, IP address, UNIX socket directory, or empty for the default socket.
    pub host: String,
    /// TCP port / UNIX socket suffix.
    pub port: u16,
    /// Username for authentication. Defaults to `"postgres"`.
    pub user: String,
    /// Password, if supplied directly on the URI.
    pub password: Option<String>,
    /// Database name. Defaults to `user` if unset.
    pub dbname: String,
    /// SSL negotiation mode.
    pub ssl_mode: SslMode,
    /// `application_name` startup parameter.
    pub application_name: Option<String>,
    /// `fallback_application_name`, used only if `application_name` is unset.
    pub fallback_application_name: Option<String>,
    /// Raw `keepalives` value, passed through unexamined.
    pub keepalives: Option<String>,
    /// Raw `options` value (extra `-c` style server settings).
    pub options: Option<String>,
    /// Raw `replication` value (`"true"`, `"false"`, `"database"`).
    pub replication: Option<String>,
    /// Any other query parameters, passed through as startup parameters.
    pub params: Vec<(String, String)>,
}

impl Default for ConnectionUri {
    #[no_panic]
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            dbname: "postgres".to_string(),
            ssl_mode: SslMode::Prefer,
            application_name: None,
            fallback_application_name: None,
            keepalives: None,
            options: None,
            replication: None,
            params: Vec::new(),
        }
    }
}

impl ConnectionUri {
    /// Startup-message parameters this URI implies, beyond `user`/`database`.
    pub fn startup_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        let app_name = self
            .application_name
            .as_deref()
            .or(self.fallback_application_name.as_deref());
        if let Some(name) = app_name {
            params.push(("application_name".to_string(), name.to_string()));
        }
        if let Some(options) = &self.options {
            params.push(("options".to_string(), options.clone()));
        }
        if let Some(replication) = &self.replication {
            params.push(("replication".to_string(), replication.clone()));
        }
        params.extend(self.params.iter().cloned());
        params
    }
}

impl TryFrom<&Url> for ConnectionUri {
    type Error = Error;

    /// Parse `postgresql://[user[:password]@][host][:port]/[dbname][?k=v&...]`.
    fn try_from(url: &Url) -> Result<Self> {
        if !["postgres", "postgresql"].contains(&url.scheme()) {
            return Err(Error::Config(format!(
                "invalid scheme: expected 'postgres://' or 'postgresql://', got '{}://'",
                url.scheme()
            )));
        }

        let user = {
            let u = url.username();
            if u.is_empty() {
                "postgres".to_string()
            } else {
                u.to_string()
            }
        };

        let dbname = url
            .path()
            .strip_prefix('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| user.clone());

        let mut uri = ConnectionUri {
            host: url.host_str().unwrap_or("").to_string(),
            port: url.port().unwrap_or(5432),
            password: url.password().map(str::to_string),
            dbname,
            user,
            ..ConnectionUri::default()
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "sslmode" => uri.ssl_mode = SslMode::parse(&value)?,
                "application_name" => uri.application_name = Some(value.to_string()),
                "fallback_application_name" => {
                    uri.fallback_application_name = Some(value.to_string());
                }
                "keepalives" => uri.keepalives = Some(value.to_string()),
                "options" => uri.options = Some(value.to_string()),
                "replication" => uri.replication = Some(value.to_string()),
                _ => uri.params.push((key.to_string(), value.to_string())),
            }
        }

        Ok(uri)
    }
}

impl TryFrom<&str> for ConnectionUri {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        let url = Url::parse(s).map_err(|e| Error::Config(format!("invalid URL: {e}")))?;
        Self::try_from(&url)
    }
}

/// Turn a user-supplied connection string and the process environment into
/// a fully-populated [`ConnectionUri`].
///
/// `target` is tried, in order, as: a `postgres://`/`postgresql://` URL, a
/// `DBI:Pg:` DSN, or (falling through) a bare service name looked up in the
/// resolved service file. Whichever branch produces the URI, a missing
/// password is filled in afterward via [`crate::engine::auth::resolve_password`].
pub fn resolve(target: &str, env: &dyn crate::env::Environment) -> Result<ConnectionUri> {
    let mut uri = if target.starts_with("postgres://") || target.starts_with("postgresql://") {
        ConnectionUri::try_from(target)?
    } else if crate::dsn::looks_like_dsn(target) {
        crate::dsn::parse(target)?
    } else {
        let path = crate::service_file::resolve_path(env)
            .ok_or_else(|| Error::Config("no service file found to resolve service name".to_string()))?;
        crate::service_file::load_service(&path, target)?
    };

    if uri.password.is_none() {
        uri.password = crate::engine::auth::resolve_password(env, &uri);
    }

    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_uri() {
        let uri = ConnectionUri::try_from("postgresql://localhost/mydb").unwrap();
        assert_eq!(uri.host, "localhost");
        assert_eq!(uri.port, 5432);
        assert_eq!(uri.user, "postgres");
        assert_eq!(uri.dbname, "mydb");
    }

    #[test]
    fn defaults_dbname_to_user() {
        let uri = ConnectionUri::try_from("postgresql://alice@db.example.com:6543/").unwrap();
        assert_eq!(uri.user, "alice");
        assert_eq!(uri.dbname, "alice");
        assert_eq!(uri.port, 6543);
    }

    #[test]
    fn parses_query_params() {
        let uri = ConnectionUri::try_from(
            "postgresql://u:p@h/db?sslmode=require&application_name=app&foo=bar",
        )
        .unwrap();
        assert_eq!(uri.ssl_mode, SslMode::Require);
        assert_eq!(uri.application_name.as_deref(), Some("app"));
        assert_eq!(uri.password.as_deref(), Some("p"));
        assert_eq!(uri.params, vec![("foo".to_string(), "bar".to_string())]);
    }

    #[test]
    fn rejects_bad_sslmode() {
        let err = ConnectionUri::try_from("postgresql://h/db?sslmode=bogus").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_wrong_scheme() {
        let err = ConnectionUri::try_from("mysql://h/db").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
