//! Perl DBI-style DSN compatibility: `DBI:Pg:key=value;key=value;...`.
//!
//! No grounding source in the retrieved pack implements this; built directly
//! from the wire-format description, translating the recognized keys onto
//! [`ConnectionUri`] the same way [`crate::uri::ConnectionUri::try_from`]
//! does for URLs.

use crate::error::{Error, Result};
use crate::uri::ConnectionUri;

const PREFIX: &str = "DBI:Pg:";

/// Returns true if `s` looks like a DBI-style DSN rather than a URL.
pub fn looks_like_dsn(s: &str) -> bool {
    s.starts_with(PREFIX)
}

/// Parse `DBI:Pg:host=...;port=...;user=...;password=...;dbname=...` into a
/// [`ConnectionUri`]. Unrecognized keys are dropped: DBI's key set predates
/// and does not map onto this engine's startup parameters.
pub fn parse(s: &str) -> Result<ConnectionUri> {
    let body = s
        .strip_prefix(PREFIX)
        .ok_or_else(|| Error::Config(format!("not a DBI:Pg DSN: {s}")))?;

    let mut uri = ConnectionUri::default();

    for pair in body.split(';').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("malformed DSN segment: {pair}")))?;
        match key {
            "host" => uri.host = value.to_string(),
            "port" => {
                uri.port = value
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid DSN port: {value}")))?;
            }
            "user" | "username" => uri.user = value.to_string(),
            "password" => uri.password = Some(value.to_string()),
            "dbname" | "database" => uri.dbname = value.to_string(),
            _ => {}
        }
    }

    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_dsn() {
        let uri = parse("DBI:Pg:host=db.example.com;port=5433;user=alice;password=secret;dbname=app").unwrap();
        assert_eq!(uri.host, "db.example.com");
        assert_eq!(uri.port, 5433);
        assert_eq!(uri.user, "alice");
        assert_eq!(uri.password.as_deref(), Some("secret"));
        assert_eq!(uri.dbname, "app");
    }

    #[test]
    fn rejects_non_dbi_string() {
        assert!(parse("postgresql://localhost/db").is_err());
    }

    #[test]
    fn recognizes_dsn_prefix() {
        assert!(looks_like_dsn("DBI:Pg:host=localhost"));
        assert!(!looks_like_dsn("postgresql://localhost/db"));
    }
}
