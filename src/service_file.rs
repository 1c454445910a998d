//! `pg_service.conf`-style service file resolution.
//!
//! Plain `std::fs` read plus manual line-by-line parsing, matching the
//! style already used for connection-string parsing elsewhere in this
//! crate rather than pulling in an INI crate for one small file format.

use std::path::{Path, PathBuf};

use crate::env::Environment;
use crate::error::{Error, Result};
use crate::uri::ConnectionUri;

/// Resolve the service file path per the standard lookup order:
/// `PGSERVICEFILE`, else `$PGSYSCONFDIR/pg_service.conf`, else
/// `~/.pg_service.conf`, else `/etc/pg_service.conf`.
pub fn resolve_path(env: &dyn Environment) -> Option<PathBuf> {
    if let Some(path) = env.var("PGSERVICEFILE") {
        return Some(PathBuf::from(path));
    }
    if let Some(dir) = env.var("PGSYSCONFDIR") {
        return Some(Path::new(&dir).join("pg_service.conf"));
    }
    if let Some(home) = env.home_dir() {
        let candidate = home.join(".pg_service.conf");
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    let system_wide = PathBuf::from("/etc/pg_service.conf");
    if system_wide.is_file() {
        return Some(system_wide);
    }
    None
}

/// Look up `service` in the file at `path` and merge its keys onto a
/// default [`ConnectionUri`]. `hostaddr`, if present, overrides `host`.
pub fn load_service(path: &Path, service: &str) -> Result<ConnectionUri> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("reading service file {}: {e}", path.display())))?;

    let mut uri = ConnectionUri::default();
    let mut in_section = false;
    let mut found = false;
    // `hostaddr` must win over `host` no matter which line comes first, so
    // it's held aside and applied once the whole section has been read.
    let mut hostaddr = None;

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            in_section = name == service;
            if in_section {
                found = true;
            }
            continue;
        }
        if !in_section {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key == "hostaddr" {
            hostaddr = Some(value.to_string());
            continue;
        }
        apply_key(&mut uri, key, value)?;
    }

    if !found {
        return Err(Error::Config(format!(
            "service '{service}' not found in {}",
            path.display()
        )));
    }

    if let Some(addr) = hostaddr {
        uri.host = addr;
    }

    Ok(uri)
}

fn apply_key(uri: &mut ConnectionUri, key: &str, value: &str) -> Result<()> {
    match key {
        "host" => uri.host = value.to_string(),
        "port" => {
            uri.port = value
                .parse()
                .map_err(|_| Error::Config(format!("invalid port in service file: {value}")))?;
        }
        "user" => uri.user = value.to_string(),
        "password" => uri.password = Some(value.to_string()),
        "dbname" => uri.dbname = value.to_string(),
        "sslmode" => uri.ssl_mode = crate::uri::SslMode::parse(value)?,
        "application_name" => uri.application_name = Some(value.to_string()),
        "options" => uri.options = Some(value.to_string()),
        _ => uri.params.push((key.to_string(), value.to_string())),
    }
    Ok(())
}
