//! `.pgpass` password file lookup.
//!
//! Grounded on sqlx's `postgres::options::pgpass` module: same lookup order
//! (`PGPASSFILE` env var, else a platform home-directory default), same
//! colon-delimited `host:port:db:user:password` line format with `*`
//! wildcards and backslash escaping, and the same POSIX permission check.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use crate::env::Environment;

/// Look up a password for `(host, port, dbname, user)` using `PGPASSFILE`
/// or the default `.pgpass` location. Returns `None` on any miss: file
/// absent, no matching line, or (on POSIX) the file has overly permissive
/// mode bits.
pub fn load_password(
    env: &dyn Environment,
    host: &str,
    port: u16,
    dbname: &str,
    user: &str,
) -> Option<String> {
    let path = pgpass_path(env)?;
    load_password_from_file(&path, host, port, dbname, user)
}

fn pgpass_path(env: &dyn Environment) -> Option<PathBuf> {
    if let Some(path) = env.var("PGPASSFILE") {
        return Some(PathBuf::from(path));
    }
    let home = env.home_dir()?;
    if cfg!(windows) {
        Some(home.join("AppData/Roaming/postgres/pgpass.conf"))
    } else {
        Some(home.join(".pgpass"))
    }
}

fn load_password_from_file(
    path: &Path,
    host: &str,
    port: u16,
    dbname: &str,
    user: &str,
) -> Option<String> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(path).ok()?;
        if !metadata.is_file() {
            return None;
        }
        if metadata.permissions().mode() & 0o077 != 0 {
            tracing::warn!(path = %path.display(), "ignoring pgpass file with overly permissive mode");
            return None;
        }
    }

    let file = std::fs::File::open(path).ok()?;
    load_password_from_reader(std::io::BufReader::new(file), host, port, dbname, user)
}

fn load_password_from_reader<R: BufRead>(
    reader: R,
    host: &str,
    port: u16,
    dbname: &str,
    user: &str,
) -> Option<String> {
    let port = port.to_string();
    for line in reader.lines() {
        let line = line.ok()?;
        let line = trim_newline(&line);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(password) = load_password_from_line(line, host, &port, dbname, user) {
            return Some(password);
        }
    }
    None
}

fn trim_newline(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

fn load_password_from_line<'a>(
    line: &'a str,
    host: &str,
    port: &str,
    dbname: &str,
    user: &str,
) -> Option<String> {
    let (field_host, rest) = find_next_field(line)?;
    if !matches_next_field(field_host, host) {
        return None;
    }
    let (field_port, rest) = find_next_field(rest)?;
    if !matches_next_field(field_port, port) {
        return None;
    }
    let (field_db, rest) = find_next_field(rest)?;
    if !matches_next_field(field_db, dbname) {
        return None;
    }
    let (field_user, rest) = find_next_field(rest)?;
    if !matches_next_field(field_user, user) {
        return None;
    }
    Some(unescape(rest))
}

fn matches_next_field(field: &str, value: &str) -> bool {
    field == "*" || field == value
}

/// Split the next `:`-delimited field off `line`, honoring `\:` and `\\`
/// escapes. Returns the raw (still-escaped) field and the remainder.
fn find_next_field(line: &str) -> Option<(&str, &str)> {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() => i += 2,
            b':' => return Some((&line[..i], &line[i + 1..])),
            _ => i += 1,
        }
    }
    None
}

fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
                continue;
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_simple_field() {
        assert_eq!(find_next_field("host:5432:db:user:pass"), Some(("host", "5432:db:user:pass")));
    }

    #[test]
    fn finds_field_with_escape() {
        assert_eq!(find_next_field(r"ho\:st:5432"), Some((r"ho\:st", "5432")));
    }

    #[test]
    fn unescapes_colon_and_backslash() {
        assert_eq!(unescape(r"pa\:ss\\word"), r"pa:ss\word");
    }

    #[test]
    fn matches_exact_and_wildcard() {
        assert!(matches_next_field("*", "anything"));
        assert!(matches_next_field("exact", "exact"));
        assert!(!matches_next_field("exact", "other"));
    }

    #[test]
    fn loads_password_from_matching_line() {
        let data = "localhost:5432:mydb:alice:s3cret\n";
        let password =
            load_password_from_reader(data.as_bytes(), "localhost", 5432, "mydb", "alice");
        assert_eq!(password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn wildcards_match_any_field() {
        let data = "*:*:*:*:wildcard-pass\n";
        let password = load_password_from_reader(data.as_bytes(), "h", 1, "d", "u");
        assert_eq!(password.as_deref(), Some("wildcard-pass"));
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let data = "# comment\n\nlocalhost:5432:mydb:alice:s3cret\n";
        let password =
            load_password_from_reader(data.as_bytes(), "localhost", 5432, "mydb", "alice");
        assert_eq!(password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn non_matching_line_falls_through() {
        let data = "otherhost:5432:mydb:alice:nope\nlocalhost:5432:mydb:alice:yes\n";
        let password =
            load_password_from_reader(data.as_bytes(), "localhost", 5432, "mydb", "alice");
        assert_eq!(password.as_deref(), Some("yes"));
    }

    #[test]
    fn handles_crlf_line_endings() {
        let data = "localhost:5432:mydb:alice:s3cret\r\n";
        let password =
            load_password_from_reader(data.as_bytes(), "localhost", 5432, "mydb", "alice");
        assert_eq!(password.as_deref(), Some("s3cret"));
    }
}
