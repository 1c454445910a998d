//! Injectable access to the handful of environment variables config
//! resolution consults, so tests can stub them instead of mutating the
//! real process environment.

/// Abstracts process-environment reads used by service-file and pgpass
/// resolution (`PGSERVICE`, `PGSERVICEFILE`, `PGSYSCONFDIR`, `PGPASSFILE`,
/// `PGPASSWORD`).
pub trait Environment {
    fn var(&self, name: &str) -> Option<String>;

    fn home_dir(&self) -> Option<std::path::PathBuf> {
        dirs::home_dir()
    }
}

/// Reads from the real process environment via [`std::env::var`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

#[cfg(test)]
pub(crate) struct StubEnvironment {
    pub vars: std::collections::HashMap<String, String>,
    pub home: Option<std::path::PathBuf>,
}

#[cfg(test)]
impl Environment for StubEnvironment {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }

    fn home_dir(&self) -> Option<std::path::PathBuf> {
        self.home.clone()
    }
}
