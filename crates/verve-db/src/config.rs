//! Connection settings for the task store.

use std::env;

/// Pool size used when nothing else is configured. The store's queries are
/// short single-row statements; claim long-polls do not hold connections.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

const DEFAULT_URL: &str = "postgresql://localhost:5432/verve";

/// Settings for the Postgres-backed store.
///
/// `notify_channel` names the Postgres NOTIFY channel that bridges broker
/// events between server replicas; `None` keeps events in-process only.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub notify_channel: Option<String>,
}

impl DbConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            notify_channel: None,
        }
    }

    /// Read settings from `VERVE_DATABASE_URL`, `VERVE_DB_MAX_CONNECTIONS`,
    /// and `VERVE_EVENTS_CHANNEL`, with defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::new(
            env::var("VERVE_DATABASE_URL").unwrap_or_else(|_| DEFAULT_URL.to_owned()),
        );
        if let Some(n) = env::var("VERVE_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.max_connections = n;
        }
        config.notify_channel = env::var("VERVE_EVENTS_CHANNEL").ok().filter(|c| !c.is_empty());
        config
    }

    pub fn with_notify_channel(mut self, channel: impl Into<String>) -> Self {
        self.notify_channel = Some(channel.into());
        self
    }

    /// The default connection URL.
    pub fn default_url() -> &'static str {
        DEFAULT_URL
    }

    /// Server half and database name of the URL, when it has a path.
    /// `postgresql://host:5432` (no database) yields `None`.
    fn split_url(&self) -> Option<(&str, &str)> {
        let rest = self.database_url.splitn(2, "://").nth(1)?;
        let slash = rest.rfind('/')?;
        let name = &rest[slash + 1..];
        if name.is_empty() {
            return None;
        }
        let server_len = self.database_url.len() - rest.len() + slash;
        Some((&self.database_url[..server_len], name))
    }

    /// Name of the target database, if the URL carries one.
    pub fn database_name(&self) -> Option<&str> {
        self.split_url().map(|(_, name)| name)
    }

    /// URL of the `postgres` admin database on the same server, used to
    /// create the target database when it does not exist yet.
    pub fn admin_url(&self) -> String {
        match self.split_url() {
            Some((server, _)) => format!("{server}/postgres"),
            None => format!("{}/postgres", self.database_url.trim_end_matches('/')),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_has_no_bridge_and_default_pool_size() {
        let cfg = DbConfig::new("postgresql://db.internal:5432/dispatch");
        assert_eq!(cfg.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(cfg.notify_channel.is_none());
    }

    #[test]
    fn splits_server_and_database() {
        let cfg = DbConfig::new("postgresql://db.internal:5432/dispatch");
        assert_eq!(cfg.database_name(), Some("dispatch"));
        assert_eq!(cfg.admin_url(), "postgresql://db.internal:5432/postgres");
    }

    #[test]
    fn url_without_database_name() {
        let cfg = DbConfig::new("postgresql://localhost:5432");
        assert_eq!(cfg.database_name(), None);
        assert_eq!(cfg.admin_url(), "postgresql://localhost:5432/postgres");
    }

    #[test]
    fn notify_channel_builder() {
        let cfg = DbConfig::new(DbConfig::default_url()).with_notify_channel("verve_events");
        assert_eq!(cfg.notify_channel.as_deref(), Some("verve_events"));
    }
}
