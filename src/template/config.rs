use crate::core::{DbError, ReadPreference, Result, WriteConcern};

/// What to do with the outcome of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteResultChecking {
    /// Accept whatever the store reports.
    #[default]
    None,
    /// Force acknowledged writes and reject unacknowledged results.
    Exception,
}

impl WriteResultChecking {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "exception" => Some(Self::Exception),
            _ => None,
        }
    }
}

/// Template configuration
///
/// Defaults applied to every operation unless a query or resolver overrides them.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateConfig {
    /// Store address, informational; connections are owned by the driver
    pub host: String,

    /// Database name
    pub database: String,

    /// Read preference used when a query does not carry its own
    pub read_preference: ReadPreference,

    /// Connection default write concern handed to the write-concern resolver
    pub write_concern: Option<WriteConcern>,

    pub write_result_checking: WriteResultChecking,

    /// Publish lifecycle events to the configured publisher
    pub entity_lifecycle_events: bool,

    /// Apply the version predicate to find-and-replace of versioned entities
    pub versioned_find_and_replace: bool,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self::new("test")
    }
}

impl TemplateConfig {
    pub fn new(database: &str) -> Self {
        Self {
            host: "localhost:27017".to_string(),
            database: database.to_string(),
            read_preference: ReadPreference::Primary,
            write_concern: None,
            write_result_checking: WriteResultChecking::None,
            entity_lifecycle_events: true,
            versioned_find_and_replace: false,
        }
    }

    pub fn database(mut self, database: &str) -> Self {
        self.database = database.to_string();
        self
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = read_preference;
        self
    }

    pub fn write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = Some(write_concern);
        self
    }

    pub fn write_result_checking(mut self, checking: WriteResultChecking) -> Self {
        self.write_result_checking = checking;
        self
    }

    pub fn entity_lifecycle_events(mut self, enabled: bool) -> Self {
        self.entity_lifecycle_events = enabled;
        self
    }

    pub fn versioned_find_and_replace(mut self, enabled: bool) -> Self {
        self.versioned_find_and_replace = enabled;
        self
    }

    /// Parse from connection string
    ///
    /// Format: "docdb://host:port/database?option=value&..."
    ///
    /// Recognized options: `w`, `journal`, `wtimeoutMS`, `readPreference`,
    /// `writeResultChecking`, `lifecycleEvents`, `versionedFindAndReplace`.
    ///
    /// # Examples
    ///
    /// ```
    /// use rustdocmap::template::{TemplateConfig, WriteResultChecking};
    ///
    /// let config = TemplateConfig::from_url(
    ///     "docdb://localhost:27017/shop?w=majority&writeResultChecking=exception",
    /// )
    /// .unwrap();
    /// assert_eq!(config.database, "shop");
    /// assert_eq!(config.write_result_checking, WriteResultChecking::Exception);
    /// ```
    pub fn from_url(url: &str) -> Result<Self> {
        let Some(rest) = url.strip_prefix("docdb://") else {
            return Err(DbError::InvalidUsage("URL must start with 'docdb://'".to_string()));
        };

        let (location, options) = match rest.split_once('?') {
            Some((location, options)) => (location, Some(options)),
            None => (rest, None),
        };
        let Some((host, database)) = location.split_once('/') else {
            return Err(DbError::InvalidUsage("Invalid host/database format".to_string()));
        };
        if host.is_empty() || database.is_empty() {
            return Err(DbError::InvalidUsage("Invalid host/database format".to_string()));
        }

        let mut config = Self::new(database).host(host);
        let mut journal = None;
        let mut w_timeout_ms = None;

        for pair in options.into_iter().flat_map(|o| o.split('&')).filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(DbError::InvalidUsage(format!("Invalid option '{}'", pair)));
            };
            match key {
                "w" => {
                    config.write_concern = Some(WriteConcern::parse(value).ok_or_else(|| {
                        DbError::InvalidUsage(format!("Invalid write concern '{}'", value))
                    })?)
                }
                "journal" => journal = Some(parse_bool(key, value)?),
                "wtimeoutMS" => {
                    w_timeout_ms = Some(value.parse::<u64>().map_err(|_| {
                        DbError::InvalidUsage(format!("Invalid wtimeoutMS '{}'", value))
                    })?)
                }
                "readPreference" => {
                    config.read_preference = ReadPreference::parse(value).ok_or_else(|| {
                        DbError::InvalidUsage(format!("Invalid read preference '{}'", value))
                    })?
                }
                "writeResultChecking" => {
                    config.write_result_checking =
                        WriteResultChecking::parse(value).ok_or_else(|| {
                            DbError::InvalidUsage(format!(
                                "Invalid write result checking '{}'",
                                value
                            ))
                        })?
                }
                "lifecycleEvents" => config.entity_lifecycle_events = parse_bool(key, value)?,
                "versionedFindAndReplace" => {
                    config.versioned_find_and_replace = parse_bool(key, value)?
                }
                other => {
                    return Err(DbError::InvalidUsage(format!("Unknown option '{}'", other)));
                }
            }
        }

        if journal.is_some() || w_timeout_ms.is_some() {
            let concern = config.write_concern.get_or_insert_with(WriteConcern::default);
            concern.journal = journal.or(concern.journal);
            concern.w_timeout_ms = w_timeout_ms.or(concern.w_timeout_ms);
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.is_empty() {
            return Err(DbError::InvalidUsage("Database name cannot be empty".to_string()));
        }
        if self.database.contains(['/', '.', ' ', '$']) {
            return Err(DbError::InvalidUsage(format!(
                "Database name '{}' contains invalid characters",
                self.database
            )));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(DbError::InvalidUsage(format!(
            "Option '{}' expects true or false, got '{}'",
            key, value
        ))),
    }
}
