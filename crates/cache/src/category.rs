use configuration::CacheSettings;
use std::collections::HashMap;
use std::time::Duration;

/// Cache categories. Each owns a key prefix and a default TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    Schema,
    Widget,
    Theme,
    Content,
    Media,
    Setting,
    User,
    Session,
    Api,
    /// Repository read-through results.
    Query,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 10] = [
        CacheCategory::Schema,
        CacheCategory::Widget,
        CacheCategory::Theme,
        CacheCategory::Content,
        CacheCategory::Media,
        CacheCategory::Setting,
        CacheCategory::User,
        CacheCategory::Session,
        CacheCategory::Api,
        CacheCategory::Query,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            CacheCategory::Schema => "schema",
            CacheCategory::Widget => "widget",
            CacheCategory::Theme => "theme",
            CacheCategory::Content => "content",
            CacheCategory::Media => "media",
            CacheCategory::Setting => "setting",
            CacheCategory::User => "user",
            CacheCategory::Session => "session",
            CacheCategory::Api => "api",
            CacheCategory::Query => "query",
        }
    }

    pub fn default_ttl(&self) -> Duration {
        let secs = match self {
            CacheCategory::Schema | CacheCategory::Widget | CacheCategory::Setting => 600,
            CacheCategory::Theme | CacheCategory::Media | CacheCategory::Api => 300,
            CacheCategory::Content => 180,
            CacheCategory::User | CacheCategory::Query => 60,
            CacheCategory::Session => 86_400,
        };
        Duration::from_secs(secs)
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.prefix() == prefix)
    }

    /// Builds `"<prefix>:<part>:<part>…"`.
    pub fn key<S: AsRef<str>>(&self, parts: &[S]) -> String {
        let mut key = String::from(self.prefix());
        for part in parts {
            key.push(':');
            key.push_str(part.as_ref());
        }
        key
    }
}

/// Effective TTL per category: defaults overlaid with configured overrides.
#[derive(Debug, Clone, Default)]
pub struct CategoryTtls {
    overrides: HashMap<CacheCategory, Duration>,
}

impl CategoryTtls {
    pub fn from_settings(settings: &CacheSettings) -> Self {
        let mut overrides = HashMap::new();
        for (name, secs) in &settings.ttl {
            match CacheCategory::from_prefix(name) {
                Some(category) => {
                    overrides.insert(category, Duration::from_secs(*secs));
                }
                None => tracing::warn!(category = %name, "Ignoring TTL override for unknown cache category"),
            }
        }
        Self { overrides }
    }

    pub fn with_override(mut self, category: CacheCategory, ttl: Duration) -> Self {
        self.overrides.insert(category, ttl);
        self
    }

    pub fn ttl(&self, category: CacheCategory) -> Duration {
        self.overrides
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_ttl())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_carry_category_prefix() {
        assert_eq!(CacheCategory::Widget.key(&["active", "all"]), "widget:active:all");
        assert_eq!(
            CacheCategory::Content.key(&["structure", "flat", "ab12"]),
            "content:structure:flat:ab12"
        );
        assert_eq!(CacheCategory::Schema.key::<&str>(&[]), "schema");
    }

    #[test]
    fn overrides_replace_defaults() {
        let mut settings = CacheSettings::default();
        settings.ttl.insert("widget".into(), 5);
        settings.ttl.insert("bogus".into(), 1);

        let ttls = CategoryTtls::from_settings(&settings);
        assert_eq!(ttls.ttl(CacheCategory::Widget), Duration::from_secs(5));
        assert_eq!(ttls.ttl(CacheCategory::Session), Duration::from_secs(86_400));
    }

    #[test]
    fn prefixes_are_unique() {
        for category in CacheCategory::ALL {
            assert_eq!(CacheCategory::from_prefix(category.prefix()), Some(category));
        }
    }
}
