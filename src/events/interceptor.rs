//! Policy deciding which intercepted requests become published events

use super::ChangeEvent;
use regex::Regex;

/// Endpoints that never produce events: credential flows, not data changes
pub const DEFAULT_IGNORED_ENDPOINTS: &[&str] = &["resetPassword", "log(in|out)"];

/// Filters what the host request pipeline hands to the publisher.
///
/// Reads (GET) are never published, nor are requests whose endpoint
/// matches one of the ignore patterns.
#[derive(Debug, Clone)]
pub struct InterceptPolicy {
    ignored: Vec<Regex>,
}

impl InterceptPolicy {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let ignored = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { ignored })
    }

    pub fn should_publish(&self, event: &ChangeEvent) -> bool {
        event.method().is_mutation() && !self.ignored.iter().any(|re| re.is_match(event.endpoint()))
    }
}

impl Default for InterceptPolicy {
    fn default() -> Self {
        let ignored = DEFAULT_IGNORED_ENDPOINTS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self { ignored }
    }
}
