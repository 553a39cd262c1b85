//! Course/action registry (C4): a static, read-only catalog loaded once at
//! startup and shared via `AppState`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A static catalog entry keyed by `course_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseDefinition {
    pub name: String,
    /// scheme + host, e.g. `https://booking.example-course.com`
    pub origin: String,
    pub client_id: String,
    pub website_id: String,
    pub scope: String,
    /// operation -> URL template
    pub actions: HashMap<String, String>,
    #[serde(default)]
    pub cancel_url_template: Option<String>,
    #[serde(default)]
    pub home_page_url: Option<String>,
    /// Template with a `{stage}` placeholder for this course's credential name
    #[serde(default)]
    pub secret_name_template: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    #[serde(rename = "course")]
    courses: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogEntry {
    id: String,
    #[serde(flatten)]
    definition: CourseDefinition,
}

/// Read-only registry, `Arc`-shared via `AppState` after a single load at
/// process startup.
#[derive(Debug, Clone)]
pub struct CourseRegistry {
    courses: HashMap<String, CourseDefinition>,
}

impl CourseRegistry {
    pub fn from_entries(courses: HashMap<String, CourseDefinition>) -> Self {
        Self { courses }
    }

    /// Load the catalog TOML file named by `Config::course_catalog_path`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigNotFound(format!(
                "course catalog not found at {}: {e}",
                path.display()
            ))
        })?;

        let parsed: CatalogFile = toml::from_str(&contents)
            .map_err(|e| Error::ConfigNotFound(format!("invalid course catalog: {e}")))?;

        let courses = parsed
            .courses
            .into_iter()
            .map(|entry| (entry.id, entry.definition))
            .collect();

        Ok(Self { courses })
    }

    pub fn get_course_by_id(&self, course_id: &str) -> Result<&CourseDefinition> {
        self.courses
            .get(course_id)
            .ok_or_else(|| Error::ConfigNotFound(format!("unknown course_id: {course_id}")))
    }

    /// Fully-qualified action URL: `course.origin` joined with the
    /// operation's template.
    pub fn get_action_url(&self, course_id: &str, operation: &str) -> Result<String> {
        let course = self.get_course_by_id(course_id)?;
        let template = course.actions.get(operation).ok_or_else(|| {
            Error::ConfigNotFound(format!(
                "course {course_id} has no action registered for operation {operation}"
            ))
        })?;

        if template.starts_with("http://") || template.starts_with("https://") {
            Ok(template.clone())
        } else {
            Ok(format!(
                "{}/{}",
                course.origin.trim_end_matches('/'),
                template.trim_start_matches('/')
            ))
        }
    }

    /// Every course origin in the catalog, for building an HTTP client
    /// allowlist at startup.
    pub fn hosts(&self) -> Vec<String> {
        self.courses.values().map(|c| c.origin.clone()).collect()
    }

    /// The credential key for this course at the given stage.
    pub fn get_secret_name(&self, course_id: &str, stage: &str) -> Result<String> {
        let course = self.get_course_by_id(course_id)?;
        let template = course.secret_name_template.as_deref().ok_or_else(|| {
            Error::ConfigNotFound(format!(
                "course {course_id} has no secret_name_template configured"
            ))
        })?;
        Ok(template.replace("{stage}", stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CourseRegistry {
        let mut actions = HashMap::new();
        actions.insert("lock".to_string(), "/api/v2/lock".to_string());

        let mut courses = HashMap::new();
        courses.insert(
            "pebble-beach".to_string(),
            CourseDefinition {
                name: "Pebble Beach".to_string(),
                origin: "https://booking.pebblebeach.example".to_string(),
                client_id: "client-1".to_string(),
                website_id: "web-1".to_string(),
                scope: "tee-times".to_string(),
                actions,
                cancel_url_template: None,
                home_page_url: None,
                secret_name_template: Some("relay/{stage}/pebble-beach".to_string()),
            },
        );

        CourseRegistry::from_entries(courses)
    }

    #[test]
    fn test_get_course_by_id_hit() {
        let reg = registry();
        assert!(reg.get_course_by_id("pebble-beach").is_ok());
    }

    #[test]
    fn test_get_course_by_id_miss_is_config_not_found() {
        let reg = registry();
        let err = reg.get_course_by_id("nonexistent").unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }

    #[test]
    fn test_get_action_url_joins_origin_and_template() {
        let reg = registry();
        let url = reg.get_action_url("pebble-beach", "lock").unwrap();
        assert_eq!(url, "https://booking.pebblebeach.example/api/v2/lock");
    }

    #[test]
    fn test_get_action_url_unknown_operation() {
        let reg = registry();
        let err = reg.get_action_url("pebble-beach", "unknown-op").unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }

    #[test]
    fn test_get_secret_name_interpolates_stage() {
        let reg = registry();
        let name = reg.get_secret_name("pebble-beach", "prod").unwrap();
        assert_eq!(name, "relay/prod/pebble-beach");
    }
}
