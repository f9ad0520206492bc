use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Credentials and defaults for one help-desk organization/department.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub profile_name: String,
    pub org_id: String,
    pub default_department_id: String,
    #[serde(default)]
    pub from_email_address: Option<String>,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
}

/// The public view of a profile. Credentials never leave the server.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub profile_name: String,
    pub org_id: String,
    pub default_department_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_email_address: Option<String>,
}

impl Profile {
    pub fn sanitized(&self) -> PublicProfile {
        PublicProfile {
            profile_name: self.profile_name.clone(),
            org_id: self.org_id.clone(),
            default_department_id: self.default_department_id.clone(),
            from_email_address: self.from_email_address.clone(),
        }
    }
}

/// Static profile list, loaded once at startup and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    profiles: Arc<Vec<Arc<Profile>>>,
}

impl ProfileStore {
    pub fn new(profiles: Vec<Profile>) -> Result<Self> {
        let mut seen = HashSet::new();
        for p in &profiles {
            if !seen.insert(p.profile_name.as_str()) {
                return Err(anyhow!("Duplicate profile name '{}'", p.profile_name));
            }
        }
        Ok(Self {
            profiles: Arc::new(profiles.into_iter().map(Arc::new).collect()),
        })
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Could not load profiles from {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let profiles: Vec<Profile> =
            serde_json::from_str(content).context("Profile file is not a valid profile list")?;
        Self::new(profiles)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Profile>> {
        self.profiles
            .iter()
            .find(|p| p.profile_name == name)
            .cloned()
    }

    pub fn sanitized(&self) -> Vec<PublicProfile> {
        self.profiles.iter().map(|p| p.sanitized()).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn test_profile(name: &str) -> Profile {
    Profile {
        profile_name: name.to_string(),
        org_id: "600001".to_string(),
        default_department_id: "4000000007".to_string(),
        from_email_address: Some("support@example.com".to_string()),
        refresh_token: "1000.refresh".to_string(),
        client_id: "1000.CLIENT".to_string(),
        client_secret: "s3cret".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILES: &str = r#"[
        {
            "profileName": "Support EU",
            "orgId": "20001",
            "defaultDepartmentId": "30001",
            "fromEmailAddress": "eu@example.com",
            "refreshToken": "1000.aaa",
            "clientId": "1000.ID",
            "clientSecret": "secret"
        },
        {
            "profileName": "Support US",
            "orgId": "20002",
            "defaultDepartmentId": "30002",
            "refreshToken": "1000.bbb",
            "clientId": "1000.ID2",
            "clientSecret": "secret2"
        }
    ]"#;

    #[test]
    fn parses_profile_list_and_looks_up_by_name() {
        let store = ProfileStore::from_json(PROFILES).unwrap();
        assert_eq!(store.len(), 2);
        let us = store.get("Support US").expect("profile");
        assert_eq!(us.org_id, "20002");
        assert!(us.from_email_address.is_none());
        assert!(store.get("Missing").is_none());
    }

    #[test]
    fn sanitized_view_drops_credentials() {
        let store = ProfileStore::from_json(PROFILES).unwrap();
        let json = serde_json::to_value(store.sanitized()).unwrap();
        let first = &json[0];
        assert_eq!(first["profileName"], "Support EU");
        assert_eq!(first["fromEmailAddress"], "eu@example.com");
        assert!(first.get("refreshToken").is_none());
        assert!(first.get("clientId").is_none());
        assert!(first.get("clientSecret").is_none());
        assert!(json[1].get("fromEmailAddress").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = ProfileStore::new(vec![test_profile("a"), test_profile("a")]).unwrap_err();
        assert!(err.to_string().contains("Duplicate profile name"));
    }

    #[tokio::test]
    async fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProfileStore::load(dir.path().join("profiles.json"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Could not load profiles"));
    }
}
