use serde::{Deserialize, Serialize};

#[cfg(feature = "ts")]
use ts_rs::TS;

/// Profile of the signed-in user as returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    /// File name of the avatar image, relative to the API's `/images` path
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(rename = "tel", default)]
    pub phone: Option<String>,
}

impl UserProfile {
    /// Name to show in greetings; falls back to the email when unnamed
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.email
        } else {
            &self.name
        }
    }

    /// Absolute URL of the avatar image, if the user has one
    pub fn avatar_url(&self, api_base_url: &str) -> Option<String> {
        self.avatar
            .as_deref()
            .filter(|a| !a.is_empty())
            .map(|a| format!("{}/images/{}", api_base_url.trim_end_matches('/'), a))
    }
}

/// Body of a successful `POST /sessions`.
#[derive(Debug, Clone, Deserialize)]
pub struct SignInResponse {
    pub user: UserProfile,
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sign_in_response() {
        let json = r#"{"user":{"id":"u2","name":"Ana","email":"a@b.com","avatar":"ana.png","tel":"11999990000"},"token":"tok-B","refresh_token":"ref-B"}"#;

        let resp: SignInResponse = serde_json::from_str(json).expect("Failed to parse sign-in JSON");
        assert_eq!(resp.user.id, "u2");
        assert_eq!(resp.user.phone.as_deref(), Some("11999990000"));
        assert_eq!(resp.token, "tok-B");
        assert_eq!(resp.refresh_token.as_deref(), Some("ref-B"));
    }

    #[test]
    fn test_profile_serializes_phone_as_tel() {
        let profile = UserProfile {
            id: "u1".to_string(),
            phone: Some("123".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&profile).unwrap();
        assert_eq!(value["tel"], "123");
        assert!(value.get("phone").is_none());
    }

    #[test]
    fn test_display_name_falls_back_to_email() {
        let mut profile = UserProfile {
            id: "u1".to_string(),
            email: "a@b.com".to_string(),
            ..Default::default()
        };
        assert_eq!(profile.display_name(), "a@b.com");
        profile.name = "Ana".to_string();
        assert_eq!(profile.display_name(), "Ana");
    }

    #[test]
    fn test_avatar_url() {
        let profile = UserProfile {
            id: "u1".to_string(),
            avatar: Some("ana.png".to_string()),
            ..Default::default()
        };
        assert_eq!(
            profile.avatar_url("http://localhost:3333/").as_deref(),
            Some("http://localhost:3333/images/ana.png")
        );
        assert_eq!(UserProfile::default().avatar_url("http://x"), None);
    }
}
