// Typed views of the built-in entities

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A struct that a row of `ENTITY` deserializes into.
pub trait Model: DeserializeOwned {
    const ENTITY: &'static str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub password_hash: Option<String>,
    pub github_id: Option<String>,
    pub google_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub user_id: String,
    pub resume_url: Option<String>,
    pub transcript_url: Option<String>,
    pub github_url: Option<String>,
    #[serde(default)]
    pub additional_skills: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillSet {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub level: String,
    pub source: String,
    pub category: String,
    pub level_score: i64,
    pub verified: bool,
    pub description: Option<String>,
    pub skill_set_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningPath {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub target_job: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningResource {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub platform: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub skills_addressed: Vec<String>,
    pub learning_path_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub id: String,
    pub user_id: String,
    pub file_name: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: i64,
    pub path: String,
    #[serde(rename = "type")]
    pub file_type: String,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

macro_rules! model {
    ($($ty:ident),* $(,)?) => {
        $(impl Model for $ty {
            const ENTITY: &'static str = stringify!($ty);
        })*
    };
}

model!(User, Profile, SkillSet, Skill, LearningPath, LearningResource, File);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rows_decode_into_models() {
        let skill: Skill = serde_json::from_value(json!({
            "id": "k1",
            "name": "Go",
            "level": "advanced",
            "source": "github",
            "category": "backend",
            "levelScore": 80,
            "verified": false,
            "description": null,
            "skillSetId": "s1",
            "createdAt": "2024-01-02T03:04:05Z",
            "updatedAt": "2024-01-02T03:04:05Z",
        }))
        .unwrap();
        assert_eq!(skill.level_score, 80);
        assert_eq!(Skill::ENTITY, "Skill");

        let resource: LearningResource = serde_json::from_value(json!({
            "id": "r1",
            "title": "The Book",
            "url": "https://doc.rust-lang.org/book/",
            "type": "book",
            "skillsAddressed": ["rust", "rust"],
            "learningPathId": "l1",
        }))
        .unwrap();
        assert_eq!(resource.resource_type, "book");
        assert_eq!(resource.skills_addressed, vec!["rust", "rust"]);
        assert_eq!(resource.platform, None);
        assert_eq!(LearningResource::ENTITY, "LearningResource");
    }
}
