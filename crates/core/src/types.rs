use serde::{Deserialize, Serialize};

use crate::restore::ScaleFactor;

/// File a user picked from the host's file-actions menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionFile {
    pub file_id: i64,
    pub name: String,
    pub directory: String,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub mime: String,
    #[serde(default)]
    pub file_type: String,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub favorite: String,
    #[serde(default)]
    pub permissions: i64,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl ActionFile {
    /// `<directory>/<name>` without doubling the separator.
    pub fn full_path(&self) -> String {
        join_path(&self.directory, &self.name)
    }
}

/// Body of a file-action webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileActionRequest {
    #[serde(default)]
    pub action_name: String,
    #[serde(default)]
    pub action_handler: String,
    pub action_file: ActionFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Face/background restoration at the source resolution.
    Restore,
    /// Restoration plus 2x upscale.
    Upscale,
}

impl RestoreMode {
    pub fn scale(self) -> ScaleFactor {
        match self {
            Self::Restore => ScaleFactor::X1,
            Self::Upscale => ScaleFactor::X2,
        }
    }

    pub fn output_suffix(self) -> &'static str {
        match self {
            Self::Restore => "restored",
            Self::Upscale => "upscaled",
        }
    }

    pub fn finished_subject(self) -> &'static str {
        match self {
            Self::Restore => "Restoring finished!",
            Self::Upscale => "Up-scaling finished!",
        }
    }
}

impl std::fmt::Display for RestoreMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Restore => write!(f, "restore"),
            Self::Upscale => write!(f, "upscale"),
        }
    }
}

/// API scope groups an ExApp can ask the host for, with the host's numeric ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiScope {
    System,
    Dav,
    UserInfo,
    UserStatus,
    Notifications,
}

impl ApiScope {
    pub fn id(self) -> u32 {
        match self {
            Self::System => 2,
            Self::Dav => 3,
            Self::UserInfo => 10,
            Self::UserStatus => 11,
            Self::Notifications => 12,
        }
    }
}

impl Serialize for ApiScope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.id())
    }
}

/// Scope declaration served to the host at install time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeDeclaration {
    pub required: Vec<ApiScope>,
    pub optional: Vec<ApiScope>,
}

impl ScopeDeclaration {
    /// WebDAV for reading and writing images; notifications are nice to have.
    pub fn for_upscaler() -> Self {
        Self {
            required: vec![ApiScope::Dav],
            optional: vec![ApiScope::Notifications],
        }
    }
}

pub fn join_path(directory: &str, name: &str) -> String {
    if directory.is_empty() {
        return name.to_string();
    }
    if name.starts_with('/') {
        return name.to_string();
    }
    if directory.ends_with('/') {
        format!("{directory}{name}")
    } else {
        format!("{directory}/{name}")
    }
}
