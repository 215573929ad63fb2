use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ProjectRoomId);
id_newtype!(ChatRoomId);
id_newtype!(MessageId);

/// Sender id used by the server for generated notices.
pub const SYSTEM_SENDER_ID: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChatRoomKind {
    AdminEngineer,
    AdminCompany,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Engineer,
    Company,
    Admin,
    System,
    #[serde(other)]
    Unknown,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Engineer => "engineer",
            Role::Company => "company",
            Role::Admin => "admin",
            Role::System => "system",
            Role::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Role::Client),
            "engineer" => Ok(Role::Engineer),
            "company" => Ok(Role::Company),
            "admin" => Ok(Role::Admin),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    File,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Pdf,
    Document,
    Other,
}

const DOCUMENT_MIME_MARKERS: &[&str] = &[
    "msword",
    "wordprocessingml",
    "spreadsheetml",
    "presentationml",
    "ms-excel",
    "ms-powerpoint",
    "opendocument",
    "rtf",
];

impl AttachmentKind {
    pub fn from_mime(mime_type: &str) -> Self {
        let mime_type = mime_type.trim().to_ascii_lowercase();
        if mime_type.starts_with("image/") {
            AttachmentKind::Image
        } else if mime_type == "application/pdf" {
            AttachmentKind::Pdf
        } else if mime_type.starts_with("text/")
            || DOCUMENT_MIME_MARKERS
                .iter()
                .any(|marker| mime_type.contains(marker))
        {
            AttachmentKind::Document
        } else {
            AttachmentKind::Other
        }
    }

    pub fn from_filename(filename: &str) -> Self {
        mime_guess::from_path(filename)
            .first()
            .map(|mime| Self::from_mime(mime.essence_str()))
            .unwrap_or(AttachmentKind::Other)
    }
}
