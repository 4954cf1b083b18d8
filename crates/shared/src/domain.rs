use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix that marks a locally generated message id.
pub const PLACEHOLDER_PREFIX: &str = "temp-";

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
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
id_newtype!(ConversationId);
id_newtype!(MessageId);

impl MessageId {
    pub fn placeholder() -> Self {
        Self(format!("{PLACEHOLDER_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(PLACEHOLDER_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub avatar_url: String,
}

/// Identity record handed over by the session collaborator.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: String,
    pub auth_token: String,
}

impl SessionIdentity {
    pub fn as_user(&self) -> User {
        User {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            email: String::new(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

impl fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("avatar_url", &self.avatar_url)
            .field("auth_token", &"<redacted>")
            .finish()
    }
}

const UNKNOWN_USER: &str = "Unknown User";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub is_group: bool,
    pub display_name: String,
    #[serde(default)]
    pub members: Vec<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_admin: Option<UserId>,
}

impl Conversation {
    /// The other participant of a 1:1 conversation, as seen by `me`.
    pub fn peer(&self, me: &UserId) -> Option<&User> {
        if self.members.len() < 2 {
            return None;
        }
        if &self.members[0].id == me {
            Some(&self.members[1])
        } else {
            Some(&self.members[0])
        }
    }

    pub fn title(&self, me: &UserId) -> &str {
        if self.is_group {
            return &self.display_name;
        }
        self.peer(me)
            .map(|user| user.display_name.as_str())
            .unwrap_or(UNKNOWN_USER)
    }

    pub fn is_admin(&self, user_id: &UserId) -> bool {
        self.group_admin.as_ref() == Some(user_id)
    }
}
