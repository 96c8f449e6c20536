use std::fmt;

/// Caller identity that store operations are scoped to.
///
/// `User` restricts reads and writes to tasks owned by that user.
/// `System` is used by background sweeps and bypasses owner scoping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    System,
    User(String),
}

impl Scope {
    pub fn user(id: impl Into<String>) -> Self {
        Scope::User(id.into())
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Scope::System => None,
            Scope::User(id) => Some(id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::System => f.write_str("system"),
            Scope::User(id) => write!(f, "user:{id}"),
        }
    }
}
