use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::str::FromStr;

use super::security::{Authorization, Classification};
use crate::db::executor::QueryResult;

pub const ADMIN_USER_ID: i64 = 999;
pub const VIEWER_USER_ID: i64 = 998;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Owner,
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Owner => write!(f, "owner"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

impl FromStr for Role {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "admin" | "1" => Ok(Role::Admin),
            "owner" | "2" => Ok(Role::Owner),
            "viewer" | "3" => Ok(Role::Viewer),
            other => Err(ContextError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContextError {
    UnknownRole(String),
    MissingOwnerId,
    UnexpectedOwnerId(Role),
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::UnknownRole(role) => write!(f, "Unknown role: {}", role),
            ContextError::MissingOwnerId => write!(f, "An owner id is required for the owner role"),
            ContextError::UnexpectedOwnerId(role) => {
                write!(f, "An owner id may only be given for the owner role, not {}", role)
            }
        }
    }
}

impl Error for ContextError {}

/// Who is asking. Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserContext {
    pub user_id: i64,
    pub role: Role,
    pub owner_id: Option<i64>,
}

impl UserContext {
    pub fn new(role: Role, owner_id: Option<i64>) -> Result<Self, ContextError> {
        match (role, owner_id) {
            (Role::Owner, Some(id)) => Ok(Self { user_id: id, role, owner_id: Some(id) }),
            (Role::Owner, None) => Err(ContextError::MissingOwnerId),
            (_, Some(_)) => Err(ContextError::UnexpectedOwnerId(role)),
            (Role::Admin, None) => Ok(Self { user_id: ADMIN_USER_ID, role, owner_id: None }),
            (Role::Viewer, None) => Ok(Self { user_id: VIEWER_USER_ID, role, owner_id: None }),
        }
    }

    /// Display name used in prompts and greetings.
    pub fn display_name(&self) -> String {
        match (self.role, self.owner_id) {
            (Role::Owner, Some(id)) => format!("LLC{}", id),
            (Role::Admin, _) => "Administrator".to_string(),
            _ => "Viewer".to_string(),
        }
    }
}

/// Terminal outcome of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Answered,
    AnsweredLowConfidence,
    AccessDenied,
    Conversational,
    FailedAfterRetries,
    OracleUnavailable,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Outcome::Answered | Outcome::AnsweredLowConfidence | Outcome::Conversational
        )
    }
}

/// Working state of a single query. Created on entry, dropped after the response.
#[derive(Debug, Clone)]
pub struct QueryState {
    pub raw_query: String,
    pub rewritten_query: String,
    pub classification: Option<Classification>,
    pub authorization: Option<Authorization>,
    pub generated_sql: Option<String>,
    pub validated_sql: Option<String>,
    pub execution_result: Option<QueryResult>,
    pub final_answer: Option<String>,
    pub confidence: f64,
    pub warning: Option<String>,
    pub retry_count: u32,
    pub error_log: Vec<String>,
    pub technical_details: Option<String>,
    pub oracle_calls: u32,
}

impl QueryState {
    pub fn new(raw_query: &str, rewritten_query: String) -> Self {
        Self {
            raw_query: raw_query.to_string(),
            rewritten_query,
            classification: None,
            authorization: None,
            generated_sql: None,
            validated_sql: None,
            execution_result: None,
            final_answer: None,
            confidence: 1.0,
            warning: None,
            retry_count: 0,
            error_log: Vec::new(),
            technical_details: None,
            oracle_calls: 0,
        }
    }

    /// The most recent error, passed back to the SQL oracle on a retry.
    pub fn last_error(&self) -> Option<&str> {
        self.error_log.last().map(String::as_str)
    }
}

/// Structured response handed to the CLI and HTTP front ends.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sql: Option<String>,
    pub success: bool,
    pub outcome: Outcome,
    pub confidence: f64,
    pub warning: Option<String>,
    pub retry_count: u32,
    pub error_log: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical_details: Option<String>,
}

impl QueryResponse {
    pub fn from_state(state: QueryState, outcome: Outcome, answer: String) -> Self {
        Self {
            answer,
            sql: state.validated_sql.or(state.generated_sql),
            success: outcome.is_success(),
            outcome,
            confidence: state.confidence,
            warning: state.warning,
            retry_count: state.retry_count,
            error_log: state.error_log,
            technical_details: state.technical_details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_requires_owner_id() {
        assert_eq!(UserContext::new(Role::Owner, None), Err(ContextError::MissingOwnerId));
        let ctx = UserContext::new(Role::Owner, Some(3)).unwrap();
        assert_eq!(ctx.user_id, 3);
        assert_eq!(ctx.display_name(), "LLC3");
    }

    #[test]
    fn non_owner_rejects_owner_id() {
        assert!(UserContext::new(Role::Viewer, Some(1)).is_err());
        assert_eq!(UserContext::new(Role::Admin, None).unwrap().user_id, ADMIN_USER_ID);
    }

    #[test]
    fn parses_roles_by_name_and_menu_number() {
        assert_eq!("Owner".parse::<Role>().unwrap(), Role::Owner);
        assert_eq!("3".parse::<Role>().unwrap(), Role::Viewer);
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn success_follows_outcome() {
        assert!(Outcome::AnsweredLowConfidence.is_success());
        assert!(!Outcome::AccessDenied.is_success());
        assert!(!Outcome::OracleUnavailable.is_success());
    }
}
