//! Permission requests raised by the agent for tool invocations.

use serde::{Deserialize, Serialize};

/// Kind of a permission option offered by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOptionKind {
    AllowOnce,
    AllowAlways,
    RejectOnce,
    RejectAlways,
}

impl PermissionOptionKind {
    /// Whether choosing this option lets the tool run.
    #[must_use]
    pub const fn is_allow(self) -> bool {
        matches!(self, Self::AllowOnce | Self::AllowAlways)
    }
}

/// One choice the user can make on a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionOption {
    pub option_id: String,
    pub name: String,
    pub kind: PermissionOptionKind,
}

/// A request from the agent that needs a caller decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub options: Vec<PermissionOption>,
}

impl PermissionRequest {
    /// First option that allows the tool to run.
    ///
    /// Used when the agent server is configured to auto-approve.
    #[must_use]
    pub fn auto_approve_option(&self) -> Option<&PermissionOption> {
        self.options.iter().find(|o| o.kind.is_allow())
    }

    /// Look up an option by id.
    #[must_use]
    pub fn option(&self, option_id: &str) -> Option<&PermissionOption> {
        self.options.iter().find(|o| o.option_id == option_id)
    }
}

/// Result of a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PermissionOutcome {
    /// The caller picked an option.
    Selected { option_id: String },
    /// Picked automatically by the auto-approve policy.
    AutoApproved { option_id: String },
    /// The request was withdrawn (turn cancelled or session closed).
    Cancelled,
}

impl PermissionOutcome {
    /// Option id the agent should act on, if any.
    #[must_use]
    pub fn option_id(&self) -> Option<&str> {
        match self {
            Self::Selected { option_id } | Self::AutoApproved { option_id } => Some(option_id),
            Self::Cancelled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PermissionRequest {
        PermissionRequest {
            request_id: "req-1".to_string(),
            title: "Run `cargo fmt`".to_string(),
            tool_call_id: None,
            options: vec![
                PermissionOption {
                    option_id: "no".to_string(),
                    name: "Reject".to_string(),
                    kind: PermissionOptionKind::RejectOnce,
                },
                PermissionOption {
                    option_id: "yes".to_string(),
                    name: "Allow".to_string(),
                    kind: PermissionOptionKind::AllowOnce,
                },
            ],
        }
    }

    #[test]
    fn test_auto_approve_picks_first_allow() {
        let req = request();
        assert_eq!(req.auto_approve_option().unwrap().option_id, "yes");
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = PermissionOutcome::Selected {
            option_id: "yes".to_string(),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"outcome\":\"selected\""));
        assert_eq!(outcome.option_id(), Some("yes"));
        assert_eq!(PermissionOutcome::Cancelled.option_id(), None);
    }
}
