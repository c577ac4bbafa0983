//! Role-based permissions.
//!
//! A session's role resolves to a set of grants, one per [`Action`]. A
//! grant is either a plain boolean or a conditional map of capability
//! names to booleans: the action is allowed unless the request turns on
//! a capability the map forbids. Conditional grants are how a role like
//! `viewerWithData` publishes data channels but never audio or video.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Actions a session can be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Publish,
    Subscribe,
    Record,
    Stats,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Publish => "publish",
            Action::Subscribe => "subscribe",
            Action::Record => "record",
            Action::Stats => "stats",
        };
        f.write_str(name)
    }
}

/// One grant within a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionGrant {
    /// Unconditionally allowed or denied.
    Allowed(bool),
    /// Allowed unless the request enables a capability mapped to `false`.
    Conditional(HashMap<String, bool>),
}

/// The grants attached to one session, resolved from its role at
/// connect time and immutable afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionSet(HashMap<Action, PermissionGrant>);

impl PermissionSet {
    #[must_use]
    pub fn new(grants: HashMap<Action, PermissionGrant>) -> Self {
        Self(grants)
    }

    /// Whether the action is allowed at all, ignoring request options.
    /// A conditional grant counts as allowed here.
    #[must_use]
    pub fn allows(&self, action: Action) -> bool {
        self.allows_with(action, &Value::Null)
    }

    /// Whether the action is allowed for a concrete request. `requested`
    /// is a JSON object of capability flags; a conditional grant fails
    /// when any capability it maps to `false` is `true` in the request.
    /// Absent capabilities never trip a conditional grant.
    #[must_use]
    pub fn allows_with(&self, action: Action, requested: &Value) -> bool {
        match self.0.get(&action) {
            None | Some(PermissionGrant::Allowed(false)) => false,
            Some(PermissionGrant::Allowed(true)) => true,
            Some(PermissionGrant::Conditional(rule)) => rule.iter().all(|(capability, allowed)| {
                *allowed || requested.get(capability).and_then(Value::as_bool) != Some(true)
            }),
        }
    }
}

/// The roles available when the deployment configures none.
#[must_use]
pub fn default_roles() -> HashMap<String, PermissionSet> {
    let presenter = PermissionSet::new(HashMap::from([
        (Action::Publish, PermissionGrant::Allowed(true)),
        (Action::Subscribe, PermissionGrant::Allowed(true)),
        (Action::Record, PermissionGrant::Allowed(true)),
        (Action::Stats, PermissionGrant::Allowed(true)),
    ]));

    let viewer = PermissionSet::new(HashMap::from([(
        Action::Subscribe,
        PermissionGrant::Allowed(true),
    )]));

    let viewer_with_data = PermissionSet::new(HashMap::from([
        (Action::Subscribe, PermissionGrant::Allowed(true)),
        (
            Action::Publish,
            PermissionGrant::Conditional(HashMap::from([
                ("audio".to_string(), false),
                ("video".to_string(), false),
                ("screen".to_string(), false),
                ("data".to_string(), true),
            ])),
        ),
    ]));

    HashMap::from([
        ("presenter".to_string(), presenter),
        ("viewer".to_string(), viewer),
        ("viewerWithData".to_string(), viewer_with_data),
    ])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use serde_json::json;

    fn role(name: &str) -> PermissionSet {
        default_roles().get(name).cloned().unwrap()
    }

    #[test]
    fn test_missing_grant_denies() {
        let viewer = role("viewer");

        assert!(viewer.allows(Action::Subscribe));
        assert!(!viewer.allows(Action::Publish));
        assert!(!viewer.allows(Action::Record));
        assert!(!viewer.allows(Action::Stats));
    }

    #[test]
    fn test_conditional_grant_blocks_forbidden_capabilities() {
        let set = PermissionSet::new(HashMap::from([(
            Action::Publish,
            PermissionGrant::Conditional(HashMap::from([("video".to_string(), false)])),
        )]));

        assert!(!set.allows_with(Action::Publish, &json!({ "video": true })));
        assert!(set.allows_with(Action::Publish, &json!({ "video": false })));
        assert!(set.allows_with(Action::Publish, &json!({ "audio": true })));
    }

    #[test]
    fn test_conditional_grant_counts_as_allowed_without_options() {
        let viewer_with_data = role("viewerWithData");

        assert!(viewer_with_data.allows(Action::Publish));
        assert!(viewer_with_data
            .allows_with(Action::Publish, &json!({ "data": true, "audio": false })));
        assert!(!viewer_with_data.allows_with(Action::Publish, &json!({ "audio": true })));
    }

    #[test]
    fn test_explicit_false_grant_denies() {
        let set = PermissionSet::new(HashMap::from([(
            Action::Record,
            PermissionGrant::Allowed(false),
        )]));

        assert!(!set.allows(Action::Record));
        assert!(!set.allows_with(Action::Record, &Value::Null));
    }

    #[test]
    fn test_roles_parse_from_json() {
        let raw = json!({
            "moderator": { "publish": true, "subscribe": true, "record": true },
            "guest": { "publish": { "data": true, "video": false }, "subscribe": true },
        });

        let roles: HashMap<String, PermissionSet> = serde_json::from_value(raw).unwrap();

        let moderator = roles.get("moderator").unwrap();
        assert!(moderator.allows(Action::Record));
        assert!(!moderator.allows(Action::Stats));

        let guest = roles.get("guest").unwrap();
        assert!(guest.allows_with(Action::Publish, &json!({ "data": true })));
        assert!(!guest.allows_with(Action::Publish, &json!({ "video": true })));
    }
}
