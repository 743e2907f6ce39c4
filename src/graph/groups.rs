//! Assignment groups and app assignments
//!
//! Every app gets four security groups, `<prefix>-<label>-<System|User>-<Install|Uninstall>`.
//! They are looked up (or created) concurrently, then the app's assignments are
//! reconciled so each group carries the right intent while assignments to
//! anything else are left alone.

use super::{GraphClient, apps, odata_filter, odata_quote};
use crate::error::Result;
use crate::manifest::{AssignmentSection, InstallIntent, Notifications};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

const GROUP_TARGET: &str = "#microsoft.graph.groupAssignmentTarget";
const MAIL_NICKNAME_MAX: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupRole {
    SystemInstall,
    SystemUninstall,
    UserInstall,
    UserUninstall,
}

impl GroupRole {
    pub const ALL: [GroupRole; 4] = [
        GroupRole::SystemInstall,
        GroupRole::SystemUninstall,
        GroupRole::UserInstall,
        GroupRole::UserUninstall,
    ];

    pub fn scope(&self) -> &'static str {
        match self {
            GroupRole::SystemInstall | GroupRole::SystemUninstall => "System",
            GroupRole::UserInstall | GroupRole::UserUninstall => "User",
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            GroupRole::SystemInstall | GroupRole::UserInstall => "Install",
            GroupRole::SystemUninstall | GroupRole::UserUninstall => "Uninstall",
        }
    }

    pub fn display_name(&self, prefix: &str, label: &str) -> String {
        format!("{}-{}-{}-{}", prefix, label, self.scope(), self.action())
    }

    fn description(&self, label: &str) -> String {
        let members = match self.scope() {
            "System" => "Devices",
            _ => "Users",
        };
        format!(
            "{} that receive the {} {} assignment",
            members,
            label,
            self.action().to_lowercase()
        )
    }

    /// Assignment intent for this group
    pub fn intent(&self, user_install_intent: InstallIntent) -> &'static str {
        match self {
            GroupRole::SystemInstall => "required",
            GroupRole::UserInstall => match user_install_intent {
                InstallIntent::Required => "required",
                InstallIntent::Available => "available",
            },
            GroupRole::SystemUninstall | GroupRole::UserUninstall => "uninstall",
        }
    }
}

/// `mailNickname` allows `[A-Za-z0-9-]`, at most 64 characters
pub fn mail_nickname(display_name: &str) -> String {
    let mut nickname = String::with_capacity(display_name.len());
    for c in display_name.chars() {
        let mapped = if c.is_ascii_alphanumeric() {
            Some(c)
        } else if c == '-' || c.is_whitespace() || c == '_' || c == '.' {
            Some('-')
        } else {
            None
        };
        match mapped {
            Some('-') if nickname.is_empty() || nickname.ends_with('-') => {}
            Some(c) => nickname.push(c),
            None => {}
        }
    }
    nickname.truncate(MAIL_NICKNAME_MAX);
    let nickname = nickname.trim_end_matches('-');
    if nickname.is_empty() {
        "intunepack-group".to_string()
    } else {
        nickname.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub mail_nickname: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedGroup {
    pub role: GroupRole,
    pub group: Group,
    pub created: bool,
}

async fn ensure_group(
    client: &GraphClient,
    role: GroupRole,
    prefix: &str,
    label: &str,
) -> Result<ResolvedGroup> {
    let display_name = role.display_name(prefix, label);
    let filter = format!("displayName eq {}", odata_quote(&display_name));
    let existing: Vec<Group> = client
        .get_all_pages(&format!("groups?{}", odata_filter(&filter)))
        .await?;

    if let Some(group) = existing.into_iter().next() {
        tracing::debug!("Reusing group {} ({})", group.display_name, group.id);
        return Ok(ResolvedGroup {
            role,
            group,
            created: false,
        });
    }

    let body = json!({
        "displayName": display_name,
        "description": role.description(label),
        "mailEnabled": false,
        "mailNickname": mail_nickname(&display_name),
        "securityEnabled": true,
        "groupTypes": [],
    });
    let group: Group = client.post("groups", &body).await?;
    tracing::info!("Created group {} ({})", group.display_name, group.id);
    Ok(ResolvedGroup {
        role,
        group,
        created: true,
    })
}

/// Look up or create the four groups, concurrently; results follow `GroupRole::ALL`
pub async fn ensure_groups(
    client: &GraphClient,
    prefix: &str,
    label: &str,
) -> Result<Vec<ResolvedGroup>> {
    try_join_all(
        GroupRole::ALL
            .iter()
            .map(|role| ensure_group(client, *role, prefix, label)),
    )
    .await
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AssignmentOptions {
    pub user_install_intent: InstallIntent,
    pub notifications: Notifications,
}

impl From<&AssignmentSection> for AssignmentOptions {
    fn from(section: &AssignmentSection) -> Self {
        Self {
            user_install_intent: section.user_install_intent,
            notifications: section.notifications,
        }
    }
}

/// Full assignment set to send, with what changed against the current one
#[derive(Debug, Clone, Default)]
pub struct AssignmentPlan {
    pub assignments: Vec<Value>,
    pub added: usize,
    pub updated: usize,
    /// Assignments to other targets, carried over untouched
    pub kept: usize,
    pub unchanged: usize,
}

impl AssignmentPlan {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.updated == 0
    }
}

fn group_assignment(group_id: &str, intent: &str, notifications: Notifications) -> Value {
    json!({
        "@odata.type": "#microsoft.graph.mobileAppAssignment",
        "intent": intent,
        "target": {
            "@odata.type": GROUP_TARGET,
            "groupId": group_id,
        },
        "settings": {
            "@odata.type": "#microsoft.graph.win32LobAppAssignmentSettings",
            "notifications": notifications,
            "restartSettings": null,
            "installTimeSettings": null,
            "deliveryOptimizationPriority": "notConfigured",
        },
    })
}

/// Strip read-only fields from an existing assignment so it can be sent back
fn carry_over(existing: &Value) -> Value {
    let mut assignment = json!({
        "@odata.type": "#microsoft.graph.mobileAppAssignment",
        "intent": existing["intent"],
        "target": existing["target"],
    });
    if !existing["settings"].is_null() {
        assignment["settings"] = existing["settings"].clone();
    }
    assignment
}

fn targeted_group(assignment: &Value) -> Option<&str> {
    let target = &assignment["target"];
    if target["@odata.type"].as_str() == Some(GROUP_TARGET) {
        target["groupId"].as_str()
    } else {
        None
    }
}

pub fn plan_assignments(
    existing: &[Value],
    groups: &[ResolvedGroup],
    options: AssignmentOptions,
) -> AssignmentPlan {
    let mut plan = AssignmentPlan::default();
    let notifications = serde_json::to_value(options.notifications).unwrap_or(Value::Null);

    for assignment in existing {
        let ours = targeted_group(assignment)
            .is_some_and(|id| groups.iter().any(|g| g.group.id == id));
        if !ours {
            plan.assignments.push(carry_over(assignment));
            plan.kept += 1;
        }
    }

    for resolved in groups {
        let intent = resolved.role.intent(options.user_install_intent);
        let current: Vec<&Value> = existing
            .iter()
            .filter(|a| targeted_group(a) == Some(resolved.group.id.as_str()))
            .collect();

        match current.as_slice() {
            [] => plan.added += 1,
            [only]
                if only["intent"].as_str() == Some(intent)
                    && only["settings"]["notifications"] == notifications =>
            {
                plan.unchanged += 1
            }
            _ => plan.updated += 1,
        }

        plan.assignments.push(group_assignment(
            &resolved.group.id,
            intent,
            options.notifications,
        ));
    }

    plan
}

/// Send the plan; returns false when there was nothing to change
pub async fn apply_assignments(
    client: &GraphClient,
    app_id: &str,
    plan: &AssignmentPlan,
) -> Result<bool> {
    if plan.is_noop() {
        tracing::debug!("Assignments of {} already match", app_id);
        return Ok(false);
    }
    apps::assign(client, app_id, &plan.assignments).await?;
    tracing::info!(
        "Assigned {}: {} added, {} updated, {} kept",
        app_id,
        plan.added,
        plan.updated,
        plan.kept
    );
    Ok(true)
}
