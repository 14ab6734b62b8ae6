/*!
 * # Workflow Authorization
 *
 * Gates every state transition on the injected permission table and issues
 * audited override grants for privileged bypass of business guards.
 */

use super::{ActorContext, ClusterId, PermissionTable, Screen, Verb};
use crate::errors::ServiceError;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

pub const AUDIT_TARGET: &str = "packtrace::audit";

#[derive(Debug, Clone)]
pub struct Authorizer {
    table: Arc<PermissionTable>,
}

impl Authorizer {
    pub fn new(table: Arc<PermissionTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &PermissionTable {
        &self.table
    }

    pub fn can_view(&self, cluster: &ClusterId, screen: Screen) -> bool {
        self.table.can_view(cluster, screen)
    }

    pub fn can_do(&self, cluster: &ClusterId, screen: Screen, verb: Verb) -> bool {
        self.table.can_do(cluster, screen, verb)
    }

    /// Rejects with `PermissionDenied` unless the actor's cluster holds `verb` on `screen`.
    pub fn require(
        &self,
        actor: &ActorContext,
        screen: Screen,
        verb: Verb,
    ) -> Result<(), ServiceError> {
        if self.can_do(&actor.cluster, screen, verb) {
            return Ok(());
        }

        warn!(
            actor = %actor.actor_id,
            cluster = %actor.cluster,
            screen = %screen,
            verb = %verb,
            "Permission denied"
        );
        counter!("packtrace.authorization.denied", 1, "screen" => screen.as_ref().to_string());

        Err(ServiceError::PermissionDenied {
            cluster: actor.cluster.to_string(),
            screen: screen.to_string(),
            verb: verb.to_string(),
        })
    }

    /// Builds an `ActorContext` from session-provided identity. The cluster
    /// always comes from the table; a claimed cluster may only confirm it.
    pub fn resolve_actor(
        &self,
        actor_id: String,
        role: String,
        claimed_cluster: Option<&str>,
    ) -> Result<ActorContext, ServiceError> {
        let mapped = self.table.cluster_for_role(&role).ok_or_else(|| {
            ServiceError::Unauthorized(format!("role '{}' has no cluster", role))
        })?;

        if let Some(claimed) = claimed_cluster {
            if mapped.as_str() != claimed {
                return Err(ServiceError::Unauthorized(format!(
                    "role '{}' belongs to cluster '{}', not '{}'",
                    role, mapped, claimed
                )));
            }
        }

        let cluster = mapped.clone();
        Ok(ActorContext::new(actor_id, role, cluster))
    }

    /// Issues a privileged override for `screen`. Only the super cluster or a
    /// cluster holding `Manage` on the screen qualifies.
    pub fn grant_override(
        &self,
        actor: &ActorContext,
        screen: Screen,
        reason: &str,
    ) -> Result<OverrideGrant, ServiceError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ServiceError::InvalidInput(
                "override reason is required".to_string(),
            ));
        }

        self.require(actor, screen, Verb::Manage)?;

        warn!(
            target: AUDIT_TARGET,
            actor = %actor.actor_id,
            cluster = %actor.cluster,
            screen = %screen,
            reason,
            "Override granted"
        );

        Ok(OverrideGrant {
            actor_id: actor.actor_id.clone(),
            cluster: actor.cluster.clone(),
            screen,
            reason: reason.to_string(),
            granted_at: Utc::now(),
        })
    }
}

/// Proof that a privileged override was granted. Only `Authorizer::grant_override`
/// can construct one.
#[derive(Debug, Clone, Serialize)]
pub struct OverrideGrant {
    actor_id: String,
    cluster: ClusterId,
    screen: Screen,
    reason: String,
    granted_at: DateTime<Utc>,
}

impl OverrideGrant {
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn cluster(&self) -> &ClusterId {
        &self.cluster
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn granted_at(&self) -> DateTime<Utc> {
        self.granted_at
    }

    /// Fails unless the grant was issued for `screen`.
    pub fn check_screen(&self, screen: Screen) -> Result<(), ServiceError> {
        if self.screen == screen {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied {
                cluster: self.cluster.to_string(),
                screen: screen.to_string(),
                verb: format!("override (granted for {})", self.screen),
            })
        }
    }

    /// Audit record for one bypassed guard.
    pub fn record_use(&self, guard: &str, subject: &str) {
        warn!(
            target: AUDIT_TARGET,
            actor = %self.actor_id,
            cluster = %self.cluster,
            screen = %self.screen,
            guard,
            subject,
            reason = %self.reason,
            "Override used"
        );
        counter!("packtrace.overrides.used", 1, "guard" => guard.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::VerbSet;
    use assert_matches::assert_matches;

    fn authorizer() -> Authorizer {
        let table = PermissionTable::new()
            .with_super_cluster(ClusterId::new("plant_admin"))
            .with_role("operator", ClusterId::new("line_ops"))
            .with_role("supervisor", ClusterId::new("line_leads"))
            .grant(
                ClusterId::new("line_ops"),
                Screen::Modules,
                "VX".parse::<VerbSet>().unwrap(),
            )
            .grant(
                ClusterId::new("line_leads"),
                Screen::Modules,
                "VXM".parse::<VerbSet>().unwrap(),
            );
        Authorizer::new(Arc::new(table))
    }

    #[test]
    fn require_reports_the_denied_verb() {
        let auth = authorizer();
        let actor = ActorContext::new("u1", "operator", ClusterId::new("line_ops"));
        assert!(auth.require(&actor, Screen::Modules, Verb::Execute).is_ok());
        assert_matches!(
            auth.require(&actor, Screen::Modules, Verb::Edit),
            Err(ServiceError::PermissionDenied { verb, .. }) if verb == "edit"
        );
    }

    #[test]
    fn resolve_actor_rejects_mismatched_cluster() {
        let auth = authorizer();
        let actor = auth
            .resolve_actor("u1".into(), "operator".into(), None)
            .unwrap();
        assert_eq!(actor.cluster, ClusterId::new("line_ops"));

        assert_matches!(
            auth.resolve_actor("u1".into(), "operator".into(), Some("plant_admin")),
            Err(ServiceError::Unauthorized(_))
        );
        assert_matches!(
            auth.resolve_actor("u1".into(), "visitor".into(), None),
            Err(ServiceError::Unauthorized(_))
        );
    }

    #[test]
    fn unmapped_role_cannot_claim_super_cluster() {
        let auth = authorizer();
        assert_matches!(
            auth.resolve_actor("u9".into(), "janitor".into(), Some("plant_admin")),
            Err(ServiceError::Unauthorized(_))
        );
    }

    #[test]
    fn override_requires_manage_or_super() {
        let auth = authorizer();
        let operator = ActorContext::new("u1", "operator", ClusterId::new("line_ops"));
        let lead = ActorContext::new("u2", "supervisor", ClusterId::new("line_leads"));
        let admin = ActorContext::new("u3", "admin", ClusterId::new("plant_admin"));

        assert_matches!(
            auth.grant_override(&operator, Screen::Modules, "rework"),
            Err(ServiceError::PermissionDenied { .. })
        );
        let grant = auth
            .grant_override(&lead, Screen::Modules, "rework")
            .unwrap();
        assert_eq!(grant.actor_id(), "u2");
        assert!(grant.check_screen(Screen::Modules).is_ok());
        assert!(grant.check_screen(Screen::Packs).is_err());

        assert!(auth.grant_override(&admin, Screen::Eol, "deviation 42").is_ok());
        assert_matches!(
            auth.grant_override(&admin, Screen::Eol, "  "),
            Err(ServiceError::InvalidInput(_))
        );
    }
}
