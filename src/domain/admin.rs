//! Admin capability decision and the grant that gates cross-owner access.
//!
//! The decision is one ordered table: an `admin` role wins, then a numeric
//! level at or above [`ADMIN_LEVEL_THRESHOLD`]. The legacy boolean flag is
//! recognised only so that it can be refused explicitly.

use serde::Serialize;

use super::error::QuantopsError;

pub const ADMIN_LEVEL_THRESHOLD: i64 = 100;

/// Capability attributes as they arrive from the excluded auth layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub actor_id: String,
    pub role: Option<String>,
    pub level: Option<i64>,
    pub legacy_admin_flag: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Role,
    Level,
    LegacyFlagRejected,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdminDecision {
    pub is_admin: bool,
    pub source: DecisionSource,
}

pub fn evaluate_admin(caps: &Capabilities) -> AdminDecision {
    let role_is_admin = caps
        .role
        .as_deref()
        .is_some_and(|role| role.trim().eq_ignore_ascii_case("admin"));

    if role_is_admin {
        AdminDecision {
            is_admin: true,
            source: DecisionSource::Role,
        }
    } else if caps.level.is_some_and(|level| level >= ADMIN_LEVEL_THRESHOLD) {
        AdminDecision {
            is_admin: true,
            source: DecisionSource::Level,
        }
    } else if caps.legacy_admin_flag.is_some() {
        AdminDecision {
            is_admin: false,
            source: DecisionSource::LegacyFlagRejected,
        }
    } else {
        AdminDecision {
            is_admin: false,
            source: DecisionSource::Default,
        }
    }
}

/// Proof that an actor passed [`evaluate_admin`]. Cannot be built any other way.
#[derive(Debug, Clone)]
pub struct AdminGrant {
    actor_id: String,
    source: DecisionSource,
}

impl AdminGrant {
    pub fn authorize(caps: &Capabilities) -> Result<AdminGrant, QuantopsError> {
        let decision = evaluate_admin(caps);
        if !decision.is_admin {
            tracing::warn!(actor = %caps.actor_id, source = ?decision.source, "admin access refused");
            return Err(QuantopsError::AccessDenied {
                id: format!("admin:{}", caps.actor_id),
            });
        }
        Ok(AdminGrant {
            actor_id: caps.actor_id.clone(),
            source: decision.source,
        })
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn source(&self) -> DecisionSource {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(role: Option<&str>, level: Option<i64>, flag: Option<bool>) -> Capabilities {
        Capabilities {
            actor_id: "ops".into(),
            role: role.map(str::to_string),
            level,
            legacy_admin_flag: flag,
        }
    }

    #[test]
    fn role_takes_priority_over_everything() {
        let d = evaluate_admin(&caps(Some("Admin"), Some(0), Some(false)));
        assert_eq!(d, AdminDecision { is_admin: true, source: DecisionSource::Role });
    }

    #[test]
    fn level_threshold_grants_admin() {
        let d = evaluate_admin(&caps(Some("trader"), Some(ADMIN_LEVEL_THRESHOLD), None));
        assert_eq!(d.source, DecisionSource::Level);
        assert!(d.is_admin);

        let below = evaluate_admin(&caps(None, Some(ADMIN_LEVEL_THRESHOLD - 1), None));
        assert!(!below.is_admin);
        assert_eq!(below.source, DecisionSource::Default);
    }

    #[test]
    fn legacy_flag_is_refused_even_when_true() {
        let d = evaluate_admin(&caps(None, None, Some(true)));
        assert_eq!(
            d,
            AdminDecision { is_admin: false, source: DecisionSource::LegacyFlagRejected }
        );
    }

    #[test]
    fn level_beats_legacy_flag() {
        let d = evaluate_admin(&caps(None, Some(500), Some(true)));
        assert_eq!(d.source, DecisionSource::Level);
    }

    #[test]
    fn nothing_means_no_admin() {
        let d = evaluate_admin(&Capabilities::default());
        assert!(!d.is_admin);
        assert_eq!(d.source, DecisionSource::Default);
    }

    #[test]
    fn grant_only_issued_to_admins() {
        let grant = AdminGrant::authorize(&caps(Some("admin"), None, None)).unwrap();
        assert_eq!(grant.actor_id(), "ops");
        assert_eq!(grant.source(), DecisionSource::Role);

        let err = AdminGrant::authorize(&caps(None, None, Some(true))).unwrap_err();
        assert!(matches!(err, QuantopsError::AccessDenied { .. }));
    }
}
