//! Account collaborators

use crate::server::VpnUser;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Session identifier of the logged-in account
pub type SessionId = String;

/// Account change detected by a plan refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoChange {
    PlanChange { old: VpnUser, new: VpnUser },
    UserBecameDelinquent,
    VpnCredentials,
}

impl InfoChange {
    pub fn is_downgrade(&self) -> bool {
        matches!(self, InfoChange::PlanChange { old, new } if new.max_tier < old.max_tier)
    }

    pub fn is_upgrade(&self) -> bool {
        matches!(self, InfoChange::PlanChange { old, new } if new.max_tier > old.max_tier)
    }
}

/// The logged-in user
#[async_trait]
pub trait CurrentUser: Send + Sync {
    async fn vpn_user(&self) -> Option<VpnUser>;
    async fn session_id(&self) -> Option<SessionId>;
}

/// Plan refresh and change notifications
#[async_trait]
pub trait UserPlanManager: Send + Sync {
    /// Refresh account info from the API and return what changed
    async fn refresh_vpn_info(&self) -> Vec<InfoChange>;

    /// Changes detected by any refresh
    fn subscribe_info_changes(&self) -> broadcast::Receiver<Vec<InfoChange>>;
}
