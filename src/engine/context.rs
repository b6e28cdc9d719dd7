//! Request Context
//!
//! Who is calling and on whose behalf. Passed explicitly into every engine
//! operation instead of living in ambient state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub tenant_id: Option<String>,
    pub actor_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub trace_id: Option<String>,
    pub request_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a tenant and acting user
    pub fn for_tenant(tenant_id: &str, actor_id: &str) -> Self {
        Self::new().with_tenant(tenant_id).with_actor(actor_id)
    }

    pub fn with_tenant(mut self, tenant_id: &str) -> Self {
        self.tenant_id = Some(tenant_id.to_string());
        self
    }

    pub fn with_actor(mut self, actor_id: &str) -> Self {
        self.actor_id = Some(actor_id.to_string());
        self
    }

    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_trace(mut self, trace_id: &str, request_id: &str) -> Self {
        self.trace_id = Some(trace_id.to_string());
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn with_client(mut self, ip_address: &str, user_agent: &str) -> Self {
        self.ip_address = Some(ip_address.to_string());
        self.user_agent = Some(user_agent.to_string());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}
