use taskforge_core::TenantId;

/// Tenant used when a request carries no `X-Tenant-Id` header.
pub const DEFAULT_TENANT: &str = "default";

/// Tenant context for a request.
///
/// Immutable; inserted by [`crate::middleware::tenant_middleware`] for every
/// task route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn into_tenant_id(self) -> TenantId {
        self.tenant_id
    }
}
