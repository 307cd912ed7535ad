use axum::{
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};

use taskforge_core::TenantId;

use crate::app::errors;
use crate::context::{DEFAULT_TENANT, TenantContext};

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Resolve the tenant from `X-Tenant-Id` (blank or missing → `default`).
pub async fn tenant_middleware(
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let tenant_id = extract_tenant(req.headers()).map_err(errors::domain_error_to_response)?;
    req.extensions_mut().insert(TenantContext::new(tenant_id));
    Ok(next.run(req).await)
}

fn extract_tenant(headers: &HeaderMap) -> Result<TenantId, taskforge_core::DomainError> {
    let raw = headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_TENANT);
    TenantId::parse(raw)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn missing_or_blank_header_falls_back_to_default() {
        let headers = HeaderMap::new();
        assert_eq!(extract_tenant(&headers).unwrap().as_str(), "default");

        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, HeaderValue::from_static("   "));
        assert_eq!(extract_tenant(&headers).unwrap().as_str(), "default");
    }

    #[test]
    fn oversized_tenant_is_rejected() {
        let mut headers = HeaderMap::new();
        let long = "t".repeat(101);
        headers.insert(TENANT_HEADER, HeaderValue::from_str(&long).unwrap());
        let err = extract_tenant(&headers).unwrap_err();
        assert_eq!(err.field(), Some("tenant_id"));
    }
}
