//! Dynamically-scoped tenant context.
//!
//! Every logical operation in the core runs inside a [`TenantScope`] bound
//! with [`run_with`]. The scope rides tokio's task-local storage, so it stays
//! visible across every `.await` inside the wrapped future (including
//! descendants of the call), while concurrently running operations under
//! other scopes never observe it. The storage plane reads the scope through
//! [`current_tenant_id`] and refuses to touch multi-tenant tables without it.

use std::future::Future;

use crate::error::CoreError;

tokio::task_local! {
    static CURRENT_SCOPE: TenantScope;
}

/// The tenant context active during one logical operation.
///
/// `tenant_id` is the isolation key used by the storage plane.
/// `organization_id` is a business identifier that rides along for
/// collaborators; the core never filters by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantScope {
    pub tenant_id: String,
    pub organization_id: Option<String>,
}

impl TenantScope {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            organization_id: None,
        }
    }

    pub fn with_organization(
        tenant_id: impl Into<String>,
        organization_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            organization_id: Some(organization_id.into()),
        }
    }
}

/// Run `fut` with `scope` bound for its entire dynamic extent.
///
/// The binding is released on every exit path, including panic unwinding and
/// cancellation of the future.
pub async fn run_with<F>(scope: TenantScope, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_SCOPE.scope(scope, fut).await
}

/// The scope bound to the current task, or `TenantScopeMissing`.
pub fn current() -> Result<TenantScope, CoreError> {
    CURRENT_SCOPE
        .try_with(|scope| scope.clone())
        .map_err(|_| CoreError::TenantScopeMissing)
}

/// Convenience over [`current`] for the common single-field case.
pub fn current_tenant_id() -> Result<String, CoreError> {
    Ok(current()?.tenant_id)
}

/// Non-throwing probe for an active scope.
pub fn has_scope() -> bool {
    CURRENT_SCOPE.try_with(|_| ()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_current_fails_outside_scope() {
        assert!(!has_scope());
        assert!(matches!(current(), Err(CoreError::TenantScopeMissing)));
        assert!(matches!(
            current_tenant_id(),
            Err(CoreError::TenantScopeMissing)
        ));
    }

    #[tokio::test]
    async fn test_scope_visible_inside_run_with() {
        let tenant = run_with(TenantScope::new("tenant-a"), async {
            assert!(has_scope());
            current_tenant_id().unwrap()
        })
        .await;
        assert_eq!(tenant, "tenant-a");
        // Released on exit.
        assert!(!has_scope());
    }

    #[tokio::test]
    async fn test_scope_survives_suspension() {
        run_with(TenantScope::new("tenant-a"), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(current_tenant_id().unwrap(), "tenant-a");
            // Visible to descendants of the invocation as well.
            async fn nested() -> String {
                tokio::time::sleep(Duration::from_millis(1)).await;
                current_tenant_id().unwrap()
            }
            assert_eq!(nested().await, "tenant-a");
        })
        .await;
    }

    #[tokio::test]
    async fn test_concurrent_scopes_do_not_interfere() {
        let a = tokio::spawn(run_with(TenantScope::new("tenant-a"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            current_tenant_id().unwrap()
        }));
        let b = tokio::spawn(run_with(TenantScope::new("tenant-b"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            current_tenant_id().unwrap()
        }));
        assert_eq!(a.await.unwrap(), "tenant-a");
        assert_eq!(b.await.unwrap(), "tenant-b");
    }

    #[tokio::test]
    async fn test_nested_scope_shadows_and_restores() {
        run_with(TenantScope::new("outer"), async {
            assert_eq!(current_tenant_id().unwrap(), "outer");
            run_with(TenantScope::new("inner"), async {
                assert_eq!(current_tenant_id().unwrap(), "inner");
            })
            .await;
            assert_eq!(current_tenant_id().unwrap(), "outer");
        })
        .await;
    }

    #[tokio::test]
    async fn test_organization_id_rides_along() {
        run_with(
            TenantScope::with_organization("tenant-a", "org-1"),
            async {
                let scope = current().unwrap();
                assert_eq!(scope.tenant_id, "tenant-a");
                assert_eq!(scope.organization_id.as_deref(), Some("org-1"));
            },
        )
        .await;
    }

    #[tokio::test]
    async fn test_scope_propagates_failure() {
        let result: Result<(), CoreError> = run_with(TenantScope::new("tenant-a"), async {
            Err(CoreError::Queue("boom".into()))
        })
        .await;
        assert!(result.is_err());
        assert!(!has_scope());
    }
}
