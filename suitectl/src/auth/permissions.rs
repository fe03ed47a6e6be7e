//! Role-based access control.
//!
//! Each [`Role`] grants a fixed set of `(Resource, Operation)` pairs. `*All` operations reach
//! across tenants and are reserved for platform managers; `*Own` operations are limited to the
//! caller's tenant, and handlers resolve that tenant with [`require_tenant`].
//!
//! Handlers declare their requirement in the signature:
//!
//! ```ignore
//! async fn handler(perm: RequiresPermission<resource::Credits, operation::ReadOwn>) { .. }
//! ```

use std::marker::PhantomData;

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::{
    AppState,
    api::models::users::{CurrentUser, Role},
    errors::{Error, Result},
    types::{Operation, Permission, Resource, TenantId},
};

use Operation::*;

pub trait ResourceType: Send + Sync + 'static {
    const RESOURCE: Resource;
}

pub trait OperationType: Send + Sync + 'static {
    const OPERATION: Operation;
}

macro_rules! marker_types {
    ($trait:ident, $const:ident, $enum:ident: $($name:ident),+ $(,)?) => {
        $(
            pub struct $name;
            impl super::$trait for $name {
                const $const: crate::types::$enum = crate::types::$enum::$name;
            }
        )+
    };
}

/// Type-level resources for [`RequiresPermission`]
pub mod resource {
    marker_types!(ResourceType, RESOURCE, Resource: Tenants, Users, Subscriptions, Credits, Usage, Payments, Organizations);
}

/// Type-level operations for [`RequiresPermission`]
pub mod operation {
    marker_types!(OperationType, OPERATION, Operation: CreateAll, CreateOwn, ReadAll, ReadOwn, UpdateAll, UpdateOwn, DeleteAll, DeleteOwn);
}

fn own_variant(operation: Operation) -> Operation {
    match operation {
        CreateAll => CreateOwn,
        ReadAll => ReadOwn,
        UpdateAll => UpdateOwn,
        DeleteAll => DeleteOwn,
        own => own,
    }
}

fn role_allows(role: Role, resource: Resource, operation: Operation) -> bool {
    match role {
        Role::PlatformManager => true,
        Role::TenantAdmin => match resource {
            Resource::Tenants => matches!(operation, ReadOwn | UpdateOwn),
            Resource::Users => matches!(operation, CreateOwn | ReadOwn | UpdateOwn | DeleteOwn),
            Resource::Subscriptions => matches!(operation, ReadOwn | UpdateOwn),
            Resource::Credits | Resource::Payments => matches!(operation, ReadOwn | CreateOwn),
            Resource::Usage => matches!(operation, ReadOwn | CreateOwn),
            Resource::Organizations => false,
        },
        Role::BillingManager => match resource {
            Resource::Tenants | Resource::Users | Resource::Usage => operation == ReadOwn,
            Resource::Subscriptions => matches!(operation, ReadOwn | UpdateOwn),
            Resource::Credits | Resource::Payments => matches!(operation, ReadOwn | CreateOwn),
            Resource::Organizations => false,
        },
        Role::Member => match resource {
            Resource::Tenants | Resource::Credits | Resource::Subscriptions => operation == ReadOwn,
            Resource::Usage => matches!(operation, ReadOwn | CreateOwn),
            Resource::Users | Resource::Payments | Resource::Organizations => false,
        },
    }
}

/// Whether any of the user's roles grants the operation. An `*All` grant implies `*Own`.
pub fn has_permission(user: &CurrentUser, resource: Resource, operation: Operation) -> bool {
    if user.is_admin {
        return true;
    }
    user.roles.iter().any(|&role| {
        role_allows(role, resource, operation)
            || (own_variant(operation) == operation && role_allows(role, resource, all_variant(operation)))
    })
}

fn all_variant(operation: Operation) -> Operation {
    match operation {
        CreateOwn => CreateAll,
        ReadOwn => ReadAll,
        UpdateOwn => UpdateAll,
        DeleteOwn => DeleteAll,
        all => all,
    }
}

pub fn can_read_all_resources(user: &CurrentUser, resource: Resource) -> bool {
    has_permission(user, resource, ReadAll)
}

/// The caller's tenant, or 404 for users who have not onboarded yet.
pub fn require_tenant(user: &CurrentUser) -> Result<TenantId> {
    user.tenant_id.ok_or_else(|| Error::NotFound {
        resource: "Tenant".to_string(),
        id: "current".to_string(),
    })
}

/// Extractor that authenticates the caller and checks one permission.
pub struct RequiresPermission<R: ResourceType, O: OperationType> {
    pub user: CurrentUser,
    _marker: PhantomData<(R, O)>,
}

impl<R: ResourceType, O: OperationType> RequiresPermission<R, O> {
    pub fn check(user: CurrentUser) -> Result<Self> {
        // Users who have not onboarded hold no tenant roles; `*Own` routes report the missing tenant
        if !user.is_admin && own_variant(O::OPERATION) == O::OPERATION {
            require_tenant(&user)?;
        }
        if !has_permission(&user, R::RESOURCE, O::OPERATION) {
            return Err(Error::InsufficientPermissions {
                required: Permission::Allow(R::RESOURCE, O::OPERATION),
                action: O::OPERATION,
                resource: R::RESOURCE.to_string(),
            });
        }
        Ok(Self {
            user,
            _marker: PhantomData,
        })
    }

    /// Tenant the `*Own` operation applies to.
    pub fn tenant_id(&self) -> Result<TenantId> {
        require_tenant(&self.user)
    }
}

impl<R: ResourceType, O: OperationType> FromRequestParts<AppState> for RequiresPermission<R, O> {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        Self::check(user)
    }
}
