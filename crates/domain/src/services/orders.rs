//! Order intake and order lifecycle helpers.

use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::order::{CreateOrderRequest, OrderStatusResponse};
use crate::models::{AuditActor, InvitationStatus, NewOrder, Order, Package, PaymentStatus};
use crate::services::audit::audit_helpers;
use crate::store::{AllocationStore, StoreError, UnitOfWork};
use shared::validation::normalize_identity;

/// Known packages keyed by id.
#[derive(Debug, Clone, Default)]
pub struct PackageCatalog {
    packages: HashMap<String, Package>,
}

impl PackageCatalog {
    pub fn new(packages: impl IntoIterator<Item = Package>) -> Self {
        Self {
            packages: packages.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Package> {
        self.packages.get(id)
    }

    /// Lease length bought with a package.
    pub fn lease_duration(&self, id: &str) -> Option<Duration> {
        self.get(id).map(|p| Duration::days(p.duration_days))
    }

    /// Packages sorted by duration.
    pub fn list(&self) -> Vec<Package> {
        let mut packages: Vec<Package> = self.packages.values().cloned().collect();
        packages.sort_by(|a, b| a.duration_days.cmp(&b.duration_days).then(a.id.cmp(&b.id)));
        packages
    }
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Unknown package: {0}")]
    UnknownPackage(String),

    #[error("Order not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Moves an order to a new invitation status and audits the change.
///
/// No-op when the order already carries `status`.
pub(crate) async fn transition_invitation(
    uow: &mut dyn UnitOfWork,
    order: &mut Order,
    status: InvitationStatus,
    actor: &AuditActor,
    clock: &dyn Clock,
) -> Result<(), StoreError> {
    if order.invitation_status == status {
        return Ok(());
    }
    let now = clock.now();
    let previous = order.invitation_status;
    order.invitation_status = status;
    order.updated_at = now;
    uow.update_order(order).await?;
    uow.append_audit(audit_helpers::order_invitation_status(actor, order, previous, now))
        .await?;
    Ok(())
}

/// Order intake and lookups.
#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn AllocationStore>,
    clock: Arc<dyn Clock>,
    catalog: Arc<PackageCatalog>,
}

impl OrderService {
    pub fn new(store: Arc<dyn AllocationStore>, clock: Arc<dyn Clock>, catalog: Arc<PackageCatalog>) -> Self {
        Self {
            store,
            clock,
            catalog,
        }
    }

    pub fn catalog(&self) -> &PackageCatalog {
        &self.catalog
    }

    /// Creates a pending order priced from the package catalogue.
    pub async fn create_order(&self, request: CreateOrderRequest) -> Result<Order, OrderError> {
        let package = self
            .catalog
            .get(&request.package_id)
            .ok_or_else(|| OrderError::UnknownPackage(request.package_id.clone()))?;

        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let order = uow
            .insert_order(NewOrder {
                id: Uuid::new_v4(),
                order_ref: Order::generate_ref(),
                customer_email: normalize_identity(&request.customer_email),
                full_name: request.full_name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
                package_id: package.id.clone(),
                amount: package.price,
                created_at: now,
            })
            .await?;
        uow.append_audit(audit_helpers::order_created(&AuditActor::system(), &order, now))
            .await?;
        uow.commit().await?;

        info!(order_ref = %order.order_ref, package_id = %order.package_id, "Order created");
        Ok(order)
    }

    /// Order state plus the end of its active lease, if any.
    pub async fn order_status(&self, order_ref: &str) -> Result<OrderStatusResponse, OrderError> {
        let order = self
            .store
            .find_order_by_ref(order_ref)
            .await?
            .ok_or_else(|| OrderError::NotFound(order_ref.to_string()))?;
        let lease_end_at = self
            .store
            .find_active_leases_for_order(order.id)
            .await?
            .into_iter()
            .map(|l| l.end_at)
            .max();
        Ok(OrderStatusResponse::new(order, lease_end_at))
    }

    /// Marks orders that stayed pending longer than `ttl` as expired.
    ///
    /// Returns how many orders were expired.
    pub async fn expire_stale_orders(&self, ttl: Duration) -> Result<usize, OrderError> {
        let cutoff = self.clock.now() - ttl;
        let stale = self.store.find_stale_pending_orders(cutoff).await?;
        let actor = AuditActor::system();
        let mut expired = 0;

        for candidate in stale {
            match self.expire_one(candidate.id, &actor).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(order_ref = %candidate.order_ref, error = %e, "Failed to expire order");
                }
            }
        }

        if expired > 0 {
            info!(count = expired, "Stale pending orders expired");
        }
        Ok(expired)
    }

    async fn expire_one(&self, order_id: Uuid, actor: &AuditActor) -> Result<bool, StoreError> {
        let mut uow = self.store.begin().await?;
        let Some(mut order) = uow.lock_order(order_id).await? else {
            uow.rollback().await?;
            return Ok(false);
        };
        // A callback may have landed between the scan and the lock.
        if order.payment_status != PaymentStatus::Pending {
            uow.rollback().await?;
            return Ok(false);
        }

        let now = self.clock.now();
        order.payment_status = PaymentStatus::Expired;
        order.updated_at = now;
        uow.update_order(&order).await?;
        uow.append_audit(audit_helpers::order_expired(actor, &order, now))
            .await?;
        uow.commit().await?;
        Ok(true)
    }
}
