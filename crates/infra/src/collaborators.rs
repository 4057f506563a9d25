//! Interfaces to systems the engine consumes but does not own: supplier
//! master data, price lists and the clock.
//!
//! Each comes with an in-memory implementation used by tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockflow_core::{ProductId, SupplierId};

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceListItem {
    pub sku: String,
    pub unit_price: Decimal,
}

/// A supplier's price list, already parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceList {
    pub id: String,
    pub supplier_id: SupplierId,
    pub items: Vec<PriceListItem>,
}

impl PriceList {
    pub fn price_for(&self, sku: &str) -> Option<Decimal> {
        self.items.iter().find(|i| i.sku == sku).map(|i| i.unit_price)
    }
}

pub trait PriceListLookup: Send + Sync {
    /// The list currently in force for a supplier, if any.
    fn active_price_list(&self, supplier_id: SupplierId) -> Result<Option<PriceList>, CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierInfo {
    pub supplier_id: SupplierId,
    pub name: String,
    pub lead_time_days: u32,
    pub is_active: bool,
}

/// Which supplier a product is bought from, under which SKU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierProduct {
    pub supplier_id: SupplierId,
    pub sku: String,
}

pub trait SupplierDirectory: Send + Sync {
    fn supplier(&self, supplier_id: SupplierId) -> Result<Option<SupplierInfo>, CollaboratorError>;

    fn preferred_supplier(&self, product_id: ProductId) -> Result<Option<SupplierProduct>, CollaboratorError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: RwLock::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.write() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut guard) = self.now.write() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.read().map(|g| *g).unwrap_or_else(|_| Utc::now())
    }
}

impl<T> PriceListLookup for Arc<T>
where
    T: PriceListLookup + ?Sized,
{
    fn active_price_list(&self, supplier_id: SupplierId) -> Result<Option<PriceList>, CollaboratorError> {
        (**self).active_price_list(supplier_id)
    }
}

impl<T> SupplierDirectory for Arc<T>
where
    T: SupplierDirectory + ?Sized,
{
    fn supplier(&self, supplier_id: SupplierId) -> Result<Option<SupplierInfo>, CollaboratorError> {
        (**self).supplier(supplier_id)
    }

    fn preferred_supplier(&self, product_id: ProductId) -> Result<Option<SupplierProduct>, CollaboratorError> {
        (**self).preferred_supplier(product_id)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPriceLists {
    lists: RwLock<HashMap<SupplierId, PriceList>>,
}

impl InMemoryPriceLists {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `list` the active list of its supplier.
    pub fn activate(&self, list: PriceList) {
        if let Ok(mut lists) = self.lists.write() {
            lists.insert(list.supplier_id, list);
        }
    }
}

impl PriceListLookup for InMemoryPriceLists {
    fn active_price_list(&self, supplier_id: SupplierId) -> Result<Option<PriceList>, CollaboratorError> {
        let lists = self
            .lists
            .read()
            .map_err(|_| CollaboratorError::Unavailable("price lists lock poisoned".to_string()))?;
        Ok(lists.get(&supplier_id).cloned())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySupplierDirectory {
    suppliers: RwLock<HashMap<SupplierId, SupplierInfo>>,
    products: RwLock<HashMap<ProductId, SupplierProduct>>,
}

impl InMemorySupplierDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_supplier(&self, info: SupplierInfo) {
        if let Ok(mut suppliers) = self.suppliers.write() {
            suppliers.insert(info.supplier_id, info);
        }
    }

    pub fn link_product(&self, product_id: ProductId, supplier_id: SupplierId, sku: impl Into<String>) {
        if let Ok(mut products) = self.products.write() {
            products.insert(
                product_id,
                SupplierProduct {
                    supplier_id,
                    sku: sku.into(),
                },
            );
        }
    }
}

impl SupplierDirectory for InMemorySupplierDirectory {
    fn supplier(&self, supplier_id: SupplierId) -> Result<Option<SupplierInfo>, CollaboratorError> {
        let suppliers = self
            .suppliers
            .read()
            .map_err(|_| CollaboratorError::Unavailable("supplier directory lock poisoned".to_string()))?;
        Ok(suppliers.get(&supplier_id).cloned())
    }

    fn preferred_supplier(&self, product_id: ProductId) -> Result<Option<SupplierProduct>, CollaboratorError> {
        let products = self
            .products
            .read()
            .map_err(|_| CollaboratorError::Unavailable("supplier directory lock poisoned".to_string()))?;
        Ok(products.get(&product_id).cloned())
    }
}
