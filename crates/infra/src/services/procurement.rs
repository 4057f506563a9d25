//! Reorder analysis, automated procurement and the purchase order lifecycle.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use stockflow_core::{AggregateId, ProductId, SupplierId, UserId, WarehouseId};
use stockflow_events::DomainSignal;
use stockflow_inventory::{InventoryId, InventoryRecord, Movement, MovementReference, MovementType};
use stockflow_planning::{DemandSource, Recommendation, ReorderInput, ReorderRecommendation, analyze_reorder};
use stockflow_purchasing::{
    Approve, Cancel, CreatePurchaseOrder, NewLineItem, PurchaseOrder, PurchaseOrderCommand, PurchaseOrderEvent,
    PurchaseOrderId, PurchaseOrderStatus, ReceiveGoods, generate_po_number,
};

use super::{Engine, MovementRequest, PURCHASE_ORDER_AGGREGATE, purchase_order};
use crate::collaborators::SupplierProduct;
use crate::command_dispatcher::DispatchError;
use crate::event_bus::EnvelopeBus;
use crate::event_store::EventStore;

/// Which records to analyse. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderFilter {
    pub product_id: Option<ProductId>,
    pub warehouse_id: Option<WarehouseId>,
    /// Keep only stockout, urgent and regular reorders.
    pub actionable_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorderItem {
    pub inventory_id: InventoryId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub quantity_available: i64,
    pub quantity_in_transit: i64,
    pub reorder_point: i64,
    pub supplier: Option<SupplierProduct>,
    pub lead_time_days: u32,
    pub recommendation: ReorderRecommendation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReorderSummary {
    pub total_items: usize,
    pub stockout: usize,
    pub urgent_reorder: usize,
    pub reorder: usize,
    pub overstock: usize,
    pub ok: usize,
    /// Estimated value of every item that needs a purchase.
    pub total_estimated_value: Decimal,
}

impl ReorderSummary {
    fn of(items: &[ReorderItem]) -> Self {
        let mut summary = ReorderSummary {
            total_items: items.len(),
            ..Default::default()
        };
        for item in items {
            let rec = &item.recommendation;
            match rec.recommendation {
                Recommendation::Stockout => summary.stockout += 1,
                Recommendation::UrgentReorder => summary.urgent_reorder += 1,
                Recommendation::Reorder => summary.reorder += 1,
                Recommendation::Overstock => summary.overstock += 1,
                Recommendation::Ok => summary.ok += 1,
            }
            if rec.recommendation.needs_purchase() {
                summary.total_estimated_value += rec.estimated_order_value;
            }
        }
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorderReport {
    pub generated_at: DateTime<Utc>,
    pub items: Vec<ReorderItem>,
    pub summary: ReorderSummary,
    /// Records analysed without a demand rate because it could not be computed.
    pub issues: Vec<ProcurementIssue>,
}

/// An item procurement could not order, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcurementIssue {
    pub inventory_id: InventoryId,
    pub product_id: ProductId,
    pub supplier_id: Option<SupplierId>,
    pub sku: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedPurchaseOrder {
    pub purchase_order_id: PurchaseOrderId,
    pub po_number: String,
    pub supplier_id: SupplierId,
    pub status: PurchaseOrderStatus,
    pub line_count: usize,
    pub total_amount: Decimal,
}

/// Outcome of one procurement run: one order per supplier that could be
/// ordered from, plus every item that could not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcurementReport {
    pub orders: Vec<GeneratedPurchaseOrder>,
    pub errors: Vec<ProcurementIssue>,
    pub total_value: Decimal,
}

impl<S, B> Engine<S, B>
where
    S: EventStore,
    B: EnvelopeBus,
{
    /// Classify every matching ledger record.
    ///
    /// The daily rate comes from the product's forecast when the forecast
    /// window saw sales, otherwise from the trailing historical average. A
    /// product whose rate cannot be computed is analysed at a rate of zero
    /// and reported in `issues`. Stock already in transit counts toward each
    /// record's position.
    pub fn analyze_reorders(&self, filter: &ReorderFilter) -> Result<ReorderReport, DispatchError> {
        let policy = self.config.reorder_policy();
        let mut rates: HashMap<ProductId, Result<(f64, DemandSource), String>> = HashMap::new();
        let mut items = Vec::new();
        let mut issues = Vec::new();

        for record in self.all_records()? {
            let (Some(product_id), Some(warehouse_id)) = (record.product_id(), record.warehouse_id()) else {
                continue;
            };
            if filter.product_id.is_some_and(|p| p != product_id)
                || filter.warehouse_id.is_some_and(|w| w != warehouse_id)
            {
                continue;
            }

            let rate = rates.entry(product_id).or_insert_with(|| {
                self.daily_demand_rate(product_id).map_err(|err| {
                    warn!(%product_id, error = %err, "demand rate unavailable, analysing at zero");
                    err.to_string()
                })
            });
            let (daily_demand_rate, demand_source) = match rate {
                Ok(rate) => *rate,
                Err(reason) => {
                    issues.push(ProcurementIssue {
                        inventory_id: record.id_typed(),
                        product_id,
                        supplier_id: None,
                        sku: None,
                        reason: format!("demand rate unavailable: {reason}"),
                    });
                    (0.0, DemandSource::History)
                }
            };
            let (supplier, lead_time_days) = self.supplier_terms(product_id);

            let thresholds = record.thresholds();
            let recommendation = analyze_reorder(
                &ReorderInput {
                    quantity_available: record.quantity_available(),
                    quantity_in_transit: record.quantity_in_transit(),
                    reorder_point: thresholds.reorder_point,
                    reorder_quantity: thresholds.reorder_quantity,
                    max_stock_level: thresholds.max_stock_level,
                    average_cost: record.average_cost(),
                    lead_time_days,
                    daily_demand_rate,
                    demand_source,
                },
                &policy,
            );
            if filter.actionable_only && !recommendation.recommendation.needs_purchase() {
                continue;
            }

            items.push(reorder_item(&record, product_id, warehouse_id, supplier, lead_time_days, recommendation));
        }

        let summary = ReorderSummary::of(&items);
        debug!(
            items = summary.total_items,
            stockout = summary.stockout,
            issues = issues.len(),
            "reorder analysis done"
        );
        Ok(ReorderReport {
            generated_at: self.now(),
            items,
            summary,
            issues,
        })
    }

    /// Create one purchase order per supplier for every actionable item.
    ///
    /// Items that cannot be ordered (no supplier, inactive supplier, no price
    /// list, no price for the SKU) are reported and the rest of the batch
    /// continues. A failed order for one supplier does not affect the others.
    pub fn generate_purchase_orders(&self, filter: &ReorderFilter) -> Result<ProcurementReport, DispatchError> {
        let analysis = self.analyze_reorders(&ReorderFilter {
            actionable_only: true,
            ..filter.clone()
        })?;

        let mut errors = Vec::new();
        let mut by_supplier: BTreeMap<SupplierId, Vec<(ReorderItem, String)>> = BTreeMap::new();
        for item in analysis.items {
            match item.supplier.clone() {
                Some(link) => by_supplier.entry(link.supplier_id).or_default().push((item, link.sku)),
                None => errors.push(issue(&item, None, None, "no supplier linked to product")),
            }
        }

        let mut orders = Vec::new();
        for (supplier_id, items) in by_supplier {
            match self.order_from_supplier(supplier_id, &items, &mut errors) {
                Ok(Some(order)) => orders.push(order),
                Ok(None) => {}
                Err(err) => {
                    warn!(%supplier_id, error = %err, "purchase order creation failed");
                    for (item, sku) in &items {
                        errors.push(issue(
                            item,
                            Some(supplier_id),
                            Some(sku),
                            format!("purchase order creation failed: {err}"),
                        ));
                    }
                }
            }
        }

        let total_value: Decimal = orders.iter().map(|o| o.total_amount).sum();
        info!(orders = orders.len(), errors = errors.len(), %total_value, "purchase orders generated");
        self.emit(DomainSignal::PurchaseOrdersGenerated {
            order_count: orders.len(),
            total_value,
            error_count: errors.len(),
        });

        Ok(ProcurementReport {
            orders,
            errors,
            total_value,
        })
    }

    pub fn purchase_order(&self, order_id: PurchaseOrderId) -> Result<PurchaseOrder, DispatchError> {
        let order = self.dispatcher.load(order_id.0, purchase_order)?;
        if !order.is_created() {
            return Err(DispatchError::NotFound(format!("purchase order {order_id}")));
        }
        Ok(order)
    }

    /// Approve a pending order and schedule its lines as inbound stock.
    pub fn approve_purchase_order(
        &self,
        order_id: PurchaseOrderId,
        approved_by: Option<UserId>,
    ) -> Result<PurchaseOrder, DispatchError> {
        let out = self.dispatcher.dispatch(
            order_id.0,
            PURCHASE_ORDER_AGGREGATE,
            PurchaseOrderCommand::Approve(Approve {
                order_id,
                approved_by,
                occurred_at: self.now(),
            }),
            purchase_order,
        )?;
        self.schedule_order_inbound(&out.state);
        info!(%order_id, po_number = out.state.po_number(), "purchase order approved");
        Ok(out.state)
    }

    /// Book the goods of an approved order into the ledger, one `purchase`
    /// movement per line at the line's unit price.
    pub fn receive_purchase_order(
        &self,
        order_id: PurchaseOrderId,
    ) -> Result<(PurchaseOrder, Vec<Movement>), DispatchError> {
        let reference = MovementReference::new("purchase_order", order_id);
        let (out, movements) = self.run_with_movements(
            order_id.0,
            PURCHASE_ORDER_AGGREGATE,
            purchase_order,
            &PurchaseOrderCommand::ReceiveGoods(ReceiveGoods {
                order_id,
                occurred_at: self.now(),
            }),
            |_, events| {
                events
                    .iter()
                    .flat_map(|e| match e {
                        PurchaseOrderEvent::GoodsReceived(r) => r.lines.clone(),
                        _ => Vec::new(),
                    })
                    .map(|line| MovementRequest {
                        inventory_id: line.inventory_id,
                        movement_type: MovementType::Purchase,
                        quantity: line.quantity,
                        unit_cost: Some(line.unit_price),
                        reference: reference.clone(),
                        performed_by: None,
                    })
                    .collect()
            },
        )?;

        let received: i64 = movements.iter().map(|m| m.quantity).sum();
        info!(%order_id, received, "purchase order received");
        Ok((out.state, movements))
    }

    pub fn cancel_purchase_order(
        &self,
        order_id: PurchaseOrderId,
        reason: Option<String>,
    ) -> Result<PurchaseOrder, DispatchError> {
        let out = self.dispatcher.dispatch(
            order_id.0,
            PURCHASE_ORDER_AGGREGATE,
            PurchaseOrderCommand::Cancel(Cancel {
                order_id,
                reason,
                occurred_at: self.now(),
            }),
            purchase_order,
        )?;
        info!(%order_id, "purchase order cancelled");
        Ok(out.state)
    }

    fn order_from_supplier(
        &self,
        supplier_id: SupplierId,
        items: &[(ReorderItem, String)],
        errors: &mut Vec<ProcurementIssue>,
    ) -> Result<Option<GeneratedPurchaseOrder>, DispatchError> {
        let reject_all = |errors: &mut Vec<ProcurementIssue>, reason: &str| {
            for (item, sku) in items {
                errors.push(issue(item, Some(supplier_id), Some(sku), reason));
            }
        };

        let supplier = match self.suppliers.supplier(supplier_id) {
            Ok(Some(s)) => s,
            Ok(None) => {
                reject_all(errors, "unknown supplier");
                return Ok(None);
            }
            Err(err) => {
                reject_all(errors, &err.to_string());
                return Ok(None);
            }
        };
        if !supplier.is_active {
            reject_all(errors, "supplier is inactive");
            return Ok(None);
        }

        let price_list = match self.price_lists.active_price_list(supplier_id) {
            Ok(Some(list)) => list,
            Ok(None) => {
                reject_all(errors, "supplier has no active price list");
                return Ok(None);
            }
            Err(err) => {
                reject_all(errors, &err.to_string());
                return Ok(None);
            }
        };

        let mut lines = Vec::with_capacity(items.len());
        for (item, sku) in items {
            let Some(unit_price) = price_list.price_for(sku) else {
                errors.push(issue(
                    item,
                    Some(supplier_id),
                    Some(sku),
                    format!("no price for {sku} in price list {}", price_list.id),
                ));
                continue;
            };
            lines.push(NewLineItem {
                product_id: item.product_id,
                sku: sku.clone(),
                inventory_id: item.inventory_id,
                quantity: item.recommendation.suggested_order_quantity,
                unit_price,
            });
        }
        if lines.is_empty() {
            return Ok(None);
        }

        let now = self.now();
        let order_id = PurchaseOrderId::new(AggregateId::new());
        let auto_approve = self.config.procurement.auto_approve;
        let out = self.dispatcher.dispatch(
            order_id.0,
            PURCHASE_ORDER_AGGREGATE,
            PurchaseOrderCommand::CreatePurchaseOrder(CreatePurchaseOrder {
                order_id,
                po_number: generate_po_number(now),
                supplier_id,
                price_list_id: Some(price_list.id.clone()),
                lines,
                expected_delivery: Some(now + Duration::days(i64::from(supplier.lead_time_days))),
                submit: true,
                auto_approve,
                occurred_at: now,
            }),
            purchase_order,
        )?;
        let order = out.state;
        if auto_approve {
            self.schedule_order_inbound(&order);
        }

        info!(
            %order_id,
            po_number = order.po_number(),
            %supplier_id,
            lines = order.lines().len(),
            total = %order.total_amount(),
            "purchase order created"
        );
        Ok(Some(GeneratedPurchaseOrder {
            purchase_order_id: order_id,
            po_number: order.po_number().to_string(),
            supplier_id,
            status: order.status(),
            line_count: order.lines().len(),
            total_amount: order.total_amount(),
        }))
    }

    /// Mark approved quantities as in transit on their records. Failures are
    /// logged; the order itself stands.
    fn schedule_order_inbound(&self, order: &PurchaseOrder) {
        let reference = MovementReference::new("purchase_order", order.id_typed());
        for line in order.lines() {
            if let Err(err) = self.schedule_inbound(line.inventory_id, line.quantity, reference.clone()) {
                warn!(
                    purchase_order_id = %order.id_typed(),
                    inventory_id = %line.inventory_id,
                    error = %err,
                    "could not schedule inbound stock"
                );
            }
        }
    }

    fn daily_demand_rate(&self, product_id: ProductId) -> Result<(f64, DemandSource), DispatchError> {
        let forecast = self.forecast_product_demand(product_id, None)?;
        if forecast.forecast.pattern.active_days > 0 {
            return Ok((forecast.forecast.daily_rate(), DemandSource::Forecast));
        }
        let rate = self.historical_daily_rate(product_id, self.config.forecast.history_fallback_days)?;
        Ok((rate, DemandSource::History))
    }

    /// Preferred supplier link and its lead time, or the configured default.
    fn supplier_terms(&self, product_id: ProductId) -> (Option<SupplierProduct>, u32) {
        let default = self.config.reorder.default_lead_time_days;
        let link = match self.suppliers.preferred_supplier(product_id) {
            Ok(link) => link,
            Err(err) => {
                warn!(%product_id, error = %err, "supplier lookup failed");
                None
            }
        };
        let lead_time = match &link {
            Some(link) => match self.suppliers.supplier(link.supplier_id) {
                Ok(Some(info)) => info.lead_time_days,
                Ok(None) => default,
                Err(err) => {
                    warn!(supplier_id = %link.supplier_id, error = %err, "supplier lookup failed");
                    default
                }
            },
            None => default,
        };
        (link, lead_time)
    }
}

fn reorder_item(
    record: &InventoryRecord,
    product_id: ProductId,
    warehouse_id: WarehouseId,
    supplier: Option<SupplierProduct>,
    lead_time_days: u32,
    recommendation: ReorderRecommendation,
) -> ReorderItem {
    ReorderItem {
        inventory_id: record.id_typed(),
        product_id,
        warehouse_id,
        quantity_available: record.quantity_available(),
        quantity_in_transit: record.quantity_in_transit(),
        reorder_point: record.thresholds().reorder_point,
        supplier,
        lead_time_days,
        recommendation,
    }
}

fn issue(
    item: &ReorderItem,
    supplier_id: Option<SupplierId>,
    sku: Option<&String>,
    reason: impl Into<String>,
) -> ProcurementIssue {
    ProcurementIssue {
        inventory_id: item.inventory_id,
        product_id: item.product_id,
        supplier_id,
        sku: sku.cloned(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal_macros::dec;

    use stockflow_inventory::ReorderThresholds;

    use super::*;
    use crate::collaborators::{InMemoryPriceLists, InMemorySupplierDirectory, PriceList, PriceListItem, SupplierInfo};
    use crate::config::EngineConfig;
    use crate::event_bus::InMemoryEnvelopeBus;
    use crate::event_store::InMemoryEventStore;
    use crate::notifications::{InMemoryNotificationSink, SignalDispatcher};
    use crate::services::LedgerRecordSpec;

    type TestEngine = Engine<InMemoryEventStore, InMemoryEnvelopeBus>;

    struct World {
        engine: TestEngine,
        suppliers: Arc<InMemorySupplierDirectory>,
        prices: Arc<InMemoryPriceLists>,
        sink: Arc<InMemoryNotificationSink>,
    }

    fn world(auto_approve: bool) -> World {
        let suppliers = Arc::new(InMemorySupplierDirectory::new());
        let prices = Arc::new(InMemoryPriceLists::new());
        let sink = Arc::new(InMemoryNotificationSink::new());
        let mut config = EngineConfig::default();
        config.procurement.auto_approve = auto_approve;
        let engine = Engine::new(InMemoryEventStore::new(), InMemoryEnvelopeBus::new(), config)
            .with_suppliers(suppliers.clone())
            .with_price_lists(prices.clone())
            .with_signals(SignalDispatcher::new().with_sink(sink.clone()));
        World {
            engine,
            suppliers,
            prices,
            sink,
        }
    }

    fn supplier(world: &World, active: bool, prices: &[(&str, Decimal)]) -> SupplierId {
        let supplier_id = SupplierId::new();
        world.suppliers.add_supplier(SupplierInfo {
            supplier_id,
            name: "Acme Fasteners".to_string(),
            lead_time_days: 5,
            is_active: active,
        });
        world.prices.activate(PriceList {
            id: format!("PL-{supplier_id}"),
            supplier_id,
            items: prices
                .iter()
                .map(|(sku, unit_price)| PriceListItem {
                    sku: sku.to_string(),
                    unit_price: *unit_price,
                })
                .collect(),
        });
        supplier_id
    }

    /// A record holding `on_hand` units with reorder point 10 and reorder
    /// quantity 50, bought from `supplier_id` as `sku`.
    fn stocked(world: &World, supplier_id: Option<SupplierId>, sku: &str, on_hand: i64) -> InventoryId {
        let product_id = ProductId::new();
        let id = world
            .engine
            .upsert_ledger_record(LedgerRecordSpec {
                product_id,
                warehouse_id: WarehouseId::new(),
                location: None,
                thresholds: ReorderThresholds {
                    reorder_point: 10,
                    reorder_quantity: 50,
                    max_stock_level: Some(200),
                },
            })
            .unwrap()
            .id_typed();
        if on_hand > 0 {
            world
                .engine
                .record_movement(MovementRequest {
                    inventory_id: id,
                    movement_type: MovementType::AdjustmentIn,
                    quantity: on_hand,
                    unit_cost: Some(dec!(1.00)),
                    reference: MovementReference::new("adjustment", "opening"),
                    performed_by: None,
                })
                .unwrap();
        }
        if let Some(supplier_id) = supplier_id {
            world.suppliers.link_product(product_id, supplier_id, sku);
        }
        id
    }

    #[test]
    fn classification_covers_each_band() {
        let w = world(false);
        stocked(&w, None, "A", 0);
        stocked(&w, None, "B", 8);
        stocked(&w, None, "C", 100);
        stocked(&w, None, "D", 300);

        let report = w.engine.analyze_reorders(&ReorderFilter::default()).unwrap();
        assert_eq!(report.summary.total_items, 4);
        assert_eq!(report.summary.stockout, 1);
        assert_eq!(report.summary.reorder, 1);
        assert_eq!(report.summary.ok, 1);
        assert_eq!(report.summary.overstock, 1);
        // Stockout and reorder at 50 units of average cost 1.00 (stockout has none).
        assert_eq!(report.summary.total_estimated_value, dec!(50.00));
        assert!(report.items.iter().all(|i| i.lead_time_days == 7));

        let actionable = w
            .engine
            .analyze_reorders(&ReorderFilter {
                actionable_only: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(actionable.items.len(), 2);
    }

    #[test]
    fn one_order_per_supplier_and_missing_prices_are_reported() {
        let w = world(false);
        let acme = supplier(&w, true, &[("BOLT", dec!(0.40)), ("NUT", dec!(0.10))]);
        let other = supplier(&w, true, &[("WASHER", dec!(0.05))]);
        stocked(&w, Some(acme), "BOLT", 2);
        stocked(&w, Some(acme), "NUT", 5);
        let unpriced = stocked(&w, Some(acme), "SCREW", 1);
        stocked(&w, Some(other), "WASHER", 3);
        stocked(&w, Some(other), "WASHER", 150);

        let report = w.engine.generate_purchase_orders(&ReorderFilter::default()).unwrap();

        assert_eq!(report.orders.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].inventory_id, unpriced);
        assert_eq!(report.errors[0].sku.as_deref(), Some("SCREW"));

        let acme_order = report.orders.iter().find(|o| o.supplier_id == acme).unwrap();
        assert_eq!(acme_order.line_count, 2);
        assert_eq!(acme_order.total_amount, dec!(25.00));
        assert_eq!(acme_order.status, PurchaseOrderStatus::PendingApproval);
        assert!(acme_order.po_number.starts_with("PO-"));
        assert_eq!(report.total_value, dec!(27.50));

        let signals = w.sink.of_kind("purchase_orders_generated");
        assert_eq!(signals.len(), 1);
    }

    #[test]
    fn inactive_supplier_items_are_errors_not_orders() {
        let w = world(false);
        let dormant = supplier(&w, false, &[("BOLT", dec!(0.40))]);
        stocked(&w, Some(dormant), "BOLT", 0);
        stocked(&w, None, "LOOSE", 0);

        let report = w.engine.generate_purchase_orders(&ReorderFilter::default()).unwrap();
        assert!(report.orders.is_empty());
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.total_value, Decimal::ZERO);
    }

    #[test]
    fn approved_order_is_in_transit_until_received() {
        let w = world(true);
        let acme = supplier(&w, true, &[("BOLT", dec!(3.00))]);
        let record = stocked(&w, Some(acme), "BOLT", 6);

        let report = w.engine.generate_purchase_orders(&ReorderFilter::default()).unwrap();
        let generated = &report.orders[0];
        assert_eq!(generated.status, PurchaseOrderStatus::Approved);
        assert_eq!(w.engine.inventory_record(record).unwrap().quantity_in_transit(), 50);

        let (order, movements) = w.engine.receive_purchase_order(generated.purchase_order_id).unwrap();
        assert_eq!(order.status(), PurchaseOrderStatus::Received);
        assert_eq!(movements.len(), 1);

        let after = w.engine.inventory_record(record).unwrap();
        assert_eq!(after.quantity_on_hand(), 56);
        assert_eq!(after.quantity_in_transit(), 0);
        // (6 * 1.00 + 50 * 3.00) / 56
        assert_eq!(after.average_cost().round_dp(4), dec!(2.7857));
    }

    #[test]
    fn receiving_a_pending_order_is_rejected() {
        let w = world(false);
        let acme = supplier(&w, true, &[("BOLT", dec!(3.00))]);
        let record = stocked(&w, Some(acme), "BOLT", 6);
        let report = w.engine.generate_purchase_orders(&ReorderFilter::default()).unwrap();
        let po = report.orders[0].purchase_order_id;

        let err = w.engine.receive_purchase_order(po).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidState(_)));
        assert_eq!(w.engine.inventory_record(record).unwrap().quantity_on_hand(), 6);

        w.engine.approve_purchase_order(po, Some(UserId::new())).unwrap();
        assert_eq!(w.engine.inventory_record(record).unwrap().quantity_in_transit(), 50);
        let err = w.engine.cancel_purchase_order(po, None).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidState(_)));
    }

    #[test]
    fn inbound_stock_keeps_a_second_run_from_ordering_again() {
        let w = world(true);
        let acme = supplier(&w, true, &[("BOLT", dec!(3.00))]);
        let record = stocked(&w, Some(acme), "BOLT", 6);

        let first = w.engine.generate_purchase_orders(&ReorderFilter::default()).unwrap();
        assert_eq!(first.orders.len(), 1);

        let analysis = w.engine.analyze_reorders(&ReorderFilter::default()).unwrap();
        assert_eq!(analysis.items[0].quantity_in_transit, 50);
        assert_eq!(analysis.items[0].recommendation.recommendation, Recommendation::Ok);

        let second = w.engine.generate_purchase_orders(&ReorderFilter::default()).unwrap();
        assert!(second.orders.is_empty());
        assert!(second.errors.is_empty());
        assert_eq!(w.engine.inventory_record(record).unwrap().quantity_in_transit(), 50);
    }

    #[test]
    fn failed_demand_rate_is_reported_and_the_batch_continues() {
        let mut config = EngineConfig::default();
        config.forecast.confidence = 42;
        let w = World {
            engine: Engine::new(InMemoryEventStore::new(), InMemoryEnvelopeBus::new(), config),
            ..world(false)
        };
        let short = stocked(&w, None, "A", 8);
        stocked(&w, None, "B", 100);

        let report = w.engine.analyze_reorders(&ReorderFilter::default()).unwrap();
        assert_eq!(report.items.len(), 2);
        assert_eq!(report.issues.len(), 2);
        assert!(report.issues.iter().all(|i| i.reason.starts_with("demand rate unavailable")));

        let item = report.items.iter().find(|i| i.inventory_id == short).unwrap();
        assert_eq!(item.recommendation.daily_demand_rate, 0.0);
        assert_eq!(item.recommendation.recommendation, Recommendation::Reorder);
    }
}
