//! Engine services.
//!
//! `Engine` owns the command dispatcher (store + bus), the configuration and
//! the collaborators, and exposes the ledger, order, allocation, fulfillment,
//! forecasting and procurement operations. The `impl` blocks are split per
//! concern across the submodules.
//!
//! Multi-stream workflows (allocation, shipment, return, transfer) are a
//! sequence of single-stream atomic appends. When a later step fails, each
//! ledger movement already applied is cancelled by one reversal movement
//! that restores its levels, in-transit stock and average cost. The
//! reversals stay in the log and point at the movement they cancel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use stockflow_core::{Aggregate, AggregateId, DomainError};
use stockflow_events::DomainSignal;
use stockflow_inventory::{InventoryId, InventoryRecord, Movement, MovementRecorded};
use stockflow_purchasing::{PurchaseOrder, PurchaseOrderId};
use stockflow_sales::{SalesOrder, SalesOrderId};

use crate::collaborators::{
    Clock, InMemoryPriceLists, InMemorySupplierDirectory, PriceListLookup, SupplierDirectory, SystemClock,
};
use crate::command_dispatcher::{CommandDispatcher, DispatchError, Dispatched};
use crate::config::EngineConfig;
use crate::event_bus::EnvelopeBus;
use crate::event_store::EventStore;
use crate::notifications::{SignalDispatcher, TracingNotificationSink};

mod allocation;
mod forecasting;
mod fulfillment;
mod ledger;
mod orders;
mod procurement;

pub use allocation::{AllocateOptions, AllocationLine, AllocationResult};
pub use forecasting::ProductForecast;
pub use fulfillment::{PickGroup, PickGrouping, PickLine, PickList, ReturnLineOutcome, ReturnOutcome, ShipmentOutcome};
pub use ledger::{LedgerRecordSpec, MovementFilter, MovementHistory, MovementRequest, ReplayReport, TransferOutcome};
pub use orders::NewOrder;
pub use procurement::{
    GeneratedPurchaseOrder, ProcurementIssue, ProcurementReport, ReorderFilter, ReorderItem, ReorderReport,
    ReorderSummary,
};

pub const INVENTORY_AGGREGATE: &str = "inventory.record";
pub const SALES_ORDER_AGGREGATE: &str = "sales.order";
pub const PURCHASE_ORDER_AGGREGATE: &str = "purchasing.order";

pub(crate) fn inventory_record(id: AggregateId) -> InventoryRecord {
    InventoryRecord::empty(InventoryId(id))
}

pub(crate) fn sales_order(id: AggregateId) -> SalesOrder {
    SalesOrder::empty(SalesOrderId(id))
}

pub(crate) fn purchase_order(id: AggregateId) -> PurchaseOrder {
    PurchaseOrder::empty(PurchaseOrderId(id))
}

/// Inventory ledger, allocation and reorder engine.
pub struct Engine<S, B> {
    dispatcher: CommandDispatcher<S, B>,
    config: EngineConfig,
    signals: SignalDispatcher,
    price_lists: Arc<dyn PriceListLookup>,
    suppliers: Arc<dyn SupplierDirectory>,
    clock: Arc<dyn Clock>,
}

impl<S, B> core::fmt::Debug for Engine<S, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("signals", &self.signals)
            .finish_non_exhaustive()
    }
}

impl<S, B> Engine<S, B> {
    /// Engine with empty in-memory collaborators, the system clock and
    /// notifications written to the log.
    pub fn new(store: S, bus: B, config: EngineConfig) -> Self {
        let dispatcher = CommandDispatcher::new(store, bus).with_max_retries(config.dispatch.max_retries);
        Self {
            dispatcher,
            config,
            signals: SignalDispatcher::new().with_sink(Arc::new(TracingNotificationSink)),
            price_lists: Arc::new(InMemoryPriceLists::new()),
            suppliers: Arc::new(InMemorySupplierDirectory::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_price_lists(mut self, price_lists: Arc<dyn PriceListLookup>) -> Self {
        self.price_lists = price_lists;
        self
    }

    pub fn with_suppliers(mut self, suppliers: Arc<dyn SupplierDirectory>) -> Self {
        self.suppliers = suppliers;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_signals(mut self, signals: SignalDispatcher) -> Self {
        self.signals = signals;
        self
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<S, B> {
        &self.dispatcher
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn emit(&self, signal: DomainSignal) {
        self.signals.emit(&signal);
    }
}

impl<S, B> Engine<S, B>
where
    S: EventStore,
    B: EnvelopeBus,
{
    /// Decide a command, apply the ledger movements it implies, then commit it.
    ///
    /// `plan` turns the decided events into movements. If a movement fails,
    /// or the aggregate stream moved before the commit, each applied movement
    /// is reversed exactly; a moved stream is retried from a fresh decision.
    /// A reversal that fails is returned as [`DispatchError::Compensation`].
    pub(crate) fn run_with_movements<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        make_aggregate: impl Fn(AggregateId) -> A,
        command: &A::Command,
        plan: impl Fn(&A, &[A::Event]) -> Vec<MovementRequest>,
    ) -> Result<(Dispatched<A>, Vec<Movement>), DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: stockflow_events::Event + Serialize + DeserializeOwned,
    {
        let mut attempt = 0u32;
        loop {
            let decision = self.dispatcher.decide(aggregate_id, &make_aggregate, command)?;
            let requests = plan(&decision.state, &decision.events);

            let mut applied: Vec<MovementRecorded> = Vec::with_capacity(requests.len());
            for request in requests {
                match self.apply_movement(request) {
                    Ok((_, recorded)) => applied.push(recorded),
                    Err(err) => return Err(self.rolled_back(err, &applied)),
                }
            }

            match self.dispatcher.commit(aggregate_id, aggregate_type, decision) {
                Ok(out) => return Ok((out, applied.into_iter().map(|r| r.movement).collect())),
                // Appended but not published: the movements belong to a committed change.
                Err(err @ DispatchError::Publish(_)) => return Err(err),
                Err(DispatchError::ConcurrencyConflict(msg)) if attempt < self.dispatcher.max_retries() => {
                    if let Err(compensation) = self.undo(&applied) {
                        return Err(DispatchError::Compensation {
                            cause: Box::new(DispatchError::ConcurrencyConflict(msg)),
                            compensation: Box::new(compensation),
                        });
                    }
                    attempt += 1;
                    warn!(%aggregate_id, aggregate_type, attempt, reason = %msg, "workflow commit conflict, retrying");
                }
                Err(err) => return Err(self.rolled_back(err, &applied)),
            }
        }
    }
}
