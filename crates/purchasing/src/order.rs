use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockflow_core::{Aggregate, AggregateId, AggregateRoot, DomainError, ProductId, SupplierId, UserId};
use stockflow_events::Event;
use stockflow_inventory::InventoryId;

/// Purchase order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PurchaseOrderId(pub AggregateId);

impl PurchaseOrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for PurchaseOrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Human-facing purchase order number: `PO-<yyyymmdd>-<8 hex>`.
pub fn generate_po_number(at: DateTime<Utc>) -> String {
    let simple = Uuid::now_v7().simple().to_string();
    // The tail of a v7 uuid is random; the head is the timestamp.
    let suffix = &simple[simple.len() - 8..];
    format!("PO-{}-{}", at.format("%Y%m%d"), suffix.to_uppercase())
}

/// Purchase order status lifecycle.
///
/// `draft → pending_approval → approved → received`, with `cancelled` reachable
/// from draft and pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseOrderStatus {
    Draft,
    PendingApproval,
    Approved,
    Received,
    Cancelled,
}

/// Purchase order line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub line_no: u32,
    pub product_id: ProductId,
    pub sku: String,
    /// Inventory record the goods are received into.
    pub inventory_id: InventoryId,
    pub quantity: i64,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

/// Line requested when creating an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLineItem {
    pub product_id: ProductId,
    pub sku: String,
    pub inventory_id: InventoryId,
    pub quantity: i64,
    pub unit_price: Decimal,
}

/// Aggregate root: PurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOrder {
    id: PurchaseOrderId,
    po_number: String,
    supplier_id: Option<SupplierId>,
    price_list_id: Option<String>,
    status: PurchaseOrderStatus,
    lines: Vec<LineItem>,
    expected_delivery: Option<DateTime<Utc>>,
    approved_by: Option<UserId>,
    version: u64,
    created: bool,
}

impl PurchaseOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: PurchaseOrderId) -> Self {
        Self {
            id,
            po_number: String::new(),
            supplier_id: None,
            price_list_id: None,
            status: PurchaseOrderStatus::Draft,
            lines: Vec::new(),
            expected_delivery: None,
            approved_by: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PurchaseOrderId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn po_number(&self) -> &str {
        &self.po_number
    }

    pub fn supplier_id(&self) -> Option<SupplierId> {
        self.supplier_id
    }

    pub fn price_list_id(&self) -> Option<&str> {
        self.price_list_id.as_deref()
    }

    pub fn status(&self) -> PurchaseOrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[LineItem] {
        &self.lines
    }

    pub fn expected_delivery(&self) -> Option<DateTime<Utc>> {
        self.expected_delivery
    }

    pub fn approved_by(&self) -> Option<UserId> {
        self.approved_by
    }

    pub fn total_amount(&self) -> Decimal {
        self.lines.iter().map(|l| l.line_total).sum()
    }
}

impl AggregateRoot for PurchaseOrder {
    type Id = PurchaseOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreatePurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePurchaseOrder {
    pub order_id: PurchaseOrderId,
    pub po_number: String,
    pub supplier_id: SupplierId,
    pub price_list_id: Option<String>,
    pub lines: Vec<NewLineItem>,
    pub expected_delivery: Option<DateTime<Utc>>,
    /// Submit for approval right away (draft otherwise).
    pub submit: bool,
    /// Submit and approve in the same commit.
    pub auto_approve: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SubmitForApproval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitForApproval {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Approve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approve {
    pub order_id: PurchaseOrderId,
    pub approved_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReceiveGoods (every line received in full).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveGoods {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancel {
    pub order_id: PurchaseOrderId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderCommand {
    CreatePurchaseOrder(CreatePurchaseOrder),
    SubmitForApproval(SubmitForApproval),
    Approve(Approve),
    ReceiveGoods(ReceiveGoods),
    Cancel(Cancel),
}

/// Event: PurchaseOrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderCreated {
    pub order_id: PurchaseOrderId,
    pub po_number: String,
    pub supplier_id: SupplierId,
    pub price_list_id: Option<String>,
    pub lines: Vec<LineItem>,
    pub expected_delivery: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SubmittedForApproval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedForApproval {
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderApproved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderApproved {
    pub order_id: PurchaseOrderId,
    pub approved_by: Option<UserId>,
    pub automatic: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: GoodsReceived.
///
/// Carries the lines so the ledger service can record one purchase movement
/// per line at its unit price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodsReceived {
    pub order_id: PurchaseOrderId,
    pub supplier_id: SupplierId,
    pub lines: Vec<LineItem>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderCancelled {
    pub order_id: PurchaseOrderId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderEvent {
    PurchaseOrderCreated(PurchaseOrderCreated),
    SubmittedForApproval(SubmittedForApproval),
    PurchaseOrderApproved(PurchaseOrderApproved),
    GoodsReceived(GoodsReceived),
    PurchaseOrderCancelled(PurchaseOrderCancelled),
}

impl Event for PurchaseOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(_) => "purchasing.order.created",
            PurchaseOrderEvent::SubmittedForApproval(_) => "purchasing.order.submitted",
            PurchaseOrderEvent::PurchaseOrderApproved(_) => "purchasing.order.approved",
            PurchaseOrderEvent::GoodsReceived(_) => "purchasing.order.goods_received",
            PurchaseOrderEvent::PurchaseOrderCancelled(_) => "purchasing.order.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => e.occurred_at,
            PurchaseOrderEvent::SubmittedForApproval(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderApproved(e) => e.occurred_at,
            PurchaseOrderEvent::GoodsReceived(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PurchaseOrder {
    type Command = PurchaseOrderCommand;
    type Event = PurchaseOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => {
                self.id = e.order_id;
                self.po_number = e.po_number.clone();
                self.supplier_id = Some(e.supplier_id);
                self.price_list_id = e.price_list_id.clone();
                self.lines = e.lines.clone();
                self.expected_delivery = e.expected_delivery;
                self.status = PurchaseOrderStatus::Draft;
                self.created = true;
            }
            PurchaseOrderEvent::SubmittedForApproval(_) => {
                self.status = PurchaseOrderStatus::PendingApproval;
            }
            PurchaseOrderEvent::PurchaseOrderApproved(e) => {
                self.status = PurchaseOrderStatus::Approved;
                self.approved_by = e.approved_by;
            }
            PurchaseOrderEvent::GoodsReceived(_) => {
                self.status = PurchaseOrderStatus::Received;
            }
            PurchaseOrderEvent::PurchaseOrderCancelled(_) => {
                self.status = PurchaseOrderStatus::Cancelled;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PurchaseOrderCommand::CreatePurchaseOrder(cmd) => self.handle_create(cmd),
            PurchaseOrderCommand::SubmitForApproval(cmd) => self.handle_submit(cmd),
            PurchaseOrderCommand::Approve(cmd) => self.handle_approve(cmd),
            PurchaseOrderCommand::ReceiveGoods(cmd) => self.handle_receive(cmd),
            PurchaseOrderCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl PurchaseOrder {
    fn ensure_order_id(&self, order_id: PurchaseOrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn ensure_created(&self, order_id: PurchaseOrderId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("purchase order {order_id}")));
        }
        self.ensure_order_id(order_id)
    }

    fn handle_create(&self, cmd: &CreatePurchaseOrder) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("purchase order already exists"));
        }
        self.ensure_order_id(cmd.order_id)?;

        if cmd.po_number.trim().is_empty() {
            return Err(DomainError::validation("po_number cannot be empty"));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("purchase order must have at least one line"));
        }

        let mut lines = Vec::with_capacity(cmd.lines.len());
        for (idx, line) in cmd.lines.iter().enumerate() {
            if line.quantity <= 0 {
                return Err(DomainError::validation(format!("{}: quantity must be positive", line.sku)));
            }
            if line.unit_price.is_sign_negative() {
                return Err(DomainError::validation(format!("{}: unit_price cannot be negative", line.sku)));
            }
            lines.push(LineItem {
                line_no: idx as u32 + 1,
                product_id: line.product_id,
                sku: line.sku.clone(),
                inventory_id: line.inventory_id,
                quantity: line.quantity,
                unit_price: line.unit_price,
                line_total: line.unit_price * Decimal::from(line.quantity),
            });
        }

        let mut events = vec![PurchaseOrderEvent::PurchaseOrderCreated(PurchaseOrderCreated {
            order_id: cmd.order_id,
            po_number: cmd.po_number.clone(),
            supplier_id: cmd.supplier_id,
            price_list_id: cmd.price_list_id.clone(),
            lines,
            expected_delivery: cmd.expected_delivery,
            occurred_at: cmd.occurred_at,
        })];

        if cmd.submit || cmd.auto_approve {
            events.push(PurchaseOrderEvent::SubmittedForApproval(SubmittedForApproval {
                order_id: cmd.order_id,
                occurred_at: cmd.occurred_at,
            }));
        }
        if cmd.auto_approve {
            events.push(PurchaseOrderEvent::PurchaseOrderApproved(PurchaseOrderApproved {
                order_id: cmd.order_id,
                approved_by: None,
                automatic: true,
                occurred_at: cmd.occurred_at,
            }));
        }

        Ok(events)
    }

    fn handle_submit(&self, cmd: &SubmitForApproval) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_created(cmd.order_id)?;

        if self.status != PurchaseOrderStatus::Draft {
            return Err(DomainError::invalid_state("only draft purchase orders can be submitted"));
        }

        Ok(vec![PurchaseOrderEvent::SubmittedForApproval(SubmittedForApproval {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_approve(&self, cmd: &Approve) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_created(cmd.order_id)?;

        if self.status != PurchaseOrderStatus::PendingApproval {
            return Err(DomainError::invalid_state(
                "only purchase orders pending approval can be approved",
            ));
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrderApproved(PurchaseOrderApproved {
            order_id: cmd.order_id,
            approved_by: cmd.approved_by,
            automatic: false,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_receive(&self, cmd: &ReceiveGoods) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_created(cmd.order_id)?;

        if self.status != PurchaseOrderStatus::Approved {
            return Err(DomainError::invalid_state(
                "cannot receive goods for a purchase order that is not approved",
            ));
        }

        let supplier_id = self
            .supplier_id
            .ok_or_else(|| DomainError::invariant("purchase order without supplier"))?;

        Ok(vec![PurchaseOrderEvent::GoodsReceived(GoodsReceived {
            order_id: cmd.order_id,
            supplier_id,
            lines: self.lines.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &Cancel) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        self.ensure_created(cmd.order_id)?;

        if !matches!(
            self.status,
            PurchaseOrderStatus::Draft | PurchaseOrderStatus::PendingApproval
        ) {
            return Err(DomainError::invalid_state(
                "only draft or pending purchase orders can be cancelled",
            ));
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrderCancelled(PurchaseOrderCancelled {
            order_id: cmd.order_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use stockflow_events::execute;

    use super::*;

    fn test_order_id() -> PurchaseOrderId {
        PurchaseOrderId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn create_cmd(order_id: PurchaseOrderId, submit: bool, auto_approve: bool) -> PurchaseOrderCommand {
        PurchaseOrderCommand::CreatePurchaseOrder(CreatePurchaseOrder {
            order_id,
            po_number: generate_po_number(test_time()),
            supplier_id: SupplierId::new(),
            price_list_id: Some("PL-2024".to_string()),
            lines: vec![
                NewLineItem {
                    product_id: ProductId::new(),
                    sku: "BOLT-10".to_string(),
                    inventory_id: InventoryId::new(AggregateId::new()),
                    quantity: 40,
                    unit_price: dec!(0.25),
                },
                NewLineItem {
                    product_id: ProductId::new(),
                    sku: "NUT-10".to_string(),
                    inventory_id: InventoryId::new(AggregateId::new()),
                    quantity: 3,
                    unit_price: dec!(1.10),
                },
            ],
            expected_delivery: None,
            submit,
            auto_approve,
            occurred_at: test_time(),
        })
    }

    #[test]
    fn po_number_has_date_and_suffix() {
        let at = DateTime::parse_from_rfc3339("2024-03-05T10:00:00Z").unwrap().with_timezone(&Utc);
        let number = generate_po_number(at);
        assert!(number.starts_with("PO-20240305-"));
        assert_eq!(number.len(), "PO-20240305-".len() + 8);
        assert_ne!(number, generate_po_number(at));
    }

    #[test]
    fn create_computes_line_totals() {
        let order_id = test_order_id();
        let mut order = PurchaseOrder::empty(order_id);
        execute(&mut order, &create_cmd(order_id, true, false)).unwrap();

        assert_eq!(order.status(), PurchaseOrderStatus::PendingApproval);
        assert_eq!(order.lines()[0].line_total, dec!(10.00));
        assert_eq!(order.lines()[1].line_total, dec!(3.30));
        assert_eq!(order.total_amount(), dec!(13.30));
    }

    #[test]
    fn auto_approve_emits_all_transitions_in_one_decision() {
        let order_id = test_order_id();
        let mut order = PurchaseOrder::empty(order_id);
        let events = execute(&mut order, &create_cmd(order_id, false, true)).unwrap();

        assert_eq!(events.len(), 3);
        assert_eq!(order.status(), PurchaseOrderStatus::Approved);
        assert_eq!(order.version(), 3);
    }

    #[test]
    fn approving_a_draft_is_invalid_state() {
        let order_id = test_order_id();
        let mut order = PurchaseOrder::empty(order_id);
        execute(&mut order, &create_cmd(order_id, false, false)).unwrap();

        let err = order
            .handle(&PurchaseOrderCommand::Approve(Approve {
                order_id,
                approved_by: Some(UserId::new()),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        match err {
            DomainError::InvalidState(msg) if msg.contains("pending approval") => {}
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[test]
    fn receive_requires_approval_and_carries_lines() {
        let order_id = test_order_id();
        let mut order = PurchaseOrder::empty(order_id);
        execute(&mut order, &create_cmd(order_id, true, false)).unwrap();

        let receive = PurchaseOrderCommand::ReceiveGoods(ReceiveGoods {
            order_id,
            occurred_at: test_time(),
        });
        assert!(matches!(order.handle(&receive), Err(DomainError::InvalidState(_))));

        execute(
            &mut order,
            &PurchaseOrderCommand::Approve(Approve {
                order_id,
                approved_by: None,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        let events = execute(&mut order, &receive).unwrap();

        match &events[0] {
            PurchaseOrderEvent::GoodsReceived(e) => assert_eq!(e.lines.len(), 2),
            _ => panic!("Expected GoodsReceived event"),
        }
        assert_eq!(order.status(), PurchaseOrderStatus::Received);
    }

    #[test]
    fn approved_orders_cannot_be_cancelled() {
        let order_id = test_order_id();
        let mut order = PurchaseOrder::empty(order_id);
        execute(&mut order, &create_cmd(order_id, false, true)).unwrap();

        let err = order
            .handle(&PurchaseOrderCommand::Cancel(Cancel {
                order_id,
                reason: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }
}
