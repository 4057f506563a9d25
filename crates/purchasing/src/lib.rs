//! Purchasing domain module (event-sourced).
//!
//! Purchase orders created by automated procurement or by hand, their approval
//! lifecycle and goods receipt. Pure domain logic, no IO.

pub mod order;

pub use order::{
    Approve, Cancel, CreatePurchaseOrder, GoodsReceived, LineItem, NewLineItem, PurchaseOrder,
    PurchaseOrderApproved, PurchaseOrderCancelled, PurchaseOrderCommand, PurchaseOrderCreated,
    PurchaseOrderEvent, PurchaseOrderId, PurchaseOrderStatus, ReceiveGoods, SubmitForApproval,
    SubmittedForApproval, generate_po_number,
};
