//! Entity definition fixtures and helpers.
//!
//! The fixture schema is a small order book:
//!
//! ```text
//! Orders (OrderID)            detail: Customer
//! └── Lines -> OrderLines (LineID, fk OrderID)
//!     └── Notes -> LineNotes (NoteID, fk LineID)
//! ```

use crate::server::MemoryODataServer;
use odbind_core::{DetailDefinition, EntityDefinition};
use odbind_sync::{HttpTransport, LoopbackClient, SyncConfig, SyncEngine};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

/// Base URL used by loopback engines.
pub const LOOPBACK_URL: &str = "http://odata.test";

/// Sync engine talking to a [`MemoryODataServer`] in-process.
pub type LoopbackEngine = SyncEngine<HttpTransport<LoopbackClient<Arc<MemoryODataServer>>>>;

/// Definition of a line note.
pub fn note_definition() -> EntityDefinition {
    EntityDefinition::new("LineNotes", "NoteID")
        .with_navigation_key("Notes")
        .with_foreign_key("LineID")
}

/// Definition of an order line with its notes.
pub fn line_definition() -> EntityDefinition {
    EntityDefinition::new("OrderLines", "LineID")
        .with_navigation_key("Lines")
        .with_foreign_key("OrderID")
        .with_date_keys(["ShippedAt"])
        .with_child(note_definition())
}

/// Definition of an order: declared keys, one ignored key, a customer
/// detail and lines.
pub fn order_definition() -> Arc<EntityDefinition> {
    EntityDefinition::new("Orders", "OrderID")
        .with_keys(["OrderID", "Name", "Status", "OrderDate", "Total", "Internal"])
        .with_ignored_keys(["Internal"])
        .with_date_keys(["OrderDate"])
        .with_detail(
            DetailDefinition::new("Customers")
                .with_navigation_key("Customer")
                .with_keys(["CustomerID", "Name"]),
        )
        .with_child(line_definition())
        .shared()
}

/// Server payload for order `id` with two lines; the first line has a note.
///
/// Line keys are `id * 10` and `id * 10 + 1`, the note key is `id * 100`.
pub fn sample_order(id: i64) -> JsonValue {
    json!({
        "OrderID": id,
        "Name": if id == 1 { "First".to_string() } else { format!("Order {id}") },
        "Status": "open",
        "OrderDate": "2024-05-01T10:00:00Z",
        "Total": 30,
        "Internal": "hidden",
        "Customer": {"CustomerID": 7, "Name": "Acme", "Secret": "s3cr3t"},
        "Lines": [
            {
                "LineID": id * 10,
                "Qty": 1,
                "Price": 10,
                "ShippedAt": "2024-05-02T08:00:00+02:00",
                "Notes": [{"NoteID": id * 100, "Text": "fragile"}]
            },
            {"LineID": id * 10 + 1, "Qty": 2, "Price": 10, "Notes": []}
        ]
    })
}

/// A server holding [`sample_order`] `1..=count`.
pub fn seeded_server(count: i64) -> Arc<MemoryODataServer> {
    let server = MemoryODataServer::new().with_definition(&order_definition());
    for id in 1..=count {
        if let Err(err) = server.insert("Orders", sample_order(id)) {
            panic!("seeding order {id} failed: {err}");
        }
    }
    Arc::new(server)
}

/// Engine wired to `server` through the loopback client.
pub fn loopback_engine(server: &Arc<MemoryODataServer>) -> LoopbackEngine {
    loopback_engine_with(server, SyncConfig::new(LOOPBACK_URL))
}

/// Engine wired to `server` with a custom configuration.
pub fn loopback_engine_with(server: &Arc<MemoryODataServer>, config: SyncConfig) -> LoopbackEngine {
    let transport = HttpTransport::new(
        config.service_url.clone(),
        LoopbackClient::new(Arc::clone(server)),
    );
    SyncEngine::new(config, transport)
}
