//! Exposes the state machine to linked peers

use crate::machine::AuctionStateMachine;
use crate::record::{OP_BID, OP_CLOSE, OP_OPEN};
use bidmesh_network::{Dispatcher, RequestContext};
use serde_json::Value;
use std::sync::{Arc, Weak};

/// Register `open`, `bid` and `close` on `dispatcher`.
///
/// Handlers hold a weak reference: the machine broadcasts through the mesh,
/// which owns the dispatcher.
pub fn register_operations(dispatcher: &Dispatcher, machine: &Arc<AuctionStateMachine>) {
    for op in [OP_OPEN, OP_BID, OP_CLOSE] {
        let machine = Arc::downgrade(machine);
        dispatcher.register(op, move |ctx: RequestContext, payload: Value| {
            handle(machine.clone(), ctx, op, payload)
        });
    }
}

async fn handle(
    machine: Weak<AuctionStateMachine>,
    ctx: RequestContext,
    op: &'static str,
    payload: Value,
) -> Result<Value, String> {
    let machine = machine
        .upgrade()
        .ok_or_else(|| "node is shutting down".to_string())?;
    let outcome = machine
        .apply_remote(&ctx, op, payload)
        .await
        .map_err(|e| e.to_string())?;
    serde_json::to_value(outcome).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ValidationPolicy;
    use async_trait::async_trait;
    use bidmesh_network::{BroadcastReport, Broadcaster, Identity};
    use bidmesh_storage::MemoryStore;
    use serde_json::json;

    struct Silent;

    #[async_trait]
    impl Broadcaster for Silent {
        async fn broadcast(&self, _op: &str, _payload: Value) -> BroadcastReport {
            BroadcastReport::default()
        }
    }

    fn ctx(peer: &str) -> RequestContext {
        RequestContext {
            peer: Identity::new(peer),
            caller: Identity::new(peer),
        }
    }

    #[tokio::test]
    async fn test_registered_operations_reach_machine() {
        let dispatcher = Dispatcher::new();
        let machine = Arc::new(AuctionStateMachine::new(
            Identity::new("aa"),
            Arc::new(MemoryStore::new()),
            Arc::new(Silent),
            ValidationPolicy::Strict,
        ));
        register_operations(&dispatcher, &machine);
        assert_eq!(dispatcher.operations(), vec!["bid", "close", "open"]);

        let value = dispatcher
            .dispatch(
                ctx("bb"),
                OP_OPEN,
                json!({"item": "widget", "price": 10, "auctionerId": "bb"}),
            )
            .await
            .unwrap();
        assert_eq!(value, json!({"status": "opened"}));
        assert_eq!(machine.show("widget").unwrap().unwrap().top_price, 10.0);

        let value = dispatcher
            .dispatch(
                ctx("bb"),
                OP_BID,
                json!({"item": "widget", "price": 5, "bidderId": "bb"}),
            )
            .await
            .unwrap();
        assert_eq!(value["status"], "ignored");

        let err = dispatcher
            .dispatch(ctx("bb"), OP_CLOSE, json!({"nonsense": true}))
            .await
            .unwrap_err();
        assert!(err.contains("invalid event payload"));
    }

    #[tokio::test]
    async fn test_dropped_machine_reports_shutdown() {
        let dispatcher = Dispatcher::new();
        let machine = Arc::new(AuctionStateMachine::new(
            Identity::new("aa"),
            Arc::new(MemoryStore::new()),
            Arc::new(Silent),
            ValidationPolicy::Strict,
        ));
        register_operations(&dispatcher, &machine);
        drop(machine);

        let err = dispatcher
            .dispatch(ctx("bb"), OP_OPEN, Value::Null)
            .await
            .unwrap_err();
        assert!(err.contains("shutting down"));
    }
}
